use crate::error::Rejection;
use crate::job::{JobKey, JobState};
use crate::partition::command::{Accepted, CommandResult};
use crate::partition::incident::IncidentErrorType;
use crate::partition::log::{Intent, ProcessEvent, RecordValue};
use crate::partition::processor::{state_rejection, JobProcessors};

impl JobProcessors {
    /// Business error raised by a worker.
    ///
    /// A catch event found up the scope chain consumes the job; otherwise the job is parked
    /// as failed with zero retries behind an `UnhandledErrorEvent` incident.
    pub(crate) fn throw_error(
        &mut self,
        key: JobKey,
        error_code: String,
        error_message: String,
    ) -> CommandResult {
        match self.jobs.state(key) {
            JobState::Activatable | JobState::Activated => {}
            state => {
                return self.reject(
                    key,
                    Intent::JobThrowError,
                    state_rejection("throw an error for", key, state),
                )
            }
        }

        let Some(element_instance_key) = self.jobs.get(key).map(|job| job.element_instance_key)
        else {
            return self.reject(
                key,
                Intent::JobThrowError,
                state_rejection("throw an error for", key, JobState::NotFound),
            );
        };
        if !self.model.is_element_active(element_instance_key) {
            return self.reject(
                key,
                Intent::JobThrowError,
                Rejection::invalid_state(format!(
                    "Expected to throw an error for job with key '{key}', but the element instance '{element_instance_key}' is not active"
                )),
            );
        }

        let catch_event = self.model.find_catch_event(element_instance_key, &error_code);
        match catch_event {
            Some(catch_event) => {
                let Some(mut job) = self.jobs.delete(key) else {
                    return self.reject(
                        key,
                        Intent::JobThrowError,
                        state_rejection("throw an error for", key, JobState::NotFound),
                    );
                };
                job.error_code = error_code.clone();
                job.error_message = error_message.clone();
                job.worker.clear();
                job.deadline = None;
                self.log
                    .append_event(key, Intent::JobErrorThrown, RecordValue::Job(job.clone()));

                let event_key = self.keys.next_key();
                self.log.append_event(
                    event_key,
                    Intent::ProcessEventTriggering,
                    RecordValue::ProcessEvent(ProcessEvent {
                        scope_key: catch_event.scope_key,
                        catch_event_id: catch_event.catch_event_id.clone(),
                        job_key: key,
                        error_code,
                        error_message,
                    }),
                );

                tracing::debug!(
                    partition_id = self.partition_id,
                    job_key = key,
                    catch_event_id = %catch_event.catch_event_id,
                    "Thrown error was caught"
                );
                Ok(Accepted::Job(job))
            }
            None => {
                self.jobs.throw_error(key, &error_code, &error_message);
                let Some(job) = self.jobs.get(key).cloned() else {
                    return self.reject(
                        key,
                        Intent::JobThrowError,
                        state_rejection("throw an error for", key, JobState::NotFound),
                    );
                };
                self.log
                    .append_event(key, Intent::JobErrorThrown, RecordValue::Job(job.clone()));

                let message = if error_message.is_empty() {
                    format!(
                        "Expected to throw an error event with the code '{error_code}', but it was not caught. No error events are available in the scope."
                    )
                } else {
                    format!(
                        "Expected to throw an error event with the code '{error_code}' with message '{error_message}', but it was not caught. No error events are available in the scope."
                    )
                };
                self.raise_incident(&job, IncidentErrorType::UnhandledErrorEvent, message);
                Ok(Accepted::Job(job))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::error::RejectionType;
    use crate::job::NewJob;
    use crate::partition::collaborators::{InMemoryProcessModel, InMemoryVariables};
    use crate::partition::command::JobCommand;

    fn setup() -> (JobProcessors, Arc<InMemoryProcessModel>, JobKey) {
        let model = Arc::new(InMemoryProcessModel::new());
        model.add_element(10, None);
        model.add_element(11, Some(10));
        let mut p = JobProcessors::new(
            1,
            crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            Arc::new(InMemoryVariables::new()),
            model.clone(),
        );
        let key = match p.process(
            JobCommand::Create(NewJob::new("payment", 3).with_element_instance(1, 11)),
            Utc::now(),
        ) {
            Ok(Accepted::Job(job)) => job.key,
            other => panic!("unexpected create result: {other:?}"),
        };
        (p, model, key)
    }

    fn throw(p: &mut JobProcessors, key: JobKey, code: &str) -> CommandResult {
        p.process(
            JobCommand::ThrowError {
                key,
                error_code: code.to_string(),
                error_message: "card declined".to_string(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn caught_error_removes_job_without_incident() {
        let (mut p, model, key) = setup();
        model.add_catch_event(10, "DECLINED", "handle-declined");

        throw(&mut p, key, "DECLINED").unwrap();

        assert_eq!(p.jobs().state(key), JobState::NotFound);
        assert!(p.incidents().is_empty());
        let triggered = p.log().with_intent(Intent::ProcessEventTriggering);
        assert_eq!(triggered.len(), 1);
        match &triggered[0].value {
            Some(RecordValue::ProcessEvent(event)) => {
                assert_eq!(event.scope_key, 10);
                assert_eq!(event.catch_event_id, "handle-declined");
            }
            other => panic!("unexpected record value: {other:?}"),
        }
    }

    #[test]
    fn uncaught_error_fails_job_with_incident() {
        let (mut p, _model, key) = setup();

        throw(&mut p, key, "DECLINED").unwrap();

        assert_eq!(p.jobs().state(key), JobState::Failed);
        let job = p.jobs().get(key).unwrap();
        assert_eq!(job.retries, 0);
        assert_eq!(job.error_code, "DECLINED");

        let incidents = p.incidents().all();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].error_type, IncidentErrorType::UnhandledErrorEvent);
        assert!(incidents[0].error_message.contains("'DECLINED'"));
    }

    #[test]
    fn rejected_when_element_is_not_active() {
        let (mut p, model, key) = setup();
        model.terminate_element(11);

        let rejection = throw(&mut p, key, "DECLINED").unwrap_err();
        assert_eq!(rejection.kind, RejectionType::InvalidState);
        assert_eq!(p.jobs().state(key), JobState::Activatable);
    }

    #[test]
    fn rejected_for_failed_or_missing_job() {
        let (mut p, _model, key) = setup();
        throw(&mut p, key, "DECLINED").unwrap();

        let rejection = throw(&mut p, key, "DECLINED").unwrap_err();
        assert_eq!(rejection.kind, RejectionType::InvalidState);

        let rejection = throw(&mut p, key + 100, "DECLINED").unwrap_err();
        assert_eq!(rejection.kind, RejectionType::NotFound);
    }
}
