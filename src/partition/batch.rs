//! Batch activation.
//!
//! Activation runs in two passes over a snapshot: selection reads the store and builds the
//! batch without mutating anything, commit then writes one ACTIVATED event per selected job,
//! applies the transitions, and writes the aggregate batch event.

use chrono::{DateTime, Utc};

use crate::error::Rejection;
use crate::job::{Job, JobBatch, JobBatchRequest, JobKey};
use crate::partition::command::{Accepted, CommandResult};
use crate::partition::incident::IncidentErrorType;
use crate::partition::log::{Intent, RecordValue};
use crate::partition::processor::JobProcessors;

/// Outcome of the read-only selection pass.
struct Selection {
    jobs: Vec<Job>,
    truncated: bool,
    /// First candidate that would not fit even into an empty batch.
    oversized: Option<JobKey>,
}

/// Shape checks for an activation, in the order callers see them reported.
pub(crate) fn validate(request: &JobBatchRequest) -> Option<Rejection> {
    if request.max_jobs_to_activate < 1 {
        return Some(Rejection::invalid_argument(format!(
            "Expected to activate job batch with max jobs to activate to be greater than zero, but it was '{}'",
            request.max_jobs_to_activate
        )));
    }
    if request.timeout < 1 {
        return Some(Rejection::invalid_argument(format!(
            "Expected to activate job batch with timeout to be greater than zero, but it was '{}'",
            request.timeout
        )));
    }
    if request.job_type.is_empty() {
        return Some(Rejection::invalid_argument(
            "Expected to activate job batch with type to be present, but it was blank",
        ));
    }
    if request.worker.is_empty() {
        return Some(Rejection::invalid_argument(
            "Expected to activate job batch with worker to be present, but it was blank",
        ));
    }
    None
}

impl JobProcessors {
    pub(crate) fn activate_batch(
        &mut self,
        request: JobBatchRequest,
        now: DateTime<Utc>,
    ) -> CommandResult {
        if let Some(rejection) = validate(&request) {
            return self.reject(-1, Intent::JobBatchActivate, rejection);
        }

        let selection = self.select(&request, now);
        Ok(Accepted::Batch(self.commit(request, selection)))
    }

    fn select(&self, request: &JobBatchRequest, now: DateTime<Utc>) -> Selection {
        let deadline = now.timestamp_millis().saturating_add(request.timeout);
        let max_jobs = usize::try_from(request.max_jobs_to_activate).unwrap_or(0);
        let max_size = self.max_message_size;
        let variables = &self.variables;

        let mut size = JobBatch::empty(request).serialized_size();
        let mut selection = Selection {
            jobs: Vec::new(),
            truncated: false,
            oversized: None,
        };

        self.jobs
            .for_each_activatable(&request.job_type, |key, stored| {
                let mut job = stored.clone();
                job.worker = request.worker.clone();
                job.deadline = Some(deadline);
                job.variables = if request.variables.is_empty() {
                    variables.document(job.element_instance_key)
                } else {
                    variables.document_with(job.element_instance_key, &request.variables)
                };

                // one comma between jobs in the serialized array
                let separator = usize::from(!selection.jobs.is_empty());
                let job_size = job.encoded_len().saturating_add(separator);
                if size.saturating_add(job_size) > max_size {
                    selection.truncated = true;
                    if selection.jobs.is_empty() {
                        selection.oversized = Some(key);
                    }
                    return false;
                }

                size += job_size;
                selection.jobs.push(job);
                selection.jobs.len() < max_jobs
            });

        selection
    }

    fn commit(&mut self, request: JobBatchRequest, selection: Selection) -> JobBatch {
        for job in &selection.jobs {
            self.log
                .append_event(job.key, Intent::JobActivated, RecordValue::Job(job.clone()));
            self.jobs.activate(job.key, job);
        }

        if let Some(key) = selection.oversized {
            self.fail_oversized(key);
        }

        let mut batch = JobBatch::empty(&request);
        batch.truncated = selection.truncated;
        batch.jobs = selection.jobs;

        let batch_key = self.keys.next_key();
        self.log.append_event(
            batch_key,
            Intent::JobBatchActivated,
            RecordValue::JobBatch(batch.clone()),
        );

        tracing::debug!(
            partition_id = self.partition_id,
            job_type = %batch.job_type,
            worker = %batch.worker,
            activated = batch.jobs.len(),
            truncated = batch.truncated,
            "Activated job batch"
        );
        batch
    }

    /// A job that cannot fit in any batch leaves the activatable set through an incident.
    fn fail_oversized(&mut self, key: JobKey) {
        let message = format!(
            "The job with key '{key}' can not be activated, because with its variables it is larger than the configured message size of {} bytes",
            self.max_message_size
        );
        self.jobs.fail(key, 0, &message);
        let Some(job) = self.jobs.get(key).cloned() else {
            return;
        };

        tracing::warn!(partition_id = self.partition_id, job_key = key, "Job exceeds max message size");
        self.log
            .append_event(key, Intent::JobFailed, RecordValue::Job(job.clone()));
        self.raise_incident(&job, IncidentErrorType::MessageSizeExceeded, message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::RejectionType;
    use crate::job::{JobState, NewJob};
    use crate::partition::collaborators::{InMemoryProcessModel, InMemoryVariables};
    use crate::partition::command::JobCommand;
    use serde_json::json;

    fn processors(max_message_size: usize, variables: Arc<InMemoryVariables>) -> JobProcessors {
        JobProcessors::new(
            1,
            max_message_size,
            variables,
            Arc::new(InMemoryProcessModel::new()),
        )
    }

    fn request(job_type: &str, max_jobs: i32) -> JobBatchRequest {
        JobBatchRequest {
            job_type: job_type.to_string(),
            worker: "w1".to_string(),
            max_jobs_to_activate: max_jobs,
            timeout: 30_000,
            variables: vec![],
        }
    }

    fn create(p: &mut JobProcessors, job_type: &str, scope: i64) -> JobKey {
        let command = JobCommand::Create(NewJob::new(job_type, 3).with_element_instance(1, scope));
        match p.process(command, Utc::now()) {
            Ok(Accepted::Job(job)) => job.key,
            other => panic!("unexpected create result: {other:?}"),
        }
    }

    fn activate(p: &mut JobProcessors, request: JobBatchRequest) -> JobBatch {
        match p.process(JobCommand::ActivateBatch(request), Utc::now()) {
            Ok(Accepted::Batch(batch)) => batch,
            other => panic!("unexpected activate result: {other:?}"),
        }
    }

    #[test]
    fn validation_order_is_max_jobs_timeout_type_worker() {
        let mut req = request("", 0);
        req.timeout = 0;
        req.worker.clear();
        assert!(validate(&req).unwrap().reason.contains("max jobs to activate"));

        req.max_jobs_to_activate = 1;
        assert!(validate(&req).unwrap().reason.contains("timeout"));

        req.timeout = 1;
        assert!(validate(&req).unwrap().reason.contains("type"));

        req.job_type = "email".to_string();
        assert!(validate(&req).unwrap().reason.contains("worker"));

        req.worker = "w1".to_string();
        assert!(validate(&req).is_none());
    }

    #[test]
    fn invalid_batch_writes_single_rejection() {
        let mut p = processors(4096, Arc::new(InMemoryVariables::new()));
        create(&mut p, "email", 10);

        let rejection = p
            .process(JobCommand::ActivateBatch(request("email", 0)), Utc::now())
            .unwrap_err();
        assert_eq!(rejection.kind, RejectionType::InvalidArgument);
        assert_eq!(p.log().with_intent(Intent::JobBatchActivate).len(), 1);
        assert!(p.log().with_intent(Intent::JobActivated).is_empty());
    }

    #[test]
    fn activates_in_key_order_up_to_max_jobs() {
        let mut p = processors(4096, Arc::new(InMemoryVariables::new()));
        let keys: Vec<_> = (0..3).map(|i| create(&mut p, "email", i)).collect();

        let batch = activate(&mut p, request("email", 2));
        assert_eq!(batch.job_keys(), keys[..2].to_vec());
        assert!(!batch.truncated);
        assert!(batch.jobs.iter().all(|job| job.worker == "w1" && job.deadline.is_some()));
        assert_eq!(p.jobs().state(keys[0]), JobState::Activated);
        assert_eq!(p.jobs().state(keys[2]), JobState::Activatable);

        let batch = activate(&mut p, request("email", 5));
        assert_eq!(batch.job_keys(), vec![keys[2]]);
    }

    #[test]
    fn activated_jobs_are_never_selected_twice() {
        let mut p = processors(4096, Arc::new(InMemoryVariables::new()));
        create(&mut p, "email", 1);

        assert_eq!(activate(&mut p, request("email", 5)).jobs.len(), 1);
        assert!(activate(&mut p, request("email", 5)).jobs.is_empty());
    }

    #[test]
    fn batch_is_truncated_at_size_ceiling() {
        let variables = Arc::new(InMemoryVariables::new());
        let payload = "x".repeat(300);
        for scope in 0..4 {
            variables.set(scope, "payload", json!(payload));
        }

        let mut probe = processors(usize::MAX, variables.clone());
        create(&mut probe, "email", 0);
        let single = activate(&mut probe, request("email", 1));
        // room for two jobs but not three
        let ceiling = single.serialized_size() + 2 * single.jobs[0].encoded_len();

        let mut p = processors(ceiling, variables);
        for scope in 0..4 {
            create(&mut p, "email", scope);
        }

        let batch = activate(&mut p, request("email", 10));
        assert_eq!(batch.jobs.len(), 2);
        assert!(batch.truncated);
        assert!(batch.serialized_size() <= ceiling);

        let batch = activate(&mut p, request("email", 10));
        assert_eq!(batch.jobs.len(), 2);
        assert!(batch.truncated);

        let batch = activate(&mut p, request("email", 10));
        assert!(batch.jobs.is_empty());
        assert!(!batch.truncated);
    }

    #[test]
    fn explicit_variable_names_restrict_document() {
        let variables = Arc::new(InMemoryVariables::new());
        variables.set(7, "a", json!(1));
        variables.set(7, "b", json!(2));
        let mut p = processors(4096, variables);
        create(&mut p, "email", 7);

        let mut req = request("email", 1);
        req.variables = vec!["b".to_string()];
        let batch = activate(&mut p, req);

        let doc: serde_json::Value = serde_json::from_slice(&batch.jobs[0].variables).unwrap();
        assert_eq!(doc, json!({"b": 2}));
    }

    #[test]
    fn oversized_job_is_failed_with_incident() {
        let variables = Arc::new(InMemoryVariables::new());
        variables.set(1, "payload", json!("y".repeat(1_000)));
        let mut p = processors(512, variables);
        let key = create(&mut p, "email", 1);

        let batch = activate(&mut p, request("email", 1));
        assert!(batch.jobs.is_empty());
        assert!(batch.truncated);
        assert_eq!(p.jobs().state(key), JobState::Failed);

        let incidents = p.incidents().all();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].error_type, IncidentErrorType::MessageSizeExceeded);

        let batch = activate(&mut p, request("email", 1));
        assert!(!batch.truncated);
    }
}
