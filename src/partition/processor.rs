use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::availability::JobAvailabilityBus;
use crate::error::Rejection;
use crate::job::{Job, JobKey, JobState, JobStore, KeyGenerator, NewJob};
use crate::partition::collaborators::{ProcessModel, VariableStore};
use crate::partition::command::{Accepted, CommandResult, JobCommand};
use crate::partition::incident::{Incident, IncidentErrorType, IncidentState};
use crate::partition::log::{Intent, RecordLog, RecordValue};

const NO_RETRIES_LEFT: &str = "No more retries left.";

/// Job lifecycle state machine of one partition.
///
/// Commands are applied one at a time; every call to [`JobProcessors::process`] leaves
/// its events or its rejection in the record log before returning.
pub struct JobProcessors {
    pub(crate) partition_id: u32,
    pub(crate) keys: KeyGenerator,
    pub(crate) jobs: JobStore,
    pub(crate) incidents: IncidentState,
    pub(crate) log: RecordLog,
    pub(crate) variables: Arc<dyn VariableStore>,
    pub(crate) model: Arc<dyn ProcessModel>,
    pub(crate) max_message_size: usize,
    availability: Option<JobAvailabilityBus>,
}

impl JobProcessors {
    pub fn new(
        partition_id: u32,
        max_message_size: usize,
        variables: Arc<dyn VariableStore>,
        model: Arc<dyn ProcessModel>,
    ) -> Self {
        Self {
            partition_id,
            keys: KeyGenerator::new(partition_id),
            jobs: JobStore::new(),
            incidents: IncidentState::new(),
            log: RecordLog::new(),
            variables,
            model,
            max_message_size,
            availability: None,
        }
    }

    pub fn with_availability(mut self, bus: JobAvailabilityBus) -> Self {
        self.availability = Some(bus);
        self
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn incidents(&self) -> &IncidentState {
        &self.incidents
    }

    pub fn log(&self) -> &RecordLog {
        &self.log
    }

    pub fn process(&mut self, command: JobCommand, now: DateTime<Utc>) -> CommandResult {
        let name = command.name();
        let result = match command {
            JobCommand::Create(new_job) => self.create(new_job),
            JobCommand::ActivateBatch(request) => self.activate_batch(request, now),
            JobCommand::Complete { key, variables } => self.complete(key, variables),
            JobCommand::Fail {
                key,
                retries,
                error_message,
            } => self.fail(key, retries, error_message),
            JobCommand::ThrowError {
                key,
                error_code,
                error_message,
            } => self.throw_error(key, error_code, error_message),
            JobCommand::TimeOut { key } => self.time_out(key),
            JobCommand::UpdateRetries { key, retries } => self.update_retries(key, retries),
            JobCommand::Cancel { key } => self.cancel(key),
            JobCommand::ResolveIncident { incident_key } => self.resolve_incident(incident_key),
        };

        if let Err(rejection) = &result {
            tracing::debug!(
                partition_id = self.partition_id,
                command = name,
                kind = %rejection.kind,
                reason = %rejection.reason,
                "Rejected command"
            );
        }
        result
    }

    fn create(&mut self, new_job: NewJob) -> CommandResult {
        if new_job.job_type.trim().is_empty() {
            return self.reject(
                -1,
                Intent::JobCreate,
                Rejection::invalid_argument(
                    "Expected to create job with type to be present, but it was blank",
                ),
            );
        }
        if new_job.retries <= 0 {
            return self.reject(
                -1,
                Intent::JobCreate,
                Rejection::invalid_argument(format!(
                    "Expected to create job with a positive amount of retries, but the amount given was '{}'",
                    new_job.retries
                )),
            );
        }

        let key = self.keys.next_key();
        let job = Job::from_new(key, new_job);
        self.log
            .append_event(key, Intent::JobCreated, RecordValue::Job(job.clone()));
        self.jobs.create(job.clone());
        self.notify_available(&job.job_type);

        tracing::debug!(partition_id = self.partition_id, job_key = key, job_type = %job.job_type, "Created job");
        Ok(Accepted::Job(job))
    }

    fn complete(&mut self, key: JobKey, variables: Vec<u8>) -> CommandResult {
        match self.jobs.state(key) {
            JobState::Activatable | JobState::Activated => {}
            state => return self.reject(key, Intent::JobComplete, state_rejection("complete", key, state)),
        }

        let Some(mut job) = self.jobs.delete(key) else {
            return self.reject_missing(key, Intent::JobComplete, "complete");
        };
        if !variables.is_empty() {
            self.variables
                .merge_document(job.element_instance_key, &variables);
        }
        job.variables = variables;
        self.log
            .append_event(key, Intent::JobCompleted, RecordValue::Job(job.clone()));

        Ok(Accepted::Job(job))
    }

    fn fail(&mut self, key: JobKey, retries: i32, error_message: String) -> CommandResult {
        match self.jobs.state(key) {
            JobState::Activated => {}
            state => return self.reject(key, Intent::JobFail, state_rejection("fail", key, state)),
        }

        self.jobs.fail(key, retries, &error_message);
        let Some(job) = self.jobs.get(key).cloned() else {
            return self.reject_missing(key, Intent::JobFail, "fail");
        };
        self.log
            .append_event(key, Intent::JobFailed, RecordValue::Job(job.clone()));

        if retries > 0 {
            self.notify_available(&job.job_type);
        } else {
            let message = if error_message.is_empty() {
                NO_RETRIES_LEFT.to_string()
            } else {
                error_message
            };
            self.raise_incident(&job, IncidentErrorType::JobNoRetries, message);
        }

        Ok(Accepted::Job(job))
    }

    fn time_out(&mut self, key: JobKey) -> CommandResult {
        match self.jobs.state(key) {
            JobState::Activated => {}
            state => {
                return self.reject(
                    key,
                    Intent::JobTimeOut,
                    state_rejection("time out activated", key, state),
                )
            }
        }

        self.jobs.time_out(key);
        let Some(job) = self.jobs.get(key).cloned() else {
            return self.reject_missing(key, Intent::JobTimeOut, "time out activated");
        };
        self.log
            .append_event(key, Intent::JobTimedOut, RecordValue::Job(job.clone()));
        self.notify_available(&job.job_type);

        tracing::debug!(partition_id = self.partition_id, job_key = key, "Job lock expired");
        Ok(Accepted::Job(job))
    }

    fn update_retries(&mut self, key: JobKey, retries: i32) -> CommandResult {
        if retries <= 0 {
            return self.reject(
                key,
                Intent::JobUpdateRetries,
                Rejection::invalid_argument(format!(
                    "Expected to update retries for job with key '{key}' with a positive amount of retries, but the amount given was '{retries}'"
                )),
            );
        }
        if self.jobs.state(key) == JobState::NotFound {
            return self.reject_missing(key, Intent::JobUpdateRetries, "update retries for");
        }

        self.jobs.update_retries(key, retries);
        let Some(job) = self.jobs.get(key).cloned() else {
            return self.reject_missing(key, Intent::JobUpdateRetries, "update retries for");
        };
        self.log
            .append_event(key, Intent::JobRetriesUpdated, RecordValue::Job(job.clone()));

        Ok(Accepted::Job(job))
    }

    fn cancel(&mut self, key: JobKey) -> CommandResult {
        let Some(job) = self.jobs.delete(key) else {
            return self.reject_missing(key, Intent::JobCancel, "cancel");
        };
        self.log
            .append_event(key, Intent::JobCanceled, RecordValue::Job(job.clone()));

        if let Some(incident) = self.incidents.remove_for_job(key) {
            self.log.append_event(
                incident.key,
                Intent::IncidentResolved,
                RecordValue::Incident(incident),
            );
        }

        Ok(Accepted::Job(job))
    }

    fn resolve_incident(&mut self, incident_key: i64) -> CommandResult {
        let Some(incident) = self.incidents.get(incident_key).cloned() else {
            return self.reject(
                incident_key,
                Intent::IncidentResolve,
                Rejection::not_found(format!(
                    "Expected to resolve incident with key '{incident_key}', but no such incident was found"
                )),
            );
        };

        let job = self.jobs.get(incident.job_key).cloned();
        if let Some(job) = &job {
            if job.retries <= 0 {
                return self.reject(
                    incident_key,
                    Intent::IncidentResolve,
                    Rejection::invalid_state(format!(
                        "Expected to resolve incident with key '{incident_key}', but job with key '{}' has no retries left; update its retries first",
                        job.key
                    )),
                );
            }
        }

        self.incidents.remove(incident_key);
        self.log.append_event(
            incident_key,
            Intent::IncidentResolved,
            RecordValue::Incident(incident.clone()),
        );

        if let Some(job) = job {
            if self.jobs.state(job.key) == JobState::Failed {
                self.jobs.resolve(job.key);
                self.notify_available(&job.job_type);
            }
        }

        tracing::debug!(partition_id = self.partition_id, incident_key, job_key = incident.job_key, "Resolved incident");
        Ok(Accepted::Incident(incident))
    }

    /// Follow-up for a job that entered FAILED without retries. At most one per job.
    pub(crate) fn raise_incident(
        &mut self,
        job: &Job,
        error_type: IncidentErrorType,
        error_message: String,
    ) {
        if self.incidents.has_job_incident(job.key) {
            return;
        }

        let incident = Incident {
            key: self.keys.next_key(),
            error_type,
            error_message,
            job_key: job.key,
            process_instance_key: job.process_instance_key,
            element_instance_key: job.element_instance_key,
        };
        tracing::info!(
            partition_id = self.partition_id,
            job_key = job.key,
            incident_key = incident.key,
            error_type = ?error_type,
            "Raised incident"
        );
        self.log.append_event(
            incident.key,
            Intent::IncidentCreated,
            RecordValue::Incident(incident.clone()),
        );
        self.incidents.create(incident);
    }

    pub(crate) fn notify_available(&self, job_type: &str) {
        if let Some(bus) = &self.availability {
            bus.publish(job_type);
        }
    }

    pub(crate) fn reject(&mut self, key: i64, intent: Intent, rejection: Rejection) -> CommandResult {
        self.log.append_rejection(key, intent, rejection.clone());
        Err(rejection)
    }

    fn reject_missing(&mut self, key: JobKey, intent: Intent, action: &str) -> CommandResult {
        self.reject(key, intent, state_rejection(action, key, JobState::NotFound))
    }
}

/// Templated rejection for a command that found the job in the wrong state.
pub(crate) fn state_rejection(action: &str, key: JobKey, state: JobState) -> Rejection {
    match state {
        JobState::NotFound => Rejection::not_found(format!(
            "Expected to {action} job with key '{key}', but no such job was found"
        )),
        JobState::Failed => Rejection::invalid_state(format!(
            "Expected to {action} job with key '{key}', but it is marked as failed"
        )),
        JobState::Activatable => Rejection::invalid_state(format!(
            "Expected to {action} job with key '{key}', but it must be activated first"
        )),
        JobState::Activated => Rejection::invalid_state(format!(
            "Expected to {action} job with key '{key}', but it is already activated"
        )),
    }
}
