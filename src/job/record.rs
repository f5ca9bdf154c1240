use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::keys::JobKey;

/// Lifecycle state of a job inside a partition.
///
/// `NotFound` is never stored; it is what the store reports for unknown keys so that
/// every command handler can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Activatable,
    Activated,
    Failed,
    NotFound,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Activatable => write!(f, "activatable"),
            JobState::Activated => write!(f, "activated"),
            JobState::Failed => write!(f, "failed"),
            JobState::NotFound => write!(f, "not_found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub job_type: String,
    pub worker: String,
    /// Lock expiry in epoch millis, only set while activated.
    pub deadline: Option<i64>,
    pub retries: i32,
    /// Resolved from variable storage while building a batch; empty at rest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub custom_headers: BTreeMap<String, String>,
    pub process_instance_key: i64,
    pub element_instance_key: i64,
    pub bpmn_process_id: String,
    pub element_id: String,
}

impl Job {
    pub fn from_new(key: JobKey, new_job: NewJob) -> Self {
        Self {
            key,
            job_type: new_job.job_type,
            worker: String::new(),
            deadline: None,
            retries: new_job.retries,
            variables: Vec::new(),
            error_code: String::new(),
            error_message: String::new(),
            custom_headers: new_job.custom_headers,
            process_instance_key: new_job.process_instance_key,
            element_instance_key: new_job.element_instance_key,
            bpmn_process_id: new_job.bpmn_process_id,
            element_id: new_job.element_id,
        }
    }

    pub fn deadline_at(&self) -> Option<DateTime<Utc>> {
        self.deadline.and_then(DateTime::from_timestamp_millis)
    }

    /// Number of bytes this job occupies inside a serialized batch.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }
}

/// Payload of a CREATE command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub retries: i32,
    pub custom_headers: BTreeMap<String, String>,
    pub process_instance_key: i64,
    pub element_instance_key: i64,
    pub bpmn_process_id: String,
    pub element_id: String,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, retries: i32) -> Self {
        Self {
            job_type: job_type.into(),
            retries,
            ..Default::default()
        }
    }

    pub fn with_element_instance(mut self, process_instance_key: i64, element_instance_key: i64) -> Self {
        self.process_instance_key = process_instance_key;
        self.element_instance_key = element_instance_key;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }
}

/// Parameters of one ACTIVATE command against a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBatchRequest {
    pub job_type: String,
    pub worker: String,
    pub max_jobs_to_activate: i32,
    /// Lock duration in millis.
    pub timeout: i64,
    /// Explicit variable allowlist; empty means "fetch the whole document".
    pub variables: Vec<String>,
}

/// Result of an ACTIVATE command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBatch {
    pub job_type: String,
    pub worker: String,
    pub timeout: i64,
    pub max_jobs_to_activate: i32,
    pub truncated: bool,
    pub jobs: Vec<Job>,
}

impl JobBatch {
    pub fn empty(request: &JobBatchRequest) -> Self {
        Self {
            job_type: request.job_type.clone(),
            worker: request.worker.clone(),
            timeout: request.timeout,
            max_jobs_to_activate: request.max_jobs_to_activate,
            truncated: false,
            jobs: Vec::new(),
        }
    }

    /// Exact JSON size of this batch.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        self.jobs.iter().map(|job| job.key).collect()
    }
}
