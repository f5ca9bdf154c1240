use serde::{Deserialize, Serialize};

use crate::error::Rejection;
use crate::job::{Job, JobBatch, JobBatchRequest, JobKey, NewJob};
use crate::partition::incident::Incident;

/// Commands accepted by a partition's job processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCommand {
    Create(NewJob),
    ActivateBatch(JobBatchRequest),
    Complete {
        key: JobKey,
        variables: Vec<u8>,
    },
    Fail {
        key: JobKey,
        retries: i32,
        error_message: String,
    },
    ThrowError {
        key: JobKey,
        error_code: String,
        error_message: String,
    },
    TimeOut {
        key: JobKey,
    },
    UpdateRetries {
        key: JobKey,
        retries: i32,
    },
    Cancel {
        key: JobKey,
    },
    ResolveIncident {
        incident_key: i64,
    },
}

impl JobCommand {
    pub fn name(&self) -> &'static str {
        match self {
            JobCommand::Create(_) => "create",
            JobCommand::ActivateBatch(_) => "activate",
            JobCommand::Complete { .. } => "complete",
            JobCommand::Fail { .. } => "fail",
            JobCommand::ThrowError { .. } => "throw_error",
            JobCommand::TimeOut { .. } => "time_out",
            JobCommand::UpdateRetries { .. } => "update_retries",
            JobCommand::Cancel { .. } => "cancel",
            JobCommand::ResolveIncident { .. } => "resolve_incident",
        }
    }
}

/// Value of an accepted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    Job(Job),
    Batch(JobBatch),
    Incident(Incident),
}

pub type CommandResult = Result<Accepted, Rejection>;
