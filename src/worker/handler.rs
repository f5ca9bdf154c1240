use crate::job::Job;

/// What a handler decided for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done; the bytes are merged into the job's variable scope.
    Complete(Vec<u8>),
    /// Retry later with the given budget. Zero retries raises an incident.
    Fail { retries: i32, message: String },
    /// Business error, resolved against the error catch events of the process.
    ThrowError { code: String, message: String },
}

impl JobOutcome {
    pub fn complete() -> Self {
        JobOutcome::Complete(Vec::new())
    }

    /// Fail consuming one retry from the job's remaining budget.
    pub fn retry(job: &Job, message: impl Into<String>) -> Self {
        JobOutcome::Fail {
            retries: (job.retries - 1).max(0),
            message: message.into(),
        }
    }
}

/// Work done for a job type.
#[tonic::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}
