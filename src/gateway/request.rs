use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::job::{Job, JobBatchRequest};

const DEFAULT_JOB_TIMEOUT_MS: i64 = 5 * 60 * 1000;

/// A worker's call to activate jobs, before it is split per partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub worker: String,
    pub max_jobs_to_activate: i32,
    /// Lock duration for activated jobs, in millis.
    pub timeout: i64,
    pub fetch_variables: Vec<String>,
    /// Long-poll timeout in millis. 0 uses the gateway default; negative disables long polling.
    pub request_timeout: i64,
}

impl ActivateJobsRequest {
    pub fn new(
        job_type: impl Into<String>,
        worker: impl Into<String>,
        max_jobs_to_activate: i32,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            worker: worker.into(),
            max_jobs_to_activate,
            timeout: DEFAULT_JOB_TIMEOUT_MS,
            fetch_variables: Vec::new(),
            request_timeout: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout_ms: i64) -> Self {
        self.request_timeout = request_timeout_ms;
        self
    }

    pub fn with_fetch_variables(mut self, names: Vec<String>) -> Self {
        self.fetch_variables = names;
        self
    }

    pub fn long_polling_disabled(&self) -> bool {
        self.request_timeout < 0
    }

    /// Effective long-poll timeout, falling back to `default` when unset.
    pub fn long_polling_timeout(&self, default: Duration) -> Duration {
        if self.request_timeout > 0 {
            Duration::from_millis(self.request_timeout as u64)
        } else {
            default
        }
    }

    /// Partition-level command asking for at most `remaining` jobs.
    pub fn to_batch_request(&self, remaining: i32) -> JobBatchRequest {
        JobBatchRequest {
            job_type: self.job_type.clone(),
            worker: self.worker.clone(),
            max_jobs_to_activate: remaining,
            timeout: self.timeout,
            variables: self.fetch_variables.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Active,
    Completed,
    TimedOut,
    Canceled,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::TimedOut
                | RequestState::Canceled
                | RequestState::Aborted
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Pending => write!(f, "pending"),
            RequestState::Active => write!(f, "active"),
            RequestState::Completed => write!(f, "completed"),
            RequestState::TimedOut => write!(f, "timed_out"),
            RequestState::Canceled => write!(f, "canceled"),
            RequestState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestProgress {
    pub state: RequestState,
    /// Long-poll timer armed and not yet fired or cancelled.
    pub has_timer: bool,
}

impl Default for RequestProgress {
    fn default() -> Self {
        Self {
            state: RequestState::Pending,
            has_timer: false,
        }
    }
}

/// Jobs handed out by one partition within an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedJobs {
    pub partition_id: u32,
    pub jobs: Vec<Job>,
}

pub type ActivationItem = Result<ActivatedJobs, Status>;
pub type ActivationSink = mpsc::Sender<ActivationItem>;

/// Caller side of an accepted activation.
///
/// Yields job batches as partitions hand them out. The stream ends when the request
/// completes; an error item means it was aborted.
#[derive(Debug)]
pub struct ActivateJobsResponse {
    id: u64,
    rx: mpsc::Receiver<ActivationItem>,
    progress: watch::Receiver<RequestProgress>,
}

impl ActivateJobsResponse {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::Receiver<ActivationItem>,
        progress: watch::Receiver<RequestProgress>,
    ) -> Self {
        Self { id, rx, progress }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next(&mut self) -> Option<ActivationItem> {
        self.rx.recv().await
    }

    pub fn progress(&self) -> RequestProgress {
        *self.progress.borrow()
    }

    pub fn progress_watch(&self) -> watch::Receiver<RequestProgress> {
        self.progress.clone()
    }

    /// Wait until the request reaches a terminal state.
    pub async fn terminated(&self) -> RequestProgress {
        let mut progress = self.progress.clone();
        if let Ok(p) = progress.wait_for(|p| p.state.is_terminal()).await {
            return *p;
        }
        let last = *progress.borrow();
        last
    }

    pub fn into_stream(self) -> ReceiverStream<ActivationItem> {
        ReceiverStream::new(self.rx)
    }

    /// Drain the stream into a flat job list, stopping at the first error.
    pub async fn collect_jobs(mut self) -> Result<Vec<Job>, Status> {
        let mut jobs = Vec::new();
        while let Some(item) = self.rx.recv().await {
            jobs.extend(item?.jobs);
        }
        Ok(jobs)
    }
}
