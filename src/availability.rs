//! Job availability notifications.
//!
//! Partitions publish a job type whenever a job of that type becomes activatable; the
//! long-polling coordinator subscribes and unblocks parked requests for that type.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    JobsAvailable(String),
    /// The subscriber fell behind and missed notifications; treat every type as available.
    Missed(u64),
}

#[derive(Debug, Clone)]
pub struct JobAvailabilityBus {
    tx: broadcast::Sender<String>,
}

impl Default for JobAvailabilityBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl JobAvailabilityBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, job_type: &str) {
        // No subscribers is fine: nobody is waiting for jobs.
        let _ = self.tx.send(job_type.to_string());
        tracing::trace!(job_type, "Published job availability");
    }

    pub fn subscribe(&self) -> JobAvailabilitySubscription {
        JobAvailabilitySubscription {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct JobAvailabilitySubscription {
    rx: broadcast::Receiver<String>,
}

impl JobAvailabilitySubscription {
    /// Next notification, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.rx.recv().await {
            Ok(job_type) => Some(Notification::JobsAvailable(job_type)),
            Err(RecvError::Lagged(missed)) => Some(Notification::Missed(missed)),
            Err(RecvError::Closed) => None,
        }
    }
}
