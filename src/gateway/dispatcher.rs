use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::BrokerError;
use crate::gateway::client::PartitionClient;
use crate::gateway::partitions::PartitionIdIterator;
use crate::gateway::request::{ActivateJobsRequest, ActivatedJobs, ActivationSink};
use crate::job::{Job, JobKey};

const DELIVERY_FAILED_MESSAGE: &str =
    "Jobs were activated but could not be handed to the worker; the request was already closed";

/// Result of one fan-out across the partitions.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Jobs handed to the caller.
    pub activated: usize,
    pub remaining: i32,
    /// Some partition answered with RESOURCE_EXHAUSTED.
    pub resource_exhausted: bool,
    /// Partition id to start the next fan-out for this job type from.
    pub cursor: u32,
    /// A rejection ended the fan-out.
    pub error: Option<Status>,
    /// Jobs could not be delivered and were failed back to their partitions.
    pub delivery_failed: bool,
}

/// Fans one activation out over all partitions, round-robin from a cursor.
pub struct ActivationDispatcher {
    client: Arc<dyn PartitionClient>,
}

impl ActivationDispatcher {
    pub fn new(client: Arc<dyn PartitionClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn PartitionClient> {
        &self.client
    }

    /// Ask partitions for jobs until `max_jobs_to_activate` are handed out or every
    /// partition was asked. A truncated batch means the partition had more than fit into
    /// one message, so the same partition is asked again before moving on.
    ///
    /// Batches are pushed into `sink` as they arrive. Once `done` is cancelled (the
    /// request timed out) nothing more is delivered.
    pub async fn dispatch(
        &self,
        request: &ActivateJobsRequest,
        start: u32,
        sink: &ActivationSink,
        done: &CancellationToken,
    ) -> DispatchOutcome {
        let mut partitions = PartitionIdIterator::new(start, self.client.partition_count());
        let mut outcome = DispatchOutcome {
            remaining: request.max_jobs_to_activate,
            ..DispatchOutcome::default()
        };
        let mut retry_same = false;

        while outcome.remaining > 0 && (retry_same || partitions.has_next()) {
            let partition_id = if retry_same {
                partitions.current_partition_id()
            } else {
                match partitions.next() {
                    Some(id) => id,
                    None => break,
                }
            };
            retry_same = false;

            let batch_request = request.to_batch_request(outcome.remaining);
            match self.client.activate_jobs(partition_id, batch_request).await {
                Ok(batch) => {
                    retry_same = batch.truncated;
                    if batch.jobs.is_empty() {
                        continue;
                    }

                    let received = batch.jobs.len();
                    if !self.deliver(partition_id, batch.jobs, sink, done).await {
                        outcome.delivery_failed = true;
                        break;
                    }
                    outcome.activated += received;
                    outcome.remaining -= received as i32;
                }
                Err(BrokerError::Rejected(rejection)) => {
                    tracing::debug!(
                        partition_id,
                        job_type = %request.job_type,
                        reason = %rejection.reason,
                        "Activation rejected"
                    );
                    outcome.error = Some(Status::from(BrokerError::Rejected(rejection)));
                    break;
                }
                Err(e) if e.is_resource_exhausted() => {
                    tracing::debug!(partition_id, "Partition exhausted, trying next partition");
                    outcome.resource_exhausted = true;
                }
                Err(e) => {
                    tracing::warn!(
                        partition_id,
                        job_type = %request.job_type,
                        error = %e,
                        "Failed to activate jobs on partition"
                    );
                }
            }
        }

        outcome.cursor = partitions.current_partition_id();
        outcome
    }

    /// Push jobs to the caller. Undeliverable jobs are failed back so they become
    /// activatable again without waiting for their lock to expire.
    async fn deliver(
        &self,
        partition_id: u32,
        jobs: Vec<Job>,
        sink: &ActivationSink,
        done: &CancellationToken,
    ) -> bool {
        let handed_out: Vec<(JobKey, i32)> = jobs.iter().map(|job| (job.key, job.retries)).collect();

        let delivered = if done.is_cancelled() {
            false
        } else {
            tokio::select! {
                biased;
                _ = done.cancelled() => false,
                sent = sink.send(Ok(ActivatedJobs { partition_id, jobs })) => sent.is_ok(),
            }
        };

        if !delivered {
            tracing::debug!(
                partition_id,
                jobs = handed_out.len(),
                "Could not deliver activated jobs, handing them back"
            );
            for (key, retries) in handed_out {
                if let Err(e) = self
                    .client
                    .fail_job(key, retries, DELIVERY_FAILED_MESSAGE.to_string())
                    .await
                {
                    tracing::warn!(job_key = key, error = %e, "Failed to hand back undelivered job");
                }
            }
        }

        delivered
    }
}
