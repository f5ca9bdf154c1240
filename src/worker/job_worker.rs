use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::config::WorkerConfig;
use crate::gateway::{
    ActivateJobsRequest, LocalPartitionClient, LongPollingHandle, PartitionClient, RequestState,
};
use crate::job::Job;
use crate::worker::handler::{JobHandler, JobOutcome};

/// Pulls jobs of one type through the gateway and reports outcomes to the owning partitions.
pub struct JobWorker {
    name: String,
    job_type: String,
    config: WorkerConfig,
    gateway: LongPollingHandle,
    client: LocalPartitionClient,
    handler: Arc<dyn JobHandler>,
}

impl JobWorker {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        config: WorkerConfig,
        gateway: LongPollingHandle,
        client: LocalPartitionClient,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            config,
            gateway,
            client,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(worker = %self.name, job_type = %self.job_type, "Worker started");

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once() => result,
            };

            let pause = match result {
                Ok((handled, state)) => {
                    tracing::trace!(
                        worker = %self.name,
                        handled,
                        state = ?state,
                        "Activation round finished"
                    );
                    // only a long-poll timeout has already waited
                    handled == 0 && state != RequestState::TimedOut
                }
                Err(status) => {
                    tracing::warn!(
                        worker = %self.name,
                        code = ?status.code(),
                        message = status.message(),
                        "Activation failed"
                    );
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.backoff()) => {}
                }
            }
        }

        tracing::info!(worker = %self.name, "Worker stopped");
    }

    /// One activation: handle every job delivered until the request completes.
    /// Returns the number of jobs handled and the state the request ended in.
    pub async fn poll_once(&self) -> Result<(usize, RequestState), Status> {
        let request = ActivateJobsRequest::new(
            self.job_type.clone(),
            self.name.clone(),
            self.config.max_jobs_to_activate,
        )
        .with_timeout(self.config.job_timeout_ms)
        .with_request_timeout(self.config.request_timeout_ms);

        let mut response = self.gateway.activate_jobs(request)?;
        let mut handled = 0;
        while let Some(item) = response.next().await {
            for job in item?.jobs {
                self.handle_job(job).await;
                handled += 1;
            }
        }
        Ok((handled, response.terminated().await.state))
    }

    async fn handle_job(&self, job: Job) {
        let key = job.key;
        let outcome = self.handler.handle(&job).await;
        tracing::debug!(worker = %self.name, job_key = key, outcome = ?outcome, "Handled job");

        let result = match outcome {
            JobOutcome::Complete(variables) => {
                self.client.complete_job(key, variables).await.map(|_| ())
            }
            JobOutcome::Fail { retries, message } => {
                self.client.fail_job(key, retries, message).await
            }
            JobOutcome::ThrowError { code, message } => self
                .client
                .throw_error(key, code, message)
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            tracing::warn!(worker = %self.name, job_key = key, error = %e, "Failed to report job outcome");
        }
    }
}
