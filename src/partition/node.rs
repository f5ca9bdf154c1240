use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::availability::JobAvailabilityBus;
use crate::config::PartitionConfig;
use crate::error::BrokerError;
use crate::job::{Job, JobBatch, JobBatchRequest, JobKey, JobState, NewJob};
use crate::partition::collaborators::{ProcessModel, VariableStore};
use crate::partition::command::{Accepted, CommandResult, JobCommand};
use crate::partition::incident::Incident;
use crate::partition::log::Record;
use crate::partition::processor::JobProcessors;
use crate::partition::timeout::{sweep_expired_jobs, PartitionCommandWriter};

/// Message types for the partition event loop
#[derive(Debug)]
pub enum PartitionMessage {
    /// Command from a client, answered on `response_tx`
    Command {
        command: JobCommand,
        response_tx: oneshot::Sender<CommandResult>,
    },
    /// Command the partition wrote to itself; nobody waits for the result
    Append(JobCommand),
    Query(PartitionQuery),
}

#[derive(Debug)]
pub enum PartitionQuery {
    Job {
        key: JobKey,
        response_tx: oneshot::Sender<Option<(JobState, Job)>>,
    },
    Incidents {
        response_tx: oneshot::Sender<Vec<Incident>>,
    },
    Records {
        response_tx: oneshot::Sender<Vec<Record>>,
    },
    ActivatableCount {
        job_type: String,
        response_tx: oneshot::Sender<usize>,
    },
}

/// Writes into the partition's own command queue without waiting.
struct QueueWriter<'a> {
    tx: &'a mpsc::Sender<PartitionMessage>,
}

impl PartitionCommandWriter for QueueWriter<'_> {
    fn append_command(&mut self, command: JobCommand) -> bool {
        self.tx.try_send(PartitionMessage::Append(command)).is_ok()
    }
}

/// One partition: a single task owning the job state, applying commands in queue order.
pub struct Partition {
    pub id: u32,
    processors: JobProcessors,
    message_tx: mpsc::Sender<PartitionMessage>,
    command_timeout: Duration,
    timeout_check_interval: Duration,
}

impl Partition {
    pub fn new(
        id: u32,
        config: &PartitionConfig,
        variables: Arc<dyn VariableStore>,
        model: Arc<dyn ProcessModel>,
        availability: Option<JobAvailabilityBus>,
    ) -> (Self, mpsc::Receiver<PartitionMessage>) {
        let (message_tx, message_rx) = mpsc::channel(config.command_queue_capacity.max(1));

        let mut processors = JobProcessors::new(id, config.max_message_size, variables, model);
        if let Some(bus) = availability {
            processors = processors.with_availability(bus);
        }

        let partition = Self {
            id,
            processors,
            message_tx,
            command_timeout: config.command_timeout(),
            timeout_check_interval: config.job_timeout_check_interval(),
        };

        (partition, message_rx)
    }

    pub fn handle(&self) -> PartitionHandle {
        PartitionHandle {
            partition_id: self.id,
            tx: self.message_tx.clone(),
            command_timeout: self.command_timeout,
        }
    }

    /// Run the partition main loop until `shutdown` fires.
    pub async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<PartitionMessage>,
        shutdown: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.timeout_check_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        sweep.tick().await;

        tracing::info!(partition_id = self.id, "Partition started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(partition_id = self.id, "Partition shutting down");
                    break;
                }

                Some(msg) = message_rx.recv() => {
                    self.handle_message(msg);
                }

                _ = sweep.tick() => {
                    self.check_timeouts();
                }
            }
        }
    }

    fn handle_message(&mut self, msg: PartitionMessage) {
        match msg {
            PartitionMessage::Command {
                command,
                response_tx,
            } => {
                let result = self.processors.process(command, Utc::now());
                let _ = response_tx.send(result);
            }
            PartitionMessage::Append(command) => {
                let _ = self.processors.process(command, Utc::now());
            }
            PartitionMessage::Query(query) => self.handle_query(query),
        }
    }

    fn handle_query(&self, query: PartitionQuery) {
        match query {
            PartitionQuery::Job { key, response_tx } => {
                let jobs = self.processors.jobs();
                let found = jobs.get(key).map(|job| (jobs.state(key), job.clone()));
                let _ = response_tx.send(found);
            }
            PartitionQuery::Incidents { response_tx } => {
                let _ = response_tx.send(self.processors.incidents().all());
            }
            PartitionQuery::Records { response_tx } => {
                let _ = response_tx.send(self.processors.log().records());
            }
            PartitionQuery::ActivatableCount {
                job_type,
                response_tx,
            } => {
                let _ = response_tx.send(self.processors.jobs().activatable_count(&job_type));
            }
        }
    }

    fn check_timeouts(&self) {
        let mut writer = QueueWriter {
            tx: &self.message_tx,
        };
        let report = sweep_expired_jobs(self.processors.jobs(), Utc::now(), &mut writer);
        if report.expired > 0 {
            tracing::debug!(
                partition_id = self.id,
                expired = report.expired,
                written = report.written,
                "Swept expired job locks"
            );
        }
    }
}

/// Cloneable client side of a partition's command queue.
#[derive(Debug, Clone)]
pub struct PartitionHandle {
    partition_id: u32,
    tx: mpsc::Sender<PartitionMessage>,
    command_timeout: Duration,
}

impl PartitionHandle {
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Enqueue a command and wait for its outcome.
    ///
    /// A full queue is reported as `ResourceExhausted` right away; the caller decides
    /// whether to try another partition.
    pub async fn execute(&self, command: JobCommand) -> Result<Accepted, BrokerError> {
        let partition_id = self.partition_id;
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .try_send(PartitionMessage::Command {
                command,
                response_tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => BrokerError::ResourceExhausted { partition_id },
                TrySendError::Closed(_) => BrokerError::Unavailable { partition_id },
            })?;

        match timeout(self.command_timeout, response_rx).await {
            Ok(Ok(Ok(accepted))) => Ok(accepted),
            Ok(Ok(Err(rejection))) => Err(BrokerError::Rejected(rejection)),
            Ok(Err(_)) => Err(BrokerError::Unavailable { partition_id }),
            Err(_) => Err(BrokerError::Timeout { partition_id }),
        }
    }

    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, BrokerError> {
        let accepted = self.execute(JobCommand::Create(new_job)).await?;
        self.expect_job(accepted)
    }

    pub async fn activate_jobs(&self, request: JobBatchRequest) -> Result<JobBatch, BrokerError> {
        match self.execute(JobCommand::ActivateBatch(request)).await? {
            Accepted::Batch(batch) => Ok(batch),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn complete_job(&self, key: JobKey, variables: Vec<u8>) -> Result<Job, BrokerError> {
        let accepted = self
            .execute(JobCommand::Complete { key, variables })
            .await?;
        self.expect_job(accepted)
    }

    pub async fn fail_job(
        &self,
        key: JobKey,
        retries: i32,
        error_message: impl Into<String>,
    ) -> Result<Job, BrokerError> {
        let accepted = self
            .execute(JobCommand::Fail {
                key,
                retries,
                error_message: error_message.into(),
            })
            .await?;
        self.expect_job(accepted)
    }

    pub async fn throw_error(
        &self,
        key: JobKey,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Result<Job, BrokerError> {
        let accepted = self
            .execute(JobCommand::ThrowError {
                key,
                error_code: error_code.into(),
                error_message: error_message.into(),
            })
            .await?;
        self.expect_job(accepted)
    }

    pub async fn time_out_job(&self, key: JobKey) -> Result<Job, BrokerError> {
        let accepted = self.execute(JobCommand::TimeOut { key }).await?;
        self.expect_job(accepted)
    }

    pub async fn update_retries(&self, key: JobKey, retries: i32) -> Result<Job, BrokerError> {
        let accepted = self
            .execute(JobCommand::UpdateRetries { key, retries })
            .await?;
        self.expect_job(accepted)
    }

    pub async fn cancel_job(&self, key: JobKey) -> Result<Job, BrokerError> {
        let accepted = self.execute(JobCommand::Cancel { key }).await?;
        self.expect_job(accepted)
    }

    pub async fn resolve_incident(&self, incident_key: i64) -> Result<Incident, BrokerError> {
        match self
            .execute(JobCommand::ResolveIncident { incident_key })
            .await?
        {
            Accepted::Incident(incident) => Ok(incident),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn job(&self, key: JobKey) -> Result<Option<(JobState, Job)>, BrokerError> {
        self.query(|response_tx| PartitionQuery::Job { key, response_tx })
            .await
    }

    pub async fn incidents(&self) -> Result<Vec<Incident>, BrokerError> {
        self.query(|response_tx| PartitionQuery::Incidents { response_tx })
            .await
    }

    pub async fn records(&self) -> Result<Vec<Record>, BrokerError> {
        self.query(|response_tx| PartitionQuery::Records { response_tx })
            .await
    }

    pub async fn activatable_count(&self, job_type: &str) -> Result<usize, BrokerError> {
        let job_type = job_type.to_string();
        self.query(|response_tx| PartitionQuery::ActivatableCount {
            job_type,
            response_tx,
        })
        .await
    }

    async fn query<T, F>(&self, build: F) -> Result<T, BrokerError>
    where
        F: FnOnce(oneshot::Sender<T>) -> PartitionQuery,
    {
        let partition_id = self.partition_id;
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PartitionMessage::Query(build(response_tx)))
            .await
            .map_err(|_| BrokerError::Unavailable { partition_id })?;

        match timeout(self.command_timeout, response_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BrokerError::Unavailable { partition_id }),
            Err(_) => Err(BrokerError::Timeout { partition_id }),
        }
    }

    fn expect_job(&self, accepted: Accepted) -> Result<Job, BrokerError> {
        match accepted {
            Accepted::Job(job) => Ok(job),
            other => Err(self.unexpected(other)),
        }
    }

    fn unexpected(&self, accepted: Accepted) -> BrokerError {
        tracing::error!(partition_id = self.partition_id, accepted = ?accepted, "Unexpected command response");
        BrokerError::Internal(format!(
            "partition {} answered with an unexpected response",
            self.partition_id
        ))
    }
}
