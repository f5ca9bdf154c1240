use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::availability::JobAvailabilityBus;
use crate::config::{NodeConfig, WorkerConfig};
use crate::error::{JobflowError, Result};
use crate::gateway::long_polling::CoordinatorMessage;
use crate::gateway::{
    ActivationDispatcher, LocalPartitionClient, LongPollingCoordinator, LongPollingHandle,
    FIRST_PARTITION_ID,
};
use crate::partition::{
    InMemoryProcessModel, InMemoryVariables, Partition, PartitionHandle, PartitionMessage,
};
use crate::worker::{JobHandler, JobWorker};

/// Main node that orchestrates all components: partitions, the long-polling gateway and
/// any registered workers, all inside one process.
pub struct Node {
    pub config: NodeConfig,
    variables: Arc<InMemoryVariables>,
    model: Arc<InMemoryProcessModel>,
    availability: JobAvailabilityBus,
    partitions: Vec<(Partition, mpsc::Receiver<PartitionMessage>)>,
    client: LocalPartitionClient,
    coordinator: LongPollingCoordinator,
    coordinator_rx: mpsc::Receiver<CoordinatorMessage>,
    workers: Vec<JobWorker>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_collaborators(
            config,
            Arc::new(InMemoryVariables::new()),
            Arc::new(InMemoryProcessModel::new()),
        )
    }

    pub fn with_collaborators(
        config: NodeConfig,
        variables: Arc<InMemoryVariables>,
        model: Arc<InMemoryProcessModel>,
    ) -> Result<Self> {
        validate(&config)?;

        let availability = JobAvailabilityBus::default();
        let partitions: Vec<_> = (0..config.partition.partition_count)
            .map(|offset| {
                Partition::new(
                    FIRST_PARTITION_ID + offset,
                    &config.partition,
                    variables.clone(),
                    model.clone(),
                    Some(availability.clone()),
                )
            })
            .collect();
        let handles: Vec<PartitionHandle> = partitions.iter().map(|(p, _)| p.handle()).collect();
        let client = LocalPartitionClient::new(handles);

        let dispatcher = Arc::new(ActivationDispatcher::new(Arc::new(client.clone())));
        let (coordinator, coordinator_rx) = LongPollingCoordinator::new(&config.gateway, dispatcher);

        Ok(Self {
            config,
            variables,
            model,
            availability,
            partitions,
            client,
            coordinator,
            coordinator_rx,
            workers: Vec::new(),
        })
    }

    pub fn client(&self) -> LocalPartitionClient {
        self.client.clone()
    }

    pub fn gateway(&self) -> LongPollingHandle {
        self.coordinator.handle()
    }

    pub fn variables(&self) -> Arc<InMemoryVariables> {
        self.variables.clone()
    }

    pub fn model(&self) -> Arc<InMemoryProcessModel> {
        self.model.clone()
    }

    pub fn add_worker(
        &mut self,
        name: impl Into<String>,
        job_type: impl Into<String>,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) {
        let worker = JobWorker::new(
            name,
            job_type,
            config,
            self.gateway(),
            self.client(),
            handler,
        );
        self.workers.push(worker);
    }

    /// Spawn every component. They all stop once `shutdown` is cancelled.
    pub fn start(self, shutdown: &CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        for (partition, rx) in self.partitions {
            tasks.spawn(partition.run(rx, shutdown.clone()));
        }

        let notifications = self.availability.subscribe();
        tasks.spawn(
            self.coordinator
                .run(self.coordinator_rx, Some(notifications), shutdown.clone()),
        );

        for worker in self.workers {
            tasks.spawn(worker.run(shutdown.clone()));
        }

        tracing::info!(
            partitions = self.config.partition.partition_count,
            long_polling = self.config.gateway.long_polling.enabled,
            "Node started"
        );
        tasks
    }

    /// Run until `shutdown` is cancelled, then wait for every component to stop.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = self.start(&shutdown);
        shutdown.cancelled().await;

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Node task failed");
                return Err(JobflowError::Internal(e.to_string()));
            }
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}

fn validate(config: &NodeConfig) -> Result<()> {
    if config.partition.partition_count == 0 {
        return Err(JobflowError::Config(
            "partition_count must be at least 1".to_string(),
        ));
    }
    if config.partition.max_message_size == 0 {
        return Err(JobflowError::Config(
            "max_message_size must be greater than zero".to_string(),
        ));
    }
    if config.gateway.long_polling.probe_timeout_ms == 0 {
        return Err(JobflowError::Config(
            "probe_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if config.partition.job_timeout_check_interval_ms == 0 {
        return Err(JobflowError::Config(
            "job_timeout_check_interval_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_topology() {
        let err = Node::new(NodeConfig::new(0)).err().unwrap();
        assert!(matches!(err, JobflowError::Config(_)));
    }

    #[tokio::test]
    async fn client_routes_to_every_partition() {
        let node = Node::new(NodeConfig::new(3)).unwrap();
        let client = node.client();
        assert_eq!(client.partitions().len(), 3);
        assert_eq!(client.partition(3).unwrap().partition_id(), 3);
        assert!(client.partition(4).is_err());
        assert!(client.partition(0).is_err());
    }
}
