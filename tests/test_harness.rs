//! Test harness for gateway and node integration tests.
//!
//! Provides a scripted partition client for driving the dispatcher and the long-polling
//! coordinator without real partitions, plus helpers for spinning up a full in-process node.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use jobflow_lite::availability::JobAvailabilityBus;
use jobflow_lite::config::{GatewayConfig, LongPollingConfig, NodeConfig};
use jobflow_lite::error::BrokerError;
use jobflow_lite::gateway::long_polling::CoordinatorMessage;
use jobflow_lite::gateway::{
    ActivationDispatcher, LocalPartitionClient, LongPollingCoordinator, LongPollingHandle,
    PartitionClient,
};
use jobflow_lite::job::keys::encode_key;
use jobflow_lite::job::{Job, JobBatch, JobBatchRequest, JobKey, NewJob};
use jobflow_lite::node::Node;

/// Build `count` activated jobs of `job_type` owned by `partition_id`.
pub fn jobs_on(partition_id: u32, job_type: &str, first_local: i64, count: usize) -> Vec<Job> {
    (0..count as i64)
        .map(|offset| {
            let mut job = Job::from_new(
                encode_key(partition_id, first_local + offset),
                NewJob::new(job_type, 3),
            );
            job.worker = "test-worker".to_string();
            job
        })
        .collect()
}

/// A batch answer for `request` carrying `jobs`.
pub fn batch_of(request: &JobBatchRequest, jobs: Vec<Job>, truncated: bool) -> JobBatch {
    let mut batch = JobBatch::empty(request);
    batch.jobs = jobs;
    batch.truncated = truncated;
    batch
}

/// One scripted answer of a partition.
#[derive(Debug, Clone)]
pub enum Scripted {
    Jobs(Vec<Job>),
    Truncated(Vec<Job>),
    Error(BrokerError),
}

/// Partition client whose answers are scripted per partition.
///
/// Unscripted calls answer with an empty batch. Every activation call and every
/// handed-back job is recorded.
#[derive(Debug, Default)]
pub struct StubPartitionClient {
    partition_count: u32,
    scripts: Mutex<HashMap<u32, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(u32, JobBatchRequest)>>,
    failed: Mutex<Vec<(JobKey, i32, String)>>,
    delay: Option<Duration>,
}

impl StubPartitionClient {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            ..Default::default()
        }
    }

    /// Every activation call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(&self, partition_id: u32, answer: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(partition_id)
            .or_default()
            .push_back(answer);
    }

    /// Partition ids in the order they were asked.
    pub fn called_partitions(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn calls(&self) -> Vec<(u32, JobBatchRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn failed_jobs(&self) -> Vec<(JobKey, i32, String)> {
        self.failed.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl PartitionClient for StubPartitionClient {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    async fn activate_jobs(
        &self,
        partition_id: u32,
        request: JobBatchRequest,
    ) -> Result<JobBatch, BrokerError> {
        self.calls
            .lock()
            .unwrap()
            .push((partition_id, request.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let answer = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&partition_id)
            .and_then(|queue| queue.pop_front());
        match answer {
            Some(Scripted::Jobs(jobs)) => Ok(batch_of(&request, jobs, false)),
            Some(Scripted::Truncated(jobs)) => Ok(batch_of(&request, jobs, true)),
            Some(Scripted::Error(e)) => Err(e),
            None => Ok(JobBatch::empty(&request)),
        }
    }

    async fn fail_job(
        &self,
        key: JobKey,
        retries: i32,
        error_message: String,
    ) -> Result<(), BrokerError> {
        self.failed
            .lock()
            .unwrap()
            .push((key, retries, error_message));
        Ok(())
    }
}

/// Long polling settings with a low threshold so tests reach the parked state quickly.
pub fn test_long_polling(min_empty_responses: u32) -> LongPollingConfig {
    LongPollingConfig {
        enabled: true,
        timeout_ms: 10_000,
        probe_timeout_ms: 60_000,
        min_empty_responses,
    }
}

/// A coordinator running on top of a stub client.
pub struct TestGateway {
    pub client: Arc<StubPartitionClient>,
    pub handle: LongPollingHandle,
    pub bus: JobAvailabilityBus,
    shutdown: CancellationToken,
}

impl TestGateway {
    pub fn start(client: StubPartitionClient, long_polling: LongPollingConfig) -> Self {
        let client = Arc::new(client);
        let dispatcher = Arc::new(ActivationDispatcher::new(client.clone()));
        let config = GatewayConfig {
            long_polling,
            ..Default::default()
        };
        let (coordinator, rx): (LongPollingCoordinator, mpsc::Receiver<CoordinatorMessage>) =
            LongPollingCoordinator::new(&config, dispatcher);
        let handle = coordinator.handle();
        let bus = JobAvailabilityBus::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(coordinator.run(rx, Some(bus.subscribe()), shutdown.clone()));

        Self {
            client,
            handle,
            bus,
            shutdown,
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A full node with fast timers. Components stop when the node is dropped.
pub struct TestNode {
    pub client: LocalPartitionClient,
    pub gateway: LongPollingHandle,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl TestNode {
    pub fn start(node: Node) -> Self {
        let client = node.client();
        let gateway = node.gateway();
        let shutdown = CancellationToken::new();
        let tasks = node.start(&shutdown);
        Self {
            client,
            gateway,
            shutdown,
            tasks,
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Node configuration with short timers for tests.
pub fn test_node_config(partitions: u32) -> NodeConfig {
    NodeConfig::new(partitions)
        .with_job_timeout_check_interval(50)
        .with_long_polling(LongPollingConfig {
            enabled: true,
            timeout_ms: 2_000,
            probe_timeout_ms: 500,
            min_empty_responses: 3,
        })
}

/// Poll `condition` until it holds or `timeout` expires.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
