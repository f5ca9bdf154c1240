use crate::error::BrokerError;
use crate::gateway::partitions::FIRST_PARTITION_ID;
use crate::job::{decode_partition_id, Job, JobBatch, JobBatchRequest, JobKey, NewJob};
use crate::partition::{Incident, PartitionHandle};

/// What the gateway needs from the cluster: the topology and a way to reach a partition.
#[tonic::async_trait]
pub trait PartitionClient: Send + Sync {
    fn partition_count(&self) -> u32;

    async fn activate_jobs(
        &self,
        partition_id: u32,
        request: JobBatchRequest,
    ) -> Result<JobBatch, BrokerError>;

    /// Hand a job back to its partition, routed by the partition id encoded in its key.
    async fn fail_job(
        &self,
        key: JobKey,
        retries: i32,
        error_message: String,
    ) -> Result<(), BrokerError>;
}

/// Routes to partitions running in this process.
#[derive(Debug, Clone)]
pub struct LocalPartitionClient {
    partitions: Vec<PartitionHandle>,
}

impl LocalPartitionClient {
    /// `partitions[i]` must be the handle of partition `FIRST_PARTITION_ID + i`.
    pub fn new(partitions: Vec<PartitionHandle>) -> Self {
        Self { partitions }
    }

    pub fn partition(&self, partition_id: u32) -> Result<&PartitionHandle, BrokerError> {
        partition_id
            .checked_sub(FIRST_PARTITION_ID)
            .and_then(|index| self.partitions.get(index as usize))
            .ok_or(BrokerError::PartitionNotFound(partition_id))
    }

    pub fn partition_for_key(&self, key: JobKey) -> Result<&PartitionHandle, BrokerError> {
        self.partition(decode_partition_id(key))
    }

    pub fn partitions(&self) -> &[PartitionHandle] {
        &self.partitions
    }

    pub async fn create_job(&self, partition_id: u32, new_job: NewJob) -> Result<Job, BrokerError> {
        self.partition(partition_id)?.create_job(new_job).await
    }

    pub async fn complete_job(&self, key: JobKey, variables: Vec<u8>) -> Result<Job, BrokerError> {
        self.partition_for_key(key)?
            .complete_job(key, variables)
            .await
    }

    pub async fn throw_error(
        &self,
        key: JobKey,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Result<Job, BrokerError> {
        self.partition_for_key(key)?
            .throw_error(key, error_code, error_message)
            .await
    }

    pub async fn update_retries(&self, key: JobKey, retries: i32) -> Result<Job, BrokerError> {
        self.partition_for_key(key)?
            .update_retries(key, retries)
            .await
    }

    pub async fn resolve_incident(&self, incident_key: i64) -> Result<Incident, BrokerError> {
        self.partition_for_key(incident_key)?
            .resolve_incident(incident_key)
            .await
    }
}

#[tonic::async_trait]
impl PartitionClient for LocalPartitionClient {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn activate_jobs(
        &self,
        partition_id: u32,
        request: JobBatchRequest,
    ) -> Result<JobBatch, BrokerError> {
        self.partition(partition_id)?.activate_jobs(request).await
    }

    async fn fail_job(
        &self,
        key: JobKey,
        retries: i32,
        error_message: String,
    ) -> Result<(), BrokerError> {
        self.partition_for_key(key)?
            .fail_job(key, retries, error_message)
            .await
            .map(|_| ())
    }
}
