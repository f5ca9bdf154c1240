use std::time::Duration;

/// Default ceiling for a serialized job batch (4 MiB, the transport's message limit).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Settings shared by every partition of a node.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Number of partitions; ids run from 1 to `partition_count`.
    pub partition_count: u32,
    /// Capacity of each partition's command queue. A full queue is reported as
    /// resource exhaustion instead of blocking the sender.
    pub command_queue_capacity: usize,
    /// How long a caller waits for a command response before giving up.
    pub command_timeout_ms: u64,
    /// Interval of the job timeout sweeper.
    pub job_timeout_check_interval_ms: u64,
    /// Upper bound on the serialized size of an activated job batch.
    pub max_message_size: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_count: 3,
            command_queue_capacity: 256,
            command_timeout_ms: 5_000,
            job_timeout_check_interval_ms: 30_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl PartitionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn job_timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.job_timeout_check_interval_ms)
    }
}

/// Long polling behaviour of the gateway.
#[derive(Debug, Clone)]
pub struct LongPollingConfig {
    /// When disabled, every activation behaves as if it asked for no long polling.
    pub enabled: bool,
    /// Long-poll duration applied when a request asks for the default (0).
    pub timeout_ms: u64,
    /// A job type that saw no refresh within this interval gets probed.
    pub probe_timeout_ms: u64,
    /// Consecutive empty responses after which requests are parked without a broker call.
    pub min_empty_responses: u32,
}

impl Default for LongPollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 10_000,
            probe_timeout_ms: 10_000,
            min_empty_responses: 3,
        }
    }
}

impl LongPollingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub long_polling: LongPollingConfig,
    /// Capacity of the coordinator's inbound queue.
    pub request_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            long_polling: LongPollingConfig::default(),
            request_queue_capacity: 1_024,
        }
    }
}

/// Polling behaviour of a job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_jobs_to_activate: i32,
    /// Lock duration requested for activated jobs.
    pub job_timeout_ms: i64,
    /// Long-poll timeout sent with each activation; 0 uses the gateway default.
    pub request_timeout_ms: i64,
    /// Pause after a failed activation before polling again.
    pub backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_jobs_to_activate: 32,
            job_timeout_ms: 5 * 60 * 1_000,
            request_timeout_ms: 0,
            backoff_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub partition: PartitionConfig,
    pub gateway: GatewayConfig,
}

impl NodeConfig {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition: PartitionConfig {
                partition_count,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_long_polling(mut self, long_polling: LongPollingConfig) -> Self {
        self.gateway.long_polling = long_polling;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.partition.max_message_size = max_message_size;
        self
    }

    pub fn with_job_timeout_check_interval(mut self, interval_ms: u64) -> Self {
        self.partition.job_timeout_check_interval_ms = interval_ms;
        self
    }
}
