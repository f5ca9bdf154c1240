//! Per-partition job lifecycle.
//!
//! A partition is a single task ([`Partition`]) owning a [`JobProcessors`] state machine.
//! Clients talk to it through a cloneable [`PartitionHandle`]; every command is applied
//! in queue order and leaves its outcome in the partition's record log.

pub mod batch;
pub mod collaborators;
pub mod command;
pub mod incident;
pub mod log;
pub mod node;
pub mod processor;
pub mod throw_error;
pub mod timeout;

pub use collaborators::{
    CatchEvent, InMemoryProcessModel, InMemoryVariables, ProcessModel, VariableStore,
};
pub use command::{Accepted, CommandResult, JobCommand};
pub use incident::{Incident, IncidentErrorType, IncidentState};
pub use log::{Intent, Record, RecordLog, RecordType, RecordValue};
pub use node::{Partition, PartitionHandle, PartitionMessage};
pub use processor::JobProcessors;
pub use timeout::{sweep_expired_jobs, PartitionCommandWriter, SweepReport};
