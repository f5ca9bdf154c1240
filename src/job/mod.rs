//! Job records and the per-partition job state store.

pub mod keys;
pub mod record;
pub mod store;

pub use keys::{decode_partition_id, JobKey, KeyGenerator};
pub use record::{Job, JobBatch, JobBatchRequest, JobState, NewJob};
pub use store::JobStore;
