//! Gateway side of job activation.
//!
//! A worker's activation enters the [`LongPollingCoordinator`] through a
//! [`LongPollingHandle`]. The coordinator hands it to the [`ActivationDispatcher`], which
//! fans it out over the partitions through a [`PartitionClient`], or parks it until jobs
//! of its type show up.

pub mod client;
pub mod dispatcher;
pub mod long_polling;
pub mod partitions;
pub mod request;

pub use client::{LocalPartitionClient, PartitionClient};
pub use dispatcher::{ActivationDispatcher, DispatchOutcome};
pub use long_polling::{JobTypeStats, LongPollingCoordinator, LongPollingHandle};
pub use partitions::{PartitionIdIterator, FIRST_PARTITION_ID};
pub use request::{
    ActivateJobsRequest, ActivateJobsResponse, ActivatedJobs, RequestProgress, RequestState,
};
