//! Job workers.
//!
//! A [`JobWorker`] long-polls the gateway for one job type, runs a [`JobHandler`] for
//! every activated job, and reports the [`JobOutcome`] back to the partition that owns
//! the job (routed by the partition id encoded in the job key).

pub mod handler;
pub mod job_worker;

pub use handler::{JobHandler, JobOutcome};
pub use job_worker::JobWorker;
