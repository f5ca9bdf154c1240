//! Expired-lock sweeping.

use chrono::{DateTime, Utc};

use crate::job::JobStore;
use crate::partition::command::JobCommand;

/// Destination for commands a partition writes to itself.
pub trait PartitionCommandWriter {
    /// Try to enqueue `command`. Returns false when the queue refuses it; never blocks.
    fn append_command(&mut self, command: JobCommand) -> bool;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub written: usize,
}

impl SweepReport {
    pub fn aborted(&self) -> bool {
        self.written < self.expired
    }
}

/// Writes a TIME_OUT command for every activated job whose deadline passed before `now`.
/// The first refused write ends the sweep; the next tick picks up the rest.
pub fn sweep_expired_jobs<W>(jobs: &JobStore, now: DateTime<Utc>, writer: &mut W) -> SweepReport
where
    W: PartitionCommandWriter + ?Sized,
{
    let expired = jobs.expired_jobs(now.timestamp_millis());
    let mut report = SweepReport {
        expired: expired.len(),
        written: 0,
    };

    for key in expired {
        if !writer.append_command(JobCommand::TimeOut { key }) {
            tracing::debug!(
                job_key = key,
                remaining = report.expired - report.written,
                "Command queue refused time out, deferring to next sweep"
            );
            break;
        }
        report.written += 1;
    }

    report
}
