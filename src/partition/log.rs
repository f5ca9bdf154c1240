//! In-memory record log of a partition.
//!
//! Every processed command leaves either events or a rejection here, in processing order.
//! Positions keep increasing even when old records are evicted by the retention limit.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::Rejection;
use crate::job::{Job, JobBatch, JobKey};
use crate::partition::incident::Incident;

const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Event,
    CommandRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    // commands, only seen on rejections
    JobCreate,
    JobBatchActivate,
    JobComplete,
    JobFail,
    JobThrowError,
    JobTimeOut,
    JobUpdateRetries,
    JobCancel,
    IncidentResolve,
    // events
    JobCreated,
    JobActivated,
    JobCompleted,
    JobFailed,
    JobErrorThrown,
    JobTimedOut,
    JobRetriesUpdated,
    JobCanceled,
    JobBatchActivated,
    IncidentCreated,
    IncidentResolved,
    ProcessEventTriggering,
}

/// Signal to the process layer that a thrown error was caught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub scope_key: i64,
    pub catch_event_id: String,
    pub job_key: JobKey,
    pub error_code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    Job(Job),
    JobBatch(JobBatch),
    Incident(Incident),
    ProcessEvent(ProcessEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub position: u64,
    pub key: i64,
    pub record_type: RecordType,
    pub intent: Intent,
    pub value: Option<RecordValue>,
    pub rejection: Option<Rejection>,
}

#[derive(Debug)]
pub struct RecordLog {
    records: VecDeque<Record>,
    next_position: u64,
    retention: usize,
}

impl Default for RecordLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordLog {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: VecDeque::new(),
            next_position: 1,
            retention: retention.max(1),
        }
    }

    pub fn append_event(&mut self, key: i64, intent: Intent, value: RecordValue) -> u64 {
        self.append(Record {
            position: 0,
            key,
            record_type: RecordType::Event,
            intent,
            value: Some(value),
            rejection: None,
        })
    }

    pub fn append_rejection(&mut self, key: i64, intent: Intent, rejection: Rejection) -> u64 {
        self.append(Record {
            position: 0,
            key,
            record_type: RecordType::CommandRejection,
            intent,
            value: None,
            rejection: Some(rejection),
        })
    }

    fn append(&mut self, mut record: Record) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        record.position = position;

        if self.records.len() >= self.retention {
            self.records.pop_front();
        }
        self.records.push_back(record);
        position
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.iter().cloned().collect()
    }

    /// Retained records with the given intent, oldest first.
    pub fn with_intent(&self, intent: Intent) -> Vec<&Record> {
        self.records.iter().filter(|r| r.intent == intent).collect()
    }

    pub fn last_position(&self) -> u64 {
        self.next_position - 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    #[test]
    fn positions_increase_monotonically() {
        let mut log = RecordLog::new();
        let job = Job::from_new(1, NewJob::new("email", 3));

        let first = log.append_event(1, Intent::JobCreated, RecordValue::Job(job));
        let second =
            log.append_rejection(1, Intent::JobFail, Rejection::invalid_state("not activated"));

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(log.last_position(), 2);
        assert_eq!(log.with_intent(Intent::JobFail).len(), 1);
    }

    #[test]
    fn retention_evicts_oldest_records() {
        let mut log = RecordLog::with_retention(2);
        for key in 0..3 {
            log.append_rejection(key, Intent::JobCancel, Rejection::not_found("missing"));
        }

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].position, 2);
        assert_eq!(log.last_position(), 3);
    }
}
