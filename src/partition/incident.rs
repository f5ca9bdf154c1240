use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::job::JobKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentErrorType {
    JobNoRetries,
    UnhandledErrorEvent,
    MessageSizeExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub key: i64,
    pub error_type: IncidentErrorType,
    pub error_message: String,
    pub job_key: JobKey,
    pub process_instance_key: i64,
    pub element_instance_key: i64,
}

/// Open incidents of a partition, at most one per job.
#[derive(Debug, Default)]
pub struct IncidentState {
    incidents: BTreeMap<i64, Incident>,
    by_job: HashMap<JobKey, i64>,
}

impl IncidentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_job_incident(&self, job_key: JobKey) -> bool {
        self.by_job.contains_key(&job_key)
    }

    /// Store the incident unless its job already has one. Returns whether it was stored.
    pub fn create(&mut self, incident: Incident) -> bool {
        if self.has_job_incident(incident.job_key) {
            return false;
        }
        self.by_job.insert(incident.job_key, incident.key);
        self.incidents.insert(incident.key, incident);
        true
    }

    pub fn get(&self, key: i64) -> Option<&Incident> {
        self.incidents.get(&key)
    }

    pub fn remove(&mut self, key: i64) -> Option<Incident> {
        let incident = self.incidents.remove(&key)?;
        self.by_job.remove(&incident.job_key);
        Some(incident)
    }

    pub fn remove_for_job(&mut self, job_key: JobKey) -> Option<Incident> {
        let key = self.by_job.get(&job_key).copied()?;
        self.remove(key)
    }

    pub fn all(&self) -> Vec<Incident> {
        self.incidents.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}
