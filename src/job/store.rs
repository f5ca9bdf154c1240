use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::job::keys::JobKey;
use crate::job::record::{Job, JobState};

#[derive(Debug, Clone)]
struct JobEntry {
    state: JobState,
    job: Job,
}

/// Keyed job state of one partition.
///
/// Besides the primary map it keeps two secondary indexes: activatable keys per job type
/// (iterated in key order when building batches) and `(deadline, key)` pairs for activated
/// jobs (scanned by the timeout sweeper). Every transition keeps the indexes in sync.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<JobKey, JobEntry>,
    activatable: HashMap<String, BTreeSet<JobKey>>,
    deadlines: BTreeSet<(i64, JobKey)>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created job as activatable.
    pub fn create(&mut self, job: Job) {
        let key = job.key;
        self.index_activatable(&job);
        self.jobs.insert(
            key,
            JobEntry {
                state: JobState::Activatable,
                job,
            },
        );
    }

    pub fn get(&self, key: JobKey) -> Option<&Job> {
        self.jobs.get(&key).map(|entry| &entry.job)
    }

    /// Current state of `key`; unknown keys report `NotFound`.
    pub fn state(&self, key: JobKey) -> JobState {
        self.jobs
            .get(&key)
            .map(|entry| entry.state)
            .unwrap_or(JobState::NotFound)
    }

    /// Lock the job to the worker and deadline carried by `job`.
    pub fn activate(&mut self, key: JobKey, job: &Job) {
        let Some(entry) = self.jobs.get_mut(&key) else {
            return;
        };
        Self::unindex(&mut self.activatable, &mut self.deadlines, entry);

        entry.state = JobState::Activated;
        entry.job.worker = job.worker.clone();
        entry.job.deadline = job.deadline;
        entry.job.variables.clear();

        if let Some(deadline) = entry.job.deadline {
            self.deadlines.insert((deadline, key));
        }
    }

    /// Release an expired lock.
    pub fn time_out(&mut self, key: JobKey) {
        self.make_activatable(key, |job| {
            job.worker.clear();
            job.deadline = None;
        });
    }

    /// Apply a failure: with retries left the job is activatable again, otherwise failed.
    pub fn fail(&mut self, key: JobKey, retries: i32, error_message: &str) {
        let Some(entry) = self.jobs.get_mut(&key) else {
            return;
        };
        Self::unindex(&mut self.activatable, &mut self.deadlines, entry);

        entry.job.retries = retries;
        entry.job.error_message = error_message.to_string();
        entry.job.worker.clear();
        entry.job.deadline = None;

        if retries > 0 {
            entry.state = JobState::Activatable;
            self.activatable
                .entry(entry.job.job_type.clone())
                .or_default()
                .insert(key);
        } else {
            entry.state = JobState::Failed;
        }
    }

    /// Record a thrown business error and park the job as failed with no retries.
    pub fn throw_error(&mut self, key: JobKey, error_code: &str, error_message: &str) {
        let Some(entry) = self.jobs.get_mut(&key) else {
            return;
        };
        Self::unindex(&mut self.activatable, &mut self.deadlines, entry);

        entry.state = JobState::Failed;
        entry.job.retries = 0;
        entry.job.error_code = error_code.to_string();
        entry.job.error_message = error_message.to_string();
        entry.job.worker.clear();
        entry.job.deadline = None;
    }

    /// Make a failed job activatable again (incident resolution).
    pub fn resolve(&mut self, key: JobKey) {
        self.make_activatable(key, |job| {
            job.worker.clear();
            job.deadline = None;
        });
    }

    pub fn update_retries(&mut self, key: JobKey, retries: i32) {
        if let Some(entry) = self.jobs.get_mut(&key) {
            entry.job.retries = retries;
        }
    }

    /// Remove the job and its index entries, returning the last stored record.
    pub fn delete(&mut self, key: JobKey) -> Option<Job> {
        let mut entry = self.jobs.remove(&key)?;
        Self::unindex(&mut self.activatable, &mut self.deadlines, &mut entry);
        Some(entry.job)
    }

    /// Visit activatable jobs of `job_type` in key order until the visitor returns false.
    pub fn for_each_activatable<F>(&self, job_type: &str, mut visitor: F)
    where
        F: FnMut(JobKey, &Job) -> bool,
    {
        let Some(keys) = self.activatable.get(job_type) else {
            return;
        };
        for key in keys {
            if let Some(entry) = self.jobs.get(key) {
                if !visitor(*key, &entry.job) {
                    break;
                }
            }
        }
    }

    /// Keys of activated jobs whose deadline lies strictly before `now_ms`, oldest first.
    pub fn expired_jobs(&self, now_ms: i64) -> Vec<JobKey> {
        self.deadlines
            .range(..(now_ms, JobKey::MIN))
            .map(|(_, key)| *key)
            .collect()
    }

    pub fn activatable_count(&self, job_type: &str) -> usize {
        self.activatable.get(job_type).map(BTreeSet::len).unwrap_or(0)
    }

    /// Jobs currently locked by `worker`.
    pub fn jobs_for_worker(&self, worker: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|entry| entry.state == JobState::Activated && entry.job.worker == worker)
            .map(|entry| &entry.job)
            .collect()
    }

    /// Snapshot of every stored job with its state, ordered by key.
    pub fn all_jobs(&self) -> BTreeMap<JobKey, (JobState, Job)> {
        self.jobs
            .iter()
            .map(|(key, entry)| (*key, (entry.state, entry.job.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn make_activatable<F>(&mut self, key: JobKey, reset: F)
    where
        F: FnOnce(&mut Job),
    {
        let Some(entry) = self.jobs.get_mut(&key) else {
            return;
        };
        Self::unindex(&mut self.activatable, &mut self.deadlines, entry);
        reset(&mut entry.job);
        entry.state = JobState::Activatable;
        self.activatable
            .entry(entry.job.job_type.clone())
            .or_default()
            .insert(key);
    }

    fn index_activatable(&mut self, job: &Job) {
        self.activatable
            .entry(job.job_type.clone())
            .or_default()
            .insert(job.key);
    }

    fn unindex(
        activatable: &mut HashMap<String, BTreeSet<JobKey>>,
        deadlines: &mut BTreeSet<(i64, JobKey)>,
        entry: &mut JobEntry,
    ) {
        let key = entry.job.key;
        if let Some(keys) = activatable.get_mut(&entry.job.job_type) {
            keys.remove(&key);
            if keys.is_empty() {
                activatable.remove(&entry.job.job_type);
            }
        }
        if let Some(deadline) = entry.job.deadline {
            deadlines.remove(&(deadline, key));
        }
    }
}
