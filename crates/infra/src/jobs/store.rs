//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use finman_core::RuleId;
use finman_recurring::OccurrenceKey;

use super::types::{Job, JobId, JobStatus};

/// Job store abstraction.
///
/// Every method is a single atomic step: a job is either fully enqueued or
/// not present at all.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job. Fails if the id is taken.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace a stored job.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// The most recent job created for an occurrence, in any state.
    fn find_by_occurrence(&self, key: &OccurrenceKey) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim every ready job (pending, or failed with an elapsed
    /// backoff), moving it to `Running`. Ordered by `scheduled_at`.
    fn claim_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Hand `Running` jobs last touched at or before `claimed_before` back to
    /// `Pending`. These are claims whose outcome was never stored.
    fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Earliest `scheduled_at` among pending and failed jobs.
    fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>, JobStoreError>;

    fn list_by_rule(&self, rule_id: RuleId) -> Result<Vec<Job>, JobStoreError>;

    /// Succeeded jobs last updated before `updated_before`, oldest first.
    fn list_succeeded(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Delete a finished job and its occurrence index entry.
    fn remove(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Abandoned jobs awaiting an operator, oldest first.
    fn list_abandoned(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move an abandoned job back to pending with a fresh attempt budget.
    fn retry_abandoned(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} is {1}, expected abandoned")]
    NotAbandoned(JobId, &'static str),
    #[error("job {0} is {1} and cannot be removed")]
    NotFinished(JobId, &'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    by_occurrence: HashMap<OccurrenceKey, JobId>,
}

/// In-memory job store for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        inner.by_occurrence.insert(job.occurrence(), id);
        inner.jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn find_by_occurrence(&self, key: &OccurrenceKey) -> Result<Option<Job>, JobStoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_occurrence
            .get(key)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    fn claim_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let mut ready: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .map(|j| (j.scheduled_at, j.id))
            .collect();
        ready.sort();

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, id) in ready {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.requeue(now);
                job.mark_running(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let mut inner = self.write()?;

        let mut reclaimed = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running && job.updated_at <= claimed_before {
                job.release_claim(now);
                reclaimed.push(job.id);
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }))
            .map(|j| j.scheduled_at)
            .min())
    }

    fn list_by_rule(&self, rule_id: RuleId) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.rule_id == rule_id)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    fn list_abandoned(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Abandoned { .. }))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    fn list_succeeded(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Succeeded && j.updated_at < updated_before)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    fn remove(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let key = match inner.jobs.get(&job_id) {
            None => return Err(JobStoreError::NotFound(job_id)),
            Some(job) if !job.status.is_terminal() => {
                return Err(JobStoreError::NotFinished(job_id, job.status.name()));
            }
            Some(job) => job.occurrence(),
        };

        if inner.by_occurrence.get(&key) == Some(&job_id) {
            inner.by_occurrence.remove(&key);
        }
        inner.jobs.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))
    }

    fn retry_abandoned(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if !matches!(job.status, JobStatus::Abandoned { .. }) {
            return Err(JobStoreError::NotAbandoned(job_id, job.status.name()));
        }

        job.revive(now);
        Ok(job.clone())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::Abandoned { .. } => stats.abandoned += 1,
            }
        }
        Ok(stats)
    }
}
