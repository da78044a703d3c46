//! Materialization job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use finman_core::RuleId;
use finman_recurring::OccurrenceKey;

use super::retry::{RetryDecision, RetryPolicy};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
///
/// `Pending -> Running -> {Succeeded | Failed}`, then `Failed -> Pending`
/// once the backoff has elapsed, or `Abandoned` when attempts run out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// Waiting to be run.
    Pending,
    /// The executor is materializing the transaction.
    Running,
    /// The transaction exists and the rule was advanced.
    Succeeded,
    /// Last attempt failed; a retry is scheduled at `scheduled_at`.
    Failed { error: String },
    /// Retries exhausted. Needs an operator.
    Abandoned { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Abandoned { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Abandoned { .. } => "abandoned",
        }
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// What `mark_failed` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    RetryAt(DateTime<Utc>),
    Abandoned,
}

/// One attempt-tracked materialization of a rule occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub rule_id: RuleId,
    /// The rule's `next_run_at` when the job was created. Together with
    /// `rule_id` this is the dedupe key handed to executors.
    pub occurrence_at: DateTime<Utc>,
    /// 0-indexed number of the current (or last) attempt.
    pub attempt: u32,
    pub status: JobStatus,
    /// When the job may next run.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    pub fn new(occurrence: OccurrenceKey, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            rule_id: occurrence.rule_id,
            occurrence_at: occurrence.occurrence_at,
            attempt: 0,
            status: JobStatus::Pending,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn occurrence(&self) -> OccurrenceKey {
        OccurrenceKey {
            rule_id: self.rule_id,
            occurrence_at: self.occurrence_at,
        }
    }

    /// Pending jobs and failed jobs whose backoff elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed { .. })
            && self.scheduled_at <= now
    }

    /// `Failed -> Pending` for the next attempt.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        if matches!(self.status, JobStatus::Failed { .. }) {
            self.attempt += 1;
            self.status = JobStatus::Pending;
            self.updated_at = now;
        }
    }

    /// `Running -> Pending` for a claim whose owner never stored an outcome.
    /// The attempt number is kept, so the interrupted attempt runs again.
    pub fn release_claim(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Running {
            self.status = JobStatus::Pending;
            self.scheduled_at = self.scheduled_at.min(now);
            self.updated_at = now;
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.status = JobStatus::Succeeded;
        self.updated_at = now;
        self.record_attempt(now, duration, None);
    }

    /// Record a failed attempt and let `policy` choose between retry and abandonment.
    pub fn mark_failed(
        &mut self,
        error: String,
        now: DateTime<Utc>,
        duration: Duration,
        policy: &RetryPolicy,
    ) -> FailureOutcome {
        self.record_attempt(now, duration, Some(error.clone()));
        self.updated_at = now;

        match policy.decide(self.attempt) {
            RetryDecision::RetryAfter(delay) => {
                let at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.scheduled_at = at;
                self.status = JobStatus::Failed { error };
                FailureOutcome::RetryAt(at)
            }
            RetryDecision::GiveUp => {
                self.abandon(error, now);
                FailureOutcome::Abandoned
            }
        }
    }

    /// Give up without consulting the retry policy (e.g. the rule was deleted).
    pub fn abandon(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Abandoned {
            error,
            attempts: self.attempt + 1,
        };
        self.updated_at = now;
    }

    /// Operator retry of an abandoned job: fresh attempt budget, history kept.
    pub fn revive(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.scheduled_at = now;
        self.updated_at = now;
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Failed { error } | JobStatus::Abandoned { error, .. } => Some(error.as_str()),
            _ => None,
        }
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, duration: Duration, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at: now,
            duration_ms: duration.as_millis() as u64,
            error,
        });
    }
}
