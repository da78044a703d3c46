//! Scheduler: turns due rules into materialization jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use finman_core::RuleId;
use finman_recurring::RecurringRule;

use crate::config::SchedulerConfig;
use crate::executor::{AlertSink, ExecutorError, ExhaustedRetries, JobExecutor, TracingAlertSink};
use crate::jobs::{FailureOutcome, Job, JobId, JobStatus, JobStore, JobStoreError};
use crate::rules::{RuleStore, RuleStoreError};

use super::in_flight::InFlightRegistry;

/// Upper bound on succeeded jobs examined by one `prune` call.
const PRUNE_BATCH: usize = 1_000;

/// Store failure that stopped a tick before any job ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Rules(#[from] RuleStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Jobs created for due rules.
    pub created: usize,
    /// Attempts (new or resumed) that materialized a transaction.
    pub succeeded: usize,
    /// Failed attempts with a retry scheduled.
    pub retries_scheduled: usize,
    /// Rules whose occurrence had already succeeded and only needed advancing.
    pub re_advanced: usize,
    /// Rules skipped because another job holds their marker.
    pub skipped_in_flight: usize,
    /// Rules skipped because their current occurrence was abandoned.
    pub skipped_abandoned: usize,
    /// Stale `Running` jobs handed back before claiming.
    pub reclaimed: usize,
    /// Jobs or rules whose outcome could not be stored. Their jobs stay
    /// claimed until `claim_timeout` and then run again.
    pub store_failures: usize,
    pub abandoned: Vec<ExhaustedRetries>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Finds due rules and drives their jobs through the executor.
///
/// At most one job per rule is in flight at any time. A rule's marker is
/// taken when its job is created and released when the job reaches
/// `Succeeded` or `Abandoned`, so retries keep the rule blocked.
pub struct Scheduler<R: ?Sized, J: ?Sized, E: ?Sized> {
    rules: Arc<R>,
    jobs: Arc<J>,
    executor: Arc<E>,
    alerts: Arc<dyn AlertSink>,
    in_flight: InFlightRegistry,
    config: SchedulerConfig,
}

impl<R, J, E> Scheduler<R, J, E>
where
    R: RuleStore + ?Sized,
    J: JobStore + ?Sized,
    E: JobExecutor + ?Sized,
{
    pub fn new(rules: Arc<R>, jobs: Arc<J>, executor: Arc<E>, config: SchedulerConfig) -> Self {
        Self {
            rules,
            jobs,
            executor,
            alerts: Arc::new(TracingAlertSink),
            in_flight: InFlightRegistry::new(),
            config,
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn rules(&self) -> &Arc<R> {
        &self.rules
    }

    pub fn jobs(&self) -> &Arc<J> {
        &self.jobs
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Run one scheduling pass at `now`.
    ///
    /// Retries whose backoff elapsed run first, then every due rule without a
    /// live job gets one. Jobs run one after another.
    ///
    /// Only failing to list claims or due rules fails the tick. A store error
    /// for a single job is logged and counted in `store_failures`; the job
    /// stays `Running` until `claim_timeout` hands it back.
    #[instrument(skip(self), fields(scheduler = %self.config.name), err)]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();

        let reclaimed = self
            .jobs
            .reclaim_stale(shift_back(now, self.config.claim_timeout), now)?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), job_ids = ?reclaimed, "reclaimed jobs whose outcome was never stored");
            report.reclaimed = reclaimed.len();
        }

        for job in self.jobs.claim_ready(now)? {
            let (job_id, rule_id) = (job.id, job.rule_id);
            if let Err(e) = self.resume(job, now, &mut report).await {
                error!(job_id = %job_id, rule_id = %rule_id, error = %e, "failed to store job outcome");
                report.store_failures += 1;
            }
        }

        for rule in self.rules.due_rules(now).await? {
            let rule_id = rule.id;
            if let Err(e) = self.dispatch(rule, now, &mut report).await {
                error!(rule_id = %rule_id, error = %e, "failed to dispatch rule");
                report.store_failures += 1;
            }
        }

        if !report.is_idle() {
            info!(
                created = report.created,
                succeeded = report.succeeded,
                retries_scheduled = report.retries_scheduled,
                abandoned = report.abandoned.len(),
                skipped_in_flight = report.skipped_in_flight,
                skipped_abandoned = report.skipped_abandoned,
                reclaimed = report.reclaimed,
                store_failures = report.store_failures,
                "tick complete"
            );
        }
        Ok(report)
    }

    /// Drop succeeded jobs older than `job_retention` once their rule has
    /// moved past the job's occurrence. A succeeded job whose rule was never
    /// advanced is kept so the next tick can repair the rule.
    #[instrument(skip(self), fields(scheduler = %self.config.name), err)]
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let cutoff = shift_back(now, self.config.job_retention);
        let mut pruned = 0;

        for job in self.jobs.list_succeeded(cutoff, PRUNE_BATCH)? {
            let keep = match self.rules.get(job.rule_id).await {
                Ok(Some(rule)) => rule.next_run_at <= job.occurrence_at,
                Ok(None) => false,
                Err(e) => {
                    warn!(rule_id = %job.rule_id, job_id = %job.id, error = %e, "cannot check rule, keeping job");
                    true
                }
            };
            if keep {
                continue;
            }

            match self.jobs.remove(job.id) {
                Ok(_) => pruned += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to prune job"),
            }
        }

        if pruned > 0 {
            info!(pruned, "pruned succeeded jobs");
        }
        Ok(pruned)
    }

    /// When the earliest pending or failed job becomes ready.
    pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self.jobs.next_scheduled()?)
    }

    /// Stop scheduling a rule. A job already in flight still runs to completion.
    pub async fn deactivate(&self, rule_id: RuleId) -> Result<RecurringRule, SchedulerError> {
        let rule = self.rules.set_active(rule_id, false).await?;
        info!(rule_id = %rule_id, in_flight = ?self.in_flight.holder(rule_id), "rule deactivated");
        Ok(rule)
    }

    pub async fn activate(&self, rule_id: RuleId) -> Result<RecurringRule, SchedulerError> {
        let rule = self.rules.set_active(rule_id, true).await?;
        info!(rule_id = %rule_id, "rule activated");
        Ok(rule)
    }

    /// Operator replay of an abandoned job; it runs on the next tick.
    pub fn retry_abandoned(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, SchedulerError> {
        let job = self.jobs.retry_abandoned(job_id, now)?;
        info!(job_id = %job_id, rule_id = %job.rule_id, "abandoned job requeued by operator");
        Ok(job)
    }

    async fn dispatch(
        &self,
        rule: RecurringRule,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let job_id = JobId::new();
        if !self.in_flight.acquire(rule.id, job_id) {
            debug!(rule_id = %rule.id, "rule has a job in flight, skipping");
            report.skipped_in_flight += 1;
            return Ok(());
        }

        let key = rule.occurrence();
        let existing = match self.jobs.find_by_occurrence(&key) {
            Ok(existing) => existing,
            Err(e) => {
                self.in_flight.release(rule.id, job_id);
                return Err(e.into());
            }
        };

        if let Some(existing) = existing {
            self.in_flight.release(rule.id, job_id);
            match existing.status {
                JobStatus::Abandoned { .. } => {
                    debug!(rule_id = %rule.id, job_id = %existing.id, "occurrence abandoned, awaiting operator");
                    report.skipped_abandoned += 1;
                }
                JobStatus::Succeeded => {
                    warn!(rule_id = %rule.id, job_id = %existing.id, "occurrence already materialized, advancing rule");
                    self.rules.advance(rule.id, key.occurrence_at).await?;
                    report.re_advanced += 1;
                }
                _ => {
                    debug!(rule_id = %rule.id, job_id = %existing.id, "occurrence has a live job, skipping");
                    report.skipped_in_flight += 1;
                }
            }
            return Ok(());
        }

        // Enqueued already running so a concurrent `claim_ready` cannot pick it up.
        let mut job = Job::new(key, now).with_id(job_id);
        job.mark_running(now);
        if let Err(e) = self.jobs.enqueue(job.clone()) {
            self.in_flight.release(rule.id, job_id);
            return Err(e.into());
        }
        report.created += 1;
        debug!(rule_id = %rule.id, job_id = %job_id, occurrence_at = %key.occurrence_at, "job created");

        self.run_attempt(job, &rule, now, report).await
    }

    async fn resume(
        &self,
        mut job: Job,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        if !self.in_flight.acquire(job.rule_id, job.id) {
            // Another job owns the rule; hand this one back for a later tick.
            job.status = JobStatus::Pending;
            job.updated_at = now;
            self.jobs.update(&job)?;
            report.skipped_in_flight += 1;
            return Ok(());
        }

        let rule = match self.rules.get(job.rule_id).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                job.abandon(format!("rule {} no longer exists", job.rule_id), now);
                return self.finish_abandoned(job, report);
            }
            Err(e) => {
                return self.record_failure(job, e.to_string(), Duration::ZERO, now, report);
            }
        };

        // Materialize the job's own occurrence, not whatever the rule points at now.
        let mut snapshot = rule;
        snapshot.next_run_at = job.occurrence_at;

        debug!(rule_id = %job.rule_id, job_id = %job.id, attempt = job.attempt, "resuming job");
        self.run_attempt(job, &snapshot, now, report).await
    }

    async fn run_attempt(
        &self,
        mut job: Job,
        rule: &RecurringRule,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        job.mark_running(now);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.config.executor_timeout, self.executor.materialize(rule)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(self.config.executor_timeout)),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(tx) => {
                if let Err(e) = self.rules.advance(job.rule_id, job.occurrence_at).await {
                    // The succeeded job lets a later tick re-advance.
                    warn!(rule_id = %job.rule_id, job_id = %job.id, error = %e, "failed to advance rule after materialization");
                }
                job.mark_succeeded(now, elapsed);
                let stored = self.jobs.update(&job);
                self.in_flight.release(job.rule_id, job.id);
                stored?;

                info!(
                    rule_id = %job.rule_id,
                    job_id = %job.id,
                    transaction_id = %tx.id,
                    attempt = job.attempt,
                    "recurring transaction materialized"
                );
                report.succeeded += 1;
                Ok(())
            }
            Err(e) => self.record_failure(job, e.to_string(), elapsed, now, report),
        }
    }

    fn record_failure(
        &self,
        mut job: Job,
        error: String,
        elapsed: Duration,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        match job.mark_failed(error.clone(), now, elapsed, &self.config.retry) {
            FailureOutcome::RetryAt(at) => {
                warn!(
                    rule_id = %job.rule_id,
                    job_id = %job.id,
                    attempt = job.attempt,
                    retry_at = %at,
                    error = %error,
                    "materialization failed, retry scheduled"
                );
                self.jobs.update(&job)?;
                report.retries_scheduled += 1;
                Ok(())
            }
            FailureOutcome::Abandoned => self.finish_abandoned(job, report),
        }
    }

    fn finish_abandoned(&self, job: Job, report: &mut TickReport) -> Result<(), SchedulerError> {
        let (last_error, attempts) = match &job.status {
            JobStatus::Abandoned { error, attempts } => (error.clone(), *attempts),
            _ => (String::new(), job.attempt + 1),
        };

        let stored = self.jobs.update(&job);
        self.in_flight.release(job.rule_id, job.id);
        stored?;

        let exhausted = ExhaustedRetries {
            job_id: job.id,
            rule_id: job.rule_id,
            attempts,
            last_error,
        };
        self.alerts.report(&exhausted);
        report.abandoned.push(exhausted);
        Ok(())
    }
}

fn shift_back(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
