//! Integration tests for the full scheduling pipeline.
//!
//! Tests: RuleStore → Scheduler → JobStore → JobExecutor → RuleStore
//!
//! Verifies:
//! - Exactly one job per due rule per tick, never two in flight per rule
//! - Failed jobs retry with backoff and are abandoned when attempts run out
//! - Success advances the rule, failure leaves it untouched
//! - Deactivation never cancels an in-flight job
//! - A job whose outcome could not be stored is reclaimed, never stranded

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::Notify;

    use finman_core::{AccountId, RuleId};
    use finman_recurring::{Amount, OccurrenceKey, RecurringInterval, RecurringRule, TransactionType};

    use crate::config::SchedulerConfig;
    use crate::executor::{
        AlertSink, ExecutorError, ExhaustedRetries, InMemoryLedger, JobExecutor,
        MaterializedTransaction,
    };
    use crate::jobs::{
        InMemoryJobStore, Job, JobId, JobStats, JobStatus, JobStore, JobStoreError, RetryPolicy,
    };
    use crate::rules::{InMemoryRuleStore, RuleStore};
    use crate::scheduler::{Scheduler, SchedulerRunner};

    type TestScheduler<E> = Scheduler<InMemoryRuleStore, InMemoryJobStore, E>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn rule(interval: RecurringInterval, first: DateTime<Utc>) -> RecurringRule {
        RecurringRule::new(
            AccountId::new(),
            TransactionType::Expense,
            Amount::from_minor_units(4_200),
            interval,
            first,
            "subscriptions",
        )
    }

    fn setup<E: JobExecutor>(
        executor: E,
    ) -> (Arc<InMemoryRuleStore>, Arc<InMemoryJobStore>, Arc<E>, TestScheduler<E>) {
        let rules = InMemoryRuleStore::arc();
        let jobs = InMemoryJobStore::arc();
        let executor = Arc::new(executor);
        let scheduler = Scheduler::new(
            rules.clone(),
            jobs.clone(),
            executor.clone(),
            SchedulerConfig::default(),
        );
        (rules, jobs, executor, scheduler)
    }

    /// Fails while `failing` is set, otherwise delegates to an in-memory ledger.
    #[derive(Default)]
    struct SwitchableExecutor {
        failing: AtomicBool,
        calls: AtomicU32,
        ledger: InMemoryLedger,
    }

    impl SwitchableExecutor {
        fn failing() -> Self {
            let executor = Self::default();
            executor.failing.store(true, Ordering::SeqCst);
            executor
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl JobExecutor for SwitchableExecutor {
        async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ExecutorError::Transient("ledger down".to_string()));
            }
            self.ledger.materialize(rule).await
        }
    }

    /// Signals `entered`, then blocks until `release` is notified.
    #[derive(Default)]
    struct GatedExecutor {
        entered: Notify,
        release: Notify,
        ledger: InMemoryLedger,
    }

    #[async_trait::async_trait]
    impl JobExecutor for GatedExecutor {
        async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.ledger.materialize(rule).await
        }
    }

    /// Fails the first `failures` calls, then delegates to an in-memory ledger.
    struct FailsFirst {
        failures: u32,
        calls: AtomicU32,
        ledger: InMemoryLedger,
    }

    impl FailsFirst {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                ledger: InMemoryLedger::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl JobExecutor for FailsFirst {
        async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ExecutorError::Transient("ledger down".to_string()));
            }
            self.ledger.materialize(rule).await
        }
    }

    struct SlowExecutor;

    #[async_trait::async_trait]
    impl JobExecutor for SlowExecutor {
        async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(MaterializedTransaction::from_rule(rule))
        }
    }

    /// In-memory job store whose `update` fails while `failing` is set.
    #[derive(Default)]
    struct UnreliableJobStore {
        inner: InMemoryJobStore,
        failing: AtomicBool,
    }

    impl JobStore for UnreliableJobStore {
        fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
            self.inner.enqueue(job)
        }

        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id)
        }

        fn update(&self, job: &Job) -> Result<(), JobStoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(JobStoreError::Storage("connection reset".to_string()));
            }
            self.inner.update(job)
        }

        fn find_by_occurrence(&self, key: &OccurrenceKey) -> Result<Option<Job>, JobStoreError> {
            self.inner.find_by_occurrence(key)
        }

        fn claim_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            self.inner.claim_ready(now)
        }

        fn reclaim_stale(
            &self,
            claimed_before: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Vec<JobId>, JobStoreError> {
            self.inner.reclaim_stale(claimed_before, now)
        }

        fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
            self.inner.next_scheduled()
        }

        fn list_by_rule(&self, rule_id: RuleId) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_rule(rule_id)
        }

        fn list_succeeded(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_succeeded(updated_before, limit)
        }

        fn remove(&self, job_id: JobId) -> Result<Job, JobStoreError> {
            self.inner.remove(job_id)
        }

        fn list_abandoned(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_abandoned(limit)
        }

        fn retry_abandoned(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
            self.inner.retry_abandoned(job_id, now)
        }

        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats()
        }
    }

    #[derive(Default)]
    struct RecordingAlerts {
        seen: Mutex<Vec<ExhaustedRetries>>,
    }

    impl AlertSink for RecordingAlerts {
        fn report(&self, exhausted: &ExhaustedRetries) {
            self.seen.lock().unwrap().push(exhausted.clone());
        }
    }

    #[tokio::test]
    async fn one_job_per_due_active_rule_per_tick() {
        let (rules, jobs, executor, scheduler) = setup(SwitchableExecutor::default());

        let due = [
            rule(RecurringInterval::Daily, t0() - secs(3600)),
            rule(RecurringInterval::Monthly, t0()),
        ];
        let later = rule(RecurringInterval::Daily, t0() + secs(60));
        let off = rule(RecurringInterval::Daily, t0() - secs(60)).inactive();
        for r in due.iter().chain([&later, &off]) {
            rules.upsert(r.clone()).await.unwrap();
        }

        let report = scheduler.tick(t0()).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(executor.calls(), 2);
        for r in &due {
            assert_eq!(jobs.list_by_rule(r.id).unwrap().len(), 1);
        }
        assert!(jobs.list_by_rule(later.id).unwrap().is_empty());
        assert!(jobs.list_by_rule(off.id).unwrap().is_empty());

        // Same instant again: everything was advanced past `t0`.
        let report = scheduler.tick(t0()).await.unwrap();
        assert!(report.is_idle());
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn first_attempt_success_advances_rule() {
        let (rules, jobs, executor, scheduler) = setup(SwitchableExecutor::default());
        let r = rule(RecurringInterval::Weekly, t0());
        rules.upsert(r.clone()).await.unwrap();

        scheduler.tick(t0()).await.unwrap();

        let stored = rules.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_at, t0() + chrono::Duration::days(7));
        assert_eq!(stored.last_run_at, Some(t0()));

        let job = &jobs.list_by_rule(r.id).unwrap()[0];
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt, 0);
        assert!(scheduler.in_flight().is_empty());
        assert_eq!(executor.ledger.by_rule(r.id)[0].date, t0());
    }

    #[tokio::test]
    async fn always_failing_weekly_rule_is_abandoned_after_two_attempts() {
        let (rules, jobs, executor, scheduler) = setup(SwitchableExecutor::failing());
        let alerts = Arc::new(RecordingAlerts::default());
        let scheduler = scheduler.with_alert_sink(alerts.clone());

        let r = rule(RecurringInterval::Weekly, t0());
        rules.upsert(r.clone()).await.unwrap();

        // Attempt 0 fails at T; retry scheduled for T+1s.
        let report = scheduler.tick(t0()).await.unwrap();
        assert_eq!((report.created, report.retries_scheduled), (1, 1));
        let job = jobs.list_by_rule(r.id).unwrap().remove(0);
        assert_eq!(job.scheduled_at, t0() + secs(1));
        assert!(matches!(job.status, JobStatus::Failed { .. }));
        assert_eq!(scheduler.in_flight().holder(r.id), Some(job.id));

        // Before the backoff elapses the rule stays blocked.
        let report = scheduler.tick(t0() + chrono::Duration::milliseconds(500)).await.unwrap();
        assert_eq!(report.skipped_in_flight, 1);
        assert_eq!(executor.calls(), 1);

        // Attempt 1 fails at T+1s; the job is abandoned.
        let report = scheduler.tick(t0() + secs(1)).await.unwrap();
        assert_eq!(executor.calls(), 2);
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].job_id, job.id);
        assert_eq!(report.abandoned[0].attempts, 2);
        assert_eq!(report.skipped_abandoned, 1);

        let job = jobs.get(job.id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Abandoned { attempts: 2, .. }));
        assert_eq!(job.history.len(), 2);
        assert_eq!(rules.get(r.id).await.unwrap().unwrap().next_run_at, t0());
        assert!(scheduler.in_flight().is_empty());
        assert_eq!(alerts.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_occurrence_waits_for_operator_retry() {
        let (rules, jobs, executor, scheduler) = setup(SwitchableExecutor::failing());
        let r = rule(RecurringInterval::Daily, t0());
        rules.upsert(r.clone()).await.unwrap();

        scheduler.tick(t0()).await.unwrap();
        scheduler.tick(t0() + secs(1)).await.unwrap();
        let abandoned = jobs.list_abandoned(10).unwrap();
        assert_eq!(abandoned.len(), 1);

        // Hours later the occurrence is still not re-materialized.
        let report = scheduler.tick(t0() + secs(3 * 3600)).await.unwrap();
        assert_eq!(report.skipped_abandoned, 1);
        assert_eq!(report.created, 0);
        assert_eq!(executor.calls(), 2);

        executor.failing.store(false, Ordering::SeqCst);
        let later = t0() + secs(4 * 3600);
        let revived = scheduler.retry_abandoned(abandoned[0].id, later).unwrap();
        assert_eq!(revived.attempt, 0);

        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.created, 0);
        assert_eq!(executor.ledger.by_rule(r.id)[0].date, t0());
        assert_eq!(
            rules.get(r.id).await.unwrap().unwrap().next_run_at,
            t0() + chrono::Duration::days(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn executor_timeout_counts_as_failure() {
        let rules = InMemoryRuleStore::arc();
        let jobs = InMemoryJobStore::arc();
        let scheduler = Scheduler::new(
            rules.clone(),
            jobs.clone(),
            Arc::new(SlowExecutor),
            SchedulerConfig::default().with_executor_timeout(Duration::from_secs(1)),
        );
        let r = rule(RecurringInterval::Daily, t0());
        rules.upsert(r.clone()).await.unwrap();

        let report = scheduler.tick(t0()).await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.retries_scheduled, 1);

        let job = jobs.list_by_rule(r.id).unwrap().remove(0);
        assert!(job.last_error().unwrap().contains("timed out"));
        assert_eq!(rules.get(r.id).await.unwrap().unwrap().next_run_at, t0());
    }

    #[tokio::test]
    async fn deactivating_mid_flight_lets_the_job_finish() {
        let (rules, _jobs, executor, scheduler) = setup(GatedExecutor::default());
        let scheduler = Arc::new(scheduler);
        let r = rule(RecurringInterval::Weekly, t0());
        rules.upsert(r.clone()).await.unwrap();

        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.tick(t0()).await })
        };
        executor.entered.notified().await;

        // A concurrent tick sees the marker and leaves the rule alone.
        let concurrent = scheduler.tick(t0()).await.unwrap();
        assert_eq!(concurrent.skipped_in_flight, 1);
        assert_eq!(concurrent.created, 0);

        scheduler.deactivate(r.id).await.unwrap();
        executor.release.notify_one();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(executor.ledger.len(), 1);

        let stored = rules.get(r.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.next_run_at, t0() + chrono::Duration::days(7));

        // No new job once the next occurrence comes due.
        let report = scheduler.tick(t0() + chrono::Duration::days(8)).await.unwrap();
        assert!(report.is_idle());
        assert_eq!(executor.ledger.len(), 1);
    }

    #[tokio::test]
    async fn lost_advance_is_repaired_without_rematerializing() {
        let (rules, jobs, executor, scheduler) = setup(SwitchableExecutor::default());
        let r = rule(RecurringInterval::Monthly, t0());
        rules.upsert(r.clone()).await.unwrap();

        // The transaction was written but the rule never advanced.
        let mut done = Job::new(r.occurrence(), t0());
        done.mark_running(t0());
        done.mark_succeeded(t0(), Duration::from_millis(5));
        jobs.enqueue(done).unwrap();

        let report = scheduler.tick(t0() + secs(60)).await.unwrap();
        assert_eq!(report.re_advanced, 1);
        assert_eq!(report.created, 0);
        assert_eq!(executor.calls(), 0);

        let stored = rules.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(t0()));
        assert_eq!(stored.next_run_at, Utc.with_ymd_and_hms(2024, 6, 6, 9, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn retry_for_deleted_rule_is_abandoned() {
        let (_rules, jobs, executor, scheduler) = setup(SwitchableExecutor::default());
        let orphan = rule(RecurringInterval::Daily, t0());
        jobs.enqueue(Job::new(orphan.occurrence(), t0())).unwrap();

        let report = scheduler.tick(t0()).await.unwrap();
        assert_eq!(report.abandoned.len(), 1);
        assert!(report.abandoned[0].last_error.contains("no longer exists"));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn failed_outcome_writes_are_reclaimed_after_claim_timeout() {
        let rules = InMemoryRuleStore::arc();
        let jobs = Arc::new(UnreliableJobStore::default());
        let executor = Arc::new(SwitchableExecutor::failing());
        let alerts = Arc::new(RecordingAlerts::default());
        let scheduler = Scheduler::new(
            rules.clone(),
            jobs.clone(),
            executor.clone(),
            SchedulerConfig::default(),
        )
        .with_alert_sink(alerts.clone());

        let weekly = [
            rule(RecurringInterval::Weekly, t0()),
            rule(RecurringInterval::Weekly, t0()),
        ];
        for r in &weekly {
            rules.upsert(r.clone()).await.unwrap();
        }

        let report = scheduler.tick(t0()).await.unwrap();
        assert_eq!(report.retries_scheduled, 2);

        // Every outcome write fails during the retry tick; both retries still run.
        jobs.failing.store(true, Ordering::SeqCst);
        let report = scheduler.tick(t0() + secs(1)).await.unwrap();
        assert_eq!(executor.calls(), 4);
        assert_eq!(report.store_failures, 2);
        assert!(report.abandoned.is_empty());
        assert_eq!(jobs.stats().unwrap().running, 2);
        jobs.failing.store(false, Ordering::SeqCst);

        // Inside the claim timeout the claims are left alone.
        let report = scheduler.tick(t0() + secs(60)).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.created, 0);
        assert_eq!(executor.calls(), 4);

        let report = scheduler.tick(t0() + secs(3600)).await.unwrap();
        assert_eq!(report.reclaimed, 2);
        assert_eq!(report.abandoned.len(), 2);
        assert_eq!(report.skipped_abandoned, 2);
        assert_eq!(report.created, 0);
        assert_eq!(executor.calls(), 6);

        assert_eq!(jobs.list_abandoned(10).unwrap().len(), 2);
        assert_eq!(jobs.stats().unwrap().running, 0);
        assert_eq!(alerts.seen.lock().unwrap().len(), 2);
        assert!(scheduler.in_flight().is_empty());
        for r in &weekly {
            assert_eq!(rules.get(r.id).await.unwrap().unwrap().next_run_at, t0());
        }
    }

    #[tokio::test]
    async fn prune_keeps_jobs_that_still_guard_an_unadvanced_rule() {
        let (rules, jobs, executor, scheduler) = setup(SwitchableExecutor::default());
        let advanced = rule(RecurringInterval::Weekly, t0());
        rules.upsert(advanced.clone()).await.unwrap();
        scheduler.tick(t0()).await.unwrap();

        // Materialized, but the rule never advanced.
        let stuck = rule(RecurringInterval::Monthly, t0());
        rules.upsert(stuck.clone()).await.unwrap();
        let mut done = Job::new(stuck.occurrence(), t0());
        done.mark_running(t0());
        done.mark_succeeded(t0(), Duration::from_millis(5));
        jobs.enqueue(done).unwrap();

        // Inside the retention window nothing goes.
        assert_eq!(scheduler.prune(t0() + secs(3600)).await.unwrap(), 0);

        let later = t0() + secs(2 * 24 * 3600);
        assert_eq!(scheduler.prune(later).await.unwrap(), 1);
        assert!(jobs.list_by_rule(advanced.id).unwrap().is_empty());
        assert_eq!(jobs.list_by_rule(stuck.id).unwrap().len(), 1);

        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.re_advanced, 1);
        assert_eq!(report.created, 0);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn runner_wakes_early_for_a_scheduled_retry() {
        let rules = InMemoryRuleStore::arc();
        let executor = Arc::new(FailsFirst::new(1));
        let scheduler = Scheduler::new(
            rules.clone(),
            InMemoryJobStore::arc(),
            executor.clone(),
            SchedulerConfig::default().with_retry(RetryPolicy::exponential(2, Duration::from_millis(50))),
        );
        let r = rule(RecurringInterval::Daily, Utc::now() - secs(3600));
        rules.upsert(r.clone()).await.unwrap();

        // The interval alone would not tick again for a minute.
        let handle = SchedulerRunner::spawn_with_interval(Arc::new(scheduler), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.shutdown().await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.ledger.by_rule(r.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_ticks_until_shutdown() {
        let (rules, _jobs, executor, scheduler) = setup(SwitchableExecutor::default());
        let r = rule(RecurringInterval::Daily, Utc::now() - secs(3600));
        rules.upsert(r.clone()).await.unwrap();

        let handle = SchedulerRunner::spawn_with_interval(Arc::new(scheduler), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await;

        assert_eq!(executor.calls(), 1);
        assert_eq!(executor.ledger.by_rule(r.id).len(), 1);
    }
}
