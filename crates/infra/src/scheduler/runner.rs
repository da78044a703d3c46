//! Periodic tick driver.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::executor::JobExecutor;
use crate::jobs::JobStore;
use crate::rules::RuleStore;

use super::dispatcher::Scheduler;

/// Shortest wait before an early wake-up for a scheduled retry.
const MIN_RETRY_WAKE: Duration = Duration::from_millis(100);

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct RunnerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl RunnerHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Calls [`Scheduler::tick`] with the wall clock every `tick_interval`, and
/// earlier when a retry comes due before the next interval.
pub struct SchedulerRunner;

impl SchedulerRunner {
    /// Spawn the loop using the scheduler's configured interval.
    pub fn spawn<R, J, E>(scheduler: Arc<Scheduler<R, J, E>>) -> RunnerHandle
    where
        R: RuleStore + ?Sized + 'static,
        J: JobStore + ?Sized + 'static,
        E: JobExecutor + ?Sized + 'static,
    {
        let interval = scheduler.config().tick_interval;
        Self::spawn_with_interval(scheduler, interval)
    }

    pub fn spawn_with_interval<R, J, E>(scheduler: Arc<Scheduler<R, J, E>>, every: Duration) -> RunnerHandle
    where
        R: RuleStore + ?Sized + 'static,
        J: JobStore + ?Sized + 'static,
        E: JobExecutor + ?Sized + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            let name = scheduler.config().name.clone();
            info!(scheduler = %name, interval_ms = every.as_millis() as u64, "scheduler started");

            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut retry_wake: Option<Duration> = None;

            loop {
                let retry_due = async move {
                    match retry_wake {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = signal.notified() => {
                        info!(scheduler = %name, "scheduler received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = retry_due => {
                        debug!(scheduler = %name, "waking early for a scheduled retry");
                    }
                }

                // Failed ticks are retried on the next wake-up.
                let now = Utc::now();
                if let Err(e) = scheduler.tick(now).await {
                    error!(scheduler = %name, error = %e, "scheduler tick failed");
                }
                if let Err(e) = scheduler.prune(now).await {
                    error!(scheduler = %name, error = %e, "job pruning failed");
                }

                retry_wake = match scheduler.next_retry_at() {
                    Ok(Some(at)) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        Some(wait.max(MIN_RETRY_WAKE))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        error!(scheduler = %name, error = %e, "failed to read next retry time");
                        None
                    }
                };
            }

            info!(scheduler = %name, "scheduler stopped");
        });

        RunnerHandle { shutdown, join }
    }
}
