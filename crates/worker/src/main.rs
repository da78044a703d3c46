use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use finman_infra::config::AppConfig;
use finman_infra::executor::{InMemoryLedger, JobExecutor, PostgresLedger};
use finman_infra::jobs::InMemoryJobStore;
use finman_infra::rules::{InMemoryRuleStore, PostgresRuleStore, RuleStore};
use finman_infra::scheduler::{Scheduler, SchedulerRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    finman_observability::init();

    let config = AppConfig::from_env().context("invalid scheduler configuration")?;

    let (rules, executor): (Arc<dyn RuleStore>, Arc<dyn JobExecutor>) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;

            let rules = PostgresRuleStore::new(pool.clone());
            rules.ensure_schema().await.context("failed to prepare recurring_rules table")?;
            let ledger = PostgresLedger::new(pool);
            ledger.ensure_schema().await.context("failed to prepare transactions table")?;

            tracing::info!("using postgres rule store and ledger");
            let rules: Arc<dyn RuleStore> = Arc::new(rules);
            let ledger: Arc<dyn JobExecutor> = Arc::new(ledger);
            (rules, ledger)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores (state is lost on exit)");
            let rules: Arc<dyn RuleStore> = InMemoryRuleStore::arc();
            let ledger: Arc<dyn JobExecutor> = Arc::new(InMemoryLedger::new());
            (rules, ledger)
        }
    };

    let scheduler = Arc::new(Scheduler::new(
        rules,
        InMemoryJobStore::arc(),
        executor,
        config.scheduler.clone(),
    ));

    tracing::info!(
        tick_interval_secs = config.scheduler.tick_interval.as_secs(),
        executor_timeout_ms = config.scheduler.executor_timeout.as_millis() as u64,
        max_attempts = config.scheduler.retry.max_attempts,
        "starting recurring transaction worker"
    );
    let runner = SchedulerRunner::spawn(scheduler);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    runner.shutdown().await;

    Ok(())
}
