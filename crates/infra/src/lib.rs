//! Infrastructure layer: stores, scheduler, retries, external collaborators.

pub mod config;
pub mod executor;
pub mod jobs;
pub mod rules;
pub mod scan;
pub mod scheduler;

mod integration_tests;

pub use config::{AppConfig, ConfigError, SchedulerConfig};
pub use executor::{
    AlertSink, ExecutorError, ExhaustedRetries, InMemoryLedger, JobExecutor,
    MaterializedTransaction, PostgresLedger, TracingAlertSink,
};
pub use jobs::{InMemoryJobStore, Job, JobId, JobStatus, JobStore, JobStoreError, RetryPolicy};
pub use rules::{InMemoryRuleStore, PostgresRuleStore, RuleStore, RuleStoreError};
pub use scheduler::{RunnerHandle, Scheduler, SchedulerError, SchedulerRunner, TickReport};
