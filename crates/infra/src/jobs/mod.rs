//! Materialization jobs with retry, backoff, and abandonment.
//!
//! - `Job`: one attempt-tracked materialization of a rule occurrence
//! - `JobStore`: persistence for jobs
//! - `RetryPolicy`: exponential backoff with a bounded attempt count
//!
//! Abandoned jobs stay in the store for inspection and operator replay.

pub mod retry;
pub mod store;
pub mod types;

pub use retry::{
    AttemptError, RetryDecision, RetryError, RetryPolicy, Retryable, retry_with_policy,
    should_retry,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{FailureOutcome, Job, JobAttemptRecord, JobId, JobStatus};
