//! Job executor collaborators.
//!
//! The scheduler hands every due rule to a [`JobExecutor`], which turns the
//! rule's current occurrence into a concrete transaction. Delivery is
//! at-least-once, so executors must dedupe on [`OccurrenceKey`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use finman_core::{AccountId, RuleId, TransactionId};
use finman_recurring::{Amount, OccurrenceKey, RecurringInterval, RecurringRule, TransactionType};

use crate::jobs::{JobId, Retryable};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// A transaction produced from one occurrence of a recurring rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedTransaction {
    pub id: TransactionId,
    pub rule_id: RuleId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Amount,
    pub category: String,
    pub description: Option<String>,
    /// The occurrence this transaction stands for.
    pub date: DateTime<Utc>,
    pub is_recurring: bool,
    pub recurring_interval: RecurringInterval,
}

impl MaterializedTransaction {
    /// Build the transaction for the rule's current occurrence.
    pub fn from_rule(rule: &RecurringRule) -> Self {
        Self {
            id: TransactionId::new(),
            rule_id: rule.id,
            account_id: rule.account_id,
            kind: rule.kind,
            amount: rule.amount,
            category: rule.category.clone(),
            description: rule.description.clone(),
            date: rule.next_run_at,
            is_recurring: true,
            recurring_interval: rule.interval,
        }
    }

    pub fn occurrence(&self) -> OccurrenceKey {
        OccurrenceKey {
            rule_id: self.rule_id,
            occurrence_at: self.date,
        }
    }
}

/// Failure of a single materialization attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("executor timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for ExecutorError {}

/// Materializes rule occurrences.
///
/// `rule.next_run_at` is the occurrence being materialized. Two calls for
/// the same `(rule.id, rule.next_run_at)` must yield one transaction.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError>;
}

/// A job ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("job {job_id} for rule {rule_id} abandoned after {attempts} attempt(s): {last_error}")]
pub struct ExhaustedRetries {
    pub job_id: JobId,
    pub rule_id: RuleId,
    pub attempts: u32,
    pub last_error: String,
}

/// Operator alerting for abandoned jobs.
pub trait AlertSink: Send + Sync {
    fn report(&self, exhausted: &ExhaustedRetries);
}

/// Emits a structured `tracing` error event per abandoned job.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn report(&self, exhausted: &ExhaustedRetries) {
        error!(
            job_id = %exhausted.job_id,
            rule_id = %exhausted.rule_id,
            attempts = exhausted.attempts,
            error = %exhausted.last_error,
            "recurring transaction abandoned after exhausting retries"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn from_rule_uses_current_occurrence() {
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let rule = RecurringRule::new(
            AccountId::new(),
            TransactionType::Income,
            Amount::from_minor_units(250_000),
            RecurringInterval::Monthly,
            at,
            "salary",
        )
        .with_description("Payroll");

        let tx = MaterializedTransaction::from_rule(&rule);
        assert_eq!(tx.occurrence(), rule.occurrence());
        assert_eq!(tx.amount, rule.amount);
        assert!(tx.is_recurring);
        assert_eq!(tx.description.as_deref(), Some("Payroll"));

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "INCOME");
        assert_eq!(json["recurringInterval"], "MONTHLY");
    }

    #[test]
    fn exhausted_retries_message_names_job_and_rule() {
        let exhausted = ExhaustedRetries {
            job_id: JobId::new(),
            rule_id: RuleId::new(),
            attempts: 2,
            last_error: "ledger unavailable".to_string(),
        };
        let msg = exhausted.to_string();
        assert!(msg.contains(&exhausted.job_id.to_string()));
        assert!(msg.contains("after 2 attempt(s): ledger unavailable"));
    }
}
