use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finman_core::{AccountId, DomainError, DomainResult, Entity, RuleId, ValueObject};

use crate::amount::Amount;
use crate::interval::RecurringInterval;

/// Direction of money flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Expense,
    Income,
}

impl ValueObject for TransactionType {}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Expense => "EXPENSE",
            TransactionType::Income => "INCOME",
        }
    }
}

impl FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EXPENSE" => Ok(TransactionType::Expense),
            "INCOME" => Ok(TransactionType::Income),
            _ => Err(DomainError::validation(format!(
                "type must be EXPENSE or INCOME (got '{s}')"
            ))),
        }
    }
}

impl core::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one scheduled occurrence of a rule.
///
/// Executors use it to stay idempotent under at-least-once delivery: two
/// materializations with the same key must produce one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OccurrenceKey {
    pub rule_id: RuleId,
    pub occurrence_at: DateTime<Utc>,
}

impl core::fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.rule_id, self.occurrence_at.to_rfc3339())
    }
}

/// Template for a transaction that repeats on a fixed calendar interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub id: RuleId,
    pub account_id: AccountId,
    pub kind: TransactionType,
    pub amount: Amount,
    pub interval: RecurringInterval,
    /// When the next materialization is due.
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub category: String,
    pub description: Option<String>,
    /// Inactive rules are kept for history but never scheduled.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for RecurringRule {
    type Id = RuleId;

    fn id(&self) -> RuleId {
        self.id
    }
}

impl RecurringRule {
    /// Create an active rule whose first occurrence is `first_run_at`.
    pub fn new(
        account_id: AccountId,
        kind: TransactionType,
        amount: Amount,
        interval: RecurringInterval,
        first_run_at: DateTime<Utc>,
        category: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId::new(),
            account_id,
            kind,
            amount,
            interval,
            next_run_at: first_run_at,
            last_run_at: None,
            category: category.into(),
            description: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: RuleId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Check the invariants every stored rule must satisfy.
    pub fn validate(&self) -> DomainResult<()> {
        if !self.amount.is_positive() {
            return Err(DomainError::validation(format!(
                "amount must be positive (got {})",
                self.amount
            )));
        }
        if self.category.trim().is_empty() {
            return Err(DomainError::validation("category is required"));
        }
        if let Some(last) = self.last_run_at {
            if self.next_run_at <= last {
                return Err(DomainError::invariant(format!(
                    "next_run_at {} must be after last_run_at {}",
                    self.next_run_at, last
                )));
            }
        }
        Ok(())
    }

    pub fn is_due(&self, as_of: DateTime<Utc>) -> bool {
        self.active && self.next_run_at <= as_of
    }

    pub fn occurrence(&self) -> OccurrenceKey {
        OccurrenceKey {
            rule_id: self.id,
            occurrence_at: self.next_run_at,
        }
    }

    /// Record a materialization of the occurrence at `from` and move to the next one.
    ///
    /// Deterministic in `from`. A stale `from` whose successor is earlier than
    /// the current `next_run_at` leaves the rule untouched, so replays never
    /// move the schedule backwards. Returns whether anything changed.
    pub fn advance(&mut self, from: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<bool> {
        let next = self.interval.next_after(from).ok_or_else(|| {
            DomainError::invariant(format!("{} after {from} is out of range", self.interval))
        })?;

        if next < self.next_run_at {
            return Ok(false);
        }
        if next == self.next_run_at && self.last_run_at == Some(from) {
            return Ok(false);
        }

        self.next_run_at = next;
        self.last_run_at = Some(from);
        self.updated_at = now;
        Ok(true)
    }
}
