//! Recurring rule storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use finman_core::{AccountId, DomainError, Entity, RuleId};
use finman_recurring::RecurringRule;

/// Durable set of recurring rules, keyed by [`RuleId`].
///
/// `advance` is the only write path the scheduler uses; it must be atomic per
/// rule so concurrent callers cannot interleave a read-modify-write.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert or replace a rule after validating it.
    async fn upsert(&self, rule: RecurringRule) -> Result<(), RuleStoreError>;

    async fn get(&self, id: RuleId) -> Result<Option<RecurringRule>, RuleStoreError>;

    /// Active rules with `next_run_at <= as_of`, ascending by `next_run_at`.
    async fn due_rules(&self, as_of: DateTime<Utc>) -> Result<Vec<RecurringRule>, RuleStoreError>;

    /// Record that the occurrence at `from` was materialized and move the rule
    /// to its next occurrence. Replaying the same `from` is a no-op.
    async fn advance(&self, id: RuleId, from: DateTime<Utc>) -> Result<RecurringRule, RuleStoreError>;

    /// Activate or deactivate a rule. Inactive rules are never returned by
    /// `due_rules`.
    async fn set_active(&self, id: RuleId, active: bool) -> Result<RecurringRule, RuleStoreError>;

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<RecurringRule>, RuleStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleStoreError {
    #[error("invalid rule: {0}")]
    Validation(#[from] DomainError),
    #[error("rule not found: {0}")]
    NotFound(RuleId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory rule store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<RuleId, RecurringRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<RuleId, RecurringRule>>, RuleStoreError> {
        self.rules
            .read()
            .map_err(|_| RuleStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<RuleId, RecurringRule>>, RuleStoreError> {
        self.rules
            .write()
            .map_err(|_| RuleStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn upsert(&self, rule: RecurringRule) -> Result<(), RuleStoreError> {
        rule.validate()?;
        self.write()?.insert(rule.id(), rule);
        Ok(())
    }

    async fn get(&self, id: RuleId) -> Result<Option<RecurringRule>, RuleStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn due_rules(&self, as_of: DateTime<Utc>) -> Result<Vec<RecurringRule>, RuleStoreError> {
        let mut due: Vec<_> = self
            .read()?
            .values()
            .filter(|r| r.is_due(as_of))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.next_run_at, r.id));
        Ok(due)
    }

    async fn advance(&self, id: RuleId, from: DateTime<Utc>) -> Result<RecurringRule, RuleStoreError> {
        let mut rules = self.write()?;
        let rule = rules.get_mut(&id).ok_or(RuleStoreError::NotFound(id))?;

        // Work on a copy so a failed validation leaves the stored rule intact.
        let mut next = rule.clone();
        if next.advance(from, Utc::now())? {
            next.validate()?;
            *rule = next;
        }
        Ok(rule.clone())
    }

    async fn set_active(&self, id: RuleId, active: bool) -> Result<RecurringRule, RuleStoreError> {
        let mut rules = self.write()?;
        let rule = rules.get_mut(&id).ok_or(RuleStoreError::NotFound(id))?;
        if rule.active != active {
            rule.active = active;
            rule.updated_at = Utc::now();
        }
        Ok(rule.clone())
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<RecurringRule>, RuleStoreError> {
        let mut rules: Vec<_> = self
            .read()?
            .values()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }
}
