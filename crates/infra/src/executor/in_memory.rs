//! In-memory transaction ledger.

use std::collections::HashMap;
use std::sync::RwLock;

use finman_core::{AccountId, RuleId};
use finman_recurring::{OccurrenceKey, RecurringRule};

use super::{ExecutorError, JobExecutor, MaterializedTransaction};

/// Executor that records transactions in a map keyed by occurrence.
///
/// Materializing an occurrence twice returns the first transaction.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    transactions: RwLock<HashMap<OccurrenceKey, MaterializedTransaction>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &OccurrenceKey) -> Option<MaterializedTransaction> {
        self.transactions.read().ok()?.get(key).cloned()
    }

    /// Transactions of one rule ordered by date.
    pub fn by_rule(&self, rule_id: RuleId) -> Vec<MaterializedTransaction> {
        let mut result: Vec<_> = match self.transactions.read() {
            Ok(t) => t.values().filter(|tx| tx.rule_id == rule_id).cloned().collect(),
            Err(_) => return Vec::new(),
        };
        result.sort_by_key(|tx| tx.date);
        result
    }

    pub fn by_account(&self, account_id: AccountId) -> Vec<MaterializedTransaction> {
        let mut result: Vec<_> = match self.transactions.read() {
            Ok(t) => t.values().filter(|tx| tx.account_id == account_id).cloned().collect(),
            Err(_) => return Vec::new(),
        };
        result.sort_by_key(|tx| tx.date);
        result
    }
}

#[async_trait::async_trait]
impl JobExecutor for InMemoryLedger {
    async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError> {
        let mut transactions = self
            .transactions
            .write()
            .map_err(|_| ExecutorError::Transient("ledger lock poisoned".to_string()))?;

        let tx = transactions
            .entry(rule.occurrence())
            .or_insert_with(|| MaterializedTransaction::from_rule(rule));
        Ok(tx.clone())
    }
}
