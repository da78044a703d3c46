//! Create/update transaction requests coming from the UI/API layer.
//!
//! The payload mirrors the transaction form (`camelCase`, loosely typed). All
//! parsing happens in [`TransactionRequest::validate`], which either returns a
//! fully typed [`ValidatedTransaction`] or a `DomainError::Validation`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finman_core::{AccountId, DomainError, DomainResult};

use crate::amount::Amount;
use crate::interval::RecurringInterval;
use crate::rule::{RecurringRule, TransactionType};

/// Forms send either `12.5` or `"12.50"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Number(f64),
    Text(String),
}

impl AmountInput {
    fn parse(&self) -> DomainResult<Amount> {
        match self {
            AmountInput::Number(n) => Amount::from_f64(*n),
            AmountInput::Text(s) => s.parse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: AmountInput,
    pub account_id: String,
    #[serde(default)]
    pub category: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurring_interval: Option<String>,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    pub kind: TransactionType,
    pub amount: Amount,
    pub account_id: AccountId,
    pub category: String,
    pub date: DateTime<Utc>,
    pub description: Option<String>,
    /// `Some` iff the request asked for a recurring schedule.
    pub recurring_interval: Option<RecurringInterval>,
}

impl TransactionRequest {
    pub fn validate(&self) -> DomainResult<ValidatedTransaction> {
        let kind: TransactionType = self.kind.parse()?;

        let amount = self.amount.parse()?;
        if !amount.is_positive() {
            return Err(DomainError::validation("amount must be positive"));
        }

        let account_id: AccountId = self
            .account_id
            .parse()
            .map_err(|_| DomainError::validation("accountId is required"))?;

        let category = self.category.trim();
        if category.is_empty() {
            return Err(DomainError::validation("category is required"));
        }

        let recurring_interval = match (self.is_recurring, self.recurring_interval.as_deref()) {
            (true, None) => {
                return Err(DomainError::validation(
                    "recurringInterval is required for recurring transactions",
                ));
            }
            (true, Some(raw)) if raw.trim().is_empty() => {
                return Err(DomainError::validation(
                    "recurringInterval is required for recurring transactions",
                ));
            }
            (true, Some(raw)) => Some(raw.parse::<RecurringInterval>()?),
            // Forms keep the last selected interval around after the switch is turned off.
            (false, _) => None,
        };

        let description = self
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        Ok(ValidatedTransaction {
            kind,
            amount,
            account_id,
            category: category.to_string(),
            date: self.date,
            description,
            recurring_interval,
        })
    }
}

impl ValidatedTransaction {
    /// The rule that keeps this transaction recurring, if one was requested.
    ///
    /// The request itself records the occurrence at `date`, so the rule's
    /// first scheduled run is one interval later.
    pub fn recurring_rule(&self) -> DomainResult<Option<RecurringRule>> {
        let Some(interval) = self.recurring_interval else {
            return Ok(None);
        };

        let first_run_at = interval.next_after(self.date).ok_or_else(|| {
            DomainError::validation(format!("date {} is out of range", self.date))
        })?;

        let mut rule = RecurringRule::new(
            self.account_id,
            self.kind,
            self.amount,
            interval,
            first_run_at,
            self.category.clone(),
        );
        rule.description = self.description.clone();
        rule.validate()?;
        Ok(Some(rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(overrides: serde_json::Value) -> TransactionRequest {
        let mut base = json!({
            "type": "EXPENSE",
            "amount": 42.5,
            "accountId": AccountId::new().to_string(),
            "category": "groceries",
            "date": "2024-03-31T10:00:00Z",
            "description": "Weekly shop",
            "isRecurring": false
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn one_off_transaction_validates_without_rule() {
        let tx = payload(json!({})).validate().unwrap();
        assert_eq!(tx.kind, TransactionType::Expense);
        assert_eq!(tx.amount.minor_units(), 4250);
        assert_eq!(tx.recurring_interval, None);
        assert_eq!(tx.recurring_rule().unwrap(), None);
    }

    #[test]
    fn recurring_requires_an_interval() {
        let err = payload(json!({"isRecurring": true})).validate().unwrap_err();
        assert!(err.to_string().contains("recurringInterval"));

        let err = payload(json!({"isRecurring": true, "recurringInterval": ""}))
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn recurring_rejects_unknown_interval() {
        let err = payload(json!({"isRecurring": true, "recurringInterval": "HOURLY"}))
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn interval_is_ignored_when_not_recurring() {
        let tx = payload(json!({"recurringInterval": "WEEKLY"})).validate().unwrap();
        assert_eq!(tx.recurring_interval, None);
    }

    #[test]
    fn recurring_rule_starts_one_interval_after_date() {
        let tx = payload(json!({"isRecurring": true, "recurringInterval": "MONTHLY", "amount": "9.99"}))
            .validate()
            .unwrap();
        let rule = tx.recurring_rule().unwrap().unwrap();

        assert_eq!(rule.interval, RecurringInterval::Monthly);
        assert_eq!(rule.amount.minor_units(), 999);
        assert_eq!(rule.next_run_at, Utc.with_ymd_and_hms(2024, 4, 30, 10, 0, 0).unwrap());
        assert_eq!(rule.description.as_deref(), Some("Weekly shop"));
        assert!(rule.active);
    }

    #[test]
    fn rejects_bad_amounts_and_fields() {
        assert!(payload(json!({"amount": 0})).validate().is_err());
        assert!(payload(json!({"amount": "-3"})).validate().is_err());
        assert!(payload(json!({"amount": "abc"})).validate().is_err());
        assert!(payload(json!({"type": "TRANSFER"})).validate().is_err());
        assert!(payload(json!({"accountId": ""})).validate().is_err());
        assert!(payload(json!({"category": "  "})).validate().is_err());
    }

    #[test]
    fn blank_description_becomes_none() {
        let tx = payload(json!({"description": "   "})).validate().unwrap();
        assert_eq!(tx.description, None);
    }
}
