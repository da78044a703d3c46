//! Postgres-backed rule store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RuleStoreError |
//! |------------|----------------|
//! | Database (check constraint `23514`) | `Validation` |
//! | Database (other) | `Storage` |
//! | PoolClosed / other | `Storage` |
//!
//! `advance` locks the rule row (`SELECT ... FOR UPDATE`) for the duration of
//! the read-modify-write, so concurrent schedulers serialize per rule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use finman_core::{AccountId, DomainError, RuleId};
use finman_recurring::{Amount, RecurringRule};

use super::store::{RuleStore, RuleStoreError};

const RULE_COLUMNS: &str = r#"
    id, account_id, kind, amount_minor, interval, next_run_at, last_run_at,
    category, description, active, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresRuleStore {
    pool: Arc<PgPool>,
}

impl PostgresRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `recurring_rules` table and its due-index if missing.
    pub async fn ensure_schema(&self) -> Result<(), RuleStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_rules (
                id           UUID PRIMARY KEY,
                account_id   UUID NOT NULL,
                kind         TEXT NOT NULL,
                amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
                interval     TEXT NOT NULL,
                next_run_at  TIMESTAMPTZ NOT NULL,
                last_run_at  TIMESTAMPTZ NULL,
                category     TEXT NOT NULL,
                description  TEXT NULL,
                active       BOOLEAN NOT NULL DEFAULT TRUE,
                created_at   TIMESTAMPTZ NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_recurring_rules", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS recurring_rules_due_idx
                ON recurring_rules (next_run_at)
                WHERE active
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_recurring_rules_due_idx", e))?;

        Ok(())
    }

    async fn lock_rule(
        tx: &mut Transaction<'_, Postgres>,
        id: RuleId,
    ) -> Result<RecurringRule, RuleStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM recurring_rules WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_rule", e))?
        .ok_or(RuleStoreError::NotFound(id))?;

        rule_from_row(&row)
    }

    async fn write_state(
        tx: &mut Transaction<'_, Postgres>,
        rule: &RecurringRule,
    ) -> Result<(), RuleStoreError> {
        sqlx::query(
            r#"
            UPDATE recurring_rules
            SET next_run_at = $2, last_run_at = $3, active = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(rule.next_run_at)
        .bind(rule.last_run_at)
        .bind(rule.active)
        .bind(rule.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_rule_state", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RuleStore for PostgresRuleStore {
    #[instrument(skip(self, rule), fields(rule_id = %rule.id), err)]
    async fn upsert(&self, rule: RecurringRule) -> Result<(), RuleStoreError> {
        rule.validate()?;

        sqlx::query(
            r#"
            INSERT INTO recurring_rules (
                id, account_id, kind, amount_minor, interval, next_run_at, last_run_at,
                category, description, active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                kind = EXCLUDED.kind,
                amount_minor = EXCLUDED.amount_minor,
                interval = EXCLUDED.interval,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = EXCLUDED.last_run_at,
                category = EXCLUDED.category,
                description = EXCLUDED.description,
                active = EXCLUDED.active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(rule.account_id.as_uuid())
        .bind(rule.kind.as_str())
        .bind(rule.amount.minor_units())
        .bind(rule.interval.as_str())
        .bind(rule.next_run_at)
        .bind(rule.last_run_at)
        .bind(&rule.category)
        .bind(&rule.description)
        .bind(rule.active)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_rule", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: RuleId) -> Result<Option<RecurringRule>, RuleStoreError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM recurring_rules WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_rule", e))?;

        row.as_ref().map(rule_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn due_rules(&self, as_of: DateTime<Utc>) -> Result<Vec<RecurringRule>, RuleStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RULE_COLUMNS} FROM recurring_rules
            WHERE active AND next_run_at <= $1
            ORDER BY next_run_at ASC, id ASC
            "#
        ))
        .bind(as_of)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_rules", e))?;

        rows.iter().map(rule_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn advance(&self, id: RuleId, from: DateTime<Utc>) -> Result<RecurringRule, RuleStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut rule = Self::lock_rule(&mut tx, id).await?;
        if rule.advance(from, Utc::now())? {
            rule.validate()?;
            Self::write_state(&mut tx, &rule).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(rule)
    }

    #[instrument(skip(self), err)]
    async fn set_active(&self, id: RuleId, active: bool) -> Result<RecurringRule, RuleStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut rule = Self::lock_rule(&mut tx, id).await?;
        if rule.active != active {
            rule.active = active;
            rule.updated_at = Utc::now();
            Self::write_state(&mut tx, &rule).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(rule)
    }

    #[instrument(skip(self), err)]
    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<RecurringRule>, RuleStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM recurring_rules WHERE account_id = $1 ORDER BY created_at ASC"
        ))
        .bind(account_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_account", e))?;

        rows.iter().map(rule_from_row).collect()
    }
}

fn rule_from_row(row: &sqlx::postgres::PgRow) -> Result<RecurringRule, RuleStoreError> {
    let decode = |e: sqlx::Error| RuleStoreError::Storage(format!("failed to decode rule row: {e}"));
    let corrupt = |e: DomainError| RuleStoreError::Storage(format!("corrupt rule row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let interval: String = row.try_get("interval").map_err(decode)?;

    Ok(RecurringRule {
        id: RuleId::from_uuid(row.try_get("id").map_err(decode)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(decode)?),
        kind: kind.parse().map_err(corrupt)?,
        amount: Amount::from_minor_units(row.try_get("amount_minor").map_err(decode)?),
        interval: interval.parse().map_err(corrupt)?,
        next_run_at: row.try_get("next_run_at").map_err(decode)?,
        last_run_at: row.try_get("last_run_at").map_err(decode)?,
        category: row.try_get("category").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        active: row.try_get("active").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RuleStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => RuleStoreError::Validation(DomainError::validation(msg)),
                _ => RuleStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RuleStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => RuleStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
