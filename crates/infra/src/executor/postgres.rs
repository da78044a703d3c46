//! Postgres-backed transaction ledger.
//!
//! A unique index on `(rule_id, occurrence_at)` makes materialization
//! idempotent: a replayed insert hits `ON CONFLICT DO NOTHING` and the
//! existing row is returned instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use finman_core::{AccountId, DomainError, RuleId, TransactionId};
use finman_recurring::{Amount, RecurringRule};

use super::{ExecutorError, JobExecutor, MaterializedTransaction};

const TRANSACTION_COLUMNS: &str = r#"
    id, rule_id, account_id, kind, amount_minor, category, description,
    occurrence_at, is_recurring, recurring_interval
"#;

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ExecutorError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id                 UUID PRIMARY KEY,
                rule_id            UUID NOT NULL,
                account_id         UUID NOT NULL,
                kind               TEXT NOT NULL,
                amount_minor       BIGINT NOT NULL,
                category           TEXT NOT NULL,
                description        TEXT NULL,
                occurrence_at      TIMESTAMPTZ NOT NULL,
                is_recurring       BOOLEAN NOT NULL,
                recurring_interval TEXT NOT NULL,
                created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_transactions", e))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS transactions_occurrence_idx
                ON transactions (rule_id, occurrence_at)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_transactions_occurrence_idx", e))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl JobExecutor for PostgresLedger {
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, occurrence_at = %rule.next_run_at), err)]
    async fn materialize(&self, rule: &RecurringRule) -> Result<MaterializedTransaction, ExecutorError> {
        let tx = MaterializedTransaction::from_rule(rule);

        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, rule_id, account_id, kind, amount_minor, category, description,
                occurrence_at, is_recurring, recurring_interval
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (rule_id, occurrence_at) DO NOTHING
            "#,
        )
        .bind(tx.id.as_uuid())
        .bind(tx.rule_id.as_uuid())
        .bind(tx.account_id.as_uuid())
        .bind(tx.kind.as_str())
        .bind(tx.amount.minor_units())
        .bind(&tx.category)
        .bind(&tx.description)
        .bind(tx.date)
        .bind(tx.is_recurring)
        .bind(tx.recurring_interval.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?
        .rows_affected();

        if inserted == 1 {
            return Ok(tx);
        }

        debug!("occurrence already materialized, returning existing transaction");
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE rule_id = $1 AND occurrence_at = $2"
        ))
        .bind(tx.rule_id.as_uuid())
        .bind(tx.date)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_transaction", e))?;

        transaction_from_row(&row)
    }
}

fn transaction_from_row(row: &sqlx::postgres::PgRow) -> Result<MaterializedTransaction, ExecutorError> {
    let decode = |e: sqlx::Error| ExecutorError::Transient(format!("failed to decode transaction row: {e}"));
    let corrupt = |e: DomainError| ExecutorError::Transient(format!("corrupt transaction row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let interval: String = row.try_get("recurring_interval").map_err(decode)?;
    let date: DateTime<Utc> = row.try_get("occurrence_at").map_err(decode)?;

    Ok(MaterializedTransaction {
        id: TransactionId::from_uuid(row.try_get("id").map_err(decode)?),
        rule_id: RuleId::from_uuid(row.try_get("rule_id").map_err(decode)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(decode)?),
        kind: kind.parse().map_err(corrupt)?,
        amount: Amount::from_minor_units(row.try_get("amount_minor").map_err(decode)?),
        category: row.try_get("category").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        date,
        is_recurring: row.try_get("is_recurring").map_err(decode)?,
        recurring_interval: interval.parse().map_err(corrupt)?,
    })
}

// Every database failure is treated as transient; the retry policy bounds the cost.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ExecutorError {
    match err {
        sqlx::Error::Database(db_err) => {
            ExecutorError::Transient(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            ExecutorError::Transient(format!("connection pool closed in {}", operation))
        }
        _ => ExecutorError::Transient(format!("sqlx error in {}: {}", operation, err)),
    }
}
