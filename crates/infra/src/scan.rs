//! Receipt and statement scanning with retries.
//!
//! The scanner is an external service behind [`ScanService`]. [`ScanClient`]
//! validates uploads before any call goes out and retries transient failures
//! with the same policy the scheduler uses.

use std::time::Duration;

use tracing::{info, instrument};

use finman_core::{AccountId, DomainError};
use finman_recurring::{ScanKind, ScanUpload, ScannedReceipt, TransactionRequest};

use crate::jobs::{RetryError, RetryPolicy, Retryable, retry_with_policy};

/// Failure reported by a scanner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    /// The scanner could not be reached or was overloaded.
    #[error("scanner unavailable: {0}")]
    Unavailable(String),
    /// The document could not be read; retrying will not help.
    #[error("could not read document: {0}")]
    Unreadable(String),
}

impl Retryable for ScanError {
    fn is_retryable(&self) -> bool {
        matches!(self, ScanError::Unavailable(_))
    }
}

/// External document scanner.
#[async_trait::async_trait]
pub trait ScanService: Send + Sync {
    async fn scan_receipt(&self, upload: &ScanUpload) -> Result<ScannedReceipt, ScanError>;

    /// Extract every transaction on a statement, attributed to `account_id`.
    async fn scan_statement(
        &self,
        upload: &ScanUpload,
        account_id: AccountId,
    ) -> Result<Vec<TransactionRequest>, ScanError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanFailure {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Exhausted(#[from] RetryError<ScanError>),
}

/// Validating, retrying front for a [`ScanService`].
#[derive(Debug, Clone)]
pub struct ScanClient<S> {
    service: S,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<S: ScanService> ScanClient<S> {
    pub fn new(service: S, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            service,
            policy,
            timeout,
        }
    }

    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, bytes = upload.bytes.len()), err)]
    pub async fn scan_receipt(&self, upload: &ScanUpload) -> Result<ScannedReceipt, ScanFailure> {
        expect_kind(upload, ScanKind::Receipt)?;
        upload.validate()?;

        let receipt = retry_with_policy("scan_receipt", &self.policy, self.timeout, |_| {
            self.service.scan_receipt(upload)
        })
        .await?;

        info!(amount = receipt.amount, "receipt scanned");
        Ok(receipt)
    }

    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, bytes = upload.bytes.len(), account_id = %account_id), err)]
    pub async fn scan_statement(
        &self,
        upload: &ScanUpload,
        account_id: AccountId,
    ) -> Result<Vec<TransactionRequest>, ScanFailure> {
        expect_kind(upload, ScanKind::Statement)?;
        upload.validate()?;

        let transactions = retry_with_policy("scan_statement", &self.policy, self.timeout, |_| {
            self.service.scan_statement(upload, account_id)
        })
        .await?;

        info!(count = transactions.len(), "statement scanned");
        Ok(transactions)
    }
}

fn expect_kind(upload: &ScanUpload, kind: ScanKind) -> Result<(), DomainError> {
    if upload.kind != kind {
        return Err(DomainError::validation(format!(
            "expected a {kind:?} upload, got {:?}",
            upload.kind
        )));
    }
    Ok(())
}
