//! Uploads handed to the external receipt/statement scanners.
//!
//! The scanners themselves are collaborators; this module only decides whether
//! an upload may be sent at all and how a scanned receipt pre-fills a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finman_core::{DomainError, DomainResult};

use crate::request::{AmountInput, TransactionRequest};

/// Upper bound for a single receipt or statement upload (5 MiB).
pub const MAX_SCAN_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// The only content type accepted for statements.
pub const STATEMENT_CONTENT_TYPE: &str = "application/pdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// A photo of a single receipt.
    Receipt,
    /// A bank statement producing many transactions at once.
    Statement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanUpload {
    pub kind: ScanKind,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ScanUpload {
    pub fn new(
        kind: ScanKind,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.bytes.is_empty() {
            return Err(DomainError::validation("uploaded file is empty"));
        }
        if self.bytes.len() > MAX_SCAN_UPLOAD_BYTES {
            return Err(DomainError::validation(format!(
                "file size should be less than 5MB (got {} bytes)",
                self.bytes.len()
            )));
        }
        let content_type = self.content_type.trim().to_ascii_lowercase();
        match self.kind {
            ScanKind::Receipt if !content_type.starts_with("image/") => {
                Err(DomainError::validation(format!(
                    "receipts must be images (got '{}')",
                    self.content_type
                )))
            }
            ScanKind::Statement if content_type != STATEMENT_CONTENT_TYPE => {
                Err(DomainError::validation(format!(
                    "statements must be PDF files (got '{}')",
                    self.content_type
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Fields a receipt scanner extracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedReceipt {
    pub amount: f64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
}

impl ScannedReceipt {
    /// Overwrite the scanned fields of a draft request, leaving the rest alone.
    pub fn apply_to(&self, request: &mut TransactionRequest) {
        request.amount = AmountInput::Text(format!("{:.2}", self.amount));
        request.date = self.date;
        if let Some(description) = self.description.as_ref().or(self.merchant_name.as_ref()) {
            request.description = Some(description.clone());
        }
        if let Some(category) = &self.category {
            request.category = category.clone();
        }
    }
}
