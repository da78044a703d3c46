//! `finman-recurring`
//!
//! **Responsibility:** the recurring-transaction domain.
//!
//! - Rules describing how a transaction repeats (`RecurringRule`)
//! - Calendar arithmetic for each interval (`RecurringInterval`)
//! - Validation of incoming transaction requests and scan uploads
//!
//! Nothing here performs IO; stores and schedulers live in `finman-infra`.

pub mod amount;
pub mod interval;
pub mod request;
pub mod rule;
pub mod scan;

pub use amount::Amount;
pub use interval::RecurringInterval;
pub use request::{AmountInput, TransactionRequest, ValidatedTransaction};
pub use rule::{OccurrenceKey, RecurringRule, TransactionType};
pub use scan::{MAX_SCAN_UPLOAD_BYTES, STATEMENT_CONTENT_TYPE, ScanKind, ScanUpload, ScannedReceipt};
