//! Value object trait: equality by value, not identity.
//!
//! Amounts, intervals and transaction types are value objects: two amounts of
//! 12.50 are interchangeable, while two rules with identical fields are still
//! different rules.

/// Marker trait for immutable domain values compared by their attributes.
///
/// ```ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// struct Amount { minor_units: i64 }
///
/// impl ValueObject for Amount {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
