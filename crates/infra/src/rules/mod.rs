//! Recurring rule persistence.

pub mod postgres;
pub mod store;

pub use postgres::PostgresRuleStore;
pub use store::{InMemoryRuleStore, RuleStore, RuleStoreError};
