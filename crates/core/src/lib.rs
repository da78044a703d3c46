//! `finman-core`: domain foundation building blocks.
//!
//! Identifiers, the shared domain error type and the small set of traits the
//! finance domain crates build on. No IO lives here.

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, RuleId, TransactionId};
pub use value_object::ValueObject;
