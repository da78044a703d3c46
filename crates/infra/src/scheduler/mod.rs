//! Recurring transaction scheduling.
//!
//! - `Scheduler`: one `tick(now)` selects due rules, creates jobs and runs them
//! - `InFlightRegistry`: per-rule markers that keep one job in flight per rule
//! - `SchedulerRunner`: drives `tick` on a timer until shut down

pub mod dispatcher;
pub mod in_flight;
pub mod runner;

pub use dispatcher::{Scheduler, SchedulerError, TickReport};
pub use in_flight::InFlightRegistry;
pub use runner::{RunnerHandle, SchedulerRunner};
