use core::str::FromStr;

use chrono::{DateTime, Days, Months, Utc};
use serde::{Deserialize, Serialize};

use finman_core::{DomainError, ValueObject};

/// How often a recurring transaction happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringInterval {
    Daily,
    Weekly,
    /// A calendar month of variable length.
    Monthly,
    Yearly,
}

impl ValueObject for RecurringInterval {}

impl RecurringInterval {
    pub const ALL: [RecurringInterval; 4] = [
        RecurringInterval::Daily,
        RecurringInterval::Weekly,
        RecurringInterval::Monthly,
        RecurringInterval::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringInterval::Daily => "DAILY",
            RecurringInterval::Weekly => "WEEKLY",
            RecurringInterval::Monthly => "MONTHLY",
            RecurringInterval::Yearly => "YEARLY",
        }
    }

    /// The occurrence one interval unit after `from`.
    ///
    /// Calendar units clamp instead of overflowing: Jan 31 + 1 month is the
    /// last day of February, and Feb 29 + 1 year is Feb 28. The time of day
    /// is preserved. Returns `None` only when the result leaves chrono's
    /// representable range.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RecurringInterval::Daily => from.checked_add_days(Days::new(1)),
            RecurringInterval::Weekly => from.checked_add_days(Days::new(7)),
            RecurringInterval::Monthly => from.checked_add_months(Months::new(1)),
            RecurringInterval::Yearly => from.checked_add_months(Months::new(12)),
        }
    }
}

impl FromStr for RecurringInterval {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Ok(RecurringInterval::Daily),
            "WEEKLY" => Ok(RecurringInterval::Weekly),
            "MONTHLY" => Ok(RecurringInterval::Monthly),
            "YEARLY" => Ok(RecurringInterval::Yearly),
            _ => Err(DomainError::validation(format!(
                "recurring interval must be one of DAILY, WEEKLY, MONTHLY, YEARLY (got '{s}')"
            ))),
        }
    }
}

impl core::fmt::Display for RecurringInterval {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
