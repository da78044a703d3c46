use core::str::FromStr;

use serde::{Deserialize, Serialize};

use finman_core::{DomainError, DomainResult, ValueObject};

/// Monetary amount in the smallest currency unit (cents).
///
/// Sign is not enforced here; rules and requests reject non-positive amounts
/// in their own validation so the error names the offending field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl ValueObject for Amount {}

impl Amount {
    pub const fn from_minor_units(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Convert a float as sent by form clients (`parseFloat("12.5")`).
    ///
    /// Values with more than two fractional digits are rejected rather than
    /// silently rounded.
    pub fn from_f64(value: f64) -> DomainResult<Self> {
        if !value.is_finite() {
            return Err(DomainError::validation("amount must be a finite number"));
        }
        let scaled = value * 100.0;
        let rounded = scaled.round();
        if (scaled - rounded).abs() > 1e-6 {
            return Err(DomainError::validation(
                "amount must have at most two decimal places",
            ));
        }
        if rounded.abs() > i64::MAX as f64 {
            return Err(DomainError::validation("amount is out of range"));
        }
        Ok(Self(rounded as i64))
    }
}

impl FromStr for Amount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };

        if whole.is_empty() && fraction.is_empty() {
            return Err(DomainError::validation(format!("invalid amount '{s}'")));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(DomainError::validation(format!("invalid amount '{s}'")));
        }
        if fraction.len() > 2 {
            return Err(DomainError::validation(
                "amount must have at most two decimal places",
            ));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| DomainError::validation("amount is out of range"))?
        };
        let cents: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().unwrap_or(0) * 10,
            _ => fraction.parse::<i64>().unwrap_or(0),
        };

        let minor = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(cents))
            .ok_or_else(|| DomainError::validation("amount is out of range"))?;

        Ok(Self(if negative { -minor } else { minor }))
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_form_values() {
        assert_eq!("12.34".parse::<Amount>().unwrap().minor_units(), 1234);
        assert_eq!("12.3".parse::<Amount>().unwrap().minor_units(), 1230);
        assert_eq!("12".parse::<Amount>().unwrap().minor_units(), 1200);
        assert_eq!(".5".parse::<Amount>().unwrap().minor_units(), 50);
        assert_eq!(" 0.01 ".parse::<Amount>().unwrap().minor_units(), 1);
        assert_eq!("-4.20".parse::<Amount>().unwrap().minor_units(), -420);
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["", ".", "abc", "1.234", "1,50", "1.2.3", "--1", "99999999999999999999"] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn converts_floats_without_rounding_surprises() {
        assert_eq!(Amount::from_f64(19.99).unwrap().minor_units(), 1999);
        assert_eq!(Amount::from_f64(0.1 + 0.2).unwrap().minor_units(), 30);
        assert!(Amount::from_f64(1.005).is_err());
        assert!(Amount::from_f64(f64::NAN).is_err());
    }

    #[test]
    fn displays_two_decimals() {
        assert_eq!(Amount::from_minor_units(1234).to_string(), "12.34");
        assert_eq!(Amount::from_minor_units(5).to_string(), "0.05");
        assert_eq!(Amount::from_minor_units(-250).to_string(), "-2.50");
    }
}
