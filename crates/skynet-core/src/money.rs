//! Fixed-point monetary amounts.
//!
//! Balances and costs are tracked in micro-units (1e-6 of the account
//! currency) as a signed `i64` so arithmetic never drifts the way
//! floating-point accumulation would over thousands of small LLM-call
//! charges. No decimal crate is introduced; this mirrors the newtype-around-
//! a-primitive idiom already used for `UserId`/`SessionKey` in this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

const SCALE: i64 = 1_000_000;

/// A monetary amount, stored as micro-units. `Money::from_units(1.5)` and
/// `Money(1_500_000)` are the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Build from a whole-and-fractional unit amount, e.g. `2.50`.
    pub fn from_units(units: f64) -> Self {
        Money((units * SCALE as f64).round() as i64)
    }

    /// Build from a raw micro-unit count.
    pub fn from_micros(micros: i64) -> Self {
        Money(micros)
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn as_units(&self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.as_units())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_units_round_trips() {
        let m = Money::from_units(2.50);
        assert_eq!(m.micros(), 2_500_000);
        assert_eq!(m.as_units(), 2.5);
    }

    #[test]
    fn arithmetic_is_exact() {
        let mut balance = Money::from_units(10.0);
        for _ in 0..10 {
            balance -= Money::from_units(0.1);
        }
        assert_eq!(balance, Money::from_units(9.0));
    }

    #[test]
    fn checked_sub_detects_overdraw() {
        let balance = Money::from_units(1.0);
        let cost = Money::from_units(2.0);
        assert!(balance.checked_sub(cost).unwrap().is_negative());
    }

    #[test]
    fn display_formats_six_decimals() {
        assert_eq!(Money::from_units(1.5).to_string(), "1.500000");
    }
}
