//! Fixed-point money types
//!
//! Limits are compared in integer cents and native amounts in wei. Binary
//! floating point never touches an amount.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Base units per whole native token (wei per ETH).
pub const WEI_PER_NATIVE: u128 = 1_000_000_000_000_000_000;

/// Maximum allowed difference between a stored fiat amount and the fiat value
/// of its stored native amount.
pub const CONVERSION_TOLERANCE: Cents = Cents(1);

/// Fiat amount in the smallest currency unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cents(u64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub const fn new(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars * 100)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Cents) -> Option<Cents> {
        self.0.checked_add(other.0).map(Cents)
    }

    pub fn saturating_sub(self, other: Cents) -> Cents {
        Cents(self.0.saturating_sub(other.0))
    }

    /// Absolute difference between two amounts.
    pub fn abs_diff(self, other: Cents) -> Cents {
        Cents(self.0.abs_diff(other.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for Cents {
    type Output = Cents;

    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Self {
        iter.fold(Cents::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Error parsing a decimal fiat amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount '{0}': expected a non-negative decimal with at most two fraction digits")]
pub struct ParseAmountError(String);

impl FromStr for Cents {
    type Err = ParseAmountError;

    /// Accepts `3300`, `3300.5`, `3300.50`, optionally prefixed with `$`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAmountError(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }

        let whole: u64 = whole.parse().map_err(|_| err())?;
        let frac: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| err())? * 10,
            _ => frac.parse().map_err(|_| err())?,
        };

        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .map(Cents)
            .ok_or_else(err)
    }
}

impl TryFrom<String> for Cents {
    type Error = ParseAmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cents> for String {
    fn from(value: Cents) -> Self {
        value.to_string()
    }
}

/// Native chain amount in base units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Wei(u128);

impl Wei {
    pub const ZERO: Wei = Wei(0);

    pub const fn new(wei: u128) -> Self {
        Self(wei)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    pub fn saturating_sub(self, other: Wei) -> Wei {
        Wei(self.0.saturating_sub(other.0))
    }

    /// Signed difference `self - other`.
    pub fn signed_diff(self, other: Wei) -> i128 {
        if self.0 >= other.0 {
            (self.0 - other.0).min(i128::MAX as u128) as i128
        } else {
            -((other.0 - self.0).min(i128::MAX as u128) as i128)
        }
    }
}

impl Add for Wei {
    type Output = Wei;

    fn add(self, rhs: Wei) -> Wei {
        Wei(self.0.saturating_add(rhs.0))
    }
}

impl std::iter::Sum for Wei {
    fn sum<I: Iterator<Item = Wei>>(iter: I) -> Self {
        iter.fold(Wei::ZERO, |acc, w| acc + w)
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Wei {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u128>()
            .map(Wei)
            .map_err(|_| ParseAmountError(s.to_string()))
    }
}

impl TryFrom<String> for Wei {
    type Error = ParseAmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Wei> for String {
    fn from(value: Wei) -> Self {
        value.to_string()
    }
}

/// Spot rate: fiat cents per whole native token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeRate {
    cents_per_native: u128,
}

impl NativeRate {
    /// Returns `None` for a zero rate, which cannot convert anything.
    pub fn from_cents_per_native(cents_per_native: u128) -> Option<Self> {
        (cents_per_native > 0).then_some(Self { cents_per_native })
    }

    /// From an 18-decimal fixed-point USD price as reported by the contract.
    pub fn from_usd_e18(price: u128) -> Option<Self> {
        Self::from_cents_per_native(price / 10_000_000_000_000_000)
    }

    pub fn cents_per_native(&self) -> u128 {
        self.cents_per_native
    }

    /// Fiat to native, rounding down so the donor never sends more than the
    /// admitted amount.
    pub fn to_native(&self, amount: Cents) -> Option<Wei> {
        (amount.0 as u128)
            .checked_mul(WEI_PER_NATIVE)
            .map(|scaled| Wei(scaled / self.cents_per_native))
    }

    /// Native to fiat, rounding half-up.
    pub fn to_fiat(&self, amount: Wei) -> Option<Cents> {
        let scaled = amount.0.checked_mul(self.cents_per_native)?;
        let cents = (scaled + WEI_PER_NATIVE / 2) / WEI_PER_NATIVE;
        u64::try_from(cents).ok().map(Cents)
    }

    /// Native to fiat, rounding up. Used when a ledger total feeds a limit check.
    pub fn to_fiat_ceil(&self, amount: Wei) -> Option<Cents> {
        let scaled = amount.0.checked_mul(self.cents_per_native)?;
        let cents = scaled.div_ceil(WEI_PER_NATIVE);
        u64::try_from(cents).ok().map(Cents)
    }

    /// Whether `native` is the conversion of `fiat` within [`CONVERSION_TOLERANCE`].
    pub fn is_consistent(&self, fiat: Cents, native: Wei) -> bool {
        match self.to_fiat(native) {
            Some(back) => back.abs_diff(fiat) <= CONVERSION_TOLERANCE,
            None => false,
        }
    }
}

impl fmt::Display for NativeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02}/native",
            self.cents_per_native / 100,
            self.cents_per_native % 100
        )
    }
}
