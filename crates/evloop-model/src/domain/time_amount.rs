use std::{
    fmt,
    ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::Nanos;

/// A signed amount of elapsed time with nanosecond resolution.
///
/// Arithmetic saturates at the `i64` bounds instead of wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeAmount {
    nanos: Nanos,
}

impl TimeAmount {
    pub const ZERO: TimeAmount = TimeAmount { nanos: 0 };

    #[inline]
    pub const fn nanoseconds(amount: i64) -> Self {
        Self { nanos: amount }
    }

    #[inline]
    pub const fn microseconds(amount: i64) -> Self {
        Self::nanoseconds(amount.saturating_mul(1_000))
    }

    #[inline]
    pub const fn milliseconds(amount: i64) -> Self {
        Self::nanoseconds(amount.saturating_mul(1_000_000))
    }

    #[inline]
    pub const fn seconds(amount: i64) -> Self {
        Self::nanoseconds(amount.saturating_mul(1_000_000_000))
    }

    #[inline]
    pub const fn minutes(amount: i64) -> Self {
        Self::seconds(amount.saturating_mul(60))
    }

    #[inline]
    pub const fn hours(amount: i64) -> Self {
        Self::minutes(amount.saturating_mul(60))
    }

    /// Total amount in nanoseconds.
    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.nanos
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.nanos < 0
    }

    /// Converts to a std duration; negative amounts clamp to zero.
    pub fn to_std(&self) -> Duration {
        if self.nanos <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.nanos as u64)
        }
    }
}

impl From<Duration> for TimeAmount {
    fn from(d: Duration) -> Self {
        Self::nanoseconds(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Add for TimeAmount {
    type Output = TimeAmount;

    fn add(self, rhs: TimeAmount) -> TimeAmount {
        TimeAmount::nanoseconds(self.nanos.saturating_add(rhs.nanos))
    }
}

impl AddAssign for TimeAmount {
    fn add_assign(&mut self, rhs: TimeAmount) {
        *self = *self + rhs;
    }
}

impl Sub for TimeAmount {
    type Output = TimeAmount;

    fn sub(self, rhs: TimeAmount) -> TimeAmount {
        TimeAmount::nanoseconds(self.nanos.saturating_sub(rhs.nanos))
    }
}

impl SubAssign for TimeAmount {
    fn sub_assign(&mut self, rhs: TimeAmount) {
        *self = *self - rhs;
    }
}

impl Mul<i64> for TimeAmount {
    type Output = TimeAmount;

    fn mul(self, rhs: i64) -> TimeAmount {
        TimeAmount::nanoseconds(self.nanos.saturating_mul(rhs))
    }
}

impl Neg for TimeAmount {
    type Output = TimeAmount;

    fn neg(self) -> TimeAmount {
        TimeAmount::nanoseconds(self.nanos.saturating_neg())
    }
}

impl fmt::Display for TimeAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}
