use std::{
    fmt,
    ops::{Add, Sub},
    sync::OnceLock,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::TimeAmount;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

#[inline]
fn origin() -> Instant {
    *ORIGIN.get_or_init(Instant::now)
}

/// An absolute point on the monotonic clock, measured in nanoseconds of process uptime.
///
/// Virtual-time loops build deadlines with [`Deadline::uptime_nanoseconds`] and never
/// consult the real clock; real loops use [`Deadline::now`].
/// Adding a [`TimeAmount`] saturates at [`Deadline::distant_past`] and
/// [`Deadline::distant_future`], so a deadline never wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deadline {
    uptime_nanos: u64,
}

impl Deadline {
    /// Current instant of the process-wide monotonic clock.
    pub fn now() -> Self {
        let elapsed = origin().elapsed().as_nanos();
        Self::uptime_nanoseconds(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    #[inline]
    pub const fn uptime_nanoseconds(nanos: u64) -> Self {
        Self {
            uptime_nanos: nanos,
        }
    }

    #[inline]
    pub const fn distant_past() -> Self {
        Self::uptime_nanoseconds(0)
    }

    #[inline]
    pub const fn distant_future() -> Self {
        Self::uptime_nanoseconds(u64::MAX)
    }

    #[inline]
    pub const fn as_uptime_nanos(&self) -> u64 {
        self.uptime_nanos
    }

    /// Time left until `self` as seen from `earlier`, or zero if `self` already passed.
    pub fn saturating_duration_since(&self, earlier: Deadline) -> Duration {
        Duration::from_nanos(self.uptime_nanos.saturating_sub(earlier.uptime_nanos))
    }
}

impl Add<TimeAmount> for Deadline {
    type Output = Deadline;

    fn add(self, rhs: TimeAmount) -> Deadline {
        let delta = rhs.as_nanos();
        let nanos = if delta >= 0 {
            self.uptime_nanos.saturating_add(delta as u64)
        } else {
            self.uptime_nanos.saturating_sub(delta.unsigned_abs())
        };
        Deadline::uptime_nanoseconds(nanos)
    }
}

impl Sub<TimeAmount> for Deadline {
    type Output = Deadline;

    fn sub(self, rhs: TimeAmount) -> Deadline {
        self + (-rhs)
    }
}

impl Sub for Deadline {
    type Output = TimeAmount;

    fn sub(self, rhs: Deadline) -> TimeAmount {
        let diff = i128::from(self.uptime_nanos) - i128::from(rhs.uptime_nanos);
        let clamped = diff.clamp(i128::from(i64::MIN), i128::from(i64::MAX));
        TimeAmount::nanoseconds(clamped as i64)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uptime+{}ns", self.uptime_nanos)
    }
}
