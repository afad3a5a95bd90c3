//! Time primitives for measurement scheduling.
//!
//! The filter orders measurements on a nanosecond-resolution [`TimePoint`] axis.
//! `TimePoint` is totally ordered and hashable so it can key the per-channel
//! measurement maps, and it carries `MIN`/`MAX` sentinels used by the timelines
//! ("never processed" and "no measurement" respectively). [`Duration`] is signed,
//! which keeps expressions such as `start + Duration::from_sec(-0.1)` natural when
//! constructing measurement sequences around a reference instant.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: f64 = 1e9;

/// A signed span of time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    /// Build a duration from (possibly negative or fractional) seconds.
    pub fn from_sec(seconds: f64) -> Self {
        Duration((seconds * NANOS_PER_SEC).round() as i64)
    }

    pub fn from_millis(millis: i64) -> Self {
        Duration(millis * 1_000_000)
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Duration(nanos)
    }

    pub fn to_sec(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Duration {
    type Output = Duration;
    fn neg(self) -> Duration {
        Duration(self.0.saturating_neg())
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.to_sec())
    }
}

/// An instant on the filter time axis.
///
/// Arithmetic saturates at the sentinels so expressions like
/// `TimePoint::MIN + min_wait` stay well defined inside the timeline latency
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(i64);

impl TimePoint {
    /// Sentinel for "before any representable instant".
    pub const MIN: TimePoint = TimePoint(i64::MIN);
    /// Sentinel for "after any representable instant".
    pub const MAX: TimePoint = TimePoint(i64::MAX);

    pub fn from_nanos(nanos: i64) -> Self {
        TimePoint(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    /// Seconds relative to the epoch of the time axis. Diagnostic use only.
    pub fn to_sec(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0.saturating_add(rhs.as_nanos()))
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;
    fn sub(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0.saturating_sub(rhs.as_nanos()))
    }
}

impl SubAssign<Duration> for TimePoint {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Sub for TimePoint {
    type Output = Duration;
    fn sub(self, rhs: TimePoint) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TimePoint::MIN => write!(f, "-inf"),
            TimePoint::MAX => write!(f, "+inf"),
            t => write!(f, "{:.6}", t.to_sec()),
        }
    }
}

/// Wall-clock time source.
pub struct Clock;

impl Clock {
    /// Current instant, measured against the Unix epoch.
    pub fn now() -> TimePoint {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        TimePoint(elapsed.as_nanos() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_roundtrip() {
        let d = Duration::from_sec(0.1);
        assert_eq!(d.as_nanos(), 100_000_000);
        assert!((d.to_sec() - 0.1).abs() < 1e-12);
        assert_eq!(Duration::from_sec(-0.25).as_nanos(), -250_000_000);
    }

    #[test]
    fn timepoint_ordering_and_arithmetic() {
        let t0 = TimePoint::from_nanos(0);
        let t1 = t0 + Duration::from_sec(1.0);
        assert!(t1 > t0);
        assert_eq!(t1 - t0, Duration::from_sec(1.0));
        assert_eq!(t1 + Duration::from_sec(-1.0), t0);
    }

    #[test]
    fn sentinels_saturate() {
        assert_eq!(TimePoint::MIN + Duration::from_sec(-1.0), TimePoint::MIN);
        assert_eq!(TimePoint::MAX + Duration::from_sec(1.0), TimePoint::MAX);
        assert!(TimePoint::MIN < TimePoint::from_nanos(0));
        assert!(TimePoint::MAX > TimePoint::from_nanos(0));
    }
}
