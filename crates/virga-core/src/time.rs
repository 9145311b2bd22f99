//! Nanosecond time arithmetic for VirgaQL
//!
//! All timestamps are signed nanosecond counts since the Unix epoch, all
//! durations are signed nanosecond spans. Query text may carry relative
//! times (`start:-4h`); those resolve against a "now" fixed at plan time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};

/// A point in time, nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Time(pub i64);

/// A signed span of time in nanoseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Duration(pub i64);

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

impl Time {
    pub const MIN: Time = Time(i64::MIN);
    pub const MAX: Time = Time(i64::MAX);

    /// Wall-clock now as a Time.
    pub fn now() -> Self {
        Time(Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn nanos(self) -> i64 {
        self.0
    }
}

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub fn from_secs(secs: i64) -> Self {
        Duration(secs * NANOS_PER_SECOND)
    }

    pub fn from_millis(millis: i64) -> Self {
        Duration(millis * 1_000_000)
    }

    pub fn nanos(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Conversion for std interop (request timeouts). Negative spans are
    /// rejected earlier, at argument parsing.
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.max(0) as u64)
    }
}

impl Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0.saturating_add(rhs.0))
    }
}

impl Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<Time> for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Neg for Duration {
    type Output = Duration;
    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = self.0.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };
        let secs = abs / NANOS_PER_SECOND as u64;
        if secs >= 3600 && secs % 3600 == 0 {
            write!(f, "{}{}h", sign, secs / 3600)
        } else if secs >= 60 && secs % 60 == 0 {
            write!(f, "{}{}m", sign, secs / 60)
        } else if secs > 0 && abs % NANOS_PER_SECOND as u64 == 0 {
            write!(f, "{}{}s", sign, secs)
        } else {
            write!(f, "{}{}ns", sign, abs)
        }
    }
}

/// A time as written in query text: absolute, or relative to plan-time "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSpec {
    Relative { relative: Duration },
    Absolute { absolute: Time },
}

impl TimeSpec {
    /// A relative spec pointing at "now" itself.
    pub const NOW: TimeSpec = TimeSpec::Relative {
        relative: Duration::ZERO,
    };

    pub fn absolute(t: Time) -> Self {
        TimeSpec::Absolute { absolute: t }
    }

    pub fn relative(d: Duration) -> Self {
        TimeSpec::Relative { relative: d }
    }

    pub fn resolve(self, now: Time) -> Time {
        match self {
            TimeSpec::Absolute { absolute } => absolute,
            TimeSpec::Relative { relative } => now + relative,
        }
    }
}

/// Half-open time interval `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub start: Time,
    pub stop: Time,
}

impl Bounds {
    pub fn new(start: Time, stop: Time) -> Self {
        Bounds { start, stop }
    }

    /// The interval covering all representable time.
    pub fn all_time() -> Self {
        Bounds {
            start: Time::MIN,
            stop: Time::MAX,
        }
    }

    pub fn contains(&self, t: Time) -> bool {
        self.start <= t && t < self.stop
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.stop
    }

    pub fn intersect(&self, other: &Bounds) -> Bounds {
        Bounds {
            start: self.start.max(other.start),
            stop: self.stop.min(other.stop),
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            start: self.start.min(other.start),
            stop: self.stop.max(other.stop),
        }
    }

    pub fn duration(&self) -> Duration {
        self.stop - self.start
    }

    /// True when the two intervals share at least one instant.
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.start < other.stop && other.start < self.stop
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}
