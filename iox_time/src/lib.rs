//! A monotonic-ish wall-clock abstraction.
//!
//! Nothing in this workspace should call [`std::time::SystemTime::now`] directly: the lifecycle
//! ticker needs to fast-forward a mock clock in tests without sleeping for real, so every piece
//! of code that needs "now" takes a `Arc<dyn TimeProvider>` instead.

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// An instant in time, represented as nanoseconds since the Unix epoch.
///
/// This is deliberately a plain newtype rather than [`std::time::Instant`] so that it can be
/// constructed deterministically in tests and serialized for display-name generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    pub const fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        let t = DateTime::parse_from_rfc3339(s)?;
        Ok(Self(t.timestamp_nanos_opt().unwrap_or(i64::MAX)))
    }

    pub fn timestamp_nanos(&self) -> i64 {
        self.0
    }

    pub fn date_time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    /// Duration elapsed since `earlier`, or `None` if `earlier` is in the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        if self.0 < earlier.0 {
            None
        } else {
            Some(Duration::from_nanos((self.0 - earlier.0) as u64))
        }
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_nanos() as i64)
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.as_nanos() as i64)
    }
}

/// Anything that can answer "what time is it".
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] backed by the real system clock.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self {}
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
    }
}

/// A [`TimeProvider`] that only advances when told to, for deterministic tests of the lifecycle
/// ticker's idle/incomplete timeouts.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Set the clock to an absolute time, returning the new value.
    pub fn set(&self, time: Time) -> Time {
        *self.now.write() = time;
        time
    }

    /// Advance the clock by `delta`, returning the new value.
    pub fn inc(&self, delta: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + delta;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances_monotonically() {
        let p = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(p.now(), Time::from_timestamp_nanos(0));
        p.inc(Duration::from_secs(1));
        assert_eq!(p.now(), Time::from_timestamp_nanos(1_000_000_000));
    }

    #[test]
    fn checked_duration_since_future_is_none() {
        let earlier = Time::from_timestamp_nanos(10);
        let later = Time::from_timestamp_nanos(5);
        assert!(later.checked_duration_since(earlier).is_none());
        assert_eq!(
            earlier.checked_duration_since(later),
            Some(Duration::from_nanos(5))
        );
    }
}
