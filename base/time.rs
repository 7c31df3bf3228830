// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock time and durations, in milliseconds since the Unix epoch.
//!
//! This is the unit `segments.start_ms`/`end_ms` are stored in. It's
//! distinct from the per-stream monotonic microsecond PTS counter the
//! ingest/muxing path uses (see `lightnvr::packet`), which has no fixed
//! relationship to wall-clock time beyond "roughly tracks it".

use crate::{err, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

/// The zone used to format times for humans (day-boundary calculations,
/// `YYYY-MM-DD` directory names). Fixed for the life of the process so
/// that day bucketing is consistent even if the system zone database is
/// reloaded underneath us.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE.get_or_init(jiff::tz::TimeZone::system).clone()
}

/// A time specified in milliseconds since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    pub fn now() -> Self {
        Time(jiff::Timestamp::now().as_millisecond())
    }

    pub fn from_unix_millis(ms: i64) -> Self {
        Time(ms)
    }

    pub fn unix_millis(&self) -> i64 {
        self.0
    }

    pub fn unix_seconds(&self) -> i64 {
        self.0.div_euclid(1000)
    }

    /// The `YYYY-MM-DD` calendar day this time falls on, in [`global_zone`].
    pub fn day_key(&self) -> Result<String, Error> {
        let ts = jiff::Timestamp::from_millisecond(self.0)
            .map_err(|e| err!(InvalidArgument, format!("{e}")))?;
        let zoned = jiff::Zoned::new(ts, global_zone());
        Ok(zoned.strftime("%Y-%m-%d").to_string())
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match jiff::Timestamp::from_millisecond(self.0) {
            Ok(ts) => {
                let zoned = jiff::Zoned::new(ts, global_zone());
                write!(f, "{}", zoned.strftime("%FT%T%.3f%:z"))
            }
            Err(_) => write!(f, "{}ms", self.0),
        }
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

/// A duration in milliseconds.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Duration(pub i64);

impl Duration {
    pub fn from_secs(secs: i64) -> Self {
        Duration(secs * 1000)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl TryFrom<Duration> for std::time::Duration {
    type Error = std::num::TryFromIntError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        Ok(std::time::Duration::from_millis(u64::try_from(value.0)?))
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_gives_duration() {
        let a = Time(5_000);
        let b = Time(2_000);
        assert_eq!((a - b).0, 3_000);
    }

    #[test]
    fn day_key_is_stable_format() {
        init_zone(|| jiff::tz::TimeZone::UTC);
        let t = Time(1_700_000_000_000); // 2023-11-14T22:13:20Z
        assert_eq!(t.day_key().unwrap(), "2023-11-14");
    }
}
