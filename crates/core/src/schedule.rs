//! Backup timing: run frequency, time of day and the bandwidth throttle window
//!
//! Times of day are interpreted in a fixed UTC offset (`"UTC+5:30"`), not a
//! named zone, so no zone database is needed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const MINUTES_PER_DAY: u16 = 24 * 60;

/// Minutes since local midnight, written `"HH:MM"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    /// # Errors
    /// Returns [`VaultError::Config`] for hours above 23 or minutes above 59.
    pub fn new(hour: u16, minute: u16) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(VaultError::Config(format!(
                "invalid time of day {hour:02}:{minute:02}"
            )));
        }
        Ok(Self(hour * 60 + minute))
    }

    #[must_use]
    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VaultError::Config(format!("invalid time of day {s:?}, expected HH:MM"));
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(time: TimeOfDay) -> Self {
        time.to_string()
    }
}

/// Fixed offset from UTC in minutes, written `"UTC"`, `"UTC-8"` or `"UTC+5:30"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UtcOffset(i16);

impl UtcOffset {
    pub const UTC: Self = Self(0);

    #[must_use]
    pub fn minutes(self) -> i16 {
        self.0
    }

    fn millis(self) -> i64 {
        i64::from(self.0) * MINUTE_MS
    }

    /// Local minute of the day at `millis` since the epoch.
    #[must_use]
    pub fn minute_of_day(self, millis: i64) -> u16 {
        let local = (millis + self.millis()).rem_euclid(DAY_MS) / MINUTE_MS;
        u16::try_from(local).unwrap_or(0)
    }
}

impl FromStr for UtcOffset {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VaultError::Config(format!("invalid UTC offset {s:?}, expected UTC+H[:MM]"));
        let rest = s
            .trim()
            .strip_prefix("UTC")
            .or_else(|| s.trim().strip_prefix("GMT"))
            .ok_or_else(invalid)?;
        if rest.is_empty() {
            return Ok(Self::UTC);
        }

        let (sign, rest) = if let Some(rest) = rest.strip_prefix('+') {
            (1, rest)
        } else if let Some(rest) = rest.strip_prefix('-') {
            (-1, rest)
        } else {
            return Err(invalid());
        };
        let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
        let hours: i16 = hours.parse().map_err(|_| invalid())?;
        let minutes: i16 = minutes.parse().map_err(|_| invalid())?;
        if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
            return Err(invalid());
        }
        Ok(Self(sign * (hours * 60 + minutes)))
    }
}

impl fmt::Display for UtcOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("UTC");
        }
        let sign = if self.0 < 0 { '-' } else { '+' };
        let (hours, minutes) = (self.0.abs() / 60, self.0.abs() % 60);
        if minutes == 0 {
            write!(f, "UTC{sign}{hours}")
        } else {
            write!(f, "UTC{sign}{hours}:{minutes:02}")
        }
    }
}

impl TryFrom<String> for UtcOffset {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<UtcOffset> for String {
    fn from(offset: UtcOffset) -> Self {
        offset.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupFrequency {
    /// Back up as soon as files change
    #[default]
    Continuous,
    Hourly,
    Daily,
    Weekly,
}

impl FromStr for BackupFrequency {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" | "realtime" | "real-time" => Ok(Self::Continuous),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(VaultError::Config(format!(
                "unknown backup frequency {other:?} (continuous, hourly, daily or weekly)"
            ))),
        }
    }
}

impl fmt::Display for BackupFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continuous => "continuous",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        })
    }
}

/// `[schedule]` in `.vault.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub frequency: BackupFrequency,
    /// Start time of daily and weekly runs
    pub time: TimeOfDay,
    /// Offset that `time` and the bandwidth window are read in
    pub timezone: UtcOffset,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            frequency: BackupFrequency::Continuous,
            time: TimeOfDay(2 * 60),
            timezone: UtcOffset::UTC,
        }
    }
}

impl ScheduleConfig {
    /// First scheduled run strictly after `after_ms`; `None` for continuous backup.
    ///
    /// Weekly runs land on the configured time at least six days out, so a
    /// loop that runs immediately and then follows this keeps a 7-day cadence.
    #[must_use]
    pub fn next_run(&self, after_ms: i64) -> Option<i64> {
        match self.frequency {
            BackupFrequency::Continuous => None,
            BackupFrequency::Hourly => Some(after_ms + HOUR_MS),
            BackupFrequency::Daily => Some(self.next_time_of_day(after_ms)),
            BackupFrequency::Weekly => Some(self.next_time_of_day(after_ms + 6 * DAY_MS)),
        }
    }

    fn next_time_of_day(&self, after_ms: i64) -> i64 {
        let offset = self.timezone.millis();
        let local = after_ms + offset;
        let mut candidate = local.div_euclid(DAY_MS) * DAY_MS + i64::from(self.time.0) * MINUTE_MS;
        if candidate <= local {
            candidate += DAY_MS;
        }
        candidate - offset
    }
}

/// Hours during which the bandwidth limit applies. Wraps past midnight when
/// `end` is earlier than `start`; equal bounds cover the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl ThrottleWindow {
    #[must_use]
    pub fn contains(self, minute_of_day: u16) -> bool {
        let minute = minute_of_day % MINUTES_PER_DAY;
        let (start, end) = (self.start.0, self.end.0);
        match start.cmp(&end) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => (start..end).contains(&minute),
            std::cmp::Ordering::Greater => minute >= start || minute < end,
        }
    }
}
