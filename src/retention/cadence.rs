//! Cadence arithmetic for the retention schedule.
//!
//! Everything here is pure: callers pass `now` explicitly.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveTime, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SettingsError;

/// How often the retention job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
}

impl Frequency {
    /// Compute the next run instant.
    ///
    /// The baseline is `last_finished`, or `now` when the job has never
    /// finished. The result is the first occurrence of `time_of_day` (on
    /// `day_of_week` for weekly runs, 0 = Sunday) strictly after the
    /// baseline, evaluated in the offset carried by `time_of_day`.
    pub fn next_run(
        &self,
        last_finished: Option<DateTime<Utc>>,
        day_of_week: u32,
        time_of_day: &TimeOfDay,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let baseline = last_finished.unwrap_or(now);
        let offset = chrono::Duration::seconds(i64::from(time_of_day.offset.local_minus_utc()));
        let mut date = baseline.with_timezone(&time_of_day.offset).date_naive();

        // A weekly slot is at most 7 days past the baseline's local date,
        // plus one more when today's slot has already passed.
        for _ in 0..=8 {
            let candidate = (date.and_time(time_of_day.time) - offset).and_utc();
            let day_matches = match self {
                Frequency::Daily => true,
                Frequency::Weekly => date.weekday().num_days_from_sunday() == day_of_week,
            };
            if day_matches && candidate > baseline {
                return candidate;
            }
            date = date + Days::new(1);
        }

        // Only reachable with an out-of-range day_of_week
        baseline + chrono::Duration::days(7)
    }
}

impl FromStr for Frequency {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            _ => Err(SettingsError::InvalidFrequency(s.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => f.write_str("daily"),
            Frequency::Weekly => f.write_str("weekly"),
        }
    }
}

/// A wall-clock time with a fixed UTC offset, written `"3:04pm -0700"`.
///
/// Also accepted: 24-hour times (`"14:00"`), a missing offset (UTC) and
/// `Z`/`UTC` as the offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    time: NaiveTime,
    offset: FixedOffset,
}

impl TimeOfDay {
    pub fn time(&self) -> NaiveTime {
        self.time
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl Default for TimeOfDay {
    /// 1:00am UTC
    fn default() -> Self {
        Self {
            time: NaiveTime::MIN + chrono::Duration::hours(1),
            offset: utc(),
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl FromStr for TimeOfDay {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SettingsError::InvalidTimeOfDay(s.to_string());

        let mut parts = s.split_whitespace();
        let clock = parts.next().ok_or_else(invalid)?;
        let offset = match parts.next() {
            Some(raw) => parse_offset(raw).ok_or_else(invalid)?,
            None => utc(),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        let time = parse_clock(clock).ok_or_else(invalid)?;
        Ok(Self { time, offset })
    }
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let lower = raw.to_ascii_lowercase();
    let (digits, meridiem) = if let Some(rest) = lower.strip_suffix("am") {
        (rest, Some(false))
    } else if let Some(rest) = lower.strip_suffix("pm") {
        (rest, Some(true))
    } else {
        (lower.as_str(), None)
    };

    let (hour, minute) = digits.split_once(':')?;
    if minute.len() != 2 || hour.is_empty() || hour.len() > 2 {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;

    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            (hour % 12) + if pm { 12 } else { 0 }
        }
        None => hour,
    };

    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(utc());
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let rest = rest.replace(':', "");
    if rest.len() != 4 || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = rest[..2].parse().ok()?;
    let minutes: i32 = rest[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pm, hour12) = self.time.hour12();
        let seconds = self.offset.local_minus_utc();
        let sign = if seconds < 0 { '-' } else { '+' };
        let abs = seconds.abs();
        write!(
            f,
            "{}:{:02}{} {}{:02}{:02}",
            hour12,
            self.time.minute(),
            if pm { "pm" } else { "am" },
            sign,
            abs / 3600,
            (abs % 3600) / 60
        )
    }
}

/// Time to sleep until `next`. Zero when `next` is not in the future.
pub fn wait_until(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
