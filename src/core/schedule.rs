//! Schedule expressions.
//!
//! Supported forms:
//! - five-field cron (`minute hour day-of-month month day-of-week`, UTC)
//! - `@hourly`, `@daily`, `@weekly`, `@monthly`
//! - `@every 30s` / `@every 5m` / `@every 2h` (aligned to the Unix epoch)
//! - `@manual` (only runs when triggered)

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Upper bound on search steps; every valid cron expression fires well within it
const MAX_SEARCH_STEPS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule expression is empty")]
    Empty,

    #[error("cron expression needs 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid interval '{0}': expected e.g. 30s, 5m, 2h")]
    InvalidInterval(String),

    #[error("unknown schedule macro '{0}'")]
    UnknownMacro(String),
}

/// A parsed schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronSpec),
    Every(Duration),
    Manual,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        expr.parse()
    }

    /// Latest fire time in `(prev, now]`, if any.
    ///
    /// Several missed fire times collapse into the latest one.
    pub fn due_between(&self, prev: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now <= prev {
            return None;
        }
        let fire = self.latest_at_or_before(now)?;
        (fire > prev).then_some(fire)
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Manual => None,
            Schedule::Every(interval) => {
                let step = interval_millis(*interval)?;
                let at = after.timestamp_millis();
                let next = (at.div_euclid(step) + 1) * step;
                Utc.timestamp_millis_opt(next).single()
            }
            Schedule::Cron(spec) => spec.next_after(after),
        }
    }

    fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Manual => None,
            Schedule::Every(interval) => {
                let step = interval_millis(*interval)?;
                let fire = at.timestamp_millis().div_euclid(step) * step;
                Utc.timestamp_millis_opt(fire).single()
            }
            Schedule::Cron(spec) => spec.latest_at_or_before(at),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Schedule::Manual)
    }
}

fn interval_millis(interval: Duration) -> Option<i64> {
    let millis = i64::try_from(interval.as_millis()).ok()?;
    (millis > 0).then_some(millis)
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expr = s.trim();
        if expr.is_empty() {
            return Err(ScheduleError::Empty);
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            return parse_interval(rest.trim()).map(Schedule::Every);
        }

        match expr {
            "@manual" => Ok(Schedule::Manual),
            "@hourly" => CronSpec::parse("0 * * * *").map(Schedule::Cron),
            "@daily" | "@midnight" => CronSpec::parse("0 0 * * *").map(Schedule::Cron),
            "@weekly" => CronSpec::parse("0 0 * * 0").map(Schedule::Cron),
            "@monthly" => CronSpec::parse("0 0 1 * *").map(Schedule::Cron),
            other if other.starts_with('@') => Err(ScheduleError::UnknownMacro(other.to_string())),
            other => CronSpec::parse(other).map(Schedule::Cron),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(spec) => write!(f, "{}", spec.source),
            Schedule::Every(interval) => write!(f, "@every {}s", interval.as_secs()),
            Schedule::Manual => f.write_str("@manual"),
        }
    }
}

fn parse_interval(text: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(text.to_string());
    if text.len() < 2 {
        return Err(invalid());
    }
    let (number, unit) = text.split_at(text.len() - 1);
    let n: u64 = number.trim().parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// Parsed five-field cron expression, stored as bit sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSpec {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], "minute", 0, 59)?,
            hours: parse_field(fields[1], "hour", 0, 23)?,
            days_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            months: parse_field(fields[3], "month", 1, 12)?,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, at.day());
        let dow = bit(self.days_of_week, at.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted, either may match
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after) + ChronoDuration::minutes(1);
        for _ in 0..MAX_SEARCH_STEPS {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
            } else if !self.day_matches(t) {
                t = start_of_day(t) + ChronoDuration::days(1);
            } else if !bit(self.hours, t.hour()) {
                t = start_of_hour(t) + ChronoDuration::hours(1);
            } else if !bit(self.minutes, t.minute()) {
                t += ChronoDuration::minutes(1);
            } else {
                return Some(t);
            }
        }
        None
    }

    fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(at);
        let minute = ChronoDuration::minutes(1);
        for _ in 0..MAX_SEARCH_STEPS {
            if !bit(self.months, t.month()) {
                t = start_of_month(t)? - minute;
            } else if !self.day_matches(t) {
                t = start_of_day(t) - minute;
            } else if !bit(self.hours, t.hour()) {
                t = start_of_hour(t) - minute;
            } else if !bit(self.minutes, t.minute()) {
                t -= minute;
            } else {
                return Some(t);
            }
        }
        None
    }
}

fn bit(set: u64, n: u32) -> bool {
    n < 64 && set & (1 << n) != 0
}

fn parse_field(text: &str, field: &'static str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidField {
        field,
        value: text.to_string(),
        reason,
    };
    let number = |s: &str| -> Result<u32, ScheduleError> {
        let n: u32 = s.parse().map_err(|_| invalid(format!("'{}' is not a number", s)))?;
        if n < min || n > max {
            return Err(invalid(format!("{} is outside {}-{}", n, min, max)));
        }
        Ok(n)
    };

    let mut set = 0u64;
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid(format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let (lo, hi) = (number(lo)?, number(hi)?);
            if lo > hi {
                return Err(invalid(format!("range {}-{} is reversed", lo, hi)));
            }
            (lo, hi)
        } else {
            let n = number(range)?;
            // `5/15` means 5 through max, every 15
            if step > 1 {
                (n, max)
            } else {
                (n, n)
            }
        };

        let mut n = lo;
        while n <= hi {
            set |= 1 << n;
            n += step;
        }
    }
    Ok(set)
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - ChronoDuration::seconds(t.second() as i64) - ChronoDuration::nanoseconds(t.nanosecond() as i64)
}

fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t) - ChronoDuration::minutes(t.minute() as i64)
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    start_of_hour(t) - ChronoDuration::hours(t.hour() as i64)
}

fn start_of_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(t.year(), t.month(), 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        assert!(matches!(Schedule::parse("@manual").unwrap(), Schedule::Manual));
        assert_eq!(
            Schedule::parse("@every 5m").unwrap(),
            Schedule::Every(Duration::from_secs(300))
        );
        assert!(matches!(Schedule::parse("*/15 2 * * 1-5").unwrap(), Schedule::Cron(_)));

        assert_eq!(Schedule::parse("").unwrap_err(), ScheduleError::Empty);
        assert_eq!(Schedule::parse("* * *").unwrap_err(), ScheduleError::FieldCount(3));
        assert!(matches!(
            Schedule::parse("61 * * * *").unwrap_err(),
            ScheduleError::InvalidField { field: "minute", .. }
        ));
        assert!(matches!(
            Schedule::parse("@every 0s").unwrap_err(),
            ScheduleError::InvalidInterval(_)
        ));
        assert!(matches!(
            Schedule::parse("@yearly").unwrap_err(),
            ScheduleError::UnknownMacro(_)
        ));
    }

    #[test]
    fn test_cron_next_after() {
        let daily_2am = Schedule::parse("0 2 * * *").unwrap();
        assert_eq!(
            daily_2am.next_after(at(2026, 10, 19, 1, 30, 0)),
            Some(at(2026, 10, 19, 2, 0, 0))
        );
        assert_eq!(
            daily_2am.next_after(at(2026, 10, 19, 2, 0, 0)),
            Some(at(2026, 10, 20, 2, 0, 0))
        );

        // Year rollover
        let new_year = Schedule::parse("0 0 1 1 *").unwrap();
        assert_eq!(
            new_year.next_after(at(2026, 10, 19, 0, 0, 0)),
            Some(at(2027, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_day_of_week() {
        // 2026-10-19 is a Monday
        let weekdays = Schedule::parse("30 9 * * 1-5").unwrap();
        assert_eq!(
            weekdays.next_after(at(2026, 10, 23, 10, 0, 0)),
            Some(at(2026, 10, 26, 9, 30, 0))
        );

        let sunday = Schedule::parse("0 0 * * 7").unwrap();
        assert_eq!(
            sunday.next_after(at(2026, 10, 19, 0, 0, 0)),
            Some(at(2026, 10, 25, 0, 0, 0))
        );
    }

    #[test]
    fn test_due_between() {
        let hourly = Schedule::parse("@hourly").unwrap();

        assert_eq!(
            hourly.due_between(at(2026, 10, 19, 6, 59, 30), at(2026, 10, 19, 7, 0, 5)),
            Some(at(2026, 10, 19, 7, 0, 0))
        );
        assert_eq!(
            hourly.due_between(at(2026, 10, 19, 7, 0, 0), at(2026, 10, 19, 7, 30, 0)),
            None
        );

        // Missed fires collapse into the latest
        assert_eq!(
            hourly.due_between(at(2026, 10, 19, 1, 0, 0), at(2026, 10, 19, 5, 10, 0)),
            Some(at(2026, 10, 19, 5, 0, 0))
        );
    }

    #[test]
    fn test_every_is_epoch_aligned() {
        let every = Schedule::parse("@every 15m").unwrap();
        assert_eq!(
            every.next_after(at(2026, 10, 19, 7, 7, 0)),
            Some(at(2026, 10, 19, 7, 15, 0))
        );
        assert_eq!(
            every.due_between(at(2026, 10, 19, 7, 14, 0), at(2026, 10, 19, 7, 15, 0)),
            Some(at(2026, 10, 19, 7, 15, 0))
        );
    }

    #[test]
    fn test_manual_never_fires() {
        let manual = Schedule::Manual;
        assert!(manual.next_after(at(2026, 10, 19, 0, 0, 0)).is_none());
        assert!(manual
            .due_between(at(2000, 1, 1, 0, 0, 0), at(2026, 10, 19, 0, 0, 0))
            .is_none());
    }
}
