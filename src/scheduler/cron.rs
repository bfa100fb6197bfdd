//! Five-field cron expressions (`minute hour day-of-month month day-of-week`)
//! evaluated in an IANA timezone.
//!
//! Fields accept `*`, lists, ranges, steps and month/weekday names; `7` is
//! Sunday. When both day fields are restricted a day matches if either does
//! (the Vixie cron rule).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::SchedulingError;

pub const MARKET_HOURS: &str = "0 10-16 * * mon-fri";

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Upper bound on the search; covers leap-day-only schedules.
const SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_any: bool,
    dow_any: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day of month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES, name_base: 1 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day of week", min: 0, max: 7, names: WEEKDAY_NAMES, name_base: 0 };

fn bit(mask: u64, n: u32) -> bool {
    mask & (1u64 << n) != 0
}

fn range_mask(from: u32, to: u32) -> u64 {
    (from..=to).fold(0, |m, n| m | (1u64 << n))
}

impl FieldSpec {
    fn value(&self, token: &str) -> Result<u32, String> {
        if let Ok(n) = token.parse::<u32>() {
            return Ok(n);
        }
        let lower = token.to_ascii_lowercase();
        self.names
            .iter()
            .position(|n| *n == lower)
            .map(|i| i as u32 + self.name_base)
            .ok_or_else(|| format!("bad {} value '{token}'", self.name))
    }

    fn parse(&self, field: &str) -> Result<u64, String> {
        let mut mask = 0u64;
        for item in field.split(',') {
            if item.is_empty() {
                return Err(format!("empty item in {} field", self.name));
            }
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s
                        .parse()
                        .map_err(|_| format!("bad step '{s}' in {} field", self.name))?;
                    if step == 0 {
                        return Err(format!("zero step in {} field", self.name));
                    }
                    (r, Some(step))
                }
                None => (item, None),
            };
            let (from, to) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (self.value(a)?, self.value(b)?)
            } else {
                let v = self.value(range)?;
                // `5/15` means 5 through max in steps of 15
                (v, if step.is_some() { self.max } else { v })
            };
            if from < self.min || to > self.max || from > to {
                return Err(format!(
                    "{} range {from}-{to} outside {}-{}",
                    self.name, self.min, self.max
                ));
            }
            let step = step.unwrap_or(1) as usize;
            for n in (from..=to).step_by(step) {
                mask |= 1u64 << n;
            }
        }
        Ok(mask)
    }
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, SchedulingError> {
        let invalid = |reason: String| SchedulingError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = MINUTE.parse(fields[0]).map_err(invalid)?;
        let hours = HOUR.parse(fields[1]).map_err(invalid)?;
        let days_of_month = DAY_OF_MONTH.parse(fields[2]).map_err(invalid)?;
        let months = MONTH.parse(fields[3]).map_err(invalid)?;
        let mut days_of_week = DAY_OF_WEEK.parse(fields[4]).map_err(invalid)?;
        if bit(days_of_week, 7) {
            days_of_week = (days_of_week | 1) & !(1u64 << 7);
        }

        Ok(Self {
            expr: fields.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_any: fields[2].starts_with('*'),
            dow_any: fields[4].starts_with('*'),
        })
    }

    /// Top of every hour 10:00 through 16:00, Monday to Friday.
    pub fn market_hours() -> Self {
        Self {
            expr: MARKET_HOURS.to_string(),
            minutes: 1,
            hours: range_mask(10, 16),
            days_of_month: range_mask(1, 31),
            months: range_mask(1, 12),
            days_of_week: range_mask(1, 5),
            dom_any: true,
            dow_any: false,
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_any || self.dow_any {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Whether the schedule fires at this wall-clock minute.
    pub fn matches(&self, local: &NaiveDateTime) -> bool {
        bit(self.months, local.month())
            && self.day_matches(local.date())
            && bit(self.hours, local.hour())
            && bit(self.minutes, local.minute())
    }

    /// First fire time strictly after `after`, evaluated on `tz` wall clock.
    ///
    /// Wall-clock times skipped by a DST jump never fire; repeated ones fire
    /// once, at the earlier instant.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = t + Duration::days(SEARCH_DAYS);

        while t <= limit {
            if !bit(self.months, t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    let utc = dt.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
                LocalResult::None => {}
            }
            t += Duration::minutes(1);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, SchedulingError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| SchedulingError::UnknownTimezone(name.to_string()))
}
