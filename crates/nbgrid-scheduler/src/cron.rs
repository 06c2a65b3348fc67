//! Five-field cron expressions evaluated in UTC.
//!
//! `minute hour day-of-month month day-of-week`, each field a comma list of
//! `*`, `n`, `a-b`, with an optional `/step`. Months and weekdays accept
//! three-letter names; weekday `7` is Sunday. When both day fields are
//! restricted a day matches if either does. `@yearly`, `@monthly`,
//! `@weekly`, `@daily` and `@hourly` expand to their usual forms.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{SchedulerError, SchedulerResult};

/// Years searched ahead before giving up on an expression that never
/// matches (e.g. February 30th).
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names mapped to `min + index`.
    names: &'static [&'static str],
}

const MINUTE: Field = Field { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: Field = Field { name: "hour", min: 0, max: 23, names: &[] };
const DAY: Field = Field { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: Field = Field { name: "month", min: 1, max: 12, names: MONTH_NAMES };
const WEEKDAY: Field = Field { name: "day-of-week", min: 0, max: 7, names: WEEKDAY_NAMES };

/// A parsed cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        parse(expr).map_err(|reason| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let last_year = t.year() + SEARCH_YEARS;

        while t.year() <= last_year {
            if !has(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = (t.date_naive() + Duration::days(1))
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let day = has(self.days, date.day());
        let weekday = has(self.weekdays, date.weekday().num_days_from_sunday());
        if self.days_restricted && self.weekdays_restricted {
            day || weekday
        } else {
            day && weekday
        }
    }
}

impl FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn has(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

fn expand_macro(expr: &str) -> Result<&str, String> {
    Ok(match expr {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other => return Err(format!("unknown macro {other}")),
    })
}

fn parse(expr: &str) -> Result<CronExpr, String> {
    let trimmed = expr.trim();
    let body = if trimmed.starts_with('@') {
        expand_macro(trimmed)?
    } else {
        trimmed
    };

    let fields: Vec<&str> = body.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields.as_slice() else {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    };

    let mut weekdays = parse_field(weekday, &WEEKDAY)?;
    // 7 is another spelling of Sunday.
    if has(weekdays, 7) {
        weekdays = (weekdays | 1) & !(1 << 7);
    }

    Ok(CronExpr {
        source: trimmed.to_string(),
        minutes: parse_field(minute, &MINUTE)?,
        hours: parse_field(hour, &HOUR)?,
        days: parse_field(day, &DAY)?,
        months: parse_field(month, &MONTH)?,
        weekdays,
        days_restricted: !day.starts_with('*'),
        weekdays_restricted: !weekday.starts_with('*'),
    })
}

fn parse_field(text: &str, field: &Field) -> Result<u64, String> {
    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("{}: empty list item", field.name));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("{}: bad step {step:?}", field.name))?;
                if step == 0 {
                    return Err(format!("{}: step must be positive", field.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (field.min, field.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, field)?, value(b, field)?)
        } else {
            let v = value(range, field)?;
            // `n/step` runs from n to the end of the field.
            if step.is_some() { (v, field.max) } else { (v, v) }
        };
        if lo > hi {
            return Err(format!("{}: range {lo}-{hi} is reversed", field.name));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1 << v;
        }
    }
    Ok(bits)
}

fn value(text: &str, field: &Field) -> Result<u32, String> {
    let v = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let lower = text.to_ascii_lowercase();
            let index = field
                .names
                .iter()
                .position(|name| *name == lower)
                .ok_or_else(|| format!("{}: bad value {text:?}", field.name))?;
            field.min + index as u32
        }
    };
    if v < field.min || v > field.max {
        return Err(format!(
            "{}: {v} is outside {}-{}",
            field.name, field.min, field.max
        ));
    }
    Ok(v)
}
