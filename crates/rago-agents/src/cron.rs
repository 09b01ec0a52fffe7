//! Five-field cron expressions evaluated in UTC
//!
//! `minute hour day-of-month month day-of-week` with `*`, lists (`1,5`),
//! ranges (`9-17`), steps (`*/15`, `0-30/10`) and three-letter month and
//! weekday names. Weekday `7` is Sunday. When both day fields are
//! restricted a time matches if either does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use rago_core::{Component, RagoError, RagoResult};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Upper bound on the search for the next matching minute
const MAX_SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    any: bool,
    values: BTreeSet<u32>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Names {
    None,
    Month,
    Weekday,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(source: &str) -> RagoResult<Self> {
        let fields: Vec<&str> = source.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                source,
                "expected 5 fields: minute hour day-of-month month day-of-week",
            ));
        }
        let field = |raw: &str, min, max, names| {
            parse_field(raw, min, max, names).map_err(|reason| invalid(source, &reason))
        };
        Ok(Self {
            source: source.trim().to_string(),
            minute: field(fields[0], 0, 59, Names::None)?,
            hour: field(fields[1], 0, 23, Names::None)?,
            day_of_month: field(fields[2], 1, 31, Names::None)?,
            month: field(fields[3], 1, 12, Names::Month)?,
            day_of_week: field(fields[4], 0, 7, Names::Weekday)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.any || self.day_of_week.any {
            dom && dow
        } else {
            dom || dow
        }
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.month.matches(at.month())
            && self.day_matches(at.date_naive())
            && self.hour.matches(at.hour())
            && self.minute.matches(at.minute())
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let limit = start.checked_add_signed(Duration::days(MAX_SEARCH_DAYS))?;

        let mut date = start.date_naive();
        let mut first_day = true;
        while date.and_time(NaiveTime::MIN).and_utc() <= limit {
            if self.month.matches(date.month()) && self.day_matches(date) {
                let (from_hour, from_minute) = if first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for hour in from_hour..24 {
                    if !self.hour.matches(hour) {
                        continue;
                    }
                    let first_minute = if hour == from_hour { from_minute } else { 0 };
                    if let Some(minute) = (first_minute..60).find(|m| self.minute.matches(*m)) {
                        return date.and_hms_opt(hour, minute, 0).map(|t| t.and_utc());
                    }
                }
            }
            date = date.succ_opt()?;
            first_day = false;
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = RagoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(source: &str, reason: &str) -> RagoError {
    RagoError::config(format!("invalid cron expression '{}': {}", source, reason))
        .at(Component::Agents, "parse_schedule")
}

fn parse_field(raw: &str, min: u32, max: u32, names: Names) -> Result<Field, String> {
    if raw == "*" {
        return Ok(Field {
            any: true,
            values: BTreeSet::new(),
        });
    }
    let mut values = BTreeSet::new();
    for segment in raw.split(',') {
        parse_segment(segment, min, max, names, &mut values)?;
    }
    if values.is_empty() {
        return Err(format!("empty field '{}'", raw));
    }
    Ok(Field { any: false, values })
}

fn parse_segment(
    raw: &str,
    min: u32,
    max: u32,
    names: Names,
    values: &mut BTreeSet<u32>,
) -> Result<(), String> {
    let (range, step) = match raw.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid step '{}'", step))?;
            if step == 0 {
                return Err("step must be at least 1".to_string());
            }
            (range, step)
        }
        None => (raw, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_atom(a, min, max, names)?, parse_atom(b, min, max, names)?)
    } else {
        let value = parse_atom(range, min, max, names)?;
        // `5/15` means from 5 to the end of the range
        if step > 1 {
            (value, max)
        } else {
            (value, value)
        }
    };
    if start > end {
        return Err(format!("invalid range '{}'", raw));
    }

    for value in (start..=end).step_by(step as usize) {
        let value = if names == Names::Weekday && value == 7 {
            0
        } else {
            value
        };
        values.insert(value);
    }
    Ok(())
}

fn parse_atom(raw: &str, min: u32, max: u32, names: Names) -> Result<u32, String> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

    let lower = raw.to_ascii_lowercase();
    let named = match names {
        Names::Month => MONTHS.iter().position(|m| *m == lower).map(|i| i as u32 + 1),
        Names::Weekday => WEEKDAYS.iter().position(|d| *d == lower).map(|i| i as u32),
        Names::None => None,
    };
    let value = match named {
        Some(v) => v,
        None => lower
            .parse::<u32>()
            .map_err(|_| format!("invalid value '{}'", raw))?,
    };
    if value < min || value > max {
        return Err(format!("value '{}' out of range {}..={}", raw, min, max));
    }
    Ok(value)
}
