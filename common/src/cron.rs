// Cron expression parsing and next-fire calculation
//
// Implements the standard five-field grammar (minute, hour, day-of-month,
// month, day-of-week) plus an optional leading seconds field. Evaluation is
// in UTC. When both day fields are restricted, a match on either fires
// (Vixie cron OR semantics).

use crate::errors::ScheduleError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, SubsecRound, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` searches before giving up. Wide enough to
/// cover leap-day expressions; expressions naming impossible dates (Feb 30)
/// surface as `NoUpcomingOccurrence` instead of spinning forever.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A parsed, validated cron expression
///
/// Parsing happens once at schedule-table load; a malformed expression never
/// reaches fire-time evaluation.
#[derive(Debug, Clone)]
pub struct CronExpression {
    expression: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

/// Set of admissible values for one cron field, as a bitmask
#[derive(Debug, Clone, Copy)]
struct FieldSet {
    bits: u64,
    /// False only for a bare `*`; drives the day-of-month/day-of-week rule
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }

    /// Smallest admissible value >= `value`, if any
    fn next_at_or_after(&self, value: u32) -> Option<u32> {
        let masked = self.bits >> value;
        if masked == 0 {
            None
        } else {
            Some(value + masked.trailing_zeros())
        }
    }
}

impl CronExpression {
    /// The original expression text
    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// Compute the next fire instant strictly after `after`
    ///
    /// Pure and deterministic. If `after` falls exactly on a fire instant the
    /// result is the following one, never `after` itself, so exact-boundary
    /// wake-ups cannot double-count a tick.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut cursor = after.trunc_subsecs(0) + Duration::seconds(1);

        while cursor <= horizon {
            if !self.months.contains(cursor.month()) {
                let (year, month) = if cursor.month() == 12 {
                    (cursor.year() + 1, 1)
                } else {
                    (cursor.year(), cursor.month() + 1)
                };
                cursor = start_of_day(
                    NaiveDate::from_ymd_opt(year, month, 1)
                        .ok_or_else(|| calculation_failed(year, month, 1))?,
                )?;
                continue;
            }

            if !self.day_matches(cursor.date_naive()) {
                let next_day = cursor.date_naive().succ_opt().ok_or_else(|| {
                    ScheduleError::CalculationFailed("date overflow while searching".to_string())
                })?;
                cursor = start_of_day(next_day)?;
                continue;
            }

            if !self.hours.contains(cursor.hour()) {
                cursor = truncate_to_hour(cursor)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(cursor.minute()) {
                cursor = truncate_to_minute(cursor)? + Duration::minutes(1);
                continue;
            }

            match self.seconds.next_at_or_after(cursor.second()) {
                Some(second) => {
                    return cursor.with_second(second).ok_or_else(|| {
                        ScheduleError::CalculationFailed(format!("invalid second {second}"))
                    });
                }
                None => {
                    cursor = truncate_to_minute(cursor)? + Duration::minutes(1);
                }
            }
        }

        Err(ScheduleError::NoUpcomingOccurrence {
            expression: self.expression.clone(),
        })
    }

    /// Day-of-month/day-of-week rule: if both fields are restricted, a match
    /// on either is sufficient; otherwise both must hold (an unrestricted
    /// field matches every day).
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let invalid = |reason: String| ScheduleError::InvalidExpression {
            expression: s.to_string(),
            reason,
        };

        // Five fields is the standard minute-resolution form (seconds pinned
        // to 0); six fields carries a leading seconds field.
        let (seconds_text, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
        };

        Ok(Self {
            expression: s.to_string(),
            seconds: parse_field(seconds_text, 0, 59, &[], 0).map_err(&invalid)?,
            minutes: parse_field(rest[0], 0, 59, &[], 0).map_err(&invalid)?,
            hours: parse_field(rest[1], 0, 23, &[], 0).map_err(&invalid)?,
            days_of_month: parse_field(rest[2], 1, 31, &[], 0).map_err(&invalid)?,
            months: parse_field(rest[3], 1, 12, &MONTH_NAMES, 1).map_err(&invalid)?,
            days_of_week: parse_day_of_week(rest[4]).map_err(&invalid)?,
        })
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse one cron field: `*`, `*/N`, `A`, `A/N`, `A-B`, `A-B/N`, comma
/// lists, and symbolic names where `names` is non-empty.
fn parse_field(
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<FieldSet, String> {
    if text.is_empty() {
        return Err("empty field".to_string());
    }

    if text == "*" {
        return Ok(FieldSet {
            bits: range_bits(min, max, 1),
            restricted: false,
        });
    }

    let mut bits = 0u64;
    for term in text.split(',') {
        let (range, step_text) = match term.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (term, None),
        };
        let step: u32 = match step_text {
            Some(s) => s
                .parse()
                .map_err(|_| format!("invalid step value '{s}'"))?,
            None => 1,
        };
        if step == 0 {
            return Err(format!("step cannot be zero in '{term}'"));
        }

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, min, max, names, name_base)?,
                parse_value(b, min, max, names, name_base)?,
            )
        } else {
            let value = parse_value(range, min, max, names, name_base)?;
            if step_text.is_some() {
                // Vixie shorthand: "A/N" runs from A to the field maximum
                (value, max)
            } else {
                (value, value)
            }
        };
        if lo > hi {
            return Err(format!("inverted range {lo}-{hi} in '{term}'"));
        }

        bits |= range_bits(lo, hi, step);
    }

    Ok(FieldSet {
        bits,
        restricted: true,
    })
}

/// Day-of-week accepts 0-7 (both 0 and 7 mean Sunday) and SUN..SAT names
fn parse_day_of_week(text: &str) -> Result<FieldSet, String> {
    let mut field = parse_field(text, 0, 7, &DAY_NAMES, 0)?;
    if field.bits & (1 << 7) != 0 {
        field.bits = (field.bits & !(1 << 7)) | 1;
    }
    Ok(field)
}

fn parse_value(
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<u32, String> {
    let value = if let Some(index) = names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(text))
    {
        name_base + index as u32
    } else {
        text.parse::<u32>()
            .map_err(|_| format!("invalid value '{text}'"))?
    };

    if value < min || value > max {
        return Err(format!("value {value} out of range {min}-{max}"));
    }
    Ok(value)
}

fn range_bits(lo: u32, hi: u32, step: u32) -> u64 {
    let mut bits = 0u64;
    let mut value = lo;
    while value <= hi {
        bits |= 1u64 << value;
        value += step;
    }
    bits
}

fn start_of_day(date: NaiveDate) -> Result<DateTime<Utc>, ScheduleError> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| calculation_failed(date.year(), date.month(), date.day()))
}

fn truncate_to_hour(instant: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    instant
        .with_minute(0)
        .and_then(|dt| dt.with_second(0))
        .ok_or_else(|| ScheduleError::CalculationFailed("failed to truncate to hour".to_string()))
}

fn truncate_to_minute(instant: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    instant
        .with_second(0)
        .ok_or_else(|| ScheduleError::CalculationFailed("failed to truncate to minute".to_string()))
}

fn calculation_failed(year: i32, month: u32, day: u32) -> ScheduleError {
    ScheduleError::CalculationFailed(format!("invalid date {year}-{month:02}-{day:02}"))
}
