//! Crontab field parsing and timezone-aware occurrence search.
//!
//! Field grammar, per field: `*`, `n`, `a-b`, each optionally followed by
//! `/step`, joined by commas. Numbers are at most two digits. Day of week
//! counts from Sunday = 0. Day of month and day of week must *both* match.

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// How far ahead `next_occurrence` searches before giving up. The Gregorian
/// calendar repeats its weekday/leap-year pattern every 400 years (146,097
/// days), so any date the fields can ever match is found within it.
const SEARCH_HORIZON_DAYS: u64 = 146_097;

/// Longest month length for each month (February counts 29).
const MAX_DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// The five crontab columns, with their valid ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfWeek,
    DayOfMonth,
    MonthOfYear,
}

impl CronField {
    pub fn name(self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfWeek => "day_of_week",
            CronField::DayOfMonth => "day_of_month",
            CronField::MonthOfYear => "month_of_year",
        }
    }

    /// Inclusive `(min, max)`.
    pub fn bounds(self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfWeek => (0, 6),
            CronField::DayOfMonth => (1, 31),
            CronField::MonthOfYear => (1, 12),
        }
    }
}

/// Set of allowed values for one field. Every range fits in 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueSet(u64);

impl ValueSet {
    fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }

    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    /// Allowed values in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |v| self.contains(*v))
    }
}

/// A validated field: the value set plus its canonical text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedField {
    pub values: ValueSet,
    pub canonical: String,
}

/// Parse and validate one crontab field.
///
/// The canonical form drops whitespace and leading zeros so that equal
/// schedules compare equal as strings (`" 00 "` → `"0"`).
pub fn parse_field(field: CronField, raw: &str) -> Result<ParsedField> {
    let name = field.name();
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(SchedulerError::invalid(name, "must not be empty"));
    }

    let mut values = ValueSet::default();
    let mut parts = Vec::new();
    for part in compact.split(',') {
        if part.is_empty() {
            return Err(SchedulerError::invalid(
                name,
                format!("empty list item in {compact:?}"),
            ));
        }
        parts.push(parse_part(field, part, &mut values)?);
    }

    Ok(ParsedField {
        values,
        canonical: parts.join(","),
    })
}

/// Parse one comma-separated item, adding its values to `values` and
/// returning its canonical text.
fn parse_part(field: CronField, part: &str, values: &mut ValueSet) -> Result<String> {
    let name = field.name();
    let (lo, hi) = field.bounds();

    let (base, step) = match part.split_once('/') {
        Some((base, step)) => {
            let step = parse_number(field, step)?;
            if step == 0 {
                return Err(SchedulerError::invalid(name, "step must be at least 1"));
            }
            (base, Some(step))
        }
        None => (part, None),
    };

    let (start, end, base_text) = if base == "*" {
        (lo, hi, "*".to_string())
    } else if let Some((a, b)) = base.split_once('-') {
        let a = parse_in_range(field, a)?;
        let b = parse_in_range(field, b)?;
        if a > b {
            return Err(SchedulerError::invalid(
                name,
                format!("range {a}-{b} runs backwards"),
            ));
        }
        (a, b, format!("{a}-{b}"))
    } else {
        let n = parse_in_range(field, base)?;
        // `n/step` means "from n to the end of the range, every step".
        let end = if step.is_some() { hi } else { n };
        (n, end, n.to_string())
    };

    let step = step.unwrap_or(1);
    let mut v = start;
    while v <= end {
        values.insert(v);
        v += step;
    }

    Ok(match step {
        1 if !part.contains('/') => base_text,
        s => format!("{base_text}/{s}"),
    })
}

fn parse_number(field: CronField, token: &str) -> Result<u32> {
    let name = field.name();
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
        return Err(SchedulerError::invalid(
            name,
            format!("{token:?} is not a number"),
        ));
    }
    if token.len() > 2 {
        return Err(SchedulerError::invalid(
            name,
            format!("{token:?} has more than two digits"),
        ));
    }
    token
        .parse()
        .map_err(|_| SchedulerError::invalid(name, format!("{token:?} is not a number")))
}

fn parse_in_range(field: CronField, token: &str) -> Result<u32> {
    let n = parse_number(field, token)?;
    let (lo, hi) = field.bounds();
    if n < lo || n > hi {
        return Err(SchedulerError::invalid(
            field.name(),
            format!("{n} is out of range {lo}-{hi}"),
        ));
    }
    Ok(n)
}

/// Resolve an IANA zone name.
pub fn parse_timezone(raw: &str) -> Result<Tz> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(SchedulerError::invalid("timezone", "must not be empty"));
    }
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::invalid("timezone", format!("unknown zone {name:?}")))
}

/// Materialized crontab: answers "next firing at or after T" in its own zone.
#[derive(Debug, Clone, PartialEq)]
pub struct CrontabRule {
    minutes: ValueSet,
    hours: ValueSet,
    days_of_week: ValueSet,
    days_of_month: ValueSet,
    months: ValueSet,
    tz: Tz,
}

impl CrontabRule {
    pub fn new(
        minute: &str,
        hour: &str,
        day_of_week: &str,
        day_of_month: &str,
        month_of_year: &str,
        timezone: &str,
    ) -> Result<Self> {
        Ok(Self {
            minutes: parse_field(CronField::Minute, minute)?.values,
            hours: parse_field(CronField::Hour, hour)?.values,
            days_of_week: parse_field(CronField::DayOfWeek, day_of_week)?.values,
            days_of_month: parse_field(CronField::DayOfMonth, day_of_month)?.values,
            months: parse_field(CronField::MonthOfYear, month_of_year)?.values,
            tz: parse_timezone(timezone)?,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Whether a wall-clock time in the rule's zone matches every field.
    pub fn matches_local(&self, local: &NaiveDateTime) -> bool {
        self.months.contains(local.month())
            && self.days_of_month.contains(local.day())
            && self
                .days_of_week
                .contains(local.weekday().num_days_from_sunday())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
    }

    /// Whether some allowed month has an allowed day of month at all.
    /// `31 February` style rules fail this and never fire.
    fn has_possible_date(&self) -> bool {
        self.months.iter().any(|month| {
            let longest = MAX_DAYS_IN_MONTH[(month - 1) as usize];
            self.days_of_month.iter().any(|day| day <= longest)
        })
    }

    /// First instant at or after `after` whose wall-clock time in the rule's
    /// zone matches.
    ///
    /// Wall-clock times skipped by a forward DST jump never fire. Times
    /// repeated by a backward jump fire once, on their first pass.
    /// Returns `None` when the fields can never match (e.g. 31 February).
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.has_possible_date() {
            return None;
        }
        let local = after.with_timezone(&self.tz).naive_local();
        let mut start = local.with_second(0)?.with_nanosecond(0)?;
        if start < local {
            start = start.checked_add_signed(Duration::minutes(1))?;
        }

        let mut date = start.date();
        let horizon = date
            .checked_add_days(Days::new(SEARCH_HORIZON_DAYS))
            .unwrap_or(NaiveDate::MAX);
        while date <= horizon {
            if self.months.contains(date.month())
                && self.days_of_month.contains(date.day())
                && self
                    .days_of_week
                    .contains(date.weekday().num_days_from_sunday())
            {
                for hour in self.hours.iter() {
                    for minute in self.minutes.iter() {
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        if naive < start {
                            continue;
                        }
                        let candidate = match self.tz.from_local_datetime(&naive) {
                            LocalResult::Single(dt) => dt,
                            LocalResult::Ambiguous(first, _) => first,
                            LocalResult::None => continue,
                        };
                        let utc = candidate.with_timezone(&Utc);
                        if utc >= after {
                            return Some(utc);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}
