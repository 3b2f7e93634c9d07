use chrono::{DateTime, Duration, Utc};

use crate::cron::{parse_field, parse_timezone, CronField, CrontabRule};
use crate::error::{Result, SchedulerError};
use crate::solar::SolarRule;
use crate::types::{
    CrontabSchedule, CrontabSpec, IntervalPeriod, IntervalSchedule, SolarSchedule,
};

/// A materialized schedule: answers "when is the next firing at or after T?".
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleRule {
    Interval(IntervalRule),
    Crontab(CrontabRule),
    Solar(SolarRule),
}

impl ScheduleRule {
    /// Next firing at or after `after`.
    ///
    /// `last_run_at` anchors interval rules (an entry that never ran is due
    /// immediately); crontab and solar rules depend only on the calendar.
    /// `None` means the rule never fires again.
    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            ScheduleRule::Interval(rule) => rule.next_occurrence(after, last_run_at),
            ScheduleRule::Crontab(rule) => rule.next_occurrence(after),
            ScheduleRule::Solar(rule) => rule.next_occurrence(after),
        }
    }

    /// Up to `count` consecutive firings starting at or after `after`, as if
    /// each one ran on time.
    pub fn upcoming(
        &self,
        after: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
        count: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let (mut after, mut last) = (after, last_run_at);
        while out.len() < count {
            let Some(at) = self.next_occurrence(after, last) else {
                break;
            };
            out.push(at);
            last = Some(at);
            after = at + Duration::microseconds(1);
        }
        out
    }
}

/// Fixed-duration repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalRule {
    every: Duration,
}

impl IntervalRule {
    pub fn new(every: i64, period: IntervalPeriod) -> Result<Self> {
        validate_interval(every)?;
        let duration = match period {
            IntervalPeriod::Days => Duration::try_days(every),
            IntervalPeriod::Hours => Duration::try_hours(every),
            IntervalPeriod::Minutes => Duration::try_minutes(every),
            IntervalPeriod::Seconds => Duration::try_seconds(every),
            IntervalPeriod::Microseconds => Some(Duration::microseconds(every)),
        }
        .ok_or_else(|| SchedulerError::invalid("every", format!("{every} {period} is too long")))?;
        Ok(Self { every: duration })
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match last_run_at {
            None => Some(after),
            Some(last) => Some(last.checked_add_signed(self.every)?.max(after)),
        }
    }
}

pub(crate) fn validate_interval(every: i64) -> Result<()> {
    if every <= 0 {
        return Err(SchedulerError::invalid(
            "every",
            format!("must be a positive integer, got {every}"),
        ));
    }
    Ok(())
}

/// Validate every crontab field and the zone, returning the canonical form
/// used for storage and dedup.
pub fn canonicalize_crontab(spec: &CrontabSpec) -> Result<CrontabSpec> {
    Ok(CrontabSpec {
        minute: parse_field(CronField::Minute, &spec.minute)?.canonical,
        hour: parse_field(CronField::Hour, &spec.hour)?.canonical,
        day_of_week: parse_field(CronField::DayOfWeek, &spec.day_of_week)?.canonical,
        day_of_month: parse_field(CronField::DayOfMonth, &spec.day_of_month)?.canonical,
        month_of_year: parse_field(CronField::MonthOfYear, &spec.month_of_year)?.canonical,
        timezone: parse_timezone(&spec.timezone)?.name().to_string(),
    })
}

impl IntervalSchedule {
    pub fn schedule(&self) -> Result<ScheduleRule> {
        Ok(ScheduleRule::Interval(IntervalRule::new(
            self.every,
            self.period,
        )?))
    }
}

impl CrontabSchedule {
    pub fn schedule(&self) -> Result<ScheduleRule> {
        Ok(ScheduleRule::Crontab(CrontabRule::new(
            &self.minute,
            &self.hour,
            &self.day_of_week,
            &self.day_of_month,
            &self.month_of_year,
            &self.timezone,
        )?))
    }
}

impl SolarSchedule {
    pub fn schedule(&self) -> Result<ScheduleRule> {
        Ok(ScheduleRule::Solar(SolarRule::new(
            self.event,
            self.latitude,
            self.longitude,
        )?))
    }
}

impl std::fmt::Display for IntervalSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.every == 1 {
            write!(f, "every {}", self.period.singular())
        } else {
            write!(f, "every {} {}", self.every, self.period)
        }
    }
}

impl std::fmt::Display for CrontabSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} (m/h/d/dM/MY) {}",
            self.minute,
            self.hour,
            self.day_of_week,
            self.day_of_month,
            self.month_of_year,
            self.timezone
        )
    }
}

impl std::fmt::Display for SolarSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.event, self.latitude, self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SolarEvent;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, h, m, 0).unwrap()
    }

    #[test]
    fn interval_never_run_is_due_now() {
        let rule = IntervalRule::new(5, IntervalPeriod::Minutes).unwrap();
        assert_eq!(rule.every(), Duration::minutes(5));
        assert_eq!(rule.next_occurrence(at(10, 0), None), Some(at(10, 0)));
    }

    #[test]
    fn interval_counts_from_last_run() {
        let rule = IntervalRule::new(5, IntervalPeriod::Minutes).unwrap();
        assert_eq!(
            rule.next_occurrence(at(10, 1), Some(at(10, 0))),
            Some(at(10, 5))
        );
        // Overdue: never report an instant before `after`.
        assert_eq!(
            rule.next_occurrence(at(11, 0), Some(at(10, 0))),
            Some(at(11, 0))
        );
    }

    #[test]
    fn upcoming_chains_occurrences() {
        let interval = ScheduleRule::Interval(IntervalRule::new(5, IntervalPeriod::Minutes).unwrap());
        assert_eq!(
            interval.upcoming(at(10, 0), None, 3),
            vec![at(10, 0), at(10, 5), at(10, 10)]
        );

        let hourly = ScheduleRule::Crontab(CrontabRule::new("0", "*", "*", "*", "*", "UTC").unwrap());
        assert_eq!(
            hourly.upcoming(at(10, 30), None, 2),
            vec![at(11, 0), at(12, 0)]
        );

        let never = ScheduleRule::Crontab(CrontabRule::new("0", "0", "*", "31", "2", "UTC").unwrap());
        assert!(never.upcoming(at(10, 0), None, 3).is_empty());
    }

    #[test]
    fn interval_rejects_non_positive_and_overflow() {
        assert!(matches!(
            IntervalRule::new(0, IntervalPeriod::Seconds),
            Err(SchedulerError::InvalidSchedule { field: "every", .. })
        ));
        assert!(IntervalRule::new(-3, IntervalPeriod::Days).is_err());
        assert!(IntervalRule::new(i64::MAX, IntervalPeriod::Days).is_err());
        assert!(IntervalRule::new(i64::MAX, IntervalPeriod::Microseconds).is_ok());
    }

    #[test]
    fn canonicalize_validates_every_field() {
        let spec = CrontabSpec {
            minute: "23".into(),
            hour: "00".into(),
            day_of_week: "2".into(),
            day_of_month: "23".into(),
            month_of_year: "12".into(),
            timezone: "UTC".into(),
        };
        let canonical = canonicalize_crontab(&spec).unwrap();
        assert_eq!(canonical.hour, "0");
        assert_eq!(canonical.minute, "23");

        let bad_tz = CrontabSpec {
            timezone: "Not/AZone".into(),
            ..spec.clone()
        };
        assert!(matches!(
            canonicalize_crontab(&bad_tz),
            Err(SchedulerError::InvalidSchedule { field: "timezone", .. })
        ));

        let bad_minute = CrontabSpec {
            minute: "200".into(),
            ..spec
        };
        assert!(matches!(
            canonicalize_crontab(&bad_minute),
            Err(SchedulerError::InvalidSchedule { field: "minute", .. })
        ));
    }

    #[test]
    fn descriptions() {
        let every_minute = IntervalSchedule {
            id: 1,
            every: 1,
            period: IntervalPeriod::Minutes,
        };
        assert_eq!(every_minute.to_string(), "every minute");
        let every_five = IntervalSchedule {
            every: 5,
            ..every_minute
        };
        assert_eq!(every_five.to_string(), "every 5 minutes");

        let cron = CrontabSchedule {
            id: 1,
            minute: "23".into(),
            hour: "0".into(),
            day_of_week: "2".into(),
            day_of_month: "23".into(),
            month_of_year: "12".into(),
            timezone: "UTC".into(),
        };
        assert_eq!(cron.to_string(), "23 0 2 23 12 (m/h/d/dM/MY) UTC");

        let solar = SolarSchedule {
            id: 1,
            event: SolarEvent::Sunrise,
            latitude: 51.5,
            longitude: -0.12,
        };
        assert_eq!(solar.to_string(), "sunrise (51.5, -0.12)");
    }
}
