use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unit of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalPeriod {
    Days,
    Hours,
    Minutes,
    Seconds,
    Microseconds,
}

impl IntervalPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            IntervalPeriod::Days => "days",
            IntervalPeriod::Hours => "hours",
            IntervalPeriod::Minutes => "minutes",
            IntervalPeriod::Seconds => "seconds",
            IntervalPeriod::Microseconds => "microseconds",
        }
    }

    /// "minutes" → "minute", for `every minute` style descriptions.
    pub fn singular(self) -> &'static str {
        let s = self.as_str();
        &s[..s.len() - 1]
    }
}

impl std::fmt::Display for IntervalPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntervalPeriod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "days" => Ok(IntervalPeriod::Days),
            "hours" => Ok(IntervalPeriod::Hours),
            "minutes" => Ok(IntervalPeriod::Minutes),
            "seconds" => Ok(IntervalPeriod::Seconds),
            "microseconds" => Ok(IntervalPeriod::Microseconds),
            other => Err(format!("unknown interval period: {other}")),
        }
    }
}

/// Named solar events. Dawn/dusk variants are the three twilight boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolarEvent {
    DawnAstronomical,
    DawnNautical,
    DawnCivil,
    Sunrise,
    SolarNoon,
    Sunset,
    DuskCivil,
    DuskNautical,
    DuskAstronomical,
}

impl SolarEvent {
    pub const ALL: [SolarEvent; 9] = [
        SolarEvent::DawnAstronomical,
        SolarEvent::DawnNautical,
        SolarEvent::DawnCivil,
        SolarEvent::Sunrise,
        SolarEvent::SolarNoon,
        SolarEvent::Sunset,
        SolarEvent::DuskCivil,
        SolarEvent::DuskNautical,
        SolarEvent::DuskAstronomical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SolarEvent::DawnAstronomical => "dawn_astronomical",
            SolarEvent::DawnNautical => "dawn_nautical",
            SolarEvent::DawnCivil => "dawn_civil",
            SolarEvent::Sunrise => "sunrise",
            SolarEvent::SolarNoon => "solar_noon",
            SolarEvent::Sunset => "sunset",
            SolarEvent::DuskCivil => "dusk_civil",
            SolarEvent::DuskNautical => "dusk_nautical",
            SolarEvent::DuskAstronomical => "dusk_astronomical",
        }
    }

    /// Solar altitude (degrees) that defines the event. `None` for solar
    /// noon, which is the meridian transit rather than an altitude crossing.
    pub fn altitude_deg(self) -> Option<f64> {
        match self {
            SolarEvent::DawnAstronomical | SolarEvent::DuskAstronomical => Some(-18.0),
            SolarEvent::DawnNautical | SolarEvent::DuskNautical => Some(-12.0),
            SolarEvent::DawnCivil | SolarEvent::DuskCivil => Some(-6.0),
            // Upper limb on the horizon, with standard refraction.
            SolarEvent::Sunrise | SolarEvent::Sunset => Some(-0.833),
            SolarEvent::SolarNoon => None,
        }
    }

    pub fn is_rising(self) -> bool {
        matches!(
            self,
            SolarEvent::DawnAstronomical
                | SolarEvent::DawnNautical
                | SolarEvent::DawnCivil
                | SolarEvent::Sunrise
        )
    }
}

impl std::fmt::Display for SolarEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SolarEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SolarEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown solar event: {s}"))
    }
}

/// A persisted interval schedule row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    pub id: i64,
    pub every: i64,
    pub period: IntervalPeriod,
}

/// Caller-supplied crontab definition, validated before it reaches the
/// database. Field strings accept `*`, numbers, `a-b` ranges, `/step` and
/// comma lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabSpec {
    #[serde(default = "star")]
    pub minute: String,
    #[serde(default = "star")]
    pub hour: String,
    #[serde(default = "star")]
    pub day_of_week: String,
    #[serde(default = "star")]
    pub day_of_month: String,
    #[serde(default = "star")]
    pub month_of_year: String,
    #[serde(default = "utc")]
    pub timezone: String,
}

impl Default for CrontabSpec {
    fn default() -> Self {
        Self {
            minute: star(),
            hour: star(),
            day_of_week: star(),
            day_of_month: star(),
            month_of_year: star(),
            timezone: utc(),
        }
    }
}

fn star() -> String {
    "*".to_string()
}
fn utc() -> String {
    "UTC".to_string()
}

/// A persisted crontab schedule row. Field strings are stored canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabSchedule {
    pub id: i64,
    pub minute: String,
    pub hour: String,
    pub day_of_week: String,
    pub day_of_month: String,
    pub month_of_year: String,
    pub timezone: String,
}

/// A persisted solar schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolarSchedule {
    pub id: i64,
    pub event: SolarEvent,
    pub latitude: f64,
    pub longitude: f64,
}

/// Link from a task entry to the one schedule row that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ScheduleRef {
    Interval(i64),
    Crontab(i64),
    Solar(i64),
}

impl ScheduleRef {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleRef::Interval(_) => "interval",
            ScheduleRef::Crontab(_) => "crontab",
            ScheduleRef::Solar(_) => "solar",
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            ScheduleRef::Interval(id) | ScheduleRef::Crontab(id) | ScheduleRef::Solar(id) => id,
        }
    }

    /// Split into the three nullable columns `(interval_id, crontab_id, solar_id)`.
    pub(crate) fn columns(link: Option<ScheduleRef>) -> (Option<i64>, Option<i64>, Option<i64>) {
        match link {
            Some(ScheduleRef::Interval(id)) => (Some(id), None, None),
            Some(ScheduleRef::Crontab(id)) => (None, Some(id), None),
            Some(ScheduleRef::Solar(id)) => (None, None, Some(id)),
            None => (None, None, None),
        }
    }

    /// Rebuild from the three columns, checking interval, crontab, solar in
    /// that order.
    pub(crate) fn from_columns(
        interval_id: Option<i64>,
        crontab_id: Option<i64>,
        solar_id: Option<i64>,
    ) -> Option<ScheduleRef> {
        interval_id
            .map(ScheduleRef::Interval)
            .or(crontab_id.map(ScheduleRef::Crontab))
            .or(solar_id.map(ScheduleRef::Solar))
    }
}

/// A schedule definition that has not been resolved to a stored row yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Interval {
        every: i64,
        period: IntervalPeriod,
    },
    Crontab(CrontabSpec),
    Solar {
        event: SolarEvent,
        latitude: f64,
        longitude: f64,
    },
}

impl ScheduleSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleSpec::Interval { .. } => "interval",
            ScheduleSpec::Crontab(_) => "crontab",
            ScheduleSpec::Solar { .. } => "solar",
        }
    }
}

/// A persisted periodic task entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Integer primary key.
    pub id: i64,
    /// Unique human-assigned name.
    pub name: String,
    /// Identifier of the task the scheduler will invoke.
    pub task: String,
    /// The driving schedule, if one is linked.
    pub schedule: Option<ScheduleRef>,
    /// Positional arguments (a JSON array).
    pub args: serde_json::Value,
    /// Keyword arguments (a JSON object).
    pub kwargs: serde_json::Value,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub priority: Option<i64>,
    /// Missed firings after this instant are skipped.
    pub expires: Option<DateTime<Utc>>,
    /// Fire once, then disable.
    pub one_off: bool,
    /// Never fire before this instant.
    pub start_time: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Incremented by the consuming scheduler through `record_run`.
    pub total_run_count: i64,
    /// Maintained by the store on every write.
    pub date_changed: DateTime<Utc>,
    pub description: String,
}

/// Everything needed to insert a task entry. Optional fields default to the
/// same values the schema does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub task: String,
    pub schedule: Option<ScheduleRef>,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
    #[serde(default = "empty_kwargs")]
    pub kwargs: serde_json::Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub one_off: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

impl NewTask {
    pub fn new(name: impl Into<String>, task: impl Into<String>, schedule: ScheduleRef) -> Self {
        Self {
            schedule: Some(schedule),
            ..Self::unscheduled(name, task)
        }
    }

    /// An entry with no schedule link yet, e.g. for
    /// `PeriodicStore::schedule_task`, which fills the link in.
    pub fn unscheduled(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            schedule: None,
            args: empty_args(),
            kwargs: empty_kwargs(),
            queue: None,
            exchange: None,
            routing_key: None,
            priority: None,
            expires: None,
            one_off: false,
            start_time: None,
            enabled: true,
            description: String::new(),
        }
    }
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}
fn empty_kwargs() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
fn enabled_by_default() -> bool {
    true
}

/// Partial update of a task entry. `None` leaves a field untouched; the
/// nested `Option`s distinguish "leave" from "clear".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub task: Option<String>,
    pub schedule: Option<Option<ScheduleRef>>,
    pub args: Option<serde_json::Value>,
    pub kwargs: Option<serde_json::Value>,
    pub queue: Option<Option<String>>,
    pub exchange: Option<Option<String>>,
    pub routing_key: Option<Option<String>>,
    pub priority: Option<Option<i64>>,
    pub expires: Option<Option<DateTime<Utc>>>,
    pub one_off: Option<bool>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub enabled: Option<bool>,
    pub last_run_at: Option<Option<DateTime<Utc>>>,
    pub total_run_count: Option<i64>,
    pub description: Option<String>,
}

impl TaskUpdate {
    /// Apply this update to an in-memory entry.
    pub(crate) fn apply_to(&self, entry: &mut TaskEntry) {
        if let Some(v) = &self.name {
            entry.name = v.clone();
        }
        if let Some(v) = &self.task {
            entry.task = v.clone();
        }
        if let Some(v) = self.schedule {
            entry.schedule = v;
        }
        if let Some(v) = &self.args {
            entry.args = v.clone();
        }
        if let Some(v) = &self.kwargs {
            entry.kwargs = v.clone();
        }
        if let Some(v) = &self.queue {
            entry.queue = v.clone();
        }
        if let Some(v) = &self.exchange {
            entry.exchange = v.clone();
        }
        if let Some(v) = &self.routing_key {
            entry.routing_key = v.clone();
        }
        if let Some(v) = self.priority {
            entry.priority = v;
        }
        if let Some(v) = self.expires {
            entry.expires = v;
        }
        if let Some(v) = self.one_off {
            entry.one_off = v;
        }
        if let Some(v) = self.start_time {
            entry.start_time = v;
        }
        if let Some(v) = self.enabled {
            entry.enabled = v;
        }
        if let Some(v) = self.last_run_at {
            entry.last_run_at = v;
        }
        if let Some(v) = self.total_run_count {
            entry.total_run_count = v;
        }
        if let Some(v) = &self.description {
            entry.description = v.clone();
        }
    }
}

/// Whether a write should bump the change ledger.
///
/// `Suppress` is for bookkeeping-only writes (run counters) that consumers
/// do not need to reload for. It applies to the one call it is passed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Notify {
    #[default]
    Publish,
    Suppress,
}
