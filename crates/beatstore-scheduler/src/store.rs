use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument};

use beatstore_core::config::DatabaseConfig;

use crate::{
    clock::{Clock, SystemClock},
    db,
    error::{Result, SchedulerError},
    ledger,
    schedule::{canonicalize_crontab, IntervalRule, ScheduleRule},
    solar::validate_coordinates,
    types::{
        CrontabSchedule, CrontabSpec, IntervalPeriod, IntervalSchedule, NewTask, Notify,
        ScheduleRef, ScheduleSpec, SolarEvent, SolarSchedule, TaskEntry, TaskUpdate,
    },
};

const TASK_COLUMNS: &str = "id, name, task, interval_id, crontab_id, solar_id, args, kwargs,
    queue, exchange, routing_key, priority, expires, one_off, start_time, enabled,
    last_run_at, total_run_count, date_changed, description";

/// Persistent store for periodic task entries and their schedules.
///
/// Every mutating method runs in one `BEGIN IMMEDIATE` transaction and
/// stamps the change ledger inside it, so a polling scheduler sees each
/// committed change through [`PeriodicStore::last_change_timestamp`].
///
/// Wraps a single SQLite connection in a `Mutex`; other processes open
/// their own connections to the same file.
pub struct PeriodicStore {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PeriodicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicStore").finish_non_exhaustive()
    }
}

impl PeriodicStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    pub fn with_clock(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock,
        })
    }

    /// Open (and initialise) the database file named in `config`.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        Self::new(db::open(config)?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    /// The write path shared by every mutation.
    ///
    /// `op` reports whether it changed anything and, if so, whether that
    /// change should be published. The ledger stamp is written in the same
    /// transaction, so the two commit or roll back together.
    fn write<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>, DateTime<Utc>) -> Result<(T, Option<Notify>)>,
    ) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = self.clock.now();
        let (value, change) = op(&tx, now)?;
        match change {
            Some(Notify::Publish) => {
                ledger::record_change(&tx, now)?;
            }
            Some(Notify::Suppress) => debug!("change ledger update suppressed"),
            None => {}
        }
        tx.commit()?;
        Ok(value)
    }

    // --- schedules ---------------------------------------------------------

    /// Return the interval row for `(every, period)`, creating it if absent.
    #[instrument(skip(self))]
    pub fn get_or_create_interval(
        &self,
        every: i64,
        period: IntervalPeriod,
    ) -> Result<IntervalSchedule> {
        IntervalRule::new(every, period)?;
        self.write(|tx, _| {
            let (row, created) = upsert_interval(tx, every, period)?;
            Ok((row, created.then_some(Notify::Publish)))
        })
    }

    /// Validate `spec` and return the matching crontab row, creating it if
    /// absent. Nothing is written when validation fails.
    #[instrument(skip(self, spec), fields(minute = %spec.minute, hour = %spec.hour, tz = %spec.timezone))]
    pub fn get_or_create_crontab(&self, spec: &CrontabSpec) -> Result<CrontabSchedule> {
        let canonical = canonicalize_crontab(spec)?;
        self.write(|tx, _| {
            let (row, created) = upsert_crontab(tx, &canonical)?;
            Ok((row, created.then_some(Notify::Publish)))
        })
    }

    #[instrument(skip(self))]
    pub fn get_or_create_solar(
        &self,
        event: SolarEvent,
        latitude: f64,
        longitude: f64,
    ) -> Result<SolarSchedule> {
        validate_coordinates(latitude, longitude)?;
        self.write(|tx, _| {
            let (row, created) = upsert_solar(tx, event, latitude, longitude)?;
            Ok((row, created.then_some(Notify::Publish)))
        })
    }

    pub fn get_interval(&self, id: i64) -> Result<IntervalSchedule> {
        fetch_interval(&*self.conn()?, id)
    }

    pub fn get_crontab(&self, id: i64) -> Result<CrontabSchedule> {
        fetch_crontab(&*self.conn()?, id)
    }

    pub fn get_solar(&self, id: i64) -> Result<SolarSchedule> {
        fetch_solar(&*self.conn()?, id)
    }

    /// Delete a schedule row. Refuses while any task entry links to it.
    #[instrument(skip(self))]
    pub fn delete_schedule(&self, link: ScheduleRef) -> Result<()> {
        self.write(|tx, _| {
            ensure_schedule_exists(tx, link)?;
            let (table, column) = match link {
                ScheduleRef::Interval(_) => ("interval_schedule", "interval_id"),
                ScheduleRef::Crontab(_) => ("crontab_schedule", "crontab_id"),
                ScheduleRef::Solar(_) => ("solar_schedule", "solar_id"),
            };
            let tasks: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM periodic_task WHERE {column} = ?1"),
                [link.id()],
                |row| row.get(0),
            )?;
            if tasks > 0 {
                return Err(SchedulerError::ScheduleInUse {
                    kind: link.kind(),
                    id: link.id(),
                    tasks,
                });
            }
            tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [link.id()])?;
            info!(kind = link.kind(), id = link.id(), "schedule deleted");
            Ok(((), Some(Notify::Publish)))
        })
    }

    /// Build the occurrence rule for `entry` from its linked schedule row.
    ///
    /// Fails with [`SchedulerError::NoSchedule`] when nothing is linked;
    /// there is no fallback rule.
    pub fn materialize_schedule(&self, entry: &TaskEntry) -> Result<ScheduleRule> {
        let link = entry.schedule.ok_or_else(|| SchedulerError::NoSchedule {
            name: entry.name.clone(),
        })?;
        let conn = self.conn()?;
        match link {
            ScheduleRef::Interval(id) => fetch_interval(&conn, id)?.schedule(),
            ScheduleRef::Crontab(id) => fetch_crontab(&conn, id)?.schedule(),
            ScheduleRef::Solar(id) => fetch_solar(&conn, id)?.schedule(),
        }
    }

    /// `"name: every 5 minutes"`, or `"name: {no schedule}"`.
    pub fn describe_task(&self, entry: &TaskEntry) -> Result<String> {
        let conn = self.conn()?;
        let schedule = match entry.schedule {
            Some(ScheduleRef::Interval(id)) => fetch_interval(&conn, id)?.to_string(),
            Some(ScheduleRef::Crontab(id)) => fetch_crontab(&conn, id)?.to_string(),
            Some(ScheduleRef::Solar(id)) => fetch_solar(&conn, id)?.to_string(),
            None => "{no schedule}".to_string(),
        };
        Ok(format!("{}: {}", entry.name, schedule))
    }

    // --- change ledger -----------------------------------------------------

    /// When any tracked row last changed, or `None` if nothing ever has.
    pub fn last_change_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        ledger::last_change(&*self.conn()?)
    }

    /// Ledger stamp and all enabled entries, read in one transaction so the
    /// stamp is never newer than the rows returned with it.
    pub fn enabled_snapshot(&self) -> Result<(Option<DateTime<Utc>>, Vec<TaskEntry>)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stamp = ledger::last_change(&tx)?;
        let entries = query_tasks(&tx, "WHERE enabled = 1")?;
        tx.commit()?;
        Ok((stamp, entries))
    }

    // --- task entries ------------------------------------------------------

    /// Insert a task entry linked to an existing schedule row.
    #[instrument(skip(self, new), fields(name = %new.name, task = %new.task))]
    pub fn create_task(&self, new: &NewTask) -> Result<TaskEntry> {
        validate_task_fields(&new.name, &new.task, &new.args, &new.kwargs)?;
        self.write(|tx, now| {
            let entry = insert_task(tx, new, now)?;
            Ok((entry, Some(Notify::Publish)))
        })
    }

    /// Create (or reuse) the schedule row described by `spec` and insert
    /// `new` linked to it, all in one transaction. Any link already set on
    /// `new` is replaced. If the insert fails, no schedule row is left behind.
    #[instrument(skip(self, new, spec), fields(name = %new.name, kind = spec.kind()))]
    pub fn schedule_task(&self, mut new: NewTask, spec: &ScheduleSpec) -> Result<TaskEntry> {
        validate_task_fields(&new.name, &new.task, &new.args, &new.kwargs)?;
        let spec = validate_schedule(spec)?;
        self.write(|tx, now| {
            new.schedule = Some(upsert_schedule(tx, &spec)?);
            let entry = insert_task(tx, &new, now)?;
            Ok((entry, Some(Notify::Publish)))
        })
    }

    #[instrument(skip(self))]
    pub fn get_task(&self, id: i64) -> Result<TaskEntry> {
        fetch_task(&*self.conn()?, id)
    }

    /// Look up an entry by its unique name, returning `None` if absent.
    #[instrument(skip(self))]
    pub fn get_task_by_name(&self, name: &str) -> Result<Option<TaskEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM periodic_task WHERE name = ?1"),
                [name],
                row_to_task,
            )
            .optional()?;
        Ok(entry)
    }

    /// All entries ordered by id.
    pub fn list_tasks(&self) -> Result<Vec<TaskEntry>> {
        query_tasks(&*self.conn()?, "")
    }

    /// Entries the scheduler should currently be computing occurrences for.
    pub fn list_enabled_tasks(&self) -> Result<Vec<TaskEntry>> {
        query_tasks(&*self.conn()?, "WHERE enabled = 1")
    }

    /// Apply `update` to entry `id`.
    ///
    /// Pass [`Notify::Suppress`] for bookkeeping-only writes that consumers
    /// need not reload for; the flag affects this call only.
    #[instrument(skip(self, update))]
    pub fn update_task(&self, id: i64, update: &TaskUpdate, notify: Notify) -> Result<TaskEntry> {
        self.write(|tx, now| {
            let mut entry = fetch_task(tx, id)?;
            let old_name = entry.name.clone();
            update.apply_to(&mut entry);
            validate_task_fields(&entry.name, &entry.task, &entry.args, &entry.kwargs)?;
            if entry.name != old_name && name_taken(tx, &entry.name)? {
                return Err(SchedulerError::DuplicateName { name: entry.name });
            }
            if let Some(Some(link)) = update.schedule {
                ensure_schedule_exists(tx, link)?;
            }
            entry.date_changed = now;
            store_task(tx, &entry)?;
            info!(task_id = id, name = %entry.name, ?notify, "task updated");
            Ok((entry, Some(notify)))
        })
    }

    /// Switch an entry on or off. Run history is left as it is.
    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<TaskEntry> {
        let update = TaskUpdate {
            enabled: Some(enabled),
            ..TaskUpdate::default()
        };
        self.update_task(id, &update, Notify::Publish)
    }

    /// Record that the scheduler ran entry `id` at `ran_at`.
    ///
    /// Counter bookkeeping does not notify consumers, except when a one-off
    /// entry is disabled by its run: that is a visible state change.
    #[instrument(skip(self))]
    pub fn record_run(&self, id: i64, ran_at: DateTime<Utc>) -> Result<TaskEntry> {
        self.write(|tx, now| {
            let mut entry = fetch_task(tx, id)?;
            entry.total_run_count += 1;
            entry.last_run_at = Some(ran_at);
            let notify = if entry.one_off && entry.enabled {
                entry.enabled = false;
                info!(task_id = id, name = %entry.name, "one-off task disabled after run");
                Notify::Publish
            } else {
                Notify::Suppress
            };
            entry.date_changed = now;
            store_task(tx, &entry)?;
            Ok((entry, Some(notify)))
        })
    }

    /// Delete entry `id` and return it. Its schedule row is kept.
    #[instrument(skip(self))]
    pub fn delete_task(&self, id: i64) -> Result<TaskEntry> {
        self.write(|tx, _| {
            let entry = fetch_task(tx, id)?;
            tx.execute("DELETE FROM periodic_task WHERE id = ?1", [id])?;
            info!(task_id = id, name = %entry.name, "task deleted");
            Ok((entry, Some(Notify::Publish)))
        })
    }
}

// --- schedule rows ---------------------------------------------------------

/// Insert-if-absent keyed on the full field tuple, then read back.
/// Returns the row and whether this call created it.
fn upsert_interval(
    tx: &Transaction<'_>,
    every: i64,
    period: IntervalPeriod,
) -> Result<(IntervalSchedule, bool)> {
    let inserted = tx.execute(
        "INSERT INTO interval_schedule (every, period) VALUES (?1, ?2)
         ON CONFLICT (every, period) DO NOTHING",
        rusqlite::params![every, period],
    )?;
    let row = tx.query_row(
        "SELECT id, every, period FROM interval_schedule WHERE every = ?1 AND period = ?2",
        rusqlite::params![every, period],
        row_to_interval,
    )?;
    log_upsert("interval", row.id, inserted);
    Ok((row, inserted > 0))
}

fn upsert_crontab(tx: &Transaction<'_>, spec: &CrontabSpec) -> Result<(CrontabSchedule, bool)> {
    let params = (
        &spec.minute,
        &spec.hour,
        &spec.day_of_week,
        &spec.day_of_month,
        &spec.month_of_year,
        &spec.timezone,
    );
    let inserted = tx.execute(
        "INSERT INTO crontab_schedule
         (minute, hour, day_of_week, day_of_month, month_of_year, timezone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (minute, hour, day_of_week, day_of_month, month_of_year, timezone)
         DO NOTHING",
        params,
    )?;
    let row = tx.query_row(
        "SELECT id, minute, hour, day_of_week, day_of_month, month_of_year, timezone
         FROM crontab_schedule
         WHERE minute = ?1 AND hour = ?2 AND day_of_week = ?3
           AND day_of_month = ?4 AND month_of_year = ?5 AND timezone = ?6",
        params,
        row_to_crontab,
    )?;
    log_upsert("crontab", row.id, inserted);
    Ok((row, inserted > 0))
}

fn upsert_solar(
    tx: &Transaction<'_>,
    event: SolarEvent,
    latitude: f64,
    longitude: f64,
) -> Result<(SolarSchedule, bool)> {
    // Adding 0.0 folds -0.0 into 0.0 so both spellings share a row.
    let (latitude, longitude) = (latitude + 0.0, longitude + 0.0);
    let inserted = tx.execute(
        "INSERT INTO solar_schedule (event, latitude, longitude) VALUES (?1, ?2, ?3)
         ON CONFLICT (event, latitude, longitude) DO NOTHING",
        rusqlite::params![event, latitude, longitude],
    )?;
    let row = tx.query_row(
        "SELECT id, event, latitude, longitude FROM solar_schedule
         WHERE event = ?1 AND latitude = ?2 AND longitude = ?3",
        rusqlite::params![event, latitude, longitude],
        row_to_solar,
    )?;
    log_upsert("solar", row.id, inserted);
    Ok((row, inserted > 0))
}

/// Check `spec` before any write, returning it with crontab fields in
/// canonical form.
fn validate_schedule(spec: &ScheduleSpec) -> Result<ScheduleSpec> {
    match spec {
        ScheduleSpec::Interval { every, period } => {
            IntervalRule::new(*every, *period)?;
        }
        ScheduleSpec::Crontab(crontab) => {
            return Ok(ScheduleSpec::Crontab(canonicalize_crontab(crontab)?));
        }
        ScheduleSpec::Solar {
            latitude,
            longitude,
            ..
        } => validate_coordinates(*latitude, *longitude)?,
    }
    Ok(spec.clone())
}

fn upsert_schedule(tx: &Transaction<'_>, spec: &ScheduleSpec) -> Result<ScheduleRef> {
    let link = match spec {
        ScheduleSpec::Interval { every, period } => {
            ScheduleRef::Interval(upsert_interval(tx, *every, *period)?.0.id)
        }
        ScheduleSpec::Crontab(crontab) => ScheduleRef::Crontab(upsert_crontab(tx, crontab)?.0.id),
        ScheduleSpec::Solar {
            event,
            latitude,
            longitude,
        } => ScheduleRef::Solar(upsert_solar(tx, *event, *latitude, *longitude)?.0.id),
    };
    Ok(link)
}

fn log_upsert(kind: &'static str, id: i64, inserted: usize) {
    if inserted > 0 {
        info!(kind, id, "schedule created");
    } else {
        debug!(kind, id, "schedule reused");
    }
}

fn fetch_interval(conn: &Connection, id: i64) -> Result<IntervalSchedule> {
    conn.query_row(
        "SELECT id, every, period FROM interval_schedule WHERE id = ?1",
        [id],
        row_to_interval,
    )
    .optional()?
    .ok_or(SchedulerError::ScheduleNotFound {
        kind: "interval",
        id,
    })
}

fn fetch_crontab(conn: &Connection, id: i64) -> Result<CrontabSchedule> {
    conn.query_row(
        "SELECT id, minute, hour, day_of_week, day_of_month, month_of_year, timezone
         FROM crontab_schedule WHERE id = ?1",
        [id],
        row_to_crontab,
    )
    .optional()?
    .ok_or(SchedulerError::ScheduleNotFound {
        kind: "crontab",
        id,
    })
}

fn fetch_solar(conn: &Connection, id: i64) -> Result<SolarSchedule> {
    conn.query_row(
        "SELECT id, event, latitude, longitude FROM solar_schedule WHERE id = ?1",
        [id],
        row_to_solar,
    )
    .optional()?
    .ok_or(SchedulerError::ScheduleNotFound { kind: "solar", id })
}

fn ensure_schedule_exists(conn: &Connection, link: ScheduleRef) -> Result<()> {
    match link {
        ScheduleRef::Interval(id) => fetch_interval(conn, id).map(drop),
        ScheduleRef::Crontab(id) => fetch_crontab(conn, id).map(drop),
        ScheduleRef::Solar(id) => fetch_solar(conn, id).map(drop),
    }
}

fn row_to_interval(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntervalSchedule> {
    Ok(IntervalSchedule {
        id: row.get(0)?,
        every: row.get(1)?,
        period: row.get(2)?,
    })
}

fn row_to_crontab(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrontabSchedule> {
    Ok(CrontabSchedule {
        id: row.get(0)?,
        minute: row.get(1)?,
        hour: row.get(2)?,
        day_of_week: row.get(3)?,
        day_of_month: row.get(4)?,
        month_of_year: row.get(5)?,
        timezone: row.get(6)?,
    })
}

fn row_to_solar(row: &rusqlite::Row<'_>) -> rusqlite::Result<SolarSchedule> {
    Ok(SolarSchedule {
        id: row.get(0)?,
        event: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
    })
}

// --- task rows -------------------------------------------------------------

fn validate_task_fields(
    name: &str,
    task: &str,
    args: &serde_json::Value,
    kwargs: &serde_json::Value,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SchedulerError::InvalidTask {
            field: "name",
            reason: "must not be empty".into(),
        });
    }
    if task.trim().is_empty() {
        return Err(SchedulerError::InvalidTask {
            field: "task",
            reason: "must not be empty".into(),
        });
    }
    if !args.is_array() {
        return Err(SchedulerError::InvalidTask {
            field: "args",
            reason: format!("expected a JSON array, got {args}"),
        });
    }
    if !kwargs.is_object() {
        return Err(SchedulerError::InvalidTask {
            field: "kwargs",
            reason: format!("expected a JSON object, got {kwargs}"),
        });
    }
    Ok(())
}

fn name_taken(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM periodic_task WHERE name = ?1)",
        [name],
        |row| row.get(0),
    )?)
}

fn insert_task(tx: &Transaction<'_>, new: &NewTask, now: DateTime<Utc>) -> Result<TaskEntry> {
    if name_taken(tx, &new.name)? {
        return Err(SchedulerError::DuplicateName {
            name: new.name.clone(),
        });
    }
    if let Some(link) = new.schedule {
        ensure_schedule_exists(tx, link)?;
    }
    let (interval_id, crontab_id, solar_id) = ScheduleRef::columns(new.schedule);
    tx.execute(
        "INSERT INTO periodic_task
         (name, task, interval_id, crontab_id, solar_id, args, kwargs, queue, exchange,
          routing_key, priority, expires, one_off, start_time, enabled, last_run_at,
          total_run_count, date_changed, description)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,NULL,0,?16,?17)",
        rusqlite::params![
            new.name,
            new.task,
            interval_id,
            crontab_id,
            solar_id,
            serde_json::to_string(&new.args)?,
            serde_json::to_string(&new.kwargs)?,
            new.queue,
            new.exchange,
            new.routing_key,
            new.priority,
            new.expires.as_ref().map(timestamp),
            new.one_off,
            new.start_time.as_ref().map(timestamp),
            new.enabled,
            timestamp(&now),
            new.description,
        ],
    )?;
    let id = tx.last_insert_rowid();
    info!(task_id = id, name = %new.name, "task created");
    fetch_task(tx, id)
}

/// Overwrite every column of an existing row from `entry`.
fn store_task(tx: &Transaction<'_>, entry: &TaskEntry) -> Result<()> {
    let (interval_id, crontab_id, solar_id) = ScheduleRef::columns(entry.schedule);
    let n = tx.execute(
        "UPDATE periodic_task SET
             name = ?1, task = ?2, interval_id = ?3, crontab_id = ?4, solar_id = ?5,
             args = ?6, kwargs = ?7, queue = ?8, exchange = ?9, routing_key = ?10,
             priority = ?11, expires = ?12, one_off = ?13, start_time = ?14,
             enabled = ?15, last_run_at = ?16, total_run_count = ?17,
             date_changed = ?18, description = ?19
         WHERE id = ?20",
        rusqlite::params![
            entry.name,
            entry.task,
            interval_id,
            crontab_id,
            solar_id,
            serde_json::to_string(&entry.args)?,
            serde_json::to_string(&entry.kwargs)?,
            entry.queue,
            entry.exchange,
            entry.routing_key,
            entry.priority,
            entry.expires.as_ref().map(timestamp),
            entry.one_off,
            entry.start_time.as_ref().map(timestamp),
            entry.enabled,
            entry.last_run_at.as_ref().map(timestamp),
            entry.total_run_count,
            timestamp(&entry.date_changed),
            entry.description,
            entry.id,
        ],
    )?;
    if n == 0 {
        return Err(SchedulerError::TaskNotFound { id: entry.id });
    }
    Ok(())
}

fn fetch_task(conn: &Connection, id: i64) -> Result<TaskEntry> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM periodic_task WHERE id = ?1"),
        [id],
        row_to_task,
    )
    .optional()?
    .ok_or(SchedulerError::TaskNotFound { id })
}

fn query_tasks(conn: &Connection, filter: &str) -> Result<Vec<TaskEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM periodic_task {filter} ORDER BY id"
    ))?;
    let entries = stmt
        .query_map([], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Map a SQLite row (selected with `TASK_COLUMNS`) to a `TaskEntry`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskEntry> {
    Ok(TaskEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        task: row.get(2)?,
        schedule: ScheduleRef::from_columns(row.get(3)?, row.get(4)?, row.get(5)?),
        args: json_column(row, 6)?,
        kwargs: json_column(row, 7)?,
        queue: row.get(8)?,
        exchange: row.get(9)?,
        routing_key: row.get(10)?,
        priority: row.get(11)?,
        expires: optional_timestamp_column(row, 12)?,
        one_off: row.get(13)?,
        start_time: optional_timestamp_column(row, 14)?,
        enabled: row.get(15)?,
        last_run_at: optional_timestamp_column(row, 16)?,
        total_run_count: row.get(17)?,
        date_changed: timestamp_column(row, 18)?,
        description: row.get(19)?,
    })
}

// --- column encoding -------------------------------------------------------

/// RFC 3339 with fixed microsecond precision, so stored values sort as text.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

fn optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl ToSql for IntervalPeriod {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for IntervalPeriod {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for SolarEvent {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SolarEvent {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (PeriodicStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store =
            PeriodicStore::with_clock(Connection::open_in_memory().unwrap(), clock.clone())
                .unwrap();
        (store, clock)
    }

    fn tuesday_dec_23() -> CrontabSpec {
        CrontabSpec {
            minute: "23".into(),
            hour: "00".into(),
            day_of_week: "2".into(),
            day_of_month: "23".into(),
            month_of_year: "12".into(),
            timezone: "UTC".into(),
        }
    }

    fn five_minutes(store: &PeriodicStore) -> ScheduleRef {
        let interval = store
            .get_or_create_interval(5, IntervalPeriod::Minutes)
            .unwrap();
        ScheduleRef::Interval(interval.id)
    }

    #[test]
    fn identical_intervals_share_one_row() {
        let (store, _) = store();
        let a = store.create_task(&NewTask::new("a", "echo", five_minutes(&store))).unwrap();
        let b = store.create_task(&NewTask::new("b", "echo", five_minutes(&store))).unwrap();
        assert_eq!(a.schedule, b.schedule);

        let rows: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM interval_schedule", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        let other = store.get_or_create_interval(5, IntervalPeriod::Seconds).unwrap();
        assert_ne!(ScheduleRef::Interval(other.id), a.schedule.unwrap());
    }

    #[test]
    fn equivalent_crontab_spellings_share_one_row() {
        let (store, _) = store();
        let a = store.get_or_create_crontab(&tuesday_dec_23()).unwrap();
        let b = store
            .get_or_create_crontab(&CrontabSpec {
                hour: "0".into(),
                minute: " 23 ".into(),
                ..tuesday_dec_23()
            })
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hour, "0");
    }

    #[test]
    fn identical_solar_specs_share_one_row() {
        let (store, _) = store();
        let a = store.get_or_create_solar(SolarEvent::Sunset, 51.5, -0.0).unwrap();
        let b = store.get_or_create_solar(SolarEvent::Sunset, 51.5, 0.0).unwrap();
        assert_eq!(a.id, b.id);
        let c = store.get_or_create_solar(SolarEvent::Sunrise, 51.5, 0.0).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn invalid_crontab_writes_nothing() {
        let (store, _) = store();
        let err = store
            .get_or_create_crontab(&CrontabSpec {
                minute: "200".into(),
                ..tuesday_dec_23()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidSchedule { field: "minute", .. }
        ));
        assert_eq!(store.last_change_timestamp().unwrap(), None);
        let rows: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM crontab_schedule", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn scheduled_crontab_task_materializes() {
        let (store, _) = store();
        let entry = store
            .schedule_task(
                NewTask::unscheduled("task_1", "echo"),
                &ScheduleSpec::Crontab(tuesday_dec_23()),
            )
            .unwrap();
        assert_eq!(entry.name, "task_1");
        assert_eq!(entry.task, "echo");
        assert!(matches!(entry.schedule, Some(ScheduleRef::Crontab(_))));
        assert_eq!(
            store.describe_task(&entry).unwrap(),
            "task_1: 23 0 2 23 12 (m/h/d/dM/MY) UTC"
        );

        let rule = store.materialize_schedule(&entry).unwrap();
        let next = rule
            .next_occurrence(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), None)
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 12, 23, 0, 23, 0).unwrap());
    }

    #[test]
    fn entry_without_schedule_has_no_rule() {
        let (store, _) = store();
        let mut new = NewTask::new("orphan", "echo", five_minutes(&store));
        new.schedule = None;
        let entry = store.create_task(&new).unwrap();
        assert_eq!(entry.schedule, None);
        assert!(matches!(
            store.materialize_schedule(&entry),
            Err(SchedulerError::NoSchedule { name }) if name == "orphan"
        ));
        assert_eq!(store.describe_task(&entry).unwrap(), "orphan: {no schedule}");
    }

    #[test]
    fn disabling_keeps_history_and_notifies() {
        let (store, clock) = store();
        let entry = store.create_task(&NewTask::new("t", "echo", five_minutes(&store))).unwrap();
        let ran_at = start() + Duration::minutes(1);
        clock.advance(Duration::minutes(1));
        store.record_run(entry.id, ran_at).unwrap();
        let before = store.last_change_timestamp().unwrap().unwrap();

        clock.advance(Duration::minutes(1));
        let disabled = store.set_enabled(entry.id, false).unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.last_run_at, Some(ran_at));
        assert_eq!(disabled.total_run_count, 1);
        assert!(store.last_change_timestamp().unwrap().unwrap() > before);
        assert!(store.list_enabled_tasks().unwrap().is_empty());
        assert_eq!(store.list_tasks().unwrap().len(), 1);
    }

    #[test]
    fn run_bookkeeping_does_not_notify() {
        let (store, clock) = store();
        let entry = store.create_task(&NewTask::new("t", "echo", five_minutes(&store))).unwrap();
        let stamp = store.last_change_timestamp().unwrap();

        clock.advance(Duration::minutes(5));
        let ran = store.record_run(entry.id, clock.now()).unwrap();
        assert_eq!(ran.total_run_count, 1);
        assert_eq!(ran.date_changed, clock.now());
        assert_eq!(store.last_change_timestamp().unwrap(), stamp);

        // An explicit suppressed update behaves the same; the next one publishes.
        let quiet = TaskUpdate {
            description: Some("counter fix".into()),
            ..TaskUpdate::default()
        };
        store.update_task(entry.id, &quiet, Notify::Suppress).unwrap();
        assert_eq!(store.last_change_timestamp().unwrap(), stamp);
        store.update_task(entry.id, &quiet, Notify::Publish).unwrap();
        assert!(store.last_change_timestamp().unwrap() > stamp);
    }

    #[test]
    fn one_off_run_disables_and_notifies() {
        let (store, clock) = store();
        let mut new = NewTask::new("once", "echo", five_minutes(&store));
        new.one_off = true;
        let entry = store.create_task(&new).unwrap();
        let stamp = store.last_change_timestamp().unwrap();

        clock.advance(Duration::minutes(1));
        let ran = store.record_run(entry.id, clock.now()).unwrap();
        assert!(!ran.enabled);
        assert!(store.last_change_timestamp().unwrap() > stamp);
    }

    #[test]
    fn every_tracked_mutation_moves_the_ledger() {
        let (store, _) = store();
        let mut last = None;
        let mut check = |label: &str| {
            let now = store.last_change_timestamp().unwrap();
            assert!(now > last, "{label} did not advance the ledger");
            last = now;
        };

        let link = five_minutes(&store);
        check("interval insert");
        store.get_or_create_crontab(&tuesday_dec_23()).unwrap();
        check("crontab insert");
        store.get_or_create_solar(SolarEvent::Sunrise, 10.0, 10.0).unwrap();
        check("solar insert");
        let entry = store.create_task(&NewTask::new("t", "echo", link)).unwrap();
        check("task insert");
        store
            .update_task(
                entry.id,
                &TaskUpdate {
                    queue: Some(Some("beat".into())),
                    ..TaskUpdate::default()
                },
                Notify::Publish,
            )
            .unwrap();
        check("task update");
        store.delete_task(entry.id).unwrap();
        check("task delete");
        store.delete_schedule(link).unwrap();
        check("schedule delete");
    }

    #[test]
    fn reused_schedule_is_not_a_change() {
        let (store, _) = store();
        five_minutes(&store);
        let stamp = store.last_change_timestamp().unwrap();
        five_minutes(&store);
        assert_eq!(store.last_change_timestamp().unwrap(), stamp);
    }

    #[test]
    fn deleting_a_task_keeps_its_schedule() {
        let (store, _) = store();
        let link = five_minutes(&store);
        let a = store.create_task(&NewTask::new("a", "echo", link)).unwrap();
        let b = store.create_task(&NewTask::new("b", "echo", link)).unwrap();

        let deleted = store.delete_task(a.id).unwrap();
        assert_eq!(deleted.name, "a");
        assert!(store.get_interval(link.id()).is_ok());
        assert!(store.materialize_schedule(&b).is_ok());

        assert!(matches!(
            store.delete_schedule(link),
            Err(SchedulerError::ScheduleInUse { tasks: 1, .. })
        ));
        store.delete_task(b.id).unwrap();
        store.delete_schedule(link).unwrap();
        assert!(store.get_interval(link.id()).unwrap_err().is_not_found());
    }

    #[test]
    fn missing_rows_are_typed_not_found() {
        let (store, _) = store();
        assert!(matches!(
            store.get_task(42),
            Err(SchedulerError::TaskNotFound { id: 42 })
        ));
        assert!(matches!(
            store.set_enabled(42, true),
            Err(SchedulerError::TaskNotFound { id: 42 })
        ));
        assert!(matches!(
            store.delete_task(42),
            Err(SchedulerError::TaskNotFound { id: 42 })
        ));
        assert!(matches!(
            store.create_task(&NewTask::new("t", "echo", ScheduleRef::Solar(9))),
            Err(SchedulerError::ScheduleNotFound { kind: "solar", id: 9 })
        ));
        assert!(store.get_task_by_name("nope").unwrap().is_none());
        assert_eq!(store.last_change_timestamp().unwrap(), None);
    }

    #[test]
    fn names_are_unique() {
        let (store, _) = store();
        let link = five_minutes(&store);
        store.create_task(&NewTask::new("dup", "echo", link)).unwrap();
        let other = store.create_task(&NewTask::new("other", "echo", link)).unwrap();

        assert!(matches!(
            store.create_task(&NewTask::new("dup", "echo", link)),
            Err(SchedulerError::DuplicateName { name }) if name == "dup"
        ));
        let rename = TaskUpdate {
            name: Some("dup".into()),
            ..TaskUpdate::default()
        };
        assert!(matches!(
            store.update_task(other.id, &rename, Notify::Publish),
            Err(SchedulerError::DuplicateName { .. })
        ));
        assert_eq!(store.get_task_by_name("dup").unwrap().unwrap().task, "echo");
    }

    #[test]
    fn update_round_trips_every_field() {
        let (store, clock) = store();
        let entry = store.create_task(&NewTask::new("t", "echo", five_minutes(&store))).unwrap();
        let crontab = store.get_or_create_crontab(&tuesday_dec_23()).unwrap();
        clock.advance(Duration::hours(1));

        let expires = start() + Duration::days(30);
        let update = TaskUpdate {
            task: Some("reports.build".into()),
            schedule: Some(Some(ScheduleRef::Crontab(crontab.id))),
            args: Some(serde_json::json!([1, "two"])),
            kwargs: Some(serde_json::json!({"dry_run": true})),
            queue: Some(Some("reports".into())),
            exchange: Some(Some("direct".into())),
            routing_key: Some(Some("reports.daily".into())),
            priority: Some(Some(7)),
            expires: Some(Some(expires)),
            start_time: Some(Some(start())),
            description: Some("nightly reports".into()),
            ..TaskUpdate::default()
        };
        let updated = store.update_task(entry.id, &update, Notify::Publish).unwrap();
        assert_eq!(updated, store.get_task(entry.id).unwrap());
        assert_eq!(updated.schedule, Some(ScheduleRef::Crontab(crontab.id)));
        assert_eq!(updated.kwargs["dry_run"], true);
        assert_eq!(updated.expires, Some(expires));
        assert_eq!(updated.priority, Some(7));
        assert_eq!(updated.date_changed, clock.now());
        assert!(matches!(
            store.materialize_schedule(&updated).unwrap(),
            ScheduleRule::Crontab(_)
        ));

        let cleared = store
            .update_task(
                entry.id,
                &TaskUpdate {
                    queue: Some(None),
                    ..TaskUpdate::default()
                },
                Notify::Publish,
            )
            .unwrap();
        assert_eq!(cleared.queue, None);
        assert_eq!(cleared.exchange.as_deref(), Some("direct"));
    }

    #[test]
    fn clearing_the_schedule_link_keeps_the_row() {
        let (store, _) = store();
        let link = five_minutes(&store);
        let entry = store.create_task(&NewTask::new("t", "echo", link)).unwrap();

        let unlink = TaskUpdate {
            schedule: Some(None),
            ..TaskUpdate::default()
        };
        let unlinked = store.update_task(entry.id, &unlink, Notify::Publish).unwrap();
        assert_eq!(unlinked.schedule, None);
        assert_eq!(store.get_task(entry.id).unwrap().schedule, None);
        assert!(matches!(
            store.materialize_schedule(&unlinked),
            Err(SchedulerError::NoSchedule { .. })
        ));
        assert!(store.get_interval(link.id()).is_ok());
    }

    #[test]
    fn schedule_task_resolves_every_kind() {
        let (store, _) = store();
        let interval = store
            .schedule_task(
                NewTask::unscheduled("every5", "echo"),
                &ScheduleSpec::Interval {
                    every: 5,
                    period: IntervalPeriod::Minutes,
                },
            )
            .unwrap();
        assert_eq!(interval.schedule, Some(five_minutes(&store)));

        let solar = store
            .schedule_task(
                NewTask::unscheduled("dawn", "echo"),
                &ScheduleSpec::Solar {
                    event: SolarEvent::DawnCivil,
                    latitude: 48.85,
                    longitude: 2.35,
                },
            )
            .unwrap();
        assert!(matches!(
            store.materialize_schedule(&solar).unwrap(),
            ScheduleRule::Solar(_)
        ));
    }

    #[test]
    fn failed_schedule_task_leaves_nothing_behind() {
        let (store, _) = store();
        store.create_task(&NewTask::new("taken", "echo", five_minutes(&store))).unwrap();
        let stamp = store.last_change_timestamp().unwrap();

        let err = store
            .schedule_task(
                NewTask::unscheduled("taken", "echo"),
                &ScheduleSpec::Crontab(tuesday_dec_23()),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));

        let crontabs: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM crontab_schedule", [], |r| r.get(0))
            .unwrap();
        assert_eq!(crontabs, 0);
        assert_eq!(store.last_change_timestamp().unwrap(), stamp);

        let bad = ScheduleSpec::Interval {
            every: 0,
            period: IntervalPeriod::Seconds,
        };
        assert!(matches!(
            store.schedule_task(NewTask::unscheduled("fresh", "echo"), &bad),
            Err(SchedulerError::InvalidSchedule { field: "every", .. })
        ));
        assert!(store.get_task_by_name("fresh").unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_task_fields() {
        let (store, _) = store();
        let link = five_minutes(&store);
        let mut new = NewTask::new("t", "echo", link);
        new.args = serde_json::json!({"not": "a list"});
        assert!(matches!(
            store.create_task(&new),
            Err(SchedulerError::InvalidTask { field: "args", .. })
        ));
        assert!(matches!(
            store.create_task(&NewTask::new(" ", "echo", link)),
            Err(SchedulerError::InvalidTask { field: "name", .. })
        ));
    }

    #[test]
    fn snapshot_returns_stamp_with_enabled_entries() {
        let (store, _) = store();
        let link = five_minutes(&store);
        store.create_task(&NewTask::new("on", "echo", link)).unwrap();
        let off = store.create_task(&NewTask::new("off", "echo", link)).unwrap();
        store.set_enabled(off.id, false).unwrap();

        let (stamp, entries) = store.enabled_snapshot().unwrap();
        assert_eq!(stamp, store.last_change_timestamp().unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "on");
    }
}
