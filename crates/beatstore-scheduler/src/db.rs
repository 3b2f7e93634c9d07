use rusqlite::Connection;

use beatstore_core::config::DatabaseConfig;

use crate::error::Result;

/// Open the database named in `config`, apply connection pragmas and make
/// sure the schema exists.
///
/// Every process that touches the store opens its own connection; SQLite's
/// file locking is what serializes writers across processes.
pub fn open(config: &DatabaseConfig) -> Result<Connection> {
    let conn = Connection::open(&config.path)?;
    configure(&conn, config)?;
    init_db(&conn)?;
    Ok(conn)
}

/// Pragmas every store connection needs.
pub fn configure(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    conn.busy_timeout(config.busy_timeout())?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Initialise the periodic task schema in `conn`. Safe to call on every
/// startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_schedule_tables(conn)?;
    create_periodic_task_table(conn)?;
    create_change_ledger_table(conn)?;
    Ok(())
}

/// Schedule rows are shared between task entries. The UNIQUE constraints
/// over the full field tuple are the dedup key for get-or-create.
fn create_schedule_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS interval_schedule (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            every   INTEGER NOT NULL CHECK (every > 0),
            period  TEXT    NOT NULL,
            UNIQUE (every, period)
        );

        CREATE TABLE IF NOT EXISTS crontab_schedule (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            minute         TEXT NOT NULL DEFAULT '*',
            hour           TEXT NOT NULL DEFAULT '*',
            day_of_week    TEXT NOT NULL DEFAULT '*',
            day_of_month   TEXT NOT NULL DEFAULT '*',
            month_of_year  TEXT NOT NULL DEFAULT '*',
            timezone       TEXT NOT NULL DEFAULT 'UTC',
            UNIQUE (minute, hour, day_of_week, day_of_month, month_of_year, timezone)
        );

        CREATE TABLE IF NOT EXISTS solar_schedule (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            event      TEXT NOT NULL,
            latitude   REAL NOT NULL,
            longitude  REAL NOT NULL,
            UNIQUE (event, latitude, longitude)
        );
        ",
    )?;
    Ok(())
}

/// Task entries reference at most one schedule row. The foreign keys have no
/// ON DELETE action: deleting an entry never touches its schedule, and a
/// schedule cannot be deleted while an entry still points at it.
fn create_periodic_task_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS periodic_task (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            name             TEXT    NOT NULL UNIQUE,
            task             TEXT    NOT NULL,
            interval_id      INTEGER REFERENCES interval_schedule (id),
            crontab_id       INTEGER REFERENCES crontab_schedule (id),
            solar_id         INTEGER REFERENCES solar_schedule (id),
            args             TEXT    NOT NULL DEFAULT '[]',   -- JSON array
            kwargs           TEXT    NOT NULL DEFAULT '{}',   -- JSON object
            queue            TEXT,
            exchange         TEXT,
            routing_key      TEXT,
            priority         INTEGER,
            expires          TEXT,                            -- RFC 3339 or NULL
            one_off          INTEGER NOT NULL DEFAULT 0,
            start_time       TEXT,
            enabled          INTEGER NOT NULL DEFAULT 1,
            last_run_at      TEXT,
            total_run_count  INTEGER NOT NULL DEFAULT 0,
            date_changed     TEXT    NOT NULL,
            description      TEXT    NOT NULL DEFAULT '',
            CHECK ((interval_id IS NOT NULL)
                 + (crontab_id  IS NOT NULL)
                 + (solar_id    IS NOT NULL) <= 1)
        );

        -- Reload query: SELECT … WHERE enabled = 1
        CREATE INDEX IF NOT EXISTS idx_periodic_task_enabled ON periodic_task (enabled);
        CREATE INDEX IF NOT EXISTS idx_periodic_task_interval ON periodic_task (interval_id);
        CREATE INDEX IF NOT EXISTS idx_periodic_task_crontab ON periodic_task (crontab_id);
        CREATE INDEX IF NOT EXISTS idx_periodic_task_solar ON periodic_task (solar_id);
        ",
    )?;
    Ok(())
}

/// Single-row change ledger. `last_update` is microseconds since the Unix
/// epoch so it compares and bumps as a plain integer.
fn create_change_ledger_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS periodic_task_changed (
            id           INTEGER PRIMARY KEY CHECK (id = 1),
            last_update  INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}
