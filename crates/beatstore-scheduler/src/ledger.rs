//! Change ledger: one row recording when any tracked entity last changed.
//!
//! Writers call [`record_change`] inside the transaction that performs the
//! mutation, so the stamp commits (or rolls back) together with it. Readers
//! poll [`last_change`] and reload when the value moves.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::error::Result;

/// Primary key of the only ledger row.
pub const LEDGER_ID: i64 = 1;

/// Stamp the ledger with `now` as part of `tx`.
///
/// A single upsert creates the row on first use and updates it in place
/// afterwards, so concurrent first writers cannot both insert. The stored
/// value never decreases, and every call moves it forward by at least one
/// microsecond even if the clock has not advanced (or went backwards).
/// Returns the stamp that was written.
pub fn record_change(tx: &Transaction<'_>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let stored: i64 = tx.query_row(
        "INSERT INTO periodic_task_changed (id, last_update) VALUES (?1, ?2)
         ON CONFLICT (id) DO UPDATE SET last_update =
             CASE WHEN excluded.last_update > last_update
                  THEN excluded.last_update
                  ELSE last_update + 1
             END
         RETURNING last_update",
        rusqlite::params![LEDGER_ID, now.timestamp_micros()],
        |row| row.get(0),
    )?;
    let stamp = DateTime::from_timestamp_micros(stored).unwrap_or(now);
    debug!(last_update = %stamp, "change ledger stamped");
    Ok(stamp)
}

/// Most recent change stamp, or `None` if nothing has ever been written.
///
/// Always reads the table; the value is never cached across transactions.
pub fn last_change(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let stored: Option<i64> = conn
        .query_row(
            "SELECT last_update FROM periodic_task_changed WHERE id = ?1",
            [LEDGER_ID],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.and_then(DateTime::from_timestamp_micros))
}
