use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `soundcrons` and `occurrences` tables (idempotent) plus an
/// index on `occurrences.run_at` so the claim query stays cheap as the
/// delivery history grows.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS soundcrons (
            id            TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL,
            guild_id      TEXT    NOT NULL,
            cron          TEXT    NOT NULL,
            file_size     INTEGER NOT NULL,
            last_accessed TEXT    NOT NULL,
            UNIQUE (guild_id, name)
        ) STRICT;

        -- Claimed rows stay behind as delivery history; (soundcron_id, run_at)
        -- is never reused.
        CREATE TABLE IF NOT EXISTS occurrences (
            soundcron_id  TEXT    NOT NULL REFERENCES soundcrons (id) ON DELETE CASCADE,
            run_at        TEXT    NOT NULL,   -- fixed-width RFC 3339, see to_db_time
            claimed_at    TEXT,               -- NULL until a poller claims the row
            PRIMARY KEY (soundcron_id, run_at)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_occurrences_run_at ON occurrences (run_at);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC text (`2023-10-01T12:05:00.000000Z`) so that string
/// comparison in SQL matches chronological order.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::CorruptTimestamp(format!("{raw:?}: {e}")))
}
