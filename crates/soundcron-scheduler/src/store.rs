use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use soundcron_core::{Occurrence, SoundCron};

use crate::{
    db::{from_db_time, init_db, to_db_time},
    error::{Result, SchedulerError},
    schedule::next_run_times,
    types::OccurrenceRecord,
};

/// Durable home of SoundCron definitions and their pending occurrences.
///
/// Every instance owns one SQLite connection. Several instances (threads or
/// processes) may point at the same database file; [`ScheduleStore::claim_due`]
/// stays exclusive across all of them.
pub struct ScheduleStore {
    conn: Mutex<Connection>,
    /// How many upcoming occurrences are kept inserted per SoundCron.
    batch: usize,
}

impl ScheduleStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, batch: usize) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            batch,
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    ///
    /// Writers from other connections are waited on for up to five seconds.
    pub fn open(path: impl AsRef<Path>, batch: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn, batch)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert `soundcron` and insert its next batch of occurrences.
    pub fn save_soundcron(&self, soundcron: &SoundCron) -> Result<()> {
        self.save_soundcron_at(soundcron, Utc::now())
    }

    /// Like [`save_soundcron`](Self::save_soundcron) with an explicit "now".
    ///
    /// Definition and occurrence batch commit together or not at all.
    /// Re-running with the same `now` inserts nothing new.
    pub fn save_soundcron_at(&self, soundcron: &SoundCron, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO soundcrons (id, name, guild_id, cron, file_size, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                name          = excluded.name,
                guild_id      = excluded.guild_id,
                cron          = excluded.cron,
                file_size     = excluded.file_size,
                last_accessed = excluded.last_accessed",
            params![
                soundcron.id,
                soundcron.name,
                soundcron.guild_id,
                soundcron.cron,
                soundcron.file_size,
                to_db_time(soundcron.last_accessed),
            ],
        )
        .map_err(|e| duplicate_name_or(e, soundcron))?;

        let inserted = insert_occurrences(&tx, &soundcron.id, &soundcron.cron, now, self.batch)?;
        tx.commit()?;

        info!(
            soundcron_id = %soundcron.id,
            name = %soundcron.name,
            guild_id = %soundcron.guild_id,
            inserted,
            "soundcron saved"
        );
        Ok(())
    }

    /// All live SoundCrons of a guild, in no particular order.
    pub fn list_soundcrons(&self, guild_id: &str) -> Result<Vec<SoundCron>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, guild_id, cron, file_size, last_accessed
             FROM soundcrons WHERE guild_id = ?1",
        )?;
        let rows = stmt
            .query_map([guild_id], soundcron_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_soundcron).collect()
    }

    pub fn get_soundcron(&self, id: &str) -> Result<SoundCron> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, guild_id, cron, file_size, last_accessed
                 FROM soundcrons WHERE id = ?1",
                [id],
                soundcron_columns,
            )
            .optional()?
            .ok_or_else(|| SchedulerError::SoundCronNotFound { id: id.to_string() })?;
        into_soundcron(row)
    }

    /// Record that a user accessed the SoundCron.
    pub fn touch(&self, id: &str) -> Result<()> {
        self.touch_at(id, Utc::now())
    }

    pub fn touch_at(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE soundcrons SET last_accessed = ?1 WHERE id = ?2",
            params![to_db_time(now), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::SoundCronNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Remove a definition. Its occurrence rows go with it; anything already
    /// claimed and queued is stopped by the blacklist, not here.
    pub fn delete_soundcron(&self, id: &str) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM soundcrons WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::SoundCronNotFound { id: id.to_string() });
        }
        info!(soundcron_id = %id, "soundcron deleted");
        Ok(())
    }

    /// Claim every unclaimed occurrence with `now < run_at <= within`.
    pub fn claim_due(&self, within: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        self.claim_due_at(Utc::now(), within)
    }

    /// Like [`claim_due`](Self::claim_due) with an explicit "now".
    ///
    /// The claim is one conditional `UPDATE ... RETURNING`: a row only comes
    /// back to the caller whose update flipped `claimed_at` from NULL, so
    /// concurrent callers never receive the same occurrence twice. Rows whose
    /// SoundCron no longer exists are left alone.
    pub fn claim_due_at(
        &self,
        now: DateTime<Utc>,
        within: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>> {
        let now_str = to_db_time(now);
        let within_str = to_db_time(within);

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed: Vec<(String, String)> = {
            let mut stmt = tx.prepare_cached(
                "UPDATE occurrences
                 SET claimed_at = ?1
                 WHERE claimed_at IS NULL
                   AND run_at > ?1
                   AND run_at <= ?2
                   AND soundcron_id IN (SELECT id FROM soundcrons)
                 RETURNING soundcron_id, run_at",
            )?;
            let rows = stmt
                .query_map(params![now_str, within_str], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut occurrences = Vec::with_capacity(claimed.len());
        {
            let mut lookup =
                tx.prepare_cached("SELECT name, guild_id FROM soundcrons WHERE id = ?1")?;
            for (soundcron_id, run_at) in claimed {
                let (name, guild_id) = lookup.query_row([&soundcron_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                occurrences.push(Occurrence {
                    soundcron_id,
                    name,
                    guild_id,
                    run_at: from_db_time(&run_at)?,
                });
            }
        }
        tx.commit()?;

        occurrences.sort_by(|a, b| a.run_at.cmp(&b.run_at));
        debug!(count = occurrences.len(), within = %within_str, "claimed due occurrences");
        Ok(occurrences)
    }

    /// Top the SoundCron's schedule back up to the next batch after now.
    pub fn refresh_schedule(&self, soundcron_id: &str) -> Result<usize> {
        self.refresh_schedule_at(soundcron_id, Utc::now())
    }

    /// Returns how many new occurrence rows were inserted.
    pub fn refresh_schedule_at(&self, soundcron_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let cron: String = tx
            .query_row(
                "SELECT cron FROM soundcrons WHERE id = ?1",
                [soundcron_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SchedulerError::SoundCronNotFound {
                id: soundcron_id.to_string(),
            })?;

        let inserted = insert_occurrences(&tx, soundcron_id, &cron, now, self.batch)?;
        tx.commit()?;
        debug!(soundcron_id, inserted, "schedule refreshed");
        Ok(inserted)
    }

    /// Occurrence rows of one SoundCron ordered by run time, pending and history.
    pub fn occurrences(&self, soundcron_id: &str) -> Result<Vec<OccurrenceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT soundcron_id, run_at, claimed_at FROM occurrences
             WHERE soundcron_id = ?1 ORDER BY run_at",
        )?;
        let rows = stmt
            .query_map([soundcron_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(soundcron_id, run_at, claimed_at)| {
                Ok(OccurrenceRecord {
                    soundcron_id,
                    run_at: from_db_time(&run_at)?,
                    claimed_at: claimed_at.as_deref().map(from_db_time).transpose()?,
                })
            })
            .collect()
    }
}

/// Insert the next `n` occurrences after `now`, skipping rows that already exist.
fn insert_occurrences(
    conn: &Connection,
    soundcron_id: &str,
    cron: &str,
    now: DateTime<Utc>,
    n: usize,
) -> Result<usize> {
    let times = next_run_times(cron, now, n)?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO occurrences (soundcron_id, run_at) VALUES (?1, ?2)
         ON CONFLICT (soundcron_id, run_at) DO NOTHING",
    )?;
    let mut inserted = 0;
    for run_at in times {
        inserted += stmt.execute(params![soundcron_id, to_db_time(run_at)])?;
    }
    Ok(inserted)
}

type SoundCronRow = (String, String, String, String, i64, String);

fn soundcron_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<SoundCronRow> {
    Ok((
        row.get(0)?, // id
        row.get(1)?, // name
        row.get(2)?, // guild_id
        row.get(3)?, // cron
        row.get(4)?, // file_size
        row.get(5)?, // last_accessed
    ))
}

fn into_soundcron(row: SoundCronRow) -> Result<SoundCron> {
    let (id, name, guild_id, cron, file_size, last_accessed) = row;
    Ok(SoundCron {
        id,
        name,
        guild_id,
        cron,
        file_size,
        last_accessed: from_db_time(&last_accessed)?,
    })
}

/// The only UNIQUE constraint an upsert on `id` can still trip is (guild_id, name).
fn duplicate_name_or(err: rusqlite::Error, soundcron: &SoundCron) -> SchedulerError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            SchedulerError::DuplicateName {
                guild_id: soundcron.guild_id.clone(),
                name: soundcron.name.clone(),
            }
        }
        _ => SchedulerError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Barrier};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 1, 12, 0, 0).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 1, h, m, 0).unwrap()
    }

    fn store() -> ScheduleStore {
        ScheduleStore::new(Connection::open_in_memory().unwrap(), 5).unwrap()
    }

    fn soundcron(name: &str, guild: &str, cron: &str) -> SoundCron {
        let mut sc = SoundCron::new(name, guild, cron, 1024);
        sc.last_accessed = t0();
        sc
    }

    #[test]
    fn save_inserts_the_first_batch() {
        let store = store();
        let sc = soundcron("test", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();

        let runs: Vec<_> = store
            .occurrences(&sc.id)
            .unwrap()
            .into_iter()
            .map(|r| r.run_at)
            .collect();
        assert_eq!(
            runs,
            vec![at(12, 5), at(12, 10), at(12, 15), at(12, 20), at(12, 25)]
        );
    }

    #[test]
    fn claim_returns_only_rows_inside_the_horizon() {
        let store = store();
        let sc = soundcron("test", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();

        let claimed = store
            .claim_due_at(t0(), t0() + Duration::minutes(6))
            .unwrap();
        assert_eq!(
            claimed,
            vec![Occurrence {
                soundcron_id: sc.id.clone(),
                name: "test".into(),
                guild_id: "G1".into(),
                run_at: at(12, 5),
            }]
        );

        let records = store.occurrences(&sc.id).unwrap();
        assert!(records[0].is_claimed());
        assert_eq!(records[0].claimed_at, Some(t0()));
        assert!(records[1..].iter().all(|r| !r.is_claimed()));
    }

    #[test]
    fn second_claim_with_same_horizon_returns_nothing() {
        let store = store();
        let sc = soundcron("every-minute", "G1", "* * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();

        let horizon = t0() + Duration::minutes(6);
        let first = store.claim_due_at(t0(), horizon).unwrap();
        assert!(!first.is_empty());
        assert!(first.iter().all(|o| o.run_at > t0() && o.run_at <= horizon));

        let second = store.claim_due_at(t0(), horizon).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn claim_through_wall_clock_entry_points() {
        let store = store();
        let sc = SoundCron::new("live", "G1", "* * * * *", 1);
        store.save_soundcron(&sc).unwrap();

        let horizon = Utc::now() + Duration::minutes(6);
        let claimed = store.claim_due(horizon).unwrap();
        assert!(!claimed.is_empty());
        assert!(store.claim_due(horizon).unwrap().is_empty());
    }

    #[test]
    fn past_rows_are_never_claimed() {
        let store = store();
        let sc = soundcron("test", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();

        // 12:05 and 12:10 are already in the past at 12:11.
        let claimed = store
            .claim_due_at(at(12, 11), at(12, 30))
            .unwrap();
        let runs: Vec<_> = claimed.iter().map(|o| o.run_at).collect();
        assert_eq!(runs, vec![at(12, 15), at(12, 20), at(12, 25)]);

        let stale: Vec<_> = store
            .occurrences(&sc.id)
            .unwrap()
            .into_iter()
            .filter(|r| !r.is_claimed())
            .map(|r| r.run_at)
            .collect();
        assert_eq!(stale, vec![at(12, 5), at(12, 10)]);
    }

    #[test]
    fn save_is_idempotent_on_retry() {
        let store = store();
        let sc = soundcron("test", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();
        store.save_soundcron_at(&sc, t0()).unwrap();
        assert_eq!(store.occurrences(&sc.id).unwrap().len(), 5);
        assert_eq!(store.list_soundcrons("G1").unwrap().len(), 1);
    }

    #[test]
    fn save_with_bad_cron_commits_nothing() {
        let store = store();
        let sc = soundcron("broken", "G1", "not a cron");
        assert!(matches!(
            store.save_soundcron_at(&sc, t0()),
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
        assert!(store.list_soundcrons("G1").unwrap().is_empty());
        assert!(store.occurrences(&sc.id).unwrap().is_empty());
    }

    #[test]
    fn duplicate_name_in_guild_is_rejected() {
        let store = store();
        store
            .save_soundcron_at(&soundcron("horn", "G1", "@hourly"), t0())
            .unwrap();
        let err = store
            .save_soundcron_at(&soundcron("horn", "G1", "@daily"), t0())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));

        // Same name in another guild is fine.
        store
            .save_soundcron_at(&soundcron("horn", "G2", "@daily"), t0())
            .unwrap();
    }

    #[test]
    fn upsert_updates_existing_definition() {
        let store = store();
        let mut sc = soundcron("horn", "G1", "@hourly");
        store.save_soundcron_at(&sc, t0()).unwrap();
        sc.cron = "@daily".into();
        sc.file_size = 2048;
        store.save_soundcron_at(&sc, t0()).unwrap();

        let stored = store.get_soundcron(&sc.id).unwrap();
        assert_eq!(stored.cron, "@daily");
        assert_eq!(stored.file_size, 2048);
    }

    #[test]
    fn refresh_slides_the_window_forward() {
        let store = store();
        let sc = soundcron("test", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();
        store
            .claim_due_at(t0(), t0() + Duration::minutes(6))
            .unwrap();

        let inserted = store.refresh_schedule_at(&sc.id, at(12, 6)).unwrap();
        assert_eq!(inserted, 1); // only 12:30 is new
        let records = store.occurrences(&sc.id).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records.last().unwrap().run_at, at(12, 30));
        // The claimed 12:05 row is history, not reused.
        assert!(records[0].is_claimed());
    }

    #[test]
    fn refresh_of_unknown_soundcron_fails() {
        let store = store();
        assert!(matches!(
            store.refresh_schedule_at("missing", t0()),
            Err(SchedulerError::SoundCronNotFound { .. })
        ));
    }

    #[test]
    fn list_is_scoped_to_guild() {
        let store = store();
        store
            .save_soundcron_at(&soundcron("a", "G1", "@hourly"), t0())
            .unwrap();
        store
            .save_soundcron_at(&soundcron("b", "G1", "@daily"), t0())
            .unwrap();
        store
            .save_soundcron_at(&soundcron("c", "G2", "@daily"), t0())
            .unwrap();

        let mut names: Vec<_> = store
            .list_soundcrons("G1")
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn touch_updates_last_accessed() {
        let store = store();
        let sc = soundcron("a", "G1", "@hourly");
        store.save_soundcron_at(&sc, t0()).unwrap();
        store.touch_at(&sc.id, at(13, 0)).unwrap();
        assert_eq!(store.get_soundcron(&sc.id).unwrap().last_accessed, at(13, 0));
        assert!(store.touch("missing").is_err());
    }

    #[test]
    fn deleted_soundcron_is_not_claimed() {
        let store = store();
        let sc = soundcron("gone", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();
        store.delete_soundcron(&sc.id).unwrap();

        assert!(store
            .claim_due_at(t0(), t0() + Duration::hours(1))
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.delete_soundcron(&sc.id),
            Err(SchedulerError::SoundCronNotFound { .. })
        ));
    }

    #[test]
    fn orphaned_rows_are_not_claimed_without_cascade() {
        let conn = Connection::open_in_memory().unwrap();
        let store = ScheduleStore::new(conn, 5).unwrap();
        let sc = soundcron("orphan", "G1", "*/5 * * * *");
        store.save_soundcron_at(&sc, t0()).unwrap();
        {
            let conn = store.conn();
            conn.execute_batch("PRAGMA foreign_keys=OFF;").unwrap();
            conn.execute("DELETE FROM soundcrons WHERE id = ?1", [&sc.id])
                .unwrap();
        }
        assert_eq!(store.occurrences(&sc.id).unwrap().len(), 5);
        assert!(store
            .claim_due_at(t0(), t0() + Duration::hours(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn concurrent_claims_hand_out_each_occurrence_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.db");

        let seed = ScheduleStore::open(&path, 5).unwrap();
        let sc = soundcron("race", "G1", "*/5 * * * *");
        seed.save_soundcron_at(&sc, t0()).unwrap();

        const CALLERS: usize = 8;
        let barrier = Arc::new(Barrier::new(CALLERS));
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let store = ScheduleStore::open(&path, 5).unwrap();
                    barrier.wait();
                    store
                        .claim_due_at(t0(), t0() + Duration::minutes(6))
                        .unwrap()
                })
            })
            .collect();

        let claimed: Vec<Occurrence> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].run_at, at(12, 5));
    }
}
