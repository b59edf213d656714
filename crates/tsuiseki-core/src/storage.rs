use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;

use crate::error::TsuisekiError;
use crate::models::{EpisodeKey, ShowIds, SyncStatus, WatchMeta, WatchRecord};

const SCHEMA_V1: &str = include_str!("../../../migrations/001_watch_records.sql");
const SCHEMA_V2: &str = include_str!("../../../migrations/002_auth_tokens.sql");

const RECORD_COLUMNS: &str = "show_id, season, episode, remote_episode_id, show_ids, \
                              watched_at, status, last_modified";

/// SQLite-backed ledger of local watch records.
///
/// Every mutation that touches more than one row runs in a single transaction,
/// so a batch either applies completely or not at all.
pub struct Ledger {
    conn: Connection,
}

/// Result of [`Ledger::mark_watched`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// New record queued for the remote as `PendingAdd`.
    Inserted,
    /// A `PendingAdd` or `Synced` record already existed.
    AlreadyWatched,
    /// A `PendingRemove` record was flipped back to `Synced`.
    Resurrected,
}

/// Result of [`Ledger::mark_unwatched`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmarkOutcome {
    /// Nothing to do: no record, or removal already queued.
    NotWatched,
    /// A never-synced `PendingAdd` record was deleted outright.
    Discarded,
    /// A `Synced` record now waits for remote removal.
    RemovalQueued,
}

/// A remote success to apply to exactly the batch it covered.
#[derive(Debug, Clone)]
pub enum Confirmed {
    /// The remote accepted the add batch. Carries any episode ids it reported.
    Added { remote_ids: HashMap<EpisodeKey, u64> },
    /// The remote accepted the remove batch.
    Removed,
}

/// What happened to a confirmed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfirmStats {
    /// Records moved to `Synced` (add) or deleted (remove).
    pub applied: usize,
    /// Records that changed state while the call was in flight and were left alone.
    pub skipped: usize,
    /// Records whose local intent flipped while the call was in flight and
    /// now need the opposite call: re-watched during a removal (queued as
    /// `PendingAdd`) or unwatched during an add (queued as `PendingRemove`).
    pub requeued: usize,
}

/// One episode from a remote watched snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub key: EpisodeKey,
    pub watched_at: DateTime<Utc>,
    pub show_ids: Option<ShowIds>,
}

/// Outcome of merging a remote snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Entries whose local record still carries unpushed intent.
    pub skipped_pending: usize,
}

/// Number of records in each sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending_add: usize,
    pub synced: usize,
    pub pending_remove: usize,
}

impl Ledger {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, TsuisekiError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, TsuisekiError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    // ── User-facing mutations ───────────────────────────────────

    /// Mark an episode as watched. Idempotent.
    pub fn mark_watched(
        &self,
        key: EpisodeKey,
        meta: &WatchMeta,
    ) -> Result<MarkOutcome, TsuisekiError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();

        let outcome = match status_of(&tx, key)? {
            None => {
                let show_ids = meta
                    .show_ids
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                tx.execute(
                    "INSERT INTO watch_record (show_id, season, episode, remote_episode_id,
                     show_ids, watched_at, status, last_modified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6)",
                    params![
                        key.show_id as i64,
                        key.season,
                        key.episode,
                        meta.remote_episode_id.map(|v| v as i64),
                        show_ids,
                        now.to_rfc3339(),
                        SyncStatus::PendingAdd,
                    ],
                )?;
                MarkOutcome::Inserted
            }
            Some(SyncStatus::PendingAdd | SyncStatus::Synced) => MarkOutcome::AlreadyWatched,
            Some(SyncStatus::PendingRemove) => {
                // The remote still has it: cancelling the removal is enough.
                set_status(&tx, key, SyncStatus::Synced, Some(now), now)?;
                MarkOutcome::Resurrected
            }
        };

        tx.commit()?;
        tracing::debug!(%key, ?outcome, "mark_watched");
        Ok(outcome)
    }

    /// Mark an episode as not watched. Idempotent.
    pub fn mark_unwatched(&self, key: EpisodeKey) -> Result<UnmarkOutcome, TsuisekiError> {
        let tx = self.conn.unchecked_transaction()?;

        let outcome = match status_of(&tx, key)? {
            None | Some(SyncStatus::PendingRemove) => UnmarkOutcome::NotWatched,
            Some(SyncStatus::PendingAdd) => {
                delete_record(&tx, key)?;
                UnmarkOutcome::Discarded
            }
            Some(SyncStatus::Synced) => {
                set_status(&tx, key, SyncStatus::PendingRemove, None, Utc::now())?;
                UnmarkOutcome::RemovalQueued
            }
        };

        tx.commit()?;
        tracing::debug!(%key, ?outcome, "mark_unwatched");
        Ok(outcome)
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Whether the episode reads as watched. `PendingRemove` records are masked.
    pub fn is_watched(&self, key: EpisodeKey) -> Result<bool, TsuisekiError> {
        Ok(status_of(&self.conn, key)?.is_some_and(|s| s.counts_as_watched()))
    }

    /// Get the raw record for a key, in any state.
    pub fn get_record(&self, key: EpisodeKey) -> Result<Option<WatchRecord>, TsuisekiError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM watch_record
                     WHERE show_id = ?1 AND season = ?2 AND episode = ?3"
                ),
                params![key.show_id as i64, key.season, key.episode],
                row_to_record,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All records for a show, ordered by season then episode.
    pub fn records_for_show(&self, show_id: u64) -> Result<Vec<WatchRecord>, TsuisekiError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM watch_record
             WHERE show_id = ?1
             ORDER BY season, episode"
        ))?;
        let rows = stmt
            .query_map(params![show_id as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every record waiting to be added on the remote.
    pub fn pending_add_batch(&self) -> Result<Vec<WatchRecord>, TsuisekiError> {
        self.records_with_status(SyncStatus::PendingAdd)
    }

    /// Every record waiting to be removed on the remote.
    pub fn pending_remove_batch(&self) -> Result<Vec<WatchRecord>, TsuisekiError> {
        self.records_with_status(SyncStatus::PendingRemove)
    }

    fn records_with_status(&self, status: SyncStatus) -> Result<Vec<WatchRecord>, TsuisekiError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM watch_record
             WHERE status = ?1
             ORDER BY show_id, season, episode"
        ))?;
        let rows = stmt
            .query_map(params![status], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count records per sync state.
    pub fn count_by_status(&self) -> Result<StatusCounts, TsuisekiError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM watch_record GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, SyncStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            let n = n as usize;
            match status {
                SyncStatus::PendingAdd => counts.pending_add = n,
                SyncStatus::Synced => counts.synced = n,
                SyncStatus::PendingRemove => counts.pending_remove = n,
            }
        }
        Ok(counts)
    }

    // ── Sync engine mutators ────────────────────────────────────

    /// Apply a confirmed remote batch to exactly the given keys, atomically.
    ///
    /// Only records still in the state the batch was built from are touched.
    /// A record resurrected while its removal was in flight no longer exists
    /// remotely, so it is demoted to `PendingAdd` instead of left `Synced`.
    /// A record discarded while its add was in flight now exists remotely, so
    /// it comes back as `PendingRemove` and the next push deletes it.
    pub fn apply_sync_success(
        &self,
        keys: &[EpisodeKey],
        confirmed: &Confirmed,
    ) -> Result<ConfirmStats, TsuisekiError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        let mut stats = ConfirmStats::default();

        for &key in keys {
            let current = status_of(&tx, key)?;
            match (confirmed, current) {
                (Confirmed::Added { remote_ids }, Some(SyncStatus::PendingAdd)) => {
                    set_status(&tx, key, SyncStatus::Synced, None, now)?;
                    if let Some(&remote_id) = remote_ids.get(&key) {
                        tx.execute(
                            "UPDATE watch_record SET remote_episode_id = ?1
                             WHERE show_id = ?2 AND season = ?3 AND episode = ?4",
                            params![remote_id as i64, key.show_id as i64, key.season, key.episode],
                        )?;
                    }
                    stats.applied += 1;
                }
                (Confirmed::Removed, Some(SyncStatus::PendingRemove)) => {
                    delete_record(&tx, key)?;
                    stats.applied += 1;
                }
                (Confirmed::Removed, Some(SyncStatus::Synced)) => {
                    set_status(&tx, key, SyncStatus::PendingAdd, None, now)?;
                    stats.requeued += 1;
                }
                (Confirmed::Added { remote_ids }, None) => {
                    tx.execute(
                        "INSERT INTO watch_record (show_id, season, episode, remote_episode_id,
                         watched_at, status, last_modified)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)",
                        params![
                            key.show_id as i64,
                            key.season,
                            key.episode,
                            remote_ids.get(&key).map(|&v| v as i64),
                            now.to_rfc3339(),
                            SyncStatus::PendingRemove,
                        ],
                    )?;
                    stats.requeued += 1;
                }
                (Confirmed::Added { .. }, Some(SyncStatus::Synced | SyncStatus::PendingRemove))
                | (Confirmed::Removed, Some(SyncStatus::PendingAdd) | None) => {
                    stats.skipped += 1;
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Merge a remote watched snapshot. Additive: never deletes.
    ///
    /// Records with unpushed local intent (`PendingAdd`, `PendingRemove`) are
    /// left untouched; everything else becomes `Synced` with the remote time.
    pub fn apply_remote_snapshot(
        &self,
        entries: &[RemoteEntry],
    ) -> Result<MergeStats, TsuisekiError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut stats = MergeStats::default();

        for entry in entries {
            let key = entry.key;
            let show_ids = entry
                .show_ids
                .as_ref()
                .filter(|ids| !ids.is_empty())
                .map(serde_json::to_string)
                .transpose()?;

            let existing: Option<(SyncStatus, String, Option<String>)> = tx
                .query_row(
                    "SELECT status, watched_at, show_ids FROM watch_record
                     WHERE show_id = ?1 AND season = ?2 AND episode = ?3",
                    params![key.show_id as i64, key.season, key.episode],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO watch_record (show_id, season, episode, show_ids,
                         watched_at, status, last_modified)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            key.show_id as i64,
                            key.season,
                            key.episode,
                            show_ids,
                            entry.watched_at.to_rfc3339(),
                            SyncStatus::Synced,
                            now,
                        ],
                    )?;
                    stats.inserted += 1;
                }
                Some((SyncStatus::Synced, watched_at, current_ids)) => {
                    let same_time = parse_datetime(&watched_at) == entry.watched_at;
                    let same_ids = show_ids.is_none() || show_ids == current_ids;
                    if same_time && same_ids {
                        stats.unchanged += 1;
                        continue;
                    }
                    tx.execute(
                        "UPDATE watch_record
                         SET watched_at = ?1, show_ids = COALESCE(?2, show_ids), last_modified = ?3
                         WHERE show_id = ?4 AND season = ?5 AND episode = ?6",
                        params![
                            entry.watched_at.to_rfc3339(),
                            show_ids,
                            now,
                            key.show_id as i64,
                            key.season,
                            key.episode,
                        ],
                    )?;
                    stats.updated += 1;
                }
                Some((SyncStatus::PendingAdd | SyncStatus::PendingRemove, _, _)) => {
                    stats.skipped_pending += 1;
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    // ── Auth Tokens ─────────────────────────────────────────────

    /// Store an auth token for a service.
    pub fn save_token(&self, service: &str, token: &str) -> Result<(), TsuisekiError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO auth_tokens (service, token) VALUES (?1, ?2)",
            params![service, token],
        )?;
        Ok(())
    }

    /// Get the token for a service.
    pub fn get_token(&self, service: &str) -> Result<Option<String>, TsuisekiError> {
        self.conn
            .query_row(
                "SELECT token FROM auth_tokens WHERE service = ?1",
                params![service],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }
}

// ── Migrations ──────────────────────────────────────────────────

/// Run schema migrations using `PRAGMA user_version` for version tracking.
fn run_migrations(conn: &Connection) -> Result<(), TsuisekiError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    if version < 2 {
        conn.execute_batch(SCHEMA_V2)?;
        conn.pragma_update(None, "user_version", 2)?;
    }
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_db_str()))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        SyncStatus::from_db_str(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown sync status {s:?}").into()))
    }
}

fn status_of(conn: &Connection, key: EpisodeKey) -> Result<Option<SyncStatus>, TsuisekiError> {
    conn.query_row(
        "SELECT status FROM watch_record
         WHERE show_id = ?1 AND season = ?2 AND episode = ?3",
        params![key.show_id as i64, key.season, key.episode],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

fn set_status(
    conn: &Connection,
    key: EpisodeKey,
    status: SyncStatus,
    watched_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), TsuisekiError> {
    conn.execute(
        "UPDATE watch_record
         SET status = ?1, watched_at = COALESCE(?2, watched_at), last_modified = ?3
         WHERE show_id = ?4 AND season = ?5 AND episode = ?6",
        params![
            status,
            watched_at.map(|t| t.to_rfc3339()),
            now.to_rfc3339(),
            key.show_id as i64,
            key.season,
            key.episode,
        ],
    )?;
    Ok(())
}

fn delete_record(conn: &Connection, key: EpisodeKey) -> Result<(), TsuisekiError> {
    conn.execute(
        "DELETE FROM watch_record WHERE show_id = ?1 AND season = ?2 AND episode = ?3",
        params![key.show_id as i64, key.season, key.episode],
    )?;
    Ok(())
}

/// Parse a datetime string from SQLite (either RFC 3339 or SQLite's `datetime('now')` format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return naive.and_utc();
    }
    tracing::warn!(value = s, "unparseable timestamp in ledger, using epoch");
    DateTime::default()
}

fn parse_show_ids(json: &str) -> Option<ShowIds> {
    serde_json::from_str(json)
        .inspect_err(|e| tracing::warn!(json, "dropping unreadable show ids: {e}"))
        .ok()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchRecord> {
    let show_ids_json: Option<String> = row.get(4)?;
    let watched_at: String = row.get(5)?;
    let last_modified: String = row.get(7)?;

    Ok(WatchRecord {
        key: EpisodeKey {
            show_id: row.get::<_, i64>(0)? as u64,
            season: row.get(1)?,
            episode: row.get(2)?,
        },
        remote_episode_id: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        show_ids: show_ids_json.and_then(|s| parse_show_ids(&s)),
        watched_at: parse_datetime(&watched_at),
        status: row.get(6)?,
        last_modified: parse_datetime(&last_modified),
    })
}
