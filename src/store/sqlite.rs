//! SQLite-backed entry store.

use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::traits::{next_failure, EntryStore, PendingEntry, SyncFailure};
use crate::entry::{format_date, month_bounds, parse_date, Entry, Mood};
use crate::error::StoreError;

/// Schema migrations, applied in order. The index + 1 of the last applied
/// migration is kept in `PRAGMA user_version`.
const MIGRATIONS: &[&str] = &[
  r#"
-- One record per calendar day
CREATE TABLE IF NOT EXISTS entries (
    date TEXT PRIMARY KEY NOT NULL,
    mood INTEGER NOT NULL CHECK (mood BETWEEN 1 AND 5),
    note TEXT NOT NULL DEFAULT '',
    timestamp INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_entries_synced ON entries(synced);
"#,
  r#"
-- Failed submission bookkeeping for unsynced entries
CREATE TABLE IF NOT EXISTS sync_failures (
    date TEXT PRIMARY KEY NOT NULL,
    failures INTEGER NOT NULL,
    last_error TEXT,
    parked INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
];

const SELECT_ENTRY: &str = "SELECT date, mood, note, timestamp, synced FROM entries";

/// Entry store persisted in a single SQLite database file.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at `path`, applying pending migrations.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::StorageUnavailable(format!("failed to create data directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::StorageUnavailable(format!(
        "failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError::StorageUnavailable(format!("failed to open database: {}", e)))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
    run_migrations(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }

  fn query_entries(
    &self,
    sql: &str,
    params: impl rusqlite::Params,
  ) -> Result<Vec<Entry>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(sql).map_err(read_failed)?;
    let rows: Vec<RawEntry> = stmt
      .query_map(params, RawEntry::from_row)
      .map_err(read_failed)?
      .collect::<Result<_, _>>()
      .map_err(read_failed)?;

    Ok(rows.into_iter().filter_map(RawEntry::into_entry_logged).collect())
  }
}

fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
  let current: usize = conn
    .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
    .map(|v| v.max(0) as usize)
    .map_err(|e| StoreError::StorageUnavailable(format!("failed to read schema version: {}", e)))?;

  for (index, migration) in MIGRATIONS.iter().enumerate().skip(current) {
    let version = index + 1;
    let tx = conn
      .transaction()
      .map_err(|e| StoreError::StorageUnavailable(format!("failed to begin migration: {}", e)))?;
    tx.execute_batch(migration).map_err(|e| {
      StoreError::StorageUnavailable(format!("failed to run migration {}: {}", version, e))
    })?;
    tx.pragma_update(None, "user_version", version as i64)
      .map_err(|e| {
        StoreError::StorageUnavailable(format!("failed to bump schema version: {}", e))
      })?;
    tx.commit().map_err(|e| {
      StoreError::StorageUnavailable(format!("failed to commit migration {}: {}", version, e))
    })?;
    info!(version, "applied entry store migration");
  }

  Ok(())
}

fn write_failed(e: rusqlite::Error) -> StoreError {
  StoreError::StorageWriteFailed(e.to_string())
}

fn read_failed(e: rusqlite::Error) -> StoreError {
  StoreError::StorageReadFailed(e.to_string())
}

/// Row as stored, before validation.
struct RawEntry {
  date: String,
  mood: i64,
  note: String,
  timestamp: i64,
  synced: bool,
}

impl RawEntry {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      date: row.get(0)?,
      mood: row.get(1)?,
      note: row.get(2)?,
      timestamp: row.get(3)?,
      synced: row.get(4)?,
    })
  }

  fn into_entry(self) -> Result<Entry, StoreError> {
    Ok(Entry {
      date: parse_date(&self.date)?,
      mood: Mood::new(self.mood)?,
      note: self.note,
      timestamp: self.timestamp,
      synced: self.synced,
    })
  }

  /// Rows that no longer validate are skipped rather than failing the
  /// whole listing.
  fn into_entry_logged(self) -> Option<Entry> {
    let date = self.date.clone();
    match self.into_entry() {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(date = %date, error = %e, "skipping unreadable entry");
        None
      }
    }
  }
}

#[async_trait]
impl EntryStore for SqliteStore {
  async fn upsert(&self, entry: &Entry) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let key = entry.key();
    let tx = conn.transaction().map_err(write_failed)?;

    tx.execute(
      "INSERT INTO entries (date, mood, note, timestamp, synced)
       VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT(date) DO UPDATE SET
         mood = excluded.mood,
         note = excluded.note,
         timestamp = excluded.timestamp,
         synced = excluded.synced",
      params![
        key,
        i64::from(entry.mood),
        entry.note,
        entry.timestamp,
        entry.synced
      ],
    )
    .map_err(write_failed)?;

    tx.execute("DELETE FROM sync_failures WHERE date = ?1", params![key])
      .map_err(write_failed)?;

    tx.commit().map_err(write_failed)?;
    debug!(date = %key, synced = entry.synced, "upserted entry");
    Ok(())
  }

  async fn get(&self, date: NaiveDate) -> Result<Option<Entry>, StoreError> {
    let raw = {
      let conn = self.lock()?;
      conn
        .query_row(
          &format!("{} WHERE date = ?1", SELECT_ENTRY),
          params![format_date(date)],
          RawEntry::from_row,
        )
        .optional()
        .map_err(read_failed)?
    };

    raw.map(RawEntry::into_entry).transpose()
  }

  async fn get_all(&self) -> Result<Vec<Entry>, StoreError> {
    self.query_entries(SELECT_ENTRY, [])
  }

  async fn get_by_month(&self, year: i32, month: u32) -> Result<Vec<Entry>, StoreError> {
    let Some((start, end)) = month_bounds(year, month) else {
      return Ok(Vec::new());
    };

    // Range scan on the primary key; ISO dates sort lexicographically
    self.query_entries(
      &format!("{} WHERE date >= ?1 AND date < ?2", SELECT_ENTRY),
      params![format_date(start), format_date(end)],
    )
  }

  async fn delete(&self, date: NaiveDate) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let key = format_date(date);
    let tx = conn.transaction().map_err(write_failed)?;
    let removed = tx
      .execute("DELETE FROM entries WHERE date = ?1", params![key])
      .map_err(write_failed)?;
    tx.execute("DELETE FROM sync_failures WHERE date = ?1", params![key])
      .map_err(write_failed)?;
    tx.commit().map_err(write_failed)?;

    debug!(date = %key, removed, "deleted entry");
    Ok(())
  }

  async fn unsynced(&self) -> Result<Vec<PendingEntry>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT e.date, e.mood, e.note, e.timestamp, e.synced,
                COALESCE(f.failures, 0), COALESCE(f.parked, 0)
         FROM entries e
         LEFT JOIN sync_failures f ON f.date = e.date
         WHERE e.synced = 0
         ORDER BY e.date",
      )
      .map_err(read_failed)?;

    let rows: Vec<(RawEntry, u32, bool)> = stmt
      .query_map([], |row| {
        Ok((RawEntry::from_row(row)?, row.get(5)?, row.get(6)?))
      })
      .map_err(read_failed)?
      .collect::<Result<_, _>>()
      .map_err(read_failed)?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(raw, failures, parked)| {
          raw.into_entry_logged().map(|entry| PendingEntry {
            entry,
            failures,
            parked,
          })
        })
        .collect(),
    )
  }

  async fn mark_synced(&self, date: NaiveDate, timestamp: i64) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let key = format_date(date);
    let tx = conn.transaction().map_err(write_failed)?;

    let changed = tx
      .execute(
        "UPDATE entries SET synced = 1 WHERE date = ?1 AND timestamp = ?2",
        params![key, timestamp],
      )
      .map_err(write_failed)?;
    if changed > 0 {
      tx.execute("DELETE FROM sync_failures WHERE date = ?1", params![key])
        .map_err(write_failed)?;
    }

    tx.commit().map_err(write_failed)?;
    Ok(changed > 0)
  }

  async fn record_sync_failure(
    &self,
    date: NaiveDate,
    error: &str,
    park_after: u32,
  ) -> Result<SyncFailure, StoreError> {
    let mut conn = self.lock()?;
    let key = format_date(date);
    let tx = conn.transaction().map_err(write_failed)?;

    let previous: u32 = tx
      .query_row(
        "SELECT failures FROM sync_failures WHERE date = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(write_failed)?
      .unwrap_or(0);

    let failure = next_failure(previous, park_after);

    tx.execute(
      "INSERT OR REPLACE INTO sync_failures (date, failures, last_error, parked, updated_at)
       VALUES (?1, ?2, ?3, ?4, datetime('now'))",
      params![key, failure.failures, error, failure.parked],
    )
    .map_err(write_failed)?;

    tx.commit().map_err(write_failed)?;
    Ok(failure)
  }

  async fn unpark_all(&self) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    conn
      .execute("UPDATE sync_failures SET parked = 0 WHERE parked = 1", [])
      .map_err(write_failed)
  }
}
