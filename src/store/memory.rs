//! In-memory entry store.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{next_failure, EntryStore, PendingEntry, SyncFailure};
use crate::entry::{month_bounds, Entry};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Inner {
  entries: BTreeMap<NaiveDate, Entry>,
  failures: BTreeMap<NaiveDate, SyncFailure>,
}

/// Entry store that keeps everything in process memory.
///
/// Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
    self
      .inner
      .lock()
      .map_err(|e| StoreError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }
}

#[async_trait]
impl EntryStore for MemoryStore {
  async fn upsert(&self, entry: &Entry) -> Result<(), StoreError> {
    let mut inner = self.lock()?;
    inner.entries.insert(entry.date, entry.clone());
    inner.failures.remove(&entry.date);
    Ok(())
  }

  async fn get(&self, date: NaiveDate) -> Result<Option<Entry>, StoreError> {
    Ok(self.lock()?.entries.get(&date).cloned())
  }

  async fn get_all(&self) -> Result<Vec<Entry>, StoreError> {
    Ok(self.lock()?.entries.values().cloned().collect())
  }

  async fn get_by_month(&self, year: i32, month: u32) -> Result<Vec<Entry>, StoreError> {
    let Some((start, end)) = month_bounds(year, month) else {
      return Ok(Vec::new());
    };
    Ok(
      self
        .lock()?
        .entries
        .range(start..end)
        .map(|(_, e)| e.clone())
        .collect(),
    )
  }

  async fn delete(&self, date: NaiveDate) -> Result<(), StoreError> {
    let mut inner = self.lock()?;
    inner.entries.remove(&date);
    inner.failures.remove(&date);
    Ok(())
  }

  async fn unsynced(&self) -> Result<Vec<PendingEntry>, StoreError> {
    let inner = self.lock()?;
    Ok(
      inner
        .entries
        .values()
        .filter(|e| !e.synced)
        .map(|e| {
          let failure = inner.failures.get(&e.date);
          PendingEntry {
            entry: e.clone(),
            failures: failure.map(|f| f.failures).unwrap_or(0),
            parked: failure.map(|f| f.parked).unwrap_or(false),
          }
        })
        .collect(),
    )
  }

  async fn mark_synced(&self, date: NaiveDate, timestamp: i64) -> Result<bool, StoreError> {
    let mut inner = self.lock()?;
    let flipped = match inner.entries.get_mut(&date) {
      Some(entry) if entry.timestamp == timestamp => {
        entry.synced = true;
        true
      }
      _ => false,
    };
    if flipped {
      inner.failures.remove(&date);
    }
    Ok(flipped)
  }

  async fn record_sync_failure(
    &self,
    date: NaiveDate,
    _error: &str,
    park_after: u32,
  ) -> Result<SyncFailure, StoreError> {
    let mut inner = self.lock()?;
    let previous = inner.failures.get(&date).map(|f| f.failures).unwrap_or(0);
    let failure = next_failure(previous, park_after);
    inner.failures.insert(date, failure);
    Ok(failure)
  }

  async fn unpark_all(&self) -> Result<usize, StoreError> {
    let mut inner = self.lock()?;
    let mut count = 0;
    for failure in inner.failures.values_mut() {
      if failure.parked {
        failure.parked = false;
        count += 1;
      }
    }
    Ok(count)
  }
}
