//! Local entry storage.
//!
//! The store is the leaf dependency of the crate:
//! - one record per calendar date, upsert-by-key
//! - idempotent deletes
//! - sync bookkeeping (unsynced listing, compare-and-set sync flag, parking)

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{EntryStore, PendingEntry, SyncFailure};

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::entry::{Entry, Mood};
use crate::error::StoreError;

/// User-facing journal operations on top of an entry store.
///
/// Saves are stamped with the injected clock and always start unsynced.
pub struct Journal<S: EntryStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
}

impl<S: EntryStore> Journal<S> {
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }

  /// Record the mood for `date`, replacing any earlier record for that day.
  pub async fn save(&self, date: NaiveDate, mood: Mood, note: &str) -> Result<Entry, StoreError> {
    let entry = Entry::new(date, mood, note, self.clock.now_millis());
    self.store.upsert(&entry).await?;
    info!(date = %entry.key(), mood = %mood, "saved entry");
    Ok(entry)
  }

  pub async fn get(&self, date: NaiveDate) -> Result<Option<Entry>, StoreError> {
    self.store.get(date).await
  }

  /// All entries, most recent date first.
  pub async fn history(&self) -> Result<Vec<Entry>, StoreError> {
    let mut entries = self.store.get_all().await?;
    entries.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(entries)
  }

  /// Entries of one month, in calendar order.
  pub async fn month(&self, year: i32, month: u32) -> Result<Vec<Entry>, StoreError> {
    let mut entries = self.store.get_by_month(year, month).await?;
    entries.sort_by_key(|e| e.date);
    Ok(entries)
  }

  pub async fn delete(&self, date: NaiveDate) -> Result<(), StoreError> {
    self.store.delete(date).await?;
    info!(date = %date, "deleted entry");
    Ok(())
  }
}

impl<S: EntryStore> Clone for Journal<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
    }
  }
}
