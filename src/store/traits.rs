//! Storage contract for journal entries.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::entry::Entry;
use crate::error::StoreError;

/// An unsynced entry together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
  pub entry: Entry,
  /// Consecutive sync passes that failed to submit this entry
  pub failures: u32,
  /// Dead-lettered: skipped by sync passes until edited or unparked
  pub parked: bool,
}

/// Bookkeeping after recording a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFailure {
  pub failures: u32,
  pub parked: bool,
}

/// Durable keyed storage for entries.
///
/// Every single-record write is atomic: on error the previous record (if
/// any) is left untouched. No operation spans several records.
#[async_trait]
pub trait EntryStore: Send + Sync {
  /// Write the full record, replacing any record with the same date.
  /// Clears the sync bookkeeping of that date.
  async fn upsert(&self, entry: &Entry) -> Result<(), StoreError>;

  /// Record for `date`, or `None`.
  async fn get(&self, date: NaiveDate) -> Result<Option<Entry>, StoreError>;

  /// Every record, in no particular order.
  async fn get_all(&self) -> Result<Vec<Entry>, StoreError>;

  /// Records whose date falls in `year`/`month`. Empty for a month that does
  /// not exist.
  async fn get_by_month(&self, year: i32, month: u32) -> Result<Vec<Entry>, StoreError>;

  /// Remove the record for `date`. Deleting a missing date succeeds.
  async fn delete(&self, date: NaiveDate) -> Result<(), StoreError>;

  /// Every record with `synced = false`, ascending by date.
  async fn unsynced(&self) -> Result<Vec<PendingEntry>, StoreError>;

  /// Flip `synced` to true for `date` if the stored record still carries
  /// `timestamp`. Returns whether the record was flipped.
  async fn mark_synced(&self, date: NaiveDate, timestamp: i64) -> Result<bool, StoreError>;

  /// Count one more failed pass for `date`, remembering `error`. The entry is
  /// parked once its failure count reaches `park_after` (0 never parks).
  async fn record_sync_failure(
    &self,
    date: NaiveDate,
    error: &str,
    park_after: u32,
  ) -> Result<SyncFailure, StoreError>;

  /// Clear the parked flag everywhere. Returns how many entries were parked.
  async fn unpark_all(&self) -> Result<usize, StoreError>;
}

pub(crate) fn next_failure(previous: u32, park_after: u32) -> SyncFailure {
  let failures = previous.saturating_add(1);
  SyncFailure {
    failures,
    parked: park_after > 0 && failures >= park_after,
  }
}
