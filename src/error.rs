//! Error taxonomy for the persistence, sync and cache subsystems.

use thiserror::Error;

/// Errors raised by the local entry store.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The storage engine could not be opened or migrated. Every
  /// persistence-dependent feature is unavailable until this is fixed.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A single write transaction aborted. The previous record is intact and
  /// the same write may be retried.
  #[error("storage write failed: {0}")]
  StorageWriteFailed(String),

  #[error("mood must be between 1 and 5, got {0}")]
  InvalidMood(i64),

  #[error("invalid date '{0}', expected YYYY-MM-DD")]
  InvalidDate(String),

  /// A read failed after the store was opened.
  #[error("storage read failed: {0}")]
  StorageReadFailed(String),
}

impl StoreError {
  /// Whether repeating the same operation may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::StorageWriteFailed(_) | Self::StorageReadFailed(_))
  }
}

/// Result of a single remote submission attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
  /// The remote could not be reached at the transport level.
  #[error("remote unreachable: {0}")]
  Unreachable(String),

  /// The remote answered but refused the entry.
  #[error("remote rejected entry: {0}")]
  Rejected(String),
}

/// Errors surfaced by the sync coordinator.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error("remote submit failed for {date}: {source}")]
  RemoteSubmitFailed {
    date: String,
    #[source]
    source: SubmitError,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("sync coordinator has shut down")]
  CoordinatorGone,
}

/// Errors raised by the cache manager and its worker.
#[derive(Error, Debug)]
pub enum CacheError {
  /// An asset from the precache manifest could not be fetched. The new
  /// generation is discarded and the active one keeps serving.
  #[error("precache incomplete: {url}: {reason}")]
  PrecacheIncomplete { url: String, reason: String },

  /// The network is unreachable and nothing cached can answer the request.
  #[error("offline and no cached response for {0}")]
  Offline(String),

  #[error("network error: {0}")]
  Network(String),

  #[error("cache storage error: {0}")]
  Storage(String),

  #[error("no generation is waiting to be activated")]
  NothingWaiting,

  #[error("cache worker has shut down")]
  WorkerGone,
}
