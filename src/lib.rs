//! Offline-first mood journal core.
//!
//! - `store`: durable per-day entry storage with sync bookkeeping
//! - `sync`: connectivity-driven reconciliation with a remote service
//! - `cache`: versioned asset cache running in an isolated worker task
//! - `config`, `logging`: application plumbing used by the binary

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod entry;
pub mod error;
pub mod logging;
pub mod remote;
pub mod store;
pub mod sync;

pub use entry::{Entry, Mood};
pub use error::{CacheError, StoreError, SubmitError, SyncError};
