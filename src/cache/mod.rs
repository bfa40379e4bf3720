//! Offline asset cache.
//!
//! This module provides a versioned cache worker that:
//! - Precaches the app's asset manifest as one generation per version
//! - Keeps a new generation waiting until the foreground asks for it
//! - Purges every older cache object on activation
//! - Serves navigations network-first with an app-shell fallback
//! - Serves other GET requests cache-first

mod channel;
mod clients;
mod generation;
mod http;
mod manager;
mod network;
mod storage;
mod traits;

#[cfg(test)]
mod testing;

pub use channel::{
  CacheWorker, ControlCommand, PageReloader, Reload, UpdateChannel, WorkerHandle, WorkerMessage,
};
pub use clients::{Client, ClientAction, ClientId, Clients};
pub use generation::{Generation, GenerationState};
pub use http::{CacheSource, Request, RequestMode, Response, ResponseType, Served};
pub use manager::{
  CacheManager, CacheSettings, CacheStatus, InstallOutcome, InstallStart, PrecacheJob,
};
pub use network::HttpNetwork;
pub use storage::{MemoryCacheStorage, SqliteCacheStorage};
pub use traits::{CacheStorage, Network};
