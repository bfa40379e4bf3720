//! Seams of the cache manager: where responses are stored and fetched.

use async_trait::async_trait;

use super::generation::Generation;
use super::http::{Request, Response};
use crate::error::CacheError;

/// Transport used by the cache manager to reach the network.
#[async_trait]
pub trait Network: Send + Sync {
  /// Perform the request. HTTP error statuses are responses, not errors;
  /// `Err` means the network could not be reached.
  async fn fetch(&self, request: &Request) -> Result<Response, CacheError>;
}

/// Named cache objects plus the persisted generation lifecycle.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing cache object.
  fn cache_names(&self) -> Result<Vec<String>, CacheError>;

  /// Create `cache` holding exactly `entries`, in one transaction. Nothing
  /// is written if any entry fails.
  fn put_all(&self, cache: &str, entries: &[(String, Response)]) -> Result<(), CacheError>;

  /// Store one response under `key`, replacing any previous one.
  fn put(&self, cache: &str, key: &str, response: &Response) -> Result<(), CacheError>;

  fn lookup(&self, cache: &str, key: &str) -> Result<Option<Response>, CacheError>;

  /// Drop a cache object and everything in it. Returns whether it existed.
  fn delete_cache(&self, cache: &str) -> Result<bool, CacheError>;

  fn entry_count(&self, cache: &str) -> Result<usize, CacheError>;

  /// Every generation recorded so far that is not redundant.
  fn load_generations(&self) -> Result<Vec<Generation>, CacheError>;

  fn save_generation(&self, generation: &Generation) -> Result<(), CacheError>;
}
