//! Cache storage backends: SQLite and in-memory.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::generation::{Generation, GenerationState};
use super::http::{Response, ResponseType};
use super::traits::CacheStorage;
use crate::error::CacheError;

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> CacheError + '_ {
  move |e| CacheError::Storage(format!("{}: {}", context, e))
}

/// Storage implementation that keeps cache objects in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
  inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
  caches: BTreeMap<String, HashMap<String, Response>>,
  generations: BTreeMap<String, GenerationState>,
}

impl MemoryCacheStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, CacheError> {
    self
      .inner
      .lock()
      .map_err(|e| CacheError::Storage(format!("lock poisoned: {}", e)))
  }
}

impl CacheStorage for MemoryCacheStorage {
  fn cache_names(&self) -> Result<Vec<String>, CacheError> {
    Ok(self.lock()?.caches.keys().cloned().collect())
  }

  fn put_all(&self, cache: &str, entries: &[(String, Response)]) -> Result<(), CacheError> {
    let objects = entries.iter().cloned().collect();
    self.lock()?.caches.insert(cache.to_string(), objects);
    Ok(())
  }

  fn put(&self, cache: &str, key: &str, response: &Response) -> Result<(), CacheError> {
    self
      .lock()?
      .caches
      .entry(cache.to_string())
      .or_default()
      .insert(key.to_string(), response.clone());
    Ok(())
  }

  fn lookup(&self, cache: &str, key: &str) -> Result<Option<Response>, CacheError> {
    Ok(
      self
        .lock()?
        .caches
        .get(cache)
        .and_then(|c| c.get(key))
        .cloned(),
    )
  }

  fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
    Ok(self.lock()?.caches.remove(cache).is_some())
  }

  fn entry_count(&self, cache: &str) -> Result<usize, CacheError> {
    Ok(self.lock()?.caches.get(cache).map(HashMap::len).unwrap_or(0))
  }

  fn load_generations(&self) -> Result<Vec<Generation>, CacheError> {
    Ok(
      self
        .lock()?
        .generations
        .iter()
        .filter(|(_, state)| **state != GenerationState::Redundant)
        .map(|(version, state)| Generation {
          version: version.clone(),
          state: *state,
        })
        .collect(),
    )
  }

  fn save_generation(&self, generation: &Generation) -> Result<(), CacheError> {
    self
      .lock()?
      .generations
      .insert(generation.version.clone(), generation.state);
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open or create cache storage at `path`.
  pub fn open(path: &Path) -> Result<Self, CacheError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::Storage(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Storage(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self, CacheError> {
    let conn = Connection::open_in_memory().map_err(storage_err("failed to open cache database"))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self, CacheError> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(storage_err("failed to run cache migrations"))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Storage(format!("lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named cache objects, one per generation
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request hash
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);

-- Generation lifecycle
CREATE TABLE IF NOT EXISTS generations (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn insert_entry(
  conn: &Connection,
  cache: &str,
  key: &str,
  response: &Response,
) -> Result<(), CacheError> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| CacheError::Storage(format!("failed to serialize headers: {}", e)))?;
  let response_type = match response.response_type {
    ResponseType::Basic => "basic",
    ResponseType::Opaque => "opaque",
  };

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, url, status, response_type, headers, body, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))",
      params![
        cache,
        key,
        response.url.as_str(),
        response.status,
        response_type,
        headers,
        response.body
      ],
    )
    .map_err(storage_err("failed to store response"))?;
  Ok(())
}

impl CacheStorage for SqliteCacheStorage {
  fn cache_names(&self) -> Result<Vec<String>, CacheError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY name")
      .map_err(storage_err("failed to prepare query"))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(storage_err("failed to list caches"))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(storage_err("failed to list caches"))?;
    Ok(names)
  }

  fn put_all(&self, cache: &str, entries: &[(String, Response)]) -> Result<(), CacheError> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("failed to begin transaction"))?;

    tx.execute("DELETE FROM caches WHERE name = ?1", params![cache])
      .map_err(storage_err("failed to clear cache"))?;
    tx.execute("INSERT INTO caches (name) VALUES (?1)", params![cache])
      .map_err(storage_err("failed to create cache"))?;
    for (key, response) in entries {
      insert_entry(&tx, cache, key, response)?;
    }

    tx.commit()
      .map_err(storage_err("failed to commit transaction"))?;
    Ok(())
  }

  fn put(&self, cache: &str, key: &str, response: &Response) -> Result<(), CacheError> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("failed to begin transaction"))?;
    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?1)",
      params![cache],
    )
    .map_err(storage_err("failed to create cache"))?;
    insert_entry(&tx, cache, key, response)?;
    tx.commit()
      .map_err(storage_err("failed to commit transaction"))?;
    Ok(())
  }

  fn lookup(&self, cache: &str, key: &str) -> Result<Option<Response>, CacheError> {
    let conn = self.lock()?;
    let row: Option<(String, u16, String, String, Vec<u8>)> = conn
      .query_row(
        "SELECT url, status, response_type, headers, body FROM cache_entries
         WHERE cache_name = ?1 AND request_key = ?2",
        params![cache, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(storage_err("failed to look up response"))?;

    let Some((url, status, response_type, headers, body)) = row else {
      return Ok(None);
    };

    let url: Url = url.parse().map_err(|e: url::ParseError| {
      CacheError::Storage(format!("bad cached url '{}': {}", url, e))
    })?;
    let headers = serde_json::from_str(&headers)
      .map_err(|e| CacheError::Storage(format!("failed to deserialize headers: {}", e)))?;
    let response_type = match response_type.as_str() {
      "basic" => ResponseType::Basic,
      _ => ResponseType::Opaque,
    };

    Ok(Some(Response {
      url,
      status,
      response_type,
      headers,
      body,
    }))
  }

  fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM caches WHERE name = ?1", params![cache])
      .map_err(storage_err("failed to delete cache"))?;
    Ok(removed > 0)
  }

  fn entry_count(&self, cache: &str) -> Result<usize, CacheError> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?1",
        params![cache],
        |row| row.get(0),
      )
      .map_err(storage_err("failed to count entries"))?;
    Ok(count.max(0) as usize)
  }

  fn load_generations(&self) -> Result<Vec<Generation>, CacheError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT version, state FROM generations WHERE state != 'redundant'")
      .map_err(storage_err("failed to prepare query"))?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(storage_err("failed to load generations"))?
      .collect::<Result<Vec<_>, _>>()
      .map_err(storage_err("failed to load generations"))?;

    rows
      .into_iter()
      .map(|(version, state)| {
        let state = state.parse().map_err(CacheError::Storage)?;
        Ok(Generation { version, state })
      })
      .collect()
  }

  fn save_generation(&self, generation: &Generation) -> Result<(), CacheError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO generations (version, state, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![generation.version, generation.state.as_str()],
      )
      .map_err(storage_err("failed to save generation"))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(path: &str, body: &str) -> Response {
    Response {
      url: Url::parse("https://mood.example.com/").unwrap().join(path).unwrap(),
      status: 200,
      response_type: ResponseType::Basic,
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      (
        "memory",
        Box::new(MemoryCacheStorage::new()) as Box<dyn CacheStorage>,
      ),
      (
        "sqlite",
        Box::new(SqliteCacheStorage::open_in_memory().unwrap()) as Box<dyn CacheStorage>,
      ),
    ]
  }

  #[test]
  fn test_put_all_then_lookup() {
    for (name, storage) in backends() {
      let entries = vec![
        ("a".to_string(), response("/index.html", "shell")),
        ("b".to_string(), response("/app.js", "js")),
      ];
      storage.put_all("moodlog-v1", &entries).unwrap();

      assert_eq!(storage.cache_names().unwrap(), vec!["moodlog-v1"], "{}", name);
      assert_eq!(storage.entry_count("moodlog-v1").unwrap(), 2, "{}", name);
      assert_eq!(
        storage.lookup("moodlog-v1", "a").unwrap(),
        Some(response("/index.html", "shell")),
        "{}",
        name
      );
      assert_eq!(storage.lookup("moodlog-v1", "zzz").unwrap(), None);
      assert_eq!(storage.lookup("moodlog-v2", "a").unwrap(), None);
    }
  }

  #[test]
  fn test_put_all_replaces_previous_contents() {
    for (name, storage) in backends() {
      storage
        .put_all("v1", &[("a".to_string(), response("/a", "1"))])
        .unwrap();
      storage
        .put_all("v1", &[("b".to_string(), response("/b", "2"))])
        .unwrap();
      assert_eq!(storage.lookup("v1", "a").unwrap(), None, "{}", name);
      assert_eq!(storage.entry_count("v1").unwrap(), 1, "{}", name);
    }
  }

  #[test]
  fn test_delete_cache_drops_entries() {
    for (name, storage) in backends() {
      storage.put("v1", "a", &response("/a", "1")).unwrap();
      storage.put("v2", "a", &response("/a", "2")).unwrap();

      assert!(storage.delete_cache("v1").unwrap(), "{}", name);
      assert!(!storage.delete_cache("v1").unwrap(), "{}", name);
      assert_eq!(storage.cache_names().unwrap(), vec!["v2"], "{}", name);
      assert_eq!(storage.entry_count("v1").unwrap(), 0, "{}", name);
      assert!(storage.lookup("v2", "a").unwrap().is_some());
    }
  }

  #[test]
  fn test_generations_skip_redundant() {
    for (name, storage) in backends() {
      let g1 = Generation::installing("v1");
      storage
        .save_generation(&g1.with_state(GenerationState::Active))
        .unwrap();
      storage
        .save_generation(&Generation::installing("v2"))
        .unwrap();
      storage
        .save_generation(&g1.with_state(GenerationState::Redundant))
        .unwrap();

      let generations = storage.load_generations().unwrap();
      assert_eq!(generations, vec![Generation::installing("v2")], "{}", name);
    }
  }

  #[test]
  fn test_sqlite_cache_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let storage = SqliteCacheStorage::open(&path).unwrap();
      storage.put("v1", "a", &response("/a", "1")).unwrap();
    }
    let storage = SqliteCacheStorage::open(&path).unwrap();
    assert_eq!(storage.lookup("v1", "a").unwrap(), Some(response("/a", "1")));
  }
}
