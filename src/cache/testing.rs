//! Scripted network for cache tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use url::Url;

use super::http::{Request, Response, ResponseType};
use super::traits::Network;
use crate::error::CacheError;

pub const ORIGIN: &str = "https://mood.example.com/";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn ok(path: &str, body: &str) -> Response {
  Response {
    url: url(path),
    status: 200,
    response_type: ResponseType::Basic,
    headers: vec![("Content-Type".to_string(), "text/html".to_string())],
    body: body.as_bytes().to_vec(),
  }
}

/// Answers from a fixed table. Unknown URLs get a 404; when offline every
/// request fails. Stalled URLs hang until `release`.
pub struct FakeNetwork {
  routes: Mutex<HashMap<Url, Response>>,
  offline: AtomicBool,
  fetches: AtomicUsize,
  stalled: Mutex<HashSet<Url>>,
  gate: Semaphore,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      routes: Mutex::new(HashMap::new()),
      offline: AtomicBool::new(false),
      fetches: AtomicUsize::new(0),
      stalled: Mutex::new(HashSet::new()),
      gate: Semaphore::new(0),
    })
  }

  pub fn route(&self, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(response.url.clone(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn stall(&self, url: Url) {
    self.stalled.lock().unwrap().insert(url);
  }

  /// Let every stalled request through, now and later.
  pub fn release(&self) {
    self.stalled.lock().unwrap().clear();
    // Each waiter hands the permit back on the way out
    self.gate.add_permits(1);
  }

  pub fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for Arc<FakeNetwork> {
  async fn fetch(&self, request: &Request) -> Result<Response, CacheError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let stalled = self.stalled.lock().unwrap().contains(&request.url);
    if stalled {
      let _ = self.gate.acquire().await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(CacheError::Network(format!("{}: connection refused", request.url)));
    }

    let mut key = request.url.clone();
    key.set_fragment(None);
    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response {
          url: request.url.clone(),
          status: 404,
          response_type: ResponseType::Basic,
          headers: Vec::new(),
          body: b"not found".to_vec(),
        }),
    )
  }
}
