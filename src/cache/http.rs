//! Request and response types seen by the cache manager.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// How the request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  /// Anything else: scripts, styles, images, data
  Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Other,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Stable key for cache lookups. The fragment never reaches the server,
  /// so it is not part of the key.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    let input = format!("{} {}", self.method.to_ascii_uppercase(), url);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Whether the response body and status can be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response that must be treated as a black box
  Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub response_type: ResponseType,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  /// Only same-origin 200 responses may enter the runtime cache; errors and
  /// opaque responses would poison it.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  Cache,
  /// Navigation failed and the cached app shell was served instead
  AppShell,
  /// Not intercepted: no active generation or not a GET
  Passthrough,
}

/// A response together with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_ignores_fragment_and_mode() {
    let plain = Request::get(url("https://mood.example.com/app.js"));
    let fragment = Request::navigate(url("https://mood.example.com/app.js#top"));
    assert_eq!(plain.cache_key(), fragment.cache_key());
    assert_eq!(plain.cache_key().len(), 64);
  }

  #[test]
  fn test_cache_key_depends_on_query_and_method() {
    let a = Request::get(url("https://mood.example.com/data?m=5"));
    let b = Request::get(url("https://mood.example.com/data?m=6"));
    assert_ne!(a.cache_key(), b.cache_key());

    let mut post = a.clone();
    post.method = "POST".to_string();
    assert_ne!(a.cache_key(), post.cache_key());
    assert!(!post.is_get());
  }

  #[test]
  fn test_cacheable_only_same_origin_200() {
    let mut response = Response {
      url: url("https://mood.example.com/app.js"),
      status: 200,
      response_type: ResponseType::Basic,
      headers: vec![("Content-Type".to_string(), "text/javascript".to_string())],
      body: b"ok".to_vec(),
    };
    assert!(response.is_cacheable());
    assert_eq!(response.header("content-type"), Some("text/javascript"));

    response.status = 404;
    assert!(!response.is_cacheable());

    response.status = 200;
    response.response_type = ResponseType::Opaque;
    assert!(!response.is_cacheable());
  }
}
