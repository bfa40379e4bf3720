//! Network transport for the cache manager, backed by reqwest.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method};
use std::time::Duration;
use url::{Origin, Url};

use super::http::{Request, Response, ResponseType};
use super::traits::Network;
use crate::error::CacheError;

/// Fetches over HTTP and tags each response as same-origin or opaque.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
  origin: Origin,
}

impl HttpNetwork {
  pub fn new(origin: &Url, connect_timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .connect_timeout(connect_timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }

  fn response_type(&self, url: &Url) -> ResponseType {
    if url.origin() == self.origin {
      ResponseType::Basic
    } else {
      ResponseType::Opaque
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, CacheError> {
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| CacheError::Network(format!("invalid method '{}': {}", request.method, e)))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| CacheError::Network(e.to_string()))?;

    // Redirects are followed, so classify by where we ended up
    let url = response.url().clone();
    let response_type = self.response_type(&url);
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| CacheError::Network(format!("failed to read body of {}: {}", url, e)))?
      .to_vec();

    Ok(Response {
      url,
      status,
      response_type,
      headers,
      body,
    })
  }
}
