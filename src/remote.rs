//! Remote submitter contract and its HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::config::{Config, RemoteConfig};
use crate::entry::Entry;
use crate::error::SubmitError;

/// Pushes one entry to the remote service.
///
/// No batching, no ordering requirement. `Ok` means the remote now holds an
/// authoritative copy of exactly this write.
#[async_trait]
pub trait RemoteSubmitter: Send + Sync {
  async fn submit(&self, entry: &Entry) -> Result<(), SubmitError>;
}

/// Submitter that POSTs each entry as JSON.
#[derive(Clone)]
pub struct HttpSubmitter {
  client: Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpSubmitter {
  pub fn new(remote: &RemoteConfig) -> Result<Self> {
    let client = Client::builder()
      .connect_timeout(remote.connect_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      endpoint: remote.endpoint.clone(),
      token: Config::remote_token(),
    })
  }
}

#[async_trait]
impl RemoteSubmitter for HttpSubmitter {
  async fn submit(&self, entry: &Entry) -> Result<(), SubmitError> {
    let mut request = self.client.post(self.endpoint.clone()).json(entry);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    debug!(date = %entry.key(), %status, "remote answered");

    if status.is_success() {
      Ok(())
    } else {
      Err(SubmitError::Rejected(format!("HTTP {}", status)))
    }
  }
}

/// Transport failures mean the remote is out of reach; anything else is a
/// refusal of this particular request.
fn classify(e: reqwest::Error) -> SubmitError {
  if e.is_connect() || e.is_timeout() || e.is_request() {
    SubmitError::Unreachable(e.to_string())
  } else {
    SubmitError::Rejected(e.to_string())
  }
}
