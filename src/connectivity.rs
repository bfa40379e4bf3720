//! Connectivity detection.
//!
//! Polls a reachability URL and reports transitions only, the same way a
//! browser raises `online` / `offline` events.

use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

/// Observed network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Polls `url` and emits an event whenever reachability changes.
pub struct ConnectivityProbe {
  client: Client,
  url: Url,
  interval: Duration,
}

impl ConnectivityProbe {
  pub fn new(url: Url, interval: Duration, timeout: Duration) -> color_eyre::Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      url,
      interval,
    })
  }

  /// Any HTTP answer counts as online; only transport failures are offline.
  pub async fn check(&self) -> Connectivity {
    match self.client.head(self.url.clone()).send().await {
      Ok(response) => {
        debug!(status = %response.status(), "connectivity probe answered");
        Connectivity::Online
      }
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        Connectivity::Offline
      }
    }
  }

  /// Spawn the polling loop. The first probe result is always emitted.
  /// The loop ends when the receiver is dropped.
  pub fn spawn(self) -> mpsc::UnboundedReceiver<Connectivity> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut detector = TransitionDetector::default();
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        let observed = self.check().await;
        if let Some(change) = detector.observe(observed) {
          info!(?change, url = %self.url, "connectivity changed");
          if tx.send(change).is_err() {
            break;
          }
        }
      }
    });

    rx
  }
}

/// Turns a stream of observations into a stream of transitions.
#[derive(Debug, Default)]
pub struct TransitionDetector {
  last: Option<Connectivity>,
}

impl TransitionDetector {
  pub fn observe(&mut self, observed: Connectivity) -> Option<Connectivity> {
    if self.last == Some(observed) {
      return None;
    }
    self.last = Some(observed);
    Some(observed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_changes_are_reported() {
    let mut detector = TransitionDetector::default();
    assert_eq!(detector.observe(Connectivity::Offline), Some(Connectivity::Offline));
    assert_eq!(detector.observe(Connectivity::Offline), None);
    assert_eq!(detector.observe(Connectivity::Online), Some(Connectivity::Online));
    assert_eq!(detector.observe(Connectivity::Online), None);
    assert_eq!(detector.observe(Connectivity::Offline), Some(Connectivity::Offline));
  }
}
