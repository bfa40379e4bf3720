//! Open client pages known to the cache worker.

use std::collections::BTreeMap;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: ClientId,
  pub url: Url,
  pub focused: bool,
  /// Version of the generation controlling this page, if any
  pub controller: Option<String>,
}

/// Result of routing a notification click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
  /// An existing page was brought to the front
  Focused(ClientId),
  /// No page was open; a new one was opened
  Opened(ClientId),
}

#[derive(Debug, Default)]
pub struct Clients {
  next_id: u64,
  clients: BTreeMap<ClientId, Client>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a page. Pages load under the currently active generation.
  pub fn open(&mut self, url: Url, controller: Option<String>) -> ClientId {
    self.next_id += 1;
    let id = ClientId(self.next_id);
    self.clients.insert(
      id,
      Client {
        id,
        url,
        focused: false,
        controller,
      },
    );
    id
  }

  pub fn close(&mut self, id: ClientId) -> bool {
    self.clients.remove(&id).is_some()
  }

  pub fn get(&self, id: ClientId) -> Option<&Client> {
    self.clients.get(&id)
  }

  pub fn len(&self) -> usize {
    self.clients.len()
  }

  pub fn is_empty(&self) -> bool {
    self.clients.is_empty()
  }

  /// Put every open page under `version`. Returns how many changed.
  pub fn claim(&mut self, version: &str) -> usize {
    let mut claimed = 0;
    for client in self.clients.values_mut() {
      if client.controller.as_deref() != Some(version) {
        client.controller = Some(version.to_string());
        claimed += 1;
      }
    }
    claimed
  }

  fn focus(&mut self, id: ClientId) {
    for client in self.clients.values_mut() {
      client.focused = client.id == id;
    }
  }

  /// Focus an open page if there is one (the most recently opened),
  /// otherwise open `start_url`.
  pub fn notification_click(
    &mut self,
    start_url: &Url,
    controller: Option<String>,
  ) -> ClientAction {
    if let Some(id) = self.clients.keys().next_back().copied() {
      self.focus(id);
      return ClientAction::Focused(id);
    }

    let id = self.open(start_url.clone(), controller);
    self.focus(id);
    ClientAction::Opened(id)
  }
}
