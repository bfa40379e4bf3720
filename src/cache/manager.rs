//! Versioned asset cache: precache install, activation and fetch interception.
//!
//! A generation is installed by fetching the whole manifest and writing it
//! in one transaction. It then waits until told to activate (or activates at
//! once when nothing is active yet). Activation purges every other cache
//! object and claims the open clients.

use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use super::clients::{ClientAction, ClientId, Clients};
use super::generation::{Generation, GenerationState};
use super::http::{CacheSource, Request, RequestMode, Response, Served};
use super::traits::{CacheStorage, Network};
use crate::config::CacheConfig;
use crate::error::CacheError;

/// What the manager needs to know about the app it serves.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  /// Cache object names are `<prefix>-<version>`
  pub prefix: String,
  pub manifest: Vec<Url>,
  /// Document served for navigations while offline
  pub app_shell: Url,
  pub start_url: Url,
}

impl CacheSettings {
  pub fn from_config(config: &CacheConfig) -> color_eyre::Result<Self> {
    let mut manifest = config.manifest_urls()?;
    let app_shell = config.app_shell_url()?;
    if !manifest.contains(&app_shell) {
      manifest.push(app_shell.clone());
    }

    Ok(Self {
      prefix: config.prefix.clone(),
      manifest,
      app_shell,
      start_url: config.start_url()?,
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Nothing was active, so the new generation took over immediately
  Activated,
  /// Installed; waiting for `SkipWaiting`
  Waiting,
  AlreadyActive,
  AlreadyWaiting,
  /// The same version is being precached right now
  AlreadyInstalling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
  pub active: Option<String>,
  pub waiting: Option<String>,
  /// Every cache object with its entry count
  pub caches: Vec<(String, usize)>,
  pub clients: usize,
}

/// First step of an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStart {
  /// Recorded as installing; the precache job must run next
  Started(Generation),
  /// Nothing to do
  Done(InstallOutcome),
}

/// Manifest fetch for one install. Runs without access to the manager, so
/// the active generation keeps serving meanwhile.
pub struct PrecacheJob<N: Network> {
  network: Arc<N>,
  manifest: Vec<Url>,
}

impl<N: Network> PrecacheJob<N> {
  /// Fetch every manifest URL concurrently. Any failure fails the lot.
  pub async fn run(self) -> Result<Vec<(String, Response)>, CacheError> {
    let network = &self.network;
    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| CacheError::PrecacheIncomplete {
          url: url.to_string(),
          reason: e.to_string(),
        })?;

      if response.status != 200 {
        return Err(CacheError::PrecacheIncomplete {
          url: url.to_string(),
          reason: format!("status {}", response.status),
        });
      }
      debug!(url = %url, "precached");
      Ok((request.cache_key(), response))
    });

    try_join_all(fetches).await
  }
}

pub struct CacheManager<S: CacheStorage, N: Network> {
  storage: S,
  network: Arc<N>,
  settings: CacheSettings,
  active: Option<Generation>,
  waiting: Option<Generation>,
  /// Versions whose precache job is still running
  installing: BTreeSet<String>,
  clients: Clients,
  controller: watch::Sender<Option<String>>,
}

impl<S: CacheStorage, N: Network> CacheManager<S, N> {
  pub fn new(storage: S, network: N, settings: CacheSettings) -> Self {
    let (controller, _) = watch::channel(None);
    Self {
      storage,
      network: Arc::new(network),
      settings,
      active: None,
      waiting: None,
      installing: BTreeSet::new(),
      clients: Clients::new(),
      controller,
    }
  }

  /// Pick up the generations persisted by a previous run. An install that
  /// never finished is discarded.
  pub fn restore(&mut self) -> Result<(), CacheError> {
    for generation in self.storage.load_generations()? {
      match generation.state {
        GenerationState::Active => self.active = Some(generation),
        GenerationState::Waiting => self.waiting = Some(generation),
        GenerationState::Installing => {
          warn!(version = %generation.version, "discarding interrupted install");
          self.discard(&generation)?;
        }
        GenerationState::Redundant => {}
      }
    }

    if let Some(active) = &self.active {
      info!(version = %active.version, "restored active cache generation");
      self.controller.send_replace(Some(active.version.clone()));
    }
    Ok(())
  }

  pub fn cache_name(&self, version: &str) -> String {
    format!("{}-{}", self.settings.prefix, version)
  }

  pub fn active_version(&self) -> Option<&str> {
    self.active.as_ref().map(|g| g.version.as_str())
  }

  pub fn waiting_version(&self) -> Option<&str> {
    self.waiting.as_ref().map(|g| g.version.as_str())
  }

  /// Whether any precache job has started but not finished.
  pub fn is_installing(&self) -> bool {
    !self.installing.is_empty()
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  /// Receiver of the controlling version. Changes once per activation.
  pub fn controller_changes(&self) -> watch::Receiver<Option<String>> {
    self.controller.subscribe()
  }

  fn discard(&self, generation: &Generation) -> Result<(), CacheError> {
    self.storage.delete_cache(&self.cache_name(&generation.version))?;
    self
      .storage
      .save_generation(&generation.with_state(GenerationState::Redundant))
  }

  /// Precache the manifest as generation `version`, start to finish.
  ///
  /// The worker runs the same three steps but keeps serving while the
  /// precache job is in flight.
  pub async fn install(&mut self, version: &str) -> Result<InstallOutcome, CacheError> {
    let generation = match self.begin_install(version)? {
      InstallStart::Started(generation) => generation,
      InstallStart::Done(outcome) => return Ok(outcome),
    };
    let precached = self.precache_job().run().await;
    self.finish_install(generation, precached)
  }

  /// Record a new generation as installing, unless `version` is already
  /// known.
  pub fn begin_install(&mut self, version: &str) -> Result<InstallStart, CacheError> {
    if self.active_version() == Some(version) {
      return Ok(InstallStart::Done(InstallOutcome::AlreadyActive));
    }
    if self.waiting_version() == Some(version) {
      return Ok(InstallStart::Done(InstallOutcome::AlreadyWaiting));
    }
    if self.installing.contains(version) {
      return Ok(InstallStart::Done(InstallOutcome::AlreadyInstalling));
    }

    let generation = Generation::installing(version);
    self.storage.save_generation(&generation)?;
    self.installing.insert(version.to_string());
    info!(version, assets = self.settings.manifest.len(), "installing cache generation");
    Ok(InstallStart::Started(generation))
  }

  /// Everything needed to fetch the manifest, detached from the manager.
  pub fn precache_job(&self) -> PrecacheJob<N> {
    PrecacheJob {
      network: Arc::clone(&self.network),
      manifest: self.settings.manifest.clone(),
    }
  }

  /// Store the precached assets in one transaction and move the
  /// generation to waiting, or discard it if anything failed.
  pub fn finish_install(
    &mut self,
    generation: Generation,
    precached: Result<Vec<(String, Response)>, CacheError>,
  ) -> Result<InstallOutcome, CacheError> {
    self.installing.remove(&generation.version);
    let version = generation.version.as_str();

    let entries = match precached {
      Ok(entries) => entries,
      Err(e) => {
        warn!(version, error = %e, "install failed");
        self.discard(&generation)?;
        return Err(e);
      }
    };

    let cache = self.cache_name(version);
    if let Err(e) = self.storage.put_all(&cache, &entries) {
      warn!(version, error = %e, "install failed while storing assets");
      self.discard(&generation)?;
      return Err(e);
    }

    let installed = generation.with_state(GenerationState::Waiting);
    self.storage.save_generation(&installed)?;
    info!(version = %installed.version, "cache generation installed");
    if let Some(previous) = self.waiting.replace(installed) {
      info!(version = %previous.version, "replacing older waiting generation");
      self.discard(&previous)?;
    }

    if self.active.is_none() {
      self.activate()?;
      return Ok(InstallOutcome::Activated);
    }
    Ok(InstallOutcome::Waiting)
  }

  /// Promote the waiting generation. Returns its version.
  pub fn activate(&mut self) -> Result<String, CacheError> {
    let waiting = self.waiting.take().ok_or(CacheError::NothingWaiting)?;
    let keep = self.cache_name(&waiting.version);

    for name in self.storage.cache_names()? {
      if name != keep {
        debug!(cache = %name, "deleting stale cache");
        self.storage.delete_cache(&name)?;
      }
    }

    if let Some(previous) = self.active.take() {
      self
        .storage
        .save_generation(&previous.with_state(GenerationState::Redundant))?;
    }

    let active = waiting.with_state(GenerationState::Active);
    self.storage.save_generation(&active)?;
    let version = active.version.clone();
    self.active = Some(active);

    let claimed = self.clients.claim(&version);
    info!(version = %version, claimed, "cache generation activated");
    self.controller.send_replace(Some(version.clone()));
    Ok(version)
  }

  /// `SkipWaiting`: activate now if something is waiting.
  pub fn skip_waiting(&mut self) -> Result<Option<String>, CacheError> {
    if self.waiting.is_none() {
      debug!("SkipWaiting with nothing waiting");
      return Ok(None);
    }
    self.activate().map(Some)
  }

  /// Answer a request the way the page would see it.
  pub async fn handle_fetch(&self, request: Request) -> Result<Served, CacheError> {
    let Some(active) = &self.active else {
      return self.passthrough(&request).await;
    };
    if !request.is_get() {
      return self.passthrough(&request).await;
    }

    let cache = self.cache_name(&active.version);
    match request.mode {
      RequestMode::Navigate => self.network_first(&cache, &request).await,
      RequestMode::Other => self.cache_first(&cache, &request).await,
    }
  }

  async fn passthrough(&self, request: &Request) -> Result<Served, CacheError> {
    let response = self.network.fetch(request).await?;
    Ok(Served {
      response,
      source: CacheSource::Passthrough,
    })
  }

  async fn network_first(&self, cache: &str, request: &Request) -> Result<Served, CacheError> {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(cache, request, &response);
        Ok(Served {
          response,
          source: CacheSource::Network,
        })
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "navigation failed, serving app shell");
        let shell = Request::get(self.settings.app_shell.clone());
        match self.storage.lookup(cache, &shell.cache_key())? {
          Some(response) => Ok(Served {
            response,
            source: CacheSource::AppShell,
          }),
          None => Err(CacheError::Offline(request.url.to_string())),
        }
      }
    }
  }

  async fn cache_first(&self, cache: &str, request: &Request) -> Result<Served, CacheError> {
    if let Some(response) = self.storage.lookup(cache, &request.cache_key())? {
      return Ok(Served {
        response,
        source: CacheSource::Cache,
      });
    }

    let response = self.network.fetch(request).await.map_err(|e| {
      debug!(url = %request.url, error = %e, "cache miss while offline");
      CacheError::Offline(request.url.to_string())
    })?;
    self.store(cache, request, &response);
    Ok(Served {
      response,
      source: CacheSource::Network,
    })
  }

  /// Keep a copy of an eligible response. A failed write only costs a
  /// future cache hit.
  fn store(&self, cache: &str, request: &Request, response: &Response) {
    if !response.is_cacheable() {
      debug!(url = %request.url, status = response.status, "not caching response");
      return;
    }
    if let Err(e) = self.storage.put(cache, &request.cache_key(), response) {
      warn!(url = %request.url, error = %e, "failed to cache response");
    }
  }

  pub fn open_client(&mut self, url: Url) -> ClientId {
    let controller = self.active_version().map(String::from);
    self.clients.open(url, controller)
  }

  pub fn close_client(&mut self, id: ClientId) -> bool {
    self.clients.close(id)
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn notification_click(&mut self) -> ClientAction {
    let controller = self.active_version().map(String::from);
    self
      .clients
      .notification_click(&self.settings.start_url, controller)
  }

  pub fn status(&self) -> Result<CacheStatus, CacheError> {
    let caches = self
      .storage
      .cache_names()?
      .into_iter()
      .map(|name| {
        let count = self.storage.entry_count(&name)?;
        Ok((name, count))
      })
      .collect::<Result<Vec<_>, CacheError>>()?;

    Ok(CacheStatus {
      active: self.active_version().map(String::from),
      waiting: self.waiting_version().map(String::from),
      caches,
      clients: self.clients.len(),
    })
  }
}
