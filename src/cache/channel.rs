//! Message channel between the foreground and the cache worker.
//!
//! The worker task owns the [`CacheManager`]; the foreground only holds a
//! [`WorkerHandle`] and sends it messages. Activation of a waiting
//! generation is requested with `ControlCommand::SkipWaiting` and observed
//! through the controller watch channel.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::clients::{ClientAction, ClientId};
use super::generation::Generation;
use super::http::{Request, Response, Served};
use super::manager::{CacheManager, CacheStatus, InstallOutcome, InstallStart};
use super::traits::{CacheStorage, Network};
use crate::error::CacheError;

/// Typed control messages from the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
  /// Activate the waiting generation now
  SkipWaiting,
}

type Reply<T> = oneshot::Sender<Result<T, CacheError>>;

/// Everything the worker understands.
#[derive(Debug)]
pub enum WorkerMessage {
  Install {
    version: String,
    reply: Reply<InstallOutcome>,
  },
  Fetch {
    request: Request,
    reply: Reply<Served>,
  },
  Control(ControlCommand),
  OpenClient {
    url: Url,
    reply: oneshot::Sender<ClientId>,
  },
  CloseClient(ClientId),
  NotificationClick {
    reply: oneshot::Sender<ClientAction>,
  },
  Status {
    reply: Reply<CacheStatus>,
  },
  Shutdown,
}

/// A precache job reporting back to the worker.
struct InstallDone {
  generation: Generation,
  precached: Result<Vec<(String, Response)>, CacheError>,
  reply: Reply<InstallOutcome>,
}

pub struct CacheWorker;

impl CacheWorker {
  /// Move the manager into its own task.
  pub fn spawn<S, N>(manager: CacheManager<S, N>) -> WorkerHandle
  where
    S: CacheStorage + 'static,
    N: Network + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = manager.controller_changes();
    let task = tokio::spawn(run_worker(manager, rx));

    WorkerHandle {
      tx,
      controller,
      task,
    }
  }
}

async fn run_worker<S, N>(
  mut manager: CacheManager<S, N>,
  mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) where
  S: CacheStorage,
  N: Network + 'static,
{
  let (done_tx, mut done_rx) = mpsc::unbounded_channel::<InstallDone>();
  let mut stopping = false;

  // Manifest fetches run in their own tasks; fetches keep being answered
  // from the active generation until an install reports back.
  loop {
    tokio::select! {
      message = rx.recv(), if !stopping => match message {
        Some(WorkerMessage::Shutdown) | None => stopping = true,
        Some(message) => handle_message(&mut manager, message, &done_tx).await,
      },
      Some(done) = done_rx.recv() => {
        let outcome = manager.finish_install(done.generation, done.precached);
        let _ = done.reply.send(outcome);
      }
      else => break,
    }

    if stopping && !manager.is_installing() {
      break;
    }
  }

  debug!("cache worker stopped");
}

async fn handle_message<S, N>(
  manager: &mut CacheManager<S, N>,
  message: WorkerMessage,
  done_tx: &mpsc::UnboundedSender<InstallDone>,
) where
  S: CacheStorage,
  N: Network + 'static,
{
  // A dropped reply receiver only means the caller stopped waiting
  match message {
    WorkerMessage::Install { version, reply } => match manager.begin_install(&version) {
      Ok(InstallStart::Started(generation)) => {
        let job = manager.precache_job();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
          let precached = job.run().await;
          let _ = done_tx.send(InstallDone {
            generation,
            precached,
            reply,
          });
        });
      }
      Ok(InstallStart::Done(outcome)) => {
        let _ = reply.send(Ok(outcome));
      }
      Err(e) => {
        let _ = reply.send(Err(e));
      }
    },
    WorkerMessage::Fetch { request, reply } => {
      let _ = reply.send(manager.handle_fetch(request).await);
    }
    WorkerMessage::Control(ControlCommand::SkipWaiting) => {
      if let Err(e) = manager.skip_waiting() {
        warn!(error = %e, "activation failed");
      }
    }
    WorkerMessage::OpenClient { url, reply } => {
      let _ = reply.send(manager.open_client(url));
    }
    WorkerMessage::CloseClient(id) => {
      manager.close_client(id);
    }
    WorkerMessage::NotificationClick { reply } => {
      let _ = reply.send(manager.notification_click());
    }
    WorkerMessage::Status { reply } => {
      let _ = reply.send(manager.status());
    }
    WorkerMessage::Shutdown => {}
  }
}

/// Foreground handle to the running worker.
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerMessage>,
  controller: watch::Receiver<Option<String>>,
  task: JoinHandle<()>,
}

impl WorkerHandle {
  fn send(&self, message: WorkerMessage) -> Result<(), CacheError> {
    self.tx.send(message).map_err(|_| CacheError::WorkerGone)
  }

  async fn call<T>(
    &self,
    message: WorkerMessage,
    rx: oneshot::Receiver<T>,
  ) -> Result<T, CacheError> {
    self.send(message)?;
    rx.await.map_err(|_| CacheError::WorkerGone)
  }

  pub async fn install(&self, version: &str) -> Result<InstallOutcome, CacheError> {
    let (reply, rx) = oneshot::channel();
    let version = version.to_string();
    self.call(WorkerMessage::Install { version, reply }, rx).await?
  }

  pub async fn fetch(&self, request: Request) -> Result<Served, CacheError> {
    let (reply, rx) = oneshot::channel();
    self.call(WorkerMessage::Fetch { request, reply }, rx).await?
  }

  pub async fn open_client(&self, url: Url) -> Result<ClientId, CacheError> {
    let (reply, rx) = oneshot::channel();
    self.call(WorkerMessage::OpenClient { url, reply }, rx).await
  }

  pub fn close_client(&self, id: ClientId) -> Result<(), CacheError> {
    self.send(WorkerMessage::CloseClient(id))
  }

  pub async fn notification_click(&self) -> Result<ClientAction, CacheError> {
    let (reply, rx) = oneshot::channel();
    self.call(WorkerMessage::NotificationClick { reply }, rx).await
  }

  pub async fn status(&self) -> Result<CacheStatus, CacheError> {
    let (reply, rx) = oneshot::channel();
    self.call(WorkerMessage::Status { reply }, rx).await?
  }

  /// Foreground side of the update protocol.
  pub fn update_channel(&self) -> UpdateChannel {
    UpdateChannel {
      tx: self.tx.clone(),
      controller: self.controller.clone(),
    }
  }

  /// Finish the messages already queued and any install in flight, then
  /// stop the worker.
  pub async fn shutdown(self) -> Result<(), CacheError> {
    self.send(WorkerMessage::Shutdown)?;
    self.task.await.map_err(|_| CacheError::WorkerGone)
  }
}

/// Lets a page ask for the waiting generation and notice the switch.
#[derive(Clone)]
pub struct UpdateChannel {
  tx: mpsc::UnboundedSender<WorkerMessage>,
  controller: watch::Receiver<Option<String>>,
}

impl UpdateChannel {
  /// Send `SkipWaiting`. No reply; completion shows up as a controller change.
  pub fn request_activation(&self) -> Result<(), CacheError> {
    self
      .tx
      .send(WorkerMessage::Control(ControlCommand::SkipWaiting))
      .map_err(|_| CacheError::WorkerGone)
  }

  pub fn controller_changes(&self) -> watch::Receiver<Option<String>> {
    self.controller.clone()
  }

  /// Reloader for a page loaded under the current controller.
  pub fn reloader(&self) -> PageReloader {
    PageReloader::new(self.controller_changes())
  }
}

/// Directive to reload the page under a new controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reload {
  pub version: String,
}

/// Turns controller changes into at most one reload per page load.
pub struct PageReloader {
  changes: watch::Receiver<Option<String>>,
  reloaded: bool,
}

impl PageReloader {
  pub fn new(mut changes: watch::Receiver<Option<String>>) -> Self {
    // The controller at load time is not a change
    changes.borrow_and_update();
    Self {
      changes,
      reloaded: false,
    }
  }

  /// Wait for the next controller change. Returns `None` once a reload has
  /// already been issued or the worker is gone.
  pub async fn next_reload(&mut self) -> Option<Reload> {
    if self.reloaded {
      return None;
    }

    loop {
      self.changes.changed().await.ok()?;
      if let Some(version) = self.changes.borrow_and_update().clone() {
        self.reloaded = true;
        return Some(Reload { version });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::manager::CacheSettings;
  use crate::cache::storage::MemoryCacheStorage;
  use crate::cache::testing::{ok, url, FakeNetwork};
  use crate::cache::CacheSource;
  use std::sync::Arc;
  use std::time::Duration;
  use tokio::time::timeout;

  const ASSETS: [&str; 3] = ["/", "/index.html", "/app.js"];

  fn serve_assets(network: &FakeNetwork, tag: &str) {
    for path in ASSETS {
      network.route(ok(path, &format!("{} {}", path, tag)));
    }
  }

  fn spawn_worker(network: &Arc<FakeNetwork>) -> WorkerHandle {
    let settings = CacheSettings {
      prefix: "moodlog".to_string(),
      manifest: ASSETS.iter().map(|p| url(p)).collect(),
      app_shell: url("/index.html"),
      start_url: url("/"),
    };
    CacheWorker::spawn(CacheManager::new(
      MemoryCacheStorage::new(),
      network.clone(),
      settings,
    ))
  }

  #[tokio::test]
  async fn test_skip_waiting_handshake_reloads_once() {
    let network = FakeNetwork::new();
    serve_assets(&network, "v1");
    let worker = spawn_worker(&network);
    assert_eq!(worker.install("v1").await.unwrap(), InstallOutcome::Activated);

    let channel = worker.update_channel();
    let mut reloader = channel.reloader();

    serve_assets(&network, "v2");
    assert_eq!(worker.install("v2").await.unwrap(), InstallOutcome::Waiting);
    let status = worker.status().await.unwrap();
    assert_eq!(status.active.as_deref(), Some("v1"));
    assert_eq!(status.waiting.as_deref(), Some("v2"));

    channel.request_activation().unwrap();
    let reload = timeout(Duration::from_secs(5), reloader.next_reload())
      .await
      .unwrap();
    assert_eq!(
      reload,
      Some(Reload {
        version: "v2".to_string()
      })
    );

    let status = worker.status().await.unwrap();
    assert_eq!(status.active.as_deref(), Some("v2"));
    assert_eq!(status.waiting, None);
    assert_eq!(status.caches.len(), 1);

    // A second cutover must not trigger another reload of the same page
    worker.install("v3").await.unwrap();
    channel.request_activation().unwrap();
    worker.status().await.unwrap();
    assert_eq!(reloader.next_reload().await, None);

    worker.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_fetch_and_clients_through_worker() {
    let network = FakeNetwork::new();
    serve_assets(&network, "v1");
    let worker = spawn_worker(&network);
    worker.install("v1").await.unwrap();

    network.set_offline(true);
    let served = worker.fetch(Request::navigate(url("/today"))).await.unwrap();
    assert_eq!(served.source, CacheSource::AppShell);

    let page = worker.open_client(url("/history")).await.unwrap();
    assert_eq!(
      worker.notification_click().await.unwrap(),
      ClientAction::Focused(page)
    );
    worker.close_client(page).unwrap();
    assert!(matches!(
      worker.notification_click().await.unwrap(),
      ClientAction::Opened(_)
    ));
    assert_eq!(worker.status().await.unwrap().clients, 1);

    worker.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_cached_fetch_answers_while_install_stalls() {
    let network = FakeNetwork::new();
    serve_assets(&network, "v1");
    let worker = spawn_worker(&network);
    worker.install("v1").await.unwrap();

    serve_assets(&network, "v2");
    network.stall(url("/app.js"));
    let (reply, installed) = oneshot::channel();
    worker
      .send(WorkerMessage::Install {
        version: "v2".to_string(),
        reply,
      })
      .unwrap();

    let served = timeout(
      Duration::from_secs(2),
      worker.fetch(Request::get(url("/index.html"))),
    )
    .await
    .expect("fetch waited on the install")
    .unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"/index.html v1".to_vec());

    assert_eq!(
      worker.install("v2").await.unwrap(),
      InstallOutcome::AlreadyInstalling
    );
    let status = worker.status().await.unwrap();
    assert_eq!(status.active.as_deref(), Some("v1"));
    assert_eq!(status.waiting, None);

    network.release();
    let outcome = timeout(Duration::from_secs(5), installed)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(outcome.unwrap(), InstallOutcome::Waiting);
    assert_eq!(
      worker.status().await.unwrap().waiting.as_deref(),
      Some("v2")
    );

    worker.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_shutdown_waits_for_install_in_flight() {
    let network = FakeNetwork::new();
    serve_assets(&network, "v1");
    network.stall(url("/"));
    let worker = spawn_worker(&network);

    let (reply, installed) = oneshot::channel();
    worker
      .send(WorkerMessage::Install {
        version: "v1".to_string(),
        reply,
      })
      .unwrap();
    let stopped = tokio::spawn(worker.shutdown());

    network.release();
    timeout(Duration::from_secs(5), stopped)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(installed.await.unwrap().unwrap(), InstallOutcome::Activated);
  }

  #[tokio::test]
  async fn test_requests_after_shutdown_fail() {
    let network = FakeNetwork::new();
    let worker = spawn_worker(&network);
    let channel = worker.update_channel();
    worker.shutdown().await.unwrap();

    assert!(matches!(
      channel.request_activation(),
      Err(CacheError::WorkerGone)
    ));
  }
}
