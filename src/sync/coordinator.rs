//! Sync coordinator: pushes unsynced entries through a remote submitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use super::machine::{Action, SyncMachine, SyncState};
use super::retry::RetryPolicy;
use crate::connectivity::Connectivity;
use crate::entry::Entry;
use crate::error::{SubmitError, SyncError};
use crate::remote::RemoteSubmitter;
use crate::store::EntryStore;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Sequence number of the pass, starting at 1
  pub pass: u64,
  /// Entries submitted (at least one attempt)
  pub attempted: usize,
  pub synced: usize,
  pub failed: usize,
  /// Entries parked by this pass
  pub parked: usize,
  /// Parked entries left out of the pass
  pub skipped_parked: usize,
  /// Entries edited while their submission was in flight; they stay unsynced
  pub superseded: usize,
  /// Entries not attempted because the remote became unreachable
  pub not_attempted: usize,
}

impl SyncReport {
  pub fn interrupted(&self) -> bool {
    self.not_attempted > 0
  }
}

/// Externally observable sync status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
  Offline,
  /// Online with nothing left to push
  UpToDate,
  Syncing { remaining: usize },
  /// Last pass finished with this report
  Synced(SyncReport),
  /// Last pass aborted on a storage error
  Failed(String),
}

/// Drives sync passes against a store and a remote submitter.
pub struct SyncCoordinator<S: EntryStore, R: RemoteSubmitter> {
  store: Arc<S>,
  submitter: R,
  policy: RetryPolicy,
  status: watch::Sender<SyncStatus>,
  passes: AtomicU64,
}

impl<S, R> SyncCoordinator<S, R>
where
  S: EntryStore + 'static,
  R: RemoteSubmitter + 'static,
{
  pub fn new(store: Arc<S>, submitter: R, policy: RetryPolicy) -> Self {
    let (status, _) = watch::channel(SyncStatus::Offline);
    Self {
      store,
      submitter,
      policy,
      status,
      passes: AtomicU64::new(0),
    }
  }

  pub fn status(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  /// Number of passes started so far.
  pub fn passes_run(&self) -> u64 {
    self.passes.load(Ordering::SeqCst)
  }

  /// Give parked entries another chance on the next pass.
  pub async fn retry_parked(&self) -> Result<usize, SyncError> {
    let count = self.store.unpark_all().await?;
    info!(count, "unparked entries");
    Ok(count)
  }

  /// Run one pass over the unsynced entries, in ascending date order.
  ///
  /// Each confirmed submission is persisted before the next entry is sent,
  /// so an interrupted pass leaves every entry either confirmed or still
  /// unsynced. Rejected entries do not stop the queue; an unreachable remote
  /// does.
  ///
  /// When the remote becomes unreachable at entry k, entry k and everything
  /// after it stay unsynced, so the next pass resumes exactly there.
  pub async fn run_pass(&self) -> Result<SyncReport, SyncError> {
    let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
    let mut report = SyncReport {
      pass,
      ..SyncReport::default()
    };

    let pending = self.store.unsynced().await?;
    let (parked, queue): (Vec<_>, Vec<_>) = pending.into_iter().partition(|p| p.parked);
    report.skipped_parked = parked.len();

    if queue.is_empty() {
      debug!(pass, skipped_parked = report.skipped_parked, "nothing to sync");
      self.status.send_replace(SyncStatus::UpToDate);
      return Ok(report);
    }

    info!(pass, count = queue.len(), "sync pass started");

    for (index, pending) in queue.iter().enumerate() {
      let remaining = queue.len() - index;
      self.status.send_replace(SyncStatus::Syncing { remaining });
      let entry = &pending.entry;
      report.attempted += 1;

      match self.submit_with_retry(entry).await {
        Ok(()) => {
          if self.store.mark_synced(entry.date, entry.timestamp).await? {
            report.synced += 1;
            debug!(date = %entry.key(), "entry synced");
          } else {
            report.superseded += 1;
            debug!(date = %entry.key(), "entry changed during submission");
          }
        }
        Err(SubmitError::Unreachable(reason)) => {
          report.failed += 1;
          report.not_attempted = remaining - 1;
          warn!(
            date = %entry.key(),
            reason = %reason,
            not_attempted = report.not_attempted,
            "remote unreachable, ending pass"
          );
          break;
        }
        Err(e) => {
          report.failed += 1;
          let failure = self
            .store
            .record_sync_failure(entry.date, &e.to_string(), self.policy.park_after)
            .await?;
          if failure.parked {
            report.parked += 1;
          }
          let err = SyncError::RemoteSubmitFailed {
            date: entry.key(),
            source: e,
          };
          warn!(
            error = %err,
            failures = failure.failures,
            parked = failure.parked,
            "submission failed"
          );
        }
      }
    }

    info!(
      pass,
      synced = report.synced,
      failed = report.failed,
      parked = report.parked,
      "sync pass finished"
    );
    self.status.send_replace(SyncStatus::Synced(report.clone()));
    Ok(report)
  }

  async fn submit_with_retry(&self, entry: &Entry) -> Result<(), SubmitError> {
    let mut attempt = 1;
    loop {
      match self.submitter.submit(entry).await {
        Ok(()) => return Ok(()),
        Err(e @ SubmitError::Unreachable(_)) => return Err(e),
        Err(e) if attempt >= self.policy.attempts_per_pass => return Err(e),
        Err(e) => {
          let delay = self.policy.backoff(attempt);
          debug!(date = %entry.key(), attempt, ?delay, error = %e, "retrying submission");
          if !delay.is_zero() {
            tokio::time::sleep(delay).await;
          }
          attempt += 1;
        }
      }
    }
  }

  /// Run the coordinator as a task fed with connectivity reports.
  pub fn spawn(self) -> SyncHandle<S, R> {
    let coordinator = Arc::new(self);
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SyncState::Offline);

    let task = tokio::spawn(run_loop(Arc::clone(&coordinator), rx, state_tx));

    SyncHandle {
      tx,
      state: state_rx,
      coordinator,
      task,
    }
  }
}

type PassHandle = JoinHandle<Result<SyncReport, SyncError>>;

async fn run_loop<S, R>(
  coordinator: Arc<SyncCoordinator<S, R>>,
  mut events: mpsc::UnboundedReceiver<Connectivity>,
  state: watch::Sender<SyncState>,
) where
  S: EntryStore + 'static,
  R: RemoteSubmitter + 'static,
{
  let mut machine = SyncMachine::new();
  let mut in_flight: Option<PassHandle> = None;
  let mut closed = false;

  loop {
    if closed && in_flight.is_none() {
      break;
    }

    tokio::select! {
      event = events.recv(), if !closed => {
        let Some(connectivity) = event else {
          closed = true;
          continue;
        };
        debug!(?connectivity, state = ?machine.state(), "connectivity report");
        if machine.on_connectivity(connectivity) == Action::StartPass {
          machine.begin_pass();
          in_flight = Some(start_pass(&coordinator));
        } else if connectivity == Connectivity::Offline {
          coordinator.status.send_replace(SyncStatus::Offline);
        }
      }
      joined = wait_for_pass(&mut in_flight) => {
        in_flight = None;
        match joined {
          Ok(Ok(_)) => {}
          Ok(Err(e)) => {
            warn!(error = %e, "sync pass aborted");
            coordinator.status.send_replace(SyncStatus::Failed(e.to_string()));
          }
          Err(e) => warn!(error = %e, "sync pass task failed"),
        }
        if machine.finish_pass() == Action::StartPass {
          machine.begin_pass();
          in_flight = Some(start_pass(&coordinator));
        } else if machine.state() == SyncState::Offline {
          coordinator.status.send_replace(SyncStatus::Offline);
        }
      }
    }

    state.send_replace(machine.state());
  }

  debug!("sync coordinator stopped");
}

fn start_pass<S, R>(coordinator: &Arc<SyncCoordinator<S, R>>) -> PassHandle
where
  S: EntryStore + 'static,
  R: RemoteSubmitter + 'static,
{
  let coordinator = Arc::clone(coordinator);
  tokio::spawn(async move { coordinator.run_pass().await })
}

async fn wait_for_pass(
  in_flight: &mut Option<PassHandle>,
) -> Result<Result<SyncReport, SyncError>, JoinError> {
  match in_flight {
    Some(handle) => handle.await,
    None => std::future::pending().await,
  }
}

/// Handle to a running coordinator task.
pub struct SyncHandle<S: EntryStore, R: RemoteSubmitter> {
  tx: mpsc::UnboundedSender<Connectivity>,
  state: watch::Receiver<SyncState>,
  coordinator: Arc<SyncCoordinator<S, R>>,
  task: JoinHandle<()>,
}

impl<S, R> SyncHandle<S, R>
where
  S: EntryStore + 'static,
  R: RemoteSubmitter + 'static,
{
  /// Report a connectivity observation.
  pub fn notify(&self, connectivity: Connectivity) -> Result<(), SyncError> {
    self
      .tx
      .send(connectivity)
      .map_err(|_| SyncError::CoordinatorGone)
  }

  pub fn status(&self) -> watch::Receiver<SyncStatus> {
    self.coordinator.status()
  }

  pub fn state(&self) -> watch::Receiver<SyncState> {
    self.state.clone()
  }

  pub fn passes_run(&self) -> u64 {
    self.coordinator.passes_run()
  }

  /// Stop accepting reports, let an in-flight pass finish, then stop.
  pub async fn shutdown(self) -> Result<(), SyncError> {
    drop(self.tx);
    self.task.await.map_err(|_| SyncError::CoordinatorGone)
  }
}
