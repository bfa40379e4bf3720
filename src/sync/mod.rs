//! Reconciliation of locally written entries with the remote service.
//!
//! Sync is driven by connectivity transitions, never by user actions:
//! - regaining connectivity starts a pass over every unsynced entry
//! - entries are pushed one at a time and confirmed individually
//! - at most one pass runs at a time; flaps coalesce into one follow-up

mod coordinator;
mod machine;
mod retry;

pub use coordinator::{SyncCoordinator, SyncHandle, SyncReport, SyncStatus};
pub use machine::{Action, SyncMachine, SyncState};
pub use retry::RetryPolicy;

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use chrono::NaiveDate;
  use std::collections::HashMap;
  use std::sync::{Arc, Mutex};
  use std::time::Duration;
  use tokio::sync::{Notify, Semaphore};

  use crate::connectivity::Connectivity;
  use crate::entry::{parse_date, Entry, Mood};
  use crate::error::SubmitError;
  use crate::remote::RemoteSubmitter;
  use crate::store::{EntryStore, MemoryStore};

  /// Submitter whose answer per date is scripted in advance. Unscripted
  /// dates succeed.
  #[derive(Default)]
  struct ScriptedSubmitter {
    script: Mutex<HashMap<NaiveDate, Vec<Result<(), SubmitError>>>>,
    submitted: Mutex<Vec<NaiveDate>>,
  }

  impl ScriptedSubmitter {
    fn fail(self, date: &str, outcomes: Vec<Result<(), SubmitError>>) -> Self {
      self
        .script
        .lock()
        .unwrap()
        .insert(parse_date(date).unwrap(), outcomes);
      self
    }

    fn submitted(&self) -> Vec<String> {
      self
        .submitted
        .lock()
        .unwrap()
        .iter()
        .map(|d| d.to_string())
        .collect()
    }
  }

  #[async_trait]
  impl RemoteSubmitter for Arc<ScriptedSubmitter> {
    async fn submit(&self, entry: &Entry) -> Result<(), SubmitError> {
      self.submitted.lock().unwrap().push(entry.date);
      let mut script = self.script.lock().unwrap();
      match script.get_mut(&entry.date) {
        Some(outcomes) if !outcomes.is_empty() => outcomes.remove(0),
        _ => Ok(()),
      }
    }
  }

  fn rejected() -> Result<(), SubmitError> {
    Err(SubmitError::Rejected("HTTP 500".to_string()))
  }

  fn unreachable() -> Result<(), SubmitError> {
    Err(SubmitError::Unreachable("connection refused".to_string()))
  }

  async fn seeded(dates: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (i, d) in dates.iter().enumerate() {
      let entry = Entry::new(parse_date(d).unwrap(), Mood::new(4).unwrap(), "ok", i as i64);
      store.upsert(&entry).await.unwrap();
    }
    store
  }

  fn synced_flags(entries: &[Entry]) -> Vec<(String, bool)> {
    let mut flags: Vec<(String, bool)> = entries.iter().map(|e| (e.key(), e.synced)).collect();
    flags.sort();
    flags
  }

  #[tokio::test]
  async fn test_pass_converges_all_entries() {
    let store = seeded(&["2024-05-01", "2024-05-15", "2024-05-20"]).await;
    let before = store.get_all().await.unwrap();
    let submitter = Arc::new(ScriptedSubmitter::default());
    let coordinator =
      SyncCoordinator::new(store.clone(), submitter.clone(), RetryPolicy::immediate());

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.synced, 3);
    assert!(!report.interrupted());

    let after = store.get_all().await.unwrap();
    assert!(after.iter().all(|e| e.synced));
    for (old, new) in before.iter().zip(after.iter()) {
      assert_eq!((old.date, old.mood, &old.note), (new.date, new.mood, &new.note));
    }
    assert_eq!(
      submitter.submitted(),
      vec!["2024-05-01", "2024-05-15", "2024-05-20"]
    );
  }

  #[tokio::test]
  async fn test_two_offline_entries_sync_when_connectivity_returns() {
    let store = seeded(&["2024-05-01", "2024-05-15"]).await;
    let submitter = Arc::new(ScriptedSubmitter::default());
    let handle =
      SyncCoordinator::new(store.clone(), submitter, RetryPolicy::immediate()).spawn();
    let mut status = handle.status();

    handle.notify(Connectivity::Online).unwrap();
    status
      .wait_for(|s| matches!(s, SyncStatus::Synced(_)))
      .await
      .unwrap();
    handle.shutdown().await.unwrap();

    assert_eq!(
      synced_flags(&store.get_all().await.unwrap()),
      vec![("2024-05-01".to_string(), true), ("2024-05-15".to_string(), true)]
    );
  }

  #[tokio::test]
  async fn test_unreachable_remote_ends_pass_and_next_pass_resumes() {
    let store = seeded(&["2024-05-01", "2024-05-02", "2024-05-03", "2024-05-04"]).await;
    let submitter = Arc::new(ScriptedSubmitter::default().fail("2024-05-03", vec![unreachable()]));
    let coordinator =
      SyncCoordinator::new(store.clone(), submitter.clone(), RetryPolicy::immediate());

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.not_attempted, 1);
    assert_eq!(
      synced_flags(&store.get_all().await.unwrap()),
      vec![
        ("2024-05-01".to_string(), true),
        ("2024-05-02".to_string(), true),
        ("2024-05-03".to_string(), false),
        ("2024-05-04".to_string(), false),
      ]
    );

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.pass, 2);
    assert_eq!(report.synced, 2);
    assert!(store.get_all().await.unwrap().iter().all(|e| e.synced));
    // Confirmed entries are not resubmitted
    assert_eq!(
      submitter.submitted(),
      vec!["2024-05-01", "2024-05-02", "2024-05-03", "2024-05-03", "2024-05-04"]
    );
  }

  #[tokio::test]
  async fn test_rejected_entry_does_not_abort_queue() {
    let store = seeded(&["2024-05-01", "2024-05-02", "2024-05-03"]).await;
    let submitter = Arc::new(ScriptedSubmitter::default().fail("2024-05-02", vec![rejected()]));
    let coordinator = SyncCoordinator::new(store.clone(), submitter, RetryPolicy::immediate());

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.not_attempted, 0);

    let pending = store.unsynced().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entry.key(), "2024-05-02");
    assert_eq!(pending[0].failures, 1);
  }

  #[tokio::test]
  async fn test_rejection_is_retried_within_pass() {
    let store = seeded(&["2024-05-01"]).await;
    let submitter =
      Arc::new(ScriptedSubmitter::default().fail("2024-05-01", vec![rejected(), rejected()]));
    let policy = RetryPolicy {
      attempts_per_pass: 3,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      park_after: 0,
    };
    let coordinator = SyncCoordinator::new(store.clone(), submitter.clone(), policy);

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(submitter.submitted().len(), 3);
  }

  #[tokio::test]
  async fn test_persistent_rejection_parks_entry() {
    let store = seeded(&["2024-05-01", "2024-05-02"]).await;
    let submitter = Arc::new(
      ScriptedSubmitter::default().fail("2024-05-01", vec![rejected(), rejected()]),
    );
    let policy = RetryPolicy {
      park_after: 2,
      ..RetryPolicy::immediate()
    };
    let coordinator = SyncCoordinator::new(store.clone(), submitter.clone(), policy);

    assert_eq!(coordinator.run_pass().await.unwrap().parked, 0);
    assert_eq!(coordinator.run_pass().await.unwrap().parked, 1);

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(report.skipped_parked, 1);

    assert_eq!(coordinator.retry_parked().await.unwrap(), 1);
    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.synced, 1);
    assert!(store.unsynced().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_edit_during_submission_stays_unsynced() {
    struct EditingSubmitter {
      store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl RemoteSubmitter for EditingSubmitter {
      async fn submit(&self, entry: &Entry) -> Result<(), SubmitError> {
        let edited = Entry::new(entry.date, Mood::new(1).unwrap(), "changed", entry.timestamp + 1);
        self.store.upsert(&edited).await.unwrap();
        Ok(())
      }
    }

    let store = seeded(&["2024-05-01"]).await;
    let coordinator = SyncCoordinator::new(
      store.clone(),
      EditingSubmitter {
        store: store.clone(),
      },
      RetryPolicy::immediate(),
    );

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.superseded, 1);
    let stored = store.get(parse_date("2024-05-01").unwrap()).await.unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(stored.note, "changed");
  }

  /// Holds every submission until released.
  struct GatedSubmitter {
    started: Arc<Notify>,
    gate: Arc<Semaphore>,
  }

  #[async_trait]
  impl RemoteSubmitter for GatedSubmitter {
    async fn submit(&self, _entry: &Entry) -> Result<(), SubmitError> {
      self.started.notify_one();
      let permit = self.gate.acquire().await.unwrap();
      permit.forget();
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_flapping_during_pass_runs_one_follow_up() {
    let store = seeded(&["2024-05-01"]).await;
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let handle = SyncCoordinator::new(
      store.clone(),
      GatedSubmitter {
        started: started.clone(),
        gate: gate.clone(),
      },
      RetryPolicy::immediate(),
    )
    .spawn();
    let mut state = handle.state();

    handle.notify(Connectivity::Online).unwrap();
    started.notified().await;

    for _ in 0..3 {
      handle.notify(Connectivity::Offline).unwrap();
      handle.notify(Connectivity::Online).unwrap();
    }
    state
      .wait_for(|s| {
        *s == SyncState::Syncing {
          online: true,
          follow_up: true,
        }
      })
      .await
      .unwrap();
    assert_eq!(handle.passes_run(), 1);

    gate.add_permits(10);
    state
      .wait_for(|s| *s == SyncState::OnlineIdle)
      .await
      .unwrap();

    // The initial pass plus exactly one follow-up
    assert_eq!(handle.passes_run(), 2);
    assert!(store.unsynced().await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_going_offline_reports_status_without_mutation() {
    let store = seeded(&["2024-05-01"]).await;
    let submitter = Arc::new(ScriptedSubmitter::default());
    let handle =
      SyncCoordinator::new(store.clone(), submitter.clone(), RetryPolicy::immediate()).spawn();
    let mut state = handle.state();

    handle.notify(Connectivity::Offline).unwrap();
    handle.notify(Connectivity::Online).unwrap();
    handle.notify(Connectivity::Offline).unwrap();
    state.wait_for(|s| *s == SyncState::Offline).await.unwrap();
    handle.shutdown().await.unwrap();

    // Whatever happened to the pass, the note and mood are untouched
    let stored = store.get_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].note, "ok");
  }
}
