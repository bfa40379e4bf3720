//! Connectivity state machine for the sync coordinator.
//!
//! Pure transitions only; the coordinator performs the side effects the
//! returned [`Action`] asks for.

use crate::connectivity::Connectivity;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Offline,
  OnlineIdle,
  /// A pass is in flight.
  Syncing {
    /// Connectivity as last reported during the pass
    online: bool,
    /// Connectivity was regained during the pass; run one more afterwards
    follow_up: bool,
  },
}

/// What the coordinator must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  None,
  StartPass,
}

#[derive(Debug)]
pub struct SyncMachine {
  state: SyncState,
}

impl Default for SyncMachine {
  fn default() -> Self {
    Self::new()
  }
}

impl SyncMachine {
  /// Starts offline; the first `Online` report triggers a pass.
  pub fn new() -> Self {
    Self {
      state: SyncState::Offline,
    }
  }

  pub fn state(&self) -> SyncState {
    self.state
  }

  pub fn is_syncing(&self) -> bool {
    matches!(self.state, SyncState::Syncing { .. })
  }

  /// Apply a connectivity report.
  ///
  /// At most one pass is ever in flight: regaining connectivity while a
  /// pass runs only schedules a single follow-up.
  pub fn on_connectivity(&mut self, connectivity: Connectivity) -> Action {
    use Connectivity::{Offline, Online};

    match (self.state, connectivity) {
      (SyncState::Offline, Online) => {
        self.state = SyncState::OnlineIdle;
        Action::StartPass
      }
      (SyncState::OnlineIdle, Offline) => {
        self.state = SyncState::Offline;
        Action::None
      }
      (
        SyncState::Syncing {
          online: true,
          follow_up,
        },
        Offline,
      ) => {
        self.state = SyncState::Syncing {
          online: false,
          follow_up,
        };
        Action::None
      }
      (SyncState::Syncing { online: false, .. }, Online) => {
        self.state = SyncState::Syncing {
          online: true,
          follow_up: true,
        };
        Action::None
      }
      // Duplicate reports
      (SyncState::Offline, Offline)
      | (SyncState::OnlineIdle, Online)
      | (SyncState::Syncing { online: true, .. }, Online)
      | (SyncState::Syncing { online: false, .. }, Offline) => Action::None,
    }
  }

  /// The coordinator started the pass requested by `StartPass`.
  pub fn begin_pass(&mut self) {
    if let SyncState::OnlineIdle = self.state {
      self.state = SyncState::Syncing {
        online: true,
        follow_up: false,
      };
    }
  }

  /// The in-flight pass ended, successfully or not.
  pub fn finish_pass(&mut self) -> Action {
    match self.state {
      SyncState::Syncing { online: false, .. } => {
        self.state = SyncState::Offline;
        Action::None
      }
      SyncState::Syncing {
        online: true,
        follow_up: true,
      } => {
        self.state = SyncState::OnlineIdle;
        Action::StartPass
      }
      SyncState::Syncing {
        online: true,
        follow_up: false,
      } => {
        self.state = SyncState::OnlineIdle;
        Action::None
      }
      SyncState::Offline | SyncState::OnlineIdle => Action::None,
    }
  }
}
