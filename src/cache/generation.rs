use std::fmt;
use std::str::FromStr;

/// Lifecycle of one cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Installing,
  /// Installed, waiting for the foreground to request cutover
  Waiting,
  /// Serving fetches
  Active,
  /// Superseded or failed; never serves again
  Redundant,
}

impl GenerationState {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }
}

impl fmt::Display for GenerationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for GenerationState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "active" => Ok(Self::Active),
      "redundant" => Ok(Self::Redundant),
      other => Err(format!("unknown generation state '{}'", other)),
    }
  }
}

/// A versioned asset set. The version tag doubles as its cache name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: String,
  pub state: GenerationState,
}

impl Generation {
  pub fn installing(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
      state: GenerationState::Installing,
    }
  }

  pub fn with_state(&self, state: GenerationState) -> Self {
    Self {
      version: self.version.clone(),
      state,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_state_names_round_trip() {
    for state in [
      GenerationState::Installing,
      GenerationState::Waiting,
      GenerationState::Active,
      GenerationState::Redundant,
    ] {
      assert_eq!(state.as_str().parse::<GenerationState>(), Ok(state));
    }
    assert!("paused".parse::<GenerationState>().is_err());
  }
}
