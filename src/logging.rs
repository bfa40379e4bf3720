//! Log setup for the binary.
//!
//! Logs go to a daily rolling file under `<data_dir>/logs` so stdout stays
//! clean for command output. The filter comes from `MOODLOG_LOG`.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "MOODLOG_LOG";
const LOG_FILE_PREFIX: &str = "moodlog.log";

/// Build the filter from `MOODLOG_LOG`, falling back to `info`.
pub fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init(data_dir: &Path) -> Result<WorkerGuard> {
  let dir = data_dir.join("logs");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&dir, LOG_FILE_PREFIX));
  fmt()
    .with_env_filter(env_filter())
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
