use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Directory holding the databases and logs (defaults to $XDG_DATA_HOME/moodlog)
  pub data_dir: Option<PathBuf>,
  /// Remote sync endpoint; sync is disabled without it
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Entries are POSTed here one at a time
  pub endpoint: Url,
  /// Probed to detect connectivity (defaults to the endpoint)
  pub health_url: Option<Url>,
  #[serde(default = "default_connect_timeout_secs")]
  pub connect_timeout_secs: u64,
}

impl RemoteConfig {
  pub fn health_url(&self) -> &Url {
    self.health_url.as_ref().unwrap_or(&self.endpoint)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }
}

fn default_connect_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Submission attempts per entry within one pass
  pub attempts_per_pass: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// Failed passes before an entry is parked (0 = never)
  pub park_after: u32,
  /// How often `watch` probes connectivity
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      attempts_per_pass: 3,
      base_delay_ms: 500,
      max_delay_ms: 8_000,
      park_after: 10,
      probe_interval_secs: 15,
    }
  }
}

impl SyncConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      attempts_per_pass: self.attempts_per_pass.max(1),
      base_delay: Duration::from_millis(self.base_delay_ms),
      max_delay: Duration::from_millis(self.max_delay_ms),
      park_after: self.park_after,
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Origin the app is served from; only same-origin responses are cached
  pub origin: Url,
  /// Version tag of the current deploy. Bump it to replace cached assets.
  pub version: String,
  pub prefix: String,
  /// Document served for navigations while offline
  pub app_shell: String,
  /// Page opened when a notification is clicked and no client is open
  pub start_url: String,
  /// Paths precached on install, resolved against `origin`
  pub manifest: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:8080/").expect("static url is valid"),
      version: "v1".to_string(),
      prefix: "moodlog".to_string(),
      app_shell: "/index.html".to_string(),
      start_url: "/".to_string(),
      manifest: ["/", "/index.html", "/manifest.json", "/app.js", "/styles.css"]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }
}

impl CacheConfig {
  /// Name of the cache object for the configured version.
  pub fn cache_name(&self) -> String {
    format!("{}-{}", self.prefix, self.version)
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid cache path '{}': {}", path, e))
  }

  pub fn app_shell_url(&self) -> Result<Url> {
    self.resolve(&self.app_shell)
  }

  pub fn start_url(&self) -> Result<Url> {
    self.resolve(&self.start_url)
  }

  /// Manifest entries as absolute URLs. Cross-origin entries are refused.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self
      .manifest
      .iter()
      .map(|path| {
        let url = self.resolve(path)?;
        if url.origin() != self.origin.origin() {
          return Err(eyre!("Manifest entry '{}' is not same-origin", path));
        }
        Ok(url)
      })
      .collect()
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./moodlog.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/moodlog/config.yaml
  ///
  /// Without a config file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("moodlog.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("moodlog").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.cache.manifest_urls()?;
    Ok(config)
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("moodlog"))
  }

  pub fn entries_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("entries.db"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }

  /// Bearer token for the remote, from MOODLOG_REMOTE_TOKEN.
  pub fn remote_token() -> Option<String> {
    std::env::var("MOODLOG_REMOTE_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
