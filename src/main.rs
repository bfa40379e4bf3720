use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Report, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use moodlog::cache::{
  CacheManager, CacheSettings, CacheWorker, HttpNetwork, Request, SqliteCacheStorage,
  WorkerHandle,
};
use moodlog::clock::SystemClock;
use moodlog::config::{Config, RemoteConfig};
use moodlog::connectivity::ConnectivityProbe;
use moodlog::entry::{format_date, parse_date};
use moodlog::remote::HttpSubmitter;
use moodlog::store::{Journal, SqliteStore};
use moodlog::sync::{SyncCoordinator, SyncStatus};
use moodlog::{logging, Entry, Mood, StoreError};

#[derive(Parser, Debug)]
#[command(name = "moodlog")]
#[command(about = "An offline-first mood journal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/moodlog/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Record the mood for a day (1 = awful, 5 = great)
  Save {
    mood: i64,
    #[arg(short, long, default_value = "")]
    note: String,
    /// Day as YYYY-MM-DD (default: today)
    #[arg(short, long)]
    date: Option<String>,
  },
  /// Show the entry for a day (default: today)
  Show { date: Option<String> },
  /// List entries, most recent first
  History {
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// List the entries of one month
  Month { year: i32, month: u32 },
  /// Delete the entry for a day
  Delete { date: String },
  /// Push unsynced entries to the remote once
  Sync {
    /// Also retry entries that were parked after repeated failures
    #[arg(long)]
    retry_parked: bool,
  },
  /// Watch connectivity and sync whenever the remote becomes reachable
  Watch,
  /// Manage the offline asset cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Precache the asset manifest as a new generation
  Install {
    /// Version tag (default: from config)
    version: Option<String>,
  },
  /// Fetch a path through the cache
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Activate the waiting generation
  Activate,
  /// Show cache generations and contents
  Status,
  /// Route a notification click to a page
  Click,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?)?;

  match args.command {
    Command::Save { mood, note, date } => {
      let journal = open_journal(&config)?;
      let entry = journal
        .save(day(date.as_deref())?, Mood::new(mood)?, &note)
        .await
        .map_err(with_retry_hint)?;
      print_entry(&entry);
    }
    Command::Show { date } => {
      let journal = open_journal(&config)?;
      let date = day(date.as_deref())?;
      match journal.get(date).await? {
        Some(entry) => print_entry(&entry),
        None => println!("{}: no entry", format_date(date)),
      }
    }
    Command::History { limit } => {
      let journal = open_journal(&config)?;
      let entries = journal.history().await?;
      for entry in entries.iter().take(limit.unwrap_or(usize::MAX)) {
        print_entry(entry);
      }
    }
    Command::Month { year, month } => {
      let journal = open_journal(&config)?;
      for entry in journal.month(year, month).await? {
        print_entry(&entry);
      }
    }
    Command::Delete { date } => {
      let journal = open_journal(&config)?;
      journal
        .delete(parse_date(&date)?)
        .await
        .map_err(with_retry_hint)?;
    }
    Command::Sync { retry_parked } => sync_once(&config, retry_parked).await?,
    Command::Watch => watch(&config).await?,
    Command::Cache { command } => cache(&config, command).await?,
  }

  Ok(())
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
  Ok(Arc::new(SqliteStore::open(&config.entries_db_path()?)?))
}

fn open_journal(config: &Config) -> Result<Journal<SqliteStore>> {
  Ok(Journal::new(open_store(config)?, Arc::new(SystemClock)))
}

/// Failed writes leave the journal untouched, so say the command can be rerun.
fn with_retry_hint(e: StoreError) -> Report {
  if e.is_retryable() {
    eyre!("{}; nothing was changed, run the command again", e)
  } else {
    e.into()
  }
}

fn day(date: Option<&str>) -> Result<chrono::NaiveDate> {
  match date {
    Some(s) => Ok(parse_date(s)?),
    None => Ok(chrono::Local::now().date_naive()),
  }
}

fn print_entry(entry: &Entry) {
  let marker = if entry.synced { " " } else { "*" };
  if entry.note.is_empty() {
    println!("{}{} {}", marker, entry.key(), entry.mood);
  } else {
    println!("{}{} {}  {}", marker, entry.key(), entry.mood, entry.note);
  }
}

fn remote(config: &Config) -> Result<&RemoteConfig> {
  config
    .remote
    .as_ref()
    .ok_or_else(|| eyre!("No remote configured; add a `remote:` section to the config file"))
}

fn coordinator(config: &Config) -> Result<SyncCoordinator<SqliteStore, HttpSubmitter>> {
  let submitter = HttpSubmitter::new(remote(config)?)?;
  Ok(SyncCoordinator::new(
    open_store(config)?,
    submitter,
    config.sync.retry_policy(),
  ))
}

async fn sync_once(config: &Config, retry_parked: bool) -> Result<()> {
  let coordinator = coordinator(config)?;
  if retry_parked {
    let count = coordinator.retry_parked().await?;
    println!("unparked {} entries", count);
  }

  let report = coordinator.run_pass().await?;
  println!(
    "synced {}, failed {}, parked {}, skipped {} parked",
    report.synced, report.failed, report.parked, report.skipped_parked
  );
  if report.superseded > 0 {
    println!("{} entries changed while syncing; they will go next time", report.superseded);
  }
  if report.interrupted() {
    println!("remote became unreachable; {} entries left for later", report.not_attempted);
  }
  Ok(())
}

async fn watch(config: &Config) -> Result<()> {
  let remote = remote(config)?;
  let probe = ConnectivityProbe::new(
    remote.health_url().clone(),
    config.sync.probe_interval(),
    remote.connect_timeout(),
  )?;
  let handle = coordinator(config)?.spawn();
  let mut reports = probe.spawn();
  let mut status = handle.status();

  info!(url = %remote.health_url(), "watching connectivity");
  println!("watching {} (Ctrl-C to stop)", remote.health_url());

  loop {
    tokio::select! {
      report = reports.recv() => {
        let Some(connectivity) = report else { break };
        handle.notify(connectivity)?;
      }
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        match &*status.borrow_and_update() {
          SyncStatus::Offline => println!("offline"),
          SyncStatus::UpToDate => println!("up to date"),
          SyncStatus::Syncing { remaining } => println!("syncing, {} left", remaining),
          SyncStatus::Synced(report) => println!(
            "pass {}: synced {}, failed {}",
            report.pass, report.synced, report.failed
          ),
          SyncStatus::Failed(reason) => println!("sync failed: {}", reason),
        }
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  handle.shutdown().await?;
  Ok(())
}

fn spawn_cache_worker(config: &Config) -> Result<WorkerHandle> {
  let timeout = config
    .remote
    .as_ref()
    .map(RemoteConfig::connect_timeout)
    .unwrap_or(Duration::from_secs(10));

  let storage = SqliteCacheStorage::open(&config.cache_db_path()?)?;
  let network = HttpNetwork::new(&config.cache.origin, timeout)?;
  let mut manager = CacheManager::new(storage, network, CacheSettings::from_config(&config.cache)?);
  manager.restore()?;
  Ok(CacheWorker::spawn(manager))
}

async fn cache(config: &Config, command: CacheCommand) -> Result<()> {
  let worker = spawn_cache_worker(config)?;

  match command {
    CacheCommand::Install { version } => {
      let version = version.unwrap_or_else(|| config.cache.version.clone());
      let outcome = worker.install(&version).await?;
      println!("{}: {:?}", version, outcome);
    }
    CacheCommand::Fetch { path, navigate } => {
      let url = config
        .cache
        .origin
        .join(&path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let served = worker.fetch(request).await?;
      println!(
        "{} {} ({:?}, {} bytes)",
        served.response.status,
        served.response.url,
        served.source,
        served.response.body.len()
      );
    }
    CacheCommand::Activate => {
      if worker.status().await?.waiting.is_none() {
        println!("nothing waiting");
      } else {
        worker.update_channel().request_activation()?;
        // Messages are handled in order, so this status follows the cutover
        let status = worker.status().await?;
        println!("active: {}", status.active.as_deref().unwrap_or("-"));
      }
    }
    CacheCommand::Status => {
      let status = worker.status().await?;
      println!("config:  {}", config.cache.cache_name());
      println!("active:  {}", status.active.as_deref().unwrap_or("-"));
      println!("waiting: {}", status.waiting.as_deref().unwrap_or("-"));
      for (name, count) in status.caches {
        println!("  {} ({} entries)", name, count);
      }
    }
    CacheCommand::Click => {
      let action = worker.notification_click().await?;
      println!("{:?}", action);
    }
  }

  worker.shutdown().await?;
  Ok(())
}
