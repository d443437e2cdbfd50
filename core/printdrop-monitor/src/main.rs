//! printdrop: launcher for the print-capture pipeline.
//!
//! ## Invocations
//!
//! - `printdrop --background-monitor`: claim the monitor role and watch the
//!   capture folders until interrupted. Exits quietly when another monitor
//!   already runs.
//! - `printdrop --pending <FILE>`: interactive entry point. Claims the
//!   pending-handoff lease for FILE and uploads it to the default destination.
//! - `printdrop status`: print the monitor lease and pending handoffs as JSON.
//! - `printdrop clear-pending`: drop every stuck pending handoff.

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use printdrop_core::coordinator::lease::read_lease;
use printdrop_core::shutdown::ShutdownSignal;
use printdrop_core::{
    discard_backup, load_config, startup_delay, BackgroundMonitorService, FormSlot,
    HandoffCollaborators, HttpUploadGateway, MonitorConfig, PendingHandoffStore, SelfRelauncher,
    SessionProvider, StartOutcome, StorageConfig, StoredSession, UploadGateway, UploadRequest,
};
use serde::Serialize;

/// How long a stopping monitor waits for in-flight uploads.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "printdrop")]
#[command(about = "Virtual-printer capture and upload")]
#[command(version)]
struct Cli {
    /// Run as the background monitor
    #[arg(long = "background-monitor", conflicts_with = "pending")]
    background_monitor: bool,

    /// Open the interactive flow for a pending file
    #[arg(long, value_name = "FILE")]
    pending: Option<PathBuf>,

    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the monitor lease and any pending handoff
    Status,

    /// Remove every pending-handoff lease
    ClearPending,
}

fn main() {
    let storage = StorageConfig::default();
    let _logging_guard = logging::init(&storage.logs_dir());
    let cli = Cli::parse();

    let result = match (cli.command, cli.background_monitor, cli.pending) {
        (Some(Commands::Status), _, _) => print_status(&storage),
        (Some(Commands::ClearPending), _, _) => clear_pending(&storage),
        (None, true, _) => {
            let config = config_or_default(cli.config.as_deref(), &storage);
            run_monitor(&storage, &config)
        }
        (None, false, Some(file)) => {
            let config = config_or_default(cli.config.as_deref(), &storage);
            run_pending(&storage, &config, &file)
        }
        (None, false, None) => {
            Err("Nothing to do: pass --background-monitor or --pending <FILE>".to_string())
        }
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "printdrop failed");
        std::process::exit(1);
    }
}

/// A malformed config is logged and replaced by defaults.
fn config_or_default(path: Option<&Path>, storage: &StorageConfig) -> MonitorConfig {
    match load_config(path, storage) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Failed to load config; using defaults");
            MonitorConfig::default()
        }
    }
}

fn uploader(config: &MonitorConfig) -> Result<HttpUploadGateway, String> {
    HttpUploadGateway::new(
        config.upload.endpoint.clone(),
        Duration::from_secs(config.upload.timeout_secs),
    )
    .map_err(String::from)
}

fn run_monitor(storage: &StorageConfig, config: &MonitorConfig) -> Result<(), String> {
    let shutdown = Arc::new(ShutdownSignal::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.trigger())
            .map_err(|err| format!("Failed to install signal handler: {}", err))?;
    }

    let delay = startup_delay(&storage.backoff_file(), &config.monitor.restart_policy());
    if shutdown.wait(delay) {
        tracing::info!("Shutdown requested during start delay");
        return Ok(());
    }

    storage
        .ensure_dirs()
        .map_err(|err| format!("Failed to create storage directories: {}", err))?;

    let collaborators = HandoffCollaborators {
        forms: Arc::new(FormSlot::new()),
        session: Arc::new(StoredSession::new(storage.session_token_file())),
        uploader: Arc::new(uploader(config)?),
        launcher: Arc::new(SelfRelauncher::new()),
        prompt: None,
    };
    let service = BackgroundMonitorService::new(storage, config, collaborators)?;

    match service.start()? {
        StartOutcome::Started => {}
        StartOutcome::AlreadyRunning | StartOutcome::AnotherInstance => {
            tracing::info!("Background monitor already running; exiting");
            return Ok(());
        }
    }

    while !shutdown.wait(Duration::from_secs(3600)) {}

    tracing::info!("Shutdown requested");
    service.stop();
    if !service.pipeline().wait_idle(DRAIN_TIMEOUT) {
        tracing::warn!(
            in_flight = service.pipeline().in_flight(),
            "Exiting with handoffs still in flight"
        );
    }
    Ok(())
}

fn run_pending(storage: &StorageConfig, config: &MonitorConfig, file: &Path) -> Result<(), String> {
    let pending = PendingHandoffStore::new(storage.pending_dir());
    // Removing the lease is the claim. Without one, somebody else finished it.
    if !pending.clear_if(file)? {
        tracing::info!(file = %file.display(), "No pending lease for file; already handled");
        println!("Nothing pending for {}", file.display());
        return Ok(());
    }

    if !file.exists() {
        return Err(format!("Pending file no longer exists: {}", file.display()));
    }

    let requeue = |reason: String| -> Result<(), String> {
        pending.write(file)?;
        Err(format!("{}; file kept pending: {}", reason, file.display()))
    };

    let Some(auth_token) = StoredSession::new(storage.session_token_file()).auth_token() else {
        return requeue("Not signed in".to_string());
    };
    let Some(destination) = config.upload.default_destination.clone() else {
        return requeue("No default destination configured".to_string());
    };

    let request = UploadRequest {
        file_path: file.to_path_buf(),
        destination,
        auth_token,
    };
    match uploader(config)?.upload(&request) {
        Ok(receipt) => {
            tracing::info!(file = %file.display(), status = receipt.status, "Pending document uploaded");
            discard_backup(&storage.backup_dir(), file);
            println!("Uploaded {}", file.display());
            Ok(())
        }
        Err(err) => requeue(format!("Upload failed: {}", err)),
    }
}

#[derive(Serialize)]
struct StatusReport {
    monitor_pid: Option<u32>,
    monitor_since: Option<DateTime<Utc>>,
    pending: Vec<PathBuf>,
}

fn print_status(storage: &StorageConfig) -> Result<(), String> {
    let lease = read_lease(&storage.monitor_lease_file())?;
    let pending = PendingHandoffStore::new(storage.pending_dir()).peek_all()?;
    let report = StatusReport {
        monitor_pid: lease.as_ref().map(|lease| lease.pid),
        monitor_since: lease
            .and_then(|lease| lease.created)
            .and_then(|created| DateTime::from_timestamp_millis(created as i64)),
        pending,
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|err| format!("Failed to serialize status: {}", err))?;
    println!("{}", json);
    Ok(())
}

fn clear_pending(storage: &StorageConfig) -> Result<(), String> {
    let dropped = PendingHandoffStore::new(storage.pending_dir()).clear()?;
    if dropped.is_empty() {
        println!("No pending handoff");
    }
    for file in dropped {
        println!("Cleared pending handoff for {}", file.display());
    }
    Ok(())
}
