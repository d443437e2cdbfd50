//! Background monitor service: the composition root.
//!
//! Builds the registry, coordinator, pipeline and watcher once and wires them
//! together. `start` claims the monitor role; a denied claim is a normal
//! outcome, not an error.
//!
//! While running, a heartbeat thread makes one pass right after start and then
//! one every `heartbeat_secs`. Each pass:
//! - recreates watched folders that disappeared (and re-registers their watches)
//! - rewrites the monitor lease if something deleted or clobbered it
//! - retries pending handoffs left by failures here or by an earlier run

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{MonitorConfig, MONITOR_ARG};
use crate::coordinator::SingleInstanceCoordinator;
use crate::error::{PrintdropError, Result};
use crate::handoff::{CandidateSink, DocumentHandoffPipeline, HandoffCollaborators};
use crate::pending::PendingHandoffStore;
use crate::registry::ProcessedFileRegistry;
use crate::shutdown::ShutdownSignal;
use crate::storage::StorageConfig;
use crate::types::WatchedFolder;
use crate::watcher::{OutputFolderWatcher, WatcherTiming};

/// Result of [`BackgroundMonitorService::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// This service was already running.
    AlreadyRunning,
    /// Another live monitor holds the role.
    AnotherInstance,
}

/// Point-in-time view for `printdrop status` and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub folders: Vec<PathBuf>,
    pub processed: usize,
    pub in_flight: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pending: Vec<PathBuf>,
}

struct Heartbeat {
    shutdown: Arc<ShutdownSignal>,
    handle: JoinHandle<()>,
}

pub struct BackgroundMonitorService {
    folders: Vec<WatchedFolder>,
    heartbeat_interval: Duration,
    coordinator: SingleInstanceCoordinator,
    registry: Arc<ProcessedFileRegistry>,
    pipeline: Arc<DocumentHandoffPipeline>,
    watcher: OutputFolderWatcher,
    heartbeat: Mutex<Option<Heartbeat>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for BackgroundMonitorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundMonitorService")
            .field("folders", &self.folders)
            .field("coordinator", &self.coordinator)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl BackgroundMonitorService {
    /// Builds a service whose coordinator guards `storage.monitor_lease_file()`.
    pub fn new(
        storage: &StorageConfig,
        config: &MonitorConfig,
        collaborators: HandoffCollaborators,
    ) -> Result<Arc<Self>> {
        let mut coordinator = SingleInstanceCoordinator::new(
            storage.monitor_lease_file(),
            config.monitor.role.clone(),
            MONITOR_ARG,
        );
        if !config.monitor.scan_peers {
            coordinator = coordinator.without_peer_scan();
        }
        Self::with_coordinator(storage, config, collaborators, coordinator)
    }

    pub fn with_coordinator(
        storage: &StorageConfig,
        config: &MonitorConfig,
        collaborators: HandoffCollaborators,
        coordinator: SingleInstanceCoordinator,
    ) -> Result<Arc<Self>> {
        let folders = config.watched_folders(storage)?;
        let registry = Arc::new(ProcessedFileRegistry::new());
        let pipeline = Arc::new(DocumentHandoffPipeline::new(
            Arc::clone(&registry),
            PendingHandoffStore::new(storage.pending_dir()),
            storage.backup_dir(),
            config.handoff.clone(),
            config.upload.default_destination.clone(),
            collaborators,
        ));
        let sink: Arc<dyn CandidateSink> = Arc::new(Arc::clone(&pipeline));
        let watcher = OutputFolderWatcher::new(
            Arc::clone(&registry),
            sink,
            WatcherTiming {
                poll_interval: config.watch.poll_interval(),
                settle_delay: config.watch.settle_delay(),
            },
        );

        Ok(Arc::new(Self {
            folders,
            heartbeat_interval: config.monitor.heartbeat_interval(),
            coordinator,
            registry,
            pipeline,
            watcher,
            heartbeat: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
        }))
    }

    pub fn registry(&self) -> &Arc<ProcessedFileRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<DocumentHandoffPipeline> {
        &self.pipeline
    }

    pub fn coordinator(&self) -> &SingleInstanceCoordinator {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat().is_some()
    }

    /// Claims the monitor role and starts watching. Safe to call repeatedly.
    pub fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        let mut heartbeat = self.heartbeat();
        if heartbeat.is_some() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        if !self.coordinator.try_claim() {
            tracing::info!(
                lease = %self.coordinator.lease_path().display(),
                "Another monitor is already running; not starting"
            );
            return Ok(StartOutcome::AnotherInstance);
        }

        // Resolve first: native watchers report canonical paths.
        let folders: Vec<WatchedFolder> = self
            .folders
            .iter()
            .map(|folder| {
                if !folder.path().is_dir() {
                    if let Err(err) = fs_err::create_dir_all(folder.path()) {
                        tracing::warn!(error = %err, "Cannot create watched folder");
                    }
                }
                folder.resolved()
            })
            .collect();
        let seeded: usize = folders.iter().map(|folder| self.registry.seed(folder)).sum();

        if let Err(err) = self.watcher.start(&folders) {
            self.coordinator.release();
            return Err(err);
        }

        let shutdown = Arc::new(ShutdownSignal::new());
        let handle = {
            let service = Arc::downgrade(self);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.heartbeat_interval;
            thread::Builder::new()
                .name("printdrop-heartbeat".to_string())
                .spawn(move || run_heartbeat(service, interval, &shutdown))
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.watcher.stop();
                self.coordinator.release();
                return Err(PrintdropError::io("spawn heartbeat thread", err));
            }
        };

        *heartbeat = Some(Heartbeat { shutdown, handle });
        tracing::info!(
            folders = folders.len(),
            seeded,
            heartbeat_secs = self.heartbeat_interval.as_secs(),
            "Background monitor started"
        );
        Ok(StartOutcome::Started)
    }

    /// Stops watching and releases the monitor role. Safe to call repeatedly.
    /// In-flight handoffs are left to finish.
    pub fn stop(&self) {
        let Some(heartbeat) = self.heartbeat().take() else {
            return;
        };
        self.watcher.stop();
        heartbeat.shutdown.trigger();
        if heartbeat.handle.thread().id() != thread::current().id() {
            let _ = heartbeat.handle.join();
        }
        self.coordinator.release();
        tracing::info!("Background monitor stopped");
    }

    /// One heartbeat pass. Public so callers can force a check.
    pub fn heartbeat_once(&self) {
        let repaired = self.watcher.ensure_folders();
        if repaired > 0 {
            tracing::info!(repaired, "Heartbeat recreated watched folders");
        }
        if !self.coordinator.reassert() {
            tracing::warn!("Heartbeat found another live monitor lease holder");
        }
        let retried = self.pipeline.retry_pending();
        if !retried.is_empty() {
            let completed = retried.iter().filter(|(_, outcome)| outcome.is_success()).count();
            tracing::info!(retried = retried.len(), completed, "Heartbeat retried pending handoffs");
        }
        *lock(&self.last_heartbeat) = Some(Utc::now());
    }

    pub fn status(&self) -> MonitorStatus {
        let running = self.is_running();
        let folders = if running {
            self.watcher.folders()
        } else {
            self.folders.clone()
        };
        let pending = match self.pipeline.pending().peek_all() {
            Ok(pending) => pending,
            Err(err) => {
                tracing::debug!(error = %err, "Pending leases unreadable");
                Vec::new()
            }
        };
        MonitorStatus {
            running,
            folders: folders.iter().map(|folder| folder.path().to_path_buf()).collect(),
            processed: self.registry.len(),
            in_flight: self.pipeline.in_flight(),
            last_heartbeat: *lock(&self.last_heartbeat),
            pending,
        }
    }

    fn heartbeat(&self) -> MutexGuard<'_, Option<Heartbeat>> {
        lock(&self.heartbeat)
    }
}

impl Drop for BackgroundMonitorService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_heartbeat(service: Weak<BackgroundMonitorService>, interval: Duration, shutdown: &ShutdownSignal) {
    loop {
        match service.upgrade() {
            Some(service) => service.heartbeat_once(),
            None => return,
        }
        if shutdown.wait(interval) {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
