//! Output-folder watcher: native events plus a polling fallback.
//!
//! Both detection paths are producers into one channel; a single detector
//! thread settles candidates and hands them on.
//!
//! ```text
//! notify callback ──┐
//!                   ├──▶ channel ──▶ detector: settle ─▶ exists? ─▶ ready? ─▶ try_claim ─▶ sink
//! poll loop (2s) ───┘
//! ```
//!
//! - A candidate waits `settle_delay` after it was first seen.
//! - A file that vanished meanwhile is skipped silently.
//! - A file still held by its writer is dropped from the settle set; the next
//!   poll rediscovers it.
//! - [`ProcessedFileRegistry::try_claim`] makes event+poll duplicates harmless.
//! - When several files settle together, the newest is handed on first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{PrintdropError, Result};
use crate::handoff::CandidateSink;
use crate::registry::ProcessedFileRegistry;
use crate::shutdown::ShutdownSignal;
use crate::types::{CandidateFile, DetectionSource, WatchedFolder};

const MIN_TICK: Duration = Duration::from_millis(50);
const MAX_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct WatcherTiming {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

impl Default for WatcherTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(1),
        }
    }
}

struct Running {
    folders: Vec<WatchedFolder>,
    native: Option<RecommendedWatcher>,
    shutdown: Arc<ShutdownSignal>,
    threads: Vec<JoinHandle<()>>,
}

pub struct OutputFolderWatcher {
    registry: Arc<ProcessedFileRegistry>,
    sink: Arc<dyn CandidateSink>,
    timing: WatcherTiming,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for OutputFolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputFolderWatcher")
            .field("timing", &self.timing)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Creates `folder` if missing. Returns true when it had to be created.
fn ensure_folder(folder: &WatchedFolder) -> bool {
    if folder.path().is_dir() {
        return false;
    }
    match fs_err::create_dir_all(folder.path()) {
        Ok(()) => {
            tracing::warn!(folder = %folder.path().display(), "Watched folder was missing; created");
            true
        }
        Err(err) => {
            tracing::error!(
                folder = %folder.path().display(),
                error = %err,
                "Watched folder missing and cannot be created"
            );
            false
        }
    }
}

fn watch_natively(native: &mut RecommendedWatcher, folder: &WatchedFolder) {
    match native.watch(folder.path(), RecursiveMode::NonRecursive) {
        Ok(()) => tracing::info!(folder = %folder.path().display(), "Watching folder"),
        Err(err) => tracing::warn!(
            folder = %folder.path().display(),
            error = %err,
            "Native watch failed; relying on polling"
        ),
    }
}

impl OutputFolderWatcher {
    pub fn new(
        registry: Arc<ProcessedFileRegistry>,
        sink: Arc<dyn CandidateSink>,
        timing: WatcherTiming,
    ) -> Self {
        Self {
            registry,
            sink,
            timing,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Folders currently watched (resolved paths).
    pub fn folders(&self) -> Vec<WatchedFolder> {
        self.running()
            .as_ref()
            .map(|running| running.folders.clone())
            .unwrap_or_default()
    }

    /// Starts both detection paths. A second call while running is a no-op.
    /// Missing folders are created; native watch failures are not fatal.
    pub fn start(&self, folders: &[WatchedFolder]) -> Result<()> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }

        let folders: Vec<WatchedFolder> = folders
            .iter()
            .map(|folder| {
                ensure_folder(folder);
                folder.resolved()
            })
            .collect();

        let (tx, rx) = mpsc::channel::<CandidateFile>();
        let native = self.start_native(&folders, tx.clone());
        let shutdown = Arc::new(ShutdownSignal::new());

        let detector = {
            let registry = Arc::clone(&self.registry);
            let sink = Arc::clone(&self.sink);
            let folders = folders.clone();
            let detector_shutdown = Arc::clone(&shutdown);
            let settle = self.timing.settle_delay;
            thread::Builder::new()
                .name("printdrop-detector".to_string())
                .spawn(move || {
                    run_detector(rx, &folders, &registry, sink.as_ref(), settle, &detector_shutdown)
                })
                .map_err(|err| PrintdropError::io("spawn detector thread", err))?
        };

        let poller = {
            let registry = Arc::clone(&self.registry);
            let folders = folders.clone();
            let poll_shutdown = Arc::clone(&shutdown);
            let interval = self.timing.poll_interval;
            let spawned = thread::Builder::new()
                .name("printdrop-poll".to_string())
                .spawn(move || run_poll_loop(tx, &folders, &registry, interval, &poll_shutdown));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    shutdown.trigger();
                    let _ = detector.join();
                    return Err(PrintdropError::io("spawn poll thread", err));
                }
            }
        };

        tracing::info!(
            folders = folders.len(),
            native = native.is_some(),
            poll_ms = self.timing.poll_interval.as_millis() as u64,
            "Output folder watcher started"
        );
        *running = Some(Running {
            folders,
            native,
            shutdown,
            threads: vec![detector, poller],
        });
        Ok(())
    }

    fn start_native(
        &self,
        folders: &[WatchedFolder],
        tx: Sender<CandidateFile>,
    ) -> Option<RecommendedWatcher> {
        let mut native = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    tracing::debug!(error = %err, "Native watch error");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                for path in event.paths {
                    let _ = tx.send(CandidateFile::new(path, DetectionSource::Event));
                }
            }
        }) {
            Ok(native) => native,
            Err(err) => {
                tracing::warn!(error = %err, "Native watcher unavailable; polling only");
                return None;
            }
        };
        for folder in folders {
            watch_natively(&mut native, folder);
        }
        Some(native)
    }

    /// Heartbeat repair: recreates missing folders and re-registers their
    /// native watches. Returns how many folders were repaired.
    pub fn ensure_folders(&self) -> usize {
        let mut running = self.running();
        let Some(running) = running.as_mut() else {
            return 0;
        };
        let mut repaired = 0;
        for folder in &running.folders {
            if ensure_folder(folder) {
                repaired += 1;
                if let Some(native) = running.native.as_mut() {
                    let _ = native.unwatch(folder.path());
                    watch_natively(native, folder);
                }
            }
        }
        repaired
    }

    /// Stops both detection paths. Safe to repeat and to call from any thread.
    pub fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.shutdown.trigger();
        drop(running.native);
        let current = thread::current().id();
        for handle in running.threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::info!("Output folder watcher stopped");
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for OutputFolderWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_poll_loop(
    tx: Sender<CandidateFile>,
    folders: &[WatchedFolder],
    registry: &ProcessedFileRegistry,
    interval: Duration,
    shutdown: &ShutdownSignal,
) {
    loop {
        for folder in folders {
            let entries = match fs_err::read_dir(folder.path()) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::debug!(error = %err, "Poll skipped folder");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if folder.matches(&path) && !registry.is_processed(&path) && path.is_file() {
                    if tx.send(CandidateFile::new(path, DetectionSource::Poll)).is_err() {
                        return;
                    }
                }
            }
        }
        if shutdown.wait(interval) {
            return;
        }
    }
}

fn run_detector(
    rx: Receiver<CandidateFile>,
    folders: &[WatchedFolder],
    registry: &ProcessedFileRegistry,
    sink: &dyn CandidateSink,
    settle: Duration,
    shutdown: &ShutdownSignal,
) {
    let tick = (settle / 4).clamp(MIN_TICK, MAX_TICK);
    let mut settling: HashMap<PathBuf, (Instant, CandidateFile)> = HashMap::new();

    loop {
        if shutdown.is_triggered() {
            return;
        }
        match rx.recv_timeout(tick) {
            Ok(candidate) => {
                track(&mut settling, candidate, folders, registry);
                while let Ok(candidate) = rx.try_recv() {
                    track(&mut settling, candidate, folders, registry);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        for candidate in take_settled(&mut settling, settle) {
            if shutdown.is_triggered() {
                return;
            }
            hand_on(candidate, registry, sink);
        }
    }
}

/// Adds a candidate to the settle set unless it is irrelevant or already seen.
fn track(
    settling: &mut HashMap<PathBuf, (Instant, CandidateFile)>,
    candidate: CandidateFile,
    folders: &[WatchedFolder],
    registry: &ProcessedFileRegistry,
) {
    if folders.iter().any(|folder| folder.matches(&candidate.path))
        && !registry.is_processed(&candidate.path)
    {
        settling
            .entry(candidate.path.clone())
            .or_insert_with(|| (Instant::now(), candidate));
    }
}

/// Removes settled entries, newest file first.
fn take_settled(
    settling: &mut HashMap<PathBuf, (Instant, CandidateFile)>,
    settle: Duration,
) -> Vec<CandidateFile> {
    let now = Instant::now();
    let mut settled: Vec<CandidateFile> = Vec::new();
    settling.retain(|_, (first_seen, candidate)| {
        if now.duration_since(*first_seen) >= settle {
            settled.push(candidate.clone());
            false
        } else {
            true
        }
    });
    settled.sort_by_key(|candidate| std::cmp::Reverse(created_at(&candidate.path)));
    settled
}

fn created_at(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn hand_on(candidate: CandidateFile, registry: &ProcessedFileRegistry, sink: &dyn CandidateSink) {
    if !candidate.path.exists() {
        tracing::debug!(path = %candidate.path.display(), "Candidate vanished before settling");
        return;
    }
    if !registry.is_ready(&candidate.path) {
        tracing::debug!(path = %candidate.path.display(), "Candidate still being written; retry next poll");
        return;
    }
    if !registry.try_claim(&candidate.path) {
        return;
    }
    tracing::info!(
        path = %candidate.path.display(),
        source = %candidate.source,
        "New document detected"
    );
    sink.on_candidate(candidate);
}
