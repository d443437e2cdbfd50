//! Document handoff pipeline.
//!
//! Drives one claimed, ready file to a terminal outcome.
//!
//! ```text
//! Detected ──▶ BackupCopied ──▶ RouteDecision ─┬─▶ InteractiveDelivered  (open form / prompt + upload)
//!                                              ├─▶ InteractiveQueued     (no form, no session)
//!                                              ├─▶ HeadlessUploaded      (no form, session, default destination)
//!                                              ├─▶ Dismissed             (prompt cancelled)
//!                                              └─▶ Failed                (timeout / I/O / upload error)
//! ```
//!
//! # Rules
//!
//! - The backup copy is made before anything else; later steps only touch the
//!   copy. A failed copy falls back to the original path.
//! - Route decisions are serialized per process (one file between
//!   `RouteDecision` and a terminal state at a time). Backup copies of other
//!   files proceed concurrently.
//! - `Failed` always leaves a pending-handoff lease for that file. Nothing here
//!   panics or propagates out of a worker thread.
//! - Success and dismissal re-mark the source path processed, clear its
//!   pending lease and delete its backup copy. The copy stays while a pending
//!   lease refers to it.
//! - Pending files are retried by [`DocumentHandoffPipeline::retry_pending`]
//!   through an open form or a headless upload.

pub mod form;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::HandoffConfig;
use crate::launcher::InteractiveLauncher;
use crate::pending::PendingHandoffStore;
use crate::registry::ProcessedFileRegistry;
use crate::session::SessionProvider;
use crate::types::{CandidateFile, Destination, HandoffOutcome, HandoffState, UploadRequest};
use crate::upload::UploadGateway;
use form::{FormError, FormHost};

const RECENT_OUTCOMES: usize = 64;

/// Asks the operator where a document should go.
pub trait DestinationPrompt: Send + Sync {
    /// Blocks the calling worker (never the UI thread) until the operator
    /// answers. `None` means cancelled.
    fn prompt_for_destination(&self, file: &Path) -> Option<Destination>;
}

/// Receives claimed, ready files from the watcher.
pub trait CandidateSink: Send + Sync {
    fn on_candidate(&self, candidate: CandidateFile);
}

enum RetryRoute {
    Form(form::FormHandle),
    Upload { token: String, destination: Destination },
}

/// External services the pipeline calls into.
#[derive(Clone)]
pub struct HandoffCollaborators {
    pub forms: Arc<dyn FormHost>,
    pub session: Arc<dyn SessionProvider>,
    pub uploader: Arc<dyn UploadGateway>,
    pub launcher: Arc<dyn InteractiveLauncher>,
    /// Absent in a headless monitor with nobody to ask.
    pub prompt: Option<Arc<dyn DestinationPrompt>>,
}

pub struct DocumentHandoffPipeline {
    registry: Arc<ProcessedFileRegistry>,
    pending: PendingHandoffStore,
    backup_dir: PathBuf,
    config: HandoffConfig,
    default_destination: Option<Destination>,
    collaborators: HandoffCollaborators,
    route_gate: Mutex<()>,
    in_flight: Arc<AtomicUsize>,
    recent: Mutex<VecDeque<(PathBuf, HandoffOutcome)>>,
}

impl std::fmt::Debug for DocumentHandoffPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandoffPipeline")
            .field("backup_dir", &self.backup_dir)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Decrements the in-flight counter when a worker ends, even on panic.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DocumentHandoffPipeline {
    pub fn new(
        registry: Arc<ProcessedFileRegistry>,
        pending: PendingHandoffStore,
        backup_dir: PathBuf,
        config: HandoffConfig,
        default_destination: Option<Destination>,
        collaborators: HandoffCollaborators,
    ) -> Self {
        Self {
            registry,
            pending,
            backup_dir,
            config,
            default_destination,
            collaborators,
            route_gate: Mutex::new(()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pending(&self) -> &PendingHandoffStore {
        &self.pending
    }

    /// Entry point for the UI layer ("a new printed file exists").
    /// Returns false when the path was already handled.
    pub fn notify_candidate_file(self: &Arc<Self>, path: &Path) -> bool {
        if !self.registry.try_claim(path) {
            tracing::debug!(path = %path.display(), "Candidate already processed");
            return false;
        }
        self.dispatch(CandidateFile::new(path, crate::types::DetectionSource::Event));
        true
    }

    /// Runs [`Self::process`] on a new worker thread.
    pub fn dispatch(self: &Arc<Self>, candidate: CandidateFile) {
        let pipeline = Arc::clone(self);
        let guard = InFlight::enter(&self.in_flight);
        let spawned = thread::Builder::new()
            .name("printdrop-handoff".to_string())
            .spawn(move || {
                let _guard = guard;
                pipeline.process(&candidate);
            });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "Failed to spawn handoff worker");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until no worker is running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    /// Most recent outcomes, oldest first.
    pub fn recent_outcomes(&self) -> Vec<(PathBuf, HandoffOutcome)> {
        lock(&self.recent).iter().cloned().collect()
    }

    /// Drives one claimed candidate to a terminal outcome.
    pub fn process(&self, candidate: &CandidateFile) -> HandoffOutcome {
        tracing::info!(
            path = %candidate.path.display(),
            source = %candidate.source,
            state = ?HandoffState::Detected,
            "Handoff started"
        );

        let working = self.backup_copy(&candidate.path);
        tracing::debug!(
            path = %working.display(),
            state = ?HandoffState::BackupCopied,
            "Working copy ready"
        );

        let _gate = lock(&self.route_gate);
        tracing::debug!(path = %working.display(), state = ?HandoffState::RouteDecision, "Routing");
        let outcome = self.route(&working);
        self.finish(&candidate.path, &working, &outcome);
        outcome
    }

    /// Retries every pending file this process can finish on its own: through
    /// an open form, or by uploading to the default destination with the
    /// current session. Files that still need an interactive process stay
    /// pending untouched. Returns the outcome of each attempt made.
    pub fn retry_pending(&self) -> Vec<(PathBuf, HandoffOutcome)> {
        let files = match self.pending.peek_all() {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(error = %err, "Pending handoffs unreadable");
                return Vec::new();
            }
        };

        let mut attempts = Vec::new();
        for file in files {
            if !file.exists() {
                tracing::warn!(file = %file.display(), "Pending file vanished; clearing");
                let _ = self.pending.clear_if(&file);
                continue;
            }

            let _gate = lock(&self.route_gate);
            let Some(retry) = self.retry_route() else {
                tracing::debug!(file = %file.display(), "Pending file needs an interactive process");
                continue;
            };

            // Removing the lease is the claim; someone else may have won it.
            match self.pending.clear_if(&file) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(file = %file.display(), error = %err, "Cannot claim pending handoff");
                    continue;
                }
            }

            let outcome = match retry {
                RetryRoute::Form(form) => self.deliver_to_form(&form, &file),
                RetryRoute::Upload { token, destination } => {
                    match self.upload(&file, destination, token) {
                        Ok(()) => HandoffOutcome::HeadlessUploaded,
                        Err(outcome) => outcome,
                    }
                }
            };

            if outcome.is_success() {
                discard_backup(&self.backup_dir, &file);
                tracing::info!(file = %file.display(), outcome = ?outcome, "Pending handoff completed");
            } else {
                if let Err(err) = self.pending.write(&file) {
                    tracing::error!(error = %err, "Failed to re-record pending handoff");
                }
                tracing::info!(file = %file.display(), outcome = ?outcome, "Pending retry deferred");
            }
            self.record(&file, &outcome);
            attempts.push((file, outcome));
        }
        attempts
    }

    /// How a pending file can be finished without an interactive process.
    fn retry_route(&self) -> Option<RetryRoute> {
        if let Some(form) = self.collaborators.forms.current_form() {
            return Some(RetryRoute::Form(form));
        }
        let token = self.collaborators.session.auth_token()?;
        let destination = self.default_destination.clone()?;
        Some(RetryRoute::Upload { token, destination })
    }

    fn backup_copy(&self, original: &Path) -> PathBuf {
        let Some(name) = original.file_name() else {
            return original.to_path_buf();
        };
        let dir = self.backup_dir.join(ulid::Ulid::new().to_string());
        let target = dir.join(name);
        let copied = fs_err::create_dir_all(&dir).and_then(|()| fs_err::copy(original, &target));
        match copied {
            Ok(_) => target,
            Err(err) => {
                tracing::warn!(
                    path = %original.display(),
                    error = %err,
                    "Backup copy failed; using original"
                );
                original.to_path_buf()
            }
        }
    }

    fn route(&self, working: &Path) -> HandoffOutcome {
        if let Some(form) = self.collaborators.forms.current_form() {
            return self.deliver_to_form(&form, working);
        }

        let Some(token) = self.collaborators.session.auth_token() else {
            return self.queue_for_interactive(working);
        };

        if let Some(prompt) = &self.collaborators.prompt {
            return match prompt.prompt_for_destination(working) {
                Some(destination) => match self.upload(working, destination, token) {
                    Ok(()) => HandoffOutcome::InteractiveDelivered,
                    Err(outcome) => outcome,
                },
                None => HandoffOutcome::Dismissed,
            };
        }

        match self.default_destination.clone() {
            Some(destination) => match self.upload(working, destination, token) {
                Ok(()) => HandoffOutcome::HeadlessUploaded,
                Err(outcome) => outcome,
            },
            None => self.queue_for_interactive(working),
        }
    }

    fn deliver_to_form(&self, form: &form::FormHandle, working: &Path) -> HandoffOutcome {
        let timeout = self.config.form_ready_timeout();
        if let Err(err) = form.wait_ready(timeout, self.config.form_ready_poll()) {
            return failed(format!("form not ready: {err}"));
        }
        match form.deliver(working, timeout) {
            Ok(true) => HandoffOutcome::InteractiveDelivered,
            Ok(false) => failed("form refused the document"),
            Err(FormError::Closed) => failed("form closed during delivery"),
            Err(err) => failed(format!("form delivery: {err}")),
        }
    }

    fn queue_for_interactive(&self, working: &Path) -> HandoffOutcome {
        if let Err(err) = self.pending.write(working) {
            return failed(format!("cannot record pending handoff: {err}"));
        }
        match self.collaborators.launcher.launch_with_pending(working) {
            Ok(()) => HandoffOutcome::InteractiveQueued,
            Err(err) => failed(format!("cannot launch interactive process: {err}")),
        }
    }

    fn upload(
        &self,
        working: &Path,
        destination: Destination,
        auth_token: String,
    ) -> Result<(), HandoffOutcome> {
        let request = UploadRequest {
            file_path: working.to_path_buf(),
            destination,
            auth_token,
        };
        match self.collaborators.uploader.upload(&request) {
            Ok(receipt) => {
                tracing::info!(path = %working.display(), status = receipt.status, "Upload accepted");
                Ok(())
            }
            Err(err) => Err(failed(format!("upload: {err}"))),
        }
    }

    fn finish(&self, original: &Path, working: &Path, outcome: &HandoffOutcome) {
        match outcome {
            HandoffOutcome::InteractiveDelivered
            | HandoffOutcome::HeadlessUploaded
            | HandoffOutcome::Dismissed => {
                self.registry.mark_processed(original);
                if let Err(err) = self.pending.clear_if(working) {
                    tracing::warn!(error = %err, "Failed to clear pending handoff");
                }
                discard_backup(&self.backup_dir, working);
                tracing::info!(path = %original.display(), outcome = ?outcome, "Handoff complete");
            }
            HandoffOutcome::InteractiveQueued => {
                tracing::info!(path = %original.display(), "Handoff queued for interactive process");
            }
            HandoffOutcome::Failed { reason } => {
                if let Err(err) = self.pending.write(working) {
                    tracing::error!(error = %err, "Failed to record pending handoff");
                }
                tracing::warn!(path = %original.display(), reason = %reason, "Handoff failed; left pending");
            }
        }
        self.record(original, outcome);
    }

    fn record(&self, path: &Path, outcome: &HandoffOutcome) {
        let mut recent = lock(&self.recent);
        if recent.len() == RECENT_OUTCOMES {
            recent.pop_front();
        }
        recent.push_back((path.to_path_buf(), outcome.clone()));
    }
}

impl CandidateSink for Arc<DocumentHandoffPipeline> {
    fn on_candidate(&self, candidate: CandidateFile) {
        self.dispatch(candidate);
    }
}

/// Deletes the `backup/<ulid>/` directory holding `working` once its handoff
/// is finished. Paths outside `backup_dir` (a failed copy falls back to the
/// original) are never touched.
pub fn discard_backup(backup_dir: &Path, working: &Path) {
    let Some(dir) = working.parent() else {
        return;
    };
    if dir.parent() != Some(backup_dir) {
        return;
    }
    match fs_err::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(dir = %dir.display(), "Backup copy removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "Failed to remove backup copy"),
    }
}

fn failed(reason: impl Into<String>) -> HandoffOutcome {
    HandoffOutcome::Failed {
        reason: reason.into(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
