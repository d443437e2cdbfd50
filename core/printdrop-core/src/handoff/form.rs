//! Bridge from background workers to the thread that owns an interactive form.
//!
//! Workers never touch a form directly. They send a [`FormCommand`] to the UI
//! thread's run loop and wait on a reply channel with a hard deadline, so a
//! busy or hung UI can delay a handoff but never block a worker indefinitely.
//!
//! ```text
//! worker ──FormCommand──▶ UI run loop ──▶ InteractiveForm
//!    ▲                          │
//!    └──────── reply ───────────┘   (recv_timeout)
//! ```

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The public contract of an interactive form, implemented by the UI layer.
pub trait InteractiveForm: Send + 'static {
    /// True once the form has finished loading its reference data.
    fn is_ready(&self) -> bool;

    /// Hands a document to the form. False when the form refuses it.
    fn deliver(&mut self, path: &Path) -> bool;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormError {
    #[error("interactive form is closed")]
    Closed,
    #[error("interactive form did not answer within {0:?}")]
    Timeout(Duration),
}

enum FormCommand {
    IsReady(Sender<bool>),
    Deliver(PathBuf, Sender<bool>),
    Close,
}

/// Cloneable sender side of a form's run loop.
#[derive(Clone)]
pub struct FormHandle {
    tx: Sender<FormCommand>,
}

impl std::fmt::Debug for FormHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormHandle").finish_non_exhaustive()
    }
}

impl FormHandle {
    fn request(
        &self,
        build: impl FnOnce(Sender<bool>) -> FormCommand,
        timeout: Duration,
    ) -> Result<bool, FormError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx.send(build(reply_tx)).map_err(|_| FormError::Closed)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(answer) => Ok(answer),
            Err(RecvTimeoutError::Timeout) => Err(FormError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(FormError::Closed),
        }
    }

    /// Polls the form's readiness until it reports ready or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration, poll: Duration) -> Result<(), FormError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FormError::Timeout(timeout));
            }
            match self.request(FormCommand::IsReady, remaining) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(FormError::Timeout(_)) => return Err(FormError::Timeout(timeout)),
                Err(err) => return Err(err),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(poll.min(remaining));
        }
    }

    /// Delivers `path` on the UI thread, waiting at most `timeout` for the answer.
    pub fn deliver(&self, path: &Path, timeout: Duration) -> Result<bool, FormError> {
        self.request(|reply| FormCommand::Deliver(path.to_path_buf(), reply), timeout)
    }
}

/// A UI thread running one form's run loop.
pub struct UiThread {
    handle: FormHandle,
    join: Option<JoinHandle<()>>,
}

impl UiThread {
    pub fn spawn(mut form: impl InteractiveForm) -> Self {
        let (tx, rx) = mpsc::channel::<FormCommand>();
        let join = thread::spawn(move || {
            while let Ok(command) = rx.recv() {
                match command {
                    FormCommand::IsReady(reply) => {
                        let _ = reply.send(form.is_ready());
                    }
                    FormCommand::Deliver(path, reply) => {
                        let accepted = form.deliver(&path);
                        tracing::debug!(path = %path.display(), accepted, "Form delivery handled");
                        let _ = reply.send(accepted);
                    }
                    FormCommand::Close => break,
                }
            }
        });
        Self {
            handle: FormHandle { tx },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> FormHandle {
        self.handle.clone()
    }

    /// Stops the run loop after queued commands drain.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.handle.tx.send(FormCommand::Close);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for UiThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Where the pipeline looks for an open interactive form.
pub trait FormHost: Send + Sync {
    fn current_form(&self) -> Option<FormHandle>;
}

/// The UI layer's registration point: at most one open form per process.
#[derive(Debug, Default, Clone)]
pub struct FormSlot {
    slot: Arc<Mutex<Option<FormHandle>>>,
}

impl FormSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, handle: FormHandle) {
        *self.lock() = Some(handle);
    }

    pub fn detach(&self) {
        *self.lock() = None;
    }

    pub fn is_form_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Delivers to the attached form, if any. A closed form is detached.
    pub fn deliver_to_form(&self, path: &Path, timeout: Duration) -> bool {
        let Some(handle) = self.current_form() else {
            return false;
        };
        match handle.deliver(path, timeout) {
            Ok(accepted) => accepted,
            Err(FormError::Closed) => {
                self.detach();
                false
            }
            Err(_) => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<FormHandle>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FormHost for FormSlot {
    fn current_form(&self) -> Option<FormHandle> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingForm {
        ready: Arc<AtomicBool>,
        delivered: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl InteractiveForm for RecordingForm {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn deliver(&mut self, path: &Path) -> bool {
            self.delivered.lock().unwrap().push(path.to_path_buf());
            true
        }
    }

    fn form(ready: bool) -> (RecordingForm, Arc<AtomicBool>, Arc<Mutex<Vec<PathBuf>>>) {
        let ready = Arc::new(AtomicBool::new(ready));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        (
            RecordingForm {
                ready: Arc::clone(&ready),
                delivered: Arc::clone(&delivered),
            },
            ready,
            delivered,
        )
    }

    #[test]
    fn test_deliver_runs_on_ui_thread() {
        let (form, _, delivered) = form(true);
        let ui = UiThread::spawn(form);
        let handle = ui.handle();

        handle
            .wait_ready(Duration::from_secs(1), Duration::from_millis(10))
            .unwrap();
        assert_eq!(
            handle.deliver(Path::new("/capture/a.pdf"), Duration::from_secs(1)),
            Ok(true)
        );
        ui.close();
        assert_eq!(*delivered.lock().unwrap(), vec![PathBuf::from("/capture/a.pdf")]);
    }

    #[test]
    fn test_wait_ready_sees_late_readiness() {
        let (form, ready, _) = form(false);
        let ui = UiThread::spawn(form);
        let handle = ui.handle();
        let flip = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            ready.store(true, Ordering::SeqCst);
        });
        assert!(handle
            .wait_ready(Duration::from_secs(2), Duration::from_millis(10))
            .is_ok());
        flip.join().unwrap();
    }

    #[test]
    fn test_wait_ready_times_out_within_bound() {
        let (form, _, _) = form(false);
        let ui = UiThread::spawn(form);
        let started = Instant::now();
        let result = ui
            .handle()
            .wait_ready(Duration::from_millis(200), Duration::from_millis(20));
        assert!(matches!(result, Err(FormError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_closed_form_is_detached_from_slot() {
        let (form, _, _) = form(true);
        let ui = UiThread::spawn(form);
        let slot = FormSlot::new();
        slot.attach(ui.handle());
        ui.close();

        assert!(slot.is_form_open());
        assert!(!slot.deliver_to_form(Path::new("/capture/a.pdf"), Duration::from_millis(100)));
        assert!(!slot.is_form_open());
    }
}
