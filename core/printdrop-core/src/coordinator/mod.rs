//! Cross-process mutual exclusion for the background monitor.
//!
//! Several entry points (direct launch, scheduled task, autostart) can race to
//! start a monitor. Two monitors would double-process every printed file, so
//! exactly one may hold the `monitor-running` lease at a time.
//!
//! # Claim Protocol
//!
//! Under an exclusive advisory lock on `monitor-running.guard`:
//!
//! 1. This coordinator already holds the lease → deny.
//! 2. The lease file names a live holder (see [`lease`]) → deny.
//!    A stale or unreadable lease is deleted here.
//! 3. An older process of the same executable carries the monitor argument → deny.
//!    Ties on start time go to the lower pid, so simultaneous launches still
//!    leave one monitor.
//! 4. Otherwise write a fresh lease for the current process → granted.
//!
//! Denial has no side effects beyond stale-lease cleanup.

pub mod lease;
pub mod process;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;

use crate::error::{PrintdropError, Result};
use lease::{guard_path, read_lease, remove_lease, write_lease, LeaseRecord};
use process::{own_exe_name, own_start_time, ProcessProbe, SystemProbe};

pub struct SingleInstanceCoordinator {
    lease_path: PathBuf,
    role: String,
    monitor_arg: String,
    exe_name: Option<String>,
    probe: Arc<dyn ProcessProbe>,
    held: Mutex<Option<LeaseRecord>>,
}

impl std::fmt::Debug for SingleInstanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleInstanceCoordinator")
            .field("lease_path", &self.lease_path)
            .field("role", &self.role)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Holds the guard lock for the duration of a claim; unlocks on drop.
struct ClaimGuard(File);

impl ClaimGuard {
    fn acquire(lease_path: &Path) -> Result<Self> {
        let path = guard_path(lease_path);
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| PrintdropError::io("create lease dir", err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| PrintdropError::io(format!("open {}", path.display()), err))?;
        file.lock_exclusive()
            .map_err(|err| PrintdropError::io("lock claim guard", err))?;
        Ok(Self(file))
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl SingleInstanceCoordinator {
    /// Coordinator over `lease_path` using the live process table.
    pub fn new(lease_path: PathBuf, role: impl Into<String>, monitor_arg: impl Into<String>) -> Self {
        Self::with_probe(lease_path, role, monitor_arg, Arc::new(SystemProbe))
    }

    pub fn with_probe(
        lease_path: PathBuf,
        role: impl Into<String>,
        monitor_arg: impl Into<String>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            lease_path,
            role: role.into(),
            monitor_arg: monitor_arg.into(),
            exe_name: own_exe_name(),
            probe,
            held: Mutex::new(None),
        }
    }

    /// Disables the process-table scan (step 3). Used when the executable
    /// name is shared with unrelated processes, and in tests.
    pub fn without_peer_scan(mut self) -> Self {
        self.exe_name = None;
        self
    }

    pub fn lease_path(&self) -> &Path {
        &self.lease_path
    }

    pub fn is_held(&self) -> bool {
        self.held().is_some()
    }

    /// Tries to become the single live monitor. See the module docs.
    pub fn try_claim(&self) -> bool {
        let mut held = self.held();
        if held.is_some() {
            tracing::debug!("Claim denied: this process already holds the monitor lease");
            return false;
        }

        let _guard = match ClaimGuard::acquire(&self.lease_path) {
            Ok(guard) => guard,
            Err(err) => {
                tracing::error!(error = %err, "Claim denied: cannot lock claim guard");
                return false;
            }
        };

        if self.live_holder_exists() {
            return false;
        }

        let lease = LeaseRecord::new(
            std::process::id(),
            self.role.clone(),
            own_start_time(self.probe.as_ref()),
        );
        if let Err(err) = write_lease(&self.lease_path, &lease) {
            tracing::error!(error = %err, "Claim denied: cannot write monitor lease");
            return false;
        }

        tracing::info!(
            pid = lease.pid,
            path = %self.lease_path.display(),
            "Monitor lease claimed"
        );
        *held = Some(lease);
        true
    }

    /// Deletes the lease if it is still ours. Best-effort; safe to repeat.
    pub fn release(&self) -> bool {
        let Some(ours) = self.held().take() else {
            return false;
        };

        // Re-read before trusting: only remove the lease we wrote.
        match read_lease(&self.lease_path) {
            Ok(Some(current)) if current.instance == ours.instance => {
                if let Err(err) = remove_lease(&self.lease_path) {
                    tracing::warn!(error = %err, "Failed to remove monitor lease");
                    return false;
                }
                tracing::info!(path = %self.lease_path.display(), "Monitor lease released");
                true
            }
            Ok(Some(current)) => {
                tracing::warn!(pid = current.pid, "Monitor lease now owned elsewhere; left in place");
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(error = %err, "Monitor lease unreadable at release");
                false
            }
        }
    }

    /// Heartbeat self-check: rewrites our lease if it vanished.
    /// Returns false when another live holder has taken over.
    pub fn reassert(&self) -> bool {
        let held = self.held();
        let Some(ours) = held.as_ref() else {
            return false;
        };

        match read_lease(&self.lease_path) {
            Ok(Some(current)) if current.instance == ours.instance => true,
            Ok(Some(current)) if current.is_live(self.probe.as_ref(), &self.monitor_arg) => {
                tracing::warn!(pid = current.pid, "Another monitor holds the lease");
                false
            }
            _ => match write_lease(&self.lease_path, ours) {
                Ok(()) => {
                    tracing::warn!("Monitor lease was missing or stale; rewritten");
                    true
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to rewrite monitor lease");
                    true
                }
            },
        }
    }

    /// Steps 2 and 3 of the claim protocol. Deletes stale leases.
    fn live_holder_exists(&self) -> bool {
        match read_lease(&self.lease_path) {
            Ok(Some(existing)) => {
                if existing.is_live(self.probe.as_ref(), &self.monitor_arg) {
                    tracing::info!(pid = existing.pid, "Claim denied: monitor already running");
                    return true;
                }
                tracing::info!(pid = existing.pid, "Removing stale monitor lease");
                if let Err(err) = remove_lease(&self.lease_path) {
                    tracing::warn!(error = %err, "Failed to remove stale monitor lease");
                }
            }
            Ok(None) => {}
            Err(PrintdropError::LeaseMalformed { details, .. }) => {
                tracing::warn!(details = %details, "Removing malformed monitor lease");
                let _ = remove_lease(&self.lease_path);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Claim denied: monitor lease unreadable");
                return true;
            }
        }

        if let Some(exe_name) = &self.exe_name {
            if let Some(pid) = self.senior_peer(exe_name) {
                tracing::info!(pid, "Claim denied: older peer monitor process found");
                return true;
            }
        }
        false
    }

    /// A peer monitor that outranks this process (see [`outranks`]). Peers
    /// that exit mid-scan have no start time and are ignored.
    fn senior_peer(&self, exe_name: &str) -> Option<u32> {
        let own = (own_start_time(self.probe.as_ref()), std::process::id());
        self.probe
            .find_peers(exe_name, &self.monitor_arg)
            .into_iter()
            .filter_map(|pid| self.probe.start_time(pid).map(|started| (started, pid)))
            .filter(|(started, pid)| outranks((Some(*started), *pid), own))
            .min()
            .map(|(_, pid)| pid)
    }

    fn held(&self) -> MutexGuard<'_, Option<LeaseRecord>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// True when process `a` (start time, pid) has precedence over `b`: it
/// started earlier, or in the same second with a lower pid. An unknown start
/// time ranks last. Racing monitors each see the other, so exactly one of any
/// two distinct processes outranks the other.
fn outranks(a: (Option<u64>, u32), b: (Option<u64>, u32)) -> bool {
    let rank = |(started, pid): (Option<u64>, u32)| (started.unwrap_or(u64::MAX), pid);
    rank(a) < rank(b)
}

impl Drop for SingleInstanceCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}
