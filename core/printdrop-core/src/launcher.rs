//! Starting a new interactive process for a queued document.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use crate::config::PENDING_ARG;

pub trait InteractiveLauncher: Send + Sync {
    /// Starts an interactive process that will consume the pending lease for `file`.
    fn launch_with_pending(&self, file: &Path) -> std::io::Result<()>;
}

/// Re-launches the current executable with `--pending <file>`.
#[derive(Debug, Clone, Default)]
pub struct SelfRelauncher {
    exe: Option<PathBuf>,
}

impl SelfRelauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches `exe` instead of the current executable.
    pub fn with_executable(exe: PathBuf) -> Self {
        Self { exe: Some(exe) }
    }
}

impl SelfRelauncher {
    /// Spawns the interactive process and a detached thread that waits on it,
    /// so a long-running monitor never accumulates zombies. The handle yields
    /// the exit status; dropping it is fine.
    pub fn launch(&self, file: &Path) -> std::io::Result<Option<JoinHandle<Option<ExitStatus>>>> {
        let exe = match &self.exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()?,
        };
        let mut child = Command::new(&exe)
            .arg(PENDING_ARG)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();
        tracing::info!(
            pid,
            exe = %exe.display(),
            file = %file.display(),
            "Launched interactive process"
        );

        let reaper = thread::Builder::new()
            .name("printdrop-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => {
                    tracing::debug!(pid, status = %status, "Interactive process exited");
                    Some(status)
                }
                Err(err) => {
                    tracing::warn!(pid, error = %err, "Failed to wait for interactive process");
                    None
                }
            });
        match reaper {
            Ok(handle) => Ok(Some(handle)),
            Err(err) => {
                tracing::warn!(pid, error = %err, "Cannot spawn reaper; child left unreaped");
                Ok(None)
            }
        }
    }
}

impl InteractiveLauncher for SelfRelauncher {
    fn launch_with_pending(&self, file: &Path) -> std::io::Result<()> {
        self.launch(file).map(|_| ())
    }
}
