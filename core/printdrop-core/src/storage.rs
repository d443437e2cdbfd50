//! Storage configuration and path management for printdrop.
//!
//! `StorageConfig` is the single place that decides where printdrop keeps its
//! files. Production code uses `StorageConfig::default()`; tests inject temp
//! directories with `StorageConfig::with_root()`.
//!
//! ## Layout
//!
//! ```text
//! {runtime}/                 per-user temp dir, e.g. /tmp/printdrop
//! ├── monitor-running        lease: the live background monitor
//! ├── monitor-running.guard  advisory lock serializing claims
//! ├── pending-handoff/       one {ulid}.json lease per file not yet handed off
//! └── backup/{ulid}/{name}   isolated copies, removed once handed off
//! {data}/                    e.g. ~/.local/share/printdrop
//! ├── capture/               well-known virtual printer output folder
//! ├── logs/                  rolling log files
//! └── monitor-backoff.json   recent monitor start timestamps
//! {config}/                  e.g. ~/.config/printdrop
//! ├── printdrop.toml
//! └── session-token
//! ```

use std::path::{Path, PathBuf};

const APP_DIR: &str = "printdrop";

/// Central configuration for all printdrop storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Volatile per-user state: lease markers and backup copies.
    runtime_root: PathBuf,
    /// Durable per-user data: capture folder, logs, backoff state.
    data_root: PathBuf,
    /// User-editable configuration.
    config_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let temp = std::env::temp_dir().join(APP_DIR);
        let data_root = dirs::data_local_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| temp.join("data"));
        let config_root = dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| temp.join("config"));
        Self {
            runtime_root: temp,
            data_root,
            config_root,
        }
    }
}

impl StorageConfig {
    /// Places every root under a single directory. Used for testing with temp dirs.
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            runtime_root: root.join("runtime"),
            data_root: root.join("data"),
            config_root: root.join("config"),
        }
    }

    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Lease Markers
    // ─────────────────────────────────────────────────────────────────────────────

    /// Lease naming the live background monitor.
    pub fn monitor_lease_file(&self) -> PathBuf {
        self.runtime_root.join("monitor-running")
    }

    /// One lease per file waiting for a form, a session or an interactive process.
    pub fn pending_dir(&self) -> PathBuf {
        self.runtime_root.join("pending-handoff")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.runtime_root.join("backup")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Data
    // ─────────────────────────────────────────────────────────────────────────────

    /// The fixed, well-known folder the virtual printer writes into.
    pub fn capture_dir(&self) -> PathBuf {
        self.data_root.join("capture")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn backoff_file(&self) -> PathBuf {
        self.data_root.join("monitor-backoff.json")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_file(&self) -> PathBuf {
        self.config_root.join("printdrop.toml")
    }

    pub fn session_token_file(&self) -> PathBuf {
        self.config_root.join("session-token")
    }

    /// Platform documents folder used as a second capture location.
    pub fn documents_capture_dir() -> Option<PathBuf> {
        dirs::document_dir().map(|dir| dir.join(APP_DIR))
    }

    /// Ensures the runtime and data roots exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(&self.runtime_root)?;
        fs_err::create_dir_all(self.backup_dir())?;
        fs_err::create_dir_all(&self.data_root)?;
        Ok(())
    }
}
