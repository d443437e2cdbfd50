//! Monitor configuration loaded from `printdrop.toml`.
//!
//! Every section is optional; a missing file yields [`MonitorConfig::default`].
//!
//! ```toml
//! [watch]
//! folders = ["C:/PrintDrop/Capture"]
//! filter = "*.pdf"
//! poll_interval_ms = 2000
//! settle_delay_ms = 1000
//!
//! [handoff]
//! form_ready_timeout_ms = 10000
//!
//! [monitor]
//! heartbeat_secs = 60
//! restart_burst = 3
//! restart_window_secs = 120
//!
//! [upload]
//! endpoint = "https://dms.example.com/api/documents"
//!
//! [upload.default_destination]
//! cabinet_id = "12"
//! category_id = "7"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::RestartPolicy;
use crate::error::{PrintdropError, Result};
use crate::storage::StorageConfig;
use crate::types::{Destination, WatchedFolder};

/// Command-line argument that marks a process as the background monitor.
pub const MONITOR_ARG: &str = "--background-monitor";
/// Command-line argument that opens the interactive flow with a pending file.
pub const PENDING_ARG: &str = "--pending";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Extra folders. The capture folder is always watched.
    pub folders: Vec<PathBuf>,
    pub include_documents_folder: bool,
    pub filter: String,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            include_documents_folder: true,
            filter: "*.pdf".to_string(),
            poll_interval_ms: 2_000,
            settle_delay_ms: 1_000,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub form_ready_timeout_ms: u64,
    pub form_ready_poll_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            form_ready_timeout_ms: 10_000,
            form_ready_poll_ms: 200,
        }
    }
}

impl HandoffConfig {
    pub fn form_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.form_ready_timeout_ms)
    }

    pub fn form_ready_poll(&self) -> Duration {
        Duration::from_millis(self.form_ready_poll_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub heartbeat_secs: u64,
    /// Role recorded in the monitor lease.
    pub role: String,
    /// Whether claims also scan running processes for a peer monitor.
    pub scan_peers: bool,
    /// Starts allowed inside `restart_window_secs` before delays kick in.
    pub restart_burst: usize,
    pub restart_window_secs: u64,
    /// First delay; each further start in the window doubles it.
    pub restart_delay_secs: u64,
    pub restart_delay_max_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            role: "background-monitor".to_string(),
            scan_peers: true,
            restart_burst: 3,
            restart_window_secs: 120,
            restart_delay_secs: 5,
            restart_delay_max_secs: 60,
        }
    }
}

impl MonitorSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            burst: self.restart_burst,
            window: Duration::from_secs(self.restart_window_secs),
            delay: Duration::from_secs(self.restart_delay_secs),
            max_delay: Duration::from_secs(self.restart_delay_max_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    /// Destination used by the headless path when nobody can be prompted.
    pub default_destination: Option<Destination>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 300,
            default_destination: None,
        }
    }
}

impl MonitorConfig {
    /// Builds the watched-folder list: capture folder, optional documents
    /// subfolder, then any configured extras. Duplicates are dropped.
    pub fn watched_folders(&self, storage: &StorageConfig) -> Result<Vec<WatchedFolder>> {
        let mut paths = vec![storage.capture_dir()];
        if self.watch.include_documents_folder {
            if let Some(documents) = StorageConfig::documents_capture_dir() {
                paths.push(documents);
            }
        }
        paths.extend(self.watch.folders.iter().cloned());

        let mut folders: Vec<WatchedFolder> = Vec::new();
        for path in paths {
            if folders.iter().any(|folder| folder.path() == path) {
                continue;
            }
            folders.push(WatchedFolder::new(path, &self.watch.filter)?);
        }
        Ok(folders)
    }
}

/// Loads configuration from `path`, or from the default location when `None`.
/// A missing file is not an error.
pub fn load_config(path: Option<&Path>, storage: &StorageConfig) -> Result<MonitorConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => storage.config_file(),
    };

    if !config_path.exists() {
        return Ok(MonitorConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| PrintdropError::io("read config", err))?;
    toml::from_str::<MonitorConfig>(&content).map_err(|err| PrintdropError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp = tempfile::tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let config = load_config(None, &storage).unwrap();
        assert_eq!(config.watch.filter, "*.pdf");
        assert_eq!(config.watch.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.handoff.form_ready_timeout(), Duration::from_secs(10));
        assert_eq!(config.monitor.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.monitor.restart_policy().burst, 3);
        assert!(config.upload.default_destination.is_none());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("printdrop.toml");
        fs_err::write(
            &path,
            r#"
[watch]
folders = ["/srv/scans"]
include_documents_folder = false
settle_delay_ms = 250

[upload]
endpoint = "http://localhost:9000/upload"

[upload.default_destination]
cabinet_id = "12"
category_id = "7"
title = "Scan"
"#,
        )
        .unwrap();

        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let config = load_config(Some(&path), &storage).unwrap();
        assert_eq!(config.watch.settle_delay(), Duration::from_millis(250));
        assert_eq!(config.watch.poll_interval_ms, 2_000);
        assert_eq!(
            config.upload.endpoint.as_deref(),
            Some("http://localhost:9000/upload")
        );
        let destination = config.upload.default_destination.clone().unwrap();
        assert_eq!(destination.cabinet_id, "12");
        assert_eq!(destination.subcategory_id, None);

        let folders = config.watched_folders(&storage).unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].path(), storage.capture_dir());
        assert_eq!(folders[1].path(), Path::new("/srv/scans"));
    }

    #[test]
    fn load_config_reports_malformed_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("printdrop.toml");
        fs_err::write(&path, "[watch\nfilter = 3").unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let err = load_config(Some(&path), &storage).unwrap_err();
        assert!(matches!(err, PrintdropError::ConfigMalformed { .. }));
    }
}
