//! Value types shared across the capture pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::error::{PrintdropError, Result};

const FILTER_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A directory plus the file-name filter applied to its direct children.
///
/// Immutable once built; the monitor service owns the list for its lifetime.
#[derive(Debug, Clone)]
pub struct WatchedFolder {
    path: PathBuf,
    filter: Pattern,
}

impl WatchedFolder {
    pub fn new(path: impl Into<PathBuf>, filter: &str) -> Result<Self> {
        let filter = Pattern::new(filter).map_err(|err| PrintdropError::InvalidFilter {
            pattern: filter.to_string(),
            details: err.to_string(),
        })?;
        Ok(Self {
            path: path.into(),
            filter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filter(&self) -> &str {
        self.filter.as_str()
    }

    /// Same folder with its path canonicalized, so paths reported by native
    /// watchers (which resolve symlinks) compare equal to polled paths.
    /// Falls back to the configured path when the folder cannot be resolved.
    pub fn resolved(&self) -> Self {
        let path = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        Self {
            path,
            filter: self.filter.clone(),
        }
    }

    /// True when `path` sits directly in this folder and its name passes the filter.
    /// Filter matching ignores case (`INVOICE.PDF` matches `*.pdf`).
    pub fn matches(&self, path: &Path) -> bool {
        if path.parent() != Some(self.path.as_path()) {
            return false;
        }
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.filter.matches_with(name, FILTER_MATCH))
    }
}

/// Which detection path noticed a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    Event,
    Poll,
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionSource::Event => f.write_str("event"),
            DetectionSource::Poll => f.write_str("poll"),
        }
    }
}

/// A detected file. Transient: produced by the watcher, consumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub detected_at: SystemTime,
    pub source: DetectionSource,
}

impl CandidateFile {
    pub fn new(path: impl Into<PathBuf>, source: DetectionSource) -> Self {
        Self {
            path: path.into(),
            detected_at: SystemTime::now(),
            source,
        }
    }
}

/// Where an uploaded document lands in the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub cabinet_id: String,
    pub category_id: String,
    #[serde(default)]
    pub subcategory_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Everything needed for one upload call. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub file_path: PathBuf,
    pub destination: Destination,
    pub auth_token: String,
}

impl UploadRequest {
    /// Title sent with the upload; defaults to the file stem.
    pub fn effective_title(&self) -> String {
        self.destination
            .title
            .clone()
            .filter(|title| !title.trim().is_empty())
            .or_else(|| {
                self.file_path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_default()
    }
}

/// Successful upload acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    pub body: String,
}

/// Pipeline states. Terminal states are the `HandoffOutcome` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Detected,
    BackupCopied,
    RouteDecision,
}

/// Terminal result of driving one file through the handoff pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// An open interactive form accepted the file, or a destination prompt
    /// completed and the upload succeeded.
    InteractiveDelivered,
    /// No form and no session: a pending lease was written and an interactive
    /// process launched to pick it up.
    InteractiveQueued,
    /// Uploaded without any user interaction using the default destination.
    HeadlessUploaded,
    /// The operator cancelled the destination prompt; treated as an explicit skip.
    Dismissed,
    /// Timed out or errored; a pending lease was written for a later retry.
    Failed { reason: String },
}

impl HandoffOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            HandoffOutcome::InteractiveDelivered | HandoffOutcome::HeadlessUploaded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_folder_matches_direct_children_case_insensitively() {
        let folder = WatchedFolder::new("/capture", "*.pdf").unwrap();
        assert!(folder.matches(Path::new("/capture/invoice.pdf")));
        assert!(folder.matches(Path::new("/capture/INVOICE.PDF")));
        assert!(!folder.matches(Path::new("/capture/invoice.txt")));
        assert!(!folder.matches(Path::new("/capture/nested/invoice.pdf")));
        assert!(!folder.matches(Path::new("/elsewhere/invoice.pdf")));
    }

    #[test]
    fn invalid_filter_is_rejected() {
        assert!(WatchedFolder::new("/capture", "[").is_err());
    }

    #[test]
    fn effective_title_falls_back_to_file_stem() {
        let request = UploadRequest {
            file_path: PathBuf::from("/tmp/invoice.pdf"),
            destination: Destination {
                cabinet_id: "1".into(),
                category_id: "2".into(),
                subcategory_id: None,
                title: Some("  ".into()),
                description: None,
            },
            auth_token: "t".into(),
        };
        assert_eq!(request.effective_title(), "invoice");
    }
}
