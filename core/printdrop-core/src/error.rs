//! Error types for printdrop-core operations.
//!
//! Background components (watcher, heartbeat, pipeline workers) log and swallow
//! these; only [`UploadError`] crosses back to an explicit caller.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Core Error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur in printdrop-core plumbing.
#[derive(Debug, thiserror::Error)]
pub enum PrintdropError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid file filter {pattern:?}: {details}")]
    InvalidFilter { pattern: String, details: String },

    #[error("No per-user directory available for {0}")]
    NoUserDirectory(&'static str),

    // ─────────────────────────────────────────────────────────────────────
    // Lease Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Lease record malformed: {path}: {details}")]
    LeaseMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Watcher Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("File watcher failed: {0}")]
    Watch(#[from] notify::Error),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PrintdropError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PrintdropError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using PrintdropError.
pub type Result<T> = std::result::Result<T, PrintdropError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Upload Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an upload did not succeed. Never retried by the gateway itself.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The source file vanished before any network call was attempted.
    #[error("Source file missing: {0}")]
    MissingFile(PathBuf),

    #[error("No authenticated session")]
    NoSession,

    #[error("Server rejected upload ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid upload request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Network(err.to_string())
    }
}

impl From<UploadError> for String {
    fn from(err: UploadError) -> String {
        err.to_string()
    }
}

impl From<PrintdropError> for String {
    fn from(err: PrintdropError) -> String {
        err.to_string()
    }
}
