//! # printdrop-core
//!
//! Print-capture pipeline: turns "a user printed to the virtual printer" into
//! "the PDF landed in the document-management system."
//!
//! ## Design Principles
//!
//! - **Synchronous**: std threads and channels, no async runtime.
//! - **Explicit components**: the monitor service builds every component once
//!   and hands it to its collaborators. No process-wide singletons.
//! - **Never lose a file**: a handoff that cannot complete leaves a
//!   pending-handoff lease behind for the next attempt.
//! - **Background threads never unwind**: component errors are logged and
//!   swallowed; only upload failures reach an explicit caller.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use printdrop_core::*;
//!
//! let storage = StorageConfig::default();
//! let config = load_config(None, &storage)?;
//! let service = BackgroundMonitorService::new(&storage, &config, collaborators)?;
//! match service.start()? {
//!     StartOutcome::Started => { /* watching */ }
//!     _ => { /* another monitor already serves this user */ }
//! }
//! ```

// Public modules
pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handoff;
pub mod launcher;
pub mod pending;
pub mod registry;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod types;
pub mod upload;
pub mod watcher;

// Re-export commonly used items at crate root
pub use backoff::{startup_delay, RestartPolicy, StartHistory};
pub use config::{load_config, MonitorConfig, MONITOR_ARG, PENDING_ARG};
pub use coordinator::SingleInstanceCoordinator;
pub use error::{PrintdropError, Result, UploadError};
pub use handoff::form::{FormHandle, FormHost, FormSlot, InteractiveForm, UiThread};
pub use handoff::{
    discard_backup, CandidateSink, DestinationPrompt, DocumentHandoffPipeline, HandoffCollaborators,
};
pub use launcher::{InteractiveLauncher, SelfRelauncher};
pub use pending::PendingHandoffStore;
pub use registry::ProcessedFileRegistry;
pub use service::{BackgroundMonitorService, MonitorStatus, StartOutcome};
pub use session::{SessionProvider, SharedSession, StoredSession};
pub use storage::StorageConfig;
pub use types::*;
pub use upload::{HttpUploadGateway, UploadGateway};
pub use watcher::{OutputFolderWatcher, WatcherTiming};
