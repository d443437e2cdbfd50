//! In-memory record of files that have already been handled.
//!
//! The set is seeded from a directory scan at startup, so documents that were
//! already sitting in a watched folder are never re-handled. It is not
//! persisted: after a restart the next seed scan marks the old files again.
//!
//! [`ProcessedFileRegistry::try_claim`] is the single dedup gate for the whole
//! pipeline. Event and poll detections of the same path race through it and
//! exactly one wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

use crate::types::WatchedFolder;

#[derive(Debug, Default)]
pub struct ProcessedFileRegistry {
    processed: Mutex<HashSet<String>>,
}

/// Comparison key for a path: absolute, and case-folded on platforms whose
/// filesystems are case-insensitive by default.
fn path_key(path: &Path) -> String {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let key = absolute.to_string_lossy().into_owned();
    if cfg!(any(windows, target_os = "macos")) {
        key.to_lowercase()
    } else {
        key
    }
}

impl ProcessedFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every matching file currently in `folder` as processed.
    /// Returns how many files were newly marked. A missing folder seeds nothing.
    pub fn seed(&self, folder: &WatchedFolder) -> usize {
        let entries = match fs_err::read_dir(folder.path()) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(
                    folder = %folder.path().display(),
                    error = %err,
                    "Seed scan skipped"
                );
                return 0;
            }
        };

        let mut seeded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && folder.matches(&path) && self.mark_processed(&path) {
                seeded += 1;
            }
        }
        tracing::info!(
            folder = %folder.path().display(),
            seeded,
            "Seeded pre-existing files as processed"
        );
        seeded
    }

    pub fn is_processed(&self, path: &Path) -> bool {
        let key = path_key(path);
        self.lock().contains(&key)
    }

    /// Idempotent insert. Returns true when the path was not yet recorded.
    pub fn mark_processed(&self, path: &Path) -> bool {
        let key = path_key(path);
        self.lock().insert(key)
    }

    /// Atomic check-then-mark: true for exactly one caller per path.
    pub fn try_claim(&self, path: &Path) -> bool {
        self.mark_processed(path)
    }

    /// Operator reset: the path becomes eligible for automatic processing again.
    pub fn forget(&self, path: &Path) -> bool {
        let key = path_key(path);
        self.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True when the file can be opened for shared reading right now.
    ///
    /// A writer that still holds the file (an open exclusive handle on Windows,
    /// an exclusive advisory lock elsewhere) makes this false. Missing files
    /// are also not ready. Never blocks.
    pub fn is_ready(&self, path: &Path) -> bool {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return false,
        };
        if !file.metadata().map(|meta| meta.is_file()).unwrap_or(false) {
            return false;
        }
        match file.try_lock_shared() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                true
            }
            Err(_) => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set.
        self.processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_mark_processed_is_idempotent() {
        let registry = ProcessedFileRegistry::new();
        let path = Path::new("/capture/a.pdf");
        assert!(!registry.is_processed(path));
        assert!(registry.mark_processed(path));
        assert!(!registry.mark_processed(path));
        assert!(registry.is_processed(path));
        assert_eq!(registry.len(), 1);
    }

    #[cfg(any(windows, target_os = "macos"))]
    #[test]
    fn test_membership_ignores_case_on_case_insensitive_hosts() {
        let registry = ProcessedFileRegistry::new();
        registry.mark_processed(Path::new("/capture/Invoice.PDF"));
        assert!(registry.is_processed(Path::new("/capture/invoice.pdf")));
    }

    #[test]
    fn test_seed_marks_existing_matching_files_only() {
        let temp = tempdir().unwrap();
        fs_err::write(temp.path().join("old.pdf"), b"%PDF").unwrap();
        fs_err::write(temp.path().join("notes.txt"), b"x").unwrap();
        let folder = WatchedFolder::new(temp.path(), "*.pdf").unwrap();

        let registry = ProcessedFileRegistry::new();
        assert_eq!(registry.seed(&folder), 1);
        assert!(registry.is_processed(&temp.path().join("old.pdf")));
        assert!(!registry.is_processed(&temp.path().join("notes.txt")));
        // Seeding again finds nothing new.
        assert_eq!(registry.seed(&folder), 0);
    }

    #[test]
    fn test_seed_of_missing_folder_is_empty() {
        let temp = tempdir().unwrap();
        let folder = WatchedFolder::new(temp.path().join("missing"), "*.pdf").unwrap();
        assert_eq!(ProcessedFileRegistry::new().seed(&folder), 0);
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let registry = Arc::new(ProcessedFileRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.try_claim(Path::new("/capture/race.pdf")))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_forget_re_enables_processing() {
        let registry = ProcessedFileRegistry::new();
        let path = Path::new("/capture/a.pdf");
        registry.mark_processed(path);
        assert!(registry.forget(path));
        assert!(registry.try_claim(path));
    }

    #[test]
    fn test_is_ready_tracks_writer_lock() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("printing.pdf");
        let writer = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .unwrap();
        writer.lock_exclusive().unwrap();

        let registry = ProcessedFileRegistry::new();
        assert!(!registry.is_ready(&path));

        FileExt::unlock(&writer).unwrap();
        drop(writer);
        assert!(registry.is_ready(&path));
    }

    #[test]
    fn test_is_ready_false_for_missing_file() {
        let temp = tempdir().unwrap();
        assert!(!ProcessedFileRegistry::new().is_ready(&temp.path().join("gone.pdf")));
    }
}
