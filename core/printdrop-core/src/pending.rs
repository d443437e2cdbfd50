//! Pending handoffs: files waiting for a form, a session, or an interactive
//! process.
//!
//! One lease per file under the `pending-handoff/` directory, named
//! `<ulid>.json`, with the file path as the lease subject. Written when a file
//! cannot be finished right now (no form, form not ready, upload failed).
//! Removed by whoever completes the file; removal doubles as the claim, so two
//! processes never both act on the same entry.
//!
//! Older installs kept a single lease (or a plain-text path) at the directory's
//! location. That file is still read, and is migrated into the directory on the
//! next write.

use std::path::{Path, PathBuf};

use crate::coordinator::lease::{read_lease, write_lease, LeaseRecord};
use crate::error::{PrintdropError, Result};

const PENDING_ROLE: &str = "pending-handoff";
const LEASE_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct PendingHandoffStore {
    dir: PathBuf,
}

/// One pending file and the lease that records it.
#[derive(Debug)]
struct Entry {
    lease_file: PathBuf,
    file: PathBuf,
    created: u64,
}

impl PendingHandoffStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records `file` as pending. A file already pending is left as is.
    pub fn write(&self, file: &Path) -> Result<()> {
        self.migrate_legacy()?;
        if self.contains(file)? {
            return Ok(());
        }
        let lease = LeaseRecord::new(std::process::id(), PENDING_ROLE, None)
            .with_subject(file.to_string_lossy());
        let name = format!("{}.{}", ulid::Ulid::new(), LEASE_EXTENSION);
        write_lease(&self.dir.join(name), &lease)?;
        tracing::info!(file = %file.display(), "Pending handoff recorded");
        Ok(())
    }

    /// Every pending file, oldest first. Never cached: callers re-read.
    pub fn peek_all(&self) -> Result<Vec<PathBuf>> {
        Ok(self.entries()?.into_iter().map(|entry| entry.file).collect())
    }

    /// The oldest pending file, if any.
    pub fn peek(&self) -> Result<Option<PathBuf>> {
        Ok(self.peek_all()?.into_iter().next())
    }

    pub fn contains(&self, file: &Path) -> Result<bool> {
        Ok(self.entries()?.iter().any(|entry| entry.file == file))
    }

    /// Removes the entries naming `file`. True only when this call removed
    /// one; a concurrent remover sees false and must leave the file alone.
    pub fn clear_if(&self, file: &Path) -> Result<bool> {
        let mut removed = false;
        for entry in self.entries()?.into_iter().filter(|entry| entry.file == file) {
            removed |= remove_entry(&entry.lease_file)?;
        }
        Ok(removed)
    }

    /// Operator reset. Returns the files that were dropped.
    pub fn clear(&self) -> Result<Vec<PathBuf>> {
        let mut dropped = Vec::new();
        for entry in self.entries()? {
            if remove_entry(&entry.lease_file)? {
                dropped.push(entry.file);
            }
        }
        Ok(dropped)
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let metadata = match fs_err::metadata(&self.dir) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PrintdropError::io("stat pending handoffs", err)),
        };
        if metadata.is_file() {
            return Ok(read_legacy(&self.dir)?.into_iter().collect());
        }

        let listing = fs_err::read_dir(&self.dir)
            .map_err(|err| PrintdropError::io("list pending handoffs", err))?;
        let mut entries: Vec<Entry> = listing
            .filter_map(|item| item.ok().map(|item| item.path()))
            .filter(|path| is_lease_file(path))
            .filter_map(|path| match read_entry(&path) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable pending lease");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.lease_file.cmp(&b.lease_file))
        });
        Ok(entries)
    }

    /// Moves a single-slot marker into the per-file directory.
    fn migrate_legacy(&self) -> Result<()> {
        if !self.dir.is_file() {
            return Ok(());
        }
        let legacy = read_legacy(&self.dir)?;
        remove_entry(&self.dir)?;
        fs_err::create_dir_all(&self.dir)
            .map_err(|err| PrintdropError::io("create pending dir", err))?;
        if let Some(entry) = legacy {
            tracing::info!(file = %entry.file.display(), "Migrating single-slot pending marker");
            let lease = LeaseRecord::new(std::process::id(), PENDING_ROLE, None)
                .with_subject(entry.file.to_string_lossy());
            let name = format!("{}.{}", ulid::Ulid::new(), LEASE_EXTENSION);
            write_lease(&self.dir.join(name), &lease)?;
        }
        Ok(())
    }
}

// Temp files from in-progress writes start with a dot.
fn is_lease_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .is_some_and(|name| !name.to_string_lossy().starts_with('.'));
    visible && path.extension().is_some_and(|ext| ext == LEASE_EXTENSION)
}

fn read_entry(lease_file: &Path) -> Result<Option<Entry>> {
    let Some(lease) = read_lease(lease_file)? else {
        return Ok(None);
    };
    Ok(lease.subject.map(|subject| Entry {
        lease_file: lease_file.to_path_buf(),
        file: PathBuf::from(subject),
        created: lease.created.unwrap_or(0),
    }))
}

/// A single-slot marker: a lease, or just the path as plain text.
fn read_legacy(marker: &Path) -> Result<Option<Entry>> {
    match read_entry(marker) {
        Err(PrintdropError::LeaseMalformed { .. }) => {
            let content = fs_err::read_to_string(marker)
                .map_err(|err| PrintdropError::io("read pending marker", err))?;
            let trimmed = content.trim();
            Ok((!trimmed.is_empty()).then(|| Entry {
                lease_file: marker.to_path_buf(),
                file: PathBuf::from(trimmed),
                created: 0,
            }))
        }
        other => other,
    }
}

/// True when this call deleted the lease.
fn remove_entry(lease_file: &Path) -> Result<bool> {
    match fs_err::remove_file(lease_file) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(PrintdropError::io("remove pending lease", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(temp: &tempfile::TempDir) -> PendingHandoffStore {
        PendingHandoffStore::new(temp.path().join("pending-handoff"))
    }

    #[test]
    fn test_write_peek_clear_if() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        assert!(store.peek().unwrap().is_none());

        store.write(Path::new("/capture/a.pdf")).unwrap();
        assert_eq!(store.peek().unwrap(), Some(PathBuf::from("/capture/a.pdf")));
        assert!(store.clear_if(Path::new("/capture/a.pdf")).unwrap());
        assert!(store.peek().unwrap().is_none());
        assert!(!store.clear_if(Path::new("/capture/a.pdf")).unwrap());
    }

    #[test]
    fn test_second_file_does_not_displace_first() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        store.write(Path::new("/capture/a.pdf")).unwrap();
        store.write(Path::new("/capture/b.pdf")).unwrap();

        let pending = store.peek_all().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&PathBuf::from("/capture/a.pdf")));
        assert!(pending.contains(&PathBuf::from("/capture/b.pdf")));

        assert!(store.clear_if(Path::new("/capture/b.pdf")).unwrap());
        assert_eq!(store.peek_all().unwrap(), vec![PathBuf::from("/capture/a.pdf")]);
    }

    #[test]
    fn test_rewriting_same_file_keeps_one_entry() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        store.write(Path::new("/capture/a.pdf")).unwrap();
        store.write(Path::new("/capture/a.pdf")).unwrap();
        assert_eq!(store.peek_all().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        store.write(Path::new("/capture/a.pdf")).unwrap();
        store.write(Path::new("/capture/b.pdf")).unwrap();
        assert_eq!(store.clear().unwrap().len(), 2);
        assert!(store.peek_all().unwrap().is_empty());
    }

    #[test]
    fn test_stray_files_in_dir_are_ignored() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        store.write(Path::new("/capture/a.pdf")).unwrap();
        fs_err::write(store.dir().join(".tmpXYZ"), b"{").unwrap();
        fs_err::write(store.dir().join("notes.txt"), b"hello").unwrap();
        fs_err::write(store.dir().join("broken.json"), b"{not json").unwrap();
        assert_eq!(store.peek_all().unwrap(), vec![PathBuf::from("/capture/a.pdf")]);
    }

    #[test]
    fn test_plain_text_marker_is_read_and_migrated() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        fs_err::write(store.dir(), "/capture/old style.pdf\n").unwrap();
        assert_eq!(
            store.peek().unwrap(),
            Some(PathBuf::from("/capture/old style.pdf"))
        );

        store.write(Path::new("/capture/new.pdf")).unwrap();
        assert!(store.dir().is_dir());
        let pending = store.peek_all().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&PathBuf::from("/capture/old style.pdf")));
    }

    #[test]
    fn test_single_slot_lease_is_cleared_in_place() {
        let temp = tempdir().unwrap();
        let store = store(&temp);
        let lease = LeaseRecord::new(1, PENDING_ROLE, None).with_subject("/capture/slot.pdf");
        write_lease(store.dir(), &lease).unwrap();

        assert!(store.clear_if(Path::new("/capture/slot.pdf")).unwrap());
        assert!(!store.dir().exists());
    }
}
