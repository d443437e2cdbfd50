//! Lease records: small JSON files that say "process X holds role Y".
//!
//! # Format
//!
//! ```json
//! { "pid": 4242, "role": "background-monitor", "proc_started": 1760860000,
//!   "created": 1760860001234, "instance": "01JA...", "subject": null }
//! ```
//!
//! A bare pid (`"4242"`) is also accepted; such legacy leases carry no start
//! time and expire after 24 hours.
//!
//! # Staleness
//!
//! - Lease with `proc_started`: live iff the pid exists and its start time
//!   matches (PID reuse produces a different start time).
//! - Legacy lease: live iff the pid exists, its command line carries the role
//!   argument, and the lease is younger than [`LEGACY_MAX_AGE_MS`].
//!
//! Writes go through a temp file + rename so readers never see half a record.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::process::ProcessProbe;
use crate::error::{PrintdropError, Result};

/// Legacy leases older than this are stale regardless of pid.
pub const LEGACY_MAX_AGE_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub pid: u32,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub proc_started: Option<u64>,
    /// Creation time in epoch milliseconds.
    #[serde(default)]
    pub created: Option<u64>,
    /// Unique per holder; distinguishes holders sharing one pid.
    #[serde(default)]
    pub instance: Option<String>,
    /// What the lease is about (a file path for pending handoffs).
    #[serde(default)]
    pub subject: Option<String>,
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl LeaseRecord {
    pub fn new(pid: u32, role: impl Into<String>, proc_started: Option<u64>) -> Self {
        Self {
            pid,
            role: role.into(),
            proc_started,
            created: Some(now_ms()),
            instance: Some(ulid::Ulid::new().to_string()),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Whether the recorded holder is still running.
    /// `legacy_arg` is the command-line argument a legacy holder must carry.
    pub fn is_live(&self, probe: &dyn ProcessProbe, legacy_arg: &str) -> bool {
        match self.proc_started {
            Some(started) => probe.is_same_process(self.pid, started),
            None => {
                let age_ms = self
                    .created
                    .map(|created| now_ms().saturating_sub(created))
                    .unwrap_or(LEGACY_MAX_AGE_MS + 1);
                age_ms <= LEGACY_MAX_AGE_MS && probe.carries_arg(self.pid, legacy_arg)
            }
        }
    }
}

/// Reads a lease. `Ok(None)` when the file does not exist.
pub fn read_lease(path: &Path) -> Result<Option<LeaseRecord>> {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PrintdropError::io("read lease", err)),
    };
    parse_lease(path, &content).map(Some)
}

fn parse_lease(path: &Path, content: &str) -> Result<LeaseRecord> {
    let trimmed = content.trim();
    if let Ok(pid) = trimmed.parse::<u32>() {
        let created = legacy_created_ms(path);
        return Ok(LeaseRecord {
            pid,
            role: String::new(),
            proc_started: None,
            created,
            instance: None,
            subject: None,
        });
    }
    serde_json::from_str(trimmed).map_err(|err| PrintdropError::LeaseMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

/// Legacy markers have no timestamp; the file mtime stands in.
fn legacy_created_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as u64)
}

/// Atomically writes (overwrites) a lease.
pub fn write_lease(path: &Path, lease: &LeaseRecord) -> Result<()> {
    write_json_atomic(path, lease, "lease")
}

/// Serializes `value` next to `path` and renames it into place, so readers
/// see the old content or the new, never a torn write.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(parent)
        .map_err(|err| PrintdropError::io(format!("create {what} dir"), err))?;

    let payload = serde_json::to_vec_pretty(value).map_err(|source| PrintdropError::Json {
        context: format!("serialize {what}"),
        source,
    })?;
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| PrintdropError::io(format!("create {what} temp"), err))?;
    tmp.write_all(&payload)
        .map_err(|err| PrintdropError::io(format!("write {what} temp"), err))?;
    tmp.persist(path)
        .map_err(|err| PrintdropError::io(format!("commit {what}"), err.error))?;
    Ok(())
}

/// Removes a lease. Missing files count as removed.
pub fn remove_lease(path: &Path) -> Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PrintdropError::io("remove lease", err)),
    }
}

/// Path of the advisory lock file guarding `lease_path`.
pub fn guard_path(lease_path: &Path) -> PathBuf {
    let mut name = lease_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".guard");
    lease_path.with_file_name(name)
}


#[cfg(test)]
mod tests {
    use super::tests_helper::FakeProbe;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_lease_reads_as_none() {
        let temp = tempdir().unwrap();
        assert!(read_lease(&temp.path().join("monitor-running"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_write_then_read_lease_overwrites() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("monitor-running");
        write_lease(&path, &LeaseRecord::new(1, "background-monitor", Some(10))).unwrap();
        let second = LeaseRecord::new(2, "background-monitor", Some(20));
        write_lease(&path, &second).unwrap();
        assert_eq!(read_lease(&path).unwrap(), Some(second));
    }

    #[test]
    fn test_plain_pid_marker_is_legacy_lease() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("monitor-running");
        fs_err::write(&path, "4242\n").unwrap();
        let lease = read_lease(&path).unwrap().unwrap();
        assert_eq!(lease.pid, 4242);
        assert!(lease.proc_started.is_none());
        assert!(lease.created.is_some());
    }

    #[test]
    fn test_garbage_lease_is_malformed() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("monitor-running");
        fs_err::write(&path, "{not json").unwrap();
        assert!(matches!(
            read_lease(&path),
            Err(PrintdropError::LeaseMalformed { .. })
        ));
    }

    #[test]
    fn test_recycled_pid_is_not_live() {
        let probe = FakeProbe::default().with_process(10, 5_000, &["printdrop"]);
        let lease = LeaseRecord::new(10, "background-monitor", Some(1_000));
        assert!(!lease.is_live(&probe, "--background-monitor"));

        let lease = LeaseRecord::new(10, "background-monitor", Some(5_001));
        assert!(lease.is_live(&probe, "--background-monitor"));
    }

    #[test]
    fn test_legacy_lease_requires_monitor_arg_and_freshness() {
        let probe = FakeProbe::default()
            .with_process(10, 1, &["printdrop", "--background-monitor"])
            .with_process(11, 1, &["printdrop"]);
        let mut lease = LeaseRecord::new(10, "", None);
        assert!(lease.is_live(&probe, "--background-monitor"));

        lease.pid = 11;
        assert!(!lease.is_live(&probe, "--background-monitor"));

        lease.pid = 10;
        lease.created = Some(now_ms() - LEGACY_MAX_AGE_MS - 1_000);
        assert!(!lease.is_live(&probe, "--background-monitor"));
    }

    #[test]
    fn test_guard_path_is_sibling() {
        assert_eq!(
            guard_path(Path::new("/tmp/pd/monitor-running")),
            PathBuf::from("/tmp/pd/monitor-running.guard")
        );
    }
}
