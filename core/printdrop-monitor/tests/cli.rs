//! The real `printdrop` binary: racing monitors and the `--pending` entry point.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use printdrop_core::PendingHandoffStore;
use tempfile::TempDir;

/// Kills every monitor on drop so a failed assertion leaves nothing behind.
struct Monitors {
    children: Vec<Child>,
}

impl Drop for Monitors {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Monitors {
    /// Pids still running; reaps the ones that exited.
    fn alive(&mut self) -> Vec<u32> {
        self.children
            .iter_mut()
            .filter_map(|child| match child.try_wait() {
                Ok(None) => Some(child.id()),
                _ => None,
            })
            .collect()
    }
}

/// Isolated per-user directories plus a config without the documents folder.
struct Sandbox {
    home: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let home = TempDir::new().expect("temp HOME");
        for dir in ["tmp", "data", "config", "capture"] {
            std::fs::create_dir_all(home.path().join(dir)).expect("sandbox dir");
        }
        let config = home.path().join("printdrop.toml");
        let capture = home.path().join("capture");
        std::fs::write(
            &config,
            format!(
                "[watch]\nfolders = [{:?}]\ninclude_documents_folder = false\npoll_interval_ms = 200\n\n[monitor]\nheartbeat_secs = 1\n",
                capture.to_string_lossy()
            ),
        )
        .expect("write config");
        Self { home, config }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_printdrop"));
        command
            .env("HOME", self.home.path())
            .env("TMPDIR", self.home.path().join("tmp"))
            .env("XDG_DATA_HOME", self.home.path().join("data"))
            .env("XDG_CONFIG_HOME", self.home.path().join("config"))
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config);
        command
    }

    fn spawn_monitor(&self) -> Child {
        self.command()
            .arg("--background-monitor")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn printdrop")
    }

    fn lease_file(&self) -> PathBuf {
        self.home.path().join("tmp").join("printdrop").join("monitor-running")
    }

    fn pending_store(&self) -> PendingHandoffStore {
        PendingHandoffStore::new(self.home.path().join("tmp").join("printdrop").join("pending-handoff"))
    }

    fn status(&self) -> serde_json::Value {
        let Output { status, stdout, .. } = self.command().arg("status").output().expect("status");
        assert!(status.success());
        serde_json::from_slice(&stdout).expect("status JSON")
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    condition()
}

fn lease_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).ok()?;
    value.get("pid")?.as_u64().map(|pid| pid as u32)
}

#[test]
fn simultaneous_monitors_leave_exactly_one_running() {
    let sandbox = Sandbox::new();
    let mut monitors = Monitors {
        children: vec![sandbox.spawn_monitor(), sandbox.spawn_monitor()],
    };

    assert!(
        wait_until(Duration::from_secs(15), || monitors.alive().len() == 1),
        "expected one monitor to step aside"
    );
    // The winner keeps running through a few heartbeats.
    sleep(Duration::from_secs(2));
    let alive = monitors.alive();
    assert_eq!(alive.len(), 1, "exactly one monitor must survive");

    assert!(wait_until(Duration::from_secs(5), || lease_pid(&sandbox.lease_file()) == Some(alive[0])));
    let status = sandbox.status();
    assert_eq!(status["monitor_pid"].as_u64(), Some(u64::from(alive[0])));
}

#[test]
fn monitor_started_after_a_crash_takes_over() {
    let sandbox = Sandbox::new();
    let mut first = Monitors {
        children: vec![sandbox.spawn_monitor()],
    };
    assert!(wait_until(Duration::from_secs(10), || lease_pid(&sandbox.lease_file()).is_some()));

    // SIGKILL: no cleanup, the lease stays behind naming a dead pid.
    let mut crashed = first.children.remove(0);
    crashed.kill().expect("kill monitor");
    crashed.wait().expect("reap monitor");
    assert!(sandbox.lease_file().exists());

    let mut second = Monitors {
        children: vec![sandbox.spawn_monitor()],
    };
    let pid = second.children[0].id();
    assert!(wait_until(Duration::from_secs(10), || lease_pid(&sandbox.lease_file()) == Some(pid)));
    sleep(Duration::from_secs(1));
    assert_eq!(second.alive(), vec![pid]);
}

#[test]
fn pending_invocation_only_touches_its_own_file() {
    let sandbox = Sandbox::new();
    let first = sandbox.home.path().join("capture").join("first.pdf");
    let second = sandbox.home.path().join("capture").join("second.pdf");
    std::fs::write(&first, b"%PDF").unwrap();
    std::fs::write(&second, b"%PDF").unwrap();
    let store = sandbox.pending_store();
    store.write(&first).unwrap();
    store.write(&second).unwrap();

    // Not signed in: the file goes back to pending and the run fails.
    let output = sandbox.command().arg("--pending").arg(&first).output().unwrap();
    assert!(!output.status.success());

    let mut pending = store.peek_all().unwrap();
    pending.sort();
    assert_eq!(pending, vec![first.clone(), second.clone()]);
    let status = sandbox.status();
    assert_eq!(status["pending"].as_array().map(Vec::len), Some(2));
}

#[test]
fn pending_invocation_without_lease_is_a_noop() {
    let sandbox = Sandbox::new();
    let other = sandbox.home.path().join("capture").join("other.pdf");
    std::fs::write(&other, b"%PDF").unwrap();
    sandbox.pending_store().write(&other).unwrap();

    let unrelated = sandbox.home.path().join("capture").join("unrelated.pdf");
    let output = sandbox.command().arg("--pending").arg(&unrelated).output().unwrap();
    assert!(output.status.success());
    assert_eq!(sandbox.pending_store().peek_all().unwrap(), vec![other]);
}

#[test]
fn clear_pending_drops_every_file() {
    let sandbox = Sandbox::new();
    let store = sandbox.pending_store();
    store.write(Path::new("/capture/a.pdf")).unwrap();
    store.write(Path::new("/capture/b.pdf")).unwrap();

    let output = sandbox.command().arg("clear-pending").output().unwrap();
    assert!(output.status.success());
    assert!(store.peek_all().unwrap().is_empty());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 2);
}
