//! Process inspection used to decide whether a recorded monitor is still alive.
//!
//! Operating systems reuse PIDs, so "the pid exists" is not enough. A lease
//! records the owner's start time, and a pid only counts as the owner when its
//! start time matches. Leases without a start time fall back to checking the
//! command line for the monitor argument.

use std::cell::RefCell;

use sysinfo::{Pid, ProcessRefreshKind, System, UpdateKind};

/// Allowed drift between a recorded and an observed process start time.
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// What the coordinator needs to know about other processes.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Start time (seconds since the epoch) of a live process.
    fn start_time(&self, pid: u32) -> Option<u64>;

    /// Command-line arguments of a live process.
    fn command_line(&self, pid: u32) -> Option<Vec<String>>;

    /// Pids of processes named `exe_name` whose command line carries `arg`,
    /// excluding the current process.
    fn find_peers(&self, exe_name: &str, arg: &str) -> Vec<u32>;

    /// True when `pid` is alive and is the same process that was recorded.
    fn is_same_process(&self, pid: u32, recorded_start: u64) -> bool {
        self.start_time(pid)
            .is_some_and(|actual| actual.abs_diff(recorded_start) <= START_TIME_TOLERANCE_SECS)
    }

    /// True when `pid` is alive and was launched with `arg`.
    fn carries_arg(&self, pid: u32, arg: &str) -> bool {
        self.is_alive(pid)
            && self
                .command_line(pid)
                .is_some_and(|cmd| cmd.iter().any(|value| value == arg))
    }
}

// Per-thread sysinfo cache; single-pid refreshes keep liveness checks O(1).
thread_local! {
    static SYSTEM_CACHE: RefCell<Option<System>> = const { RefCell::new(None) };
}

/// Refreshes one pid and reads it. `None` when the pid is gone, so a cached
/// entry for a dead process is never trusted.
fn with_refreshed<T>(
    pid: u32,
    kind: ProcessRefreshKind,
    f: impl FnOnce(&sysinfo::Process) -> T,
) -> Option<T> {
    SYSTEM_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let sys = cache.get_or_insert_with(System::new);
        let pid = Pid::from(pid as usize);
        if !sys.refresh_process_specifics(pid, kind) {
            return None;
        }
        sys.process(pid).map(f)
    })
}

/// [`ProcessProbe`] backed by the live process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            // Signal 0 probes existence; EPERM still means the pid exists.
            let rc = unsafe { libc::kill(pid as i32, 0) };
            rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
        #[cfg(not(unix))]
        {
            with_refreshed(pid, ProcessRefreshKind::new(), |_| ()).is_some()
        }
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        with_refreshed(pid, ProcessRefreshKind::new(), |process| process.start_time())
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        with_refreshed(
            pid,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
            |process| process.cmd().to_vec(),
        )
    }

    fn find_peers(&self, exe_name: &str, arg: &str) -> Vec<u32> {
        let own_pid = std::process::id();
        let wanted = exe_name.to_lowercase();
        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

        sys.processes()
            .iter()
            .filter_map(|(pid, process)| {
                let pid = pid.as_u32();
                if pid == own_pid {
                    return None;
                }
                let name = process.name().to_lowercase();
                let name = name.trim_end_matches(".exe");
                let same_exe = name == wanted.trim_end_matches(".exe");
                let is_monitor = process.cmd().iter().any(|value| value == arg);
                (same_exe && is_monitor).then_some(pid)
            })
            .collect()
    }
}

/// Start time of the current process, as recorded in leases.
pub fn own_start_time(probe: &dyn ProcessProbe) -> Option<u64> {
    probe.start_time(std::process::id())
}

/// File name of the running executable without extension, for peer scans.
pub fn own_exe_name() -> Option<String> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
}
