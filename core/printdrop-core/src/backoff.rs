//! Restart throttling for the background monitor.
//!
//! Autostart entries and scheduled tasks relaunch a monitor that dies during
//! startup, which can turn into a tight crash loop. Every start is appended to
//! a small history file (`monitor-backoff.json` in the data directory). Once
//! more than `burst` starts fall inside `window`, the next start is delayed,
//! doubling per extra start up to `max_delay`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::lease::{now_ms, write_json_atomic};
use crate::error::{PrintdropError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub burst: usize,
    pub window: Duration,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    /// Delay owed for `starts` recent starts (the current one included).
    pub fn delay_for(&self, starts: usize) -> Duration {
        let extra = starts.saturating_sub(self.burst);
        if extra == 0 {
            return Duration::ZERO;
        }
        let doublings = u32::try_from(extra - 1).unwrap_or(u32::MAX).min(16);
        self.delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Recent monitor starts, in epoch milliseconds.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartHistory {
    #[serde(default)]
    starts_ms: Vec<u64>,
}

impl StartHistory {
    /// Missing file reads as an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs_err::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(PrintdropError::io("read start history", err)),
        };
        serde_json::from_str(&content).map_err(|source| PrintdropError::Json {
            context: format!("parse {}", path.display()),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self, "start history")
    }

    pub fn len(&self) -> usize {
        self.starts_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts_ms.is_empty()
    }

    /// Forgets starts outside the window (or in the future, after a clock
    /// change), records one at `now`, and returns the delay it owes.
    pub fn record_start(&mut self, now: u64, policy: &RestartPolicy) -> Duration {
        let window_ms = u64::try_from(policy.window.as_millis()).unwrap_or(u64::MAX);
        self.starts_ms
            .retain(|&started| started <= now && now - started <= window_ms);
        self.starts_ms.push(now);
        policy.delay_for(self.starts_ms.len())
    }
}

/// Records this start in the history at `path` and returns how long the
/// monitor should wait before claiming. History problems never block a start.
pub fn startup_delay(path: &Path, policy: &RestartPolicy) -> Duration {
    let mut history = StartHistory::load(path).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Discarding unreadable start history");
        StartHistory::default()
    });
    let delay = history.record_start(now_ms(), policy);
    if let Err(err) = history.save(path) {
        tracing::warn!(error = %err, "Failed to save start history");
    }
    if !delay.is_zero() {
        tracing::warn!(
            recent_starts = history.len(),
            delay_secs = delay.as_secs(),
            "Monitor restarting too often; delaying start"
        );
    }
    delay
}
