//! Locating the session log an interactive agent writes to.
//!
//! The agent does not say which file it logs to. Before spawning it we take
//! a snapshot of every `*.jsonl` under the session root; afterwards we poll
//! until a file appears (or grows) that was touched around the time the
//! process started.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glob::{MatchOptions, Pattern};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CodexConfig;
use crate::{AppError, Result};

/// Delay between directory scans.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// How long to wait for the session file to show up.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Files modified up to this long before process start still count.
pub const START_GRACE: Duration = Duration::from_secs(2);

/// Session log path → modification time.
pub type SessionSnapshot = HashMap<PathBuf, SystemTime>;

/// Configured session root, or `~/.codex/sessions`.
///
/// # Errors
///
/// Returns `AppError::Discovery` if no root is configured and the home
/// directory cannot be determined.
pub fn session_root(config: &CodexConfig) -> Result<PathBuf> {
    let configured = config.session_root.trim();
    if !configured.is_empty() {
        return Ok(PathBuf::from(configured));
    }
    dirs::home_dir()
        .map(|home| home.join(".codex").join("sessions"))
        .ok_or_else(|| AppError::Discovery("cannot determine home directory".into()))
}

/// Every `*.jsonl` file below `root` (any depth, extension case-insensitive).
///
/// A missing root yields an empty snapshot.
#[must_use]
pub fn snapshot(root: &Path) -> SessionSnapshot {
    let pattern = format!(
        "{}/**/*.jsonl",
        Pattern::escape(&root.to_string_lossy())
    );
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    let Ok(paths) = glob::glob_with(&pattern, options) else {
        debug!(%pattern, "invalid session glob");
        return SessionSnapshot::new();
    };

    paths
        .filter_map(std::result::Result::ok)
        .filter_map(|path| {
            let meta = std::fs::metadata(&path).ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().ok()?;
            Some((path, modified))
        })
        .collect()
}

/// The session file created (or advanced) by a process started at `started`.
///
/// A candidate must be new or modified after its `baseline` time, and
/// modified no earlier than `grace` before `started`. The most recently
/// modified candidate wins.
#[must_use]
pub fn pick_new_session_file(
    current: &SessionSnapshot,
    baseline: &SessionSnapshot,
    started: SystemTime,
    grace: Duration,
) -> Option<PathBuf> {
    let floor = started.checked_sub(grace).unwrap_or(UNIX_EPOCH);
    current
        .iter()
        .filter(|(_, modified)| **modified >= floor)
        .filter(|(path, modified)| baseline.get(*path).is_none_or(|before| **modified > *before))
        .max_by_key(|(_, modified)| **modified)
        .map(|(path, _)| path.clone())
}

/// Poll `root` until [`pick_new_session_file`] finds a file.
///
/// # Errors
///
/// Returns `AppError::Discovery` once `timeout` elapses without a match.
pub async fn wait_for_session_file(
    root: &Path,
    baseline: &SessionSnapshot,
    started: SystemTime,
    timeout: Duration,
) -> Result<PathBuf> {
    let deadline = Instant::now() + timeout;
    loop {
        let scan_root = root.to_path_buf();
        let current = tokio::task::spawn_blocking(move || snapshot(&scan_root))
            .await
            .map_err(|e| AppError::Discovery(format!("session scan failed: {e}")))?;

        if let Some(path) = pick_new_session_file(&current, baseline, started, START_GRACE) {
            info!(path = %path.display(), "session log discovered");
            return Ok(path);
        }
        if Instant::now() >= deadline {
            return Err(AppError::Discovery(format!(
                "session file not found in {}",
                root.display()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
