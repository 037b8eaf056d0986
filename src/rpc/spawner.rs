//! Agent process spawner.
//!
//! Resolves which command to run for a channel, spawns it with piped stdio,
//! and watches it until it exits or is killed:
//! - Command precedence: channel override → global override → built-in
//!   `codex` invocation. Multi-word overrides run through a shell; a bare
//!   program path and the built-in invocation are executed directly.
//! - Environment overlays are applied in sorted key order over the inherited
//!   environment, so a [`CommandSpec`] is a reproducible value.
//! - On Unix the child leads its own process group so the whole tree can be
//!   killed with one signal.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::{AppError, Result};

/// Binary name of the agent CLI.
pub const AGENT_BINARY: &str = "codex";

/// Arguments selecting the agent's JSON-RPC server mode.
pub const RPC_FALLBACK_ARGS: &[&str] = &["mcp"];

/// Arguments for an unattended interactive session.
pub const INTERACTIVE_FALLBACK_ARGS: &[&str] = &["-a", "never", "--sandbox", "workspace-write"];

// ── Command resolution ───────────────────────────────────────────────────────

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory, if overridden.
    pub cwd: Option<PathBuf>,
    /// Environment overlay, sorted by key.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Resolve the invocation for `channel`.
    ///
    /// `global` is the agent-wide override; `fallback_args` are appended to
    /// the agent binary when neither override is set.
    #[must_use]
    pub fn resolve(channel: &ChannelConfig, global: Option<&str>, fallback_args: &[&str]) -> Self {
        let (program, args) = match channel.command_override().or(global) {
            Some(line) => override_invocation(line, cfg!(windows)),
            None => {
                let binary = which::which(AGENT_BINARY).ok();
                agent_invocation(binary.as_deref(), fallback_args, cfg!(windows))
            }
        };

        Self {
            program,
            args,
            cwd: channel.workdir().map(Path::to_path_buf),
            // BTreeMap iteration is already key-ordered.
            env: channel
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Build a [`Command`] with piped stdio.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Human-readable rendering for logs.
    #[must_use]
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Invocation for a command override.
///
/// A single word with nothing for a shell to interpret is run like a
/// resolved agent binary; anything else goes through [`shell_invocation`].
#[must_use]
pub fn override_invocation(line: &str, windows: bool) -> (String, Vec<String>) {
    let line = line.trim();
    if is_bare_program(line) {
        agent_invocation(Some(Path::new(line)), &[], windows)
    } else {
        shell_invocation(line, windows)
    }
}

fn is_bare_program(line: &str) -> bool {
    const SHELL_SYNTAX: &str = "'\"`$;&|<>(){}[]*?~#=!";
    !line.is_empty()
        && !line
            .chars()
            .any(|c| c.is_whitespace() || SHELL_SYNTAX.contains(c))
}

/// Run a free-form command line through the platform shell.
#[must_use]
pub fn shell_invocation(line: &str, windows: bool) -> (String, Vec<String>) {
    if windows {
        (
            "powershell".to_owned(),
            vec!["-NoLogo".to_owned(), "-Command".to_owned(), line.to_owned()],
        )
    } else {
        ("bash".to_owned(), vec!["-lc".to_owned(), line.to_owned()])
    }
}

/// Invoke the agent binary directly.
///
/// `resolved` is the binary found on `PATH`, if any. PowerShell scripts are
/// run through the interpreter; an unresolved binary is run by bare name.
#[must_use]
pub fn agent_invocation(
    resolved: Option<&Path>,
    fallback_args: &[&str],
    windows: bool,
) -> (String, Vec<String>) {
    let tail = fallback_args.iter().map(|s| (*s).to_owned());
    match resolved {
        Some(path) if windows && is_powershell_script(path) => {
            let mut args: Vec<String> = ["-NoLogo", "-ExecutionPolicy", "Bypass", "-File"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect();
            args.push(path.to_string_lossy().into_owned());
            args.extend(tail);
            ("powershell".to_owned(), args)
        }
        Some(path) => (path.to_string_lossy().into_owned(), tail.collect()),
        None => (AGENT_BINARY.to_owned(), tail.collect()),
    }
}

fn is_powershell_script(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ps1"))
}

// ── Spawning ─────────────────────────────────────────────────────────────────

/// A freshly spawned agent with its stdio handles split out.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child handle; hand it to [`wait_or_kill`].
    pub child: Child,
    /// Agent's input stream.
    pub stdin: ChildStdin,
    /// Agent's output stream.
    pub stdout: ChildStdout,
    /// Agent's error stream.
    pub stderr: ChildStderr,
    /// OS process id (also the process group id on Unix).
    pub pid: Option<u32>,
    /// When the process was started.
    pub started_at: Instant,
}

/// Spawn `spec`.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn agent: …")`: OS spawn failure.
/// - `AppError::Spawn("failed to capture agent …")`: a pipe was not created.
pub fn spawn_agent(spec: &CommandSpec) -> Result<AgentProcess> {
    let started_at = Instant::now();
    let mut child = spec.to_command().spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn agent `{}`: {err}",
            spec.display_line()
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;
    let pid = child.id();

    info!(
        pid = pid.unwrap_or(0),
        command = %spec.display_line(),
        cwd = ?spec.cwd,
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        stderr,
        pid,
        started_at,
    })
}

// ── Exit handling ────────────────────────────────────────────────────────────

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Human-readable reason.
    pub reason: String,
}

/// Wait for `child` to exit, killing it first if `kill` fires.
pub async fn wait_or_kill(mut child: Child, kill: CancellationToken) -> ExitReport {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                debug!(%err, "kill requested but process already gone");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |c| format!("process exited with code {c}"),
            );
            ExitReport { code, reason }
        }
        Err(err) => {
            warn!(%err, "error waiting for agent child process");
            ExitReport {
                code: None,
                reason: format!("wait error: {err}"),
            }
        }
    }
}

/// Send `SIGKILL` to the process group led by `pid`.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal cannot be delivered.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| AppError::Io(format!("pid {pid} out of range")))?;
    killpg(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| AppError::Io(format!("killpg({pid}) failed: {e}")))
}

/// Process groups are a POSIX concept; elsewhere only the direct kill applies.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) -> Result<()> {
    Ok(())
}

/// Forward each line of `stream` to the debug log until EOF.
#[must_use]
pub fn drain_to_log<R>(label: &'static str, stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(stream = label, line = %line, "agent output"),
                Ok(None) => break,
                Err(err) => {
                    debug!(stream = label, %err, "agent output read failed");
                    break;
                }
            }
        }
    })
}
