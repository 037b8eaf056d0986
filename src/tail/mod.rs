//! Bridge for agents without an RPC surface.
//!
//! [`TailBridge`] runs one interactive agent per channel, types prompts into
//! its stdin, and recovers replies by tailing the JSONL session log the
//! agent writes:
//!
//! - `discovery`: finds the log file a freshly spawned agent created.
//! - `tailer`: follows the log and captures early process output.
//! - `queue`: bounded, drop-oldest buffer between tailer and caller.

pub mod discovery;
pub mod queue;
pub mod tailer;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ChannelConfig, CodexConfig};
use crate::rpc::spawner::{
    kill_process_group, spawn_agent, wait_or_kill, CommandSpec, INTERACTIVE_FALLBACK_ARGS,
};
use crate::runner::{ChatRunner, TurnContext};
use crate::{AppError, Result};

use self::discovery::{session_root, snapshot, wait_for_session_file, DISCOVERY_TIMEOUT};
use self::queue::OutputQueue;
use self::tailer::{follow_log, open_at_end, CappedBuffer, CAPTURE_LIMIT};

/// Quiet period after a message that ends a turn.
pub const REPLY_IDLE_GAP: Duration = Duration::from_millis(1200);

/// Processes exiting sooner than this have their output logged.
pub const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(1);

const CAPTURE_FLUSH_WAIT: Duration = Duration::from_millis(200);

/// What an agent printed before exiting within [`EARLY_EXIT_WINDOW`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyExit {
    /// Time from spawn to exit.
    pub lifetime: Duration,
    /// Exit status or kill reason.
    pub reason: String,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl std::fmt::Display for EarlyExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "agent exited after {}ms ({}); stdout: {:?}; stderr: {:?}",
            self.lifetime.as_millis(),
            self.reason,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// One interactive agent bound to one channel.
#[derive(Debug)]
pub struct TailSession {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    log_path: PathBuf,
    queue: Arc<OutputQueue>,
    turn: Mutex<()>,
    kill: CancellationToken,
}

impl TailSession {
    /// Session log being tailed.
    #[must_use]
    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    async fn write_prompt(&self, prompt: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(AppError::Write("input stream closed".into()));
        };
        let line = format!("{}\n", prompt.trim());
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::Write(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AppError::Write(format!("flush failed: {e}")))
    }

    async fn terminate(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(pid) = self.pid {
            if let Err(err) = kill_process_group(pid) {
                debug!(%err, pid, "process group kill failed");
            }
        }
        self.kill.cancel();
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Tail-based bridge; one agent process per channel.
#[derive(Debug)]
pub struct TailBridge {
    config: CodexConfig,
    discovery_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<TailSession>>>,
    /// Starts are serialised so concurrent discoveries cannot claim each
    /// other's log file.
    start_lock: Mutex<()>,
}

impl TailBridge {
    /// Create a bridge. Agents are started lazily per channel.
    #[must_use]
    pub fn new(config: CodexConfig) -> Self {
        Self {
            config,
            discovery_timeout: DISCOVERY_TIMEOUT,
            sessions: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
        }
    }

    /// Override how long a new agent may take to create its session log.
    #[must_use]
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Session for `channel`, starting the agent and discovering its log
    /// if there is none yet.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the agent cannot be started.
    /// - `AppError::Discovery` if its session log never shows up; the
    ///   process is killed. When the agent already exited early, its
    ///   captured output is part of the message.
    pub async fn ensure(&self, channel: &ChannelConfig) -> Result<Arc<TailSession>> {
        let owner = channel.channel_id.as_str();
        if let Some(session) = self.sessions.lock().await.get(owner) {
            return Ok(Arc::clone(session));
        }
        let _guard = self.start_lock.lock().await;
        if let Some(session) = self.sessions.lock().await.get(owner) {
            return Ok(Arc::clone(session));
        }

        let root = session_root(&self.config)?;
        let baseline = {
            let scan_root = root.clone();
            tokio::task::spawn_blocking(move || snapshot(&scan_root))
                .await
                .map_err(|e| AppError::Discovery(format!("session scan failed: {e}")))?
        };
        debug!(owner, root = %root.display(), baseline = baseline.len(), "session log baseline taken");

        let spec = CommandSpec::resolve(
            channel,
            self.config.command_override(),
            INTERACTIVE_FALLBACK_ARGS,
        );
        let started = SystemTime::now();
        let process = spawn_agent(&spec)?;
        let span = info_span!("tail_session", owner, pid = process.pid.unwrap_or(0));

        let stdout_buf = CappedBuffer::new(CAPTURE_LIMIT);
        let stderr_buf = CappedBuffer::new(CAPTURE_LIMIT);
        let captures = [
            stdout_buf.capture(process.stdout),
            stderr_buf.capture(process.stderr),
        ];

        let kill = CancellationToken::new();
        let watch_kill = kill.clone();
        let started_at = process.started_at;
        let child = process.child;
        let exit_watch = tokio::spawn(
            async move {
                let report = wait_or_kill(child, watch_kill).await;
                let lifetime = started_at.elapsed();
                if lifetime >= EARLY_EXIT_WINDOW {
                    info!(reason = %report.reason, "interactive agent exited");
                    return None;
                }
                // Let the capture tasks reach EOF before reporting.
                let _ = tokio::time::timeout(CAPTURE_FLUSH_WAIT, async {
                    for capture in captures {
                        let _ = capture.await;
                    }
                })
                .await;
                let early = EarlyExit {
                    lifetime,
                    reason: report.reason,
                    stdout: stdout_buf.contents().await,
                    stderr: stderr_buf.contents().await,
                };
                warn!(
                    lifetime_ms = u64::try_from(early.lifetime.as_millis()).unwrap_or(u64::MAX),
                    reason = %early.reason,
                    stdout = %early.stdout,
                    stderr = %early.stderr,
                    "agent exited early"
                );
                Some(early)
            }
            .instrument(span.clone()),
        );

        let discovered =
            wait_for_session_file(&root, &baseline, started, self.discovery_timeout).await;
        let log_path = match discovered {
            Ok(path) => path,
            Err(err) => {
                let err = match err {
                    AppError::Discovery(msg) if exit_watch.is_finished() => {
                        match exit_watch.await {
                            Ok(Some(early)) => AppError::Discovery(format!("{msg}; {early}")),
                            _ => AppError::Discovery(msg),
                        }
                    }
                    other => other,
                };
                if let Some(pid) = process.pid {
                    let _ = kill_process_group(pid);
                }
                kill.cancel();
                return Err(err);
            }
        };

        let log = match open_at_end(&log_path).await {
            Ok(file) => file,
            Err(err) => {
                if let Some(pid) = process.pid {
                    let _ = kill_process_group(pid);
                }
                kill.cancel();
                return Err(err);
            }
        };
        let queue = Arc::new(OutputQueue::default());
        tokio::spawn(
            follow_log(log, log_path.clone(), Arc::clone(&queue), kill.clone()).instrument(span),
        );

        let session = Arc::new(TailSession {
            pid: process.pid,
            stdin: Mutex::new(Some(process.stdin)),
            log_path,
            queue,
            turn: Mutex::new(()),
            kill,
        });
        self.sessions
            .lock()
            .await
            .insert(owner.to_owned(), Arc::clone(&session));
        info!(owner, path = %session.log_path.display(), "tail session ready");
        Ok(session)
    }

    /// Send `prompt` and wait for the agent's reply.
    ///
    /// The turn ends after [`REPLY_IDLE_GAP`] of quiet following at least one
    /// message, returning the latest message.
    ///
    /// # Errors
    ///
    /// - Errors from [`ensure`](Self::ensure).
    /// - `AppError::Write` if the prompt cannot be written.
    /// - `AppError::TailTimeout` if no message arrives before the request
    ///   timeout.
    /// - `AppError::Cancelled` if `ctx` is cancelled before any message.
    pub async fn chat(
        &self,
        channel: &ChannelConfig,
        prompt: &str,
        ctx: &TurnContext,
    ) -> Result<String> {
        let session = self.ensure(channel).await?;
        let _turn = session.turn.lock().await;

        let stale = session.queue.drain().await;
        if !stale.is_empty() {
            debug!(count = stale.len(), "discarding stale output");
        }
        session.write_prompt(prompt).await?;

        collect_reply(
            &session.queue,
            self.config.request_timeout(),
            REPLY_IDLE_GAP,
            &ctx.cancel,
        )
        .await
    }

    /// Kill `owner`'s agent and forget its session.
    pub async fn end(&self, owner: &str) {
        let removed = self.sessions.lock().await.remove(owner);
        if let Some(session) = removed {
            info!(owner, "ending tail session");
            session.terminate().await;
        }
    }

    /// End every session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (owner, session) in sessions {
            debug!(owner, "closing tail session");
            session.terminate().await;
        }
    }

    /// Number of running sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Gather queued messages until the reply is complete.
///
/// # Errors
///
/// `AppError::TailTimeout` or `AppError::Cancelled` when nothing arrived.
pub async fn collect_reply(
    queue: &OutputQueue,
    timeout: Duration,
    idle_gap: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut latest: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                return latest.ok_or(AppError::Cancelled);
            }
            () = &mut deadline => {
                return latest.ok_or_else(|| AppError::TailTimeout(format!(
                    "no agent message within {}s",
                    timeout.as_secs()
                )));
            }
            message = queue.recv() => {
                if !message.is_empty() {
                    latest = Some(message);
                }
            }
            () = tokio::time::sleep(idle_gap) => {
                if let Some(reply) = latest {
                    return Ok(reply);
                }
            }
        }
    }
}

impl ChatRunner for TailBridge {
    fn chat_multi<'a>(
        &'a self,
        channel: &'a ChannelConfig,
        prompt: &'a str,
        ctx: &'a TurnContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            let reply = self.chat(channel, prompt, ctx).await?;
            Ok(vec![reply])
        })
    }

    fn reset<'a>(&'a self, owner: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.end(owner))
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.close_all())
    }
}
