//! Long-lived JSON-RPC bridge to a `codex mcp` agent process.
//!
//! [`McpBridge`] owns at most one agent process (a [`Session`]) at a time and
//! multiplexes every channel's turns over it:
//!
//! - `correlator`: pending table and id → owner tags.
//! - `router`: `codex/event` notifications → observer calls.
//! - `conversation`: owner → continuation token, start vs. reply calls.
//! - `idle`: optional inactivity shutdown.
//! - `observer`: callbacks to the front-end.
//!
//! All shared state lives in one [`tokio::sync::Mutex`] held only for map
//! updates. Starts and restarts are serialised by a separate start lock;
//! stdin writes by the session's own writer lock. Background tasks hold a
//! [`Weak`] reference so dropping the last [`McpBridge`] clone releases
//! everything.

pub mod conversation;
pub mod correlator;
pub mod idle;
pub mod observer;
pub mod router;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ChannelConfig, CodexConfig};
use crate::extract;
use crate::rpc::handshake::{
    empty_params, initialize_params, EXIT, INITIALIZE, INITIALIZED, INITIALIZE_TIMEOUT, SHUTDOWN,
};
use crate::rpc::message::{self, Inbound};
use crate::rpc::reader::{run_reader, InboundHandler, ReaderExit};
use crate::rpc::spawner::{
    drain_to_log, kill_process_group, spawn_agent, wait_or_kill, CommandSpec, RPC_FALLBACK_ARGS,
};
use crate::rpc::writer::LineWriter;
use crate::runner::{ChatRunner, TurnContext};
use crate::{AppError, Result};

use self::conversation::{ConversationStore, TurnCall, TOOLS_CALL};
use self::correlator::{outcome_to_result, Correlator, ResponseSlot};
use self::idle::{IdleEvent, IdleHandle, IdleSupervisor};
use self::observer::BridgeObserver;
use self::router::{route_event, ReasoningBuffers};

/// How long `close` waits for the `shutdown` reply.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(400);

/// Pause between the `exit` notification and closing stdin.
pub const EXIT_GRACE: Duration = Duration::from_millis(100);

/// How long `close` waits for the process to exit before killing it.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Error text handed to callers whose request was dropped by a teardown.
const TORN_DOWN: &str = "session torn down";

/// Error text for callers waiting when the agent's output stream ends.
const READER_STOPPED: &str = "agent output closed";

// ── Session ──────────────────────────────────────────────────────────────────

/// One running agent process.
///
/// Replaced wholesale on restart; never mutated apart from its flags.
#[derive(Debug)]
struct Session {
    generation: u64,
    pid: Option<u32>,
    writer: LineWriter<ChildStdin>,
    ready: AtomicBool,
    /// Fired by the exit watcher once the process has exited.
    dead: CancellationToken,
    /// Cancelling makes the exit watcher kill the process.
    kill: CancellationToken,
}

impl Session {
    fn is_live(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.dead.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// A request written to the agent whose response is still outstanding.
struct InFlight {
    id: u64,
    method: &'static str,
    slot: ResponseSlot,
}

// ── Shared state ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct BridgeState {
    session: Option<Arc<Session>>,
    next_generation: u64,
    correlator: Correlator,
    reasoning: ReasoningBuffers,
    conversations: ConversationStore,
}

struct BridgeInner {
    config: CodexConfig,
    observer: Arc<dyn BridgeObserver>,
    state: Mutex<BridgeState>,
    start_lock: Mutex<()>,
    idle: OnceLock<IdleHandle>,
}

/// Bridge to a `codex mcp` process shared by all channels.
///
/// Cheap to clone; clones share the same process and state.
#[derive(Clone)]
pub struct McpBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for McpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBridge")
            .field("transport", &self.inner.config.transport)
            .finish_non_exhaustive()
    }
}

impl McpBridge {
    /// Create a bridge. No process is started until the first turn.
    #[must_use]
    pub fn new(config: CodexConfig, observer: Arc<dyn BridgeObserver>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                config,
                observer,
                state: Mutex::new(BridgeState::default()),
                start_lock: Mutex::new(()),
                idle: OnceLock::new(),
            }),
        }
    }

    /// Make sure a live agent process exists, starting one for `channel` if
    /// needed. Concurrent callers share a single start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the process cannot be started.
    pub async fn ensure_started(&self, channel: &ChannelConfig) -> Result<()> {
        BridgeInner::ensure_started(&self.inner, channel)
            .await
            .map(|_| ())
    }

    /// Whether a live agent process is attached.
    pub async fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.is_live())
    }

    /// Continuation token currently bound to `owner`.
    pub async fn conversation_id(&self, owner: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .conversations
            .lookup(owner)
            .map(str::to_owned)
    }

    /// Send an arbitrary request on behalf of `owner` and wait for its result.
    ///
    /// A write failure restarts the agent once and retries the request once.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the agent cannot be (re)started.
    /// - `AppError::Write` if the retry also fails to write, or the session
    ///   was torn down while waiting.
    /// - `AppError::Timeout` / `AppError::Cancelled` / `AppError::Protocol`.
    pub async fn call(
        &self,
        channel: &ChannelConfig,
        method: &'static str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        BridgeInner::call(&self.inner, channel, method, params, cancel).await
    }

    /// Run one chat turn for `channel`.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn chat_turn(
        &self,
        channel: &ChannelConfig,
        prompt: &str,
        ctx: &TurnContext,
    ) -> Result<Vec<String>> {
        let inner = &self.inner;
        let owner = channel.channel_id.as_str();

        let turn = {
            let state = inner.state.lock().await;
            match state.conversations.lookup(owner) {
                Some(token) => TurnCall::reply(prompt, token, ctx.user()),
                None => TurnCall::start(
                    prompt,
                    &inner.config.preamble,
                    channel.workdir(),
                    ctx.user(),
                ),
            }
        };
        debug!(owner, tool = turn.tool, "chat turn");

        let result =
            BridgeInner::call(inner, channel, TOOLS_CALL, turn.params(), &ctx.cancel).await?;
        inner.touch();

        if let Some(token) = extract::conversation_id(&result) {
            let mut state = inner.state.lock().await;
            if state.conversations.lookup(owner) != Some(token.as_str()) {
                info!(owner, conversation_id = %token, "conversation bound");
            }
            state.conversations.bind(owner, token);
        }

        if inner.observer.streams_replies() {
            return Ok(Vec::new());
        }
        Ok(reply_messages(&result))
    }

    /// Forget `owner`'s conversation.
    pub async fn reset_conversation(&self, owner: &str) {
        if owner.is_empty() {
            return;
        }
        if self.inner.state.lock().await.conversations.reset(owner) {
            info!(owner, "conversation reset");
        }
    }

    /// Shut the agent down gracefully, killing it if it does not exit.
    ///
    /// A no-op when no process is attached. Conversation bindings survive.
    pub async fn shutdown(&self) {
        self.inner.close().await;
    }
}

/// Messages to post for a `tools/call` result.
///
/// One per agent message when the result lists them, else the best single
/// text, else the raw JSON.
#[must_use]
pub fn reply_messages(result: &Value) -> Vec<String> {
    let messages = extract::agent_messages(result);
    if !messages.is_empty() {
        return messages;
    }
    if let Some(text) = extract::result_text(result) {
        return vec![text];
    }
    let raw = match result {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_owned(),
        other => other.to_string(),
    };
    if raw.is_empty() {
        Vec::new()
    } else {
        vec![raw]
    }
}

impl ChatRunner for McpBridge {
    fn chat_multi<'a>(
        &'a self,
        channel: &'a ChannelConfig,
        prompt: &'a str,
        ctx: &'a TurnContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(self.chat_turn(channel, prompt, ctx))
    }

    fn reset<'a>(&'a self, owner: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.reset_conversation(owner))
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.shutdown())
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

impl BridgeInner {
    fn touch(&self) {
        if let Some(idle) = self.idle.get() {
            idle.touch();
        }
    }

    async fn live_session(&self) -> Option<Arc<Session>> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .filter(|s| s.is_live())
            .cloned()
    }

    async fn ensure_started(this: &Arc<Self>, channel: &ChannelConfig) -> Result<Arc<Session>> {
        if let Some(session) = this.live_session().await {
            return Ok(session);
        }
        let _guard = this.start_lock.lock().await;
        if let Some(session) = this.live_session().await {
            return Ok(session);
        }
        Self::start_locked(this, channel).await
    }

    /// Tear down the failed session and start a new one, unless another
    /// caller already replaced it.
    async fn restart_after_failure(
        this: &Arc<Self>,
        channel: &ChannelConfig,
        failed_generation: u64,
    ) -> Result<Arc<Session>> {
        let _guard = this.start_lock.lock().await;
        if let Some(session) = this.live_session().await {
            if session.generation != failed_generation {
                debug!(
                    generation = session.generation,
                    "session already restarted by another caller"
                );
                return Ok(session);
            }
        }
        this.teardown(failed_generation, TORN_DOWN).await;
        Self::start_locked(this, channel).await
    }

    /// Spawn, wire up and handshake a new session. Caller holds `start_lock`.
    async fn start_locked(this: &Arc<Self>, channel: &ChannelConfig) -> Result<Arc<Session>> {
        let stale = this.state.lock().await.session.as_ref().map(|s| s.generation);
        if let Some(generation) = stale {
            this.teardown(generation, TORN_DOWN).await;
        }

        let spec = CommandSpec::resolve(
            channel,
            this.config.command_override(),
            RPC_FALLBACK_ARGS,
        );
        let process = spawn_agent(&spec)?;

        let generation = {
            let mut state = this.state.lock().await;
            state.next_generation += 1;
            state.next_generation
        };
        let session = Arc::new(Session {
            generation,
            pid: process.pid,
            writer: LineWriter::new(process.stdin, this.config.debug),
            ready: AtomicBool::new(false),
            dead: CancellationToken::new(),
            kill: CancellationToken::new(),
        });

        this.state.lock().await.session = Some(Arc::clone(&session));
        let span = info_span!("agent_session", generation, pid = process.pid.unwrap_or(0));

        drop(drain_to_log("stderr", process.stderr));

        let handler = SessionEvents {
            inner: Arc::downgrade(this),
        };
        let reader_cancel = session.kill.clone();
        let debug_wire = this.config.debug;
        let stdout = process.stdout;
        tokio::spawn(
            async move {
                let exit = run_reader(stdout, &handler, reader_cancel, debug_wire).await;
                debug!(?exit, "rpc reader stopped");
                // Without a reader nothing can be answered; force a restart.
                if exit != ReaderExit::Cancelled {
                    if let Some(inner) = handler.inner.upgrade() {
                        inner.teardown(generation, READER_STOPPED).await;
                    }
                }
            }
            .instrument(span.clone()),
        );

        let weak = Arc::downgrade(this);
        let kill = session.kill.clone();
        let dead = session.dead.clone();
        let child = process.child;
        tokio::spawn(
            async move {
                let report = wait_or_kill(child, kill).await;
                dead.cancel();
                info!(code = ?report.code, reason = %report.reason, "agent process exited");
                if let Some(inner) = weak.upgrade() {
                    inner.on_session_exit(generation).await;
                }
            }
            .instrument(span),
        );

        this.handshake(&session).await;
        this.arm_idle();
        Ok(session)
    }

    async fn handshake(&self, session: &Arc<Session>) {
        let no_cancel = CancellationToken::new();
        match self
            .send_request(session, INITIALIZE, initialize_params(), None)
            .await
        {
            Ok(in_flight) => {
                if let Err(err) = self
                    .await_response(in_flight, INITIALIZE_TIMEOUT, &no_cancel)
                    .await
                {
                    debug!(%err, "initialize not answered, continuing");
                }
            }
            Err(err) => debug!(%err, "initialize could not be sent"),
        }

        session.ready.store(true, Ordering::SeqCst);
        if let Err(err) = session
            .writer
            .send(&message::notification(INITIALIZED, empty_params()))
            .await
        {
            debug!(%err, "initialized notification could not be sent");
        }
        self.observer.on_process_up();
    }

    fn arm_idle(self: &Arc<Self>) {
        let Some(threshold) = self.config.idle_threshold() else {
            return;
        };
        if let Some(idle) = self.idle.get() {
            idle.touch();
            return;
        }

        let (tx, rx) = mpsc::channel(4);
        let handle = IdleSupervisor::new(threshold, tx).spawn();
        if self.idle.set(handle).is_ok() {
            spawn_idle_consumer(rx, Arc::downgrade(self));
            info!(idle_secs = threshold.as_secs(), "idle shutdown armed");
        }
    }

    /// Exit watcher callback: detach the session if it is still current.
    async fn on_session_exit(&self, generation: u64) {
        let woken = {
            let mut state = self.state.lock().await;
            if state
                .session
                .as_ref()
                .is_some_and(|s| s.generation == generation)
            {
                state.session = None;
                state.reasoning.clear();
                Some(state.correlator.fail_all(TORN_DOWN))
            } else {
                None
            }
        };
        if let Some(woken) = woken {
            debug!(generation, woken, "session detached after exit");
        }
        self.observer.on_process_down();
    }

    /// Forcibly drop session `generation`: fail its callers, close stdin and
    /// kill the process tree.
    async fn teardown(&self, generation: u64, reason: &str) {
        let session = {
            let mut state = self.state.lock().await;
            if !state
                .session
                .as_ref()
                .is_some_and(|s| s.generation == generation)
            {
                return;
            }
            let session = state.session.take();
            state.reasoning.clear();
            let woken = state.correlator.fail_all(reason);
            debug!(generation, woken, reason, "tearing down session");
            session
        };
        let Some(session) = session else {
            return;
        };

        session.writer.close().await;
        if !session.dead.is_cancelled() {
            if let Some(pid) = session.pid {
                if let Err(err) = kill_process_group(pid) {
                    debug!(%err, pid, "process group kill failed");
                }
            }
        }
        session.kill.cancel();
    }

    /// Graceful shutdown: `shutdown`, `exit`, close stdin, wait, then kill.
    async fn close(&self) {
        let _guard = self.start_lock.lock().await;
        let Some(session) = self.state.lock().await.session.clone() else {
            return;
        };
        info!(generation = session.generation, "closing agent session");

        if !session.dead.is_cancelled() {
            let no_cancel = CancellationToken::new();
            match self
                .send_request(&session, SHUTDOWN, empty_params(), None)
                .await
            {
                Ok(in_flight) => {
                    if let Err(err) = self
                        .await_response(in_flight, SHUTDOWN_TIMEOUT, &no_cancel)
                        .await
                    {
                        debug!(%err, "shutdown not acknowledged");
                    }
                }
                Err(err) => debug!(%err, "shutdown could not be sent"),
            }
            if let Err(err) = session
                .writer
                .send(&message::notification(EXIT, empty_params()))
                .await
            {
                debug!(%err, "exit notification could not be sent");
            }
            tokio::time::sleep(EXIT_GRACE).await;
            session.writer.close().await;

            if tokio::time::timeout(EXIT_TIMEOUT, session.dead.cancelled())
                .await
                .is_err()
            {
                warn!(pid = session.pid.unwrap_or(0), "agent did not exit, killing");
                if let Some(pid) = session.pid {
                    if let Err(err) = kill_process_group(pid) {
                        error!(%err, pid, "failed to kill agent process group");
                    }
                }
                session.kill.cancel();
                if tokio::time::timeout(EXIT_TIMEOUT, session.dead.cancelled())
                    .await
                    .is_err()
                {
                    error!(pid = session.pid.unwrap_or(0), "agent survived kill");
                }
            }
        }

        let mut state = self.state.lock().await;
        if state
            .session
            .as_ref()
            .is_some_and(|s| s.generation == session.generation)
        {
            state.session = None;
            state.reasoning.clear();
            state.correlator.fail_all(TORN_DOWN);
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

impl BridgeInner {
    async fn call(
        this: &Arc<Self>,
        channel: &ChannelConfig,
        method: &'static str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let owner = Some(channel.channel_id.as_str());
        let timeout = this.config.request_timeout();
        let session = Self::ensure_started(this, channel).await?;

        match this
            .send_request(&session, method, params.clone(), owner)
            .await
        {
            Ok(in_flight) => this.await_response(in_flight, timeout, cancel).await,
            Err(err) if err.is_write_failure() => {
                warn!(%err, generation = session.generation, "write failed, restarting agent");
                let session = Self::restart_after_failure(this, channel, session.generation).await?;
                let in_flight = this.send_request(&session, method, params, owner).await?;
                this.await_response(in_flight, timeout, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    /// Register a slot and write the request.
    async fn send_request(
        &self,
        session: &Session,
        method: &'static str,
        params: Value,
        owner: Option<&str>,
    ) -> Result<InFlight> {
        let (id, slot) = self.state.lock().await.correlator.register(owner);
        self.touch();

        if let Err(err) = session
            .writer
            .send(&message::request(id, method, params))
            .await
        {
            self.state.lock().await.correlator.remove(id);
            return Err(err);
        }
        Ok(InFlight { id, method, slot })
    }

    /// Wait for the response, the timeout or cancellation.
    async fn await_response(
        &self,
        in_flight: InFlight,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let InFlight { id, method, slot } = in_flight;

        let outcome = tokio::select! {
            biased;

            () = cancel.cancelled() => Err(AppError::Cancelled),

            received = tokio::time::timeout(timeout, slot) => match received {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AppError::Write(TORN_DOWN.into())),
                Err(_) => Err(AppError::Timeout(format!(
                    "{method} (id {id}) timed out after {:.1}s",
                    timeout.as_secs_f64()
                ))),
            },
        };

        if matches!(outcome, Err(AppError::Cancelled | AppError::Timeout(_))) {
            self.state.lock().await.correlator.remove(id);
        }
        outcome
    }

    async fn handle_inbound(&self, message: Inbound) {
        match message {
            Inbound::Response { id, outcome } => {
                let Some(id) = id.as_u64() else {
                    debug!(?id, "response with non-numeric id, skipping");
                    return;
                };
                let delivered = self
                    .state
                    .lock()
                    .await
                    .correlator
                    .deliver(id, outcome_to_result(outcome));
                if !delivered {
                    debug!(id, "response for unknown request, skipping");
                }
            }
            Inbound::Notification { method, params } => {
                self.touch();
                let dispatches = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    route_event(&method, &params, &state.correlator, &mut state.reasoning)
                };
                for dispatch in &dispatches {
                    dispatch.deliver(self.observer.as_ref());
                }
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Reader-side handle back into the bridge.
struct SessionEvents {
    inner: Weak<BridgeInner>,
}

impl InboundHandler for SessionEvents {
    fn handle(&self, message: Inbound) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some(inner) = self.inner.upgrade() {
                inner.handle_inbound(message).await;
            }
        })
    }
}

/// Turn idle events into graceful shutdowns.
fn spawn_idle_consumer(mut rx: mpsc::Receiver<IdleEvent>, inner: Weak<BridgeInner>) {
    tokio::spawn(
        async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.state.lock().await.session.is_none() {
                    continue;
                }
                info!(idle_secs = event.idle_for.as_secs(), "idle timeout, closing agent");
                inner.close().await;
            }
            debug!("idle consumer stopped");
        }
        .instrument(info_span!("idle_consumer")),
    );
}
