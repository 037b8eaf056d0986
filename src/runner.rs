//! Front-end facing entry point for chat turns.
//!
//! The [`ChatRunner`] trait decouples chat front-ends from the transport
//! that reaches the agent. [`McpBridge`](crate::bridge::McpBridge),
//! [`TailBridge`](crate::tail::TailBridge) and [`EchoRunner`] implement it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::observer::BridgeObserver;
use crate::bridge::McpBridge;
use crate::config::{ChannelConfig, GlobalConfig, Transport};
use crate::tail::TailBridge;
use crate::Result;

/// Per-turn metadata supplied by the front-end.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    /// Who sent the message, forwarded to the agent as `user`.
    pub user_tag: Option<String>,
    /// Fires when the front-end gives up on the turn.
    pub cancel: CancellationToken,
}

impl TurnContext {
    /// Context tagged with `user`.
    #[must_use]
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user_tag: Some(user.into()),
            cancel: CancellationToken::new(),
        }
    }

    /// The user tag, if set and non-blank.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user_tag
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// A transport that runs chat turns against the agent.
pub trait ChatRunner: Send + Sync {
    /// Run one turn and return the messages to post, in order.
    ///
    /// An empty vector means nothing should be posted (for example because
    /// the reply was already streamed).
    ///
    /// # Errors
    ///
    /// Returns the transport's start, write, timeout, protocol or
    /// cancellation error.
    fn chat_multi<'a>(
        &'a self,
        channel: &'a ChannelConfig,
        prompt: &'a str,
        ctx: &'a TurnContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

    /// Run one turn and return its messages joined by blank lines.
    ///
    /// # Errors
    ///
    /// Same as [`chat_multi`](Self::chat_multi).
    fn chat<'a>(
        &'a self,
        channel: &'a ChannelConfig,
        prompt: &'a str,
        ctx: &'a TurnContext,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let messages = self.chat_multi(channel, prompt, ctx).await?;
            Ok(messages.join("\n\n"))
        })
    }

    /// Forget `owner`'s conversation so the next turn starts fresh.
    fn reset<'a>(&'a self, owner: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Shut down every agent process this runner owns.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Build the runner selected by `config.codex.transport`.
#[must_use]
pub fn build_runner(config: &GlobalConfig, observer: Arc<dyn BridgeObserver>) -> Arc<dyn ChatRunner> {
    match config.codex.transport {
        Transport::Rpc => Arc::new(McpBridge::new(config.codex.clone(), observer)),
        Transport::Tail => Arc::new(TailBridge::new(config.codex.clone())),
        Transport::Echo => Arc::new(EchoRunner),
    }
}

// ── Echo ─────────────────────────────────────────────────────────────────────

/// Marker prepended to every echo reply.
pub const ECHO_PREFIX: &str = "[codex-stub]";

/// Runner that echoes the prompt back without any agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunner;

impl ChatRunner for EchoRunner {
    fn chat_multi<'a>(
        &'a self,
        _channel: &'a ChannelConfig,
        prompt: &'a str,
        _ctx: &'a TurnContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            let prompt = prompt.trim();
            if prompt.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![format!("{ECHO_PREFIX}\n{prompt}")])
        })
    }

    fn reset<'a>(&'a self, _owner: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}
