//! Routing of `codex/event` notifications to their owners.
//!
//! [`route_event`] runs under the bridge lock and only computes what to do;
//! the resulting [`Dispatch`]es are delivered to the observer after the lock
//! is released.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::bridge::correlator::Correlator;
use crate::bridge::observer::BridgeObserver;
use crate::rpc::message::RequestId;
use crate::text::truncate;

/// Notification method carrying agent events.
pub const EVENT_METHOD: &str = "codex/event";

/// Longest reasoning text forwarded to the observer.
pub const REASONING_PREVIEW_BYTES: usize = 120;

/// Typed view of an event's `msg` member.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexEvent {
    /// Chunk of intermediate reasoning.
    AgentReasoningDelta {
        /// Appended text.
        #[serde(default)]
        delta: String,
    },
    /// Final reasoning text.
    AgentReasoning {
        /// Reasoning text.
        #[serde(default, alias = "text")]
        message: String,
    },
    /// Chunk of the reply.
    AgentMessageDelta {
        /// Appended text.
        #[serde(default)]
        delta: String,
    },
    /// Complete reply.
    AgentMessage {
        /// Reply text.
        #[serde(default)]
        message: String,
    },
    /// The agent finished the turn.
    TaskComplete,
    /// Anything else (`task_started`, `token_count`, ...).
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct EventParams {
    #[serde(rename = "_meta", default)]
    meta: Option<EventMeta>,
    #[serde(default)]
    msg: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct EventMeta {
    #[serde(rename = "requestId", default)]
    request_id: Option<Value>,
}

/// One observer call produced by routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// [`BridgeObserver::on_reasoning`].
    Reasoning {
        /// Owner of the request.
        owner: String,
        /// Truncated reasoning text.
        text: String,
    },
    /// [`BridgeObserver::on_reasoning_end`].
    ReasoningEnd {
        /// Owner of the request.
        owner: String,
    },
    /// [`BridgeObserver::on_stream_delta`].
    Delta {
        /// Owner of the request.
        owner: String,
        /// Request the chunk belongs to.
        request_id: u64,
        /// Raw chunk.
        delta: String,
    },
    /// [`BridgeObserver::on_stream_done`].
    Done {
        /// Owner of the request.
        owner: String,
        /// Request the reply belongs to.
        request_id: u64,
        /// Full reply.
        text: String,
    },
}

impl Dispatch {
    /// Invoke the matching observer callback.
    pub fn deliver(&self, observer: &dyn BridgeObserver) {
        match self {
            Self::Reasoning { owner, text } => observer.on_reasoning(owner, text),
            Self::ReasoningEnd { owner } => observer.on_reasoning_end(owner),
            Self::Delta {
                owner,
                request_id,
                delta,
            } => observer.on_stream_delta(owner, *request_id, delta),
            Self::Done {
                owner,
                request_id,
                text,
            } => observer.on_stream_done(owner, *request_id, text),
        }
    }
}

/// Accumulated reasoning text per request id.
///
/// Events without a request id share key `0`.
pub type ReasoningBuffers = HashMap<u64, String>;

/// Decide the observer calls for one notification.
///
/// Non-event methods, events without a `msg`, and events whose request has
/// no known owner produce nothing. Reasoning is only buffered for owned
/// requests; ownerless deltas never reach the buffers.
pub fn route_event(
    method: &str,
    params: &Value,
    correlator: &Correlator,
    reasoning: &mut ReasoningBuffers,
) -> Vec<Dispatch> {
    if method != EVENT_METHOD {
        return Vec::new();
    }
    let Ok(params) = EventParams::deserialize(params) else {
        debug!("router: event params not an object, dropping");
        return Vec::new();
    };
    let Some(msg) = params.msg else {
        return Vec::new();
    };
    let event = CodexEvent::deserialize(&msg).unwrap_or(CodexEvent::Other);

    let request_id = params
        .meta
        .and_then(|m| m.request_id)
        .as_ref()
        .and_then(RequestId::from_value)
        .and_then(|id| id.as_u64());
    let key = request_id.unwrap_or(0);
    let owner = request_id
        .and_then(|id| correlator.owner_of(id))
        .map(str::to_owned);

    let mut out = Vec::new();
    match event {
        CodexEvent::AgentReasoningDelta { delta } => {
            if let Some(owner) = owner.filter(|_| !delta.is_empty()) {
                let buf = reasoning.entry(key).or_default();
                buf.push_str(&delta);
                out.push(Dispatch::Reasoning {
                    owner,
                    text: truncate(buf, REASONING_PREVIEW_BYTES),
                });
            }
        }
        CodexEvent::AgentReasoning { message } => {
            if let Some(owner) = owner.filter(|_| !message.is_empty()) {
                out.push(Dispatch::Reasoning {
                    owner,
                    text: truncate(&message, REASONING_PREVIEW_BYTES),
                });
            }
        }
        CodexEvent::AgentMessageDelta { delta } => {
            if let Some(owner) = owner.filter(|_| !delta.is_empty()) {
                out.push(Dispatch::Delta {
                    owner,
                    request_id: key,
                    delta,
                });
            }
        }
        CodexEvent::AgentMessage { message } => {
            reasoning.remove(&key);
            if let Some(owner) = owner {
                out.push(Dispatch::Done {
                    owner: owner.clone(),
                    request_id: key,
                    text: message,
                });
                out.push(Dispatch::ReasoningEnd { owner });
            }
        }
        CodexEvent::TaskComplete => {
            reasoning.remove(&key);
            if let Some(owner) = owner {
                out.push(Dispatch::ReasoningEnd { owner });
            }
        }
        CodexEvent::Other => {}
    }

    if out.is_empty() && request_id.is_some_and(|id| correlator.owner_of(id).is_none()) {
        debug!(request_id = key, "router: event for unknown request, dropping");
    }
    out
}
