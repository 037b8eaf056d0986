//! Per-owner conversation continuity.
//!
//! The agent keeps conversation history itself and hands back an opaque
//! token. The store only remembers which token belongs to which owner and
//! decides whether a turn starts a conversation or continues one.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Map, Value};

/// Method used for both conversation verbs.
pub const TOOLS_CALL: &str = "tools/call";

/// Tool that starts a conversation.
pub const START_TOOL: &str = "codex";

/// Tool that continues a conversation.
pub const REPLY_TOOL: &str = "codex-reply";

/// Sandbox policy requested for new conversations.
pub const SANDBOX_POLICY: &str = "workspace-write";

/// Approval policy requested for new conversations.
pub const APPROVAL_POLICY: &str = "never";

/// Owner → continuation token.
#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    bindings: HashMap<String, String>,
}

impl ConversationStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `token` for `owner`, replacing any previous one.
    pub fn bind(&mut self, owner: &str, token: impl Into<String>) {
        self.bindings.insert(owner.to_owned(), token.into());
    }

    /// Token bound to `owner`, if any.
    #[must_use]
    pub fn lookup(&self, owner: &str) -> Option<&str> {
        self.bindings.get(owner).map(String::as_str)
    }

    /// Forget `owner`'s conversation. Returns whether one existed.
    pub fn reset(&mut self, owner: &str) -> bool {
        self.bindings.remove(owner).is_some()
    }

    /// Number of bound owners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no owner is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// The tool call for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnCall {
    /// `codex` or `codex-reply`.
    pub tool: &'static str,
    /// Tool arguments.
    pub arguments: Value,
}

impl TurnCall {
    /// First turn of a conversation.
    ///
    /// A non-blank `preamble` is prepended to the prompt.
    #[must_use]
    pub fn start(prompt: &str, preamble: &str, cwd: Option<&Path>, user: Option<&str>) -> Self {
        let prompt = prompt.trim();
        let preamble = preamble.trim();
        let prompt = if preamble.is_empty() {
            prompt.to_owned()
        } else {
            format!("{preamble}\n\n{prompt}")
        };

        let mut args = Map::new();
        args.insert("prompt".into(), Value::String(prompt));
        args.insert("sandbox".into(), Value::String(SANDBOX_POLICY.into()));
        args.insert("approval-policy".into(), Value::String(APPROVAL_POLICY.into()));
        if let Some(dir) = cwd {
            args.insert("cwd".into(), Value::String(dir.to_string_lossy().into_owned()));
        }
        insert_user(&mut args, user);

        Self {
            tool: START_TOOL,
            arguments: Value::Object(args),
        }
    }

    /// Follow-up turn in the conversation identified by `token`.
    #[must_use]
    pub fn reply(prompt: &str, token: &str, user: Option<&str>) -> Self {
        let mut args = Map::new();
        args.insert("prompt".into(), Value::String(prompt.trim().to_owned()));
        args.insert("conversationId".into(), Value::String(token.to_owned()));
        insert_user(&mut args, user);

        Self {
            tool: REPLY_TOOL,
            arguments: Value::Object(args),
        }
    }

    /// Whether this call starts a new conversation.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.tool == START_TOOL
    }

    /// `tools/call` parameters for this call.
    #[must_use]
    pub fn params(&self) -> Value {
        json!({ "name": self.tool, "arguments": self.arguments })
    }
}

fn insert_user(args: &mut Map<String, Value>, user: Option<&str>) {
    if let Some(user) = user.map(str::trim).filter(|u| !u.is_empty()) {
        args.insert("user".into(), Value::String(user.to_owned()));
    }
}
