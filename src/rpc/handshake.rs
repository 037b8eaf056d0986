//! Initialization handshake parameters.
//!
//! After spawning, the bridge sends an `initialize` request and then,
//! whether or not it was answered, an `initialized` notification. Some agents
//! delay or never answer `initialize`, so the wait is short and a timeout is
//! not an error.

use std::time::Duration;

use serde_json::{json, Value};

/// Method name of the initialize request.
pub const INITIALIZE: &str = "initialize";

/// Method name of the post-initialize notification.
pub const INITIALIZED: &str = "initialized";

/// Method name of the graceful shutdown request.
pub const SHUTDOWN: &str = "shutdown";

/// Method name of the final exit notification.
pub const EXIT: &str = "exit";

/// Protocol revision announced to the agent.
pub const PROTOCOL_VERSION: &str = "2024-05-31";

/// Client name announced to the agent.
pub const CLIENT_NAME: &str = "discodex";

/// How long to wait for the `initialize` reply.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_millis(700);

/// Parameters for the `initialize` request.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Parameters shared by the parameterless methods.
#[must_use]
pub fn empty_params() -> Value {
    json!({})
}
