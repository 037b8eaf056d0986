//! Callbacks from the bridge to the chat front-end.
//!
//! Every method has a no-op default so front-ends implement only what they
//! render. Callbacks run on the bridge's reader task with no bridge lock
//! held; they must return quickly and must not call back into the bridge.

/// Receiver of streaming, reasoning and lifecycle events.
pub trait BridgeObserver: Send + Sync {
    /// Intermediate reasoning for `owner`, already truncated for display.
    fn on_reasoning(&self, _owner: &str, _text: &str) {}

    /// Reasoning for `owner`'s current turn has finished.
    fn on_reasoning_end(&self, _owner: &str) {}

    /// One chunk of the reply to request `request_id`.
    fn on_stream_delta(&self, _owner: &str, _request_id: u64, _delta: &str) {}

    /// Complete reply text for request `request_id`.
    fn on_stream_done(&self, _owner: &str, _request_id: u64, _text: &str) {}

    /// A new agent process finished its handshake.
    fn on_process_up(&self) {}

    /// The agent process exited or was torn down.
    fn on_process_down(&self) {}

    /// Whether replies reach the user through the stream callbacks.
    ///
    /// When `true`, chat turns return no messages so nothing is posted twice.
    fn streams_replies(&self) -> bool {
        false
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BridgeObserver for NoopObserver {}
