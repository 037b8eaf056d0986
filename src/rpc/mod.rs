//! JSON-RPC over the agent's stdio.
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based NDJSON framing.
//! - `message`: envelope builders and inbound classification.
//! - `reader`: stdout reader task feeding an [`InboundHandler`](reader::InboundHandler).
//! - `writer`: serialised line writes to stdin.
//! - `spawner`: command resolution, process spawning and exit handling.
//! - `handshake`: `initialize` / `initialized` parameters.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod reader;
pub mod spawner;
pub mod writer;

use tracing::{info, trace};

use crate::text::truncate;

/// Longest slice of a protocol line written to the log.
const WIRE_LOG_BYTES: usize = 240;

/// Log one protocol line under the `discodex::wire` target.
///
/// With `debug` set the line is logged at `INFO`, otherwise at `TRACE`.
pub fn log_wire(debug: bool, direction: &str, line: &str) {
    let line = truncate(line.trim(), WIRE_LOG_BYTES);
    if debug {
        info!(target: "discodex::wire", direction, %line);
    } else {
        trace!(target: "discodex::wire", direction, %line);
    }
}
