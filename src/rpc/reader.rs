//! Agent stdout reader task.
//!
//! Reads newline-delimited JSON from the agent, classifies each line with
//! [`parse_inbound_line`], and hands the result to an [`InboundHandler`].
//!
//! The reader is driven by [`FramedRead`] backed by [`RpcCodec`], which
//! enforces the per-line limit before any JSON parsing. Blank, malformed and
//! over-long lines are skipped; they never stop the task. The task ends on
//! EOF, on an I/O error, or when `cancel` fires.

use std::future::Future;
use std::pin::Pin;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::codec::RpcCodec;
use crate::rpc::log_wire;
use crate::rpc::message::{parse_inbound_line, Inbound};

/// Consumer of classified inbound messages.
pub trait InboundHandler: Send + Sync {
    /// Process one message. Must not wait on a caller.
    fn handle(&self, message: Inbound) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Why the reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The agent closed its stdout.
    Eof,
    /// The underlying stream failed.
    Failed(String),
    /// The cancellation token fired.
    Cancelled,
}

/// Read `stdout` until it closes, dispatching each message to `handler`.
pub async fn run_reader<R, H>(
    stdout: R,
    handler: &H,
    cancel: CancellationToken,
    debug_wire: bool,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
    H: InboundHandler + ?Sized,
{
    let mut framed = FramedRead::new(stdout, RpcCodec::new());

    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => item,
        };

        match item {
            None => {
                debug!("rpc reader: EOF detected");
                return ReaderExit::Eof;
            }

            Some(Err(e)) => {
                warn!(error = %e, "rpc reader: IO error, stopping");
                return ReaderExit::Failed(e.to_string());
            }

            Some(Ok(line)) => {
                log_wire(debug_wire, "<=", &line);
                match parse_inbound_line(&line) {
                    Ok(Some(message)) => handler.handle(message).await,
                    Ok(None) => {}
                    Err(e) => {
                        debug!(error = %e, "rpc reader: unparseable line, skipping");
                    }
                }
            }
        }
    }
}
