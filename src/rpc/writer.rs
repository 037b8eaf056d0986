//! Serialised NDJSON writes to the agent's stdin.
//!
//! Callers write directly rather than through a queue so that a broken pipe
//! surfaces to the request that hit it. Concurrent writers are serialised by
//! an internal lock so lines never interleave.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::rpc::log_wire;
use crate::{AppError, Result};

/// Line-oriented JSON writer over an agent's input stream.
#[derive(Debug)]
pub struct LineWriter<W> {
    inner: Mutex<Option<W>>,
    debug: bool,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap an open input stream.
    #[must_use]
    pub fn new(stream: W, debug: bool) -> Self {
        Self {
            inner: Mutex::new(Some(stream)),
            debug,
        }
    }

    /// Serialise `value` as one line and write it.
    ///
    /// # Errors
    ///
    /// - [`AppError::Codec`] if serialisation fails.
    /// - [`AppError::Write`] if the stream is closed or the write fails
    ///   (e.g. the agent process has exited).
    pub async fn send(&self, value: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)
            .map_err(|e| AppError::Codec(format!("failed to serialise outbound message: {e}")))?;
        log_wire(self.debug, "=>", &String::from_utf8_lossy(&bytes));
        bytes.push(b'\n');

        let mut guard = self.inner.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(AppError::Write("input stream closed".into()));
        };
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| AppError::Write(format!("write failed: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| AppError::Write(format!("flush failed: {e}")))
    }

    /// Close the stream so the agent sees EOF. Idempotent.
    pub async fn close(&self) {
        let taken = self.inner.lock().await.take();
        if let Some(mut stream) = taken {
            if let Err(err) = stream.shutdown().await {
                debug!(%err, "writer: shutdown of input stream failed");
            }
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}
