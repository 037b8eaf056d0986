//! Session log follower and early-output capture.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::extract;
use crate::tail::queue::OutputQueue;
use crate::{AppError, Result};

/// Sleep between reads once the end of the log is reached.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Bytes of agent stdout/stderr kept for diagnostics.
pub const CAPTURE_LIMIT: usize = 64 * 1024;

/// Open the session log positioned at its current end.
///
/// # Errors
///
/// Returns `AppError::Discovery` if the file cannot be opened.
pub async fn open_at_end(path: &Path) -> Result<File> {
    let mut file = File::open(path).await.map_err(|err| {
        AppError::Discovery(format!("cannot open session log {}: {err}", path.display()))
    })?;
    if let Err(err) = file.seek(SeekFrom::End(0)).await {
        debug!(%err, "seek to end of session log failed, reading from start");
    }
    Ok(file)
}

/// Follow an open session log, pushing extracted agent messages onto
/// `queue` until `cancel` fires or a read fails.
///
/// Only complete lines are parsed; a partially written line is held until
/// its newline arrives. Lines are decoded lossily, so stray non-UTF-8 bytes
/// never stop the tail.
pub async fn follow_log(
    file: File,
    path: PathBuf,
    queue: Arc<OutputQueue>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(file);
    let mut line: Vec<u8> = Vec::new();
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
                }
            }
            Ok(_) if line.last() != Some(&b'\n') => {}
            Ok(_) => {
                let message = extract::log_line_message(&String::from_utf8_lossy(&line));
                if let Some(message) = message {
                    if let Some(dropped) = queue.push(message).await {
                        debug!(dropped_len = dropped.len(), "output queue full, dropped oldest");
                    }
                }
                line.clear();
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "session log read failed, stopping tail");
                return;
            }
        }
    }
}

/// Append-only byte buffer that silently stops growing at its limit.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl CappedBuffer {
    /// Empty buffer keeping at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    /// Append what fits of `chunk`.
    pub async fn extend(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().await;
        let room = self.limit.saturating_sub(bytes.len());
        bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Contents so far, lossily decoded.
    pub async fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock().await).into_owned()
    }

    /// Read `stream` to EOF into this buffer. Reading continues past the
    /// limit so the writer never blocks on a full pipe.
    #[must_use]
    pub fn capture<R>(&self, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let mut chunk = [0_u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buffer.extend(&chunk[..n]).await,
                }
            }
        })
    }
}
