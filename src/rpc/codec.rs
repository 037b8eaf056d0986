//! NDJSON codec for the agent's stdio streams.
//!
//! Frames on raw `\n`-delimited bytes with
//! [`tokio_util::codec::AnyDelimiterCodec`] and a maximum line length so an
//! unterminated or runaway line from the agent cannot exhaust memory. Lines
//! are decoded lossily: stray non-UTF-8 bytes become U+FFFD and the line is
//! left for the JSON parser to accept or skip. Protocol lines carrying whole
//! tool results can be large, so the limit is generous.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum line length accepted from the agent: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited JSON framing for agent streams.
///
/// Inbound lines longer than [`MAX_LINE_BYTES`] are discarded with a warning
/// and decoding resumes after the next `\n`; no error is surfaced, so a
/// [`FramedRead`](tokio_util::codec::FramedRead) keeps yielding lines. A
/// trailing `\r` is stripped. I/O errors map to [`AppError::Io`].
#[derive(Debug)]
pub struct RpcCodec(AnyDelimiterCodec);

impl RpcCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            MAX_LINE_BYTES,
        ))
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => warn_discarded(),
                other => return other.map(|line| line.map(into_text)).map_err(map_codec_error),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src) {
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => warn_discarded(),
                other => return other.map(|line| line.map(into_text)).map_err(map_codec_error),
            }
        }
    }
}

impl Encoder<String> for RpcCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn into_text(line: Bytes) -> String {
    let text = String::from_utf8_lossy(&line);
    text.strip_suffix('\r').unwrap_or(&text).to_owned()
}

fn warn_discarded() {
    warn!(limit = MAX_LINE_BYTES, "discarding over-long line from agent");
}

fn map_codec_error(e: AnyDelimiterCodecError) -> AppError {
    match e {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => {
            AppError::Codec(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        AnyDelimiterCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
