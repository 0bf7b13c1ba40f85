//! NUL/LF delimited message framing for the control protocol.
//!
//! The control server terminates every JSON message with either a NUL byte
//! or a line feed. Both are accepted on receive; requests are always sent
//! with a single trailing NUL.
//!
//! # Wire Format
//!
//! ```text
//! {"id":1,"result":true}\0{"method":"EngineStatus","params":{}}\n
//! ```
//!
//! The delimiter carries no meaning beyond "this message is complete".

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Terminator appended to every outbound frame.
pub const FRAME_TERMINATOR: u8 = 0x00;

/// Default cap on buffered, not yet terminated bytes (16MB).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

/// Errors raised while splitting the inbound byte stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The unterminated tail of the stream grew past the configured cap.
    #[error("Unterminated frame of {buffered} bytes exceeds maximum {limit} bytes")]
    BufferOverflow {
        /// Bytes currently held without a delimiter.
        buffered: usize,
        /// Configured cap.
        limit: usize,
    },
}

fn is_delimiter(byte: u8) -> bool {
    byte == 0x00 || byte == b'\n'
}

/// Incremental splitter for the inbound byte stream.
///
/// Holds only the bytes that follow the last delimiter seen so far, so
/// every byte is scanned exactly once no matter how the stream is chunked.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_buffered: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED_BYTES)
    }
}

impl FrameBuffer {
    /// Create an empty buffer that refuses to hold more than `max_buffered`
    /// unterminated bytes.
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_buffered,
        }
    }

    /// Number of bytes currently waiting for a delimiter.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and return every frame it completes, in order.
    ///
    /// Frames are trimmed of surrounding ASCII whitespace; spans that are
    /// empty after trimming (keepalive NULs, `\0\n` pairs) are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::BufferOverflow`] when the bytes left after the
    /// last delimiter exceed the cap. The buffer is cleared in that case; the
    /// stream is no longer trustworthy and the caller should drop it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        let mut frames = Vec::new();

        // Everything already buffered is delimiter-free, so only the new
        // chunk needs scanning.
        let mut start = 0;
        for (i, &byte) in chunk.iter().enumerate() {
            if !is_delimiter(byte) {
                continue;
            }

            let frame = if self.buf.is_empty() {
                trim_ascii(&chunk[start..i]).to_vec()
            } else {
                self.buf.extend_from_slice(&chunk[start..i]);
                let joined = std::mem::take(&mut self.buf);
                trim_ascii(&joined).to_vec()
            };

            if !frame.is_empty() {
                frames.push(frame);
            }
            start = i + 1;
        }

        self.buf.extend_from_slice(&chunk[start..]);

        if self.buf.len() > self.max_buffered {
            let buffered = self.buf.len();
            self.buf = Vec::new();
            return Err(FramingError::BufferOverflow {
                buffered,
                limit: self.max_buffered,
            });
        }

        Ok(frames)
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Write one NUL-terminated message to the stream.
///
/// # Wire Format
///
/// ```text
/// <body>\0
/// ```
///
/// # Errors
///
/// Returns the underlying I/O error if the write or flush fails.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.extend_from_slice(body);
    framed.push(FRAME_TERMINATOR);

    writer.write_all(&framed).await?;
    writer.flush().await
}
