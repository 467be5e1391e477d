//! Async frame I/O over a byte stream.
//!
//! [`FrameReader`] accumulates bytes until the codec can decode a whole frame,
//! so the stream may be split across reads at any byte boundary.
//! [`FrameWriter`] writes one whole frame per call and flushes.

use std::io;

use bytes::{Buf, BytesMut};
use protocol::{Decoded, Frame, FrameCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Minimum free buffer space requested before each read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors that can occur on a framed connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The byte stream violated the framing rules.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Reads decoded frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader using the given codec limits.
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            codec,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `None` once the peer has closed the stream and every buffered
    /// byte has been decoded. Cancel safe: bytes read before cancellation stay
    /// buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails or the stream cannot be framed
    /// (oversized payload, over-long line, payload cut short by EOF).
    pub async fn next_frame(&mut self) -> Result<Option<Decoded>, ConnectionError> {
        loop {
            if let Some((decoded, consumed)) = self.codec.try_decode(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(Some(decoded));
            }

            if self.buffer.capacity() - self.buffer.len() < READ_CHUNK_SIZE {
                self.buffer.reserve(READ_CHUNK_SIZE);
            }

            let bytes_read = self.reader.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                return match self.codec.decode_eof(&self.buffer)? {
                    Some((decoded, consumed)) => {
                        self.buffer.advance(consumed);
                        Ok(Some(decoded))
                    }
                    None => Ok(None),
                };
            }
        }
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a writer using the given codec limits.
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self { writer, codec }
    }

    /// Encode and write one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let bytes = self.codec.encode(frame)?;
        self.write_encoded(&bytes).await
    }

    /// Write bytes that already hold one or more whole encoded frames.
    pub async fn write_encoded(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
