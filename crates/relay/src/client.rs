//! Client for talking to a chat relay server.
//!
//! The client speaks the same framed protocol as the server. Chat lines may
//! arrive at any time, so helpers that wait for a file response skip over
//! text lines until the matching frame arrives.

use std::io;
use std::time::Duration;

use protocol::{Decoded, Frame, FrameCodec};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use crate::connection::{ConnectionError, FrameReader, FrameWriter};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Errors that can occur in the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting to the server failed.
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),

    /// Reading or writing a frame failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// No frame arrived within the timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server closed the connection.
    #[error("server closed the connection")]
    Disconnected,

    /// The server refused a download.
    #[error("download failed: {0}")]
    Download(String),
}

/// A connected chat client.
pub struct ChatClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    timeout: Duration,
}

impl ChatClient {
    /// Connect to a server with the default timeout.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to a server with a custom timeout for every operation.
    pub async fn connect_with_timeout<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ClientError::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })?
            .map_err(ClientError::Connect)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half, FrameCodec::new()),
            writer: FrameWriter::new(write_half, FrameCodec::new()),
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send any frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ClientError> {
        tokio::time::timeout(self.timeout, self.writer.write_frame(frame))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(())
    }

    /// Send a chat line.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(&Frame::text(text)).await
    }

    /// Upload a file.
    pub async fn upload(&mut self, name: &str, bytes: &[u8]) -> Result<(), ClientError> {
        self.send(&Frame::FileSend {
            filename: name.to_string(),
            payload: bytes.to_vec(),
        })
        .await
    }

    /// Ask for the list of stored files.
    pub async fn request_list(&mut self) -> Result<(), ClientError> {
        self.send(&Frame::FileListRequest).await
    }

    /// Ask for the contents of a file.
    pub async fn request_download(&mut self, name: &str) -> Result<(), ClientError> {
        self.send(&Frame::FileDownloadRequest {
            filename: name.to_string(),
        })
        .await
    }

    /// Wait for the next frame from the server.
    ///
    /// Returns `None` once the server has closed the connection. Malformed
    /// frames are logged and skipped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            let next = tokio::time::timeout(self.timeout, self.reader.next_frame())
                .await
                .map_err(|_| ClientError::Timeout(self.timeout))??;

            match next {
                Some(Decoded::Frame(frame)) => return Ok(Some(frame)),
                Some(Decoded::Malformed { line, reason }) => {
                    warn!(line = %line, reason = %reason, "Skipping malformed frame from server");
                }
                None => return Ok(None),
            }
        }
    }

    /// Wait for the next chat line, skipping file responses.
    pub async fn next_text(&mut self) -> Result<String, ClientError> {
        loop {
            match self.next_frame().await?.ok_or(ClientError::Disconnected)? {
                Frame::TextLine { content } => return Ok(content),
                other => debug!(kind = other.kind(), "Skipping non-text frame"),
            }
        }
    }

    /// Request the file list and wait for the response.
    pub async fn list_files(&mut self) -> Result<Vec<String>, ClientError> {
        self.request_list().await?;
        loop {
            match self.next_frame().await?.ok_or(ClientError::Disconnected)? {
                Frame::FileListResponse { names } => return Ok(names),
                other => skip(&other),
            }
        }
    }

    /// Request a file and wait for its contents.
    pub async fn download(&mut self, name: &str) -> Result<Vec<u8>, ClientError> {
        self.request_download(name).await?;
        loop {
            match self.next_frame().await?.ok_or(ClientError::Disconnected)? {
                Frame::FileDownloadResponse { filename, payload } if filename == name => {
                    return Ok(payload)
                }
                Frame::FileDownloadError { message } => return Err(ClientError::Download(message)),
                other => skip(&other),
            }
        }
    }

    /// Close the write side so the server sees end of stream.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn skip(frame: &Frame) {
    match frame {
        Frame::TextLine { content } => debug!(content = %content, "Skipping chat line"),
        other => debug!(kind = other.kind(), "Skipping unrelated frame"),
    }
}
