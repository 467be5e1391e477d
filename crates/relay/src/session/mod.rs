//! Session management module.
//!
//! A session is one accepted client connection. This module provides the
//! session identity and lifecycle types, the [`SessionHandle`] other tasks use
//! to queue frames for a client, the [`SessionRegistry`] of live sessions, and
//! the [`Session`] task that drives one connection.

pub mod registry;
pub mod runner;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use protocol::{Frame, FrameCodec, ProtocolError};
use tokio::sync::mpsc;

pub use registry::{BroadcastReport, SessionRegistry, DEFAULT_OUTBOUND_QUEUE};
pub use runner::{Session, SessionError};

/// Unique identifier for a session, stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw counter value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted and registered, join not yet announced.
    Connected,
    /// Reading and dispatching frames.
    Active,
    /// Read loop finished, cleanup in progress.
    Closing,
    /// Removed from the registry and socket closed.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Errors returned when queueing a frame for a session.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The frame could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),

    /// The session's writer has stopped.
    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// Cloneable handle for queueing outbound frames to one session.
///
/// Frames are queued as encoded bytes and written in order by the session's
/// writer task, so the bytes of two frames never interleave on the socket.
/// A full queue makes the sender wait until the writer catches up; frames are
/// never dropped while the session is alive.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    codec: FrameCodec,
    stalls: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        capacity: usize,
        codec: FrameCodec,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = SessionHandle {
            id,
            peer,
            tx,
            codec,
            stalls: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }

    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Number of sends that had to wait for queue space.
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Encode a frame and queue it, waiting for queue space.
    pub async fn send(&self, frame: &Frame) -> Result<(), SendError> {
        let bytes = Bytes::from(self.codec.encode(frame)?);
        self.send_encoded(bytes).await
    }

    /// Queue already-encoded bytes, waiting for queue space.
    ///
    /// Fails only once the session's writer has stopped.
    pub async fn send_encoded(&self, bytes: Bytes) -> Result<(), SendError> {
        match self.tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(bytes)) => {
                let stalls = self.stalls.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(session_id = %self.id, stalls, "Outbound queue full, waiting");
                self.tx
                    .send(bytes)
                    .await
                    .map_err(|_| SendError::Closed(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed(self.id)),
        }
    }
}
