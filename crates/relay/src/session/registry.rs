//! Registry of live sessions.
//!
//! Registry membership bounds a session's lifetime: a session is added when
//! its connection is accepted and removed during cleanup. Broadcasts go to a
//! snapshot of the members at the time of the call.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use protocol::{Frame, FrameCodec, ProtocolError};
use tokio::sync::mpsc;

use super::{SessionHandle, SessionId};

/// Default capacity of each session's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Per-call delivery counts for a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the frame was queued for.
    pub delivered: usize,
    /// Sessions whose writer had already stopped.
    pub closed: usize,
}

/// Thread-safe registry of sessions backed by DashMap.
pub struct SessionRegistry {
    /// Map of session ID to handle.
    sessions: DashMap<SessionId, SessionHandle>,
    /// Next ID to hand out.
    next_id: AtomicU64,
    /// Outbound queue capacity for new sessions.
    queue_capacity: usize,
    /// Codec used to encode broadcasts and direct replies.
    codec: FrameCodec,
}

impl SessionRegistry {
    /// Creates a registry with the default queue capacity and codec.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_OUTBOUND_QUEUE, FrameCodec::new())
    }

    /// Creates a registry with a custom queue capacity and codec.
    pub fn with_options(queue_capacity: usize, codec: FrameCodec) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
            codec,
        }
    }

    /// The codec shared by all sessions.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Allocates an ID for a new connection and adds it to the registry.
    ///
    /// Returns the handle and the receiver the session's writer drains.
    pub fn register(&self, peer: SocketAddr) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, rx) = SessionHandle::new(id, peer, self.queue_capacity, self.codec.clone());
        self.insert(handle.clone());
        (handle, rx)
    }

    /// Adds a handle. Replaces any handle with the same ID.
    pub fn insert(&self, handle: SessionHandle) {
        let id = handle.id();
        if self.sessions.insert(id, handle).is_some() {
            tracing::warn!(session_id = %id, "Replaced existing session handle");
        }
        tracing::debug!(session_id = %id, count = self.sessions.len(), "Registered session");
    }

    /// Removes a session. Returns its handle if it was registered.
    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        let removed = self.sessions.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!(session_id = %id, count = self.sessions.len(), "Removed session");
        }
        removed
    }

    /// Gets a session's handle.
    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Checks if a session is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the registered IDs in ascending order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Encodes a frame once and queues it for every registered session.
    ///
    /// Waits for queue space on each target in turn, so a session that stops
    /// reading stalls the broadcaster until its writer fails or is stopped.
    pub async fn broadcast_all(&self, frame: &Frame) -> Result<BroadcastReport, ProtocolError> {
        let bytes = Bytes::from(self.codec.encode(frame)?);
        Ok(self.broadcast_encoded(bytes).await)
    }

    /// Queues already-encoded bytes for every registered session.
    pub async fn broadcast_encoded(&self, bytes: Bytes) -> BroadcastReport {
        // Snapshot so no shard lock is held while delivering
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = BroadcastReport::default();
        for handle in &targets {
            match handle.send_encoded(bytes.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    tracing::debug!(session_id = %handle.id(), "Skipping closed session");
                    report.closed += 1;
                }
            }
        }

        tracing::trace!(
            delivered = report.delivered,
            closed = report.closed,
            "Broadcast frame"
        );
        report
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
