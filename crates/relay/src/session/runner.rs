//! Per-connection session task.
//!
//! A [`Session`] owns one client socket. The read half is driven by the
//! session's read loop, which decodes frames and hands them to the router.
//! The write half belongs to a writer task that drains the session's
//! outbound queue in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::Decoded;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionHandle, SessionId, SessionRegistry, SessionState};
use crate::connection::{ConnectionError, FrameReader, FrameWriter};
use crate::router::{MessageRouter, RouterError};

/// How long cleanup waits for queued frames to be flushed.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reasons a session ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Reading from the socket failed or the stream could not be framed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A reply could not be queued.
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// One client connection from accept to close.
pub struct Session {
    handle: SessionHandle,
    outbound: mpsc::Receiver<Bytes>,
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    state: SessionState,
}

impl Session {
    /// Register a newly accepted connection.
    pub fn register(peer: SocketAddr, router: Arc<MessageRouter>) -> Self {
        let registry = router.registry().clone();
        let (handle, outbound) = registry.register(peer);
        info!(session_id = %handle.id(), peer = %peer, "Client connected");
        Self {
            handle,
            outbound,
            registry,
            router,
            state: SessionState::Connected,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    /// Returns a handle for queueing frames to this session.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until the peer disconnects, a fatal error occurs, or
    /// `shutdown` is cancelled.
    ///
    /// Cleanup runs on every exit path: the session is removed from the
    /// registry, queued frames are flushed, the socket is closed and the
    /// departure is announced.
    pub async fn run<S>(self, stream: S, shutdown: CancellationToken) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Session {
            handle,
            outbound,
            registry,
            router,
            mut state,
        } = self;
        let id = handle.id();

        let codec = registry.codec().clone();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, codec.clone());
        let writer = FrameWriter::new(write_half, codec);

        // Cancelled by shutdown or by a write failure
        let session_token = shutdown.child_token();
        let writer_stop = CancellationToken::new();
        let mut writer_task = tokio::spawn(write_loop(
            id,
            writer,
            outbound,
            writer_stop.clone(),
            session_token.clone(),
        ));

        router.announce_join(id).await;
        transition(id, &mut state, SessionState::Active);

        let result = read_loop(&handle, &router, &mut reader, &session_token).await;

        transition(id, &mut state, SessionState::Closing);
        if let Err(e) = &result {
            warn!(session_id = %id, error = %e, "Session ended with error");
        }

        registry.remove(id);
        writer_stop.cancel();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            warn!(session_id = %id, "Writer did not drain in time, aborting");
            writer_task.abort();
        }
        drop(reader);

        router.announce_leave(id).await;
        transition(id, &mut state, SessionState::Closed);
        info!(session_id = %id, stalls = handle.stalls(), "Client disconnected");

        result
    }
}

fn transition(id: SessionId, state: &mut SessionState, next: SessionState) {
    debug!(session_id = %id, from = %state, to = %next, "Session state changed");
    *state = next;
}

async fn read_loop<R>(
    handle: &SessionHandle,
    router: &MessageRouter,
    reader: &mut FrameReader<R>,
    token: &CancellationToken,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                debug!(session_id = %handle.id(), "Session cancelled");
                return Ok(());
            }
            next = reader.next_frame() => next?,
        };

        match next {
            None => {
                debug!(session_id = %handle.id(), "Peer closed the stream");
                return Ok(());
            }
            Some(Decoded::Frame(frame)) => {
                debug!(session_id = %handle.id(), kind = frame.kind(), "Received frame");
                // Routing may wait on a slow peer's queue
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(session_id = %handle.id(), "Session cancelled while routing");
                        return Ok(());
                    }
                    routed = router.route(handle, frame) => routed?,
                }
            }
            Some(Decoded::Malformed { line, reason }) => {
                warn!(
                    session_id = %handle.id(),
                    line = %line,
                    reason = %reason,
                    "Discarding malformed frame"
                );
            }
        }
    }
}

/// Write queued frames until stopped, then flush what is left and close the
/// write side.
async fn write_loop<W>(
    id: SessionId,
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
    session_token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut stopping = false;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled(), if !stopping => {
                // Remaining queued frames are still delivered by recv
                outbound.close();
                stopping = true;
            }
            next = outbound.recv() => {
                let Some(bytes) = next else { break };
                if let Err(e) = writer.write_encoded(&bytes).await {
                    debug!(session_id = %id, error = %e, "Write failed");
                    session_token.cancel();
                    return;
                }
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(session_id = %id, error = %e, "Shutdown of write half failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileStore;
    use protocol::{Frame, FrameCodec};
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf};

    struct Fixture {
        router: Arc<MessageRouter>,
        registry: Arc<SessionRegistry>,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(temp_dir.path(), 1024).await.unwrap());
        let registry = Arc::new(SessionRegistry::new());
        Fixture {
            router: Arc::new(MessageRouter::new(registry.clone(), store)),
            registry,
            _temp_dir: temp_dir,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn expect(reader: &mut FrameReader<ReadHalf<DuplexStream>>, expected: Frame) {
        let decoded = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(decoded, Decoded::Frame(expected));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let f = fixture().await;
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client_side);
        let mut client = FrameReader::new(client_read, FrameCodec::new());

        let session = Session::register(peer(), f.router.clone());
        let id = session.id();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(f.registry.contains(id));

        let task = tokio::spawn(session.run(server_side, CancellationToken::new()));

        expect(&mut client, Frame::text("[server] client-1 joined")).await;

        client_write.write_all(b"hello\nFILE_LIST\n").await.unwrap();
        expect(&mut client, Frame::text("[client-1] hello")).await;
        expect(&mut client, Frame::FileListResponse { names: vec![] }).await;

        client_write.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        assert!(!f.registry.contains(id));
        assert!(client.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_session() {
        let f = fixture().await;
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client_side);
        let mut client = FrameReader::new(client_read, FrameCodec::new());

        let session = Session::register(peer(), f.router.clone());
        let task = tokio::spawn(session.run(server_side, CancellationToken::new()));
        expect(&mut client, Frame::text("[server] client-1 joined")).await;

        client_write
            .write_all(b"FILE_DOWNLOAD|a|b\nstill here\n")
            .await
            .unwrap();
        expect(&mut client, Frame::text("[client-1] still here")).await;

        client_write.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_truncated_upload_ends_session_with_error() {
        let f = fixture().await;
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client_side);
        let mut client = FrameReader::new(client_read, FrameCodec::new());

        let session = Session::register(peer(), f.router.clone());
        let id = session.id();
        let task = tokio::spawn(session.run(server_side, CancellationToken::new()));
        expect(&mut client, Frame::text("[server] client-1 joined")).await;

        client_write.write_all(b"FILE_SEND|x.bin|100\nshort").await.unwrap();
        client_write.shutdown().await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert!(!f.registry.contains(id));
        assert!(!f.router.store().exists("x.bin").await);
    }

    #[tokio::test]
    async fn test_leave_announced_to_others() {
        let f = fixture().await;
        let (_observer, mut observer_rx) = f.registry.register(peer());

        let (server_side, client_side) = tokio::io::duplex(1024);
        let session = Session::register(peer(), f.router.clone());
        let task = tokio::spawn(session.run(server_side, CancellationToken::new()));

        drop(client_side);
        task.await.unwrap().unwrap();

        let mut texts = Vec::new();
        while let Ok(bytes) = observer_rx.try_recv() {
            texts.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        assert_eq!(
            texts,
            vec![
                "[server] client-2 joined\n".to_string(),
                "[server] client-2 left\n".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_token_ends_session() {
        let f = fixture().await;
        let (server_side, _client_side) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();

        let session = Session::register(peer(), f.router.clone());
        let id = session.id();
        let task = tokio::spawn(session.run(server_side, shutdown.clone()));

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(!f.registry.contains(id));
    }
}
