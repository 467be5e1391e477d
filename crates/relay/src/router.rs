//! Message router for dispatching decoded frames.
//!
//! This module provides the `MessageRouter` struct that receives frames from
//! one session and routes them to the session registry (chat broadcast,
//! notices) or the file store (upload, list, download). File responses go to
//! the requesting session only.

use std::sync::Arc;

use protocol::Frame;
use tracing::{debug, info, warn};

use crate::files::{FileStore, StoreError};
use crate::session::{SendError, SessionHandle, SessionId, SessionRegistry};

/// Errors that end the session that caused them.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The requesting session can no longer receive replies.
    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// Routes frames from sessions to the registry and file store.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    store: Arc<FileStore>,
}

impl MessageRouter {
    /// Create a router over a registry and store.
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<FileStore>) -> Self {
        Self { registry, store }
    }

    /// The registry this router broadcasts through.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The store this router serves files from.
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Dispatch one frame received from `session`.
    pub async fn route(&self, session: &SessionHandle, frame: Frame) -> Result<(), RouterError> {
        match frame {
            Frame::TextLine { content } => {
                self.handle_text(session, &content).await;
                Ok(())
            }
            Frame::FileSend { filename, payload } => {
                self.handle_upload(session, &filename, &payload).await
            }
            Frame::FileListRequest => self.handle_list(session).await,
            Frame::FileDownloadRequest { filename } => {
                self.handle_download(session, &filename).await
            }
            Frame::FileListResponse { .. }
            | Frame::FileDownloadResponse { .. }
            | Frame::FileDownloadError { .. } => {
                warn!(
                    session_id = %session.id(),
                    kind = frame.kind(),
                    "Ignoring server-to-client frame sent by client"
                );
                Ok(())
            }
        }
    }

    /// Broadcast that a session has joined.
    pub async fn announce_join(&self, id: SessionId) {
        self.notice(&format!("{} joined", id)).await;
    }

    /// Broadcast that a session has left.
    pub async fn announce_leave(&self, id: SessionId) {
        self.notice(&format!("{} left", id)).await;
    }

    async fn handle_text(&self, session: &SessionHandle, content: &str) {
        if content.is_empty() {
            return;
        }
        debug!(session_id = %session.id(), len = content.len(), "Chat message");
        self.broadcast(&format!("[{}] {}", session.id(), single_line(content)))
            .await;
    }

    async fn handle_upload(
        &self,
        session: &SessionHandle,
        filename: &str,
        payload: &[u8],
    ) -> Result<(), RouterError> {
        match self.store.save(filename, payload).await {
            Ok(()) => {
                info!(
                    session_id = %session.id(),
                    filename = %filename,
                    size = payload.len(),
                    "File uploaded"
                );
                self.notice(&format!(
                    "{} uploaded '{}'",
                    session.id(),
                    single_line(filename)
                ))
                .await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    session_id = %session.id(),
                    filename = %filename,
                    error = %e,
                    "Upload failed"
                );
                let text = format!(
                    "[server] upload of '{}' failed: {}",
                    single_line(filename),
                    single_line(&e.to_string())
                );
                self.reply(session, &Frame::text(text)).await
            }
        }
    }

    async fn handle_list(&self, session: &SessionHandle) -> Result<(), RouterError> {
        let names = match self.store.list().await {
            Ok(names) => names,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Failed to list files");
                Vec::new()
            }
        };
        debug!(session_id = %session.id(), count = names.len(), "File list requested");
        self.reply(session, &Frame::FileListResponse { names }).await
    }

    async fn handle_download(
        &self,
        session: &SessionHandle,
        filename: &str,
    ) -> Result<(), RouterError> {
        let frame = match self.store.read(filename).await {
            Ok(payload) => {
                info!(
                    session_id = %session.id(),
                    filename = %filename,
                    size = payload.len(),
                    "File download"
                );
                Frame::FileDownloadResponse {
                    filename: filename.to_string(),
                    payload,
                }
            }
            Err(e) => {
                if matches!(e, StoreError::NotFound(_)) {
                    debug!(session_id = %session.id(), filename = %filename, "Download of missing file");
                } else {
                    warn!(
                        session_id = %session.id(),
                        filename = %filename,
                        error = %e,
                        "Download failed"
                    );
                }
                Frame::FileDownloadError {
                    message: single_line(&e.to_string()),
                }
            }
        };
        self.reply(session, &frame).await
    }

    async fn reply(&self, session: &SessionHandle, frame: &Frame) -> Result<(), RouterError> {
        match session.send(frame).await {
            Ok(()) => Ok(()),
            Err(SendError::Closed(id)) => Err(RouterError::Closed(id)),
            Err(SendError::Encode(e)) => {
                warn!(session_id = %session.id(), kind = frame.kind(), error = %e, "Dropping unencodable reply");
                Ok(())
            }
        }
    }

    async fn notice(&self, text: &str) {
        self.broadcast(&format!("[server] {}", text)).await;
    }

    async fn broadcast(&self, text: &str) {
        if let Err(e) = self.registry.broadcast_all(&Frame::text(text)).await {
            warn!(error = %e, "Dropping unencodable broadcast");
        }
    }
}

/// Replace line breaks so a value can be embedded in one text line.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}
