//! TCP server that accepts chat clients.
//!
//! The server binds a listener, opens the file store and spawns one
//! [`Session`] task per accepted connection. All sessions share one
//! [`SessionRegistry`], one [`FileStore`] and one [`MessageRouter`].
//! Cancelling the shutdown token stops the accept loop and ends every
//! session; `run` returns once all of them have cleaned up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::FrameCodec;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::FileStore;
use crate::router::MessageRouter;
use crate::session::{Session, SessionRegistry};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The chat relay server.
pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    store: Arc<FileStore>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl ChatServer {
    /// Open the file store and bind the listener.
    ///
    /// The store directory is wiped. Port 0 binds an ephemeral port; use
    /// [`ChatServer::local_addr`] to find it.
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let store = FileStore::open(&config.store.root, config.store.max_file_size)
            .await
            .with_context(|| {
                format!(
                    "Failed to open file store: {}",
                    config.store.root.display()
                )
            })?;

        // max_file_size is validated to fit in u32
        let codec = FrameCodec::with_max_payload(config.store.max_file_size as usize);
        let registry = Arc::new(SessionRegistry::with_options(
            config.session.outbound_queue,
            codec,
        ));
        let store = Arc::new(store);
        let router = Arc::new(MessageRouter::new(registry.clone(), store.clone()));

        let address = config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;

        info!(address = %listener.local_addr()?, "Chat server listening");

        Ok(Self {
            listener,
            registry,
            store,
            router,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// The registry of connected sessions.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// The file store.
    pub fn store(&self) -> Arc<FileStore> {
        self.store.clone()
    }

    /// A token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token is cancelled, then wait
    /// for every session to finish.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let session = Session::register(peer, self.router.clone());
                        let token = self.shutdown.clone();
                        self.sessions.spawn(async move {
                            // Errors are logged by the session
                            let _ = session.run(stream, token).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        self.sessions.close();
        self.sessions.wait().await;
        info!(remaining = self.registry.count(), "Chat server stopped");
        Ok(())
    }
}
