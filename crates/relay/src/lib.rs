//! # Chat Relay Server Library
//!
//! A multi-client chat relay with file upload and download multiplexed over
//! the same TCP connection used for chat text.
//!
//! ## Overview
//!
//! - **Sessions**: one task per connection plus a writer task draining a
//!   bounded outbound queue
//! - **Broadcast**: chat lines and server notices fan out to every session
//! - **File Store**: uploads land in a server-local directory and can be
//!   listed and downloaded by any client
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       ChatServer                         │
//! │                     (accept loop)                        │
//! ├──────────────────────────────────────────────────────────┤
//! │   Session   Session   Session ...   (read loop + writer) │
//! ├──────────────────────────────────────────────────────────┤
//! │                     MessageRouter                        │
//! ├────────────────────────────┬─────────────────────────────┤
//! │      SessionRegistry       │          FileStore          │
//! └────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay::{ChatServer, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let server = ChatServer::bind(&config).await?;
//!     println!("listening on {}", server.local_addr()?);
//!     server.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`connection`]: Async frame reader and writer
//! - [`session`]: Session lifecycle and registry
//! - [`router`]: Frame dispatch
//! - [`files`]: File store
//! - [`server`]: Accept loop
//! - [`client`]: Protocol client

pub mod client;
pub mod config;
pub mod connection;
pub mod files;
pub mod router;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use client::{ChatClient, ClientError};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionError, FrameReader, FrameWriter};
pub use files::{FileStore, StoreError};
pub use router::{MessageRouter, RouterError};
pub use server::ChatServer;
pub use session::{
    BroadcastReport, Session, SessionError, SessionHandle, SessionId, SessionRegistry,
    SessionState,
};
