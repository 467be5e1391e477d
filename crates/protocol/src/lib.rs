//! # Chat Relay Protocol Library
//!
//! Frame definitions and the codec for the chat relay wire protocol.
//!
//! ## Overview
//!
//! A single TCP stream carries two kinds of data:
//!
//! - **Text lines**: newline-terminated chat messages and commands
//! - **Binary payloads**: raw file bytes whose length is announced by the
//!   header line that precedes them
//!
//! This crate does no I/O. The relay crate drives [`FrameCodec`] over async
//! sockets.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Decoded, Frame, FrameCodec};
//!
//! let codec = FrameCodec::new();
//! let frame = Frame::FileSend {
//!     filename: "notes.txt".to_string(),
//!     payload: b"hello".to_vec(),
//! };
//!
//! let bytes = codec.encode(&frame).unwrap();
//! assert_eq!(&bytes[..18], b"FILE_SEND|notes.tx");
//!
//! let (decoded, consumed) = codec.try_decode(&bytes).unwrap().unwrap();
//! assert_eq!(decoded, Decoded::Frame(frame));
//! assert_eq!(consumed, bytes.len());
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame model and codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;

pub use error::{ProtocolError, Result};
pub use framing::{
    validate_filename, Decoded, Frame, FrameCodec, DEFAULT_MAX_PAYLOAD, MAX_LINE_LENGTH,
};
