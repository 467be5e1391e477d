//! File store module.
//!
//! Uploaded files live flat in one server-local directory, keyed by name.
//! The directory is wiped when the store is opened.
//!
//! # Security
//!
//! Names are validated before they touch the filesystem: no path separators,
//! no `.` or `..`, and none of the protocol's delimiter characters. Every
//! entry therefore resolves directly under the store root.

pub mod store;

pub use store::{validate_name, FileStore, StoreError, STAGING_DIR};
