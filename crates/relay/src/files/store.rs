//! Directory-backed blob store with atomic writes.
//!
//! Uploads are written to a temporary file under a hidden staging directory
//! and then renamed over the target, so readers see either the old contents
//! or the new contents, never a partial file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

/// Name of the staging directory inside the store root.
pub const STAGING_DIR: &str = ".partial";

/// Errors that can occur in the file store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The name cannot be used as a store entry.
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// The requested file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The blob exceeds the store's size limit.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Flat store of named files in one directory.
pub struct FileStore {
    /// Directory holding the files.
    root: PathBuf,
    /// Directory for in-progress writes.
    staging: PathBuf,
    /// Largest accepted blob in bytes.
    max_file_size: u64,
    /// Renames take this exclusively; reads and listings share it.
    lock: RwLock<()>,
    /// Source of unique staging file names.
    next_temp: AtomicU64,
}

impl FileStore {
    /// Open the store, creating the root if missing and deleting every
    /// pre-existing entry.
    pub async fn open(root: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut removed = 0usize;
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale store entry"),
            }
        }

        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;

        tracing::info!(root = ?root, removed, "Opened file store");
        Ok(Self {
            root,
            staging,
            max_file_size,
            lock: RwLock::new(()),
            next_temp: AtomicU64::new(0),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The size limit in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Save a blob under `name`, replacing any existing file.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        let size = bytes.len() as u64;
        if size > self.max_file_size {
            return Err(StoreError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        let temp_path = self.staging.join(format!(
            "upload-{}.tmp",
            self.next_temp.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = write_file(&temp_path, bytes).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                warn!(path = ?temp_path, error = %cleanup, "Failed to cleanup temp file after write error");
            }
            return Err(e.into());
        }

        let destination = self.root.join(name);
        let _guard = self.lock.write().await;
        if let Err(e) = fs::rename(&temp_path, &destination).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                warn!(path = ?temp_path, error = %cleanup, "Failed to cleanup temp file after rename error");
            }
            return Err(e.into());
        }

        tracing::debug!(filename = %name, size, "Stored file");
        Ok(())
    }

    /// Read a whole blob.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        validate_name(name)?;
        let path = self.root.join(name);

        let _guard = self.lock.read().await;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(StoreError::NotFound(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        Ok(fs::read(&path).await?)
    }

    /// Names of all stored files, sorted.
    ///
    /// Only regular files whose names can be sent in a list response are
    /// included.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.read().await;

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if validate_name(&name).is_ok() => names.push(name),
                Ok(name) => tracing::debug!(filename = %name, "Skipping unlistable file"),
                Err(raw) => tracing::debug!(filename = ?raw, "Skipping non UTF-8 file name"),
            }
        }

        names.sort();
        Ok(names)
    }

    /// Whether a file with this name is stored.
    pub async fn exists(&self, name: &str) -> bool {
        if validate_name(name).is_err() {
            return false;
        }
        let _guard = self.lock.read().await;
        fs::metadata(self.root.join(name))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Check that a name refers to a single entry directly under the root and
/// can travel in protocol headers.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    if name == STAGING_DIR {
        return Err(invalid("reserved for in-progress uploads"));
    }
    if name.contains(['/', '\\']) {
        return Err(invalid("must not contain path separators"));
    }
    if name.contains('\0') {
        return Err(invalid("must not contain NUL"));
    }
    protocol::validate_filename(name).map_err(|e| invalid(&e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LIMIT: u64 = 1024 * 1024;

    fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn open_store(temp_dir: &TempDir) -> FileStore {
        FileStore::open(temp_dir.path().join("files"), LIMIT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        store.save("hello.txt", b"hi").await.unwrap();
        assert_eq!(store.read("hello.txt").await.unwrap(), b"hi");
        assert!(store.exists("hello.txt").await);
    }

    #[tokio::test]
    async fn test_save_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        store.save("empty", b"").await.unwrap();
        assert!(store.read("empty").await.unwrap().is_empty());
        assert_eq!(store.list().await.unwrap(), vec!["empty".to_string()]);
    }

    #[tokio::test]
    async fn test_overwrite_last_write_wins() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        store.save("a.txt", b"first").await.unwrap();
        store.save("a.txt", b"second").await.unwrap();

        assert_eq!(store.read("a.txt").await.unwrap(), b"second");
        assert_eq!(store.list().await.unwrap(), vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_read_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        let result = store.read("nope.txt").await;
        assert!(matches!(result, Err(StoreError::NotFound(ref n)) if n == "nope.txt"));
        assert_eq!(result.unwrap_err().to_string(), "file not found: nope.txt");
        assert!(!store.exists("nope.txt").await);
    }

    #[tokio::test]
    async fn test_list_sorted_files_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        store.save("b.bin", b"2").await.unwrap();
        store.save("a.txt", b"1").await.unwrap();
        std::fs::create_dir(store.root().join("subdir")).unwrap();

        assert_eq!(
            store.list().await.unwrap(),
            vec!["a.txt".to_string(), "b.bin".to_string()]
        );
        assert!(matches!(
            store.read("subdir").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_wipes_existing_entries() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("files");
        std::fs::create_dir_all(root.join("old_dir")).unwrap();
        create_test_file(&root, "stale.txt", b"old");
        create_test_file(&root.join("old_dir"), "inner.txt", b"old");

        let store = FileStore::open(&root, LIMIT).await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(!root.join("stale.txt").exists());
        assert!(!root.join("old_dir").exists());
    }

    #[tokio::test]
    async fn test_open_creates_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested").join("files");

        let store = FileStore::open(&root, LIMIT).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }

    #[tokio::test]
    async fn test_rejects_too_large() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path(), 4).await.unwrap();

        let result = store.save("big", b"12345").await;
        assert!(matches!(
            result,
            Err(StoreError::TooLarge { size: 5, limit: 4 })
        ));
        assert!(!store.exists("big").await);
    }

    #[tokio::test]
    async fn test_rejects_invalid_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        for name in ["", ".", "..", "../escape", "a/b", "a\\b", "a|b", "a,b", "nul\0", STAGING_DIR] {
            let result = store.save(name, b"x").await;
            assert!(
                matches!(result, Err(StoreError::InvalidName { .. })),
                "name {:?} should be rejected",
                name
            );
        }
        assert!(matches!(
            store.read("../etc/passwd").await,
            Err(StoreError::InvalidName { .. })
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_staging_files_not_listed() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        create_test_file(&store.root().join(STAGING_DIR), "upload-99.tmp", b"partial");
        store.save("done.txt", b"ok").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["done.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_unlistable_names_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).await;

        create_test_file(store.root(), "a,b.txt", b"x");
        store.save("ok.txt", b"y").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["ok.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_saves() {
        let temp_dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open_store(&temp_dir).await);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.save(&format!("file{}.bin", i), &[i; 64]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 8);
        assert_eq!(store.read("file3.bin").await.unwrap(), vec![3u8; 64]);
    }
}
