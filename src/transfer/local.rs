//! Local side of file transfers.
//!
//! Uploads read from, and downloads write into, a [`LocalStore`]. The
//! file-system store resolves references relative to a root directory and
//! refuses references that would escape it.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Streaming reader over a local file
pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;

/// Streaming writer into a local file
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Source and sink of transferred bytes on the engine side
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Open an existing file for reading
    async fn open_read(&self, local_ref: &str) -> io::Result<LocalReader>;

    /// Create (or truncate) a file for writing, creating parent directories
    async fn open_write(&self, local_ref: &str) -> io::Result<LocalWriter>;

    /// Size of an existing file in bytes
    async fn size(&self, local_ref: &str) -> io::Result<u64>;
}

/// Local store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsLocalStore {
    root: PathBuf,
}

impl FsLocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a reference below the root. Absolute references are taken
    /// as is; relative ones may not contain `..`.
    fn resolve(&self, local_ref: &str) -> io::Result<PathBuf> {
        let path = Path::new(local_ref);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("local reference escapes the store root: {}", local_ref),
            ));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn open_read(&self, local_ref: &str) -> io::Result<LocalReader> {
        let file = tokio::fs::File::open(self.resolve(local_ref)?).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, local_ref: &str) -> io::Result<LocalWriter> {
        let path = self.resolve(local_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn size(&self, local_ref: &str) -> io::Result<u64> {
        Ok(tokio::fs::metadata(self.resolve(local_ref)?).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLocalStore::new(dir.path());

        let mut writer = store.open_write("nested/a.txt").await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(store.size("nested/a.txt").await.unwrap(), 5);
        let mut reader = store.open_read("nested/a.txt").await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn test_parent_reference_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLocalStore::new(dir.path());
        let err = store.open_read("../etc/passwd").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
