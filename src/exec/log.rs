//! Per-host transcripts of batch commands.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

/// Append-only transcript storage, one transcript per (exec, host)
#[async_trait]
pub trait ExecLogStore: Send + Sync {
    /// Append raw output to the transcript, creating it if needed.
    /// Chunks may split a multibyte character; the bytes are kept as is.
    async fn append(&self, exec_id: u64, host_id: u64, data: &[u8]) -> io::Result<()>;

    /// Whole transcript decoded as UTF-8, empty if nothing was written yet
    async fn read(&self, exec_id: u64, host_id: u64) -> io::Result<String>;

    /// Where the transcript lives, if it has a location worth recording
    fn location(&self, _exec_id: u64, _host_id: u64) -> Option<String> {
        None
    }
}

/// Transcripts as files under `<dir>/<execId>/<hostId>.log`
#[derive(Debug, Clone)]
pub struct FsExecLogStore {
    dir: PathBuf,
}

impl FsExecLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, exec_id: u64, host_id: u64) -> PathBuf {
        self.dir
            .join(exec_id.to_string())
            .join(format!("{}.log", host_id))
    }
}

#[async_trait]
impl ExecLogStore for FsExecLogStore {
    async fn append(&self, exec_id: u64, host_id: u64, data: &[u8]) -> io::Result<()> {
        let path = self.path(exec_id, host_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn read(&self, exec_id: u64, host_id: u64) -> io::Result<String> {
        match tokio::fs::read(self.path(exec_id, host_id)).await {
            Ok(content) => Ok(String::from_utf8_lossy(&content).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    fn location(&self, exec_id: u64, host_id: u64) -> Option<String> {
        Some(self.path(exec_id, host_id).display().to_string())
    }
}

/// Transcripts kept in memory
#[derive(Debug, Default)]
pub struct MemoryExecLogStore {
    logs: Mutex<HashMap<(u64, u64), Vec<u8>>>,
}

impl MemoryExecLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecLogStore for MemoryExecLogStore {
    async fn append(&self, exec_id: u64, host_id: u64, data: &[u8]) -> io::Result<()> {
        self.logs
            .lock()
            .entry((exec_id, host_id))
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn read(&self, exec_id: u64, host_id: u64) -> io::Result<String> {
        Ok(self
            .logs
            .lock()
            .get(&(exec_id, host_id))
            .map(|data| String::from_utf8_lossy(data).into_owned())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsExecLogStore::new(dir.path());

        assert_eq!(store.read(1, 2).await.unwrap(), "");
        store.append(1, 2, b"first\n").await.unwrap();
        store.append(1, 2, b"second\n").await.unwrap();

        assert_eq!(store.read(1, 2).await.unwrap(), "first\nsecond\n");
        assert!(store.location(1, 2).unwrap().ends_with("2.log"));
    }

    #[tokio::test]
    async fn test_memory_log_is_per_host() {
        let store = MemoryExecLogStore::new();
        store.append(1, 1, b"a").await.unwrap();
        store.append(1, 2, b"b").await.unwrap();
        assert_eq!(store.read(1, 1).await.unwrap(), "a");
        assert_eq!(store.read(1, 2).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_character_split_across_appends_survives() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsExecLogStore::new(dir.path());
        let memory = MemoryExecLogStore::new();

        let stores: [&dyn ExecLogStore; 2] = [&fs_store, &memory];
        for store in stores {
            store.append(3, 4, &[b'x', 0xC3]).await.unwrap();
            store.append(3, 4, &[0xA9, b'y']).await.unwrap();
            assert_eq!(store.read(3, 4).await.unwrap(), "x\u{e9}y");
        }
    }
}
