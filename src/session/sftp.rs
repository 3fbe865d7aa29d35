//! SFTP session: a thin capability surface over the remote file-transfer
//! channel. Every failure comes back as [`Error::RemoteIo`] carrying the
//! underlying cause; handlers turn that into a result envelope.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::SessionKey;
use crate::config::SftpConfig;
use crate::connection::{
    remote_parent, ConnectionError, ConnectionResult, FileStat, RemoteConnection, RemoteReader,
    RemoteWriter, SftpChannel,
};
use crate::error::{Error, Result};

/// How to open a remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate, then write
    Write,
}

/// An open remote file stream
pub enum SftpStream {
    Read(RemoteReader),
    Write(RemoteWriter),
}

/// One SFTP subsystem bound to a registry entry
pub struct SftpSession {
    key: SessionKey,
    connection: Arc<dyn RemoteConnection>,
    sftp: Box<dyn SftpChannel>,
    preview_size: u64,
    created_at: DateTime<Utc>,
    last_activity: AtomicI64,
    closed: AtomicBool,
}

impl SftpSession {
    pub(crate) async fn connect(
        key: SessionKey,
        connection: Arc<dyn RemoteConnection>,
        charset: &str,
        config: &SftpConfig,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let sftp = match tokio::time::timeout(timeout, connection.open_sftp(charset))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))
            .and_then(|r| r)
        {
            Ok(sftp) => sftp,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        Ok(Arc::new(Self {
            key,
            connection,
            sftp,
            preview_size: config.preview_size,
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_activity.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    fn channel(&self) -> Result<&dyn SftpChannel> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(self.sftp.as_ref())
    }

    /// List a directory, directories first, optionally hiding dot files
    pub async fn list(&self, path: &str, show_hidden: bool) -> Result<Vec<FileStat>> {
        let mut entries = self
            .channel()?
            .list(path)
            .await
            .map_err(Error::remote_io)?;
        if !show_hidden {
            entries.retain(|e| !e.name.starts_with('.'));
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        self.channel()?.stat(path).await.map_err(Error::remote_io)
    }

    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<SftpStream> {
        let sftp = self.channel()?;
        match mode {
            OpenMode::Read => sftp
                .open_read(path)
                .await
                .map(SftpStream::Read)
                .map_err(Error::remote_io),
            OpenMode::Write => sftp
                .open_write(path)
                .await
                .map(SftpStream::Write)
                .map_err(Error::remote_io),
        }
    }

    /// Whole-file read, refused above the preview size limit
    pub async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let stat = self.stat(path).await?;
        if stat.size > self.preview_size {
            return Err(Error::RemoteIo(format!(
                "{} is {} bytes, larger than the {} byte preview limit",
                path, stat.size, self.preview_size
            )));
        }
        let mut reader = match self.open(path, OpenMode::Read).await? {
            SftpStream::Read(reader) => reader,
            SftpStream::Write(_) => return Err(Error::remote_io("unexpected write stream")),
        };
        let mut content = Vec::with_capacity(stat.size as usize);
        reader
            .read_to_end(&mut content)
            .await
            .map_err(Error::remote_io)?;
        Ok(content)
    }

    /// Whole-file write, refused above the preview size limit
    pub async fn set_content(&self, path: &str, content: &[u8]) -> Result<()> {
        if content.len() as u64 > self.preview_size {
            return Err(Error::RemoteIo(format!(
                "content of {} bytes is larger than the {} byte preview limit",
                content.len(),
                self.preview_size
            )));
        }
        let mut writer = match self.open(path, OpenMode::Write).await? {
            SftpStream::Write(writer) => writer,
            SftpStream::Read(_) => return Err(Error::remote_io("unexpected read stream")),
        };
        writer.write_all(content).await.map_err(Error::remote_io)?;
        writer.shutdown().await.map_err(Error::remote_io)?;
        Ok(())
    }

    /// Truncate to zero length
    pub async fn truncate(&self, path: &str) -> Result<()> {
        self.channel()?.truncate(path).await.map_err(Error::remote_io)
    }

    /// Remove a file, or a directory with everything below it
    pub async fn remove(&self, path: &str) -> Result<()> {
        remove_recursive(self.channel()?, path)
            .await
            .map_err(Error::remote_io)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.channel()?
            .rename(from, to)
            .await
            .map_err(Error::remote_io)
    }

    pub async fn chmod(&self, path: &str, permissions: u32) -> Result<()> {
        self.channel()?
            .chmod(path, permissions)
            .await
            .map_err(Error::remote_io)
    }

    /// Create a directory and any missing parents
    pub async fn mkdirs(&self, path: &str) -> Result<()> {
        mkdirs(self.channel()?, path).await.map_err(Error::remote_io)
    }

    /// Release the subsystem and the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(channel_id = %self.key.channel_id, session_id = %self.key.session_id, "Closing SFTP session");
        if let Err(e) = self.sftp.close().await {
            trace!(error = %e, "SFTP close failed");
        }
        self.connection.close().await.map_err(Error::from)
    }
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `mkdir -p` over an SFTP channel
pub async fn mkdirs(sftp: &dyn SftpChannel, path: &str) -> ConnectionResult<()> {
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if current.is_empty() && !path.starts_with('/') {
            current.push_str(component);
        } else {
            current.push('/');
            current.push_str(component);
        }
        if !sftp.exists(&current).await? {
            sftp.mkdir(&current).await?;
        }
    }
    Ok(())
}

/// Create the parent directory of `path` if it is missing
pub async fn mkdir_parent(sftp: &dyn SftpChannel, path: &str) -> ConnectionResult<()> {
    match remote_parent(path) {
        Some(parent) if parent != "/" => mkdirs(sftp, parent).await,
        _ => Ok(()),
    }
}

fn remove_recursive<'a>(
    sftp: &'a dyn SftpChannel,
    path: &'a str,
) -> Pin<Box<dyn Future<Output = ConnectionResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let stat = sftp.stat(path).await?;
        if stat.is_dir && !stat.is_symlink {
            for child in sftp.list(path).await? {
                remove_recursive(sftp, &child.path).await?;
            }
            sftp.remove_dir(path).await
        } else {
            sftp.remove_file(path).await
        }
    })
}
