//! Transfer worker for one (task, host) group.
//!
//! `run` is the only entry point and always ends in `close`:
//!
//! 1. resolve the host, substitute path variables, open one connection and
//!    one SFTP channel; on failure every file becomes FAILED
//! 2. transfer each file in order, checking for cancellation before each one
//! 3. bulk-cancel files still WAITING if cancellation was requested
//! 4. release the SFTP channel and the connection
//!
//! Failures never escape the worker; they end up as file statuses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::local::LocalStore;
use super::path::{home_path, replace_path_variables};
use super::{
    TransferDirection, TransferFileItem, TransferFileSnapshot, TransferFileStatus, TransferTask,
};
use crate::config::{SftpConfig, UploadPresentPolicy};
use crate::connection::{
    ConnectionError, HostResolver, RemoteConnection, RemoteConnector, SftpChannel,
};
use crate::error::{Error, Result};
use crate::session::sftp::mkdir_parent;
use crate::store::{TransferFileStore, TransferFileUpdate};

/// Collaborators shared by every transfer worker
#[derive(Clone)]
pub struct TransferContext {
    pub store: Arc<dyn TransferFileStore>,
    pub resolver: Arc<dyn HostResolver>,
    pub connector: Arc<dyn RemoteConnector>,
    pub local: Arc<dyn LocalStore>,
    pub config: SftpConfig,
}

struct RemoteResources {
    connection: Arc<dyn RemoteConnection>,
    sftp: Arc<dyn SftpChannel>,
}

/// Moves the files of one task to or from one host
pub struct TransferWorker {
    task: TransferTask,
    context: TransferContext,
    cancel: CancellationToken,
    closed: AtomicBool,
    remote: tokio::sync::Mutex<Option<RemoteResources>>,
}

impl TransferWorker {
    pub fn new(task: TransferTask, context: TransferContext) -> Self {
        Self {
            task,
            context,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            remote: tokio::sync::Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task.task_id
    }

    pub fn host_id(&self) -> u64 {
        self.task.host_id
    }

    pub fn files(&self) -> &[Arc<TransferFileItem>] {
        &self.task.files
    }

    pub fn snapshot(&self) -> Vec<TransferFileSnapshot> {
        self.task.files.iter().map(|f| f.snapshot()).collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drive every file to a terminal status, then release all resources
    pub async fn run(&self) {
        info!(
            task_id = self.task.task_id,
            host_id = self.task.host_id,
            files = self.task.files.len(),
            "Transfer worker started"
        );

        if let Some(sftp) = self.init_session().await {
            for file in &self.task.files {
                if self.cancel.is_cancelled() || self.is_closed() {
                    break;
                }
                self.transfer_file(sftp.as_ref(), file).await;
            }
            self.finish_check_cancel().await;
        }

        self.close().await;
        info!(task_id = self.task.task_id, host_id = self.task.host_id, "Transfer worker finished");
    }

    /// Resolve, connect and open SFTP. On failure marks every file FAILED.
    async fn init_session(&self) -> Option<Arc<dyn SftpChannel>> {
        let (task_id, host_id) = (self.task.task_id, self.task.host_id);
        match self.open_remote().await {
            Ok(sftp) => {
                info!(task_id = task_id, host_id = host_id, "Transfer session opened");
                Some(sftp)
            }
            Err(e) => {
                error!(task_id = task_id, host_id = host_id, error = %e, "Transfer session failed");
                if let Err(store_err) = self
                    .context
                    .store
                    .update_status_by_task_host_id(task_id, host_id, TransferFileStatus::Failed)
                    .await
                {
                    warn!(task_id = task_id, host_id = host_id, error = %store_err, "Failed to persist FAILED status");
                }
                for file in &self.task.files {
                    file.set_status(TransferFileStatus::Failed);
                }
                None
            }
        }
    }

    async fn open_remote(&self) -> Result<Arc<dyn SftpChannel>> {
        let params = self
            .context
            .resolver
            .resolve(self.task.host_id)
            .await
            .ok_or(Error::HostNotFound(self.task.host_id))?;

        self.replace_remote_path_variables(&params.username, params.os_type)
            .await;

        let timeout = params.connect_timeout;
        let connection =
            tokio::time::timeout(timeout, self.context.connector.open_session(&params))
                .await
                .map_err(|_| ConnectionError::Timeout(timeout))??;

        let sftp = match tokio::time::timeout(timeout, connection.open_sftp(&params.charset)).await
        {
            Ok(Ok(sftp)) => Arc::<dyn SftpChannel>::from(sftp),
            Ok(Err(e)) => {
                let _ = connection.close().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = connection.close().await;
                return Err(ConnectionError::Timeout(timeout).into());
            }
        };

        *self.remote.lock().await = Some(RemoteResources {
            connection,
            sftp: Arc::clone(&sftp),
        });
        Ok(sftp)
    }

    /// Substitute `${username}`/`${home}` if the first path uses variables
    async fn replace_remote_path_variables(
        &self,
        username: &str,
        os_type: crate::connection::OsType,
    ) {
        let uses_variables = self
            .task
            .files
            .first()
            .map(|f| f.remote_path().contains('$'))
            .unwrap_or(false);
        if !uses_variables {
            return;
        }

        let home = home_path(os_type, username);
        for file in &self.task.files {
            let replaced = replace_path_variables(&file.remote_path(), username, &home);
            file.set_remote_path(replaced.clone());
            let update = TransferFileUpdate {
                remote_path: Some(replaced),
                ..TransferFileUpdate::new(file.id)
            };
            if let Err(e) = self.context.store.update_by_id(update).await {
                warn!(file_id = file.id, error = %e, "Failed to persist resolved remote path");
            }
        }
    }

    async fn transfer_file(&self, sftp: &dyn SftpChannel, file: &TransferFileItem) {
        let (task_id, host_id) = (self.task.task_id, self.task.host_id);
        info!(task_id = task_id, host_id = host_id, file_id = file.id, "File transfer started");
        self.update_status(file, self.task.direction.active_status(), None)
            .await;

        let result = match self.task.direction {
            TransferDirection::Upload => self.upload_file(sftp, file).await,
            TransferDirection::Download => self.download_file(sftp, file).await,
        };

        match result {
            Ok(()) => {
                info!(task_id = task_id, host_id = host_id, file_id = file.id, "File transfer finished");
                self.update_status(file, TransferFileStatus::Finished, None)
                    .await;
            }
            Err(e) if self.cancel.is_cancelled() => {
                info!(task_id = task_id, host_id = host_id, file_id = file.id, reason = %e, "File transfer canceled");
                self.update_status(file, TransferFileStatus::Canceled, None)
                    .await;
            }
            Err(e) => {
                warn!(task_id = task_id, host_id = host_id, file_id = file.id, error = %e, "File transfer failed");
                self.update_status(file, TransferFileStatus::Failed, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn upload_file(&self, sftp: &dyn SftpChannel, file: &TransferFileItem) -> Result<()> {
        let remote_path = file.remote_path();
        self.check_upload_present(sftp, &remote_path).await?;

        let mut reader = self.context.local.open_read(&file.local_ref).await?;
        let mut writer = sftp
            .open_write(&remote_path)
            .await
            .map_err(Error::remote_io)?;
        self.copy(file, &mut reader, &mut writer).await?;
        writer.shutdown().await.map_err(Error::remote_io)?;
        Ok(())
    }

    async fn download_file(&self, sftp: &dyn SftpChannel, file: &TransferFileItem) -> Result<()> {
        let remote_path = file.remote_path();
        let stat = sftp.stat(&remote_path).await.map_err(Error::remote_io)?;
        file.set_size_bytes(stat.size);

        let mut reader = sftp
            .open_read(&remote_path)
            .await
            .map_err(Error::remote_io)?;
        let mut writer = self.context.local.open_write(&file.local_ref).await?;
        self.copy(file, &mut reader, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Apply the upload-present policy and make sure the parent exists
    async fn check_upload_present(&self, sftp: &dyn SftpChannel, remote_path: &str) -> Result<()> {
        let exists = sftp.exists(remote_path).await.map_err(Error::remote_io)?;
        if !exists {
            return mkdir_parent(sftp, remote_path)
                .await
                .map_err(Error::remote_io);
        }

        match self.context.config.upload_present {
            UploadPresentPolicy::Overwrite => Ok(()),
            UploadPresentPolicy::Fail => Err(Error::RemoteIo(format!(
                "remote file already exists: {}",
                remote_path
            ))),
            UploadPresentPolicy::Backup => {
                let backup = backup_path(remote_path, Utc::now().timestamp_millis());
                debug!(from = %remote_path, to = %backup, "Backing up existing remote file");
                sftp.rename(remote_path, &backup)
                    .await
                    .map_err(Error::remote_io)
            }
        }
    }

    /// Chunked copy. Progress is visible after every chunk; cancellation
    /// is observed between chunks and while waiting for input.
    async fn copy<R, W>(&self, file: &TransferFileItem, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; self.context.config.buffer_size.max(1)];
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::CancellationRequested),
                read = reader.read(&mut buffer) => read.map_err(Error::remote_io)?,
            };
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(Error::remote_io)?;
            file.add_transferred(read as u64);
            if self.cancel.is_cancelled() {
                return Err(Error::CancellationRequested);
            }
        }
        writer.flush().await.map_err(Error::remote_io)?;
        Ok(())
    }

    /// Record a status change in memory and in the store
    async fn update_status(
        &self,
        file: &TransferFileItem,
        status: TransferFileStatus,
        error_message: Option<String>,
    ) {
        if !file.set_status(status) {
            return;
        }
        let now = Utc::now();
        let mut update = TransferFileUpdate::new(file.id).status(status);
        if status.is_terminal() {
            update.end_time = Some(now);
            update.size_bytes = Some(file.size_bytes());
            update.transferred_bytes = Some(file.transferred_bytes());
            update.error_message = error_message;
        } else {
            update.start_time = Some(now);
        }
        debug!(file_id = file.id, status = %status, "File status changed");
        if let Err(e) = self.context.store.update_by_id(update).await {
            warn!(file_id = file.id, status = %status, error = %e, "Failed to persist file status");
        }
    }

    /// If cancellation was requested, bulk-cancel files still WAITING.
    /// Makes no store mutation when nothing is waiting.
    pub async fn finish_check_cancel(&self) {
        if !self.cancel.is_cancelled() {
            return;
        }
        let waiting: Vec<u64> = self
            .task
            .files
            .iter()
            .filter(|f| f.status() == TransferFileStatus::Waiting)
            .map(|f| f.id)
            .collect();
        if waiting.is_empty() {
            return;
        }

        for file in &self.task.files {
            if file.status() == TransferFileStatus::Waiting {
                file.set_status(TransferFileStatus::Canceled);
            }
        }
        info!(task_id = self.task.task_id, host_id = self.task.host_id, count = waiting.len(), "Canceling waiting files");
        if let Err(e) = self
            .context
            .store
            .update_status_by_id_list(&waiting, TransferFileStatus::Canceled)
            .await
        {
            warn!(task_id = self.task.task_id, error = %e, "Failed to persist CANCELED status");
        }
    }

    /// Request cooperative cancellation. No-op once the worker closed.
    pub fn cancel(&self) {
        info!(
            task_id = self.task.task_id,
            host_id = self.task.host_id,
            canceled = self.cancel.is_cancelled(),
            closed = self.is_closed(),
            "Transfer cancel"
        );
        if self.is_closed() {
            return;
        }
        self.cancel.cancel();
    }

    /// Release the SFTP channel and the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(task_id = self.task.task_id, host_id = self.task.host_id, "Closing transfer worker");
        let remote = self.remote.lock().await.take();
        if let Some(remote) = remote {
            if let Err(e) = remote.sftp.close().await {
                debug!(error = %e, "SFTP close failed");
            }
            if let Err(e) = remote.connection.close().await {
                debug!(error = %e, "Connection close failed");
            }
        }
    }
}

/// `<path>_bk_<epoch-millis>`
fn backup_path(remote_path: &str, epoch_millis: i64) -> String {
    format!("{}_bk_{}", remote_path, epoch_millis)
}
