//! Batch file transfer.
//!
//! A transfer task moves a list of files between the local store and one or
//! more remote hosts. Files are grouped per host; each (task, host) group is
//! driven by one [`TransferWorker`] over one shared SFTP connection, strictly
//! in submission order. The [`TransferManager`] inserts the records, spawns
//! the workers and exposes cancellation and live progress.

pub mod local;
pub mod path;
pub mod worker;

pub use local::{FsLocalStore, LocalStore};
pub use worker::{TransferContext, TransferWorker};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::TransferFileRecord;

/// Status of one transferred file (wire-stable names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferFileStatus {
    Waiting,
    Uploading,
    Downloading,
    Finished,
    Failed,
    Canceled,
}

impl TransferFileStatus {
    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferFileStatus::Finished | TransferFileStatus::Failed | TransferFileStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferFileStatus::Waiting => "WAITING",
            TransferFileStatus::Uploading => "UPLOADING",
            TransferFileStatus::Downloading => "DOWNLOADING",
            TransferFileStatus::Finished => "FINISHED",
            TransferFileStatus::Failed => "FAILED",
            TransferFileStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TransferFileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    /// Status of a file while its bytes are moving
    pub fn active_status(&self) -> TransferFileStatus {
        match self {
            TransferDirection::Upload => TransferFileStatus::Uploading,
            TransferDirection::Download => TransferFileStatus::Downloading,
        }
    }
}

/// Live state of one file, shared between its worker and progress readers.
/// Only the owning worker mutates it.
#[derive(Debug)]
pub struct TransferFileItem {
    pub id: u64,
    pub local_ref: String,
    remote_path: Mutex<String>,
    size_bytes: AtomicU64,
    transferred_bytes: AtomicU64,
    status: Mutex<TransferFileStatus>,
}

impl TransferFileItem {
    pub fn new(id: u64, local_ref: impl Into<String>, remote_path: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            local_ref: local_ref.into(),
            remote_path: Mutex::new(remote_path.into()),
            size_bytes: AtomicU64::new(size),
            transferred_bytes: AtomicU64::new(0),
            status: Mutex::new(TransferFileStatus::Waiting),
        }
    }

    pub fn from_record(record: &TransferFileRecord) -> Self {
        Self::new(
            record.id,
            record.local_ref.clone(),
            record.remote_path.clone(),
            record.size_bytes,
        )
    }

    pub fn remote_path(&self) -> String {
        self.remote_path.lock().clone()
    }

    pub(crate) fn set_remote_path(&self, path: String) {
        *self.remote_path.lock() = path;
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn set_size_bytes(&self, size: u64) {
        self.size_bytes.store(size, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_transferred(&self, bytes: u64) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn status(&self) -> TransferFileStatus {
        *self.status.lock()
    }

    /// Move to `status` unless already terminal. Returns whether it moved.
    pub(crate) fn set_status(&self, status: TransferFileStatus) -> bool {
        let mut current = self.status.lock();
        if current.is_terminal() {
            return false;
        }
        *current = status;
        true
    }

    pub fn snapshot(&self) -> TransferFileSnapshot {
        TransferFileSnapshot {
            id: self.id,
            remote_path: self.remote_path(),
            size_bytes: self.size_bytes(),
            transferred_bytes: self.transferred_bytes(),
            status: self.status(),
        }
    }
}

/// Point-in-time progress of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFileSnapshot {
    pub id: u64,
    pub remote_path: String,
    pub size_bytes: u64,
    pub transferred_bytes: u64,
    pub status: TransferFileStatus,
}

/// The files of one task bound for one host
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub task_id: u64,
    pub host_id: u64,
    pub direction: TransferDirection,
    pub files: Vec<Arc<TransferFileItem>>,
}

/// One file of a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFileSpec {
    pub host_id: u64,
    pub local_ref: String,
    pub remote_path: String,
    /// Known size for uploads; downloads learn it from the remote stat
    #[serde(default)]
    pub size_bytes: u64,
}

/// Spawns and tracks transfer workers
pub struct TransferManager {
    context: TransferContext,
    workers: Arc<DashMap<(u64, u64), Arc<TransferWorker>>>,
    /// Join handles per task, dropped by the task's last exiting worker
    handles: Arc<Mutex<HashMap<u64, Vec<JoinHandle<()>>>>>,
}

impl TransferManager {
    pub fn new(context: TransferContext) -> Self {
        Self {
            context,
            workers: Arc::new(DashMap::new()),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert the file records and start one worker per host.
    /// Returns the record ids in submission order.
    pub async fn submit(
        &self,
        task_id: u64,
        direction: TransferDirection,
        files: Vec<TransferFileSpec>,
    ) -> Result<Vec<u64>> {
        let records: Vec<TransferFileRecord> = files
            .iter()
            .map(|f| TransferFileRecord {
                id: 0,
                task_id,
                host_id: f.host_id,
                direction,
                local_ref: f.local_ref.clone(),
                remote_path: f.remote_path.clone(),
                size_bytes: f.size_bytes,
                transferred_bytes: 0,
                status: TransferFileStatus::Waiting,
                start_time: None,
                end_time: None,
                error_message: None,
            })
            .collect();
        let ids = self.context.store.insert_batch(records).await?;

        // Group by host, keeping submission order within each host
        let mut groups: Vec<(u64, Vec<Arc<TransferFileItem>>)> = Vec::new();
        for (spec, id) in files.iter().zip(&ids) {
            let item = Arc::new(TransferFileItem::new(
                *id,
                spec.local_ref.clone(),
                spec.remote_path.clone(),
                spec.size_bytes,
            ));
            match groups.iter_mut().find(|(host, _)| *host == spec.host_id) {
                Some((_, items)) => items.push(item),
                None => groups.push((spec.host_id, vec![item])),
            }
        }

        info!(task_id = task_id, hosts = groups.len(), files = ids.len(), "Transfer task submitted");

        // Workers check the handle map under this lock when they exit, so it
        // is held until every handle of this submission is recorded
        let mut tracked = self.handles.lock();
        for (host_id, items) in groups {
            let task = TransferTask {
                task_id,
                host_id,
                direction,
                files: items,
            };
            let worker = Arc::new(TransferWorker::new(task, self.context.clone()));
            self.workers.insert((task_id, host_id), Arc::clone(&worker));

            let workers = Arc::clone(&self.workers);
            let handles = Arc::clone(&self.handles);
            let handle = tokio::spawn(async move {
                worker.run().await;
                let mut handles = handles.lock();
                workers.remove(&(task_id, host_id));
                if !workers.iter().any(|entry| entry.key().0 == task_id) {
                    handles.remove(&task_id);
                }
                debug!(task_id = task_id, host_id = host_id, "Transfer worker removed");
            });
            tracked.entry(task_id).or_default().push(handle);
        }
        drop(tracked);

        Ok(ids)
    }

    /// Cancel every worker of a task. Returns how many were still running.
    pub fn cancel(&self, task_id: u64) -> usize {
        let workers: Vec<Arc<TransferWorker>> = self
            .workers
            .iter()
            .filter(|entry| entry.key().0 == task_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for worker in &workers {
            worker.cancel();
        }
        info!(task_id = task_id, workers = workers.len(), "Transfer task cancel requested");
        workers.len()
    }

    /// Live progress of the running workers of a task
    pub fn progress(&self, task_id: u64) -> Vec<TransferFileSnapshot> {
        let mut snapshots: Vec<TransferFileSnapshot> = self
            .workers
            .iter()
            .filter(|entry| entry.key().0 == task_id)
            .flat_map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Number of running workers
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks that still have running workers
    pub fn active_tasks(&self) -> usize {
        self.handles.lock().len()
    }

    /// Wait until every worker of a task has exited
    pub async fn wait(&self, task_id: u64) {
        let handles = self.handles.lock().remove(&task_id).unwrap_or_default();
        join_all(handles).await;
    }
}
