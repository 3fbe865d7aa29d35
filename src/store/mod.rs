//! Abstract record store consumed by the transfer workers and the batch
//! executor.
//!
//! Every status mutation is a single update keyed by record id (or by a
//! well-defined group of ids), so concurrent writers never interleave
//! partial records. The engine ships an in-memory implementation in
//! [`memory`]; production deployments plug in their own persistence.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::ExecHostStatus;
use crate::transfer::{TransferDirection, TransferFileStatus};

/// Errors raised by record store implementations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(u64),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Transfer file records
// ============================================================================

/// Persisted state of one file of a transfer task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFileRecord {
    /// Assigned by the store on insert
    pub id: u64,
    pub task_id: u64,
    pub host_id: u64,
    pub direction: TransferDirection,
    /// Local file reference (path inside the local store)
    pub local_ref: String,
    pub remote_path: String,
    pub size_bytes: u64,
    pub transferred_bytes: u64,
    pub status: TransferFileStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Partial update of a transfer file record. `None` fields are left as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFileUpdate {
    pub id: u64,
    pub status: Option<TransferFileStatus>,
    pub remote_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub transferred_bytes: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TransferFileUpdate {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn status(mut self, status: TransferFileStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Record store contract for transfer files
#[async_trait]
pub trait TransferFileStore: Send + Sync {
    async fn get_by_id(&self, id: u64) -> StoreResult<Option<TransferFileRecord>>;

    /// Apply a partial update to one record
    async fn update_by_id(&self, update: TransferFileUpdate) -> StoreResult<()>;

    /// Set the status of every non-terminal file of a (task, host) group.
    /// Returns the number of records changed.
    async fn update_status_by_task_host_id(
        &self,
        task_id: u64,
        host_id: u64,
        status: TransferFileStatus,
    ) -> StoreResult<usize>;

    /// Set the status of every non-terminal record in `ids`.
    /// Returns the number of records changed.
    async fn update_status_by_id_list(
        &self,
        ids: &[u64],
        status: TransferFileStatus,
    ) -> StoreResult<usize>;

    /// Insert records, ignoring their `id`. Returns the assigned ids in order.
    async fn insert_batch(&self, records: Vec<TransferFileRecord>) -> StoreResult<Vec<u64>>;
}

// ============================================================================
// Exec host records
// ============================================================================

/// Persisted state of one host of a batch command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecHostRecord {
    /// Assigned by the store on insert
    pub id: u64,
    pub exec_id: u64,
    pub host_id: u64,
    pub host_name: String,
    pub host_address: String,
    /// Command rendered for this host
    pub command: String,
    pub script_path: Option<String>,
    pub status: ExecHostStatus,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub log_path: Option<String>,
}

/// Partial update of an exec host record. `None` fields are left as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecHostUpdate {
    pub id: u64,
    pub status: Option<ExecHostStatus>,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ExecHostUpdate {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn status(mut self, status: ExecHostStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Record store contract for exec hosts
#[async_trait]
pub trait ExecHostStore: Send + Sync {
    async fn get_by_id(&self, id: u64) -> StoreResult<Option<ExecHostRecord>>;

    /// Apply a partial update to one record
    async fn update_by_id(&self, update: ExecHostUpdate) -> StoreResult<()>;

    /// Insert records, ignoring their `id`. Returns the assigned ids in order.
    async fn insert_batch(&self, records: Vec<ExecHostRecord>) -> StoreResult<Vec<u64>>;
}
