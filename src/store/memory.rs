//! In-memory record store.
//!
//! Used by the CLI and by tests. Keeps the full status history of every
//! record and a count of mutating calls so tests can assert on exactly
//! which writes a worker performed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{
    ExecHostRecord, ExecHostStore, ExecHostUpdate, StoreError, StoreResult, TransferFileRecord,
    TransferFileStore, TransferFileUpdate,
};
use crate::exec::ExecHostStatus;
use crate::transfer::TransferFileStatus;

#[derive(Default)]
struct Tables {
    files: HashMap<u64, TransferFileRecord>,
    file_history: HashMap<u64, Vec<TransferFileStatus>>,
    hosts: HashMap<u64, ExecHostRecord>,
    host_history: HashMap<u64, Vec<ExecHostStatus>>,
}

/// Record store backed by hash maps under a single mutex
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    mutations: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls (updates and inserts) served so far
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Every status a transfer file record has held, oldest first
    pub fn file_status_history(&self, id: u64) -> Vec<TransferFileStatus> {
        self.tables
            .lock()
            .file_history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every status an exec host record has held, oldest first
    pub fn host_status_history(&self, id: u64) -> Vec<ExecHostStatus> {
        self.tables
            .lock()
            .host_history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of all transfer files of a task, ordered by id
    pub fn files_of_task(&self, task_id: u64) -> Vec<TransferFileRecord> {
        let tables = self.tables.lock();
        let mut files: Vec<_> = tables
            .files
            .values()
            .filter(|f| f.task_id == task_id)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.id);
        files
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Tables {
    fn set_file_status(&mut self, id: u64, status: TransferFileStatus) -> bool {
        match self.files.get_mut(&id) {
            Some(record) => {
                record.status = status;
                self.file_history.entry(id).or_default().push(status);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TransferFileStore for MemoryStore {
    async fn get_by_id(&self, id: u64) -> StoreResult<Option<TransferFileRecord>> {
        Ok(self.tables.lock().files.get(&id).cloned())
    }

    async fn update_by_id(&self, update: TransferFileUpdate) -> StoreResult<()> {
        self.record_mutation();
        let mut tables = self.tables.lock();
        let record = tables
            .files
            .get_mut(&update.id)
            .ok_or(StoreError::NotFound(update.id))?;

        if let Some(path) = update.remote_path {
            record.remote_path = path;
        }
        if let Some(size) = update.size_bytes {
            record.size_bytes = size;
        }
        if let Some(bytes) = update.transferred_bytes {
            record.transferred_bytes = bytes;
        }
        if update.start_time.is_some() {
            record.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            record.end_time = update.end_time;
        }
        if update.error_message.is_some() {
            record.error_message = update.error_message;
        }
        if let Some(status) = update.status {
            tables.set_file_status(update.id, status);
        }
        Ok(())
    }

    async fn update_status_by_task_host_id(
        &self,
        task_id: u64,
        host_id: u64,
        status: TransferFileStatus,
    ) -> StoreResult<usize> {
        self.record_mutation();
        let mut tables = self.tables.lock();
        let ids: Vec<u64> = tables
            .files
            .values()
            .filter(|f| f.task_id == task_id && f.host_id == host_id && !f.status.is_terminal())
            .map(|f| f.id)
            .collect();
        for id in &ids {
            tables.set_file_status(*id, status);
        }
        Ok(ids.len())
    }

    async fn update_status_by_id_list(
        &self,
        ids: &[u64],
        status: TransferFileStatus,
    ) -> StoreResult<usize> {
        self.record_mutation();
        let mut tables = self.tables.lock();
        let mut changed = 0;
        for id in ids {
            let open = tables
                .files
                .get(id)
                .map(|f| !f.status.is_terminal())
                .unwrap_or(false);
            if open && tables.set_file_status(*id, status) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn insert_batch(&self, records: Vec<TransferFileRecord>) -> StoreResult<Vec<u64>> {
        self.record_mutation();
        let mut tables = self.tables.lock();
        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            record.id = self.allocate_id();
            tables.file_history.insert(record.id, vec![record.status]);
            ids.push(record.id);
            tables.files.insert(record.id, record);
        }
        Ok(ids)
    }
}

#[async_trait]
impl ExecHostStore for MemoryStore {
    async fn get_by_id(&self, id: u64) -> StoreResult<Option<ExecHostRecord>> {
        Ok(self.tables.lock().hosts.get(&id).cloned())
    }

    async fn update_by_id(&self, update: ExecHostUpdate) -> StoreResult<()> {
        self.record_mutation();
        let mut tables = self.tables.lock();
        let record = tables
            .hosts
            .get_mut(&update.id)
            .ok_or(StoreError::NotFound(update.id))?;

        if update.exit_code.is_some() {
            record.exit_code = update.exit_code;
        }
        if update.start_time.is_some() {
            record.start_time = update.start_time;
        }
        if update.finish_time.is_some() {
            record.finish_time = update.finish_time;
        }
        if update.error_message.is_some() {
            record.error_message = update.error_message;
        }
        if let Some(status) = update.status {
            record.status = status;
            tables.host_history.entry(update.id).or_default().push(status);
        }
        Ok(())
    }

    async fn insert_batch(&self, records: Vec<ExecHostRecord>) -> StoreResult<Vec<u64>> {
        self.record_mutation();
        let mut tables = self.tables.lock();
        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            record.id = self.allocate_id();
            tables.host_history.insert(record.id, vec![record.status]);
            ids.push(record.id);
            tables.hosts.insert(record.id, record);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferDirection;

    fn file(task_id: u64, host_id: u64) -> TransferFileRecord {
        TransferFileRecord {
            id: 0,
            task_id,
            host_id,
            direction: TransferDirection::Upload,
            local_ref: "a.txt".into(),
            remote_path: "/tmp/a.txt".into(),
            size_bytes: 3,
            transferred_bytes: 0,
            status: TransferFileStatus::Waiting,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_in_order() {
        let store = MemoryStore::new();
        let ids = TransferFileStore::insert_batch(&store, vec![file(1, 1), file(1, 1)])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.files_of_task(1).len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_update_skips_terminal_records() {
        let store = MemoryStore::new();
        let ids = TransferFileStore::insert_batch(&store, vec![file(1, 1), file(1, 1)])
            .await
            .unwrap();
        TransferFileStore::update_by_id(
            &store,
            TransferFileUpdate::new(ids[0]).status(TransferFileStatus::Finished),
        )
        .await
        .unwrap();

        let changed = store
            .update_status_by_task_host_id(1, 1, TransferFileStatus::Failed)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(
            store.file_status_history(ids[0]),
            vec![TransferFileStatus::Waiting, TransferFileStatus::Finished]
        );
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryStore::new();
        let result =
            TransferFileStore::update_by_id(&store, TransferFileUpdate::new(99)).await;
        assert!(matches!(result, Err(StoreError::NotFound(99))));
    }
}
