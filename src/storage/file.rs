//! File-backed Storage
//!
//! Keeps the process table in memory and writes a JSON snapshot after
//! every mutation, so processes survive a restart of the driver and can be
//! resumed with `procflow --state-file`.
//!
//! The snapshot is written to a sibling temporary file and renamed into
//! place, so a crash mid-write leaves the previous snapshot intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};
use crate::process::{ErrorRecord, Operation, Process, ProcessId};
use crate::workflow::status::Status;

use super::memory::ProcessTable;
use super::Storage;

/// On-disk layout of the snapshot file.
#[derive(Serialize, Deserialize, Debug, Default)]
struct Snapshot {
    next_id: u64,
    processes: Vec<Process>,
}

/// Storage persisted to a single JSON file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    table: Mutex<ProcessTable>,
}

impl FileStorage {
    /// Opens a snapshot file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();

        let table = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            info!(
                "Loaded {} processes from {}",
                snapshot.processes.len(),
                path.display()
            );
            ProcessTable::from_parts(snapshot.next_id, snapshot.processes)
        } else {
            info!("Starting fresh state file: {}", path.display());
            ProcessTable::default()
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, ProcessTable>> {
        self.table
            .lock()
            .map_err(|_| StorageError::Backend("state file lock poisoned".to_string()))
    }

    /// Applies a mutation to a copy of the table and swaps it in once the
    /// copy is on disk. A failed mutation or save leaves the table as it was.
    fn mutate<T, F>(&self, change: F) -> StorageResult<T>
    where
        F: FnOnce(&mut ProcessTable) -> StorageResult<T>,
    {
        let mut table = self.lock()?;
        let mut staged = table.clone();
        let value = change(&mut staged)?;
        self.save(&staged)?;
        *table = staged;
        Ok(value)
    }

    fn save(&self, table: &ProcessTable) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (next_id, processes) = table.to_parts();
        let json = serde_json::to_string_pretty(&Snapshot { next_id, processes })?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

impl Storage for FileStorage {
    fn next_process_id(&self) -> StorageResult<ProcessId> {
        self.mutate(|table| Ok(table.allocate_id()))
    }

    fn create_process(&self, process: &Process) -> StorageResult<()> {
        self.mutate(|table| table.insert(process))
    }

    fn load_process(&self, id: ProcessId) -> StorageResult<Process> {
        self.lock()?.get(id).cloned()
    }

    fn process_ids(&self) -> StorageResult<Vec<ProcessId>> {
        Ok(self.lock()?.ids())
    }

    fn process_ids_by_status(&self, status: Status) -> StorageResult<Vec<ProcessId>> {
        Ok(self.lock()?.ids_by_status(status))
    }

    fn transition_process(&self, id: ProcessId, expected: Status, new: Status) -> StorageResult<()> {
        self.mutate(|table| table.transition_process(id, expected, new))
    }

    fn transition_operation(
        &self,
        id: ProcessId,
        operation: &str,
        expected: Status,
        new: Status,
    ) -> StorageResult<Operation> {
        self.mutate(|table| table.transition_operation(id, operation, expected, new))
    }

    fn set_operation_result(
        &self,
        id: ProcessId,
        operation: &str,
        result: Option<Value>,
    ) -> StorageResult<()> {
        self.mutate(|table| table.set_result(id, operation, result))
    }

    fn set_child_process(&self, id: ProcessId, operation: &str, child: ProcessId) -> StorageResult<()> {
        self.mutate(|table| table.set_child(id, operation, child))
    }

    fn merge_context(&self, id: ProcessId, data: Map<String, Value>) -> StorageResult<()> {
        self.mutate(|table| table.merge_context(id, data))
    }

    fn append_error(&self, record: ErrorRecord) -> StorageResult<()> {
        self.mutate(|table| table.append_error(record))
    }

    fn count_by_status(&self) -> StorageResult<BTreeMap<Status, usize>> {
        Ok(self.lock()?.count_by_status())
    }
}
