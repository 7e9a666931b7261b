//! In-memory storage backend.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use log::debug;
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};
use crate::process::{ErrorRecord, Operation, Process, ProcessId};
use crate::workflow::status::Status;

use super::Storage;

/// The process table shared by the in-memory and file backends.
///
/// Every mutation is a plain method here; the backends wrap it in a lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessTable {
    next_id: u64,
    processes: BTreeMap<ProcessId, Process>,
}

impl ProcessTable {
    /// Rebuilds a table from persisted parts.
    pub(crate) fn from_parts(next_id: u64, processes: Vec<Process>) -> Self {
        let processes: BTreeMap<ProcessId, Process> =
            processes.into_iter().map(|p| (p.id, p)).collect();
        let highest = processes.keys().last().map_or(0, |id| id.0);
        Self {
            next_id: next_id.max(highest),
            processes,
        }
    }

    /// Splits the table into its persisted parts.
    pub(crate) fn to_parts(&self) -> (u64, Vec<Process>) {
        (self.next_id, self.processes.values().cloned().collect())
    }

    pub(crate) fn allocate_id(&mut self) -> ProcessId {
        self.next_id += 1;
        ProcessId(self.next_id)
    }

    pub(crate) fn insert(&mut self, process: &Process) -> StorageResult<()> {
        if self.processes.contains_key(&process.id) {
            return Err(StorageError::DuplicateProcess(process.id));
        }
        // keep allocation ahead of externally chosen ids
        self.next_id = self.next_id.max(process.id.0);
        self.processes.insert(process.id, process.clone());
        Ok(())
    }

    pub(crate) fn get(&self, id: ProcessId) -> StorageResult<&Process> {
        self.processes
            .get(&id)
            .ok_or(StorageError::ProcessNotFound(id))
    }

    fn get_mut(&mut self, id: ProcessId) -> StorageResult<&mut Process> {
        self.processes
            .get_mut(&id)
            .ok_or(StorageError::ProcessNotFound(id))
    }

    fn operation_mut(&mut self, id: ProcessId, operation: &str) -> StorageResult<&mut Operation> {
        self.get_mut(id)?
            .operation_mut(operation)
            .ok_or_else(|| StorageError::OperationNotFound {
                process: id,
                operation: operation.to_string(),
            })
    }

    pub(crate) fn ids(&self) -> Vec<ProcessId> {
        self.processes.keys().copied().collect()
    }

    pub(crate) fn ids_by_status(&self, status: Status) -> Vec<ProcessId> {
        self.processes
            .values()
            .filter(|process| process.status == status)
            .map(|process| process.id)
            .collect()
    }

    pub(crate) fn transition_process(
        &mut self,
        id: ProcessId,
        expected: Status,
        new: Status,
    ) -> StorageResult<()> {
        let process = self.get_mut(id)?;
        if process.status != expected {
            return Err(StorageError::Conflict {
                target: format!("process {id}"),
                expected,
                actual: process.status,
            });
        }
        process.status = new;
        debug!("Process {} {} -> {}", id, expected, new);
        Ok(())
    }

    pub(crate) fn transition_operation(
        &mut self,
        id: ProcessId,
        operation: &str,
        expected: Status,
        new: Status,
    ) -> StorageResult<Operation> {
        let op = self.operation_mut(id, operation)?;
        if op.status != expected {
            return Err(StorageError::Conflict {
                target: format!("operation '{operation}' of process {id}"),
                expected,
                actual: op.status,
            });
        }

        op.status = new;
        if new == Status::InProgress {
            op.attempts += 1;
            op.started_at = Some(Utc::now());
            op.finished_at = None;
        } else {
            op.finished_at = Some(Utc::now());
        }
        debug!("Operation {}/{} {} -> {}", id, operation, expected, new);
        Ok(op.clone())
    }

    pub(crate) fn set_result(
        &mut self,
        id: ProcessId,
        operation: &str,
        result: Option<Value>,
    ) -> StorageResult<()> {
        self.operation_mut(id, operation)?.result = result;
        Ok(())
    }

    pub(crate) fn set_child(
        &mut self,
        id: ProcessId,
        operation: &str,
        child: ProcessId,
    ) -> StorageResult<()> {
        self.operation_mut(id, operation)?.child_process = Some(child);
        Ok(())
    }

    pub(crate) fn merge_context(&mut self, id: ProcessId, data: Map<String, Value>) -> StorageResult<()> {
        self.get_mut(id)?.context.merge(data);
        Ok(())
    }

    pub(crate) fn append_error(&mut self, record: ErrorRecord) -> StorageResult<()> {
        self.get_mut(record.subject.process_id())?.errors.push(record);
        Ok(())
    }

    pub(crate) fn count_by_status(&self) -> BTreeMap<Status, usize> {
        let mut counts: BTreeMap<Status, usize> =
            Status::ALL.into_iter().map(|status| (status, 0)).collect();
        for process in self.processes.values() {
            *counts.entry(process.status).or_default() += 1;
        }
        counts
    }
}

/// Storage backed by a lock-guarded in-process table.
///
/// Each trait call takes the lock once, so a conditional transition is
/// checked and applied atomically.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    table: RwLock<ProcessTable>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, ProcessTable>> {
        self.table
            .read()
            .map_err(|_| StorageError::Backend("process table lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, ProcessTable>> {
        self.table
            .write()
            .map_err(|_| StorageError::Backend("process table lock poisoned".to_string()))
    }
}

impl Storage for MemoryStorage {
    fn next_process_id(&self) -> StorageResult<ProcessId> {
        Ok(self.write()?.allocate_id())
    }

    fn create_process(&self, process: &Process) -> StorageResult<()> {
        self.write()?.insert(process)
    }

    fn load_process(&self, id: ProcessId) -> StorageResult<Process> {
        self.read()?.get(id).cloned()
    }

    fn process_ids(&self) -> StorageResult<Vec<ProcessId>> {
        Ok(self.read()?.ids())
    }

    fn process_ids_by_status(&self, status: Status) -> StorageResult<Vec<ProcessId>> {
        Ok(self.read()?.ids_by_status(status))
    }

    fn transition_process(&self, id: ProcessId, expected: Status, new: Status) -> StorageResult<()> {
        self.write()?.transition_process(id, expected, new)
    }

    fn transition_operation(
        &self,
        id: ProcessId,
        operation: &str,
        expected: Status,
        new: Status,
    ) -> StorageResult<Operation> {
        self.write()?.transition_operation(id, operation, expected, new)
    }

    fn set_operation_result(
        &self,
        id: ProcessId,
        operation: &str,
        result: Option<Value>,
    ) -> StorageResult<()> {
        self.write()?.set_result(id, operation, result)
    }

    fn set_child_process(&self, id: ProcessId, operation: &str, child: ProcessId) -> StorageResult<()> {
        self.write()?.set_child(id, operation, child)
    }

    fn merge_context(&self, id: ProcessId, data: Map<String, Value>) -> StorageResult<()> {
        self.write()?.merge_context(id, data)
    }

    fn append_error(&self, record: ErrorRecord) -> StorageResult<()> {
        self.write()?.append_error(record)
    }

    fn count_by_status(&self) -> StorageResult<BTreeMap<Status, usize>> {
        Ok(self.read()?.count_by_status())
    }
}
