//! Process Storage
//!
//! The persistence seam of the engine. Besides plain CRUD, a backend must
//! offer compare-and-set status transitions: they are what makes an
//! operation claim atomic across concurrent ticks.
//!
//! # Backends
//!
//! - [`memory`]: In-process table guarded by a lock
//! - [`file`]: The same table, snapshotted to a JSON file after each write

pub mod file;
pub mod memory;

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use log::warn;
use serde_json::{Map, Value};

use crate::error::StorageResult;
use crate::process::{ErrorRecord, Operation, Process, ProcessId};
use crate::workflow::status::Status;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Base delay between retries of a transient storage failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Persistence for processes and everything they own.
///
/// Implementations must make each method atomic with respect to the others.
pub trait Storage: Send + Sync {
    /// Allocates a fresh process id.
    fn next_process_id(&self) -> StorageResult<ProcessId>;

    /// Persists a newly instantiated process.
    fn create_process(&self, process: &Process) -> StorageResult<()>;

    /// Loads a full snapshot of a process.
    fn load_process(&self, id: ProcessId) -> StorageResult<Process>;

    /// Ids of every stored process, ascending.
    fn process_ids(&self) -> StorageResult<Vec<ProcessId>>;

    /// Ids of the processes currently in `status`, ascending.
    fn process_ids_by_status(&self, status: Status) -> StorageResult<Vec<ProcessId>>;

    /// Conditionally moves a process from `expected` to `new`.
    ///
    /// Fails with [`StorageError::Conflict`](crate::error::StorageError::Conflict)
    /// when the stored status differs from `expected`.
    fn transition_process(&self, id: ProcessId, expected: Status, new: Status) -> StorageResult<()>;

    /// Conditionally moves an operation from `expected` to `new`.
    ///
    /// Moving to IN_PROGRESS counts an attempt and stamps `started_at`;
    /// moving anywhere else stamps `finished_at`. Returns the updated
    /// operation.
    fn transition_operation(
        &self,
        id: ProcessId,
        operation: &str,
        expected: Status,
        new: Status,
    ) -> StorageResult<Operation>;

    /// Stores the result payload of an operation.
    fn set_operation_result(
        &self,
        id: ProcessId,
        operation: &str,
        result: Option<Value>,
    ) -> StorageResult<()>;

    /// Links an operation to the child process it spawned.
    fn set_child_process(&self, id: ProcessId, operation: &str, child: ProcessId) -> StorageResult<()>;

    /// Merges data into a process context.
    fn merge_context(&self, id: ProcessId, data: Map<String, Value>) -> StorageResult<()>;

    /// Appends to the error log of the process the record refers to.
    fn append_error(&self, record: ErrorRecord) -> StorageResult<()>;

    /// Number of processes per status; every status is present.
    fn count_by_status(&self) -> StorageResult<BTreeMap<Status, usize>>;
}

/// Runs a storage call, retrying transient failures up to `retries` times.
///
/// Conflicts and every other error are returned immediately.
pub fn with_retries<T, F>(retries: u32, mut call: F) -> StorageResult<T>
where
    F: FnMut() -> StorageResult<T>,
{
    let mut attempt = 0;
    loop {
        match call() {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!("Transient storage failure (attempt {}/{}): {}", attempt, retries, e);
                thread::sleep(RETRY_BACKOFF * attempt);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::cell::Cell;

    #[test]
    fn test_with_retries_recovers_from_busy() {
        let calls = Cell::new(0);
        let result = with_retries(3, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StorageError::Busy("locked".to_string()))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_with_retries_gives_up() {
        let calls = Cell::new(0);
        let result: StorageResult<()> = with_retries(2, || {
            calls.set(calls.get() + 1);
            Err(StorageError::Busy("locked".to_string()))
        });

        assert!(matches!(result, Err(StorageError::Busy(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_with_retries_does_not_retry_conflicts() {
        let calls = Cell::new(0);
        let result: StorageResult<()> = with_retries(5, || {
            calls.set(calls.get() + 1);
            Err(StorageError::Conflict {
                target: "op".to_string(),
                expected: Status::NotStarted,
                actual: Status::InProgress,
            })
        });

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.get(), 1);
    }
}
