//! Applying handler outcomes to storage.
//!
//! Shared by the process manager, which applies outcomes right after a
//! handler returns, and the engine, which applies outcomes of deferred
//! operations reported later.

use log::{debug, info, warn};
use serde_json::Value;

use crate::error::{HandlerError, StorageError, StorageResult};
use crate::process::{ErrorRecord, OperationRef, Process, ProcessId};
use crate::storage::{with_retries, Storage};
use crate::workflow::model::OperationSpec;
use crate::workflow::parser::TemplateCatalog;
use crate::workflow::status::Status;

use super::handler::Outcome;

/// What applying an outcome did to the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Done,
    Skipped,
    /// Failed; `terminal` when the retry budget is used up.
    Failed { terminal: bool },
    Deferred,
    Spawned(ProcessId),
    /// The operation left IN_PROGRESS meanwhile; the outcome was dropped.
    Lost,
}

/// Writes outcomes of IN_PROGRESS operations.
pub(crate) struct OutcomeWriter<'a> {
    storage: &'a dyn Storage,
    catalog: &'a TemplateCatalog,
    retries: u32,
}

impl<'a> OutcomeWriter<'a> {
    pub(crate) fn new(storage: &'a dyn Storage, catalog: &'a TemplateCatalog, retries: u32) -> Self {
        Self {
            storage,
            catalog,
            retries,
        }
    }

    /// Applies a handler outcome for an operation claimed at `attempt`.
    pub(crate) fn apply(
        &self,
        process: ProcessId,
        spec: &OperationSpec,
        attempt: u32,
        outcome: Result<Outcome, HandlerError>,
    ) -> StorageResult<Applied> {
        match outcome {
            Ok(Outcome::Done(result)) => self.finish(process, &spec.id, result),
            Ok(Outcome::Skip(reason)) => {
                debug!("Operation {}/{} skipped: {}", process, spec.id, reason);
                self.settle(process, &spec.id, Status::Skipped, Applied::Skipped)
            }
            Ok(Outcome::Deferred) => {
                debug!("Operation {}/{} deferred", process, spec.id);
                Ok(Applied::Deferred)
            }
            Ok(Outcome::Spawn { template, data }) => {
                let Some(child_template) = self.catalog.get(&template) else {
                    let error = HandlerError::failed(format!("unknown child template '{template}'"));
                    return self.fail(process, spec, attempt, &error);
                };

                let parent = OperationRef {
                    process,
                    operation: spec.id.clone(),
                };
                let child_id = self.retry(|| self.storage.next_process_id())?;
                let child = Process::instantiate(child_id, &child_template, data).with_parent(parent);
                self.retry(|| self.storage.create_process(&child))?;
                self.retry(|| self.storage.set_child_process(process, &spec.id, child_id))?;

                info!(
                    "Operation {}/{} spawned process {} ({})",
                    process, spec.id, child_id, template
                );
                Ok(Applied::Spawned(child_id))
            }
            Err(error) => self.fail(process, spec, attempt, &error),
        }
    }

    /// Marks an operation DONE, storing its result and merging an object
    /// result into the context.
    pub(crate) fn finish(
        &self,
        process: ProcessId,
        operation: &str,
        result: Option<Value>,
    ) -> StorageResult<Applied> {
        // results of an operation that is no longer running are dropped
        if !self.still_running(process, operation)? {
            return Ok(Applied::Lost);
        }

        if let Some(Value::Object(data)) = &result {
            self.retry(|| self.storage.merge_context(process, data.clone()))?;
        }
        self.retry(|| self.storage.set_operation_result(process, operation, result.clone()))?;
        self.settle(process, operation, Status::Done, Applied::Done)
    }

    /// Marks an operation ERROR, logging the failure in the process error
    /// log once the retry budget is used up.
    pub(crate) fn fail(
        &self,
        process: ProcessId,
        spec: &OperationSpec,
        attempt: u32,
        error: &HandlerError,
    ) -> StorageResult<Applied> {
        let terminal = attempt >= spec.max_attempts();
        let applied = self.settle(process, &spec.id, Status::Error, Applied::Failed { terminal })?;
        if applied == Applied::Lost {
            return Ok(applied);
        }

        if terminal {
            warn!(
                "Operation {}/{} failed after {} attempt(s): {}",
                process, spec.id, attempt, error
            );
            self.retry(|| {
                self.storage
                    .append_error(ErrorRecord::for_operation(process, &spec.id, error.to_string()))
            })?;
        } else {
            warn!(
                "Operation {}/{} failed (attempt {}/{}), will retry: {}",
                process,
                spec.id,
                attempt,
                spec.max_attempts(),
                error
            );
        }
        Ok(applied)
    }

    /// Completes the operation that spawned `child`, if any, with the
    /// child's context.
    pub(crate) fn child_finished(&self, child: &Process) -> StorageResult<Option<OperationRef>> {
        let Some(parent) = &child.parent else {
            return Ok(None);
        };

        let result = Value::Object(child.context.data().clone());
        match self.finish(parent.process, &parent.operation, Some(result))? {
            Applied::Lost => Ok(None),
            _ => {
                info!("Process {} finished, completing {}", child.id, parent);
                Ok(Some(parent.clone()))
            }
        }
    }

    fn settle(
        &self,
        process: ProcessId,
        operation: &str,
        status: Status,
        applied: Applied,
    ) -> StorageResult<Applied> {
        match self.retry(|| {
            self.storage
                .transition_operation(process, operation, Status::InProgress, status)
        }) {
            Ok(_) => Ok(applied),
            Err(e) if e.is_conflict() => {
                debug!("Dropping outcome of {}/{}: {}", process, operation, e);
                Ok(Applied::Lost)
            }
            Err(e) => Err(e),
        }
    }

    fn still_running(&self, process: ProcessId, operation: &str) -> StorageResult<bool> {
        let snapshot = self.retry(|| self.storage.load_process(process))?;
        let op = snapshot
            .operation(operation)
            .ok_or_else(|| StorageError::OperationNotFound {
                process,
                operation: operation.to_string(),
            })?;

        if op.status != Status::InProgress {
            debug!(
                "Dropping outcome of {}/{}: operation is {}",
                process, operation, op.status
            );
        }
        Ok(op.status == Status::InProgress)
    }

    fn retry<T>(&self, call: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
        with_retries(self.retries, call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::workflow::model::Template;
    use serde_json::{json, Map};

    fn setup() -> (MemoryStorage, TemplateCatalog, ProcessId) {
        let mut catalog = TemplateCatalog::new();
        let template = Template::from_operations(
            "parent",
            vec![OperationSpec::new("a", "noop").with_retries(1)],
        );
        catalog.insert(template.clone()).unwrap();
        catalog
            .insert(Template::from_operations("child", vec![OperationSpec::new("x", "noop")]))
            .unwrap();

        let storage = MemoryStorage::new();
        let id = storage.next_process_id().unwrap();
        storage
            .create_process(&Process::instantiate(id, &template, Map::new()))
            .unwrap();
        storage
            .transition_operation(id, "a", Status::NotStarted, Status::InProgress)
            .unwrap();
        (storage, catalog, id)
    }

    fn spec() -> OperationSpec {
        OperationSpec::new("a", "noop").with_retries(1)
    }

    #[test]
    fn test_done_merges_object_result() {
        let (storage, catalog, id) = setup();
        let writer = OutcomeWriter::new(&storage, &catalog, 0);

        let applied = writer
            .apply(id, &spec(), 1, Ok(Outcome::with_result(json!({"k": "v"}))))
            .unwrap();
        assert_eq!(applied, Applied::Done);

        let process = storage.load_process(id).unwrap();
        assert_eq!(process.operations[0].status, Status::Done);
        assert_eq!(process.operations[0].result, Some(json!({"k": "v"})));
        assert_eq!(process.context.get("k"), Some(&json!("v")));
    }

    #[test]
    fn test_scalar_result_is_not_merged() {
        let (storage, catalog, id) = setup();
        let writer = OutcomeWriter::new(&storage, &catalog, 0);

        writer.apply(id, &spec(), 1, Ok(Outcome::with_result(json!(5)))).unwrap();

        let process = storage.load_process(id).unwrap();
        assert!(process.context.is_empty());
        assert_eq!(process.operations[0].result, Some(json!(5)));
    }

    #[test]
    fn test_failure_logs_only_when_terminal() {
        let (storage, catalog, id) = setup();
        let writer = OutcomeWriter::new(&storage, &catalog, 0);
        let error = HandlerError::failed("boom");

        let applied = writer.apply(id, &spec(), 1, Err(error.clone())).unwrap();
        assert_eq!(applied, Applied::Failed { terminal: false });
        assert!(storage.load_process(id).unwrap().errors.is_empty());

        storage
            .transition_operation(id, "a", Status::Error, Status::InProgress)
            .unwrap();
        let applied = writer.apply(id, &spec(), 2, Err(error)).unwrap();
        assert_eq!(applied, Applied::Failed { terminal: true });

        let errors = storage.load_process(id).unwrap().errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].subject.operation_id(), Some("a"));
        assert_eq!(errors[0].message, "boom");
    }

    #[test]
    fn test_outcome_after_cancel_is_lost() {
        let (storage, catalog, id) = setup();
        storage
            .transition_operation(id, "a", Status::InProgress, Status::Canceled)
            .unwrap();
        let writer = OutcomeWriter::new(&storage, &catalog, 0);

        let applied = writer
            .apply(id, &spec(), 1, Ok(Outcome::with_result(json!({"k": 1}))))
            .unwrap();
        assert_eq!(applied, Applied::Lost);

        let process = storage.load_process(id).unwrap();
        assert_eq!(process.operations[0].status, Status::Canceled);
        assert!(process.context.is_empty());

        let applied = writer
            .apply(id, &spec(), 2, Err(HandlerError::failed("late")))
            .unwrap();
        assert_eq!(applied, Applied::Lost);
        assert!(storage.load_process(id).unwrap().errors.is_empty());
    }

    #[test]
    fn test_spawn_links_child_and_child_completion() {
        let (storage, catalog, id) = setup();
        let writer = OutcomeWriter::new(&storage, &catalog, 0);

        let mut data = Map::new();
        data.insert("seed".to_string(), json!(1));
        let applied = writer
            .apply(
                id,
                &spec(),
                1,
                Ok(Outcome::Spawn {
                    template: "child".to_string(),
                    data,
                }),
            )
            .unwrap();

        let Applied::Spawned(child_id) = applied else {
            panic!("expected spawn, got {applied:?}");
        };
        let parent = storage.load_process(id).unwrap();
        assert_eq!(parent.operations[0].status, Status::InProgress);
        assert_eq!(parent.operations[0].child_process, Some(child_id));

        let child = storage.load_process(child_id).unwrap();
        assert_eq!(child.context.get("seed"), Some(&json!(1)));
        assert_eq!(child.parent.as_ref().map(|p| p.process), Some(id));

        let completed = writer.child_finished(&child).unwrap();
        assert_eq!(completed.map(|r| r.operation), Some("a".to_string()));

        let parent = storage.load_process(id).unwrap();
        assert_eq!(parent.operations[0].status, Status::Done);
        assert_eq!(parent.context.get("seed"), Some(&json!(1)));
    }

    #[test]
    fn test_spawn_unknown_template_fails_operation() {
        let (storage, catalog, id) = setup();
        let writer = OutcomeWriter::new(&storage, &catalog, 0);

        let applied = writer
            .apply(
                id,
                &spec(),
                2,
                Ok(Outcome::Spawn {
                    template: "ghost".to_string(),
                    data: Map::new(),
                }),
            )
            .unwrap();
        assert_eq!(applied, Applied::Failed { terminal: true });
        assert!(storage.load_process(id).unwrap().errors[0]
            .message
            .contains("ghost"));
    }
}
