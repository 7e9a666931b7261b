//! Process Manager
//!
//! Drives one process forward by one tick at a time. A tick:
//!
//! 1. starts the process if it has not started yet
//! 2. claims and runs every ready or retryable operation
//! 3. runs compensation for operations that must be rolled back
//! 4. completes the process once every operation is completed
//!
//! A tick never waits for work beyond the handlers it calls. Several ticks
//! may run against the same process at once; the compare-and-set claim in
//! storage makes sure each operation runs at most once per attempt.
//!
//! When storage fails mid-tick, the outcomes already in hand are still
//! recorded before the error is returned. A claim whose outcome cannot be
//! stored is released as a failed attempt instead of staying IN_PROGRESS.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{EngineError, HandlerError, Result, StorageError, StorageResult};
use crate::process::{ErrorRecord, Process, ProcessId};
use crate::storage::{with_retries, Storage};
use crate::workflow::model::{OperationSpec, RollbackScope, Template, DEFAULT_MANAGER};
use crate::workflow::parser::TemplateCatalog;
use crate::workflow::resolver::DependencyResolver;
use crate::workflow::status::{StateMachine, Status};

use super::handler::{CancelToken, HandlerInput, HandlerRegistry, Outcome};
use super::outcome::{Applied, OutcomeWriter};

/// Default number of retries for transient storage failures.
pub const DEFAULT_STORAGE_RETRIES: u32 = 3;

/// Tuning knobs of a [`ProcessManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Upper bound on handlers running at once within one tick
    pub max_parallel: usize,
    /// Retries for transient storage failures
    pub storage_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get(),
            storage_retries: DEFAULT_STORAGE_RETRIES,
        }
    }
}

/// Summary of what one tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub process_id: ProcessId,
    /// Operations this tick claimed and ran
    pub claimed: Vec<String>,
    /// Claims lost to a concurrent tick
    pub lost_claims: usize,
    /// Operations that moved to ERROR
    pub failed: Vec<String>,
    /// Operations moved to ROLLBACK
    pub compensated: Vec<String>,
    /// Child processes created
    pub spawned: Vec<ProcessId>,
    /// Process status at the end of the tick
    pub status: Status,
    /// True when the tick changed any status
    pub progressed: bool,
}

impl TickReport {
    pub fn new(process_id: ProcessId, status: Status) -> Self {
        Self {
            process_id,
            claimed: Vec::new(),
            lost_claims: 0,
            failed: Vec::new(),
            compensated: Vec::new(),
            spawned: Vec::new(),
            status,
            progressed: false,
        }
    }
}

/// Drives processes one tick at a time.
pub trait Manager: Send + Sync {
    /// Runs one tick of the given process.
    fn run(&self, process: ProcessId) -> Result<TickReport>;
}

/// Managers available to templates, by name.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    managers: BTreeMap<String, Arc<dyn Manager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a manager, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, manager: Arc<dyn Manager>) {
        self.managers.insert(name.into(), manager);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.managers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    /// The manager bound to [`DEFAULT_MANAGER`].
    pub fn default_manager(&self) -> Option<Arc<dyn Manager>> {
        self.get(DEFAULT_MANAGER)
    }
}

impl fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.managers.keys()).finish()
    }
}

/// An operation this tick holds the claim for.
struct Claimed<'t> {
    spec: &'t OperationSpec,
    attempt: u32,
}

/// The default [`Manager`].
pub struct ProcessManager {
    storage: Arc<dyn Storage>,
    catalog: Arc<TemplateCatalog>,
    handlers: Arc<HandlerRegistry>,
    resolver: DependencyResolver,
    machine: StateMachine,
    config: ManagerConfig,
}

impl ProcessManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        catalog: Arc<TemplateCatalog>,
        handlers: Arc<HandlerRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            storage,
            catalog,
            handlers,
            resolver: DependencyResolver::new(),
            machine: StateMachine::new(),
            config,
        }
    }

    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    fn writer(&self) -> OutcomeWriter<'_> {
        OutcomeWriter::new(&*self.storage, &self.catalog, self.config.storage_retries)
    }

    fn retry<T>(&self, call: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
        with_retries(self.config.storage_retries, call)
    }

    fn load(&self, id: ProcessId) -> Result<Process> {
        Ok(self.retry(|| self.storage.load_process(id))?)
    }

    fn template_for(&self, process: &Process) -> Result<Arc<Template>> {
        self.catalog
            .get(&process.template_id)
            .ok_or_else(|| EngineError::UnknownTemplate(process.template_id.clone()))
    }

    /// Moves the process between statuses; returns false if another tick
    /// moved it first.
    fn transition_process(&self, id: ProcessId, from: Status, to: Status) -> Result<bool> {
        if !self.machine.can_transition_process(from, to) {
            return Err(EngineError::InvalidTransition {
                target: format!("process {id}"),
                from,
                to,
            });
        }

        match self.retry(|| self.storage.transition_process(id, from, to)) {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!("Process {} transition {} -> {} lost: {}", id, from, to, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claims an operation; returns the new attempt number, or `None` if
    /// another tick claimed it first.
    fn claim(&self, id: ProcessId, operation: &str, from: Status, to: Status) -> Result<Option<u32>> {
        if !self.machine.can_transition_operation(from, to) {
            return Err(EngineError::InvalidTransition {
                target: format!("operation '{operation}' of process {id}"),
                from,
                to,
            });
        }

        match self.retry(|| self.storage.transition_operation(id, operation, from, to)) {
            Ok(op) => Ok(Some(op.attempts)),
            Err(e) if e.is_conflict() => {
                debug!("Claim on {}/{} lost: {}", id, operation, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claims and runs every ready and retryable operation.
    fn run_forward(&self, process: &Process, template: &Template, report: &mut TickReport) -> Result<()> {
        let candidates: Vec<(&str, Status)> = self
            .resolver
            .ready_set(&process.operations)
            .into_iter()
            .chain(self.resolver.retry_set(&process.operations, template))
            .map(|op| (op.id.as_str(), op.status))
            .collect();

        let mut parallel = Vec::new();
        let mut serial = Vec::new();
        // the first storage failure; claims already held still run and get recorded
        let mut failure: Option<EngineError> = None;

        for (operation, status) in candidates {
            let Some(spec) = template.operation(operation) else {
                continue;
            };
            let claim = match self.claim(process.id, operation, status, Status::InProgress) {
                Ok(claim) => claim,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            match claim {
                Some(attempt) => {
                    report.claimed.push(operation.to_string());
                    let claimed = Claimed { spec, attempt };
                    if spec.parallel_safe {
                        parallel.push(claimed);
                    } else {
                        serial.push(claimed);
                    }
                }
                None => report.lost_claims += 1,
            }
        }

        if !report.claimed.is_empty() {
            info!(
                "Process {}: running {}",
                process.id,
                report.claimed.join(", ")
            );
        }

        for chunk in parallel.chunks(self.config.max_parallel.max(1)) {
            let outcomes: Vec<_> = thread::scope(|scope| {
                let running: Vec<_> = chunk
                    .iter()
                    .map(|claimed| scope.spawn(move || self.invoke(process, claimed)))
                    .collect();

                running
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))))
                    })
                    .collect::<Vec<_>>()
            });

            for (claimed, outcome) in chunk.iter().zip(outcomes) {
                if let Err(e) = self.record(process.id, claimed, outcome, report) {
                    failure.get_or_insert(e);
                }
            }
        }

        for claimed in &serial {
            let outcome = self.invoke(process, claimed);
            if let Err(e) = self.record(process.id, claimed, outcome, report) {
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs the handler of a claimed operation, catching panics.
    fn invoke(&self, process: &Process, claimed: &Claimed<'_>) -> std::result::Result<Outcome, HandlerError> {
        let spec = claimed.spec;
        let Some(handler) = self.handlers.get(&spec.handler) else {
            return Err(HandlerError::Unregistered(spec.handler.clone()));
        };

        let input = HandlerInput {
            process_id: process.id,
            operation_id: spec.id.clone(),
            attempt: claimed.attempt,
            params: spec.params.clone(),
            context: process.context.clone(),
            cancel: CancelToken::new(Arc::clone(&self.storage), process.id, spec.id.clone()),
        };

        debug!(
            "Operation {}/{} attempt {} via '{}'",
            process.id, spec.id, claimed.attempt, spec.handler
        );

        panic::catch_unwind(AssertUnwindSafe(|| handler.call(&input)))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))))
    }

    fn record(
        &self,
        id: ProcessId,
        claimed: &Claimed<'_>,
        outcome: std::result::Result<Outcome, HandlerError>,
        report: &mut TickReport,
    ) -> Result<()> {
        let applied = match self.writer().apply(id, claimed.spec, claimed.attempt, outcome) {
            Ok(applied) => applied,
            Err(e) => {
                error!("Outcome of {}/{} not recorded: {}", id, claimed.spec.id, e);
                self.release(id, claimed, &e, report);
                return Err(e.into());
            }
        };

        match applied {
            Applied::Failed { .. } => report.failed.push(claimed.spec.id.clone()),
            Applied::Spawned(child) => report.spawned.push(child),
            Applied::Done | Applied::Skipped | Applied::Deferred | Applied::Lost => {}
        }
        Ok(())
    }

    /// Gives up a claim whose outcome could not be stored. The attempt
    /// counts as failed, so the operation is retried within its budget.
    fn release(
        &self,
        id: ProcessId,
        claimed: &Claimed<'_>,
        cause: &StorageError,
        report: &mut TickReport,
    ) {
        let error = HandlerError::failed(format!("outcome not recorded: {cause}"));
        match self.writer().fail(id, claimed.spec, claimed.attempt, &error) {
            Ok(Applied::Failed { .. }) => report.failed.push(claimed.spec.id.clone()),
            Ok(_) => {}
            Err(e) => error!(
                "Operation {}/{} stays IN_PROGRESS, release failed: {}",
                id, claimed.spec.id, e
            ),
        }
    }

    /// Claims and compensates every rollback-ready operation.
    fn run_rollback(&self, process: &Process, template: &Template, report: &mut TickReport) -> Result<()> {
        let ready = self
            .resolver
            .rollback_ready_set(&process.operations, template, process.status);

        for op in ready {
            let Some(spec) = template.operation(&op.id) else {
                continue;
            };
            if self.claim(process.id, &op.id, op.status, Status::Rollback)?.is_none() {
                report.lost_claims += 1;
                continue;
            }
            report.compensated.push(op.id.clone());
            info!("Process {}: rolling back '{}'", process.id, op.id);

            let Some(compensate) = &spec.compensate else {
                continue;
            };
            let compensation = OperationSpec {
                handler: compensate.clone(),
                ..spec.clone()
            };
            let outcome = self.invoke(
                process,
                &Claimed {
                    spec: &compensation,
                    attempt: op.attempts,
                },
            );

            if let Err(e) = outcome {
                error!("Compensation of {}/{} failed: {}", process.id, op.id, e);
                self.retry(|| {
                    self.storage.append_error(ErrorRecord::for_operation(
                        process.id,
                        &op.id,
                        format!("compensation failed: {e}"),
                    ))
                })?;
            }
        }
        Ok(())
    }
}

impl Manager for ProcessManager {
    fn run(&self, id: ProcessId) -> Result<TickReport> {
        let mut process = self.load(id)?;
        let initial = process.status;
        let mut report = TickReport::new(id, initial);

        if matches!(process.status, Status::Done | Status::Canceled) {
            return Ok(report);
        }

        let template = self.template_for(&process)?;

        if process.status == Status::NotStarted {
            if !self.machine.can_start(process.status, process.operations.len()) {
                debug!("Process {} cannot start", id);
                return Ok(report);
            }
            if self.transition_process(id, Status::NotStarted, Status::InProgress)? {
                info!("Process {} started ({})", id, template.id);
            }
            process = self.load(id)?;
        }

        if process.status == Status::InProgress {
            self.run_forward(&process, &template, &mut report)?;
            process = self.load(id)?;

            let origins: Vec<&str> = self
                .resolver
                .rollback_origins(&process.operations, &template)
                .into_iter()
                .map(|op| op.id.as_str())
                .collect();
            if template.rollback_scope == RollbackScope::Process && !origins.is_empty() {
                if self.transition_process(id, Status::InProgress, Status::Rollback)? {
                    let message = format!("rolling back after failure of {}", origins.join(", "));
                    warn!("Process {} {}", id, message);
                    self.retry(|| {
                        self.storage
                            .append_error(ErrorRecord::for_process(id, message.clone()))
                    })?;
                }
                process = self.load(id)?;
            }
        }

        if matches!(process.status, Status::InProgress | Status::Rollback) {
            self.run_rollback(&process, &template, &mut report)?;
            process = self.load(id)?;
        }

        if self
            .machine
            .can_complete(process.status, process.operation_statuses())
            && self.transition_process(id, Status::InProgress, Status::Done)?
        {
            info!("Process {} completed", id);
            process.status = Status::Done;
            self.writer().child_finished(&process)?;
        }

        report.status = self.load(id)?.status;
        report.progressed = report.status != initial
            || !report.claimed.is_empty()
            || !report.compensated.is_empty();
        Ok(report)
    }
}

impl fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessManager")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        storage: Arc<dyn Storage>,
        manager: ProcessManager,
    }

    fn fixture(templates: Vec<Template>, handlers: HandlerRegistry) -> Fixture {
        fixture_with(Arc::new(MemoryStorage::new()), templates, handlers)
    }

    fn fixture_with(storage: Arc<dyn Storage>, templates: Vec<Template>, handlers: HandlerRegistry) -> Fixture {
        let mut catalog = TemplateCatalog::new();
        for template in templates {
            catalog.insert(template).unwrap();
        }
        let manager = ProcessManager::new(
            Arc::clone(&storage),
            Arc::new(catalog),
            Arc::new(handlers),
            ManagerConfig {
                max_parallel: 4,
                storage_retries: 0,
            },
        );
        Fixture { storage, manager }
    }

    impl Fixture {
        fn instantiate(&self, template: &Template) -> ProcessId {
            let id = self.storage.next_process_id().unwrap();
            self.storage
                .create_process(&Process::instantiate(id, template, Map::new()))
                .unwrap();
            id
        }

        fn status_of(&self, id: ProcessId, op: &str) -> Status {
            self.storage.load_process(id).unwrap().operation(op).unwrap().status
        }
    }

    /// Memory storage that rejects the first result written for one operation.
    struct RejectResult {
        inner: MemoryStorage,
        operation: &'static str,
        remaining: AtomicUsize,
    }

    impl RejectResult {
        fn new(operation: &'static str) -> Self {
            Self {
                inner: MemoryStorage::new(),
                operation,
                remaining: AtomicUsize::new(1),
            }
        }
    }

    impl Storage for RejectResult {
        fn next_process_id(&self) -> StorageResult<ProcessId> {
            self.inner.next_process_id()
        }

        fn create_process(&self, process: &Process) -> StorageResult<()> {
            self.inner.create_process(process)
        }

        fn load_process(&self, id: ProcessId) -> StorageResult<Process> {
            self.inner.load_process(id)
        }

        fn process_ids(&self) -> StorageResult<Vec<ProcessId>> {
            self.inner.process_ids()
        }

        fn process_ids_by_status(&self, status: Status) -> StorageResult<Vec<ProcessId>> {
            self.inner.process_ids_by_status(status)
        }

        fn transition_process(&self, id: ProcessId, expected: Status, new: Status) -> StorageResult<()> {
            self.inner.transition_process(id, expected, new)
        }

        fn transition_operation(
            &self,
            id: ProcessId,
            operation: &str,
            expected: Status,
            new: Status,
        ) -> StorageResult<crate::process::Operation> {
            self.inner.transition_operation(id, operation, expected, new)
        }

        fn set_operation_result(
            &self,
            id: ProcessId,
            operation: &str,
            result: Option<serde_json::Value>,
        ) -> StorageResult<()> {
            if operation == self.operation
                && self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StorageError::Backend("disk full".to_string()));
            }
            self.inner.set_operation_result(id, operation, result)
        }

        fn set_child_process(&self, id: ProcessId, operation: &str, child: ProcessId) -> StorageResult<()> {
            self.inner.set_child_process(id, operation, child)
        }

        fn merge_context(&self, id: ProcessId, data: Map<String, serde_json::Value>) -> StorageResult<()> {
            self.inner.merge_context(id, data)
        }

        fn append_error(&self, record: ErrorRecord) -> StorageResult<()> {
            self.inner.append_error(record)
        }

        fn count_by_status(&self) -> StorageResult<BTreeMap<Status, usize>> {
            self.inner.count_by_status()
        }
    }

    fn chain() -> Template {
        Template::from_operations(
            "chain",
            vec![
                OperationSpec::new("a", "set").with_params(json!({"values": {"a": 1}})),
                OperationSpec::new("b", "noop").depends_on("a"),
            ],
        )
    }

    #[test]
    fn test_tick_starts_and_runs_one_layer() {
        let f = fixture(vec![chain()], HandlerRegistry::with_builtins());
        let id = f.instantiate(&chain());

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.claimed, vec!["a"]);
        assert_eq!(report.status, Status::InProgress);
        assert!(report.progressed);
        assert_eq!(f.status_of(id, "b"), Status::NotStarted);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.claimed, vec!["b"]);
        assert_eq!(report.status, Status::Done);

        let process = f.storage.load_process(id).unwrap();
        assert_eq!(process.context.get("a"), Some(&json!(1)));

        let report = f.manager.run(id).unwrap();
        assert!(!report.progressed);
    }

    #[test]
    fn test_empty_template_never_starts() {
        let empty = Template::new("empty");
        let f = fixture(vec![empty.clone()], HandlerRegistry::with_builtins());
        let id = f.instantiate(&empty);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.status, Status::NotStarted);
        assert!(!report.progressed);
    }

    #[test]
    fn test_retry_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut handlers = HandlerRegistry::new();
        handlers.register("flaky", move |input: &HandlerInput| {
            seen.fetch_add(1, Ordering::SeqCst);
            if input.attempt < 2 {
                Err(HandlerError::failed("not yet"))
            } else {
                Ok(Outcome::done())
            }
        });

        let template = Template::from_operations(
            "flaky",
            vec![OperationSpec::new("a", "flaky").with_retries(2)],
        );
        let f = fixture(vec![template.clone()], handlers);
        let id = f.instantiate(&template);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(f.status_of(id, "a"), Status::Error);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.claimed, vec!["a"]);
        assert_eq!(report.status, Status::Done);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(f.storage.load_process(id).unwrap().errors.is_empty());
    }

    #[test]
    fn test_panicking_handler_does_not_stop_siblings() {
        let mut handlers = HandlerRegistry::with_builtins();
        handlers.register("explode", |_: &HandlerInput| -> std::result::Result<Outcome, HandlerError> {
            panic!("kaboom")
        });

        let template = Template::from_operations(
            "mixed",
            vec![
                OperationSpec::new("bad", "explode").parallel_safe(),
                OperationSpec::new("good", "noop").parallel_safe(),
                OperationSpec::new("serial", "noop"),
            ],
        );
        let f = fixture(vec![template.clone()], handlers);
        let id = f.instantiate(&template);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.failed, vec!["bad"]);
        assert_eq!(f.status_of(id, "good"), Status::Done);
        assert_eq!(f.status_of(id, "serial"), Status::Done);

        let errors = f.storage.load_process(id).unwrap().errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("kaboom"));
    }

    #[test]
    fn test_skip_counts_as_completed() {
        let mut handlers = HandlerRegistry::with_builtins();
        handlers.register("skipper", |_: &HandlerInput| Ok::<_, HandlerError>(Outcome::Skip("not needed".to_string())));

        let template = Template::from_operations(
            "skip",
            vec![
                OperationSpec::new("a", "skipper"),
                OperationSpec::new("b", "noop").depends_on("a"),
            ],
        );
        let f = fixture(vec![template.clone()], handlers);
        let id = f.instantiate(&template);

        f.manager.run(id).unwrap();
        assert_eq!(f.status_of(id, "a"), Status::Skipped);
        let report = f.manager.run(id).unwrap();
        assert_eq!(report.status, Status::Done);
    }

    #[test]
    fn test_parallel_safe_operations_share_a_tick() {
        let template = Template::from_operations(
            "fan",
            (0..6)
                .map(|i| OperationSpec::new(format!("op{i}"), "noop").parallel_safe())
                .collect(),
        );
        let f = fixture(vec![template.clone()], HandlerRegistry::with_builtins());
        let id = f.instantiate(&template);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.claimed.len(), 6);
        assert_eq!(report.status, Status::Done);
    }

    #[test]
    fn test_lost_claim_is_skipped() {
        let template = chain();
        let f = fixture(vec![template.clone()], HandlerRegistry::with_builtins());
        let id = f.instantiate(&template);
        f.storage
            .transition_process(id, Status::NotStarted, Status::InProgress)
            .unwrap();

        let process = f.storage.load_process(id).unwrap();
        // another worker takes 'a' after this tick loaded its snapshot
        f.storage
            .transition_operation(id, "a", Status::NotStarted, Status::InProgress)
            .unwrap();

        let mut report = TickReport::new(id, process.status);
        f.manager.run_forward(&process, &template, &mut report).unwrap();
        assert!(report.claimed.is_empty());
        assert_eq!(report.lost_claims, 1);
    }

    #[test]
    fn test_dependents_rollback_compensates() {
        let compensated = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&compensated);
        let mut handlers = HandlerRegistry::with_builtins();
        handlers.register("undo", move |_: &HandlerInput| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(Outcome::done())
        });

        let template = Template::from_operations(
            "saga",
            vec![
                OperationSpec::new("a", "noop").rollback_on_failure(),
                OperationSpec::new("b", "noop").depends_on("a").with_compensation("undo"),
            ],
        );
        let f = fixture(vec![template.clone()], handlers);
        let id = f.instantiate(&template);
        f.storage
            .transition_process(id, Status::NotStarted, Status::InProgress)
            .unwrap();

        // state restored from elsewhere: 'b' finished although 'a' failed
        for (op, to) in [("a", Status::Error), ("b", Status::Done)] {
            f.storage
                .transition_operation(id, op, Status::NotStarted, Status::InProgress)
                .unwrap();
            f.storage
                .transition_operation(id, op, Status::InProgress, to)
                .unwrap();
        }

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.compensated, vec!["b"]);
        assert_eq!(f.status_of(id, "b"), Status::Rollback);
        assert_eq!(f.status_of(id, "a"), Status::Error);
        assert_eq!(compensated.load(Ordering::SeqCst), 1);
        assert_eq!(report.status, Status::InProgress);
    }

    #[test]
    fn test_failed_compensation_is_logged() {
        let template = Template::from_operations(
            "saga",
            vec![
                OperationSpec::new("a", "noop").with_compensation("fail"),
                OperationSpec::new("b", "fail")
                    .depends_on("a")
                    .rollback_on_failure(),
            ],
        )
        .with_rollback_scope(RollbackScope::Process);
        let f = fixture(vec![template.clone()], HandlerRegistry::with_builtins());
        let id = f.instantiate(&template);

        f.manager.run(id).unwrap();
        let report = f.manager.run(id).unwrap();
        assert_eq!(report.status, Status::Rollback);

        // 'b' first, then 'a' whose compensation fails
        while f.manager.run(id).unwrap().progressed {}

        assert_eq!(f.status_of(id, "a"), Status::Rollback);
        assert_eq!(f.status_of(id, "b"), Status::Rollback);
        let errors = f.storage.load_process(id).unwrap().errors;
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[1].subject.operation_id(), None);
        assert!(errors[1].message.contains("failure of b"));
        assert!(errors[2].message.starts_with("compensation failed"));
    }

    #[test]
    fn test_storage_failure_records_every_outcome() {
        let template = Template::from_operations(
            "pair",
            vec![
                OperationSpec::new("a", "noop").parallel_safe().with_retries(1),
                OperationSpec::new("b", "noop").parallel_safe(),
                OperationSpec::new("c", "noop"),
            ],
        );
        let f = fixture_with(
            Arc::new(RejectResult::new("a")),
            vec![template.clone()],
            HandlerRegistry::with_builtins(),
        );
        let id = f.instantiate(&template);

        let err = f.manager.run(id).unwrap_err();
        assert!(matches!(err, EngineError::Storage(StorageError::Backend(_))));

        // siblings of the failed write are recorded, the failed one is released
        assert_eq!(f.status_of(id, "a"), Status::Error);
        assert_eq!(f.status_of(id, "b"), Status::Done);
        assert_eq!(f.status_of(id, "c"), Status::Done);

        let report = f.manager.run(id).unwrap();
        assert_eq!(report.claimed, vec!["a"]);
        assert_eq!(report.status, Status::Done);
        assert!(f.storage.load_process(id).unwrap().errors.is_empty());
    }

    #[test]
    fn test_unrecorded_last_attempt_is_logged() {
        let template = Template::from_operations("one", vec![OperationSpec::new("a", "noop")]);
        let f = fixture_with(
            Arc::new(RejectResult::new("a")),
            vec![template.clone()],
            HandlerRegistry::with_builtins(),
        );
        let id = f.instantiate(&template);

        assert!(f.manager.run(id).is_err());
        assert_eq!(f.status_of(id, "a"), Status::Error);

        let process = f.storage.load_process(id).unwrap();
        assert_eq!(process.errors.len(), 1);
        assert!(process.errors[0].message.contains("outcome not recorded"));
        assert!(DependencyResolver::new()
            .pending(&process.operations, &template, process.status)
            .is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let f = fixture(vec![], HandlerRegistry::new());
        let mut registry = ManagerRegistry::new();
        assert!(registry.default_manager().is_none());

        registry.register(DEFAULT_MANAGER, Arc::new(f.manager));
        assert!(registry.contains("default"));
        assert!(registry.default_manager().is_some());
        assert!(registry.get("other").is_none());
    }
}
