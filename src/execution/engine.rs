//! Process Engine
//!
//! The public face of the library. The engine owns the storage, the
//! template catalog and the handler and manager registries, and exposes
//! process lifecycle calls on top of them:
//!
//! - instantiate and start processes
//! - tick or drive them until nothing more can happen
//! - query status, context, error log and status counts
//! - complete, cancel, or report deferred operation outcomes
//!
//! # Example
//!
//! ```rust,no_run
//! use procflow::{Engine, OperationSpec, Template};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let template = Template::from_operations(
//!         "greet",
//!         vec![
//!             OperationSpec::new("hello", "shell")
//!                 .with_params(serde_json::json!({"command": "echo hello"})),
//!         ],
//!     );
//!
//!     let engine = Engine::builder().template(template).build()?;
//!     let id = engine.instantiate("greet", Default::default())?;
//!     engine.start(id)?;
//!     let status = engine.drive(id)?;
//!
//!     println!("{status}: {:?}", engine.context(id)?);
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::error::{
    ConfigurationError, EngineError, HandlerError, Result, StorageError, StorageResult, ValidationError,
};
use crate::process::{Context, ErrorRecord, Process, ProcessId};
use crate::storage::{with_retries, FileStorage, MemoryStorage, Storage};
use crate::workflow::model::Template;
use crate::workflow::parser::TemplateCatalog;
use crate::workflow::resolver::DependencyResolver;
use crate::workflow::status::{StateMachine, Status};
use crate::workflow::validator::validate_bindings;

use super::handler::{Handler, HandlerRegistry, Outcome};
use super::manager::{Manager, ManagerConfig, ManagerRegistry, ProcessManager, TickReport};
use super::outcome::{Applied, OutcomeWriter};

/// Orchestrates processes built from a catalog of templates.
pub struct Engine {
    storage: Arc<dyn Storage>,
    catalog: Arc<TemplateCatalog>,
    managers: ManagerRegistry,
    /// Manager resolved for each process the engine has touched
    bound: RwLock<HashMap<ProcessId, Arc<dyn Manager>>>,
    resolver: DependencyResolver,
    machine: StateMachine,
    config: ManagerConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    fn retry<T>(&self, call: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
        with_retries(self.config.storage_retries, call)
    }

    fn load(&self, id: ProcessId) -> Result<Process> {
        Ok(self.retry(|| self.storage.load_process(id))?)
    }

    fn writer(&self) -> OutcomeWriter<'_> {
        OutcomeWriter::new(&*self.storage, &self.catalog, self.config.storage_retries)
    }

    fn template(&self, id: &str) -> Result<Arc<Template>> {
        self.catalog
            .get(id)
            .ok_or_else(|| EngineError::UnknownTemplate(id.to_string()))
    }

    /// Creates a NOT_STARTED process from a template with `data` as its
    /// initial context.
    pub fn instantiate(&self, template_id: &str, data: Map<String, Value>) -> Result<ProcessId> {
        let template = self.template(template_id)?;
        let id = self.retry(|| self.storage.next_process_id())?;
        let process = Process::instantiate(id, &template, data);
        self.retry(|| self.storage.create_process(&process))?;

        info!(
            "Process {} created from '{}' ({} operations)",
            id,
            template_id,
            template.len()
        );
        Ok(id)
    }

    /// Starts a process and binds it to its manager.
    ///
    /// Fails with [`EngineError::CannotStart`] unless the process is
    /// NOT_STARTED and has at least one operation.
    pub fn start(&self, id: ProcessId) -> Result<()> {
        let process = self.load(id)?;
        if !self.machine.can_start(process.status, process.operations.len()) {
            return Err(EngineError::CannotStart(id));
        }

        match self.retry(|| {
            self.storage
                .transition_process(id, Status::NotStarted, Status::InProgress)
        }) {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(EngineError::CannotStart(id)),
            Err(e) => return Err(e.into()),
        }

        self.manager_for(id)?;
        info!("Process {} started", id);
        Ok(())
    }

    /// Resolves the manager of a process once and remembers it.
    fn manager_for(&self, id: ProcessId) -> Result<Arc<dyn Manager>> {
        if let Some(manager) = self.bound_manager(id) {
            return Ok(manager);
        }

        let process = self.load(id)?;
        let template = self.template(&process.template_id)?;
        let name = template.manager_name();
        let manager = self.managers.get(name).ok_or_else(|| ConfigurationError::Invalid {
            template: template.id.clone(),
            problems: vec![ValidationError::UnknownManager(name.to_string())],
        })?;

        if let Ok(mut bound) = self.bound.write() {
            bound.entry(id).or_insert_with(|| Arc::clone(&manager));
        }
        debug!("Process {} bound to manager '{}'", id, name);
        Ok(manager)
    }

    fn bound_manager(&self, id: ProcessId) -> Option<Arc<dyn Manager>> {
        self.bound.read().ok()?.get(&id).cloned()
    }

    /// Runs one tick of a process.
    pub fn tick(&self, id: ProcessId) -> Result<TickReport> {
        self.manager_for(id)?.run(id)
    }

    /// Ticks a process, and every child process it spawned, until no tick
    /// makes progress. Returns the final status.
    pub fn drive(&self, id: ProcessId) -> Result<Status> {
        loop {
            let report = self.tick(id)?;
            let mut progressed = report.progressed;

            for child in self.running_children(id)? {
                let before = self.status(child)?;
                let after = self.drive(child)?;
                progressed |= before != after;
            }

            if !progressed {
                return Ok(report.status);
            }
        }
    }

    /// Child processes of operations still waiting on them.
    fn running_children(&self, id: ProcessId) -> Result<Vec<ProcessId>> {
        let process = self.load(id)?;
        Ok(process
            .operations
            .iter()
            .filter(|op| op.status == Status::InProgress)
            .filter_map(|op| op.child_process)
            .collect())
    }

    /// Ticks every process that is not DONE or CANCELED, in parallel.
    ///
    /// A process whose tick fails is logged and left out of the result.
    pub fn tick_all(&self) -> Result<Vec<TickReport>> {
        let mut active = Vec::new();
        for id in self.retry(|| self.storage.process_ids())? {
            let status = self.load(id)?.status;
            if !matches!(status, Status::Done | Status::Canceled) {
                active.push(id);
            }
        }

        let mut reports = Vec::with_capacity(active.len());
        for chunk in active.chunks(self.config.max_parallel.max(1)) {
            let results: Vec<(ProcessId, Result<TickReport>)> = thread::scope(|scope| {
                let running: Vec<_> = chunk
                    .iter()
                    .map(|&id| (id, scope.spawn(move || self.tick(id))))
                    .collect();

                running
                    .into_iter()
                    .map(|(id, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(StorageError::Backend(format!("tick of process {id} panicked")).into())
                        });
                        (id, result)
                    })
                    .collect::<Vec<_>>()
            });

            for (id, result) in results {
                match result {
                    Ok(report) => reports.push(report),
                    Err(e) => error!("Tick of process {} failed: {}", id, e),
                }
            }
        }
        Ok(reports)
    }

    /// Full snapshot of a process.
    pub fn process(&self, id: ProcessId) -> Result<Process> {
        self.load(id)
    }

    pub fn status(&self, id: ProcessId) -> Result<Status> {
        Ok(self.load(id)?.status)
    }

    /// True when the process has not reached DONE or CANCELED but nothing
    /// is left that a tick could do.
    pub fn is_incomplete(&self, id: ProcessId) -> Result<bool> {
        let process = self.load(id)?;
        if !process.status.is_incomplete() {
            return Ok(false);
        }

        let template = self.template(&process.template_id)?;
        Ok(self
            .resolver
            .pending(&process.operations, &template, process.status)
            .is_empty())
    }

    pub fn context(&self, id: ProcessId) -> Result<Context> {
        Ok(self.load(id)?.context)
    }

    pub fn errors(&self, id: ProcessId) -> Result<Vec<ErrorRecord>> {
        Ok(self.load(id)?.errors)
    }

    /// Number of processes per status, zero-filled.
    pub fn count_by_status(&self) -> Result<BTreeMap<Status, usize>> {
        Ok(self.retry(|| self.storage.count_by_status())?)
    }

    /// Processes currently in `status`, for example the ones stuck
    /// IN_PROGRESS.
    pub fn processes_with_status(&self, status: Status) -> Result<Vec<ProcessId>> {
        Ok(self.retry(|| self.storage.process_ids_by_status(status))?)
    }

    /// Moves an IN_PROGRESS process whose operations are all completed to
    /// DONE.
    ///
    /// Not idempotent: completing a DONE process is an
    /// [`EngineError::InvalidTransition`].
    pub fn complete(&self, id: ProcessId) -> Result<()> {
        let process = self.load(id)?;
        if !self.machine.can_transition_process(process.status, Status::Done) {
            return Err(EngineError::InvalidTransition {
                target: format!("process {id}"),
                from: process.status,
                to: Status::Done,
            });
        }
        if !self
            .machine
            .can_complete(process.status, process.operation_statuses())
        {
            return Err(EngineError::NotCompletable(id));
        }

        match self.retry(|| self.storage.transition_process(id, Status::InProgress, Status::Done)) {
            Ok(()) => {}
            Err(StorageError::Conflict { actual, .. }) => {
                return Err(EngineError::InvalidTransition {
                    target: format!("process {id}"),
                    from: actual,
                    to: Status::Done,
                })
            }
            Err(e) => return Err(e.into()),
        }

        info!("Process {} completed", id);
        self.writer().child_finished(&process)?;
        Ok(())
    }

    /// Cancels a process, its unfinished operations and their child
    /// processes.
    ///
    /// A canceled child process fails the operation that spawned it.
    pub fn cancel(&self, id: ProcessId) -> Result<()> {
        let process = self.load(id)?;
        if !self
            .machine
            .can_transition_process(process.status, Status::Canceled)
        {
            return Err(EngineError::InvalidTransition {
                target: format!("process {id}"),
                from: process.status,
                to: Status::Canceled,
            });
        }

        self.retry(|| {
            self.storage
                .transition_process(id, process.status, Status::Canceled)
        })?;
        warn!("Process {} canceled", id);

        for op in &process.operations {
            if !self.machine.can_transition_operation(op.status, Status::Canceled) {
                continue;
            }
            match self.retry(|| {
                self.storage
                    .transition_operation(id, &op.id, op.status, Status::Canceled)
            }) {
                Ok(_) => {}
                Err(e) if e.is_conflict() => debug!("Skipping cancel of {}/{}: {}", id, op.id, e),
                Err(e) => return Err(e.into()),
            }
            if let Some(child) = op.child_process {
                self.cancel_child(child)?;
            }
        }

        if let Some(parent) = &process.parent {
            let owner = self.load(parent.process)?;
            let template = self.template(&owner.template_id)?;
            if let (Some(spec), Some(op)) = (
                template.operation(&parent.operation),
                owner.operation(&parent.operation),
            ) {
                let error = HandlerError::failed(format!("child process {id} was canceled"));
                self.writer().fail(parent.process, spec, op.attempts, &error)?;
            }
        }
        Ok(())
    }

    fn cancel_child(&self, child: ProcessId) -> Result<()> {
        match self.cancel(child) {
            Ok(()) | Err(EngineError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cancels a single operation, and the child process it spawned.
    pub fn cancel_operation(&self, id: ProcessId, operation: &str) -> Result<()> {
        let process = self.load(id)?;
        let op = process
            .operation(operation)
            .ok_or_else(|| StorageError::OperationNotFound {
                process: id,
                operation: operation.to_string(),
            })?;

        if !self.machine.can_transition_operation(op.status, Status::Canceled) {
            return Err(EngineError::InvalidTransition {
                target: format!("operation '{operation}' of process {id}"),
                from: op.status,
                to: Status::Canceled,
            });
        }

        self.retry(|| {
            self.storage
                .transition_operation(id, operation, op.status, Status::Canceled)
        })?;
        warn!("Operation {}/{} canceled", id, operation);

        if let Some(child) = op.child_process {
            self.cancel_child(child)?;
        }
        Ok(())
    }

    /// Reports the outcome of an operation that returned
    /// [`Outcome::Deferred`], then ticks the process.
    pub fn resolve_operation(
        &self,
        id: ProcessId,
        operation: &str,
        outcome: std::result::Result<Outcome, HandlerError>,
    ) -> Result<TickReport> {
        let process = self.load(id)?;
        let template = self.template(&process.template_id)?;
        let (Some(op), Some(spec)) = (process.operation(operation), template.operation(operation)) else {
            return Err(StorageError::OperationNotFound {
                process: id,
                operation: operation.to_string(),
            }
            .into());
        };

        if op.status != Status::InProgress {
            return Err(EngineError::InvalidTransition {
                target: format!("operation '{operation}' of process {id}"),
                from: op.status,
                to: Status::Done,
            });
        }

        let applied = self.writer().apply(id, spec, op.attempts, outcome)?;
        debug!("Resolved {}/{}: {:?}", id, operation, applied);
        if applied == Applied::Lost {
            warn!("Outcome for {}/{} arrived too late", id, operation);
        }

        self.tick(id)
    }
}

/// Assembles an [`Engine`].
///
/// Templates are validated, and checked against the handler and manager
/// registries, in [`build`](EngineBuilder::build).
pub struct EngineBuilder {
    storage: Option<Arc<dyn Storage>>,
    state_file: Option<PathBuf>,
    templates: Vec<Template>,
    template_files: Vec<PathBuf>,
    handlers: HandlerRegistry,
    managers: ManagerRegistry,
    config: ManagerConfig,
}

impl EngineBuilder {
    /// A builder with in-memory storage and the built-in handlers.
    pub fn new() -> Self {
        Self {
            storage: None,
            state_file: None,
            templates: Vec::new(),
            template_files: Vec::new(),
            handlers: HandlerRegistry::with_builtins(),
            managers: ManagerRegistry::new(),
            config: ManagerConfig::default(),
        }
    }

    /// Applies an engine configuration file.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.config = config.manager_config();
        self.template_files.extend(config.templates.iter().cloned());
        if let Some(path) = &config.state_file {
            self.state_file = Some(path.clone());
        }
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Persists processes to a JSON snapshot file.
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    pub fn template_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_files.push(path.into());
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn manager(mut self, name: impl Into<String>, manager: Arc<dyn Manager>) -> Self {
        self.managers.register(name, manager);
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.config.max_parallel = max_parallel.max(1);
        self
    }

    pub fn storage_retries(mut self, retries: u32) -> Self {
        self.config.storage_retries = retries;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let storage: Arc<dyn Storage> = match (self.storage, self.state_file) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(FileStorage::open(path)?),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        let mut catalog = TemplateCatalog::new();
        for template in self.templates {
            catalog.insert(template)?;
        }
        for path in &self.template_files {
            catalog.load_file(path)?;
        }
        let catalog = Arc::new(catalog);
        let handlers = Arc::new(self.handlers);

        let mut managers = self.managers;
        if managers.default_manager().is_none() {
            managers.register(
                crate::workflow::model::DEFAULT_MANAGER,
                Arc::new(ProcessManager::new(
                    Arc::clone(&storage),
                    Arc::clone(&catalog),
                    Arc::clone(&handlers),
                    self.config,
                )),
            );
        }

        for template in catalog.iter() {
            validate_bindings(
                template,
                |name| handlers.contains(name),
                |name| managers.contains(name),
            )?;
        }

        info!(
            "Engine ready: {} templates, max parallel {}",
            catalog.len(),
            self.config.max_parallel
        );

        Ok(Engine {
            storage,
            catalog,
            managers,
            bound: RwLock::new(HashMap::new()),
            resolver: DependencyResolver::new(),
            machine: StateMachine::new(),
            config: self.config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
