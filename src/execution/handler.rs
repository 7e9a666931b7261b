//! Operation Handlers
//!
//! A handler is the code bound to an operation by name in a template. The
//! manager calls it with a [`HandlerInput`] and turns the returned
//! [`Outcome`] into a status transition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::process::{Context, ProcessId};
use crate::storage::Storage;
use crate::workflow::status::Status;

/// Everything a handler gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub process_id: ProcessId,
    pub operation_id: String,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// `params` of the operation in the template
    pub params: Value,
    /// Snapshot of the process context taken when the tick began
    pub context: Context,
    pub cancel: CancelToken,
}

impl HandlerInput {
    /// Looks up a parameter by key.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Looks up a string parameter by key.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }
}

/// What a handler asks the manager to do with its operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finished. An object result is merged into the process context.
    Done(Option<Value>),

    /// Nothing to do; the operation is marked SKIPPED.
    Skip(String),

    /// Work continues elsewhere and is reported later through
    /// [`Engine::resolve_operation`](crate::Engine::resolve_operation).
    Deferred,

    /// Run a child process; the operation completes with the child's
    /// context once the child is DONE.
    Spawn {
        template: String,
        data: Map<String, Value>,
    },
}

impl Outcome {
    pub fn done() -> Self {
        Outcome::Done(None)
    }

    pub fn with_result(result: Value) -> Self {
        Outcome::Done(Some(result))
    }
}

/// Code run for an operation.
pub trait Handler: Send + Sync {
    fn call(&self, input: &HandlerInput) -> Result<Outcome, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&HandlerInput) -> Result<Outcome, HandlerError> + Send + Sync,
{
    fn call(&self, input: &HandlerInput) -> Result<Outcome, HandlerError> {
        self(input)
    }
}

/// Lets a running handler notice that its operation or process was canceled.
///
/// Cancellation is cooperative: nothing interrupts the handler, it is
/// expected to check the token at convenient points and stop.
#[derive(Clone)]
pub struct CancelToken {
    storage: Option<Arc<dyn Storage>>,
    process: ProcessId,
    operation: String,
}

impl CancelToken {
    pub fn new(storage: Arc<dyn Storage>, process: ProcessId, operation: impl Into<String>) -> Self {
        Self {
            storage: Some(storage),
            process,
            operation: operation.into(),
        }
    }

    /// A token that never reports cancellation.
    pub fn detached(process: ProcessId, operation: impl Into<String>) -> Self {
        Self {
            storage: None,
            process,
            operation: operation.into(),
        }
    }

    /// True once the process or the operation has been canceled.
    ///
    /// Storage failures read as "not canceled".
    pub fn is_cancelled(&self) -> bool {
        let Some(storage) = &self.storage else {
            return false;
        };

        match storage.load_process(self.process) {
            Ok(process) => {
                process.status == Status::Canceled
                    || process
                        .operation(&self.operation)
                        .is_some_and(|op| op.status == Status::Canceled)
            }
            Err(_) => false,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("process", &self.process)
            .field("operation", &self.operation)
            .field("attached", &self.storage.is_some())
            .finish()
    }
}

/// Handlers available to templates, by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers a handler, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}
