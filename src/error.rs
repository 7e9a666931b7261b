//! Error types for template loading, storage and engine operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::process::ProcessId;
use crate::workflow::status::Status;

/// A single problem found while validating a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("template has no id")]
    EmptyTemplateId,

    #[error("operation has empty or whitespace-only id")]
    EmptyOperationId,

    #[error("duplicate operation id: '{0}'")]
    DuplicateOperation(String),

    #[error("operation '{0}' has no handler specified")]
    EmptyHandler(String),

    #[error("operation '{operation}' depends on unknown operation '{dependency}'")]
    DanglingDependency {
        operation: String,
        dependency: String,
    },

    #[error("operation '{0}' depends on itself")]
    SelfDependency(String),

    #[error("cyclic dependency between operations: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("operation '{operation}' uses unknown handler '{handler}'")]
    UnknownHandler { operation: String, handler: String },

    #[error("template uses unknown manager '{0}'")]
    UnknownManager(String),
}

/// Raised when a template cannot be loaded. Never reaches a live process.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("template '{template}' is invalid:\n{}", format_problems(.problems))]
    Invalid {
        template: String,
        problems: Vec<ValidationError>,
    },

    #[error("template '{0}' is already registered")]
    DuplicateTemplate(String),

    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

fn format_problems(problems: &[ValidationError]) -> String {
    problems
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ConfigurationError {
    /// Validation problems carried by this error, if any.
    pub fn problems(&self) -> &[ValidationError] {
        match self {
            ConfigurationError::Invalid { problems, .. } => problems,
            _ => &[],
        }
    }
}

/// Failure reported by an operation handler.
///
/// Recorded in the process error log on terminal failure; never propagates
/// out of a tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered as '{0}'")]
    Unregistered(String),

    #[error("operation was canceled")]
    Canceled,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Storage layer failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("process {0} not found")]
    ProcessNotFound(ProcessId),

    #[error("operation '{operation}' not found in process {process}")]
    OperationNotFound {
        process: ProcessId,
        operation: String,
    },

    #[error("process {0} already exists")]
    DuplicateProcess(ProcessId),

    /// A conditional update found a different status than expected.
    ///
    /// For claims this means another worker got there first.
    #[error("status conflict on {target}: expected {expected}, found {actual}")]
    Conflict {
        target: String,
        expected: Status,
        actual: Status,
    },

    /// Transient backend failure; the same call may succeed when retried.
    #[error("storage busy: {0}")]
    Busy(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

/// Errors surfaced by the engine facade and managers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("invalid transition for {target}: {from} -> {to}")]
    InvalidTransition {
        target: String,
        from: Status,
        to: Status,
    },

    #[error("process {0} cannot start (not NOT_STARTED or has no operations)")]
    CannotStart(ProcessId),

    #[error("process {0} cannot complete: operations still pending")]
    NotCompletable(ProcessId),
}

/// Result type for storage calls.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type for engine calls.
pub type Result<T> = std::result::Result<T, EngineError>;
