//! Process Error Log
//!
//! Append-only records of execution failures, attached to a process or to
//! one of its operations.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::ProcessId;

/// What an error record is about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorSubject {
    Process { process: ProcessId },
    Operation { process: ProcessId, operation: String },
}

impl ErrorSubject {
    /// Process the record belongs to.
    pub fn process_id(&self) -> ProcessId {
        match self {
            ErrorSubject::Process { process } | ErrorSubject::Operation { process, .. } => *process,
        }
    }

    /// Operation id, if the record references an operation.
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            ErrorSubject::Process { .. } => None,
            ErrorSubject::Operation { operation, .. } => Some(operation),
        }
    }
}

impl fmt::Display for ErrorSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSubject::Process { process } => write!(f, "process {process}"),
            ErrorSubject::Operation { process, operation } => {
                write!(f, "operation '{operation}' of process {process}")
            }
        }
    }
}

/// One immutable entry of a process's error log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub subject: ErrorSubject,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Records a failure of the process itself.
    pub fn for_process(process: ProcessId, message: impl Into<String>) -> Self {
        Self {
            subject: ErrorSubject::Process { process },
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    /// Records a failure of one operation.
    pub fn for_operation(
        process: ProcessId,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject: ErrorSubject::Operation {
                process,
                operation: operation.into(),
            },
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_record() {
        let record = ErrorRecord::for_operation(ProcessId(7), "charge", "card declined");

        assert_eq!(record.subject.process_id(), ProcessId(7));
        assert_eq!(record.subject.operation_id(), Some("charge"));
        assert_eq!(record.message, "card declined");
        assert_eq!(record.subject.to_string(), "operation 'charge' of process 7");
    }

    #[test]
    fn test_process_record() {
        let record = ErrorRecord::for_process(ProcessId(1), "stuck");
        assert!(record.subject.operation_id().is_none());
        assert!(record.created_at <= Utc::now());
    }
}
