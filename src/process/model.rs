//! Process Data Model
//!
//! A [`Process`] is one instantiation of a template. It owns its
//! operations, its context and its error log; storage backends persist it
//! as a single unit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::model::Template;
use crate::workflow::status::Status;

use super::context::Context;
use super::errors::ErrorRecord;

/// Identifier of a process, allocated by storage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Points at one operation of one process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationRef {
    pub process: ProcessId,
    pub operation: String,
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process, self.operation)
    }
}

/// One step instance within a process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub process_id: ProcessId,
    pub status: Status,
    /// Sibling operations that must complete first
    pub dependencies: Vec<String>,
    /// Nested process spawned by this operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_process: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Number of times the operation has been claimed for execution
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Creates a NOT_STARTED operation.
    pub fn new(process_id: ProcessId, id: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            process_id,
            status: Status::NotStarted,
            dependencies,
            child_process: None,
            result: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}

/// A running instantiation of a template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Process {
    pub id: ProcessId,
    pub template_id: String,
    pub status: Status,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Operation that spawned this process, for nested workflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<OperationRef>,
    pub created_at: DateTime<Utc>,
}

impl Process {
    /// Instantiates a template: every operation starts NOT_STARTED.
    pub fn instantiate(id: ProcessId, template: &Template, data: Map<String, Value>) -> Self {
        let operations = template
            .operations
            .iter()
            .map(|spec| Operation::new(id, spec.id.clone(), spec.depends_on.clone()))
            .collect();

        Self {
            id,
            template_id: template.id.clone(),
            status: Status::NotStarted,
            operations,
            context: Context::from_map(data),
            errors: Vec::new(),
            parent: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the spawning operation (builder style).
    pub fn with_parent(mut self, parent: OperationRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Gets an operation by id.
    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Gets a mutable operation by id.
    pub fn operation_mut(&mut self, id: &str) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    /// Operations that still block process completion.
    pub fn incompleted_operations(&self) -> Vec<&Operation> {
        self.operations.iter().filter(|op| !op.is_completed()).collect()
    }

    /// Operation statuses in template order.
    pub fn operation_statuses(&self) -> impl Iterator<Item = Status> + '_ {
        self.operations.iter().map(|op| op.status)
    }

    /// Returns the current progress as (completed, total).
    pub fn progress(&self) -> (usize, usize) {
        let completed = self.operations.iter().filter(|op| op.is_completed()).count();
        (completed, self.operations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::OperationSpec;
    use serde_json::json;

    fn template() -> Template {
        Template::from_operations(
            "t",
            vec![
                OperationSpec::new("a", "noop"),
                OperationSpec::new("b", "noop").depends_on("a"),
            ],
        )
    }

    #[test]
    fn test_instantiate() {
        let mut data = Map::new();
        data.insert("customer".to_string(), json!("acme"));

        let process = Process::instantiate(ProcessId(3), &template(), data);

        assert_eq!(process.id, ProcessId(3));
        assert_eq!(process.template_id, "t");
        assert_eq!(process.status, Status::NotStarted);
        assert_eq!(process.operations.len(), 2);
        assert!(process
            .operations
            .iter()
            .all(|op| op.status == Status::NotStarted && op.process_id == ProcessId(3)));
        assert_eq!(process.operation("b").unwrap().dependencies, vec!["a"]);
        assert_eq!(process.context.get_str("customer"), Some("acme"));
        assert!(process.errors.is_empty());
        assert!(process.parent.is_none());
    }

    #[test]
    fn test_progress_and_incompleted() {
        let mut process = Process::instantiate(ProcessId(1), &template(), Map::new());
        assert_eq!(process.progress(), (0, 2));

        process.operation_mut("a").unwrap().status = Status::Done;
        assert_eq!(process.progress(), (1, 2));
        assert_eq!(process.incompleted_operations().len(), 1);

        process.operation_mut("b").unwrap().status = Status::Skipped;
        assert!(process.incompleted_operations().is_empty());
        assert_eq!(process.progress(), (2, 2));
    }

    #[test]
    fn test_operation_reference() {
        let process = Process::instantiate(ProcessId(9), &template(), Map::new())
            .with_parent(OperationRef {
                process: ProcessId(1),
                operation: "spawn".to_string(),
            });

        let parent = process.parent.unwrap();
        assert_eq!(parent.to_string(), "1/spawn");
        assert_eq!(process.operations[1].process_id, ProcessId(9));
    }
}
