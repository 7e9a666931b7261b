//! Dependency Resolver
//!
//! Pure functions from a status snapshot to the sets of operations the
//! manager may act on. Nothing is cached between calls: every tick
//! recomputes from the current snapshot in O(operations + edges).
//!
//! Templates are validated as acyclic before any process exists, so none
//! of these functions need cycle handling.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::process::Operation;

use super::model::{RollbackScope, Template};
use super::status::Status;

/// Computes ready, retry and rollback sets for one process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Operations that are NOT_STARTED with every dependency completed.
    ///
    /// Returned in template order.
    pub fn ready_set<'a>(&self, operations: &'a [Operation]) -> Vec<&'a Operation> {
        let statuses = status_index(operations);

        operations
            .iter()
            .filter(|op| op.status == Status::NotStarted)
            .filter(|op| {
                op.dependencies.iter().all(|dep| {
                    statuses
                        .get(dep.as_str())
                        .is_some_and(|status| status.is_completed())
                })
            })
            .collect()
    }

    /// Failed operations that still have retry budget left.
    pub fn retry_set<'a>(&self, operations: &'a [Operation], template: &Template) -> Vec<&'a Operation> {
        operations
            .iter()
            .filter(|op| op.status == Status::Error)
            .filter(|op| {
                template
                    .operation(&op.id)
                    .is_some_and(|spec| op.attempts < spec.max_attempts())
            })
            .collect()
    }

    /// True when an ERROR operation has used its whole retry budget.
    pub fn is_exhausted(&self, operation: &Operation, template: &Template) -> bool {
        operation.status == Status::Error
            && template
                .operation(&operation.id)
                .map_or(true, |spec| operation.attempts >= spec.max_attempts())
    }

    /// Terminally failed operations whose template marks them as
    /// rollback-triggering.
    pub fn rollback_origins<'a>(
        &self,
        operations: &'a [Operation],
        template: &Template,
    ) -> Vec<&'a Operation> {
        operations
            .iter()
            .filter(|op| self.is_exhausted(op, template))
            .filter(|op| {
                template
                    .operation(&op.id)
                    .is_some_and(|spec| spec.rollback_on_failure)
            })
            .collect()
    }

    /// Operations that still have to be rolled back.
    ///
    /// With [`RollbackScope::Dependents`] these are the DONE transitive
    /// dependents of every rollback origin. With [`RollbackScope::Process`],
    /// once the process itself is in ROLLBACK, they are the origins plus
    /// every DONE operation.
    pub fn rollback_candidates<'a>(
        &self,
        operations: &'a [Operation],
        template: &Template,
        process_status: Status,
    ) -> HashSet<&'a str> {
        let origins = self.rollback_origins(operations, template);

        match template.rollback_scope {
            RollbackScope::Process => {
                if process_status != Status::Rollback {
                    return HashSet::new();
                }
                operations
                    .iter()
                    .filter(|op| op.status == Status::Done)
                    .chain(origins)
                    .map(|op| op.id.as_str())
                    .collect()
            }
            RollbackScope::Dependents => {
                if origins.is_empty() {
                    return HashSet::new();
                }

                let statuses = status_index(operations);
                let dependents = dependents_index(operations);
                let mut seen: HashSet<&str> = HashSet::new();
                let mut queue: VecDeque<&str> = origins.iter().map(|op| op.id.as_str()).collect();

                while let Some(current) = queue.pop_front() {
                    for &dependent in dependents.get(current).map(Vec::as_slice).unwrap_or_default() {
                        if seen.insert(dependent) {
                            queue.push_back(dependent);
                        }
                    }
                }

                seen.into_iter()
                    .filter(|id| statuses.get(id) == Some(&Status::Done))
                    .collect()
            }
        }
    }

    /// Rollback candidates whose dependents have all been dealt with.
    ///
    /// This is the ready set inverted: an operation may be compensated once
    /// none of its dependents is still running or still awaiting
    /// compensation, so rollback proceeds in reverse dependency order.
    pub fn rollback_ready_set<'a>(
        &self,
        operations: &'a [Operation],
        template: &Template,
        process_status: Status,
    ) -> Vec<&'a Operation> {
        let candidates = self.rollback_candidates(operations, template, process_status);
        if candidates.is_empty() {
            return Vec::new();
        }

        let statuses = status_index(operations);
        let dependents = dependents_index(operations);

        operations
            .iter()
            .filter(|op| candidates.contains(op.id.as_str()))
            .filter(|op| {
                dependents
                    .get(op.id.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .all(|dep| {
                        !candidates.contains(dep)
                            && statuses.get(dep) != Some(&Status::InProgress)
                    })
            })
            .collect()
    }

    /// Everything the engine could still act on: ready, retryable,
    /// in-flight and rollback-ready operations.
    ///
    /// Forward work is not counted once a process is in ROLLBACK.
    pub fn pending<'a>(
        &self,
        operations: &'a [Operation],
        template: &Template,
        process_status: Status,
    ) -> Vec<&'a Operation> {
        let mut pending: Vec<&Operation> = operations
            .iter()
            .filter(|op| op.status == Status::InProgress)
            .collect();

        if process_status != Status::Rollback {
            pending.extend(self.ready_set(operations));
            pending.extend(self.retry_set(operations, template));
        }
        pending.extend(self.rollback_ready_set(operations, template, process_status));

        pending
    }
}

fn status_index(operations: &[Operation]) -> HashMap<&str, Status> {
    operations
        .iter()
        .map(|op| (op.id.as_str(), op.status))
        .collect()
}

fn dependents_index(operations: &[Operation]) -> HashMap<&str, Vec<&str>> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for op in operations {
        for dep in &op.dependencies {
            dependents.entry(dep.as_str()).or_default().push(op.id.as_str());
        }
    }
    dependents
}
