//! Status State Machine
//!
//! Lifecycle states shared by processes and operations, the legal
//! transitions between them, and the completion predicates the resolver
//! and manager rely on.
//!
//! ```text
//! NOT_STARTED ──► IN_PROGRESS ──► DONE ───────┐
//!      │              │   ▲  └──► SKIPPED     ├──► ROLLBACK
//!      │              ▼   │                   │
//!      │            ERROR ┴───────────────────┘
//!      └──────────────┴─────► CANCELED
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a process or operation.
///
/// Variants are declared in their persisted order, so `Ord` follows
/// `NOT_STARTED < IN_PROGRESS < DONE < SKIPPED < CANCELED < ERROR < ROLLBACK`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotStarted,
    InProgress,
    Done,
    Skipped,
    Canceled,
    Error,
    Rollback,
}

impl Status {
    /// Every status, in persisted order.
    pub const ALL: [Status; 7] = [
        Status::NotStarted,
        Status::InProgress,
        Status::Done,
        Status::Skipped,
        Status::Canceled,
        Status::Error,
        Status::Rollback,
    ];

    /// Numeric code used by storage backends.
    pub fn code(self) -> u8 {
        match self {
            Status::NotStarted => 0,
            Status::InProgress => 1,
            Status::Done => 2,
            Status::Skipped => 3,
            Status::Canceled => 4,
            Status::Error => 5,
            Status::Rollback => 6,
        }
    }

    /// Inverse of [`Status::code`].
    pub fn from_code(code: u8) -> Option<Status> {
        Status::ALL.get(usize::from(code)).copied()
    }

    /// True when the status no longer blocks dependents.
    ///
    /// This is "finished with", not "succeeded": SKIPPED and CANCELED
    /// count, ERROR does not.
    pub fn is_completed(self) -> bool {
        matches!(self, Status::Done | Status::Skipped | Status::Canceled)
    }

    /// True for statuses an operation can never leave on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Skipped | Status::Canceled | Status::Rollback
        )
    }

    /// Statuses in which a process has not reached its terminal condition.
    pub fn incomplete_statuses() -> Vec<Status> {
        Status::ALL
            .into_iter()
            .filter(|s| !matches!(s, Status::Done | Status::Canceled))
            .collect()
    }

    /// True when `self` is one of [`Status::incomplete_statuses`].
    pub fn is_incomplete(self) -> bool {
        !matches!(self, Status::Done | Status::Canceled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NotStarted => "NOT_STARTED",
            Status::InProgress => "IN_PROGRESS",
            Status::Done => "DONE",
            Status::Skipped => "SKIPPED",
            Status::Canceled => "CANCELED",
            Status::Error => "ERROR",
            Status::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}

/// Legal transition tables for operations and processes.
///
/// Stateless; the manager and engine hold one as a collaborator and ask it
/// before every conditional update they issue.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachine;

impl StateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Returns true if an operation may move from `from` to `to`.
    pub fn can_transition_operation(&self, from: Status, to: Status) -> bool {
        use Status::*;

        match (from, to) {
            (NotStarted, InProgress) => true,
            (InProgress, Done | Error | Skipped) => true,
            // retry claim; the budget is checked by the resolver
            (Error, InProgress) => true,
            (Done | Error, Rollback) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Returns true if a process may move from `from` to `to`.
    pub fn can_transition_process(&self, from: Status, to: Status) -> bool {
        use Status::*;

        match (from, to) {
            (NotStarted, InProgress) => true,
            (InProgress, Done | Rollback) => true,
            (NotStarted | InProgress | Rollback, Canceled) => true,
            _ => false,
        }
    }

    /// A process can start only from NOT_STARTED and only with operations.
    pub fn can_start(&self, status: Status, operation_count: usize) -> bool {
        status == Status::NotStarted && operation_count > 0
    }

    /// A process is ready to complete when every operation is completed.
    pub fn can_complete<I>(&self, status: Status, operation_statuses: I) -> bool
    where
        I: IntoIterator<Item = Status>,
    {
        status == Status::InProgress && operation_statuses.into_iter().all(Status::is_completed)
    }
}
