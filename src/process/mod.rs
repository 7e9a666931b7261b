//! Process Instances
//!
//! Runtime state created when a template is instantiated.
//!
//! # Structure
//!
//! - [`model`]: Process and Operation instances
//! - [`context`]: Per-process shared data
//! - [`errors`]: Append-only error log entries

pub mod context;
pub mod errors;
pub mod model;

pub use context::Context;
pub use errors::{ErrorRecord, ErrorSubject};
pub use model::{Operation, OperationRef, Process, ProcessId};
