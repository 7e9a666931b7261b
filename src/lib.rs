//! procflow - Process Orchestration Core
//!
//! Runs processes built from templates: directed acyclic graphs of named
//! operations, each bound to a handler. A manager advances every process in
//! short, non-blocking ticks. Each tick claims ready operations with an
//! atomic compare-and-set, so concurrent ticks never run an operation twice.
//!
//! # Architecture
//!
//! - [`workflow`]: Templates, validation, status rules and dependency resolution
//! - [`process`]: Process and operation instances, context and error log
//! - [`storage`]: Storage trait with in-memory and JSON file backends
//! - [`execution`]: Handlers, the process manager and the engine facade
//! - [`config`]: Engine configuration file
//!
//! # Example
//!
//! ```rust,no_run
//! use procflow::{load_template, Engine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let template = load_template("onboarding.yaml")?;
//!     let id = template.id.clone();
//!
//!     let engine = Engine::builder().template(template).max_parallel(4).build()?;
//!     let process = engine.instantiate(&id, Default::default())?;
//!     engine.start(process)?;
//!
//!     let status = engine.drive(process)?;
//!     if engine.is_incomplete(process)? {
//!         for error in engine.errors(process)? {
//!             eprintln!("{}: {}", error.subject, error.message);
//!         }
//!     }
//!     println!("finished as {status}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod process;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ConfigurationError, EngineError, HandlerError, StorageError};
pub use execution::{Engine, EngineBuilder, Handler, HandlerInput, Outcome, TickReport};
pub use process::{Context, ErrorRecord, ProcessId};
pub use workflow::model::{OperationSpec, RollbackScope, Template};
pub use workflow::parser::load_template;
pub use workflow::status::Status;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "procflow";
