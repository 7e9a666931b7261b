//! Process Execution Module
//!
//! Runs processes: handlers do the work of single operations, the manager
//! advances a process one tick at a time, and the engine ties storage,
//! templates and registries together behind one API.
//!
//! # Architecture
//!
//! - [`engine`]: Public engine facade and its builder
//! - [`manager`]: Tick loop, manager trait and registry
//! - [`handler`]: Handler trait, inputs, outcomes and registry
//! - [`builtin`]: Handlers available in every engine

pub mod builtin;
pub mod engine;
pub mod handler;
pub mod manager;
mod outcome;

pub use engine::{Engine, EngineBuilder};
pub use handler::{CancelToken, Handler, HandlerInput, HandlerRegistry, Outcome};
pub use manager::{Manager, ManagerConfig, ManagerRegistry, ProcessManager, TickReport};
