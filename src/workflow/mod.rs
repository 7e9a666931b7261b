//! Template Definition Module
//!
//! Provides data structures and utilities for defining, loading and
//! validating operation graphs, plus the status rules and dependency
//! resolution shared by every process.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Template, OperationSpec)
//! - [`parser`]: YAML loading and the template catalog
//! - [`validator`]: Graph validation and cycle detection
//! - [`status`]: Status enum and state machine
//! - [`resolver`]: Ready-set computation

pub mod model;
pub mod parser;
pub mod resolver;
pub mod status;
pub mod validator;

pub use model::{OperationSpec, RollbackScope, Template, DEFAULT_MANAGER};
pub use parser::{load_template, parse_template, TemplateCatalog};
pub use resolver::DependencyResolver;
pub use status::{StateMachine, Status};
pub use validator::{topological_order, validate_template};
