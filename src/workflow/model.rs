//! Template Data Model
//!
//! Immutable definitions of operation graphs. A template is loaded once,
//! validated once, and then shared by every process instantiated from it.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: customer_onboarding
//! manager: default
//! rollback_scope: process
//! operations:
//!   - id: create_account
//!     handler: shell
//!     params:
//!       command: ./bin/create-account
//!     retries: 2
//!     compensate: delete_account
//!
//!   - id: send_welcome
//!     handler: noop
//!     depends_on: create_account
//!     parallel_safe: true
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the manager used when a template does not pick one.
pub const DEFAULT_MANAGER: &str = "default";

/// Which completed operations are compensated when a rollback-triggering
/// operation fails for good.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackScope {
    /// Only the completed transitive dependents of the failed operation.
    #[default]
    Dependents,
    /// The failed operation and every completed operation of the process;
    /// forward execution stops.
    Process,
}

/// One step of a template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OperationSpec {
    /// Identifier, unique within the template
    pub id: String,

    /// Name of the handler in the handler registry
    pub handler: String,

    /// Operations that must complete before this one can run
    #[serde(deserialize_with = "single_or_vec", default)]
    pub depends_on: Vec<String>,

    /// Free-form parameters handed to the handler
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    /// How many times a failed execution is retried
    #[serde(default)]
    pub retries: u32,

    /// Whether exhausting the retries triggers a cascade rollback
    #[serde(default)]
    pub rollback_on_failure: bool,

    /// Whether the handler may run concurrently with its siblings
    #[serde(default)]
    pub parallel_safe: bool,

    /// Handler run when this operation is rolled back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<String>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl OperationSpec {
    /// Creates an operation spec with no dependencies and default policy.
    ///
    /// # Example
    ///
    /// ```
    /// use procflow::workflow::OperationSpec;
    ///
    /// let spec = OperationSpec::new("charge", "payments")
    ///     .depends_on("reserve")
    ///     .with_retries(2)
    ///     .rollback_on_failure();
    /// assert_eq!(spec.depends_on, vec!["reserve"]);
    /// ```
    pub fn new(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            handler: handler.into().trim().to_string(),
            depends_on: Vec::new(),
            params: Value::Null,
            retries: 0,
            rollback_on_failure: false,
            parallel_safe: false,
            compensate: None,
        }
    }

    /// Adds a dependency on another operation.
    pub fn depends_on(mut self, operation_id: impl Into<String>) -> Self {
        self.depends_on.push(operation_id.into());
        self
    }

    /// Sets the handler parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Sets the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Marks the operation as rollback-triggering.
    pub fn rollback_on_failure(mut self) -> Self {
        self.rollback_on_failure = true;
        self
    }

    /// Allows the handler to run alongside other parallel-safe operations.
    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    /// Sets the compensating handler.
    pub fn with_compensation(mut self, handler: impl Into<String>) -> Self {
        self.compensate = Some(handler.into());
        self
    }

    /// Total number of executions allowed (first attempt plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// An immutable operation graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Template {
    /// Identifier used to instantiate processes
    pub id: String,

    /// Manager implementation driving processes of this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,

    /// Compensation scope after a rollback-triggering failure
    #[serde(default)]
    pub rollback_scope: RollbackScope,

    /// Operations in declaration order
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl Template {
    /// Creates an empty template.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            manager: None,
            rollback_scope: RollbackScope::default(),
            operations: Vec::new(),
        }
    }

    /// Creates a template from a list of operations.
    pub fn from_operations(id: impl Into<String>, operations: Vec<OperationSpec>) -> Self {
        let mut template = Self::new(id);
        template.operations = operations;
        template
    }

    /// Appends an operation (builder style).
    pub fn with_operation(mut self, operation: OperationSpec) -> Self {
        self.operations.push(operation);
        self
    }

    /// Selects the manager implementation.
    pub fn with_manager(mut self, manager: impl Into<String>) -> Self {
        self.manager = Some(manager.into());
        self
    }

    /// Selects the rollback scope.
    pub fn with_rollback_scope(mut self, scope: RollbackScope) -> Self {
        self.rollback_scope = scope;
        self
    }

    /// Name of the manager driving this template's processes.
    pub fn manager_name(&self) -> &str {
        self.manager.as_deref().unwrap_or(DEFAULT_MANAGER)
    }

    /// Gets an operation spec by id.
    pub fn operation(&self, id: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Returns the number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the template has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_spec_builder() {
        let spec = OperationSpec::new(" charge ", "payments")
            .depends_on("reserve")
            .with_params(json!({"amount": 10}))
            .with_retries(3)
            .rollback_on_failure()
            .parallel_safe()
            .with_compensation("refund");

        assert_eq!(spec.id, "charge");
        assert_eq!(spec.depends_on, vec!["reserve"]);
        assert_eq!(spec.params["amount"], 10);
        assert_eq!(spec.max_attempts(), 4);
        assert!(spec.rollback_on_failure);
        assert!(spec.parallel_safe);
        assert_eq!(spec.compensate.as_deref(), Some("refund"));
    }

    #[test]
    fn test_template_defaults() {
        let template = Template::new("empty");
        assert!(template.is_empty());
        assert_eq!(template.manager_name(), DEFAULT_MANAGER);
        assert_eq!(template.rollback_scope, RollbackScope::Dependents);
    }

    #[test]
    fn test_template_lookup() {
        let template = Template::new("t")
            .with_operation(OperationSpec::new("a", "noop"))
            .with_operation(OperationSpec::new("b", "noop").depends_on("a"));

        assert_eq!(template.len(), 2);
        assert!(template.operation("b").is_some());
        assert!(template.operation("z").is_none());
        assert_eq!(template.operation("b").unwrap().depends_on, vec!["a"]);
    }

    #[test]
    fn test_yaml_depends_on_single_or_list() {
        let yaml = r#"
id: t
rollback_scope: process
operations:
  - id: a
    handler: noop
  - id: b
    handler: noop
    depends_on: a
  - id: c
    handler: noop
    depends_on: [a, b]
"#;
        let template: Template = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(template.rollback_scope, RollbackScope::Process);
        assert!(template.operations[0].depends_on.is_empty());
        assert_eq!(template.operations[1].depends_on, vec!["a"]);
        assert_eq!(template.operations[2].depends_on, vec!["a", "b"]);
    }
}
