//! Template Loading
//!
//! Reads template definitions from YAML and keeps validated templates in a
//! [`TemplateCatalog`]. Validation happens exactly once, on insertion, so
//! every template a process can reference is known to be acyclic.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::error::ConfigurationError;

use super::model::Template;
use super::validator::validate_template;

/// Parses and validates a template from YAML text.
pub fn parse_template(yaml: &str, origin: &Path) -> Result<Template, ConfigurationError> {
    let template: Template =
        serde_yaml::from_str(yaml).map_err(|source| ConfigurationError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

    info!(
        "Parsed template '{}' ({} operations)",
        template.id,
        template.operations.len()
    );

    validate_template(&template)?;
    Ok(template)
}

/// Loads a template from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use procflow::workflow::load_template;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let template = load_template("onboarding.yaml")?;
///     println!("Loaded {} operations", template.operations.len());
///     Ok(())
/// }
/// ```
pub fn load_template(path: impl AsRef<Path>) -> Result<Template, ConfigurationError> {
    let path = path.as_ref();
    info!("Loading template from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml.len());

    parse_template(&yaml, path)
}

/// Validated templates keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Arc<Template>>,
}

impl TemplateCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and adds a template.
    ///
    /// Fails with a [`ConfigurationError`] on an invalid graph or when the
    /// id is already taken.
    pub fn insert(&mut self, template: Template) -> Result<Arc<Template>, ConfigurationError> {
        if self.templates.contains_key(&template.id) {
            return Err(ConfigurationError::DuplicateTemplate(template.id));
        }

        validate_template(&template)?;

        let template = Arc::new(template);
        self.templates
            .insert(template.id.clone(), Arc::clone(&template));
        Ok(template)
    }

    /// Loads a YAML file into the catalog.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<Arc<Template>, ConfigurationError> {
        let template = load_template(path)?;
        self.insert(template)
    }

    /// Gets a template by id.
    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.get(id).cloned()
    }

    /// Iterates templates in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.values()
    }

    /// Returns the number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns true if the catalog holds no templates.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{OperationSpec, RollbackScope};
    use tempfile::tempdir;

    const DIAMOND_YAML: &str = r#"
id: diamond
rollback_scope: process
operations:
  - id: a
    handler: noop
  - id: b
    handler: noop
    depends_on: a
    retries: 2
  - id: c
    handler: shell
    depends_on: a
    parallel_safe: true
    params:
      command: echo c
  - id: d
    handler: noop
    depends_on: [b, c]
    rollback_on_failure: true
    compensate: noop
"#;

    #[test]
    fn test_parse_template() {
        let template = parse_template(DIAMOND_YAML, Path::new("inline")).unwrap();

        assert_eq!(template.id, "diamond");
        assert_eq!(template.rollback_scope, RollbackScope::Process);
        assert_eq!(template.operations.len(), 4);
        assert_eq!(template.operations[1].retries, 2);
        assert!(template.operations[2].parallel_safe);
        assert_eq!(template.operations[2].params["command"], "echo c");
        assert!(template.operations[3].rollback_on_failure);
        assert_eq!(template.operations[3].compensate.as_deref(), Some("noop"));
    }

    #[test]
    fn test_load_template_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("diamond.yaml");
        fs::write(&path, DIAMOND_YAML).unwrap();

        let template = load_template(&path).unwrap();
        assert_eq!(template.id, "diamond");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_template("/nonexistent/template.yaml").unwrap_err();
        assert!(matches!(err, ConfigurationError::Io { .. }));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_template("id: [unclosed", Path::new("broken.yaml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_cyclic_template_fails_to_load() {
        let yaml = r#"
id: cycle
operations:
  - id: a
    handler: noop
    depends_on: b
  - id: b
    handler: noop
    depends_on: a
"#;
        let err = parse_template(yaml, Path::new("cycle.yaml")).unwrap_err();
        assert!(err.to_string().contains("cyclic dependency"));
    }

    #[test]
    fn test_catalog_insert_and_get() {
        let mut catalog = TemplateCatalog::new();
        catalog
            .insert(Template::from_operations("t", vec![OperationSpec::new("a", "noop")]))
            .unwrap();

        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("t").is_some());
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let mut catalog = TemplateCatalog::new();
        catalog.insert(Template::new("t")).unwrap();

        let err = catalog.insert(Template::new("t")).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateTemplate(id) if id == "t"));
    }

    #[test]
    fn test_catalog_rejects_invalid_graph() {
        let mut catalog = TemplateCatalog::new();
        let template = Template::from_operations(
            "bad",
            vec![OperationSpec::new("a", "noop").depends_on("nope")],
        );

        assert!(catalog.insert(template).is_err());
        assert!(catalog.is_empty());
    }
}
