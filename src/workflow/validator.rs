//! Template Validation
//!
//! Validates operation graphs once, when a template is loaded:
//! - Operation field validation
//! - Reference integrity (no dangling dependencies)
//! - Dependency graph validation (no cycles)
//! - Handler and manager bindings against the engine's registries
//!
//! A template that passes here is guaranteed acyclic, which is what lets
//! the resolver run without any cycle handling.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};

use crate::error::{ConfigurationError, ValidationError};

use super::model::{OperationSpec, Template};

/// Validates a single operation's fields.
fn validate_operation(operation: &OperationSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if operation.id.trim().is_empty() {
        errors.push(ValidationError::EmptyOperationId);
        return errors; // Can't validate further without ID
    }

    if operation.handler.trim().is_empty() {
        errors.push(ValidationError::EmptyHandler(operation.id.clone()));
    }

    if operation.depends_on.iter().any(|dep| *dep == operation.id) {
        errors.push(ValidationError::SelfDependency(operation.id.clone()));
    }

    if operation.depends_on.is_empty() {
        debug!("Operation '{}' is a root operation", operation.id);
    }

    errors
}

/// Validates the structure of a template.
///
/// Performs the following checks:
/// 1. Template has an id
/// 2. No duplicate operation ids
/// 3. All operations have valid fields
/// 4. All dependencies point to existing operations
/// 5. No cyclic dependencies
///
/// An empty operation list is accepted: such a template loads, but its
/// processes can never start.
pub fn validate_template(template: &Template) -> Result<(), ConfigurationError> {
    info!(
        "Validating template '{}' with {} operations",
        template.id,
        template.operations.len()
    );

    let mut problems = Vec::new();

    if template.id.trim().is_empty() {
        problems.push(ValidationError::EmptyTemplateId);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for operation in &template.operations {
        if !operation.id.trim().is_empty() && !seen_ids.insert(operation.id.as_str()) {
            problems.push(ValidationError::DuplicateOperation(operation.id.clone()));
        }
    }

    for operation in &template.operations {
        problems.extend(validate_operation(operation));

        for dep in &operation.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                problems.push(ValidationError::DanglingDependency {
                    operation: operation.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Cycle detection only makes sense on a well-formed graph
    if problems.is_empty() {
        if let Err(cycle) = topological_order(template) {
            problems.push(ValidationError::CyclicDependency(cycle));
        }
    }

    if !problems.is_empty() {
        return Err(ConfigurationError::Invalid {
            template: template.id.clone(),
            problems,
        });
    }

    info!("Template '{}' validated", template.id);
    Ok(())
}

/// Checks that every handler and the manager a template names are known.
///
/// Run by the engine builder against its registries, so unknown names fail
/// at load time rather than in the middle of a tick.
pub fn validate_bindings<H, M>(
    template: &Template,
    has_handler: H,
    has_manager: M,
) -> Result<(), ConfigurationError>
where
    H: Fn(&str) -> bool,
    M: Fn(&str) -> bool,
{
    let mut problems = Vec::new();

    for operation in &template.operations {
        let handlers = std::iter::once(operation.handler.as_str())
            .chain(operation.compensate.as_deref());
        for handler in handlers {
            if !has_handler(handler) {
                problems.push(ValidationError::UnknownHandler {
                    operation: operation.id.clone(),
                    handler: handler.to_string(),
                });
            }
        }
    }

    if !has_manager(template.manager_name()) {
        problems.push(ValidationError::UnknownManager(
            template.manager_name().to_string(),
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::Invalid {
            template: template.id.clone(),
            problems,
        })
    }
}

/// Orders operation ids so that dependencies come before dependents
/// (Kahn's algorithm).
///
/// On a cycle, returns one offending cycle as `[a, b, ..., a]`. Dangling
/// dependencies are ignored here; [`validate_template`] reports them.
pub fn topological_order(template: &Template) -> Result<Vec<String>, Vec<String>> {
    let known: HashSet<&str> = template.operations.iter().map(|op| op.id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for op in &template.operations {
        let deps: Vec<&str> = op
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| known.contains(dep))
            .collect();
        in_degree.insert(op.id.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(op.id.as_str());
        }
    }

    // Start with root operations, in declaration order
    let mut queue: VecDeque<&str> = template
        .operations
        .iter()
        .map(|op| op.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted_order: Vec<String> = Vec::with_capacity(template.operations.len());

    while let Some(current) = queue.pop_front() {
        sorted_order.push(current.to_string());

        for &successor in dependents.get(current).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }
    }

    if sorted_order.len() == in_degree.len() {
        debug!("Topological order: {:?}", sorted_order);
        return Ok(sorted_order);
    }

    Err(find_cycle(template, &in_degree))
}

/// Extracts one cycle from the operations Kahn's algorithm could not order.
///
/// Every leftover operation still has a leftover dependency, so walking
/// dependencies from any of them must revisit a node.
fn find_cycle(template: &Template, in_degree: &HashMap<&str, usize>) -> Vec<String> {
    let leftover: HashSet<&str> = in_degree
        .iter()
        .filter(|(_, &degree)| degree > 0)
        .map(|(&id, _)| id)
        .collect();

    let Some(start) = template
        .operations
        .iter()
        .map(|op| op.id.as_str())
        .find(|id| leftover.contains(id))
    else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&index) = position.get(current) {
            let mut cycle: Vec<String> = path[index..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        let next = template
            .operation(current)
            .and_then(|op| {
                op.depends_on
                    .iter()
                    .map(String::as_str)
                    .find(|dep| leftover.contains(dep))
            });

        match next {
            Some(dep) => current = dep,
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}
