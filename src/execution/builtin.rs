//! Built-in Handlers
//!
//! Handlers every engine knows without registration:
//!
//! - `noop`: completes immediately
//! - `set`: merges `params.values` into the context
//! - `fail`: always fails with `params.message`
//! - `shell`: runs `params.command` through bash
//! - `subprocess`: spawns `params.template` as a child process

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use log::{debug, error, warn};
use serde_json::{json, Map, Value};

use crate::error::HandlerError;
use crate::process::Context;

use super::handler::{HandlerInput, HandlerRegistry, Outcome};

/// Adds every built-in handler to a registry.
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register("noop", noop);
    registry.register("set", set_values);
    registry.register("fail", fail);
    registry.register("shell", shell);
    registry.register("subprocess", subprocess);
}

fn noop(_input: &HandlerInput) -> Result<Outcome, HandlerError> {
    Ok(Outcome::done())
}

fn set_values(input: &HandlerInput) -> Result<Outcome, HandlerError> {
    match input.param("values") {
        Some(Value::Object(values)) => Ok(Outcome::with_result(Value::Object(values.clone()))),
        Some(_) => Err(HandlerError::failed("'values' must be a mapping")),
        None => Ok(Outcome::done()),
    }
}

fn fail(input: &HandlerInput) -> Result<Outcome, HandlerError> {
    let message = input.param_str("message").unwrap_or("operation failed");
    Err(HandlerError::failed(message))
}

/// Spawns a child process from `params.template`.
///
/// The child starts with the parent's context overlaid with `params.data`.
fn subprocess(input: &HandlerInput) -> Result<Outcome, HandlerError> {
    let template = input
        .param_str("template")
        .ok_or_else(|| HandlerError::failed("'template' parameter is required"))?;

    let mut data = input.context.data().clone();
    match input.param("data") {
        Some(Value::Object(extra)) => data.extend(extra.clone()),
        Some(_) => return Err(HandlerError::failed("'data' must be a mapping")),
        None => {}
    }

    Ok(Outcome::Spawn {
        template: template.to_string(),
        data,
    })
}

/// Runs `params.command` as a bash script.
///
/// `{key}` placeholders are replaced with context values. Standard output
/// is stored under `<operation>_stdout`. An optional `params.working_dir`
/// sets the directory the script runs in.
fn shell(input: &HandlerInput) -> Result<Outcome, HandlerError> {
    let command = input
        .param_str("command")
        .ok_or_else(|| HandlerError::failed("'command' parameter is required"))?;

    if input.cancel.is_cancelled() {
        return Err(HandlerError::Canceled);
    }

    let command_text = substitute_placeholders(command, &input.context);
    let script_name = format!("op_{}_{}.sh", input.process_id, input.operation_id);
    let script_path = create_script(&script_name, &command_text)
        .map_err(|e| HandlerError::failed(format!("failed to write script: {e}")))?;

    let working_dir = input.param_str("working_dir").map(PathBuf::from);
    let output = execute_with_bash(&script_path, working_dir.as_deref());

    if let Err(e) = fs::remove_file(&script_path) {
        warn!("Failed to clean up script {}: {}", script_path.display(), e);
    }

    let output = output.map_err(|e| HandlerError::failed(format!("failed to run bash: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    if output.status.success() {
        debug!("Operation '{}' command succeeded", input.operation_id);
        let mut result = Map::new();
        result.insert(
            format!("{}_stdout", input.operation_id),
            json!(stdout.trim_end()),
        );
        Ok(Outcome::Done(Some(Value::Object(result))))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Operation '{}' command failed with exit code: {:?}",
            input.operation_id,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }

        Err(HandlerError::failed(match output.status.code() {
            Some(code) => format!("command exited with code {code}: {}", stderr.trim()),
            None => "command terminated by signal".to_string(),
        }))
    }
}

/// Replaces `{key}` with the context value stored under `key`.
///
/// Strings are inserted verbatim, other values as JSON.
fn substitute_placeholders(command: &str, context: &Context) -> String {
    context
        .data()
        .iter()
        .fold(command.to_string(), |text, (key, value)| {
            let placeholder = format!("{{{key}}}");
            if !text.contains(&placeholder) {
                return text;
            }
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.replace(&placeholder, &replacement)
        })
}

fn create_script(name: &str, command_text: &str) -> std::io::Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("procflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(name);
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn execute_with_bash(script_path: &Path, working_dir: Option<&Path>) -> std::io::Result<Output> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    cmd.output()
}
