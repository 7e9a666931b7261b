//! procflow CLI Entry Point
//!
//! Loads templates, runs one process to the point where nothing more can
//! happen, and prints where it ended up.
//!
//! # Usage
//!
//! ```bash
//! # Run the template defined in a file
//! procflow onboarding.yaml
//!
//! # Load several templates and pick the one to run
//! procflow order.yaml billing.yaml --template order
//!
//! # Seed the context and keep state between runs
//! procflow order.yaml --set customer=42 --state-file state.json
//!
//! # Use a configuration file
//! procflow --config procflow.yaml --template order
//! ```

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::{Map, Value};

use procflow::{load_template, Engine, EngineConfig, ProcessId, Status, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    template_files: Vec<PathBuf>,
    template_id: Option<String>,
    state_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
    max_parallel: Option<usize>,
    data: Map<String, Value>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Process Orchestration Core");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: procflow [OPTIONS] <TEMPLATE_FILE>...");
    println!();
    println!("Arguments:");
    println!("  <TEMPLATE_FILE>...    Template YAML files to load");
    println!();
    println!("Options:");
    println!("  --template ID         Template to run (default: first template file)");
    println!("  --state-file PATH     Persist processes to a JSON snapshot");
    println!("  --config PATH         Engine configuration YAML");
    println!("  --parallel N          Maximum parallel handlers (default: CPU count)");
    println!("  --set KEY=VALUE       Initial context entry (VALUE parsed as JSON if possible)");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  procflow onboarding.yaml");
    println!("  procflow order.yaml billing.yaml --template order --set customer=42");
    println!("  procflow --config procflow.yaml --template order --state-file state.json");
}

/// Parses a `KEY=VALUE` context entry.
fn parse_entry(entry: &str) -> Result<(String, Value), String> {
    let (key, raw) = entry
        .split_once('=')
        .ok_or_else(|| format!("--set expects KEY=VALUE, got '{}'", entry))?;
    if key.trim().is_empty() {
        return Err(format!("--set has an empty key: '{}'", entry));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Drops template files already in `seen`. Paths are compared in canonical
/// form when they resolve, so `a.yaml` and `./a.yaml` are one file.
fn without_repeats(paths: Vec<PathBuf>, seen: &mut HashSet<PathBuf>) -> Vec<PathBuf> {
    let canonical = |path: &Path| path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    paths
        .into_iter()
        .filter(|path| seen.insert(canonical(path)))
        .collect()
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value_of = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--template" => {
                config.template_id = Some(value_of(&mut i, arg)?);
            }
            "--state-file" => {
                config.state_file = Some(PathBuf::from(value_of(&mut i, arg)?));
            }
            "--config" => {
                config.config_file = Some(PathBuf::from(value_of(&mut i, arg)?));
            }
            "--parallel" => {
                let value = value_of(&mut i, arg)?;
                let parallel: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if parallel == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.max_parallel = Some(parallel);
            }
            "--set" => {
                let (key, value) = parse_entry(&value_of(&mut i, arg)?)?;
                config.data.insert(key, value);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => config.template_files.push(PathBuf::from(arg)),
        }
        i += 1;
    }

    if config.template_files.is_empty() && config.config_file.is_none() {
        return Err("No template file given".to_string());
    }

    Ok(config)
}

fn colored_status(status: Status) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        Status::Done => text.green().bold(),
        Status::Skipped | Status::Canceled => text.dimmed(),
        Status::Error | Status::Rollback => text.red().bold(),
        Status::InProgress | Status::NotStarted => text.yellow(),
    }
}

/// Prints the final state of a process.
fn print_summary(engine: &Engine, id: ProcessId) -> Result<(), Box<dyn std::error::Error>> {
    let process = engine.process(id)?;
    let (completed, total) = process.progress();

    println!();
    println!("Process {}: {}", id, colored_status(process.status));
    println!("Operations completed: {}/{}", completed, total);
    for op in process.incompleted_operations() {
        println!("  {:<20} {}", op.id, colored_status(op.status));
    }

    let context = process.context;
    let errors = process.errors;

    if !context.is_empty() {
        println!();
        println!("{}", "Context:".bold());
        println!("{}", serde_json::to_string_pretty(&context)?);
    }

    if !errors.is_empty() {
        println!();
        println!("{}", "Errors:".bold());
        for record in &errors {
            println!("  {} {}: {}", "✗".red(), record.subject, record.message);
        }
    }

    println!();
    println!("{}", "Processes by status:".bold());
    for (status, count) in engine.count_by_status()? {
        if count > 0 {
            println!("  {:<12} {}", colored_status(status), count);
        }
    }

    Ok(())
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let mut engine_config = match &config.config_file {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(parallel) = config.max_parallel {
        engine_config.max_parallel = parallel;
    }
    if let Some(path) = config.state_file {
        info!("State file: {}", path.display());
        engine_config.state_file = Some(path);
    }

    // Load templates; a file named both here and in the config file loads once
    let mut seen = HashSet::new();
    let template_files = without_repeats(config.template_files, &mut seen);
    engine_config.templates = without_repeats(engine_config.templates, &mut seen);

    let mut builder = Engine::builder().with_config(&engine_config);
    let mut first_template = None;
    for path in &template_files {
        let template = load_template(path).map_err(|e| {
            error!("Failed to load template: {}", e);
            format!("Could not load template from '{}': {}", path.display(), e)
        })?;
        first_template.get_or_insert_with(|| template.id.clone());
        builder = builder.template(template);
    }

    let engine = builder.build()?;
    info!("{} templates loaded", engine.catalog().len());

    let template_id = config
        .template_id
        .or(first_template)
        .or_else(|| {
            let mut ids = engine.catalog().iter().map(|t| t.id.clone());
            match (ids.next(), ids.next()) {
                (Some(only), None) => Some(only),
                _ => None,
            }
        })
        .ok_or("Several templates loaded; choose one with --template")?;

    // Run the process
    let id = engine.instantiate(&template_id, config.data)?;
    engine.start(id)?;
    let status = engine.drive(id)?;

    if engine.is_incomplete(id)? {
        warn!("Process {} is stuck: no runnable work left", id);
    }

    print_summary(&engine, id)?;
    Ok(status == Status::Done)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("procflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&[
            "a.yaml",
            "b.yaml",
            "--template",
            "order",
            "--parallel",
            "3",
            "--set",
            "customer=42",
            "--set",
            "name=ada",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.template_files.len(), 2);
        assert_eq!(config.template_id.as_deref(), Some("order"));
        assert_eq!(config.max_parallel, Some(3));
        assert_eq!(config.data.get("customer"), Some(&json!(42)));
        assert_eq!(config.data.get("name"), Some(&json!("ada")));
        assert!(config.verbose);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--parallel"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--parallel", "0"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--set", "novalue"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--bogus"])).is_err());
        assert!(parse_arguments(&args(&["--config", "procflow.yaml"])).is_ok());
    }

    #[test]
    fn test_without_repeats() {
        let dir = tempdir().unwrap();
        for name in ["a.yaml", "b.yaml"] {
            fs::write(dir.path().join(name), "id: t").unwrap();
        }
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.yaml");

        let mut seen = HashSet::new();
        let named = without_repeats(vec![a.clone(), dir.path().join(".").join("a.yaml")], &mut seen);
        assert_eq!(named, vec![a.clone()]);

        let configured = without_repeats(vec![a, b.clone(), dir.path().join("missing.yaml")], &mut seen);
        assert_eq!(configured, vec![b, dir.path().join("missing.yaml")]);
    }

    #[test]
    fn test_parse_entry() {
        assert_eq!(parse_entry("flag=true").unwrap(), ("flag".to_string(), json!(true)));
        assert_eq!(parse_entry("list=[1,2]").unwrap().1, json!([1, 2]));
        assert_eq!(parse_entry("url=http://x=y").unwrap().1, json!("http://x=y"));
        assert!(parse_entry("=1").is_err());
    }
}
