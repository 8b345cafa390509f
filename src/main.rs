//! flowrunner CLI Entry Point
//!
//! Command-line interface for validating, planning and running workflow
//! definition files.
//!
//! # Usage
//!
//! ```bash
//! # Validate a definition (structure, rules, cycles)
//! flowrunner validate workflow.yaml
//!
//! # Show the execution plan
//! flowrunner plan workflow.yaml
//!
//! # Run a workflow with inputs
//! flowrunner run workflow.yaml --input project_name=atlas --input replicas=3
//!
//! # Keep checkpoints in a custom directory
//! flowrunner run workflow.yaml --state-dir /var/lib/flowrunner
//! ```

use std::collections::HashSet;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use serde_json::{Map, Value};

use flowrunner::execution::{
    ExecutionEngine, HandlerRegistry, JsonFileStore, PassthroughHandler, StateManager,
    WorkflowState,
};
use flowrunner::workflow::parser::{check_definition, load_definition};
use flowrunner::workflow::planner::plan;
use flowrunner::{APP_NAME, VERSION};

/// Default directory for persisted execution state.
const DEFAULT_STATE_DIR: &str = ".flowrunner/state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Validate,
    Plan,
    Run,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    workflow_path: String,
    inputs: Map<String, Value>,
    state_dir: String,
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

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner <COMMAND> <WORKFLOW_FILE> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  validate            Check structure, parameter rules and cycles");
    println!("  plan                Print the batched execution plan");
    println!("  run                 Execute the workflow to completion");
    println!();
    println!("Options:");
    println!("  --input KEY=VALUE   Provide an input (repeatable; VALUE parsed as JSON");
    println!("                      when possible, otherwise taken as a string)");
    println!("  --state-dir PATH    Checkpoint directory (default: {})", DEFAULT_STATE_DIR);
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner validate pipeline.yaml");
    println!("  flowrunner run pipeline.yaml --input project_name=atlas");
}

/// Parses a `KEY=VALUE` input argument. The value is tried as JSON first so
/// numbers, booleans, arrays and objects come through typed.
fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid input '{}': expected KEY=VALUE", raw))?;
    if key.trim().is_empty() {
        return Err(format!("Invalid input '{}': empty key", raw));
    }

    let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), parsed))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut command = None;
    let mut workflow_path = None;
    let mut inputs = Map::new();
    let mut state_dir = DEFAULT_STATE_DIR.to_string();
    let mut verbose = false;
    let mut i = 1; // Skip program name

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
                verbose = true;
            }
            "--input" => {
                i += 1;
                if i >= args.len() {
                    return Err("--input requires a KEY=VALUE argument".to_string());
                }
                let (key, value) = parse_input(&args[i])?;
                inputs.insert(key, value);
            }
            "--state-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--state-dir requires a path argument".to_string());
                }
                state_dir = args[i].clone();
            }
            "validate" if command.is_none() => command = Some(Command::Validate),
            "plan" if command.is_none() => command = Some(Command::Plan),
            "run" if command.is_none() => command = Some(Command::Run),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(Config {
        command: command.ok_or("Missing command (validate, plan or run)")?,
        workflow_path: workflow_path.ok_or("Missing workflow file argument")?,
        inputs,
        state_dir,
        verbose,
    })
}

/// Builds an engine whose registry covers every step type in the definition
/// with the passthrough handler. Embedding applications register real
/// handlers; the CLI exists to exercise definitions end to end.
fn build_engine(
    definition: &flowrunner::WorkflowDefinition,
    state_dir: &str,
) -> Result<Arc<ExecutionEngine>, Box<dyn std::error::Error>> {
    let store = Arc::new(JsonFileStore::new(state_dir)?);
    let mut registry = HandlerRegistry::new();

    let step_types: HashSet<&str> = definition.steps.iter().map(|s| s.step_type.as_str()).collect();
    for step_type in step_types {
        registry.register(step_type, Arc::new(PassthroughHandler))?;
    }

    Ok(Arc::new(ExecutionEngine::new(
        Arc::new(StateManager::new(store)),
        Arc::new(registry),
    )))
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    info!("Loading workflow: {}", config.workflow_path);
    let definition = load_definition(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;

    match config.command {
        Command::Validate => {
            check_definition(&definition)?;
            println!(
                "Workflow '{}' is valid: {} steps, {} input parameters",
                definition.workflow_id,
                definition.steps.len(),
                definition.input_schema.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan => {
            check_definition(&definition)?;
            let plan = plan(&definition, &HashSet::new())?;
            println!("Execution plan for '{}':", definition.workflow_id);
            for (index, batch) in plan.batches.iter().enumerate() {
                println!("  batch {}: {}", index + 1, batch.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => {
            let engine = build_engine(&definition, &config.state_dir)?;
            let workflow_id = definition.workflow_id.clone();

            engine.create(definition)?;
            let outcome = engine.start(&workflow_id, config.inputs)?;
            if outcome.status == WorkflowState::WaitingForInput {
                eprintln!("Missing required inputs: {}", outcome.missing.join(", "));
                eprintln!("Provide them with --input KEY=VALUE");
                return Ok(ExitCode::FAILURE);
            }

            engine.wait(&workflow_id).await;

            let status = engine.status(&workflow_id)?;
            match status.state {
                WorkflowState::Completed => {
                    println!("Workflow '{}' completed", workflow_id);
                    Ok(ExitCode::SUCCESS)
                }
                other => {
                    if let Some(details) = status.error_details {
                        error!("{}", details);
                    }
                    println!("Workflow '{}' ended in state {}", workflow_id, other);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
