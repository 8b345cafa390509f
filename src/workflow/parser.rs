//! Definition Parser
//!
//! Loads workflow definitions from YAML or JSON files and provides the
//! export/import surface. Every load path runs the full creation-time
//! checks: structural validation, schema rule verification, and cycle
//! detection. Nothing is accepted half-validated.

use std::fs;
use std::path::Path;

use log::info;
use serde_json::Value;

use crate::error::{EngineError, Result};

use super::model::WorkflowDefinition;
use super::planner::detect_cycles;
use super::validator::verify_schema;

/// Loads a workflow definition from a file.
///
/// The format is chosen by extension: `.yaml`/`.yml` or `.json`.
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow definition from {}", path.display());

    let content = fs::read_to_string(path)?;

    let definition: WorkflowDefinition = match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
    {
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| EngineError::InvalidStructure(format!("yaml parse error: {e}")))?,
        "json" => serde_json::from_str(&content)
            .map_err(|e| EngineError::InvalidStructure(format!("json parse error: {e}")))?,
        other => {
            return Err(EngineError::InvalidStructure(format!(
                "unsupported definition format '{other}'"
            )))
        }
    };

    check_definition(&definition)?;

    info!(
        "Loaded workflow '{}' ({} steps)",
        definition.workflow_id,
        definition.steps.len()
    );
    Ok(definition)
}

/// Exports a definition as a plain JSON value.
///
/// Definitions carry no runtime fields (state, step results, current step
/// live on `ExecutionState`), so the export is the definition itself.
pub fn export_definition(definition: &WorkflowDefinition) -> Result<Value> {
    Ok(serde_json::to_value(definition)?)
}

/// Imports a definition from a JSON value, running all creation-time checks.
pub fn import_definition(value: Value) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidStructure(format!("json parse error: {e}")))?;
    check_definition(&definition)?;
    Ok(definition)
}

/// Full creation-time check set: structure, schema rules, acyclicity.
pub fn check_definition(definition: &WorkflowDefinition) -> Result<()> {
    definition.validate_structure()?;
    verify_schema(&definition.input_schema)?;
    for step in &definition.steps {
        verify_schema(&step.input_parameters)?;
    }
    detect_cycles(definition)?;
    Ok(())
}
