//! Parameter Validation
//!
//! Validates collected inputs against a parameter schema:
//! - Visibility first: a parameter whose `show_when` is not met is skipped
//!   entirely (not validated, not reported missing)
//! - Required/default handling
//! - Per-type checks, including select membership and multiselect subsets
//! - Validation rules (length bounds, numeric bounds, anchored regex),
//!   applied in order with all failures collected
//!
//! Validation never fails hard on a malformed rule; rule configuration is
//! checked once via [`verify_schema`] when a workflow is created.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

use super::model::{InputParameter, ParameterType};

/// Per-field validation failures, ordered by field name for stable output.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Outcome of validating a set of inputs against a schema.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub errors_by_field: FieldErrors,
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors_by_field.is_empty()
    }

    /// Converts a failed outcome into the engine error form.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(EngineError::Validation {
                errors: self.errors_by_field,
            })
        }
    }
}

/// Validates inputs against a schema. `context` drives `show_when`
/// evaluation; pass the inputs themselves when no separate context exists.
pub fn validate(
    schema: &[InputParameter],
    inputs: &Map<String, Value>,
    context: Option<&Map<String, Value>>,
) -> ValidationOutcome {
    let context = context.unwrap_or(inputs);
    let mut outcome = ValidationOutcome::default();

    for parameter in schema {
        if !parameter.show_when.evaluate(context) {
            continue;
        }

        let value = inputs.get(&parameter.name);
        let mut errors = Vec::new();

        match value {
            None | Some(Value::Null) => {
                if parameter.required && parameter.default.is_none() {
                    errors.push("required parameter is missing".to_string());
                }
            }
            Some(value) => {
                check_type(parameter, value, &mut errors);
                check_rules(parameter, value, &mut errors);
            }
        }

        if !errors.is_empty() {
            outcome
                .errors_by_field
                .insert(parameter.name.clone(), errors);
        }
    }

    outcome
}

/// Returns the visible, required parameters that are absent from `inputs`
/// and have no default. Used for the waiting-for-input flow.
pub fn missing_required<'a>(
    schema: &'a [InputParameter],
    inputs: &Map<String, Value>,
) -> Vec<&'a InputParameter> {
    schema
        .iter()
        .filter(|p| p.required && p.default.is_none())
        .filter(|p| p.show_when.evaluate(inputs))
        .filter(|p| matches!(inputs.get(&p.name), None | Some(Value::Null)))
        .collect()
}

/// Applies defaults for visible parameters that are absent from `inputs`.
pub fn apply_defaults(schema: &[InputParameter], inputs: &mut Map<String, Value>) {
    let context = inputs.clone();
    for parameter in schema {
        if !parameter.show_when.evaluate(&context) {
            continue;
        }
        if let Some(default) = &parameter.default {
            if matches!(inputs.get(&parameter.name), None | Some(Value::Null)) {
                inputs.insert(parameter.name.clone(), default.clone());
            }
        }
    }
}

/// Checks rule configuration for a whole schema. Called at workflow-creation
/// time so a bad pattern never surfaces mid-validation.
pub fn verify_schema(schema: &[InputParameter]) -> Result<()> {
    for parameter in schema {
        if let Some(pattern) = &parameter.validation_rules.pattern {
            if let Err(e) = Regex::new(&anchored(pattern)) {
                return Err(EngineError::InvalidRule {
                    parameter: parameter.name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let needs_options = matches!(
            parameter.parameter_type,
            ParameterType::Select | ParameterType::Multiselect
        );
        if needs_options && parameter.options.is_empty() {
            return Err(EngineError::InvalidRule {
                parameter: parameter.name.clone(),
                reason: "select parameter has no options".to_string(),
            });
        }
    }
    Ok(())
}

fn check_type(parameter: &InputParameter, value: &Value, errors: &mut Vec<String>) {
    match parameter.parameter_type {
        ParameterType::String => {
            if !value.is_string() {
                errors.push(type_error("string", value));
            }
        }
        ParameterType::Number => {
            if !value.is_number() {
                errors.push(type_error("number", value));
            }
        }
        ParameterType::Boolean => {
            if !value.is_boolean() {
                errors.push(type_error("boolean", value));
            }
        }
        ParameterType::Array => {
            if !value.is_array() {
                errors.push(type_error("array", value));
            }
        }
        ParameterType::Object => {
            if !value.is_object() {
                errors.push(type_error("object", value));
            }
        }
        ParameterType::File => match value.as_str() {
            Some(s) if !s.trim().is_empty() => {}
            _ => errors.push("expected a non-empty file reference".to_string()),
        },
        ParameterType::Select => {
            if !parameter.options.contains(value) {
                errors.push(format!(
                    "value is not one of the {} allowed options",
                    parameter.options.len()
                ));
            }
        }
        ParameterType::Multiselect => match value.as_array() {
            Some(items) => {
                for item in items {
                    if !parameter.options.contains(item) {
                        errors.push(format!("'{}' is not an allowed option", render(item)));
                    }
                }
            }
            None => errors.push(type_error("array", value)),
        },
    }
}

fn check_rules(parameter: &InputParameter, value: &Value, errors: &mut Vec<String>) {
    let rules = &parameter.validation_rules;

    let length = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    };

    if let (Some(min), Some(len)) = (rules.min_length, length) {
        if len < min {
            errors.push(format!("length {len} is below minimum {min}"));
        }
    }
    if let (Some(max), Some(len)) = (rules.max_length, length) {
        if len > max {
            errors.push(format!("length {len} exceeds maximum {max}"));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = rules.min_value {
            if number < min {
                errors.push(format!("value {number} is below minimum {min}"));
            }
        }
        if let Some(max) = rules.max_value {
            if number > max {
                errors.push(format!("value {number} exceeds maximum {max}"));
            }
        }
    }

    if let Some(pattern) = &rules.pattern {
        // Bad patterns are rejected by verify_schema at creation time; a
        // pattern that still fails to compile here is skipped, not fatal.
        if let Some(re) = compiled(pattern) {
            let text = render(value);
            if !re.is_match(&text) {
                errors.push(format!("value does not match pattern '{pattern}'"));
            }
        }
    }
}

/// Process-wide cache of compiled patterns. Validation runs per input set,
/// so each schema pattern would otherwise be recompiled on every call.
static PATTERN_CACHE: Lazy<Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn compiled(pattern: &str) -> Option<Regex> {
    let mut cache = PATTERN_CACHE.lock().ok()?;
    if let Some(re) = cache.get(pattern) {
        return Some(re.clone());
    }
    let re = Regex::new(&anchored(pattern)).ok()?;
    cache.insert(pattern.to_string(), re.clone());
    Some(re)
}

/// Anchors a pattern so the whole string form must match.
fn anchored(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

/// String form of a value for pattern matching and messages.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_error(expected: &str, value: &Value) -> String {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("expected {expected}, got {actual}")
}
