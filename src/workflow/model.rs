//! Workflow Data Model
//!
//! Core data structures for workflow definitions: typed input parameters,
//! steps with explicit dependencies, and the immutable definition that ties
//! them together.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow_id: onboard-customer
//! name: Customer onboarding
//! version: 1
//! category: crm
//! input_schema:
//!   - name: project_name
//!     type: string
//!     required: true
//!   - name: admin_key
//!     type: string
//!     required: true
//!     show_when:
//!       user_type: admin
//! steps:
//!   - step_id: create_account
//!     name: Create account
//!     step_type: crm.create
//!   - step_id: send_welcome
//!     name: Send welcome mail
//!     step_type: mail.send
//!     depends_on:
//!       - create_account
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{EngineError, Result};

use super::condition::ShowWhen;

/// Value type of an input parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// Opaque file reference; validated as a non-empty string.
    File,
    /// Single choice from `options`.
    Select,
    /// Any subset of `options`.
    Multiselect,
}

/// Optional constraints applied after the type check.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Anchored regex the value's string form must match in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self.min_length.is_none()
            && self.max_length.is_none()
            && self.min_value.is_none()
            && self.max_value.is_none()
            && self.pattern.is_none()
    }
}

/// A typed input parameter with conditional visibility.
///
/// Parameters are immutable once the owning workflow is created.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InputParameter {
    /// Unique name within its schema.
    pub name: String,

    #[serde(rename = "type")]
    pub parameter_type: ParameterType,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub required: bool,

    /// Fallback value used when the parameter is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Allowed values for select/multiselect types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,

    #[serde(default, skip_serializing_if = "ValidationRules::is_empty")]
    pub validation_rules: ValidationRules,

    /// Visibility predicate over already-collected inputs. Hidden parameters
    /// are neither validated nor counted as missing.
    #[serde(default, skip_serializing_if = "ShowWhen::is_empty")]
    pub show_when: ShowWhen,
}

impl InputParameter {
    /// Creates a parameter with the given name and type.
    pub fn new(name: impl Into<String>, parameter_type: ParameterType) -> Self {
        Self {
            name: name.into().trim().to_string(),
            parameter_type,
            label: String::new(),
            description: String::new(),
            required: false,
            default: None,
            options: Vec::new(),
            validation_rules: ValidationRules::default(),
            show_when: ShowWhen::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_options(mut self, options: Vec<Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = rules;
        self
    }

    pub fn show_when(mut self, predicate: ShowWhen) -> Self {
        self.show_when = predicate;
        self
    }
}

/// Bounded retry policy for a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,

    /// Delay before the first retry, in seconds.
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,

    /// Multiplier applied to the delay after each retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_seconds() -> u64 {
    1
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_seconds: default_backoff_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Upper bound on a single retry delay, whatever the multiplier produces.
const MAX_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(3600);

impl RetryConfig {
    /// Delay before the given retry attempt (1-based), capped at
    /// [`MAX_RETRY_DELAY`]. Non-finite products (a runaway multiplier
    /// overflows to infinity after a few attempts) hit the cap too.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let seconds = self.backoff_seconds as f64 * factor;
        if !(seconds >= 0.0) {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::try_from_secs_f64(seconds)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

/// Default per-step timeout when a step does not specify one.
pub const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 300;

fn default_timeout_seconds() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECONDS
}

/// A single step in a workflow.
///
/// The `step_type` tag is opaque to the engine; it selects a handler from
/// the registry at execution time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowStep {
    /// Unique identifier within the workflow.
    pub step_id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Handler dispatch tag (e.g. "http.request", "crm.create").
    pub step_type: String,

    /// Step-scoped input schema, merged with the workflow-level schema when
    /// the step is about to run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_parameters: Vec<InputParameter>,

    /// Ids of steps that must finish before this step may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,

    /// Whether execution may pause at this step.
    #[serde(default)]
    pub can_pause: bool,

    /// Hint that this step tolerates running alongside its batch siblings.
    #[serde(default)]
    pub is_parallel: bool,
}

impl WorkflowStep {
    /// Creates a new step with the given id and type.
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let step_id = step_id.into().trim().to_string();
        Self {
            name: step_id.clone(),
            step_id,
            step_type: step_type.into().trim().to_string(),
            input_parameters: Vec::new(),
            depends_on: Vec::new(),
            timeout_seconds: default_timeout_seconds(),
            retry_config: None,
            can_pause: false,
            is_parallel: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_parameter(mut self, parameter: InputParameter) -> Self {
        self.input_parameters.push(parameter);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_config = Some(retry);
        self
    }

    /// Effective retry policy, defaulting to no retries.
    pub fn retry(&self) -> RetryConfig {
        self.retry_config.clone().unwrap_or_default()
    }
}

/// An immutable workflow definition.
///
/// Definitions are validated once at construction; new versions get new ids.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowDefinition {
    pub workflow_id: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub category: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Workflow-level input schema, required before execution starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_schema: Vec<InputParameter>,

    pub steps: Vec<WorkflowStep>,

    /// Opaque output mapping consumed by the embedding application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_config: Option<Value>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Creates a validated definition. Performs structural checks only;
    /// cycle detection is the planner's job and runs separately at
    /// creation time.
    pub fn new(
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Self> {
        let definition = Self {
            workflow_id: workflow_id.into().trim().to_string(),
            name: name.into().trim().to_string(),
            version: 1,
            category: String::new(),
            tags: Vec::new(),
            input_schema: Vec::new(),
            steps,
            output_config: None,
        };
        definition.validate_structure()?;
        Ok(definition)
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_input_schema(mut self, schema: Vec<InputParameter>) -> Result<Self> {
        self.input_schema = schema;
        self.validate_structure()?;
        Ok(self)
    }

    /// Gets a step by id.
    pub fn get_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Checks structural invariants:
    ///
    /// 1. At least one step
    /// 2. Non-empty, unique step ids
    /// 3. Every `depends_on` resolves to an existing step, never itself
    /// 4. Parameter names unique per schema (workflow-level and per-step)
    pub fn validate_structure(&self) -> Result<()> {
        if self.workflow_id.is_empty() {
            return Err(EngineError::InvalidStructure(
                "workflow id is empty".to_string(),
            ));
        }

        if self.steps.is_empty() {
            return Err(EngineError::InvalidStructure(
                "workflow has no steps".to_string(),
            ));
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(EngineError::InvalidStructure(
                    "a step has an empty id".to_string(),
                ));
            }
            if step.step_type.trim().is_empty() {
                return Err(EngineError::InvalidStructure(format!(
                    "step '{}' has no step type",
                    step.step_id
                )));
            }
            if !seen_ids.insert(step.step_id.as_str()) {
                return Err(EngineError::InvalidStructure(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.step_id {
                    return Err(EngineError::InvalidStructure(format!(
                        "step '{}' depends on itself",
                        step.step_id
                    )));
                }
                if !seen_ids.contains(dep.as_str()) {
                    return Err(EngineError::InvalidStructure(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    )));
                }
            }
        }

        check_unique_parameters("workflow input schema", &self.input_schema)?;
        for step in &self.steps {
            check_unique_parameters(
                &format!("step '{}' parameters", step.step_id),
                &step.input_parameters,
            )?;
        }

        Ok(())
    }
}

fn check_unique_parameters(scope: &str, schema: &[InputParameter]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for parameter in schema {
        if parameter.name.trim().is_empty() {
            return Err(EngineError::InvalidStructure(format!(
                "{scope}: parameter with empty name"
            )));
        }
        if !seen.insert(parameter.name.as_str()) {
            return Err(EngineError::InvalidStructure(format!(
                "{scope}: duplicate parameter '{}'",
                parameter.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_creation() {
        let definition = WorkflowDefinition::new(
            "wf-1",
            "Test workflow",
            vec![
                WorkflowStep::new("fetch", "http.request"),
                WorkflowStep::new("store", "db.write").depends_on("fetch"),
            ],
        )
        .unwrap();

        assert_eq!(definition.workflow_id, "wf-1");
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.root_steps().len(), 1);
        assert_eq!(definition.root_steps()[0].step_id, "fetch");
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let result = WorkflowDefinition::new(
            "wf-1",
            "Broken",
            vec![
                WorkflowStep::new("same", "a"),
                WorkflowStep::new("same", "b"),
            ],
        );

        match result {
            Err(EngineError::InvalidStructure(msg)) => assert!(msg.contains("same")),
            other => panic!("expected InvalidStructure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let result = WorkflowDefinition::new(
            "wf-1",
            "Broken",
            vec![WorkflowStep::new("only", "a").depends_on("ghost")],
        );

        assert!(matches!(result, Err(EngineError::InvalidStructure(_))));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = WorkflowDefinition::new(
            "wf-1",
            "Broken",
            vec![WorkflowStep::new("loop", "a").depends_on("loop")],
        );

        match result {
            Err(EngineError::InvalidStructure(msg)) => assert!(msg.contains("itself")),
            other => panic!("expected InvalidStructure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let result = WorkflowDefinition::new("wf-1", "Empty", vec![]);
        assert!(matches!(result, Err(EngineError::InvalidStructure(_))));
    }

    #[test]
    fn test_duplicate_parameter_names_rejected() {
        let result = WorkflowDefinition::new(
            "wf-1",
            "Broken",
            vec![WorkflowStep::new("s1", "a")],
        )
        .unwrap()
        .with_input_schema(vec![
            InputParameter::new("email", ParameterType::String),
            InputParameter::new("email", ParameterType::String),
        ]);

        assert!(matches!(result, Err(EngineError::InvalidStructure(_))));
    }

    #[test]
    fn test_step_builder() {
        let step = WorkflowStep::new("notify", "mail.send")
            .with_name("Send notification")
            .depends_on("fetch")
            .with_timeout(30)
            .with_retry(RetryConfig {
                max_retries: 2,
                backoff_seconds: 1,
                backoff_multiplier: 2.0,
            });

        assert_eq!(step.name, "Send notification");
        assert_eq!(step.depends_on, vec!["fetch"]);
        assert_eq!(step.timeout_seconds, 30);
        assert_eq!(step.retry().max_retries, 2);
    }

    #[test]
    fn test_retry_backoff_grows() {
        let retry = RetryConfig {
            max_retries: 3,
            backoff_seconds: 2,
            backoff_multiplier: 2.0,
        };

        assert_eq!(retry.delay_for_attempt(1).as_secs(), 2);
        assert_eq!(retry.delay_for_attempt(2).as_secs(), 4);
        assert_eq!(retry.delay_for_attempt(3).as_secs(), 8);
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetryConfig {
            max_retries: 20,
            backoff_seconds: u64::MAX,
            backoff_multiplier: 1e308,
        };

        // Overflowing and non-finite products clamp instead of panicking.
        assert_eq!(retry.delay_for_attempt(1).as_secs(), 3600);
        assert_eq!(retry.delay_for_attempt(20).as_secs(), 3600);

        let negative = RetryConfig {
            max_retries: 2,
            backoff_seconds: 1,
            backoff_multiplier: -2.0,
        };
        assert_eq!(negative.delay_for_attempt(2), std::time::Duration::ZERO);
    }

    #[test]
    fn test_default_retry_is_no_retries() {
        let step = WorkflowStep::new("s1", "a");
        assert_eq!(step.retry().max_retries, 0);
    }

    #[test]
    fn test_parameter_builder() {
        let parameter = InputParameter::new("plan", ParameterType::Select)
            .required()
            .with_label("Plan")
            .with_options(vec![json!("free"), json!("pro")])
            .with_default(json!("free"));

        assert!(parameter.required);
        assert_eq!(parameter.options.len(), 2);
        assert_eq!(parameter.default, Some(json!("free")));
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
workflow_id: wf-yaml
name: From yaml
steps:
  - step_id: a
    step_type: noop
  - step_id: b
    step_type: noop
    depends_on: [a]
    timeout_seconds: 10
input_schema:
  - name: project_name
    type: string
    required: true
  - name: admin_key
    type: string
    required: true
    show_when:
      user_type: admin
"#;
        let definition: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(definition.validate_structure().is_ok());
        assert_eq!(definition.version, 1);
        assert_eq!(definition.steps[1].depends_on, vec!["a"]);
        assert_eq!(definition.steps[1].timeout_seconds, 10);
        assert!(!definition.input_schema[1].show_when.is_empty());
    }

    #[test]
    fn test_json_roundtrip_keeps_structure() {
        let definition = WorkflowDefinition::new(
            "wf-rt",
            "Roundtrip",
            vec![
                WorkflowStep::new("a", "noop"),
                WorkflowStep::new("b", "noop").depends_on("a"),
            ],
        )
        .unwrap();

        let json = serde_json::to_string(&definition).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert!(back.validate_structure().is_ok());
        assert_eq!(back.workflow_id, "wf-rt");
    }

    #[test]
    fn test_get_step() {
        let definition = WorkflowDefinition::new(
            "wf-1",
            "Lookup",
            vec![WorkflowStep::new("a", "noop")],
        )
        .unwrap();

        assert!(definition.get_step("a").is_some());
        assert!(definition.get_step("missing").is_none());
    }
}
