//! Step Handlers
//!
//! The engine never knows what a step *does*; it dispatches on the step's
//! `step_type` through a registry of [`StepHandler`] implementations owned
//! by the embedding application. Handlers receive the step, the merged
//! inputs, and a cancellation token they are expected to observe for
//! long-running work.
//!
//! Unknown step types are a configuration error caught when a definition is
//! registered, not a runtime dispatch failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::workflow::{WorkflowDefinition, WorkflowStep};

/// Error type returned by handlers. Kept open so applications can surface
/// their own error chains.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Capability interface for step business logic.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs the step. Implementations should return promptly once `cancel`
    /// fires; the engine additionally bounds every call with the step's
    /// timeout.
    async fn execute(
        &self,
        step: &WorkflowStep,
        inputs: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> HandlerResult;
}

/// Registry of handlers keyed by step type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a step type. Registering the same type twice
    /// is a configuration error.
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        let step_type = step_type.into();
        if self.handlers.contains_key(&step_type) {
            return Err(EngineError::InvalidStructure(format!(
                "handler for step type '{step_type}' already registered"
            )));
        }
        self.handlers.insert(step_type, handler);
        Ok(())
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Resolves the handler for a step type.
    pub fn get(&self, step_type: &str) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStepType(step_type.to_string()))
    }

    /// Checks that every step type in a definition has a handler.
    pub fn verify(&self, definition: &WorkflowDefinition) -> Result<()> {
        for step in &definition.steps {
            if !self.contains(&step.step_type) {
                return Err(EngineError::UnknownStepType(step.step_type.clone()));
            }
        }
        Ok(())
    }
}

/// Handler that logs the invocation and echoes the merged inputs back as
/// the step result. Used by the CLI for plan walkthroughs and handy as a
/// stand-in while wiring up real handlers.
pub struct PassthroughHandler;

#[async_trait]
impl StepHandler for PassthroughHandler {
    async fn execute(
        &self,
        step: &WorkflowStep,
        inputs: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> HandlerResult {
        info!(
            "Step '{}' ({}) invoked with {} input(s)",
            step.step_id,
            step.step_type,
            inputs.len()
        );
        Ok(Value::Object(inputs.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;
    use serde_json::json;

    #[tokio::test]
    async fn test_passthrough_echoes_inputs() {
        let handler = PassthroughHandler;
        let step = WorkflowStep::new("s1", "noop");
        let inputs = json!({"k": "v"}).as_object().unwrap().clone();

        let result = handler
            .execute(&step, &inputs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"k": "v"}));
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(PassthroughHandler)).unwrap();

        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(EngineError::UnknownStepType(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(PassthroughHandler)).unwrap();

        assert!(matches!(
            registry.register("noop", Arc::new(PassthroughHandler)),
            Err(EngineError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_verify_definition_step_types() {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(PassthroughHandler)).unwrap();

        let known = WorkflowDefinition::new(
            "wf",
            "Known",
            vec![WorkflowStep::new("a", "noop")],
        )
        .unwrap();
        assert!(registry.verify(&known).is_ok());

        let unknown = WorkflowDefinition::new(
            "wf2",
            "Unknown",
            vec![WorkflowStep::new("a", "mystery")],
        )
        .unwrap();
        assert!(matches!(
            registry.verify(&unknown),
            Err(EngineError::UnknownStepType(_))
        ));
    }
}
