//! Execution State
//!
//! The persisted record of one workflow execution: the workflow-level state
//! machine, per-step states, collected inputs, and committed step results.
//!
//! The workflow-level machine:
//!
//! ```text
//! DRAFT ──start(inputs complete)──────────────▶ RUNNING
//! DRAFT/RUNNING ──inputs incomplete──────────▶ WAITING_FOR_INPUT
//! WAITING_FOR_INPUT ──inputs now complete────▶ RUNNING
//! RUNNING ──pause────────────────────────────▶ PAUSED
//! PAUSED ──resume(inputs complete)───────────▶ RUNNING
//! RUNNING ──all steps done───────────────────▶ COMPLETED
//! RUNNING ──unrecovered step failure─────────▶ FAILED
//! RUNNING/PAUSED/WAITING_FOR_INPUT/DRAFT ──cancel──▶ CANCELLED
//! ```
//!
//! COMPLETED, FAILED and CANCELLED are terminal; no further mutation is
//! accepted.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::workflow::WorkflowDefinition;

/// Workflow-level execution state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Draft,
    WaitingForInput,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the machine allows moving from `self` to `to`.
    pub fn can_transition(&self, to: WorkflowState) -> bool {
        use WorkflowState::*;

        if *self == to {
            // Re-entering the same state is a no-op, e.g. resume while
            // inputs are still incomplete.
            return !self.is_terminal();
        }

        match self {
            Draft => matches!(to, Running | WaitingForInput | Cancelled),
            WaitingForInput => matches!(to, Running | Cancelled),
            Running => matches!(to, Paused | WaitingForInput | Completed | Failed | Cancelled),
            Paused => matches!(to, Running | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Draft => "draft",
            Self::WaitingForInput => "waiting_for_input",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Per-step state within one execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    /// Completed and skipped steps satisfy downstream dependencies.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Committed outcome of a completed or skipped step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    /// "success" for completed steps, "skipped" for skipped ones.
    pub status: String,

    /// Handler output, or null for skipped steps.
    pub output: Value,

    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: "success".to_string(),
            output,
            completed_at: Utc::now(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: "skipped".to_string(),
            output: Value::Null,
            completed_at: Utc::now(),
        }
    }
}

/// The persisted execution record for one workflow.
///
/// Exactly one live record exists per workflow id, owned by at most one
/// engine task at a time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionState {
    pub workflow_id: String,

    pub state: WorkflowState,

    /// Step currently running, or the failed step after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    pub step_states: BTreeMap<String, StepState>,

    #[serde(default)]
    pub collected_inputs: Map<String, Value>,

    /// Results only for steps in COMPLETED or SKIPPED state.
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Creates a DRAFT state with every step pending.
    pub fn new(definition: &WorkflowDefinition) -> Self {
        let step_states = definition
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), StepState::Pending))
            .collect();

        Self {
            workflow_id: definition.workflow_id.clone(),
            state: WorkflowState::Draft,
            current_step: None,
            step_states,
            collected_inputs: Map::new(),
            step_results: BTreeMap::new(),
            pause_reason: None,
            error_details: None,
            updated_at: Utc::now(),
        }
    }

    /// Applies a workflow-level transition, rejecting anything the machine
    /// does not allow. Terminal states reject everything.
    pub fn transition(&mut self, to: WorkflowState, operation: &str) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                state: self.state.to_string(),
                operation: operation.to_string(),
            });
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    /// Guards a mutation against terminal states.
    pub fn ensure_mutable(&self, operation: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                state: self.state.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Merges new inputs over the collected set.
    pub fn merge_inputs(&mut self, inputs: Map<String, Value>) {
        for (key, value) in inputs {
            self.collected_inputs.insert(key, value);
        }
        self.touch();
    }

    pub fn set_step_state(&mut self, step_id: &str, state: StepState) {
        self.step_states.insert(step_id.to_string(), state);
        self.touch();
    }

    pub fn step_state(&self, step_id: &str) -> Option<StepState> {
        self.step_states.get(step_id).copied()
    }

    /// Commits a successful step result and marks the step completed.
    pub fn record_success(&mut self, step_id: &str, output: Value) {
        self.step_states
            .insert(step_id.to_string(), StepState::Completed);
        self.step_results
            .insert(step_id.to_string(), StepResult::success(output));
        self.touch();
    }

    /// Marks a step skipped with an empty result.
    pub fn record_skip(&mut self, step_id: &str) {
        self.step_states
            .insert(step_id.to_string(), StepState::Skipped);
        self.step_results
            .insert(step_id.to_string(), StepResult::skipped());
        self.touch();
    }

    /// Marks a step failed. The failure detail lives in `error_details`,
    /// never in `step_results`.
    pub fn record_failure(&mut self, step_id: &str, error: &str) {
        self.step_states
            .insert(step_id.to_string(), StepState::Failed);
        self.current_step = Some(step_id.to_string());
        self.error_details = Some(error.to_string());
        self.touch();
    }

    /// Ids of steps whose dependencies are satisfied for planning purposes.
    pub fn finished_steps(&self) -> HashSet<String> {
        self.step_states
            .iter()
            .filter(|(_, state)| state.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True when every step has finished.
    pub fn all_steps_finished(&self) -> bool {
        self.step_states.values().all(|s| s.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;
    use serde_json::json;

    fn two_step_state() -> ExecutionState {
        let definition = WorkflowDefinition::new(
            "wf-state",
            "State test",
            vec![
                WorkflowStep::new("a", "noop"),
                WorkflowStep::new("b", "noop").depends_on("a"),
            ],
        )
        .unwrap();
        ExecutionState::new(&definition)
    }

    #[test]
    fn test_initial_state_is_draft() {
        let state = two_step_state();
        assert_eq!(state.state, WorkflowState::Draft);
        assert_eq!(state.step_state("a"), Some(StepState::Pending));
        assert_eq!(state.step_state("b"), Some(StepState::Pending));
        assert!(state.step_results.is_empty());
    }

    #[test]
    fn test_legal_transitions() {
        let mut state = two_step_state();
        state.transition(WorkflowState::WaitingForInput, "start").unwrap();
        state.transition(WorkflowState::Running, "start").unwrap();
        state.transition(WorkflowState::Paused, "pause").unwrap();
        state.transition(WorkflowState::Running, "resume").unwrap();
        state.transition(WorkflowState::Completed, "finish").unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut state = two_step_state();
        // Draft cannot pause or complete.
        assert!(state.transition(WorkflowState::Paused, "pause").is_err());
        assert!(state.transition(WorkflowState::Completed, "finish").is_err());

        state.transition(WorkflowState::Running, "start").unwrap();
        // Running cannot go back to Draft.
        assert!(state.transition(WorkflowState::Draft, "reset").is_err());
    }

    #[test]
    fn test_terminal_states_immutable() {
        let mut state = two_step_state();
        state.transition(WorkflowState::Running, "start").unwrap();
        state.transition(WorkflowState::Completed, "finish").unwrap();

        assert!(state.transition(WorkflowState::Running, "restart").is_err());
        assert!(state.transition(WorkflowState::Completed, "finish").is_err());
        assert!(state.ensure_mutable("record").is_err());
    }

    #[test]
    fn test_same_state_is_noop_when_live() {
        let mut state = two_step_state();
        state.transition(WorkflowState::Running, "start").unwrap();
        state.transition(WorkflowState::Paused, "pause").unwrap();
        // Resume with missing inputs leaves the workflow paused.
        assert!(state.transition(WorkflowState::Paused, "resume").is_ok());
    }

    #[test]
    fn test_cancel_from_live_states() {
        for setup in [
            WorkflowState::Draft,
            WorkflowState::Running,
            WorkflowState::Paused,
            WorkflowState::WaitingForInput,
        ] {
            assert!(setup.can_transition(WorkflowState::Cancelled), "{setup}");
        }
        assert!(!WorkflowState::Completed.can_transition(WorkflowState::Cancelled));
        assert!(!WorkflowState::Failed.can_transition(WorkflowState::Cancelled));
    }

    #[test]
    fn test_record_success_stores_result() {
        let mut state = two_step_state();
        state.record_success("a", json!({"rows": 3}));

        assert_eq!(state.step_state("a"), Some(StepState::Completed));
        let result = &state.step_results["a"];
        assert_eq!(result.status, "success");
        assert_eq!(result.output, json!({"rows": 3}));
    }

    #[test]
    fn test_record_failure_has_no_result_entry() {
        let mut state = two_step_state();
        state.record_failure("a", "boom");

        assert_eq!(state.step_state("a"), Some(StepState::Failed));
        assert!(state.step_results.get("a").is_none());
        assert_eq!(state.error_details.as_deref(), Some("boom"));
        assert_eq!(state.current_step.as_deref(), Some("a"));
    }

    #[test]
    fn test_finished_steps_includes_skipped() {
        let mut state = two_step_state();
        state.record_success("a", Value::Null);
        state.record_skip("b");

        let finished = state.finished_steps();
        assert!(finished.contains("a"));
        assert!(finished.contains("b"));
        assert!(state.all_steps_finished());
        assert_eq!(state.step_results["b"].status, "skipped");
    }

    #[test]
    fn test_merge_inputs_overwrites() {
        let mut state = two_step_state();
        state.merge_inputs(json!({"a": 1, "b": 2}).as_object().unwrap().clone());
        state.merge_inputs(json!({"b": 3}).as_object().unwrap().clone());

        assert_eq!(state.collected_inputs["a"], 1);
        assert_eq!(state.collected_inputs["b"], 3);
    }

    #[test]
    fn test_serialization_uses_snake_case_states() {
        let mut state = two_step_state();
        state.transition(WorkflowState::WaitingForInput, "start").unwrap();

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "waiting_for_input");
        assert_eq!(json["step_states"]["a"], "pending");
    }
}
