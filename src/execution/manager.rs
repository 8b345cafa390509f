//! State Manager
//!
//! Single source of truth for persisted execution state. Every mutating
//! operation loads the record, applies the change through the state
//! machine, and persists the full state *before* returning — checkpoint,
//! then ack. A crash between "step finished" and "caller notified" never
//! loses a committed result.

use std::sync::Arc;

use log::{info, warn};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::workflow::WorkflowDefinition;

use super::state::{ExecutionState, StepState, WorkflowState};
use super::store::StateStore;

/// Owns persistence and enforces the workflow-level state machine.
pub struct StateManager {
    store: Arc<dyn StateStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Creates and persists the initial DRAFT state for a definition.
    /// Rejected when a record already exists for the workflow id.
    pub fn create(&self, definition: &WorkflowDefinition) -> Result<ExecutionState> {
        if let Some(existing) = self.store.load(&definition.workflow_id)? {
            return Err(EngineError::InvalidTransition {
                state: existing.state.to_string(),
                operation: "create".to_string(),
            });
        }

        let state = ExecutionState::new(definition);
        self.store.save(&state)?;
        info!("Created execution state for '{}'", definition.workflow_id);
        Ok(state)
    }

    /// Loads the state for a workflow, erroring when none exists.
    pub fn load(&self, workflow_id: &str) -> Result<ExecutionState> {
        self.store
            .load(workflow_id)?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Loads without treating absence as an error.
    pub fn try_load(&self, workflow_id: &str) -> Result<Option<ExecutionState>> {
        self.store.load(workflow_id)
    }

    /// Persists a state as-is. Used by the engine for checkpoints it has
    /// already driven through the state machine.
    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        self.store.save(state)
    }

    /// Commits a successful step result.
    pub fn record_step_result(
        &self,
        workflow_id: &str,
        step_id: &str,
        output: Value,
    ) -> Result<ExecutionState> {
        let mut state = self.load(workflow_id)?;
        state.ensure_mutable("record step result")?;
        state.record_success(step_id, output);
        self.store.save(&state)?;
        Ok(state)
    }

    /// Transitions RUNNING → PAUSED with a reason.
    pub fn pause(&self, workflow_id: &str, reason: &str) -> Result<ExecutionState> {
        let mut state = self.load(workflow_id)?;
        if state.state != WorkflowState::Running {
            return Err(EngineError::InvalidTransition {
                state: state.state.to_string(),
                operation: "pause".to_string(),
            });
        }
        state.transition(WorkflowState::Paused, "pause")?;
        state.pause_reason = Some(reason.to_string());
        self.store.save(&state)?;
        info!("Paused workflow '{workflow_id}': {reason}");
        Ok(state)
    }

    /// Merges extra inputs and transitions PAUSED/WAITING_FOR_INPUT →
    /// RUNNING. The caller verifies input completeness first.
    pub fn resume(
        &self,
        workflow_id: &str,
        extra_inputs: Map<String, Value>,
    ) -> Result<ExecutionState> {
        let mut state = self.load(workflow_id)?;
        if !matches!(
            state.state,
            WorkflowState::Paused | WorkflowState::WaitingForInput
        ) {
            return Err(EngineError::InvalidTransition {
                state: state.state.to_string(),
                operation: "resume".to_string(),
            });
        }
        state.merge_inputs(extra_inputs);
        state.transition(WorkflowState::Running, "resume")?;
        state.pause_reason = None;
        self.store.save(&state)?;
        Ok(state)
    }

    /// Merges extra inputs and parks the workflow in WAITING_FOR_INPUT.
    pub fn mark_waiting(
        &self,
        workflow_id: &str,
        extra_inputs: Map<String, Value>,
    ) -> Result<ExecutionState> {
        let mut state = self.load(workflow_id)?;
        state.merge_inputs(extra_inputs);
        // Paused workflows stay paused when inputs are still incomplete.
        if state.state != WorkflowState::Paused {
            state.transition(WorkflowState::WaitingForInput, "collect inputs")?;
        }
        self.store.save(&state)?;
        Ok(state)
    }

    /// Cancels from any non-terminal state.
    pub fn cancel(&self, workflow_id: &str) -> Result<ExecutionState> {
        let mut state = self.load(workflow_id)?;
        state.transition(WorkflowState::Cancelled, "cancel")?;
        state.current_step = None;
        self.store.save(&state)?;
        info!("Cancelled workflow '{workflow_id}'");
        Ok(state)
    }

    /// Marks a PENDING step SKIPPED so planning treats it as satisfied.
    pub fn skip_step(&self, workflow_id: &str, step_id: &str) -> Result<ExecutionState> {
        let mut state = self.load(workflow_id)?;
        state.ensure_mutable("skip step")?;

        match state.step_state(step_id) {
            Some(StepState::Pending) => {}
            Some(other) => {
                return Err(EngineError::InvalidTransition {
                    state: format!("step '{step_id}' is {other:?}"),
                    operation: "skip step".to_string(),
                })
            }
            None => return Err(EngineError::WorkflowNotFound(format!("{workflow_id}/{step_id}"))),
        }

        state.record_skip(step_id);
        self.store.save(&state)?;
        warn!("Skipped step '{step_id}' in workflow '{workflow_id}'");
        Ok(state)
    }

    /// Removes the persisted record entirely.
    pub fn delete(&self, workflow_id: &str) -> Result<()> {
        self.store.delete(workflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::store::MemoryStore;
    use crate::workflow::WorkflowStep;
    use serde_json::json;

    fn manager() -> StateManager {
        StateManager::new(Arc::new(MemoryStore::new()))
    }

    fn definition(id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(
            id,
            "Manager test",
            vec![
                WorkflowStep::new("a", "noop"),
                WorkflowStep::new("b", "noop").depends_on("a"),
            ],
        )
        .unwrap()
    }

    fn inputs(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_create_persists_draft() {
        let manager = manager();
        let state = manager.create(&definition("wf-c")).unwrap();
        assert_eq!(state.state, WorkflowState::Draft);

        let loaded = manager.load("wf-c").unwrap();
        assert_eq!(loaded.state, WorkflowState::Draft);
    }

    #[test]
    fn test_create_twice_rejected() {
        let manager = manager();
        manager.create(&definition("wf-dup")).unwrap();
        assert!(matches!(
            manager.create(&definition("wf-dup")),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.load("ghost"),
            Err(EngineError::WorkflowNotFound(_))
        ));
        assert!(manager.try_load("ghost").unwrap().is_none());
    }

    #[test]
    fn test_record_step_result_checkpoints() {
        let manager = manager();
        let mut state = manager.create(&definition("wf-r")).unwrap();
        state.transition(WorkflowState::Running, "start").unwrap();
        manager.save(&state).unwrap();

        manager
            .record_step_result("wf-r", "a", json!({"ok": true}))
            .unwrap();

        // The result is durable before the call returned.
        let loaded = manager.load("wf-r").unwrap();
        assert_eq!(loaded.step_results["a"].output, json!({"ok": true}));
        assert_eq!(loaded.step_state("a"), Some(StepState::Completed));
    }

    #[test]
    fn test_pause_requires_running() {
        let manager = manager();
        manager.create(&definition("wf-p")).unwrap();

        assert!(matches!(
            manager.pause("wf-p", "user request"),
            Err(EngineError::InvalidTransition { .. })
        ));

        let mut state = manager.load("wf-p").unwrap();
        state.transition(WorkflowState::Running, "start").unwrap();
        manager.save(&state).unwrap();

        let paused = manager.pause("wf-p", "user request").unwrap();
        assert_eq!(paused.state, WorkflowState::Paused);
        assert_eq!(paused.pause_reason.as_deref(), Some("user request"));
    }

    #[test]
    fn test_resume_requires_paused_or_waiting() {
        let manager = manager();
        manager.create(&definition("wf-res")).unwrap();

        // Draft cannot resume.
        assert!(matches!(
            manager.resume("wf-res", Map::new()),
            Err(EngineError::InvalidTransition { .. })
        ));

        let mut state = manager.load("wf-res").unwrap();
        state.transition(WorkflowState::Running, "start").unwrap();
        manager.save(&state).unwrap();
        manager.pause("wf-res", "hold").unwrap();

        let resumed = manager
            .resume("wf-res", inputs(json!({"key": "value"})))
            .unwrap();
        assert_eq!(resumed.state, WorkflowState::Running);
        assert!(resumed.pause_reason.is_none());
        assert_eq!(resumed.collected_inputs["key"], "value");
    }

    #[test]
    fn test_mark_waiting_from_draft() {
        let manager = manager();
        manager.create(&definition("wf-w")).unwrap();

        let state = manager
            .mark_waiting("wf-w", inputs(json!({"partial": 1})))
            .unwrap();
        assert_eq!(state.state, WorkflowState::WaitingForInput);
        assert_eq!(state.collected_inputs["partial"], 1);
    }

    #[test]
    fn test_mark_waiting_keeps_paused_paused() {
        let manager = manager();
        manager.create(&definition("wf-wp")).unwrap();
        let mut state = manager.load("wf-wp").unwrap();
        state.transition(WorkflowState::Running, "start").unwrap();
        manager.save(&state).unwrap();
        manager.pause("wf-wp", "hold").unwrap();

        let state = manager.mark_waiting("wf-wp", Map::new()).unwrap();
        assert_eq!(state.state, WorkflowState::Paused);
    }

    #[test]
    fn test_cancel_terminal_rejected() {
        let manager = manager();
        manager.create(&definition("wf-can")).unwrap();
        manager.cancel("wf-can").unwrap();

        assert!(matches!(
            manager.cancel("wf-can"),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_skip_step() {
        let manager = manager();
        manager.create(&definition("wf-skip")).unwrap();

        let state = manager.skip_step("wf-skip", "a").unwrap();
        assert_eq!(state.step_state("a"), Some(StepState::Skipped));
        assert_eq!(state.step_results["a"].status, "skipped");

        // Skipping again is rejected: no longer pending.
        assert!(matches!(
            manager.skip_step("wf-skip", "a"),
            Err(EngineError::InvalidTransition { .. })
        ));

        // Unknown step.
        assert!(matches!(
            manager.skip_step("wf-skip", "ghost"),
            Err(EngineError::WorkflowNotFound(_))
        ));
    }
}
