//! Execution Engine
//!
//! Drives a workflow definition through its execution plan:
//! - One background tokio task per live execution, guarded by a task
//!   registry so a workflow never has two concurrent owners
//! - Batch-by-batch execution: checkpoint, fan out the batch, join it,
//!   checkpoint the results, advance
//! - Per-step timeout and bounded exponential-backoff retry
//! - Pause/resume/cancel through a cancellation token threaded into every
//!   handler call and batch wait
//!
//! All progress is written through the [`StateManager`] before the engine
//! acknowledges it, so recovery after a crash replays nothing and loses
//! nothing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::workflow::parser::check_definition;
use crate::workflow::planner::plan;
use crate::workflow::validator::{apply_defaults, missing_required};
use crate::workflow::{InputParameter, WorkflowDefinition, WorkflowStep};

use super::handler::{HandlerRegistry, StepHandler};
use super::manager::StateManager;
use super::state::{ExecutionState, StepResult, StepState, WorkflowState};

/// Outcome of a start or resume call.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub status: WorkflowState,
    /// Names of required parameters still missing. Non-empty iff the
    /// workflow is parked waiting for input.
    pub missing: Vec<String>,
}

/// Point-in-time view of an execution, safe to hand to API layers.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub workflow_id: String,
    pub state: WorkflowState,
    pub current_step: Option<String>,
    pub step_states: std::collections::BTreeMap<String, StepState>,
    pub pause_reason: Option<String>,
    pub error_details: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<ExecutionState> for ExecutionStatus {
    fn from(state: ExecutionState) -> Self {
        Self {
            workflow_id: state.workflow_id,
            state: state.state,
            current_step: state.current_step,
            step_states: state.step_states,
            pause_reason: state.pause_reason,
            error_details: state.error_details,
            updated_at: state.updated_at,
        }
    }
}

/// Sort order for [`ExecutionEngine::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Most recently updated first.
    #[default]
    UpdatedAt,
    /// Workflow name, ascending.
    Name,
}

/// Filters for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<WorkflowState>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub sort: SortBy,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// One row of a list query.
#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub workflow_id: String,
    pub name: String,
    pub category: String,
    pub tags: Vec<String>,
    pub state: WorkflowState,
    pub updated_at: DateTime<Utc>,
}

struct ActiveTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// The workflow execution engine.
///
/// Construct one per embedding application and share it via `Arc`; spawned
/// execution tasks hold clones of the state manager and handler registry,
/// not of the engine itself.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::execution::{ExecutionEngine, HandlerRegistry, PassthroughHandler};
/// use flowrunner::execution::{JsonFileStore, StateManager};
/// use flowrunner::workflow::load_definition;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = Arc::new(JsonFileStore::new(".flowrunner/state")?);
///     let mut registry = HandlerRegistry::new();
///     registry.register("noop", Arc::new(PassthroughHandler))?;
///
///     let engine = Arc::new(ExecutionEngine::new(
///         Arc::new(StateManager::new(store)),
///         Arc::new(registry),
///     ));
///
///     let definition = load_definition("workflow.yaml")?;
///     engine.create(definition)?;
///     engine.start("my-workflow", Default::default())?;
///     engine.wait("my-workflow").await;
///     Ok(())
/// }
/// ```
pub struct ExecutionEngine {
    manager: Arc<StateManager>,
    registry: Arc<HandlerRegistry>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    tasks: Mutex<HashMap<String, ActiveTask>>,
}

impl ExecutionEngine {
    pub fn new(manager: Arc<StateManager>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            manager,
            registry,
            definitions: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<StateManager> {
        &self.manager
    }

    /// Registers a definition, persisting its initial DRAFT state.
    ///
    /// Runs every creation-time check: structure, parameter rules, cycle
    /// detection, and handler coverage. Nothing is persisted on failure.
    ///
    /// When a record for the workflow id is already persisted (a previous
    /// process created it), the definition re-attaches to that record
    /// instead — provided its step set matches the checkpoint — so an
    /// engine restarted on the same store can pick up where it left off.
    pub fn create(&self, definition: WorkflowDefinition) -> Result<()> {
        check_definition(&definition)?;
        self.registry.verify(&definition)?;

        match self.manager.try_load(&definition.workflow_id)? {
            None => {
                self.manager.create(&definition)?;
                info!("Created workflow '{}'", definition.workflow_id);
            }
            Some(existing) => {
                let known: HashSet<&str> =
                    existing.step_states.keys().map(String::as_str).collect();
                let declared: HashSet<&str> =
                    definition.steps.iter().map(|s| s.step_id.as_str()).collect();
                if known != declared {
                    return Err(EngineError::InvalidStructure(format!(
                        "workflow '{}' already has persisted state with a different step set",
                        definition.workflow_id
                    )));
                }
                info!(
                    "Re-attached workflow '{}' to persisted state ({})",
                    definition.workflow_id, existing.state
                );
            }
        }

        let workflow_id = definition.workflow_id.clone();
        self.definitions
            .write()
            .expect("definitions lock poisoned")
            .insert(workflow_id, Arc::new(definition));
        Ok(())
    }

    /// Looks up a registered definition.
    pub fn definition(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .expect("definitions lock poisoned")
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Starts (or restarts after input collection) a workflow.
    ///
    /// Inputs are merged into the collected set first. If required
    /// parameters are still missing the workflow parks in
    /// WAITING_FOR_INPUT and the missing names are returned — that is an
    /// outcome, not an error. Otherwise a background task takes ownership
    /// of the run.
    pub fn start(&self, workflow_id: &str, inputs: Map<String, Value>) -> Result<StartOutcome> {
        let definition = self.definition(workflow_id)?;
        let state = self.manager.load(workflow_id)?;

        match state.state {
            WorkflowState::Draft | WorkflowState::WaitingForInput => {}
            // A running record with no live task means a previous process
            // died mid-run; starting again is recovery, not a conflict.
            WorkflowState::Running if !self.has_live_task(workflow_id) => {}
            other => {
                if other == WorkflowState::Running {
                    return Err(EngineError::ConcurrentExecution(workflow_id.to_string()));
                }
                return Err(EngineError::InvalidTransition {
                    state: other.to_string(),
                    operation: "start".to_string(),
                });
            }
        }

        self.launch(&definition, inputs, "start")
    }

    /// Resumes a paused or input-starved workflow with extra inputs.
    pub fn resume(&self, workflow_id: &str, extra_inputs: Map<String, Value>) -> Result<StartOutcome> {
        let definition = self.definition(workflow_id)?;
        let state = self.manager.load(workflow_id)?;

        if !matches!(
            state.state,
            WorkflowState::Paused | WorkflowState::WaitingForInput
        ) {
            return Err(EngineError::InvalidTransition {
                state: state.state.to_string(),
                operation: "resume".to_string(),
            });
        }

        self.launch(&definition, extra_inputs, "resume")
    }

    /// Common start/resume path: merge inputs, check completeness, spawn.
    fn launch(
        &self,
        definition: &Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
        operation: &str,
    ) -> Result<StartOutcome> {
        let workflow_id = definition.workflow_id.clone();

        // The task registry is the mutual-exclusion gate: the conflict
        // check and the spawn happen under one lock so two racing calls
        // cannot both win.
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(task) = tasks.get(&workflow_id) {
            let live = task
                .handle
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false);
            if live {
                return Err(EngineError::ConcurrentExecution(workflow_id));
            }
        }

        // Merge provided inputs, then check the union of the workflow
        // schema and the next pending steps' parameters.
        let staged = {
            let mut state = self.manager.load(&workflow_id)?;
            state.merge_inputs(inputs);
            state
        };
        let missing = missing_for_next_batch(definition, &staged)?;
        if !missing.is_empty() {
            let state = self
                .manager
                .mark_waiting(&workflow_id, staged.collected_inputs)?;
            info!(
                "Workflow '{workflow_id}' waiting for input: {}",
                missing.join(", ")
            );
            return Ok(StartOutcome {
                status: state.state,
                missing,
            });
        }

        // Inputs are complete: persist them and go RUNNING.
        let mut state = staged;
        if state.state != WorkflowState::Running {
            state.transition(WorkflowState::Running, operation)?;
        }
        state.pause_reason = None;
        self.manager.save(&state)?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_to_completion(
            Arc::clone(&self.manager),
            Arc::clone(&self.registry),
            Arc::clone(definition),
            cancel.clone(),
        ));
        tasks.insert(
            workflow_id,
            ActiveTask {
                cancel,
                handle: Some(handle),
            },
        );

        Ok(StartOutcome {
            status: WorkflowState::Running,
            missing: Vec::new(),
        })
    }

    /// Pauses a running workflow. The paused checkpoint is persisted before
    /// the background task is cancelled, so nothing committed is lost and
    /// nothing uncommitted survives.
    pub fn pause(&self, workflow_id: &str) -> Result<()> {
        self.manager.pause(workflow_id, "pause requested")?;
        self.stop_task(workflow_id);
        Ok(())
    }

    /// Cancels from any non-terminal state and stops the task without
    /// further retries.
    pub fn cancel(&self, workflow_id: &str) -> Result<()> {
        self.manager.cancel(workflow_id)?;
        self.stop_task(workflow_id);
        Ok(())
    }

    /// Current status snapshot.
    pub fn status(&self, workflow_id: &str) -> Result<ExecutionStatus> {
        Ok(self.manager.load(workflow_id)?.into())
    }

    /// State and committed result (if any) for a single step.
    pub fn step_status(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<(StepState, Option<StepResult>)> {
        let state = self.manager.load(workflow_id)?;
        let step_state = state
            .step_state(step_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(format!("{workflow_id}/{step_id}")))?;
        Ok((step_state, state.step_results.get(step_id).cloned()))
    }

    /// Marks a pending step skipped (auxiliary StateManager surface).
    pub fn skip_step(&self, workflow_id: &str, step_id: &str) -> Result<()> {
        self.definition(workflow_id)?;
        self.manager.skip_step(workflow_id, step_id)?;
        Ok(())
    }

    /// Runs one step outside the normal batch loop. The step's dependencies
    /// must already be finished; inputs are validated, the handler is
    /// bounded and retried as usual, and the result is checkpointed.
    pub async fn run_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<Value> {
        let definition = self.definition(workflow_id)?;
        let step = definition
            .get_step(step_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(format!("{workflow_id}/{step_id}")))?
            .clone();

        if self.has_live_task(workflow_id) {
            return Err(EngineError::ConcurrentExecution(workflow_id.to_string()));
        }

        let mut state = self.manager.load(workflow_id)?;
        state.ensure_mutable("run step")?;
        state.merge_inputs(inputs);

        for dep in &step.depends_on {
            if !state.step_state(dep).map(|s| s.is_finished()).unwrap_or(false) {
                return Err(EngineError::InvalidTransition {
                    state: format!("dependency '{dep}' unfinished"),
                    operation: "run step".to_string(),
                });
            }
        }

        let effective = effective_inputs(&definition, &step, &state.collected_inputs);
        let schema = union_schema(&definition, std::slice::from_ref(&step));
        let missing: Vec<String> = missing_required(&schema, &effective)
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        if !missing.is_empty() {
            let mut errors = std::collections::BTreeMap::new();
            for name in missing {
                errors.insert(name, vec!["required parameter is missing".to_string()]);
            }
            return Err(EngineError::Validation { errors });
        }

        self.manager.save(&state)?;

        let handler = self.registry.get(&step.step_type)?;
        let cancel = CancellationToken::new();
        let output = invoke_with_retry(handler, &step, &effective, &cancel).await?;
        self.manager
            .record_step_result(workflow_id, step_id, output.clone())?;
        Ok(output)
    }

    /// Waits for the background task of a workflow to finish, if one is
    /// live. Useful for CLIs and tests; API servers poll `status` instead.
    pub async fn wait(&self, workflow_id: &str) {
        let handle = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.get_mut(workflow_id).and_then(|t| t.handle.take())
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Execution task for '{workflow_id}' panicked: {e}");
                }
            }
        }
    }

    /// Lists executions joined with their definitions, filtered, sorted
    /// and paginated.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<ListEntry>> {
        let definitions = self.definitions.read().expect("definitions lock poisoned");

        let mut entries: Vec<ListEntry> = self
            .manager
            .store()
            .list()?
            .into_iter()
            .filter_map(|state| {
                let definition = definitions.get(&state.workflow_id)?;
                Some(ListEntry {
                    workflow_id: state.workflow_id.clone(),
                    name: definition.name.clone(),
                    category: definition.category.clone(),
                    tags: definition.tags.clone(),
                    state: state.state,
                    updated_at: state.updated_at,
                })
            })
            .filter(|e| filter.state.map(|s| e.state == s).unwrap_or(true))
            .filter(|e| {
                filter
                    .category
                    .as_ref()
                    .map(|c| &e.category == c)
                    .unwrap_or(true)
            })
            .filter(|e| {
                filter
                    .tag
                    .as_ref()
                    .map(|t| e.tags.contains(t))
                    .unwrap_or(true)
            })
            .collect();

        match filter.sort {
            SortBy::UpdatedAt => entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            SortBy::Name => entries.sort_by(|a, b| a.name.cmp(&b.name)),
        }

        let entries = entries.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => entries.take(limit).collect(),
            None => entries.collect(),
        })
    }

    /// Exports a definition as runtime-free JSON.
    pub fn export(&self, workflow_id: &str) -> Result<Value> {
        crate::workflow::export_definition(self.definition(workflow_id)?.as_ref())
    }

    /// Imports a definition from JSON and creates it.
    pub fn import(&self, value: Value) -> Result<String> {
        let definition = crate::workflow::import_definition(value)?;
        let workflow_id = definition.workflow_id.clone();
        self.create(definition)?;
        Ok(workflow_id)
    }

    fn has_live_task(&self, workflow_id: &str) -> bool {
        let tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks
            .get(workflow_id)
            .map(|t| {
                t.handle
                    .as_ref()
                    .map(|h| !h.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn stop_task(&self, workflow_id: &str) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(task) = tasks.remove(workflow_id) {
            task.cancel.cancel();
        }
    }

}

/// Required-but-missing parameter names for the next pending batch, over
/// the union of the workflow schema and those steps' parameters.
fn missing_for_next_batch(
    definition: &WorkflowDefinition,
    state: &ExecutionState,
) -> Result<Vec<String>> {
    let plan = plan(definition, &state.finished_steps())?;
    let batch_steps: Vec<WorkflowStep> = plan
        .batches
        .first()
        .map(|batch| {
            batch
                .iter()
                .filter_map(|id| definition.get_step(id).cloned())
                .collect()
        })
        .unwrap_or_default();

    let schema = union_schema(definition, &batch_steps);
    Ok(missing_required(&schema, &state.collected_inputs)
        .into_iter()
        .map(|p| p.name.clone())
        .collect())
}

/// Body of the background execution task.
async fn run_to_completion(
    manager: Arc<StateManager>,
    registry: Arc<HandlerRegistry>,
    definition: Arc<WorkflowDefinition>,
    cancel: CancellationToken,
) {
    let workflow_id = definition.workflow_id.clone();
    if let Err(e) = run_batches(&manager, &registry, &definition, &cancel).await {
        // Unexpected engine-side failure (storage, planning). Step failures
        // are handled inside the loop.
        error!("Execution of '{workflow_id}' aborted: {e}");
        if let Ok(mut state) = manager.load(&workflow_id) {
            if state.transition(WorkflowState::Failed, "abort").is_ok() {
                state.error_details = Some(e.to_string());
                let _ = manager.save(&state);
            }
        }
    }
    // The finished registry entry stays behind; liveness checks go through
    // `JoinHandle::is_finished`, and the next launch replaces it.
}

async fn run_batches(
    manager: &StateManager,
    registry: &HandlerRegistry,
    definition: &WorkflowDefinition,
    cancel: &CancellationToken,
) -> Result<()> {
    let workflow_id = &definition.workflow_id;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut state = manager.load(workflow_id)?;
        if state.state != WorkflowState::Running {
            // Paused or cancelled from outside between batches.
            return Ok(());
        }

        // Replanning from the finished set naturally skips completed and
        // skipped work, on resume and between batches alike.
        let plan = plan(definition, &state.finished_steps())?;
        let batch = match plan.batches.first() {
            Some(batch) => batch.clone(),
            None => {
                state.transition(WorkflowState::Completed, "finish")?;
                state.current_step = None;
                manager.save(&state)?;
                info!("Workflow '{workflow_id}' completed");
                return Ok(());
            }
        };

        // Mid-run input gap: park instead of failing.
        let missing = missing_for_next_batch(definition, &state)?;
        if !missing.is_empty() {
            state.transition(WorkflowState::WaitingForInput, "collect inputs")?;
            manager.save(&state)?;
            info!(
                "Workflow '{workflow_id}' waiting for input before batch: {}",
                missing.join(", ")
            );
            return Ok(());
        }

        // Checkpoint the batch as RUNNING before any handler fires.
        for step_id in &batch {
            state.set_step_state(step_id, StepState::Running);
        }
        state.current_step = batch.first().cloned();
        manager.save(&state)?;

        // Fan out the whole batch, join it, then commit.
        let mut join_set = JoinSet::new();
        for step_id in &batch {
            let step = definition
                .get_step(step_id)
                .expect("planned step exists")
                .clone();
            let handler = registry.get(&step.step_type)?;
            let inputs = effective_inputs(definition, &step, &state.collected_inputs);
            let step_cancel = cancel.child_token();

            join_set.spawn(async move {
                let result = invoke_with_retry(handler, &step, &inputs, &step_cancel).await;
                (step.step_id, result)
            });
        }

        let mut results = match join_batch(&mut join_set, cancel).await {
            Some(results) => results,
            // Cancelled mid-batch: uncheckpointed work is discarded; the
            // pause/cancel path has already persisted the state.
            None => return Ok(()),
        };

        // A batch member with no result means its task panicked before
        // returning. That is a final failure, never a reason to re-run.
        let returned: HashSet<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        let panicked: Vec<String> = batch
            .iter()
            .filter(|id| !returned.contains(id.as_str()))
            .cloned()
            .collect();
        for step_id in panicked {
            results.push((
                step_id.clone(),
                Err(EngineError::StepExecution {
                    step: step_id,
                    message: "handler panicked".to_string(),
                }),
            ));
        }

        let mut state = manager.load(workflow_id)?;
        if state.state.is_terminal() {
            return Ok(());
        }

        let mut failed: Option<(String, EngineError)> = None;
        for (step_id, result) in results {
            match result {
                Ok(output) => {
                    info!("Step '{step_id}' completed");
                    state.record_success(&step_id, output);
                }
                Err(e) => {
                    warn!("Step '{step_id}' failed: {e}");
                    state.record_failure(&step_id, &e.to_string());
                    if failed.is_none() {
                        failed = Some((step_id, e));
                    }
                }
            }
        }

        if let Some((step_id, _)) = failed {
            // Siblings that finished are already recorded above; stop
            // scheduling further batches.
            state.current_step = Some(step_id.clone());
            if state.state == WorkflowState::Running {
                state.transition(WorkflowState::Failed, "step failure")?;
            }
            manager.save(&state)?;
            error!("Workflow '{workflow_id}' failed at step '{step_id}'");
            return Ok(());
        }

        if state.state == WorkflowState::Running {
            state.current_step = None;
        }
        manager.save(&state)?;
    }
}

/// Merged, default-applied inputs handed to a step handler.
fn effective_inputs(
    definition: &WorkflowDefinition,
    step: &WorkflowStep,
    collected: &Map<String, Value>,
) -> Map<String, Value> {
    let mut inputs = collected.clone();
    apply_defaults(&definition.input_schema, &mut inputs);
    apply_defaults(&step.input_parameters, &mut inputs);
    inputs
}

/// Union of the workflow-level schema and the given steps' parameters.
/// Step-level parameters shadow workflow-level ones of the same name.
fn union_schema(
    definition: &WorkflowDefinition,
    steps: &[WorkflowStep],
) -> Vec<InputParameter> {
    let mut schema: Vec<InputParameter> = Vec::new();
    for parameter in definition
        .input_schema
        .iter()
        .chain(steps.iter().flat_map(|s| s.input_parameters.iter()))
    {
        if let Some(existing) = schema.iter_mut().find(|p| p.name == parameter.name) {
            *existing = parameter.clone();
        } else {
            schema.push(parameter.clone());
        }
    }
    schema
}

/// Joins a batch, racing the cancellation token. Returns `None` when
/// cancelled; dropping the join set aborts any stragglers.
async fn join_batch(
    join_set: &mut JoinSet<(String, Result<Value>)>,
    cancel: &CancellationToken,
) -> Option<Vec<(String, Result<Value>)>> {
    let mut results = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            joined = join_set.join_next() => match joined {
                Some(Ok(result)) => results.push(result),
                Some(Err(e)) => {
                    // The panicked task's step id is gone with the task;
                    // the batch reconciliation records the failure for
                    // whichever batch members are missing from the results.
                    error!("Step task panicked: {e}");
                }
                None => return Some(results),
            },
        }
    }
}

/// Invokes a handler bounded by the step timeout, retrying per the step's
/// retry policy with exponential backoff.
async fn invoke_with_retry(
    handler: Arc<dyn StepHandler>,
    step: &WorkflowStep,
    inputs: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<Value> {
    let retry = step.retry();
    let timeout = Duration::from_secs(step.timeout_seconds);
    let mut attempt: u32 = 0;

    loop {
        let invocation = tokio::time::timeout(timeout, handler.execute(step, inputs, cancel));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EngineError::StepExecution {
                    step: step.step_id.clone(),
                    message: "cancelled".to_string(),
                })
            }
            outcome = invocation => outcome,
        };

        let last_error = match outcome {
            Ok(Ok(output)) => return Ok(output),
            Ok(Err(e)) => EngineError::StepExecution {
                step: step.step_id.clone(),
                message: e.to_string(),
            },
            Err(_) => EngineError::StepTimeout {
                step: step.step_id.clone(),
                timeout_seconds: step.timeout_seconds,
            },
        };

        if attempt >= retry.max_retries {
            return Err(last_error);
        }
        attempt += 1;
        warn!(
            "Step '{}' attempt {attempt}/{} failed, retrying: {last_error}",
            step.step_id, retry.max_retries
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(last_error),
            _ = tokio::time::sleep(retry.delay_for_attempt(attempt)) => {}
        }
    }
}
