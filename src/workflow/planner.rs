//! Dependency Planner
//!
//! Turns a workflow definition into an execution plan:
//! - Cycle detection over `depends_on` edges (DFS with a recursion stack),
//!   run definition-wide at creation time and again on every replanning
//! - Topological batching: steps whose dependencies are all satisfied form
//!   one parallel group, in lexicographic order for stable plans
//! - Resume support: steps already completed or skipped seed the
//!   `completed` set so replanning skips finished work

use std::collections::{HashMap, HashSet};

use log::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::model::WorkflowDefinition;

/// A derived, per-run execution plan. Not persisted; recomputed on resume.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub workflow_id: String,

    /// Fresh id for this run or resume.
    pub execution_id: String,

    /// Every pending step exactly once, in dependency order.
    pub planned_steps: Vec<String>,

    /// Dependency-satisfied batches in execution order. Each batch may run
    /// its members concurrently; a batch of one is a plain sequential step.
    pub batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Batches with more than one member, i.e. actual fan-out points.
    pub fn parallel_groups(&self) -> Vec<&[String]> {
        self.batches
            .iter()
            .filter(|b| b.len() > 1)
            .map(|b| b.as_slice())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.planned_steps.is_empty()
    }
}

/// Builds an execution plan for the steps not yet in `completed`.
///
/// Cycle detection always runs over the whole definition, so a cyclic
/// workflow is rejected even when the cycle sits in already-completed
/// steps.
pub fn plan(
    definition: &WorkflowDefinition,
    completed: &HashSet<String>,
) -> Result<ExecutionPlan> {
    detect_cycles(definition)?;

    let mut satisfied: HashSet<&str> = completed.iter().map(String::as_str).collect();
    let mut remaining: Vec<&str> = definition
        .steps
        .iter()
        .map(|s| s.step_id.as_str())
        .filter(|id| !satisfied.contains(id))
        .collect();

    let mut planned_steps = Vec::new();
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let mut batch: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                let step = definition.get_step(id).expect("planned step exists");
                step.depends_on.iter().all(|dep| satisfied.contains(dep.as_str()))
            })
            .collect();

        if batch.is_empty() {
            // Unreachable for an acyclic definition with resolvable deps,
            // both enforced above and at construction.
            return Err(EngineError::CyclicDependency {
                step: remaining[0].to_string(),
            });
        }

        batch.sort_unstable();
        for id in &batch {
            satisfied.insert(id);
            planned_steps.push(id.to_string());
        }
        remaining.retain(|id| !satisfied.contains(id));
        batches.push(batch.into_iter().map(String::from).collect());
    }

    let plan = ExecutionPlan {
        workflow_id: definition.workflow_id.clone(),
        execution_id: Uuid::new_v4().to_string(),
        planned_steps,
        batches,
    };

    debug!(
        "Planned {} step(s) in {} batch(es) for workflow '{}'",
        plan.planned_steps.len(),
        plan.batches.len(),
        plan.workflow_id
    );

    Ok(plan)
}

/// Rejects definitions whose dependency graph contains a cycle, naming a
/// step on the cycle.
pub fn detect_cycles(definition: &WorkflowDefinition) -> Result<()> {
    let graph: HashMap<&str, &[String]> = definition
        .steps
        .iter()
        .map(|s| (s.step_id.as_str(), s.depends_on.as_slice()))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: HashSet<&str> = HashSet::new();

    for step in &definition.steps {
        let id = step.step_id.as_str();
        if !visited.contains(id) {
            if let Some(offender) = visit(id, &graph, &mut visited, &mut stack) {
                return Err(EngineError::CyclicDependency {
                    step: offender.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn visit<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> Option<&'a str> {
    visited.insert(node);
    stack.insert(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps.iter() {
            let dep = dep.as_str();
            if stack.contains(dep) {
                // Back-edge into the active stack.
                return Some(dep);
            }
            if !visited.contains(dep) {
                if let Some(offender) = visit(dep, graph, visited, stack) {
                    return Some(offender);
                }
            }
        }
    }

    stack.remove(node);
    None
}
