//! Execution Layer
//!
//! Everything that happens after a workflow definition is accepted: the
//! persisted execution state and its state machine, the checkpoint store,
//! the state manager that guards transitions, the step handler registry,
//! and the engine that drives plans to completion.

pub mod engine;
pub mod handler;
pub mod manager;
pub mod state;
pub mod store;

pub use engine::{ExecutionEngine, ExecutionStatus, ListEntry, ListFilter, SortBy, StartOutcome};
pub use handler::{HandlerRegistry, HandlerResult, PassthroughHandler, StepHandler};
pub use manager::StateManager;
pub use state::{ExecutionState, StepResult, StepState, WorkflowState};
pub use store::{JsonFileStore, MemoryStore, StateStore};
