//! flowrunner - Workflow Execution Engine
//!
//! A library for defining, validating, planning and executing workflows
//! made of dependent steps. Definitions carry typed input schemas with
//! conditional visibility; execution is checkpointed after every state
//! change, so a run can be paused, resumed, cancelled or recovered after
//! a crash without repeating committed work.
//!
//! # Architecture
//!
//! The library is organized into two main modules:
//!
//! - [`workflow`]: Data structures, input validation, dependency planning
//!   and definition parsing
//! - [`execution`]: Persisted execution state, the state manager, step
//!   handlers and the async engine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::execution::{ExecutionEngine, HandlerRegistry, PassthroughHandler};
//! use flowrunner::execution::{JsonFileStore, StateManager};
//! use flowrunner::workflow::load_definition;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow definition from YAML
//!     let definition = load_definition("workflow.yaml")?;
//!     let workflow_id = definition.workflow_id.clone();
//!
//!     // Wire up persistence and step handlers
//!     let store = Arc::new(JsonFileStore::new(".flowrunner/state")?);
//!     let mut registry = HandlerRegistry::new();
//!     registry.register("noop", Arc::new(PassthroughHandler))?;
//!
//!     let engine = Arc::new(ExecutionEngine::new(
//!         Arc::new(StateManager::new(store)),
//!         Arc::new(registry),
//!     ));
//!
//!     // Create and run
//!     engine.create(definition)?;
//!     engine.start(&workflow_id, Default::default())?;
//!     engine.wait(&workflow_id).await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use execution::engine::ExecutionEngine;
pub use execution::manager::StateManager;
pub use execution::state::{ExecutionState, WorkflowState};
pub use workflow::model::{WorkflowDefinition, WorkflowStep};
pub use workflow::parser::load_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "flowrunner";
