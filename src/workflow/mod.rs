//! Workflow Definition Module
//!
//! Data structures and validation for workflow definitions.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (InputParameter, WorkflowStep, WorkflowDefinition)
//! - [`condition`]: Conditional visibility predicates (show_when)
//! - [`validator`]: Parameter validation against collected inputs
//! - [`planner`]: Cycle detection and parallel batching
//! - [`parser`]: Definition files and export/import

pub mod condition;
pub mod model;
pub mod parser;
pub mod planner;
pub mod validator;

pub use condition::{Condition, ShowWhen};
pub use model::{
    InputParameter, ParameterType, RetryConfig, ValidationRules, WorkflowDefinition, WorkflowStep,
};
pub use parser::{export_definition, import_definition, load_definition};
pub use planner::{plan, ExecutionPlan};
pub use validator::{missing_required, validate, ValidationOutcome};
