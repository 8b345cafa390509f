//! Engine Error Taxonomy
//!
//! All errors surfaced by the library share one enum so callers can match on
//! what went wrong instead of parsing strings:
//!
//! - Construction errors (`InvalidStructure`, `CyclicDependency`,
//!   `UnknownStepType`, `InvalidRule`) are returned before anything is
//!   persisted.
//! - Lifecycle errors (`InvalidTransition`, `ConcurrentExecution`,
//!   `WorkflowNotFound`) leave state unchanged.
//! - Step errors (`StepTimeout`, `StepExecution`) are recorded into the
//!   execution state rather than propagated to status callers.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All error conditions produced by the workflow engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The workflow definition is structurally invalid (duplicate step ids,
    /// dangling depends_on, duplicate parameter names).
    #[error("invalid workflow structure: {0}")]
    InvalidStructure(String),

    /// The dependency graph contains a cycle through the named step.
    #[error("cyclic dependency detected at step '{step}'")]
    CyclicDependency { step: String },

    /// One or more input parameters failed validation. Per-field messages
    /// are collected, never short-circuited.
    #[error("parameter validation failed for {} field(s)", errors.len())]
    Validation {
        errors: std::collections::BTreeMap<String, Vec<String>>,
    },

    /// A parameter schema carries an unusable validation rule, e.g. a regex
    /// pattern that does not compile. Surfaced at creation time.
    #[error("invalid validation rule on parameter '{parameter}': {reason}")]
    InvalidRule { parameter: String, reason: String },

    /// The requested operation is not legal for the workflow's current state.
    #[error("invalid transition: cannot {operation} while {state}")]
    InvalidTransition { state: String, operation: String },

    /// A second start/resume was attempted while a task is already live.
    #[error("workflow '{0}' already has an active execution")]
    ConcurrentExecution(String),

    /// No persisted state or registered definition for the given id.
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    /// A step handler exceeded its configured timeout, retries exhausted.
    #[error("step '{step}' timed out after {timeout_seconds}s")]
    StepTimeout { step: String, timeout_seconds: u64 },

    /// A step handler returned an error, retries exhausted.
    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    /// A definition references a step type with no registered handler.
    #[error("no handler registered for step type '{0}'")]
    UnknownStepType(String),

    /// Persistence failed (I/O or serialization).
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl EngineError {
    /// True for errors that indicate a bad definition rather than a bad run.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStructure(_)
                | Self::CyclicDependency { .. }
                | Self::InvalidRule { .. }
                | Self::UnknownStepType(_)
        )
    }
}
