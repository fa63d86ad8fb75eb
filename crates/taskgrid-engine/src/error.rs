//! Engine error types.

use taskgrid_core::TaskId;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("circular dependency among tasks: {}", .cycle.join(", "))]
    CircularDependency { cycle: Vec<TaskId> },

    #[error("concurrent update on {key}: gave up after {attempts} attempts")]
    ConcurrentUpdate { key: String, attempts: u32 },

    #[error("task conflict: {0}")]
    TaskConflict(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("invalid service declaration: {0}")]
    InvalidServiceDeclaration(String),

    #[error("state store error: {0}")]
    State(#[from] taskgrid_state::StateError),
}

impl EngineError {
    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::ConcurrentUpdate { .. } => "concurrent_update",
            EngineError::TaskConflict(_) => "task_conflict",
            EngineError::TaskNotFound(_) => "task_not_found",
            EngineError::InvalidServiceDeclaration(_) => "invalid_service_declaration",
            EngineError::State(_) => "store",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
