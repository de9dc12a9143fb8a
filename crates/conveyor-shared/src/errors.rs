//! Error taxonomy for the conveyor core.
//!
//! Three broad kinds with different propagation policies:
//! - [`ConveyorError`] — top-level infrastructure failures (config, database,
//!   messaging). Propagate to the caller.
//! - [`StateMachineError`] — guarded-transition failures. Illegal and
//!   terminal-state transitions fail loudly; they indicate a logic bug or a
//!   lost race, never something to paper over.
//! - [`OrchestrationError`] — failures surfaced by the orchestration loop.
//!
//! Handler failures are *not* errors in this taxonomy: they are data,
//! persisted into the step's `results` column and classified by the retry
//! policy. See `registry::HandlerFailure`.

use thiserror::Error;

/// Top-level error type for shared infrastructure
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type ConveyorResult<T> = Result<T, ConveyorError>;

/// Errors raised by guarded state-machine transitions
#[derive(Debug, Error)]
pub enum StateMachineError {
    /// The requested transition is not in the allowed-transition table.
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The entity is already in a terminal state; no further transitions are
    /// ever legal (terminal monotonicity).
    #[error("{entity} {entity_id} is in terminal state {state}; no further transitions allowed")]
    TerminalState {
        entity: &'static str,
        entity_id: i64,
        state: String,
    },

    #[error("Unknown {entity} state persisted: {state}")]
    UnknownState { entity: &'static str, state: String },

    #[error("{entity} {entity_id} not found")]
    EntityNotFound { entity: &'static str, entity_id: i64 },

    #[error("Database error during transition: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by orchestration components (discovery, executor,
/// finalizer, coordinator)
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Database operation '{operation}' failed: {reason}")]
    DatabaseError { operation: String, reason: String },

    #[error("State transition failed for {entity_type} {entity_id}: {reason}")]
    StateTransitionFailed {
        entity_type: &'static str,
        entity_id: i64,
        reason: String,
    },

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("No task definition registered for named_task_id {0}")]
    DefinitionNotFound(i64),

    #[error("No handler registered for ({namespace}, {name})")]
    HandlerNotFound { namespace: String, name: String },

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Task context failed schema validation: {0}")]
    ContextValidation(String),

    #[error("Messaging error: {0}")]
    MessagingError(String),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

impl From<sqlx::Error> for OrchestrationError {
    fn from(err: sqlx::Error) -> Self {
        OrchestrationError::DatabaseError {
            operation: "query".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<StateMachineError> for OrchestrationError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::EntityNotFound { entity: "task", entity_id } => {
                OrchestrationError::TaskNotFound(entity_id)
            }
            other => OrchestrationError::StateTransitionFailed {
                entity_type: "entity",
                entity_id: 0,
                reason: other.to_string(),
            },
        }
    }
}
