// src/errors.rs

//! Crate-wide error type and helpers.

use thiserror::Error;

use crate::reconciler::registry::DuplicateKindError;
use crate::types::ResourceName;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller is not running")]
    NotRunning,

    #[error("controller is already running")]
    AlreadyRunning,

    #[error("controller closed")]
    Closed,

    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceName),

    #[error("resource already exists: {0}")]
    ResourceAlreadyExists(ResourceName),

    #[error("cannot be reconciled due to cyclic dependency")]
    CyclicDependency,

    #[error("no reconciler registered for resource kind {0:?}")]
    UnknownKind(String),

    #[error(transparent)]
    DuplicateKind(#[from] DuplicateKindError),

    #[error("can't update resource state from outside of reconciler")]
    StateUpdateOutsideReconciler,

    #[error("lock called by invocation that already holds the lock")]
    LockAlreadyHeld,

    #[error("unlock called by invocation that does not hold the lock")]
    LockNotHeld,

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out waiting for reconcile to finish for resources: {0:?}")]
    ShutdownTimeout(Vec<String>),

    #[error("controller event loop failed: {0}")]
    LoopFailed(Box<ControllerError>),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<ControllerError>),

    #[error("internal: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cycle detected in resource graph: {0}")]
    DagCycle(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControllerError {
    /// Collapse a list of errors into a single error (`None` if empty).
    pub fn join(mut errors: Vec<ControllerError>) -> Option<ControllerError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ControllerError::Multiple(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::ResourceNotFound(_))
    }
}

fn join_messages(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Returns true if `err` represents a cancellation rather than a failure.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ControllerError>(),
        Some(ControllerError::Cancelled)
    )
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ControllerError>;
