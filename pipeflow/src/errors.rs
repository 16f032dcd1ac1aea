//! Error types for the pipeflow framework.
//!
//! Two kinds of failure are kept strictly apart: *usage errors* (an
//! operation invoked against a component in a state that forbids it, or a
//! malformed topology) are reported synchronously through [`PipeflowError`];
//! *item-level computation errors* travel in-band as
//! [`crate::item::Item::Failure`] values and never appear here, except when a
//! debug-mode stage re-raises one as [`PipeflowError::ItemFailure`].

use crate::item::CapturedError;
use std::time::Duration;
use thiserror::Error;

/// The main error type for pipeflow operations.
#[derive(Debug, Error)]
pub enum PipeflowError {
    /// An operation was invoked in a state that forbids it.
    #[error("{0}")]
    Usage(#[from] UsageError),

    /// Adding an edge would have created a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// A `next()` call exceeded its wait budget. Recoverable: retry the
    /// pull, or let a skip-configured engine discard the slot.
    #[error("timed out after {0:?} waiting for the next result")]
    Timeout(Duration),

    /// A captured item failure re-raised by a stage in debug mode.
    ///
    /// Catchable; iteration continues on the following pull.
    #[error("item failure: {0}")]
    ItemFailure(CapturedError),

    /// A stage handle could not be resolved.
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// A step name was not found in the registry.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// An engine name in a pipeline description could not be resolved.
    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error raised when an operation is called from a forbidden state.
#[derive(Debug, Clone, Error)]
#[error("invalid call to {operation}: {message}")]
pub struct UsageError {
    /// The operation that was attempted.
    pub operation: String,
    /// What was wrong about the call.
    pub message: String,
}

impl UsageError {
    /// Creates a new usage error.
    #[must_use]
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Error raised when an edge would create a cycle in the stage graph.
///
/// The graph is left unchanged when this is returned.
#[derive(Debug, Clone, Error)]
#[error("cycle detected: {}", cycle_path.join(" -> "))]
pub struct CycleError {
    /// The path of stage names that would form the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleError {
    /// Creates a new cycle error from the offending path.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}
