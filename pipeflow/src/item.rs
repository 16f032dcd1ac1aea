//! Items flowing through the pipeline.
//!
//! Every value traveling between stages is an [`Item`]: an ordinary JSON
//! payload, a captured computation failure carried in-band, or the
//! exhausted-slot marker a replay window emits when its upstream ends early.
//! End-of-stream is a separate signal (the `None` of a pull), never an item.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single unit of data moving through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// An ordinary result value.
    Value(Value),
    /// A captured item-level failure, passed along instead of aborting.
    Failure(Box<CapturedError>),
    /// Placeholder for a replay-window slot whose upstream ended early.
    Exhausted,
}

impl Item {
    /// Returns true for an ordinary value.
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Returns true for a captured failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true for the exhausted-slot marker.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }

    /// Borrows the inner value, if this is an ordinary value.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Consumes the item, returning the inner value if present.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrows the captured error, if this is a failure.
    #[must_use]
    pub fn as_failure(&self) -> Option<&CapturedError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<CapturedError> for Item {
    fn from(error: CapturedError) -> Self {
        Self::Failure(Box::new(error))
    }
}

/// A wrapped representation of a raised condition.
///
/// Captured errors travel as ordinary items; every stage boundary an error
/// crosses wraps it in one more layer, so the originating stage and step
/// position stay recoverable via [`CapturedError::origin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{}", self.describe())]
pub struct CapturedError {
    /// Name of the stage where this layer was added, if any.
    pub stage: Option<String>,
    /// Zero-based position of the failing step inside the unit, if known.
    pub step: Option<usize>,
    /// Human-readable description of the failure.
    pub message: String,
    /// The upstream error this layer wraps, if any.
    pub cause: Option<Box<CapturedError>>,
}

impl CapturedError {
    /// Creates a new captured error with just a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            step: None,
            message: message.into(),
            cause: None,
        }
    }

    /// Sets the failing step position.
    #[must_use]
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    /// Sets the originating stage name.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Wraps this error in a new layer attributed to `stage`.
    #[must_use]
    pub fn wrapped(self, stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            step: None,
            message: "upstream failure".to_string(),
            cause: Some(Box::new(self)),
        }
    }

    /// Returns the innermost error, where the failure originated.
    #[must_use]
    pub fn origin(&self) -> &Self {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current
    }

    /// Returns the number of wrapping layers, 0 for an unwrapped error.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(cause) = &current.cause {
            depth += 1;
            current = cause;
        }
        depth
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        if let Some(stage) = &self.stage {
            out.push_str(&format!("stage '{stage}': "));
        }
        if let Some(step) = self.step {
            out.push_str(&format!("step {step}: "));
        }
        out.push_str(&self.message);
        if let Some(cause) = &self.cause {
            out.push_str(&format!(" (caused by: {cause})"));
        }
        out
    }
}
