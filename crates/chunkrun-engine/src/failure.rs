//! Failures as data.
//!
//! Nothing raised inside a chunk body or a reduce is allowed to cross the
//! execution boundary; it is converted into a [`FailureRecord`] instead.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity class of a captured failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A failure the unit recognised and reported itself.
    Domain,
    /// Any other error or panic raised by the unit.
    Runtime,
    /// A panic carrying no usable information.
    Opaque,
    /// The engine was called in a way that breaks its own invariants.
    InvariantViolation,
    /// The job was cancelled before reaching a terminal result.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Domain => "domain failure",
            FailureKind::Runtime => "runtime failure",
            FailureKind::Opaque => "opaque failure",
            FailureKind::InvariantViolation => "internal invariant violation",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A captured failure, returned as a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct FailureRecord {
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Description of the unit that failed, when it helps diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl FailureRecord {
    /// A recognised domain failure.
    pub fn domain(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Domain,
            message: message.into(),
            unit: None,
        }
    }

    /// An unrecognised runtime failure of `unit`.
    pub fn runtime(message: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Runtime,
            message: message.into(),
            unit: Some(unit.into()),
        }
    }

    /// A failure with nothing more to say.
    pub fn opaque() -> Self {
        Self {
            kind: FailureKind::Opaque,
            message: "unknown failure".to_string(),
            unit: None,
        }
    }

    /// The engine's own contract was broken.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InvariantViolation,
            message: message.into(),
            unit: None,
        }
    }

    /// The job was cancelled.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: message.into(),
            unit: None,
        }
    }

    /// Convert an error returned by a chunk body or reduce.
    pub(crate) fn from_chunk_error(err: ChunkError, unit: impl FnOnce() -> String) -> Self {
        match err {
            ChunkError::Domain(message) => Self::domain(message),
            ChunkError::Cancelled(message) => Self::cancelled(message),
            ChunkError::Other(err) => Self::runtime(format!("{err:#}"), unit()),
        }
    }

    /// Convert a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>, unit: impl FnOnce() -> String) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Some((*s).to_string())
        } else {
            payload.downcast_ref::<String>().cloned()
        };
        match message {
            Some(message) => Self::runtime(format!("panicked: {message}"), unit()),
            None => Self::opaque(),
        }
    }
}

/// Error type returned by chunk bodies and reduce implementations.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// A recognised failure condition (e.g. an invalid input the unit detected).
    #[error("{0}")]
    Domain(String),

    /// The body noticed a stop request from the run loop and gave up early.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Any other runtime error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChunkError {
    /// Shorthand for [`ChunkError::Domain`].
    pub fn domain(message: impl Into<String>) -> Self {
        ChunkError::Domain(message.into())
    }

    /// Shorthand for [`ChunkError::Cancelled`].
    pub fn cancelled(message: impl Into<String>) -> Self {
        ChunkError::Cancelled(message.into())
    }
}
