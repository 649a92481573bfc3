//! Error types for fieldflux.
//!
//! All errors are strongly typed using thiserror. Two tiers exist: validation
//! errors reject a subscription synchronously at setup time and never leave an
//! engine half-initialized; engine errors surface runtime conditions that a
//! caller can react to. Protocol violations (snapshot hand-off misuse) are
//! programming errors and panic instead of returning an error, since silently
//! absorbing them would corrupt ring accounting.

use thiserror::Error;

use crate::value::ScalarKind;

/// Validation errors that occur while checking a subscription request or a
/// record mutation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Queue depth must be at least 1, got {got}")]
    InvalidQueueDepth {
        got: usize,
    },

    #[error("Unknown monitor algorithm: {name}")]
    UnknownAlgorithm {
        name: String,
    },

    #[error("Unknown field: {path}")]
    UnknownField {
        path: String,
    },

    #[error("Field '{path}' is not a numeric scalar; a deadband requires one")]
    NonNumericField {
        path: String,
    },

    #[error("Field '{path}' expects a {expected} value, got {got}")]
    TypeMismatch {
        path: String,
        expected: ScalarKind,
        got: String,
    },

    #[error("Field '{path}' is a structure, not a scalar")]
    NotAScalar {
        path: String,
    },

    #[error("Duplicate field name '{name}' under '{parent}'")]
    DuplicateField {
        name: String,
        parent: String,
    },

    #[error("Invalid periodic rate: {reason}")]
    InvalidPeriod {
        reason: String,
    },

    #[error("Invalid monitor request: {reason}")]
    InvalidRequest {
        reason: String,
    },

    #[error("Record has no timestamp field")]
    NoTimestampField,
}

/// Runtime errors raised by a monitor engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Monitor has been destroyed and cannot be reused")]
    Destroyed,
}

/// Top-level error type for fieldflux.
#[derive(Debug, Error)]
pub enum FluxError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl FluxError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an engine error.
    #[must_use]
    pub const fn is_engine(&self) -> bool {
        matches!(self, Self::Engine(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for fieldflux operations.
pub type FluxResult<T> = Result<T, FluxError>;
