//! Error types for the cascade-impact engine.
//!
//! Input problems are raised eagerly, before any forward pass or gradient
//! step. Training errors are contained to the run that produced them and
//! never touch the production parameters held by the registry.

use thiserror::Error;

use crate::gate::GateRetrainReport;

/// Unified error type for encoder, training and simulation operations.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Malformed graph, incident set or request.
    #[error("invalid input: {0}")]
    InputError(String),

    /// Tensor shape disagreement inside the encoder or optimizer.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Non-finite loss or gradient norm during a training run.
    #[error("training diverged at epoch {epoch}: {reason}")]
    TrainingDivergence {
        /// Epoch (1-based) in which divergence was detected.
        epoch: usize,
        /// What went non-finite.
        reason: String,
    },

    /// A parameter group designated frozen was found trainable.
    #[error("freeze violation: groups {groups:?} must be frozen but are trainable")]
    FreezeViolation {
        /// Offending group names.
        groups: Vec<String>,
    },

    /// The retrained candidate failed one or more promotion criteria.
    #[error("validation rejected candidate: failed {}", .0.failed_criteria().join(", "))]
    ValidationRejection(Box<GateRetrainReport>),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Model artifact could not be decoded or carries a foreign format tag.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CascadeError {
    /// Create an input error.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::InputError(msg.into())
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a divergence error.
    pub fn divergence(epoch: usize, reason: impl Into<String>) -> Self {
        Self::TrainingDivergence {
            epoch,
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an artifact error.
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Whether the error was raised before any computation started.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InputError(_) | Self::DimensionMismatch { .. })
    }
}

/// Convenience result type for cascade-impact operations.
pub type Result<T> = std::result::Result<T, CascadeError>;
