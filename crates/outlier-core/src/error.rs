//! Error types shared by every detector.

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Anomaly detection errors.
///
/// All variants are local precondition failures. Nothing here is retried
/// internally; callers re-supply data or parameters.
#[derive(Debug, Error)]
pub enum AnomalyError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Insufficient data: required {required}, got {got}")]
    InsufficientData { required: usize, got: usize },

    #[error("Model not trained: {0}")]
    NotTrained(&'static str),

    #[error("Invalid parameter: {name} - {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl AnomalyError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type for detector operations.
pub type Result<T> = std::result::Result<T, AnomalyError>;
