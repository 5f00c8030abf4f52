//! Transformation errors.

use binmod_core::CoreError;
use thiserror::Error;

/// Errors produced by the pass pipeline. All are fatal: the module is
/// left partially transformed and must be discarded.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The module violates an invariant a pass relies on.
    #[error("transform inconsistency: {reason}")]
    Inconsistent { reason: String },

    /// The module contains a construct a pass cannot process.
    #[error("invalid module: {reason}")]
    InvalidModule { reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl TransformError {
    pub fn inconsistent(reason: impl Into<String>) -> Self {
        TransformError::Inconsistent {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        TransformError::InvalidModule {
            reason: reason.into(),
        }
    }
}
