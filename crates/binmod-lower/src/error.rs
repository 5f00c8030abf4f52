//! Lowering errors.

use binmod_ast::AstError;
use binmod_core::CoreError;
use thiserror::Error;

/// Errors produced while lowering the AST into the raw IR.
#[derive(Debug, Error)]
pub enum LowerError {
    /// The AST contains a construct the lowering does not support, or a
    /// required piece is missing.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// An invariant that must hold by construction was violated.
    #[error("lowering inconsistency: {reason}")]
    Inconsistent { reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Ast(#[from] AstError),
}

impl LowerError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        LowerError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn inconsistent(reason: impl Into<String>) -> Self {
        LowerError::Inconsistent {
            reason: reason.into(),
        }
    }
}
