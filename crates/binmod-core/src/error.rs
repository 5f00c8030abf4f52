//! Core error types for binmod-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering
//! the failure modes of the IR data model and the container codec.

use crate::id::ObjectId;
use thiserror::Error;

/// Core errors produced by the binmod-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value does not fit the varint wire range.
    #[error("value {value} exceeds varint range")]
    VarintOverflow { value: u64 },

    /// The container input ended in the middle of a value.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    /// The container magic or version did not match.
    #[error("invalid container header: {reason}")]
    InvalidHeader { reason: String },

    /// An opcode or storage tag was not recognized while loading.
    #[error("unknown {kind} tag: {tag}")]
    UnknownTag { kind: &'static str, tag: u64 },

    /// An ObjectId was not found where it must exist by construction.
    #[error("unresolved reference: ObjectId({id})", id = id.0)]
    UnresolvedRef { id: ObjectId },

    /// A storage ref was not found in the storage key table.
    #[error("unknown storage ref: {0}")]
    UnknownStorage(u64),

    /// An internal invariant was violated.
    #[error("module inconsistency: {reason}")]
    Inconsistent { reason: String },
}
