//! The abstract syntax tree the compiler back-end consumes.
//!
//! The parser for the binary-format description language is an external
//! collaborator; it hands over its AST as a flat JSON node array with
//! index references, which this crate deserializes into an arena
//! [`Tree`]. Node references are dense [`NodeId`] indexes into the arena,
//! which also serve as the stable keys the lowering layer uses to cache
//! identifier lookups.

pub mod node;
pub mod tree;

pub use node::*;
pub use tree::{AstError, NodeId, Tree};
