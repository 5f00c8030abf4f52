//! Core data model of the binary module IR.
//!
//! The binary module is a linear stream of numbered opcodes referencing
//! entities by integer identifier, plus side tables: identifiers, interned
//! strings, metadata, content-addressed type shapes, per-definition
//! opcode ranges, and program ranges. This crate defines that data model,
//! the opcode emitter used during lowering, and the container codec that
//! serializes a module to bytes and back.
//!
//! Lowering lives in `binmod-lower`; the whole-module transformation
//! pipeline lives in `binmod-transform`.

pub mod code;
pub mod container;
pub mod error;
pub mod id;
pub mod module;
pub mod op;
pub mod storage;
pub mod varint;

pub use code::{Code, MetadataRef, PhiParam};
pub use error::CoreError;
pub use id::{IdentRange, ObjectId, Range, StorageRef};
pub use module::{Module, PhiCandidate, PhiFrame};
pub use op::{
    AbstractOp, BinaryOp, CastType, Endian, EndianExpr, FunctionKind, MergeMode, PackedOpType,
    ReserveType, SubRangeType, UnaryOp, UnionCheckAt,
};
pub use storage::{DecodeFlags, EncodeFlags, Storage, StorageType, Storages};
