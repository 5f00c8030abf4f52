//! The opcode record.
//!
//! A [`Code`] is a tagged row: the [`AbstractOp`] tag plus a set of
//! optional fields, each meaningful only for certain opcodes. The
//! container codec serializes the tag, a presence bitset, and the present
//! fields in declaration order, so the field order here is part of the
//! wire format.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{ObjectId, StorageRef};
use crate::op::{
    AbstractOp, BinaryOp, CastType, EndianExpr, FunctionKind, MergeMode, PackedOpType,
    ReserveType, SubRangeType, UnaryOp, UnionCheckAt,
};
use crate::storage::{DecodeFlags, EncodeFlags};

/// A metadata attachment: the interned metadata name plus value refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRef {
    pub name: ObjectId,
    pub refs: Vec<ObjectId>,
}

/// One φ input: the predecessor arm's condition and the definition that
/// reaches the join through that arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiParam {
    pub condition: ObjectId,
    pub assign: ObjectId,
}

/// One IR instruction.
///
/// Field order is the wire order. `ref_id` is the opcode's primary
/// operand (`ref` in the container), `left`/`right` the binary operands,
/// `belong` the enclosing scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub op: AbstractOp,
    pub ident: Option<ObjectId>,
    pub ref_id: Option<ObjectId>,
    pub left: Option<ObjectId>,
    pub right: Option<ObjectId>,
    pub belong: Option<ObjectId>,
    pub bin_op: Option<BinaryOp>,
    pub un_op: Option<UnaryOp>,
    pub ty: Option<StorageRef>,
    pub from_ty: Option<StorageRef>,
    pub cast_kind: Option<CastType>,
    pub int_value: Option<u64>,
    /// Raw 64-bit immediate for values outside the varint range.
    pub int_value64: Option<u64>,
    pub bit_size: Option<u64>,
    /// Bit size plus one; zero means "variable".
    pub bit_size_plus: Option<u64>,
    pub array_length: Option<u64>,
    pub endian: Option<EndianExpr>,
    pub func_kind: Option<FunctionKind>,
    pub merge_mode: Option<MergeMode>,
    pub check_at: Option<UnionCheckAt>,
    pub packed_kind: Option<PackedOpType>,
    pub reserve_kind: Option<ReserveType>,
    pub sub_range_kind: Option<SubRangeType>,
    pub fallback: Option<ObjectId>,
    pub metadata: Option<MetadataRef>,
    pub params: Option<Vec<ObjectId>>,
    pub phi_params: Option<Vec<PhiParam>>,
    pub encode_flags: Option<EncodeFlags>,
    pub decode_flags: Option<DecodeFlags>,
    pub string_ref: Option<ObjectId>,
}

impl Code {
    /// A bare record with the given tag and no fields set.
    pub fn new(op: AbstractOp) -> Self {
        Code {
            op,
            ident: None,
            ref_id: None,
            left: None,
            right: None,
            belong: None,
            bin_op: None,
            un_op: None,
            ty: None,
            from_ty: None,
            cast_kind: None,
            int_value: None,
            int_value64: None,
            bit_size: None,
            bit_size_plus: None,
            array_length: None,
            endian: None,
            func_kind: None,
            merge_mode: None,
            check_at: None,
            packed_kind: None,
            reserve_kind: None,
            sub_range_kind: None,
            fallback: None,
            metadata: None,
            params: None,
            phi_params: None,
            encode_flags: None,
            decode_flags: None,
            string_ref: None,
        }
    }

    /// The `ident` field, which must be set on this opcode.
    pub fn require_ident(&self) -> Result<ObjectId, CoreError> {
        self.ident.ok_or_else(|| self.missing("ident"))
    }

    /// The `ref` field, which must be set on this opcode.
    pub fn require_ref(&self) -> Result<ObjectId, CoreError> {
        self.ref_id.ok_or_else(|| self.missing("ref"))
    }

    /// The `left_ref` field, which must be set on this opcode.
    pub fn require_left(&self) -> Result<ObjectId, CoreError> {
        self.left.ok_or_else(|| self.missing("left_ref"))
    }

    /// The `right_ref` field, which must be set on this opcode.
    pub fn require_right(&self) -> Result<ObjectId, CoreError> {
        self.right.ok_or_else(|| self.missing("right_ref"))
    }

    /// The `belong` field, which must be set on this opcode.
    pub fn require_belong(&self) -> Result<ObjectId, CoreError> {
        self.belong.ok_or_else(|| self.missing("belong"))
    }

    /// The `type` field, which must be set on this opcode.
    pub fn require_ty(&self) -> Result<StorageRef, CoreError> {
        self.ty.ok_or_else(|| self.missing("type"))
    }

    fn missing(&self, field: &str) -> CoreError {
        CoreError::Inconsistent {
            reason: format!("{:?} has no {} field", self.op, field),
        }
    }
}
