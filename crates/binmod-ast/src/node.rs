//! AST node definitions.
//!
//! One [`Node`] enum covers declarations, statements, expressions, and
//! types. Expression nodes carry an optional `expr_type` reference filled
//! in by the parser's semantic analysis; lowering treats a missing type
//! as "unknown" and skips implicit casts.

use serde::{Deserialize, Serialize};

use crate::tree::NodeId;

/// Binary operators at the source level.
///
/// Assignment forms are binary nodes too, following the source language:
/// `=` ([`AstBinaryOp::Assign`]), `:=` ([`AstBinaryOp::DefineAssign`]),
/// `::=` ([`AstBinaryOp::ConstAssign`]) and the loop binder `in`
/// ([`AstBinaryOp::InAssign`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
    LeftShift,
    RightShift,
    Equal,
    NotEqual,
    Less,
    LessOrEq,
    Greater,
    GreaterOrEq,
    Assign,
    DefineAssign,
    ConstAssign,
    InAssign,
}

/// Unary operators at the source level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstUnaryOp {
    Not,
    BitNot,
    Minus,
}

/// Byte-order annotation on int/float types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstEndian {
    #[default]
    Unspec,
    Big,
    Little,
    Native,
}

/// Mutability level of a variable binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantLevel {
    Constant,
    ImmutableVariable,
    #[default]
    Variable,
}

/// Role of a user-declared function inside a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FnRole {
    #[default]
    Free,
    Encode,
    Decode,
}

/// Extra arguments attached to a field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldArguments {
    /// Allowed-value expressions; encode asserts before writing, decode
    /// asserts after reading.
    #[serde(default)]
    pub arguments: Vec<NodeId>,
    /// Whether `arguments` maps directly onto the field value.
    #[serde(default)]
    pub direct_mapping: bool,
    /// Byte alignment requirement for open padding vectors, in bits.
    #[serde(default)]
    pub alignment_value: Option<u64>,
    /// Sub-range byte length expression; `None` when absent.
    #[serde(default)]
    pub sub_byte_length: Option<NodeId>,
    /// `true` when the sub-range length is "until eof" (`..`).
    #[serde(default)]
    pub sub_byte_length_is_open: bool,
    /// Sub-range start offset expression.
    #[serde(default)]
    pub sub_byte_begin: Option<NodeId>,
    /// Wire representation type overriding the declared one.
    #[serde(default)]
    pub type_map: Option<NodeId>,
}

/// One alternative of a union-typed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionCandidate {
    /// Branch condition; `None` for the trailing "otherwise" branch.
    pub condition: Option<NodeId>,
    /// The concrete field declared in this branch; `None` when the branch
    /// declares nothing.
    pub field: Option<NodeId>,
}

/// An AST node. Kind names are the serde tag in the parser's JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    // -- declarations --
    Program {
        name: String,
        elements: Vec<NodeId>,
    },
    Format {
        ident: NodeId,
        body: Vec<NodeId>,
        /// User-supplied encoder, when present.
        #[serde(default)]
        encode_fn: Option<NodeId>,
        /// User-supplied decoder, when present.
        #[serde(default)]
        decode_fn: Option<NodeId>,
    },
    EnumDecl {
        ident: NodeId,
        /// Wire base type; an enum without one is abstract and cannot be
        /// coded directly.
        #[serde(default)]
        base_type: Option<NodeId>,
        members: Vec<NodeId>,
    },
    EnumMember {
        ident: NodeId,
        value: NodeId,
    },
    State {
        ident: NodeId,
        fields: Vec<NodeId>,
    },
    Field {
        /// `None` for anonymous (padding) fields.
        #[serde(default)]
        ident: Option<NodeId>,
        field_type: NodeId,
        #[serde(default)]
        is_state_variable: bool,
        #[serde(default)]
        arguments: Option<FieldArguments>,
    },
    FunctionDecl {
        ident: NodeId,
        #[serde(default)]
        params: Vec<NodeId>,
        body: Vec<NodeId>,
        #[serde(default)]
        return_type: Option<NodeId>,
        #[serde(default)]
        role: FnRole,
    },

    // -- statements --
    Block {
        elements: Vec<NodeId>,
    },
    If {
        cond: NodeId,
        then: Vec<NodeId>,
        /// Either another `If` (elif) or a `Block` (else).
        #[serde(default)]
        els: Option<NodeId>,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    Match {
        #[serde(default)]
        cond: Option<NodeId>,
        branches: Vec<NodeId>,
        #[serde(default)]
        exhaustive: bool,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    MatchBranch {
        /// The pattern expression; an unbounded range is the default arm.
        cond: NodeId,
        body: NodeId,
    },
    Loop {
        #[serde(default)]
        init: Option<NodeId>,
        #[serde(default)]
        cond: Option<NodeId>,
        #[serde(default)]
        step: Option<NodeId>,
        body: Vec<NodeId>,
    },
    Break,
    Continue,
    Assert {
        cond: NodeId,
    },
    ExplicitError {
        message: String,
        #[serde(default)]
        args: Vec<NodeId>,
    },
    Return {
        #[serde(default)]
        value: Option<NodeId>,
    },
    /// Byte-order directive: `input.endian = <expr>`.
    SpecifyOrder {
        order: NodeId,
        /// Constant-folded order: 0 big, 1 little, 2 native. `None` when
        /// the order is only known at run time.
        #[serde(default)]
        order_value: Option<u64>,
    },
    MetadataStmt {
        name: String,
        #[serde(default)]
        values: Vec<NodeId>,
    },
    Import {
        path: String,
    },

    // -- expressions --
    Ident {
        name: String,
        /// The declaring node this use resolves to.
        #[serde(default)]
        base: Option<NodeId>,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    IntLiteral {
        value: u64,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    BoolLiteral {
        value: bool,
    },
    StrLiteral {
        value: String,
        length: u64,
    },
    CharLiteral {
        value: u32,
    },
    Binary {
        op: AstBinaryOp,
        left: NodeId,
        right: NodeId,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    Unary {
        op: AstUnaryOp,
        operand: NodeId,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    MemberAccess {
        target: NodeId,
        member: NodeId,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    IndexExpr {
        target: NodeId,
        index: NodeId,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    RangeExpr {
        #[serde(default)]
        start: Option<NodeId>,
        #[serde(default)]
        end: Option<NodeId>,
        #[serde(default)]
        inclusive: bool,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },
    CastExpr {
        target_type: NodeId,
        expr: NodeId,
    },
    CallExpr {
        callee: NodeId,
        #[serde(default)]
        args: Vec<NodeId>,
        #[serde(default)]
        expr_type: Option<NodeId>,
    },

    // -- types --
    IntType {
        bit_size: u64,
        #[serde(default)]
        endian: AstEndian,
        #[serde(default)]
        is_signed: bool,
    },
    FloatType {
        bit_size: u64,
        #[serde(default)]
        endian: AstEndian,
    },
    BoolType,
    VoidType,
    StrLiteralType {
        literal: NodeId,
        bit_size: u64,
    },
    ArrayType {
        element_type: NodeId,
        /// Length expression; `None` is the open form `[..]`.
        #[serde(default)]
        length: Option<NodeId>,
        /// Constant-folded length when statically known.
        #[serde(default)]
        length_value: Option<u64>,
    },
    StructType {
        base: NodeId,
    },
    EnumType {
        base: NodeId,
    },
    OptionalType {
        base: NodeId,
    },
    IdentType {
        ident: NodeId,
        #[serde(default)]
        base: Option<NodeId>,
    },
    RangeType {
        range: NodeId,
        #[serde(default)]
        base: Option<NodeId>,
    },
    UnionType {
        /// The match scrutinee the candidate conditions compare against,
        /// when the union came from a `match`.
        #[serde(default)]
        cond_base: Option<NodeId>,
        candidates: Vec<UnionCandidate>,
        /// The shared type when every candidate agrees.
        #[serde(default)]
        common_type: Option<NodeId>,
    },
}

impl Node {
    /// The `expr_type` of an expression node, when the parser provided
    /// one. Non-expressions return `None`.
    pub fn expr_type(&self) -> Option<NodeId> {
        match self {
            Node::Ident { expr_type, .. }
            | Node::IntLiteral { expr_type, .. }
            | Node::Binary { expr_type, .. }
            | Node::Unary { expr_type, .. }
            | Node::MemberAccess { expr_type, .. }
            | Node::IndexExpr { expr_type, .. }
            | Node::RangeExpr { expr_type, .. }
            | Node::CallExpr { expr_type, .. }
            | Node::If { expr_type, .. }
            | Node::Match { expr_type, .. } => *expr_type,
            _ => None,
        }
    }

    /// Returns `true` for nodes that are expressions (including `if` and
    /// `match` used as expressions).
    pub fn is_expr(&self) -> bool {
        matches!(
            self,
            Node::Ident { .. }
                | Node::IntLiteral { .. }
                | Node::BoolLiteral { .. }
                | Node::StrLiteral { .. }
                | Node::CharLiteral { .. }
                | Node::Binary { .. }
                | Node::Unary { .. }
                | Node::MemberAccess { .. }
                | Node::IndexExpr { .. }
                | Node::RangeExpr { .. }
                | Node::CastExpr { .. }
                | Node::CallExpr { .. }
        )
    }

    /// Returns `true` for type nodes.
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Node::IntType { .. }
                | Node::FloatType { .. }
                | Node::BoolType
                | Node::VoidType
                | Node::StrLiteralType { .. }
                | Node::ArrayType { .. }
                | Node::StructType { .. }
                | Node::EnumType { .. }
                | Node::OptionalType { .. }
                | Node::IdentType { .. }
                | Node::RangeType { .. }
                | Node::UnionType { .. }
        )
    }
}
