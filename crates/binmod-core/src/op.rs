//! The abstract opcode vocabulary of the binary module.
//!
//! [`AbstractOp`] is a closed enumeration of every instruction kind the
//! IR can contain, grouped into families: immediates, variable
//! definition, arithmetic, field access, control flow, function
//! definition, encode/decode primitives, structure definition and end
//! markers, declarations, fallbacks, and sub-ranges.
//!
//! Back-ends dispatch over opcodes using the closed-form predicate tables
//! exported here ([`AbstractOp::is_expr`],
//! [`AbstractOp::is_struct_define_related`], ...). The u16 tag assigned by
//! declaration order is the wire tag used by the container codec.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::id::ObjectId;

/// One IR instruction kind.
///
/// The tag determines which fields of a [`Code`](crate::code::Code)
/// record are meaningful; reading an unset field is a programmer error.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u16)]
pub enum AbstractOp {
    // -- Immediate constants --
    ImmediateInt,
    ImmediateInt64,
    ImmediateChar,
    ImmediateString,
    ImmediateTrue,
    ImmediateFalse,
    ImmediateType,

    // -- Objects and variables --
    NewObject,
    DefineVariable,
    DefineVariableRef,
    DefineConstant,
    DeclareVariable,
    DefineParameter,

    // -- Arithmetic, logic, assignment --
    Binary,
    Unary,
    Assign,
    PropertyAssign,
    Inc,
    Phi,

    // -- Access and calls --
    Access,
    Index,
    ArraySize,
    Append,
    Call,
    CallCast,
    Cast,
    EvalExpr,
    NotPrevThen,
    FieldAvailable,
    OptionalOf,
    EmptyOptional,
    AddressOf,
    EmptyPtr,

    // -- Control flow --
    If,
    Elif,
    Else,
    EndIf,
    Match,
    ExhaustiveMatch,
    Case,
    DefaultCase,
    EndCase,
    EndMatch,
    LoopInfinite,
    LoopCondition,
    EndLoop,
    Break,
    Continue,
    BeginCondBlock,
    EndCondBlock,

    // -- Functions --
    DefineFunction,
    EndFunction,
    DeclareFunction,
    ReturnType,
    Ret,
    RetSuccess,
    RetPropertySetterOk,
    RetPropertySetterFail,
    CallEncode,
    CallDecode,

    // -- Encode/decode primitives --
    EncodeInt,
    DecodeInt,
    EncodeIntVector,
    EncodeIntVectorFixed,
    DecodeIntVector,
    DecodeIntVectorFixed,
    DecodeIntVectorUntilEof,
    PeekIntVector,
    CanRead,
    RemainBytes,
    InputByteOffset,
    OutputByteOffset,
    InputBitOffset,
    OutputBitOffset,
    BackwardInput,
    BackwardOutput,
    SeekEncoder,
    SeekDecoder,
    LengthCheck,
    ReserveSize,
    EncoderParameter,
    DecoderParameter,

    // -- Structure definition --
    DefineProgram,
    EndProgram,
    DeclareProgram,
    DefineFormat,
    EndFormat,
    DeclareFormat,
    DefineField,
    ConditionalField,
    MergedConditionalField,
    ConditionalProperty,
    DefineEnum,
    EndEnum,
    DeclareEnum,
    DefineEnumMember,
    DefineState,
    EndState,
    DeclareState,
    DefineUnion,
    EndUnion,
    DeclareUnion,
    DefineUnionMember,
    EndUnionMember,
    DeclareUnionMember,
    DefineBitField,
    EndBitField,
    DeclareBitField,
    DefineProperty,
    EndProperty,
    DeclareProperty,
    DefinePropertyGetter,
    DefinePropertySetter,

    // -- Coder binding --
    DefineEncoder,
    DefineDecoder,

    // -- Unions and properties --
    CheckUnion,
    SwitchUnion,
    PropertyFunction,
    PropertyInputParameter,
    StateVariableParameter,

    // -- Recursive structs --
    CheckRecursiveStruct,
    InitRecursiveStruct,

    // -- Packed (bit-level) operations --
    BeginEncodePackedOperation,
    EndEncodePackedOperation,
    BeginDecodePackedOperation,
    EndDecodePackedOperation,

    // -- Sub-ranges --
    BeginEncodeSubRange,
    EndEncodeSubRange,
    BeginDecodeSubRange,
    EndDecodeSubRange,

    // -- Fallbacks and endianness --
    DefineFallback,
    EndFallback,
    IsLittleEndian,
    DynamicEndian,

    // -- Miscellaneous --
    Assert,
    ExplicitError,
    Import,
    Metadata,
}

impl AbstractOp {
    /// Returns `true` if this opcode produces a value usable as an
    /// expression operand (its `ident` names the result).
    pub fn is_expr(self) -> bool {
        use AbstractOp::*;
        matches!(
            self,
            ImmediateInt
                | ImmediateInt64
                | ImmediateChar
                | ImmediateString
                | ImmediateTrue
                | ImmediateFalse
                | ImmediateType
                | NewObject
                | Binary
                | Unary
                | Phi
                | Access
                | Index
                | ArraySize
                | Call
                | CallCast
                | Cast
                | NotPrevThen
                | FieldAvailable
                | OptionalOf
                | EmptyOptional
                | AddressOf
                | EmptyPtr
                | CanRead
                | RemainBytes
                | InputByteOffset
                | OutputByteOffset
                | InputBitOffset
                | OutputBitOffset
                | IsLittleEndian
                | EndCondBlock
        )
    }

    /// Returns `true` for opcodes that both define a named entity and are
    /// usable as an expression operand.
    pub fn is_both_expr_and_def(self) -> bool {
        use AbstractOp::*;
        matches!(self, DefineVariable | DefineVariableRef | DefineConstant)
    }

    /// Returns `true` for opcodes that contribute to a function's
    /// parameter list.
    pub fn is_parameter_related(self) -> bool {
        use AbstractOp::*;
        matches!(
            self,
            DefineParameter
                | EncoderParameter
                | DecoderParameter
                | PropertyInputParameter
                | StateVariableParameter
        )
    }

    /// Returns `true` for opcodes walked by back-ends when emitting type
    /// declarations (struct/enum/union/bit-field/property definitions and
    /// their end and declare markers).
    pub fn is_struct_define_related(self) -> bool {
        use AbstractOp::*;
        matches!(
            self,
            DefineFormat
                | EndFormat
                | DeclareFormat
                | DefineField
                | ConditionalField
                | MergedConditionalField
                | ConditionalProperty
                | DefineEnum
                | EndEnum
                | DeclareEnum
                | DefineEnumMember
                | DefineState
                | EndState
                | DeclareState
                | DefineUnion
                | EndUnion
                | DeclareUnion
                | DefineUnionMember
                | EndUnionMember
                | DeclareUnionMember
                | DefineBitField
                | EndBitField
                | DeclareBitField
                | DefineProperty
                | EndProperty
                | DeclareProperty
                | DefinePropertyGetter
                | DefinePropertySetter
        )
    }

    /// Returns `true` for pure structural markers: definition begin/end
    /// records and declarations that produce no runtime effect.
    pub fn is_marker(self) -> bool {
        use AbstractOp::*;
        self.is_struct_define_related()
            || matches!(
                self,
                DefineProgram
                    | EndProgram
                    | DeclareProgram
                    | DefineFallback
                    | EndFallback
                    | DefineEncoder
                    | DefineDecoder
                    | DeclareFunction
                    | DeclareVariable
            )
    }

    /// For a `DEFINE_*` opcode that opens a ranged definition, returns the
    /// matching `END_*` opcode.
    pub fn end_op(self) -> Option<AbstractOp> {
        use AbstractOp::*;
        Some(match self {
            DefineProgram => EndProgram,
            DefineFormat => EndFormat,
            DefineEnum => EndEnum,
            DefineState => EndState,
            DefineUnion => EndUnion,
            DefineUnionMember => EndUnionMember,
            DefineBitField => EndBitField,
            DefineProperty => EndProperty,
            DefineFunction => EndFunction,
            DefineFallback => EndFallback,
            _ => return None,
        })
    }

    /// Returns `true` if a textual dump should indent after this opcode.
    pub fn opens_indent(self) -> bool {
        use AbstractOp::*;
        matches!(
            self,
            DefineProgram
                | DefineFormat
                | DefineEnum
                | DefineState
                | DefineUnion
                | DefineUnionMember
                | DefineBitField
                | DefineProperty
                | DefineFunction
                | DefineFallback
                | If
                | Elif
                | Else
                | Match
                | ExhaustiveMatch
                | Case
                | DefaultCase
                | LoopInfinite
                | LoopCondition
                | BeginCondBlock
                | BeginEncodePackedOperation
                | BeginDecodePackedOperation
                | BeginEncodeSubRange
                | BeginDecodeSubRange
        )
    }

    /// Returns `true` if a textual dump should dedent before this opcode.
    pub fn closes_indent(self) -> bool {
        use AbstractOp::*;
        matches!(
            self,
            EndProgram
                | EndFormat
                | EndEnum
                | EndState
                | EndUnion
                | EndUnionMember
                | EndBitField
                | EndProperty
                | EndFunction
                | EndFallback
                | EndIf
                | Elif
                | Else
                | EndCase
                | EndMatch
                | EndLoop
                | EndCondBlock
                | EndEncodePackedOperation
                | EndDecodePackedOperation
                | EndEncodeSubRange
                | EndDecodeSubRange
        )
    }
}

/// Binary operators carried by `BINARY` opcodes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum BinaryOp {
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
    LeftLogicalShift,
    RightLogicalShift,
    Equal,
    NotEqual,
    Less,
    LessOrEq,
    Greater,
    GreaterOrEq,
}

impl BinaryOp {
    /// Source-level symbol, used by the textual dump.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
            BinaryOp::LeftLogicalShift => "<<",
            BinaryOp::RightLogicalShift => ">>",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEq => ">=",
        }
    }
}

/// Unary operators carried by `UNARY` opcodes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum UnaryOp {
    LogicalNot,
    BitNot,
    MinusSign,
}

/// Conversion semantics carried by `CAST` opcodes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum CastType {
    /// Source and destination have the same shape; kept for uniformity.
    SameType,
    SmallIntToLargeInt,
    LargeIntToSmallInt,
    SignedToUnsigned,
    UnsignedToSigned,
    OneBitToInt,
    IntToOneBit,
    EnumToInt,
    IntToEnum,
    FloatToIntBit,
    IntToFloatBit,
    IntToBool,
    BoolToInt,
    RecursiveStructToStruct,
    VectorToArray,
    ArrayToVector,
    Other,
}

/// The role of a synthesized or user-defined function.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum FunctionKind {
    Free,
    Encode,
    Decode,
    UnionGetter,
    UnionSetter,
    VectorSetter,
    BitGetter,
    BitSetter,
}

/// How a merged conditional field unifies its alternatives.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum MergeMode {
    /// All alternatives share one common type; the merged field has it.
    CommonType,
    /// The alternatives share a type and every branch is covered.
    StrictCommonType,
    /// No common type; the merged field is a tagged variant.
    UnionFields,
}

/// Where a `CHECK_UNION` guard is evaluated.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum UnionCheckAt {
    Encoder,
    PropertyGetterOptional,
    PropertyGetterPtr,
}

/// Whether a packed bit operation covers a statically known bit count.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum PackedOpType {
    Fixed,
    Variable,
}

/// Whether a `RESERVE_SIZE` request is statically known.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum ReserveType {
    Static,
    Dynamic,
}

/// The kind of a coder sub-range.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum SubRangeType {
    ByteLen,
    Replacement,
}

/// Byte-order selector on int coders.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum Endian {
    #[default]
    Unspec,
    Big,
    Little,
    Native,
    Dynamic,
}

/// Full endian expression on an int coder: byte order, signedness, and
/// (for [`Endian::Dynamic`]) the variable the order is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndianExpr {
    pub endian: Endian,
    pub signed: bool,
    /// Nonzero only when `endian` is [`Endian::Dynamic`].
    pub dynamic_ref: ObjectId,
}

impl EndianExpr {
    /// A static (non-dynamic) endian expression.
    pub fn new(endian: Endian, signed: bool) -> Self {
        EndianExpr {
            endian,
            signed,
            dynamic_ref: ObjectId::NONE,
        }
    }

    /// Returns `true` if the byte order is only known at run time
    /// (native platform order or a dynamic variable).
    pub fn is_runtime_order(&self) -> bool {
        matches!(self.endian, Endian::Native | Endian::Dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expr_predicate_accepts_value_producers() {
        assert!(AbstractOp::Binary.is_expr());
        assert!(AbstractOp::ImmediateInt.is_expr());
        assert!(AbstractOp::Index.is_expr());
        assert!(AbstractOp::CanRead.is_expr());
        assert!(!AbstractOp::Assign.is_expr());
        assert!(!AbstractOp::EncodeInt.is_expr());
        assert!(!AbstractOp::DefineFormat.is_expr());
    }

    #[test]
    fn variable_defs_are_both_expr_and_def() {
        assert!(AbstractOp::DefineVariable.is_both_expr_and_def());
        assert!(AbstractOp::DefineConstant.is_both_expr_and_def());
        assert!(!AbstractOp::Binary.is_both_expr_and_def());
    }

    #[test]
    fn parameter_predicate() {
        assert!(AbstractOp::EncoderParameter.is_parameter_related());
        assert!(AbstractOp::StateVariableParameter.is_parameter_related());
        assert!(!AbstractOp::DefineVariable.is_parameter_related());
    }

    #[test]
    fn struct_define_related_covers_declares() {
        assert!(AbstractOp::DefineFormat.is_struct_define_related());
        assert!(AbstractOp::DeclareUnion.is_struct_define_related());
        assert!(AbstractOp::MergedConditionalField.is_struct_define_related());
        assert!(!AbstractOp::DefineFunction.is_struct_define_related());
    }

    #[test]
    fn end_op_pairs() {
        assert_eq!(
            AbstractOp::DefineFormat.end_op(),
            Some(AbstractOp::EndFormat)
        );
        assert_eq!(
            AbstractOp::DefineFunction.end_op(),
            Some(AbstractOp::EndFunction)
        );
        assert_eq!(
            AbstractOp::DefineFallback.end_op(),
            Some(AbstractOp::EndFallback)
        );
        assert_eq!(AbstractOp::EncodeInt.end_op(), None);
    }

    #[test]
    fn indent_hints_are_balanced_for_blocks() {
        assert!(AbstractOp::If.opens_indent());
        assert!(AbstractOp::EndIf.closes_indent());
        // ELIF/ELSE both close the previous arm and open the next.
        assert!(AbstractOp::Elif.opens_indent());
        assert!(AbstractOp::Elif.closes_indent());
    }

    #[test]
    fn op_tag_roundtrip() {
        let tag: u16 = AbstractOp::Metadata.into();
        let back = AbstractOp::try_from(tag).unwrap();
        assert_eq!(back, AbstractOp::Metadata);
        assert!(AbstractOp::try_from(u16::MAX).is_err());
    }

    #[test]
    fn binary_op_symbols() {
        assert_eq!(BinaryOp::LeftLogicalShift.symbol(), "<<");
        assert_eq!(BinaryOp::LogicalOr.symbol(), "||");
        assert_eq!(BinaryOp::LessOrEq.symbol(), "<=");
    }

    #[test]
    fn endian_expr_runtime_order() {
        assert!(EndianExpr::new(Endian::Native, false).is_runtime_order());
        let mut dynamic = EndianExpr::new(Endian::Dynamic, true);
        dynamic.dynamic_ref = ObjectId(9);
        assert!(dynamic.is_runtime_order());
        assert!(!EndianExpr::new(Endian::Big, false).is_runtime_order());
    }
}
