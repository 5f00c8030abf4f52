//! Type shapes ("storages") and coder capability flags.
//!
//! A [`Storages`] value is a non-empty ordered list of [`Storage`] tags:
//! the first element classifies the type and the tail (when applicable)
//! gives element or base types. Shapes are content-addressed: the
//! canonical byte key produced by [`Storages::key`] deduplicates
//! structurally equal shapes into a single [`StorageRef`](crate::id::StorageRef).

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::id::ObjectId;
use crate::varint::{read_varint, write_varint};

/// One tag in a type shape.
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
pub enum StorageType {
    Int,
    Uint,
    Float,
    Bool,
    StructRef,
    RecursiveStructRef,
    Enum,
    Array,
    Vector,
    Optional,
    Ptr,
    Variant,
    CoderReturn,
    PropertySetterReturn,
}

impl StorageType {
    /// Whether this tag carries a `size` operand.
    ///
    /// `Int`/`Uint`/`Float` carry the bit width, `Array` the element
    /// count, `StructRef` the byte size plus one (zero meaning variable),
    /// and `Variant` the alternative count.
    pub fn has_size(self) -> bool {
        matches!(
            self,
            StorageType::Int
                | StorageType::Uint
                | StorageType::Float
                | StorageType::Array
                | StorageType::StructRef
                | StorageType::Variant
        )
    }

    /// Whether this tag carries an entity reference operand.
    pub fn has_ref(self) -> bool {
        matches!(
            self,
            StorageType::StructRef
                | StorageType::RecursiveStructRef
                | StorageType::Enum
                | StorageType::Variant
        )
    }
}

/// A single storage tag with its optional operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Storage {
    pub kind: StorageType,
    pub size: u64,
    pub ref_id: ObjectId,
}

impl Storage {
    /// A tag with no operands.
    pub fn plain(kind: StorageType) -> Self {
        Storage {
            kind,
            size: 0,
            ref_id: ObjectId::NONE,
        }
    }

    /// A sized tag (int widths, array lengths, variant counts).
    pub fn sized(kind: StorageType, size: u64) -> Self {
        Storage {
            kind,
            size,
            ref_id: ObjectId::NONE,
        }
    }

    /// A referencing tag (struct/enum/variant heads).
    pub fn referencing(kind: StorageType, ref_id: ObjectId) -> Self {
        Storage {
            kind,
            size: 0,
            ref_id,
        }
    }
}

/// An ordered, non-empty list of storage tags denoting one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Storages {
    pub storages: SmallVec<[Storage; 2]>,
}

impl Storages {
    /// A single-tag shape.
    pub fn single(storage: Storage) -> Self {
        let mut storages = SmallVec::new();
        storages.push(storage);
        Storages { storages }
    }

    /// An unsigned integer of the given bit width.
    pub fn uint(bits: u64) -> Self {
        Storages::single(Storage::sized(StorageType::Uint, bits))
    }

    /// A signed integer of the given bit width.
    pub fn int(bits: u64) -> Self {
        Storages::single(Storage::sized(StorageType::Int, bits))
    }

    /// The boolean shape.
    pub fn bool() -> Self {
        Storages::single(Storage::plain(StorageType::Bool))
    }

    /// The head tag classifying the shape.
    pub fn head(&self) -> Option<&Storage> {
        self.storages.first()
    }

    /// Prepends a wrapper tag (`Optional`, `Ptr`, `Vector`, ...).
    pub fn wrapped(mut self, wrapper: Storage) -> Self {
        self.storages.insert(0, wrapper);
        self
    }

    /// The canonical content key for deduplication.
    ///
    /// The same shape built twice must produce byte-identical keys, so
    /// tags and operands are emitted in declaration order with the
    /// canonical varint codec.
    pub fn key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.storages.len() * 3 + 1);
        // The member count cannot exceed varint range in practice; the
        // expect is unreachable for well-formed shapes.
        write_varint(&mut out, self.storages.len() as u64).ok();
        for s in &self.storages {
            out.push(u8::from(s.kind));
            if s.kind.has_size() {
                write_varint(&mut out, s.size).ok();
            }
            if s.kind.has_ref() {
                write_varint(&mut out, s.ref_id.0).ok();
            }
        }
        out
    }

    /// Rebuilds a shape from a canonical key.
    pub fn from_key(key: &[u8]) -> Result<Self, CoreError> {
        let mut pos = 0;
        let count = read_varint(key, &mut pos)?;
        let mut storages = SmallVec::new();
        for _ in 0..count {
            let tag = *key
                .get(pos)
                .ok_or(CoreError::UnexpectedEof { offset: pos })?;
            pos += 1;
            let kind = StorageType::try_from(tag).map_err(|_| CoreError::UnknownTag {
                kind: "storage",
                tag: tag as u64,
            })?;
            let mut storage = Storage::plain(kind);
            if kind.has_size() {
                storage.size = read_varint(key, &mut pos)?;
            }
            if kind.has_ref() {
                storage.ref_id = ObjectId(read_varint(key, &mut pos)?);
            }
            storages.push(storage);
        }
        Ok(Storages { storages })
    }

    /// Returns `true` if any tag is a recursive struct reference.
    pub fn contains_recursive_ref(&self) -> bool {
        self.storages
            .iter()
            .any(|s| s.kind == StorageType::RecursiveStructRef)
    }

    /// Rewrites every `RecursiveStructRef` tag into a plain `StructRef`,
    /// preserving the referenced id. Used when an assignment cast must
    /// cross the recursion edge.
    pub fn untie_recursive_refs(&self) -> Storages {
        let mut copy = self.clone();
        for s in &mut copy.storages {
            if s.kind == StorageType::RecursiveStructRef {
                s.kind = StorageType::StructRef;
            }
        }
        copy
    }
}

/// The conversion tag between two shapes, decided by head comparison.
pub fn cast_kind_between(dest: &Storages, src: &Storages) -> crate::op::CastType {
    use crate::op::CastType;
    if dest.key() == src.key() {
        return CastType::SameType;
    }
    let (Some(d), Some(s)) = (dest.head(), src.head()) else {
        return CastType::Other;
    };
    match (d.kind, s.kind) {
        (StorageType::Uint | StorageType::Int, StorageType::Uint | StorageType::Int) => {
            if d.size > s.size {
                if s.size == 1 {
                    CastType::OneBitToInt
                } else {
                    CastType::SmallIntToLargeInt
                }
            } else if d.size < s.size {
                if d.size == 1 {
                    CastType::IntToOneBit
                } else {
                    CastType::LargeIntToSmallInt
                }
            } else if d.kind == StorageType::Uint {
                CastType::SignedToUnsigned
            } else {
                CastType::UnsignedToSigned
            }
        }
        (StorageType::Uint | StorageType::Int, StorageType::Enum) => CastType::EnumToInt,
        (StorageType::Enum, StorageType::Uint | StorageType::Int) => CastType::IntToEnum,
        (StorageType::Uint | StorageType::Int, StorageType::Float) => CastType::FloatToIntBit,
        (StorageType::Float, StorageType::Uint | StorageType::Int) => CastType::IntToFloatBit,
        (StorageType::Bool, StorageType::Uint | StorageType::Int) => CastType::IntToBool,
        (StorageType::Uint | StorageType::Int, StorageType::Bool) => CastType::BoolToInt,
        (StorageType::StructRef, StorageType::RecursiveStructRef) => {
            CastType::RecursiveStructToStruct
        }
        (StorageType::Array, StorageType::Vector) => CastType::VectorToArray,
        (StorageType::Vector, StorageType::Array) => CastType::ArrayToVector,
        _ => CastType::Other,
    }
}

/// Capability flags discovered for an encoder function, carried on its
/// `ENCODER_PARAMETER` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodeFlags(pub u8);

impl EncodeFlags {
    const SEEK: u8 = 1 << 0;
    const SUB_RANGE: u8 = 1 << 1;

    pub fn has_seek(self) -> bool {
        self.0 & Self::SEEK != 0
    }

    pub fn set_seek(&mut self, value: bool) {
        if value {
            self.0 |= Self::SEEK;
        } else {
            self.0 &= !Self::SEEK;
        }
    }

    pub fn has_sub_range(self) -> bool {
        self.0 & Self::SUB_RANGE != 0
    }

    pub fn set_sub_range(&mut self, value: bool) {
        if value {
            self.0 |= Self::SUB_RANGE;
        } else {
            self.0 &= !Self::SUB_RANGE;
        }
    }
}

/// Capability flags discovered for a decoder function, carried on its
/// `DECODER_PARAMETER` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodeFlags(pub u8);

impl DecodeFlags {
    const EOF: u8 = 1 << 0;
    const PEEK: u8 = 1 << 1;
    const SEEK: u8 = 1 << 2;
    const REMAIN_BYTES: u8 = 1 << 3;
    const SUB_RANGE: u8 = 1 << 4;

    pub fn has_eof(self) -> bool {
        self.0 & Self::EOF != 0
    }

    pub fn set_eof(&mut self, value: bool) {
        if value {
            self.0 |= Self::EOF;
        } else {
            self.0 &= !Self::EOF;
        }
    }

    pub fn has_peek(self) -> bool {
        self.0 & Self::PEEK != 0
    }

    pub fn set_peek(&mut self, value: bool) {
        if value {
            self.0 |= Self::PEEK;
        } else {
            self.0 &= !Self::PEEK;
        }
    }

    pub fn has_seek(self) -> bool {
        self.0 & Self::SEEK != 0
    }

    pub fn set_seek(&mut self, value: bool) {
        if value {
            self.0 |= Self::SEEK;
        } else {
            self.0 &= !Self::SEEK;
        }
    }

    pub fn has_remain_bytes(self) -> bool {
        self.0 & Self::REMAIN_BYTES != 0
    }

    pub fn set_remain_bytes(&mut self, value: bool) {
        if value {
            self.0 |= Self::REMAIN_BYTES;
        } else {
            self.0 &= !Self::REMAIN_BYTES;
        }
    }

    pub fn has_sub_range(self) -> bool {
        self.0 & Self::SUB_RANGE != 0
    }

    pub fn set_sub_range(&mut self, value: bool) {
        if value {
            self.0 |= Self::SUB_RANGE;
        } else {
            self.0 &= !Self::SUB_RANGE;
        }
    }

    /// Folds another decoder's flags into this one (call-graph
    /// propagation). `sub_range` deliberately does not propagate across
    /// calls. Returns `true` if anything changed.
    pub fn absorb(&mut self, other: DecodeFlags) -> bool {
        let before = self.0;
        self.0 |= other.0 & (Self::EOF | Self::PEEK | Self::SEEK | Self::REMAIN_BYTES);
        self.0 != before
    }
}

impl EncodeFlags {
    /// Folds another encoder's flags into this one. `sub_range` does not
    /// propagate across calls. Returns `true` if anything changed.
    pub fn absorb(&mut self, other: EncodeFlags) -> bool {
        let before = self.0;
        self.0 |= other.0 & Self::SEEK;
        self.0 != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_for_equal_shapes() {
        let a = Storages::uint(16);
        let b = Storages::uint(16);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_distinguishes_struct_refs() {
        let a = Storages::single(Storage::referencing(StorageType::StructRef, ObjectId(1)));
        let b = Storages::single(Storage::referencing(StorageType::StructRef, ObjectId(2)));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn key_roundtrip() {
        let shape = Storages::single(Storage::referencing(StorageType::Enum, ObjectId(7)))
            .wrapped(Storage::sized(StorageType::Array, 4));
        let key = shape.key();
        let back = Storages::from_key(&key).unwrap();
        assert_eq!(shape, back);
        assert_eq!(back.key(), key);
    }

    #[test]
    fn wrapped_prepends_head() {
        let shape = Storages::uint(8).wrapped(Storage::plain(StorageType::Vector));
        assert_eq!(shape.head().unwrap().kind, StorageType::Vector);
        assert_eq!(shape.storages.len(), 2);
        assert_eq!(shape.storages[1].kind, StorageType::Uint);
    }

    #[test]
    fn recursive_refs_untie_to_plain_struct_refs() {
        let shape = Storages::single(Storage::referencing(
            StorageType::RecursiveStructRef,
            ObjectId(5),
        ))
        .wrapped(Storage::plain(StorageType::Optional));
        assert!(shape.contains_recursive_ref());
        let untied = shape.untie_recursive_refs();
        assert!(!untied.contains_recursive_ref());
        assert_eq!(untied.storages[1].kind, StorageType::StructRef);
        assert_eq!(untied.storages[1].ref_id, ObjectId(5));
        // untying changes the canonical key
        assert_ne!(shape.key(), untied.key());
    }

    #[test]
    fn size_and_ref_tables() {
        assert!(StorageType::Uint.has_size());
        assert!(!StorageType::Uint.has_ref());
        assert!(StorageType::StructRef.has_size());
        assert!(StorageType::StructRef.has_ref());
        assert!(StorageType::Enum.has_ref());
        assert!(!StorageType::Bool.has_size());
        assert!(!StorageType::CoderReturn.has_ref());
    }

    #[test]
    fn decode_flags_roundtrip_and_absorb() {
        let mut flags = DecodeFlags::default();
        assert!(!flags.has_eof());
        flags.set_eof(true);
        flags.set_peek(true);
        assert!(flags.has_eof());
        assert!(flags.has_peek());
        flags.set_peek(false);
        assert!(!flags.has_peek());

        let mut callee = DecodeFlags::default();
        callee.set_seek(true);
        callee.set_sub_range(true);
        let mut caller = flags;
        assert!(caller.absorb(callee));
        assert!(caller.has_seek());
        // sub_range never crosses a call boundary
        assert!(!caller.has_sub_range());
        assert!(!caller.absorb(callee));
    }

    #[test]
    fn encode_flags_absorb_only_seek() {
        let mut callee = EncodeFlags::default();
        callee.set_seek(true);
        callee.set_sub_range(true);
        let mut caller = EncodeFlags::default();
        assert!(caller.absorb(callee));
        assert!(caller.has_seek());
        assert!(!caller.has_sub_range());
    }
}
