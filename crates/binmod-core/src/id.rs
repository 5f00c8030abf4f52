//! Stable ID newtypes for IR entities.
//!
//! All IDs are distinct newtype wrappers, providing type safety so that a
//! storage ref cannot be accidentally used where an object id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identity of a program entity in the module: format, field,
/// function, temporary, immediate, enum member, bit field, union, union
/// member, variable, or property.
///
/// IDs are allocated from a single monotonically increasing counter and
/// never reused. The value `0` ([`ObjectId::NONE`]) means "no reference".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The null reference.
    pub const NONE: ObjectId = ObjectId(0);

    /// Returns `true` if this is the null reference.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if this names an actual entity.
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

/// Deduplicated handle to a type shape in the storage key table.
///
/// Identical shapes share one ref; `0` means "no type".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StorageRef(pub u64);

impl StorageRef {
    /// The null type handle.
    pub const NONE: StorageRef = StorageRef(0);

    /// Returns `true` if this is the null handle.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of opcode indexes, used for definition extents and
/// program extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

/// One per-definition extent row: the definition's ident plus the range of
/// opcodes from its `DEFINE_*` up to and including its `END_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentRange {
    pub ident: ObjectId,
    pub range: Range,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_zero() {
        assert!(ObjectId::NONE.is_none());
        assert!(!ObjectId::NONE.is_some());
        assert!(ObjectId(1).is_some());
        assert!(StorageRef::NONE.is_none());
        assert!(!StorageRef(3).is_none());
    }

    #[test]
    fn display_prints_inner_value() {
        assert_eq!(format!("{}", ObjectId(42)), "42");
        assert_eq!(format!("{}", StorageRef(7)), "7");
    }

    #[test]
    fn serde_roundtrip() {
        let id = ObjectId(99);
        let json = serde_json::to_string(&id).unwrap();
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
