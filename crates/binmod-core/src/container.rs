//! The serialized binary-module container.
//!
//! Layout: a fixed magic plus version, then sections in a fixed order,
//! each led by an element count:
//!
//! 1. identifier table: `(id, byte length, UTF-8 bytes)` per entry
//! 2. string table: same shape
//! 3. metadata table: same shape
//! 4. storage table: `(ref, tag count, tags)` per shape; each tag is a
//!    one-byte kind followed by its optional size and ref varints
//! 5. code: `(op tag u16, presence bitset varint, present fields in
//!    declared order)` per record
//! 6. ident ranges: `(ident, start, end)` per row
//! 7. programs: `(start, end)` per row
//!
//! All integers are varints except the opcode tag (two bytes, big-endian)
//! and the raw 64-bit immediate (eight bytes, big-endian). Reloading a
//! saved module and saving it again yields byte-identical output.

use indexmap::IndexMap;

use crate::code::{Code, MetadataRef, PhiParam};
use crate::error::CoreError;
use crate::id::{IdentRange, ObjectId, Range, StorageRef};
use crate::module::Module;
use crate::op::{
    AbstractOp, BinaryOp, CastType, Endian, EndianExpr, FunctionKind, MergeMode, PackedOpType,
    ReserveType, SubRangeType, UnaryOp, UnionCheckAt,
};
use crate::storage::{DecodeFlags, EncodeFlags, Storage, StorageType, Storages};
use crate::varint::{read_varint, write_varint};

const MAGIC: [u8; 4] = *b"BMOD";
const VERSION: u64 = 1;

// Presence bits, in wire field order.
const F_IDENT: u32 = 1 << 0;
const F_REF: u32 = 1 << 1;
const F_LEFT: u32 = 1 << 2;
const F_RIGHT: u32 = 1 << 3;
const F_BELONG: u32 = 1 << 4;
const F_BIN_OP: u32 = 1 << 5;
const F_UN_OP: u32 = 1 << 6;
const F_TY: u32 = 1 << 7;
const F_FROM_TY: u32 = 1 << 8;
const F_CAST: u32 = 1 << 9;
const F_INT: u32 = 1 << 10;
const F_INT64: u32 = 1 << 11;
const F_BIT_SIZE: u32 = 1 << 12;
const F_BIT_SIZE_PLUS: u32 = 1 << 13;
const F_ARRAY_LEN: u32 = 1 << 14;
const F_ENDIAN: u32 = 1 << 15;
const F_FUNC_KIND: u32 = 1 << 16;
const F_MERGE_MODE: u32 = 1 << 17;
const F_CHECK_AT: u32 = 1 << 18;
const F_PACKED: u32 = 1 << 19;
const F_RESERVE: u32 = 1 << 20;
const F_SUB_RANGE: u32 = 1 << 21;
const F_FALLBACK: u32 = 1 << 22;
const F_METADATA: u32 = 1 << 23;
const F_PARAMS: u32 = 1 << 24;
const F_PHI_PARAMS: u32 = 1 << 25;
const F_ENCODE_FLAGS: u32 = 1 << 26;
const F_DECODE_FLAGS: u32 = 1 << 27;
const F_STRING_REF: u32 = 1 << 28;

/// Serializes `module` into the container format.
pub fn save(module: &Module) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    write_varint(&mut out, VERSION)?;

    write_name_table(&mut out, module.ident_table.iter().map(|(id, s)| (*id, s)))?;
    write_name_table(
        &mut out,
        module.string_table.iter().map(|(s, id)| (*id, s)),
    )?;
    write_name_table(
        &mut out,
        module.metadata_table.iter().map(|(s, id)| (*id, s)),
    )?;

    write_varint(&mut out, module.storage_table.len() as u64)?;
    for (r, storages) in &module.storage_table {
        write_varint(&mut out, r.0)?;
        write_varint(&mut out, storages.storages.len() as u64)?;
        for s in &storages.storages {
            out.push(u8::from(s.kind));
            if s.kind.has_size() {
                write_varint(&mut out, s.size)?;
            }
            if s.kind.has_ref() {
                write_varint(&mut out, s.ref_id.0)?;
            }
        }
    }

    write_varint(&mut out, module.code.len() as u64)?;
    for code in &module.code {
        write_code(&mut out, code)?;
    }

    write_varint(&mut out, module.ident_to_ranges.len() as u64)?;
    for row in &module.ident_to_ranges {
        write_varint(&mut out, row.ident.0)?;
        write_varint(&mut out, row.range.start)?;
        write_varint(&mut out, row.range.end)?;
    }

    write_varint(&mut out, module.programs.len() as u64)?;
    for range in &module.programs {
        write_varint(&mut out, range.start)?;
        write_varint(&mut out, range.end)?;
    }

    Ok(out)
}

/// Reconstructs a module from container bytes.
pub fn load(input: &[u8]) -> Result<Module, CoreError> {
    let mut pos = 0usize;
    if input.len() < 4 || input[..4] != MAGIC {
        return Err(CoreError::InvalidHeader {
            reason: "bad magic".to_string(),
        });
    }
    pos += 4;
    let version = read_varint(input, &mut pos)?;
    if version != VERSION {
        return Err(CoreError::InvalidHeader {
            reason: format!("unsupported version {}", version),
        });
    }

    let mut module = Module::new();

    for (id, name) in read_name_table(input, &mut pos)? {
        module.ident_table.insert(id, name);
    }
    for (id, value) in read_name_table(input, &mut pos)? {
        module.string_table.insert(value, id);
    }
    for (id, name) in read_name_table(input, &mut pos)? {
        module.metadata_table.insert(name, id);
    }

    let storage_count = read_varint(input, &mut pos)?;
    let mut key_table = IndexMap::new();
    let mut table = IndexMap::new();
    for _ in 0..storage_count {
        let r = StorageRef(read_varint(input, &mut pos)?);
        let tag_count = read_varint(input, &mut pos)?;
        let mut storages = Storages::default();
        for _ in 0..tag_count {
            let tag = *input
                .get(pos)
                .ok_or(CoreError::UnexpectedEof { offset: pos })?;
            pos += 1;
            let kind = StorageType::try_from(tag).map_err(|_| CoreError::UnknownTag {
                kind: "storage",
                tag: tag as u64,
            })?;
            let mut storage = Storage::plain(kind);
            if kind.has_size() {
                storage.size = read_varint(input, &mut pos)?;
            }
            if kind.has_ref() {
                storage.ref_id = ObjectId(read_varint(input, &mut pos)?);
            }
            storages.storages.push(storage);
        }
        key_table.insert(storages.key(), r);
        table.insert(r, storages);
    }
    module.replace_storage_tables(key_table, table);

    let code_count = read_varint(input, &mut pos)?;
    for _ in 0..code_count {
        let code = read_code(input, &mut pos)?;
        module.code.push(code);
    }

    let range_count = read_varint(input, &mut pos)?;
    for _ in 0..range_count {
        let ident = ObjectId(read_varint(input, &mut pos)?);
        let start = read_varint(input, &mut pos)?;
        let end = read_varint(input, &mut pos)?;
        module
            .ident_to_ranges
            .push(IdentRange {
                ident,
                range: Range { start, end },
            });
    }

    let program_count = read_varint(input, &mut pos)?;
    for _ in 0..program_count {
        let start = read_varint(input, &mut pos)?;
        let end = read_varint(input, &mut pos)?;
        module.programs.push(Range { start, end });
    }

    module.rebind_ident_index();
    Ok(module)
}

fn write_name_table<'a>(
    out: &mut Vec<u8>,
    entries: impl ExactSizeIterator<Item = (ObjectId, &'a String)>,
) -> Result<(), CoreError> {
    write_varint(out, entries.len() as u64)?;
    for (id, name) in entries {
        write_varint(out, id.0)?;
        write_varint(out, name.len() as u64)?;
        out.extend_from_slice(name.as_bytes());
    }
    Ok(())
}

fn read_name_table(
    input: &[u8],
    pos: &mut usize,
) -> Result<Vec<(ObjectId, String)>, CoreError> {
    let count = read_varint(input, pos)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = ObjectId(read_varint(input, pos)?);
        let len = read_varint(input, pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= input.len())
            .ok_or(CoreError::UnexpectedEof { offset: input.len() })?;
        let name = String::from_utf8(input[*pos..end].to_vec()).map_err(|_| {
            CoreError::InvalidHeader {
                reason: "non-UTF-8 table entry".to_string(),
            }
        })?;
        *pos = end;
        entries.push((id, name));
    }
    Ok(entries)
}

fn presence_bits(code: &Code) -> u32 {
    let mut bits = 0u32;
    let mut set = |flag: u32, present: bool| {
        if present {
            bits |= flag;
        }
    };
    set(F_IDENT, code.ident.is_some());
    set(F_REF, code.ref_id.is_some());
    set(F_LEFT, code.left.is_some());
    set(F_RIGHT, code.right.is_some());
    set(F_BELONG, code.belong.is_some());
    set(F_BIN_OP, code.bin_op.is_some());
    set(F_UN_OP, code.un_op.is_some());
    set(F_TY, code.ty.is_some());
    set(F_FROM_TY, code.from_ty.is_some());
    set(F_CAST, code.cast_kind.is_some());
    set(F_INT, code.int_value.is_some());
    set(F_INT64, code.int_value64.is_some());
    set(F_BIT_SIZE, code.bit_size.is_some());
    set(F_BIT_SIZE_PLUS, code.bit_size_plus.is_some());
    set(F_ARRAY_LEN, code.array_length.is_some());
    set(F_ENDIAN, code.endian.is_some());
    set(F_FUNC_KIND, code.func_kind.is_some());
    set(F_MERGE_MODE, code.merge_mode.is_some());
    set(F_CHECK_AT, code.check_at.is_some());
    set(F_PACKED, code.packed_kind.is_some());
    set(F_RESERVE, code.reserve_kind.is_some());
    set(F_SUB_RANGE, code.sub_range_kind.is_some());
    set(F_FALLBACK, code.fallback.is_some());
    set(F_METADATA, code.metadata.is_some());
    set(F_PARAMS, code.params.is_some());
    set(F_PHI_PARAMS, code.phi_params.is_some());
    set(F_ENCODE_FLAGS, code.encode_flags.is_some());
    set(F_DECODE_FLAGS, code.decode_flags.is_some());
    set(F_STRING_REF, code.string_ref.is_some());
    bits
}

fn write_code(out: &mut Vec<u8>, code: &Code) -> Result<(), CoreError> {
    let tag: u16 = code.op.into();
    out.extend_from_slice(&tag.to_be_bytes());
    write_varint(out, presence_bits(code) as u64)?;

    if let Some(id) = code.ident {
        write_varint(out, id.0)?;
    }
    if let Some(id) = code.ref_id {
        write_varint(out, id.0)?;
    }
    if let Some(id) = code.left {
        write_varint(out, id.0)?;
    }
    if let Some(id) = code.right {
        write_varint(out, id.0)?;
    }
    if let Some(id) = code.belong {
        write_varint(out, id.0)?;
    }
    if let Some(op) = code.bin_op {
        out.push(u8::from(op));
    }
    if let Some(op) = code.un_op {
        out.push(u8::from(op));
    }
    if let Some(ty) = code.ty {
        write_varint(out, ty.0)?;
    }
    if let Some(ty) = code.from_ty {
        write_varint(out, ty.0)?;
    }
    if let Some(kind) = code.cast_kind {
        out.push(u8::from(kind));
    }
    if let Some(v) = code.int_value {
        write_varint(out, v)?;
    }
    if let Some(v) = code.int_value64 {
        out.extend_from_slice(&v.to_be_bytes());
    }
    if let Some(v) = code.bit_size {
        write_varint(out, v)?;
    }
    if let Some(v) = code.bit_size_plus {
        write_varint(out, v)?;
    }
    if let Some(v) = code.array_length {
        write_varint(out, v)?;
    }
    if let Some(endian) = code.endian {
        out.push(u8::from(endian.endian) | (endian.signed as u8) << 4);
        write_varint(out, endian.dynamic_ref.0)?;
    }
    if let Some(kind) = code.func_kind {
        out.push(u8::from(kind));
    }
    if let Some(mode) = code.merge_mode {
        out.push(u8::from(mode));
    }
    if let Some(at) = code.check_at {
        out.push(u8::from(at));
    }
    if let Some(kind) = code.packed_kind {
        out.push(u8::from(kind));
    }
    if let Some(kind) = code.reserve_kind {
        out.push(u8::from(kind));
    }
    if let Some(kind) = code.sub_range_kind {
        out.push(u8::from(kind));
    }
    if let Some(id) = code.fallback {
        write_varint(out, id.0)?;
    }
    if let Some(metadata) = &code.metadata {
        write_varint(out, metadata.name.0)?;
        write_varint(out, metadata.refs.len() as u64)?;
        for r in &metadata.refs {
            write_varint(out, r.0)?;
        }
    }
    if let Some(params) = &code.params {
        write_varint(out, params.len() as u64)?;
        for p in params {
            write_varint(out, p.0)?;
        }
    }
    if let Some(phi_params) = &code.phi_params {
        write_varint(out, phi_params.len() as u64)?;
        for p in phi_params {
            write_varint(out, p.condition.0)?;
            write_varint(out, p.assign.0)?;
        }
    }
    if let Some(flags) = code.encode_flags {
        out.push(flags.0);
    }
    if let Some(flags) = code.decode_flags {
        out.push(flags.0);
    }
    if let Some(id) = code.string_ref {
        write_varint(out, id.0)?;
    }
    Ok(())
}

fn read_u8(input: &[u8], pos: &mut usize) -> Result<u8, CoreError> {
    let byte = *input
        .get(*pos)
        .ok_or(CoreError::UnexpectedEof { offset: *pos })?;
    *pos += 1;
    Ok(byte)
}

fn read_enum_u8<T: TryFrom<u8>>(
    input: &[u8],
    pos: &mut usize,
    kind: &'static str,
) -> Result<T, CoreError> {
    let tag = read_u8(input, pos)?;
    T::try_from(tag).map_err(|_| CoreError::UnknownTag {
        kind,
        tag: tag as u64,
    })
}

fn read_code(input: &[u8], pos: &mut usize) -> Result<Code, CoreError> {
    if *pos + 2 > input.len() {
        return Err(CoreError::UnexpectedEof { offset: *pos });
    }
    let tag = u16::from_be_bytes([input[*pos], input[*pos + 1]]);
    *pos += 2;
    let op = AbstractOp::try_from(tag).map_err(|_| CoreError::UnknownTag {
        kind: "opcode",
        tag: tag as u64,
    })?;
    let bits = read_varint(input, pos)? as u32;
    let mut code = Code::new(op);

    if bits & F_IDENT != 0 {
        code.ident = Some(ObjectId(read_varint(input, pos)?));
    }
    if bits & F_REF != 0 {
        code.ref_id = Some(ObjectId(read_varint(input, pos)?));
    }
    if bits & F_LEFT != 0 {
        code.left = Some(ObjectId(read_varint(input, pos)?));
    }
    if bits & F_RIGHT != 0 {
        code.right = Some(ObjectId(read_varint(input, pos)?));
    }
    if bits & F_BELONG != 0 {
        code.belong = Some(ObjectId(read_varint(input, pos)?));
    }
    if bits & F_BIN_OP != 0 {
        code.bin_op = Some(read_enum_u8::<BinaryOp>(input, pos, "binary op")?);
    }
    if bits & F_UN_OP != 0 {
        code.un_op = Some(read_enum_u8::<UnaryOp>(input, pos, "unary op")?);
    }
    if bits & F_TY != 0 {
        code.ty = Some(StorageRef(read_varint(input, pos)?));
    }
    if bits & F_FROM_TY != 0 {
        code.from_ty = Some(StorageRef(read_varint(input, pos)?));
    }
    if bits & F_CAST != 0 {
        code.cast_kind = Some(read_enum_u8::<CastType>(input, pos, "cast type")?);
    }
    if bits & F_INT != 0 {
        code.int_value = Some(read_varint(input, pos)?);
    }
    if bits & F_INT64 != 0 {
        if *pos + 8 > input.len() {
            return Err(CoreError::UnexpectedEof { offset: *pos });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&input[*pos..*pos + 8]);
        *pos += 8;
        code.int_value64 = Some(u64::from_be_bytes(bytes));
    }
    if bits & F_BIT_SIZE != 0 {
        code.bit_size = Some(read_varint(input, pos)?);
    }
    if bits & F_BIT_SIZE_PLUS != 0 {
        code.bit_size_plus = Some(read_varint(input, pos)?);
    }
    if bits & F_ARRAY_LEN != 0 {
        code.array_length = Some(read_varint(input, pos)?);
    }
    if bits & F_ENDIAN != 0 {
        let packed = read_u8(input, pos)?;
        let endian = Endian::try_from(packed & 0x0f).map_err(|_| CoreError::UnknownTag {
            kind: "endian",
            tag: (packed & 0x0f) as u64,
        })?;
        let dynamic_ref = ObjectId(read_varint(input, pos)?);
        code.endian = Some(EndianExpr {
            endian,
            signed: packed & 0x10 != 0,
            dynamic_ref,
        });
    }
    if bits & F_FUNC_KIND != 0 {
        code.func_kind = Some(read_enum_u8::<FunctionKind>(input, pos, "function kind")?);
    }
    if bits & F_MERGE_MODE != 0 {
        code.merge_mode = Some(read_enum_u8::<MergeMode>(input, pos, "merge mode")?);
    }
    if bits & F_CHECK_AT != 0 {
        code.check_at = Some(read_enum_u8::<UnionCheckAt>(input, pos, "union check")?);
    }
    if bits & F_PACKED != 0 {
        code.packed_kind = Some(read_enum_u8::<PackedOpType>(input, pos, "packed op type")?);
    }
    if bits & F_RESERVE != 0 {
        code.reserve_kind = Some(read_enum_u8::<ReserveType>(input, pos, "reserve type")?);
    }
    if bits & F_SUB_RANGE != 0 {
        code.sub_range_kind = Some(read_enum_u8::<SubRangeType>(input, pos, "sub range type")?);
    }
    if bits & F_FALLBACK != 0 {
        code.fallback = Some(ObjectId(read_varint(input, pos)?));
    }
    if bits & F_METADATA != 0 {
        let name = ObjectId(read_varint(input, pos)?);
        let count = read_varint(input, pos)?;
        let mut refs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            refs.push(ObjectId(read_varint(input, pos)?));
        }
        code.metadata = Some(MetadataRef { name, refs });
    }
    if bits & F_PARAMS != 0 {
        let count = read_varint(input, pos)?;
        let mut params = Vec::with_capacity(count as usize);
        for _ in 0..count {
            params.push(ObjectId(read_varint(input, pos)?));
        }
        code.params = Some(params);
    }
    if bits & F_PHI_PARAMS != 0 {
        let count = read_varint(input, pos)?;
        let mut phi_params = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let condition = ObjectId(read_varint(input, pos)?);
            let assign = ObjectId(read_varint(input, pos)?);
            phi_params.push(PhiParam { condition, assign });
        }
        code.phi_params = Some(phi_params);
    }
    if bits & F_ENCODE_FLAGS != 0 {
        code.encode_flags = Some(EncodeFlags(read_u8(input, pos)?));
    }
    if bits & F_DECODE_FLAGS != 0 {
        code.decode_flags = Some(DecodeFlags(read_u8(input, pos)?));
    }
    if bits & F_STRING_REF != 0 {
        code.string_ref = Some(ObjectId(read_varint(input, pos)?));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn sample_module() -> Module {
        let mut m = Module::new();
        let fmt = m.new_named_id("Packet");
        let field = m.new_named_id("length");
        let u16_ty = m.get_storage_ref(Storages::uint(16));
        let fmt_ty = m.get_storage_ref(Storages::single(Storage::referencing(
            StorageType::StructRef,
            fmt,
        )));
        m.intern_string("magic");
        m.intern_metadata("config.word.size");

        m.op_with(AbstractOp::DefineFormat, |c| {
            c.ident = Some(fmt);
            c.ty = Some(fmt_ty);
        });
        m.op_with(AbstractOp::DefineField, |c| {
            c.ident = Some(field);
            c.belong = Some(fmt);
            c.ty = Some(u16_ty);
        });
        m.op_with(AbstractOp::EncodeInt, |c| {
            c.ref_id = Some(field);
            c.endian = Some(EndianExpr::new(Endian::Big, false));
            c.bit_size = Some(16);
            c.belong = Some(field);
        });
        m.op_with(AbstractOp::Phi, |c| {
            c.ident = Some(ObjectId(40));
            c.ref_id = Some(field);
            c.phi_params = Some(vec![
                PhiParam {
                    condition: ObjectId(10),
                    assign: ObjectId(11),
                },
                PhiParam {
                    condition: ObjectId::NONE,
                    assign: ObjectId(12),
                },
            ]);
        });
        m.op_with(AbstractOp::ImmediateInt64, |c| {
            c.ident = Some(ObjectId(41));
            c.int_value64 = Some(u64::MAX - 3);
        });
        m.op(AbstractOp::EndFormat);

        m.ident_to_ranges.push(IdentRange {
            ident: fmt,
            range: Range { start: 0, end: 6 },
        });
        m.programs.push(Range { start: 0, end: 6 });
        m.rebind_ident_index();
        m
    }

    #[test]
    fn save_load_roundtrip_is_byte_identical() {
        let m = sample_module();
        let bytes = save(&m).unwrap();
        let reloaded = load(&bytes).unwrap();
        let bytes2 = save(&reloaded).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn load_restores_tables_and_code() {
        let m = sample_module();
        let bytes = save(&m).unwrap();
        let reloaded = load(&bytes).unwrap();

        assert_eq!(reloaded.ident_table, m.ident_table);
        assert_eq!(reloaded.string_table, m.string_table);
        assert_eq!(reloaded.metadata_table, m.metadata_table);
        assert_eq!(reloaded.storage_table, m.storage_table);
        assert_eq!(reloaded.code, m.code);
        assert_eq!(reloaded.ident_to_ranges, m.ident_to_ranges);
        assert_eq!(reloaded.programs, m.programs);
    }

    #[test]
    fn load_rebinds_ident_index() {
        let m = sample_module();
        let bytes = save(&m).unwrap();
        let reloaded = load(&bytes).unwrap();
        for (i, code) in reloaded.code.iter().enumerate() {
            if let Some(ident) = code.ident {
                assert_eq!(reloaded.ident_index(ident).unwrap(), i);
            }
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = load(b"NOPE\x81");
        assert!(matches!(err, Err(CoreError::InvalidHeader { .. })));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        write_varint(&mut bytes, 99).unwrap();
        assert!(matches!(
            load(&bytes),
            Err(CoreError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn truncated_code_section_is_rejected() {
        let m = sample_module();
        let bytes = save(&m).unwrap();
        let err = load(&bytes[..bytes.len() - 3]);
        assert!(err.is_err());
    }

    #[test]
    fn empty_module_roundtrips() {
        let m = Module::new();
        let bytes = save(&m).unwrap();
        let reloaded = load(&bytes).unwrap();
        assert!(reloaded.code.is_empty());
        assert_eq!(save(&reloaded).unwrap(), bytes);
    }
}
