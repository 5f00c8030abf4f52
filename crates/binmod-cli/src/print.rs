//! Textual dump of a binary module.
//!
//! Renders the side tables and the opcode stream with two-space
//! indentation driven by block begin/end opcodes, resolving references
//! against the identifier, string, and metadata tables where possible.

use std::fmt::Write;

use binmod_core::{Code, Module, ObjectId, StorageRef, StorageType};

fn push_ref(out: &mut String, m: &Module, r: ObjectId) {
    if r.is_none() {
        out.push_str(" (no ref)");
        return;
    }
    let mut named = false;
    if let Some(&index) = m.ident_index_table.get(&r) {
        let mut op_name = format!("{:?}", m.code[index].op);
        if let Some(stripped) = op_name.strip_prefix("Define") {
            op_name = stripped.to_string();
        }
        write!(out, " {}", op_name).expect("string write");
        named = true;
    }
    if let Some(name) = m.ident_table.get(&r) {
        write!(out, " {}", name).expect("string write");
        named = true;
    }
    if let Some(value) = m.string_for(r) {
        write!(out, " {:?}", value).expect("string write");
        named = true;
    }
    if named {
        write!(out, "({})", r).expect("string write");
    } else {
        write!(out, " {}", r).expect("string write");
    }
}

fn push_type(out: &mut String, m: &Module, ty: StorageRef) {
    if ty.is_none() {
        out.push_str("(no type)");
        return;
    }
    write!(out, "type {} (", ty).expect("string write");
    match m.get_storage(ty) {
        Ok(shape) => {
            for storage in &shape.storages {
                write!(out, " {:?}", storage.kind).expect("string write");
                if storage.kind.has_size() {
                    match storage.kind {
                        StorageType::Array => {
                            write!(out, " length:{}", storage.size).expect("string write")
                        }
                        StorageType::Variant => {
                            write!(out, " alternatives:{}", storage.size).expect("string write")
                        }
                        StorageType::StructRef => {
                            if storage.size == 0 {
                                out.push_str(" size:(variable)");
                            } else {
                                write!(out, " size:{}bit", storage.size - 1)
                                    .expect("string write");
                            }
                        }
                        _ => write!(out, " size:{}bit", storage.size).expect("string write"),
                    }
                }
                if storage.kind.has_ref() {
                    push_ref(out, m, storage.ref_id);
                }
            }
        }
        Err(_) => out.push_str(" (unknown storage)"),
    }
    out.push_str(" )");
}

fn push_code(out: &mut String, m: &Module, code: &Code) {
    write!(out, "{:?}", code.op).expect("string write");
    if let Some(op) = code.un_op {
        write!(out, " {:?}", op).expect("string write");
    }
    if let Some(belong) = code.belong {
        push_ref(out, m, belong);
    }
    if let Some(ident) = code.ident {
        write!(out, " {}", ident).expect("string write");
        if let Some(name) = m.ident_table.get(&ident) {
            write!(out, "({})", name).expect("string write");
        }
    }
    if let Some(r) = code.ref_id {
        push_ref(out, m, r);
    }
    if let Some(left) = code.left {
        push_ref(out, m, left);
    }
    if let Some(op) = code.bin_op {
        write!(out, " {}", op.symbol()).expect("string write");
    }
    if let Some(right) = code.right {
        push_ref(out, m, right);
    }
    if let Some(v) = code.int_value {
        write!(out, " {}", v).expect("string write");
    }
    if let Some(v) = code.int_value64 {
        write!(out, " {}", v).expect("string write");
    }
    if let Some(mode) = code.merge_mode {
        write!(out, " {:?}", mode).expect("string write");
    }
    if let Some(kind) = code.packed_kind {
        write!(out, " {:?}", kind).expect("string write");
    }
    if let Some(at) = code.check_at {
        write!(out, " {:?}", at).expect("string write");
    }
    if let Some(kind) = code.func_kind {
        write!(out, " {:?}", kind).expect("string write");
    }
    if let Some(n) = code.array_length {
        write!(out, " {} elements", n).expect("string write");
    }
    if let Some(bits) = code.bit_size {
        write!(out, " {}bit", bits).expect("string write");
    }
    if let Some(plus) = code.bit_size_plus {
        if plus == 0 {
            out.push_str(" (variable)");
        } else {
            write!(out, " {}bit", plus - 1).expect("string write");
        }
    }
    if let Some(ty) = code.ty {
        out.push(' ');
        push_type(out, m, ty);
    }
    if let Some(ty) = code.from_ty {
        out.push(' ');
        push_type(out, m, ty);
    }
    if let Some(kind) = code.cast_kind {
        write!(out, " {:?}", kind).expect("string write");
    }
    if let Some(kind) = code.reserve_kind {
        write!(out, " {:?}", kind).expect("string write");
    }
    if let Some(kind) = code.sub_range_kind {
        write!(out, " {:?}", kind).expect("string write");
    }
    if let Some(endian) = code.endian {
        write!(
            out,
            " {:?} {}",
            endian.endian,
            if endian.signed { "signed" } else { "unsigned" }
        )
        .expect("string write");
        if endian.dynamic_ref.is_some() {
            push_ref(out, m, endian.dynamic_ref);
        }
    }
    if let Some(metadata) = &code.metadata {
        push_ref(out, m, metadata.name);
        for r in &metadata.refs {
            push_ref(out, m, *r);
        }
    }
    if let Some(params) = &code.params {
        out.push_str(" (");
        for (i, p) in params.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_ref(out, m, *p);
        }
        out.push_str(" )");
    }
    if let Some(phi_params) = &code.phi_params {
        out.push_str(" (");
        for (i, p) in phi_params.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_ref(out, m, p.condition);
            out.push(':');
            push_ref(out, m, p.assign);
        }
        out.push_str(" )");
    }
    if let Some(flags) = code.encode_flags {
        out.push_str(" (");
        if flags.has_seek() {
            out.push_str("seek");
        }
        if flags.has_sub_range() {
            out.push_str(" sub_range");
        }
        out.push_str(" )");
    }
    if let Some(flags) = code.decode_flags {
        out.push_str(" (");
        let mut parts = Vec::new();
        if flags.has_eof() {
            parts.push("eof");
        }
        if flags.has_peek() {
            parts.push("peek");
        }
        if flags.has_seek() {
            parts.push("seek");
        }
        if flags.has_remain_bytes() {
            parts.push("remain_bytes");
        }
        if flags.has_sub_range() {
            parts.push("sub_range");
        }
        out.push_str(&parts.join(","));
        out.push_str(" )");
    }
    if let Some(fallback) = code.fallback {
        push_ref(out, m, fallback);
    }
}

/// The full textual dump: metadata, strings, identifiers, storages, and
/// the indented opcode stream.
pub fn render_module(m: &Module) -> String {
    let mut out = String::new();
    for (name, id) in &m.metadata_table {
        writeln!(out, "metadata {} {}", name, id).expect("string write");
    }
    for (value, id) in &m.string_table {
        writeln!(out, "string {:?} {}", value, id).expect("string write");
    }
    for (id, name) in &m.ident_table {
        write!(out, "ident {} {}", name, id).expect("string write");
        if let Some(&index) = m.ident_index_table.get(id) {
            write!(out, " {:?}", m.code[index].op).expect("string write");
        }
        out.push('\n');
    }
    for (&ty, _) in &m.storage_table {
        let mut line = String::new();
        push_type(&mut line, m, ty);
        writeln!(out, "{}", line).expect("string write");
    }
    let mut indent = 0usize;
    for code in &m.code {
        if code.op.closes_indent() {
            indent = indent.saturating_sub(1);
        }
        let mut line = String::new();
        push_code(&mut line, m, code);
        writeln!(out, "{}{}", "  ".repeat(indent), line).expect("string write");
        if code.op.opens_indent() {
            indent += 1;
        }
    }
    out
}

/// Only the opcode names, one per line.
pub fn render_ops_only(m: &Module) -> String {
    let mut out = String::new();
    for code in &m.code {
        writeln!(out, "{:?}", code.op).expect("string write");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_core::{AbstractOp, EndianExpr, Storages};

    fn sample() -> Module {
        let mut m = Module::new();
        let fmt = m.new_named_id("Packet");
        let field = m.new_named_id("length");
        let u16_ref = m.get_storage_ref(Storages::uint(16));
        m.op_with(AbstractOp::DefineFormat, |c| c.ident = Some(fmt));
        m.op_with(AbstractOp::DefineField, |c| {
            c.ident = Some(field);
            c.belong = Some(fmt);
            c.ty = Some(u16_ref);
        });
        m.op_with(AbstractOp::EncodeInt, |c| {
            c.ref_id = Some(field);
            c.endian = Some(EndianExpr::new(binmod_core::Endian::Big, false));
            c.bit_size = Some(16);
            c.belong = Some(field);
        });
        m.op(AbstractOp::EndFormat);
        m.rebind_ident_index();
        m
    }

    #[test]
    fn dump_contains_idents_and_ops() {
        let text = render_module(&sample());
        assert!(text.contains("ident Packet"));
        assert!(text.contains("DefineFormat"));
        assert!(text.contains("EncodeInt"));
        assert!(text.contains("16bit"));
        assert!(text.contains("Big unsigned"));
    }

    #[test]
    fn dump_indents_format_body() {
        let text = render_module(&sample());
        let field_line = text
            .lines()
            .find(|l| l.trim_start().starts_with("DefineField"))
            .unwrap();
        assert!(field_line.starts_with("  "));
        let end_line = text
            .lines()
            .find(|l| l.trim_start().starts_with("EndFormat"))
            .unwrap();
        assert!(!end_line.starts_with("  "));
    }

    #[test]
    fn ops_only_lists_one_per_line() {
        let text = render_ops_only(&sample());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["DefineFormat", "DefineField", "EncodeInt", "EndFormat"]
        );
    }
}
