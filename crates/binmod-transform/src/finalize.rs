//! Layout finalization: function placement, immediate hoisting, range
//! tables, program remapping, and storage-ref renumbering.

use indexmap::IndexMap;

use binmod_core::{
    AbstractOp, Code, IdentRange, Module, ObjectId, Range, StorageRef,
};

use crate::error::TransformError;

/// Moves every hoisted function block directly after the definition of
/// the format it belongs to, keeping per-format function order.
pub fn sort_functions_into_formats(m: &mut Module) -> Result<(), TransformError> {
    // format ident -> its END_FORMAT index is recomputed after each move,
    // so walk repeatedly until no function block is out of place.
    loop {
        let mut moved = false;
        let mut depth = 0usize;
        let mut function_start = None;
        for i in 0..m.code.len() {
            let op = m.code[i].op;
            if op == AbstractOp::DefineFunction && depth == 0 {
                function_start = Some(i);
            }
            if op.end_op().is_some() {
                depth += 1;
            } else if is_block_end(op) {
                depth = depth.saturating_sub(1);
                if depth == 0 && op == AbstractOp::EndFunction {
                    let start = function_start.take().ok_or_else(|| {
                        TransformError::inconsistent("function end without a start")
                    })?;
                    let belong = m.code[start].belong.unwrap_or(ObjectId::NONE);
                    if let Some(anchor) = format_block_end(m, belong) {
                        if anchor + 1 != start && anchor < start {
                            let block: Vec<Code> = m.code.drain(start..=i).collect();
                            let insert_at = anchor + 1;
                            for (offset, code) in block.into_iter().enumerate() {
                                m.code.insert(insert_at + offset, code);
                            }
                            m.rebind_ident_index();
                            moved = true;
                            break;
                        }
                    }
                }
            }
        }
        if !moved {
            return Ok(());
        }
    }
}

fn is_block_end(op: AbstractOp) -> bool {
    matches!(
        op,
        AbstractOp::EndProgram
            | AbstractOp::EndFormat
            | AbstractOp::EndEnum
            | AbstractOp::EndState
            | AbstractOp::EndUnion
            | AbstractOp::EndUnionMember
            | AbstractOp::EndBitField
            | AbstractOp::EndProperty
            | AbstractOp::EndFunction
            | AbstractOp::EndFallback
    )
}

/// Index of the `END_FORMAT` closing the given format's top-level block,
/// extended over any function blocks already moved behind it.
fn format_block_end(m: &Module, format: ObjectId) -> Option<usize> {
    if format.is_none() {
        return None;
    }
    let start = *m.ident_index_table.get(&format)?;
    if m.code[start].op != AbstractOp::DefineFormat {
        return None;
    }
    let mut depth = 0usize;
    let mut end = None;
    for (i, code) in m.code.iter().enumerate().skip(start) {
        if code.op.end_op().is_some() {
            depth += 1;
        } else if is_block_end(code.op) {
            depth -= 1;
            if depth == 0 {
                end = Some(i);
                break;
            }
        }
    }
    let mut end = end?;
    // skip function blocks already parked after this format
    while end + 1 < m.code.len() && m.code[end + 1].op == AbstractOp::DefineFunction {
        if m.code[end + 1].belong != Some(format) {
            break;
        }
        let mut depth = 0usize;
        for (i, code) in m.code.iter().enumerate().skip(end + 1) {
            if code.op.end_op().is_some() {
                depth += 1;
            } else if is_block_end(code.op) {
                depth -= 1;
                if depth == 0 {
                    end = i;
                    break;
                }
            }
        }
    }
    Some(end)
}

/// Moves every integer immediate to the front of the stream, preserving
/// relative order, so back-ends see constants before uses.
pub fn sort_immediates(m: &mut Module) -> Result<(), TransformError> {
    let mut immediates = Vec::new();
    let mut rest = Vec::with_capacity(m.code.len());
    for code in m.code.drain(..) {
        if matches!(
            code.op,
            AbstractOp::ImmediateInt | AbstractOp::ImmediateInt64
        ) {
            immediates.push(code);
        } else {
            rest.push(code);
        }
    }
    immediates.extend(rest);
    m.code = immediates;
    Ok(())
}

/// Records the opcode extent of every ranged definition, in start order.
pub fn add_ident_ranges(m: &mut Module) -> Result<(), TransformError> {
    m.ident_to_ranges.clear();
    let mut stack: Vec<(ObjectId, usize, AbstractOp)> = Vec::new();
    let mut rows: Vec<IdentRange> = Vec::new();
    for (i, code) in m.code.iter().enumerate() {
        if let Some(end_op) = code.op.end_op() {
            stack.push((code.require_ident()?, i, end_op));
        } else if is_block_end(code.op) {
            let (ident, start, expected) = stack.pop().ok_or_else(|| {
                TransformError::inconsistent(format!(
                    "unbalanced {:?} at {}",
                    code.op, i
                ))
            })?;
            if code.op != expected {
                return Err(TransformError::inconsistent(format!(
                    "expected {:?} at {}, found {:?}",
                    expected, i, code.op
                )));
            }
            rows.push(IdentRange {
                ident,
                range: Range {
                    start: start as u64,
                    end: i as u64 + 1,
                },
            });
        }
    }
    if !stack.is_empty() {
        return Err(TransformError::inconsistent(
            "unterminated definition at end of stream",
        ));
    }
    rows.sort_by_key(|r| r.range.start);
    m.ident_to_ranges = rows;
    Ok(())
}

/// Rebuilds the program table from the range rows whose start opcode is a
/// program definition.
pub fn remap_programs(m: &mut Module) -> Result<(), TransformError> {
    m.programs.clear();
    for row in &m.ident_to_ranges {
        let index = row.range.start as usize;
        if m.code
            .get(index)
            .map(|c| c.op == AbstractOp::DefineProgram)
            .unwrap_or(false)
        {
            m.programs.push(row.range);
        }
    }
    Ok(())
}

/// Renumbers storage refs so the most-used shapes get the smallest
/// numbers, which packs tighter at serialization time. Ties break on the
/// old ref so the result is deterministic; unreferenced shapes are
/// dropped.
pub fn optimize_type_usage(m: &mut Module) -> Result<(), TransformError> {
    let mut usage: IndexMap<StorageRef, u64> = IndexMap::new();
    for code in &m.code {
        for ty in [code.ty, code.from_ty].into_iter().flatten() {
            if ty.is_none() {
                continue;
            }
            *usage.entry(ty).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(StorageRef, u64)> = usage.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut mapping: IndexMap<StorageRef, StorageRef> = IndexMap::new();
    let mut new_key_table = IndexMap::new();
    let mut new_table = IndexMap::new();
    for (next, (old, _)) in ranked.into_iter().enumerate() {
        let renumbered = StorageRef(next as u64 + 1);
        let shape = m.get_storage(old)?.clone();
        new_key_table.insert(shape.key(), renumbered);
        new_table.insert(renumbered, shape);
        mapping.insert(old, renumbered);
    }
    for code in &mut m.code {
        if let Some(ty) = code.ty {
            if let Some(&renumbered) = mapping.get(&ty) {
                code.ty = Some(renumbered);
            }
        }
        if let Some(ty) = code.from_ty {
            if let Some(&renumbered) = mapping.get(&ty) {
                code.from_ty = Some(renumbered);
            }
        }
    }
    m.replace_storage_tables(new_key_table, new_table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_core::Storages;

    #[test]
    fn immediates_move_to_front_in_order() {
        let mut m = Module::new();
        let a = m.new_id();
        let b = m.new_id();
        m.code.push(Code::new(AbstractOp::DefineProgram));
        m.code[0].ident = Some(m.new_id());
        let mut ia = Code::new(AbstractOp::ImmediateInt);
        ia.ident = Some(a);
        ia.int_value = Some(1);
        m.code.push(ia);
        m.code.push(Code::new(AbstractOp::EndProgram));
        let mut ib = Code::new(AbstractOp::ImmediateInt64);
        ib.ident = Some(b);
        ib.int_value64 = Some(2);
        m.code.push(ib);

        sort_immediates(&mut m).unwrap();
        assert_eq!(m.code[0].ident, Some(a));
        assert_eq!(m.code[1].ident, Some(b));
        assert_eq!(m.code[2].op, AbstractOp::DefineProgram);
    }

    #[test]
    fn ident_ranges_cover_nested_definitions() {
        let mut m = Module::new();
        let program = m.new_id();
        let format = m.new_id();
        let mut dp = Code::new(AbstractOp::DefineProgram);
        dp.ident = Some(program);
        m.code.push(dp);
        let mut df = Code::new(AbstractOp::DefineFormat);
        df.ident = Some(format);
        m.code.push(df);
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(Code::new(AbstractOp::EndProgram));

        add_ident_ranges(&mut m).unwrap();
        assert_eq!(m.ident_to_ranges.len(), 2);
        assert_eq!(m.ident_to_ranges[0].ident, program);
        assert_eq!(m.ident_to_ranges[0].range, Range { start: 0, end: 4 });
        assert_eq!(m.ident_to_ranges[1].ident, format);
        assert_eq!(m.ident_to_ranges[1].range, Range { start: 1, end: 3 });
    }

    #[test]
    fn unbalanced_definitions_are_rejected() {
        let mut m = Module::new();
        let mut df = Code::new(AbstractOp::DefineFormat);
        df.ident = Some(m.new_id());
        m.code.push(df);
        assert!(add_ident_ranges(&mut m).is_err());
    }

    #[test]
    fn programs_rebuilt_from_ranges() {
        let mut m = Module::new();
        let program = m.new_id();
        let mut dp = Code::new(AbstractOp::DefineProgram);
        dp.ident = Some(program);
        m.code.push(dp);
        m.code.push(Code::new(AbstractOp::EndProgram));
        add_ident_ranges(&mut m).unwrap();
        remap_programs(&mut m).unwrap();
        assert_eq!(m.programs, vec![Range { start: 0, end: 2 }]);
    }

    #[test]
    fn most_used_storage_gets_the_smallest_ref() {
        let mut m = Module::new();
        let rare = m.get_storage_ref(Storages::uint(32));
        let common = m.get_storage_ref(Storages::uint(8));
        for _ in 0..3 {
            let mut c = Code::new(AbstractOp::DefineField);
            c.ident = Some(m.new_id());
            c.ty = Some(common);
            m.code.push(c);
        }
        let mut c = Code::new(AbstractOp::DefineField);
        c.ident = Some(m.new_id());
        c.ty = Some(rare);
        m.code.push(c);

        optimize_type_usage(&mut m).unwrap();
        // the u8 shape is now ref 1, u32 ref 2
        assert_eq!(
            m.get_storage(StorageRef(1)).unwrap(),
            &Storages::uint(8)
        );
        assert_eq!(
            m.get_storage(StorageRef(2)).unwrap(),
            &Storages::uint(32)
        );
        for code in &m.code[..3] {
            assert_eq!(code.ty, Some(StorageRef(1)));
        }
        assert_eq!(m.code[3].ty, Some(StorageRef(2)));
    }

    #[test]
    fn unused_storages_are_dropped() {
        let mut m = Module::new();
        let used = m.get_storage_ref(Storages::uint(8));
        let _unused = m.get_storage_ref(Storages::uint(16));
        let mut c = Code::new(AbstractOp::DefineField);
        c.ident = Some(m.new_id());
        c.ty = Some(used);
        m.code.push(c);
        optimize_type_usage(&mut m).unwrap();
        assert_eq!(m.storage_table.len(), 1);
    }

    #[test]
    fn function_blocks_move_after_their_format() {
        let mut m = Module::new();
        let format = m.new_id();
        let function = m.new_id();
        let mut df = Code::new(AbstractOp::DefineFormat);
        df.ident = Some(format);
        m.code.push(df);
        m.code.push(Code::new(AbstractOp::EndFormat));
        let mut other = Code::new(AbstractOp::DefineEnum);
        other.ident = Some(m.new_id());
        m.code.push(other);
        m.code.push(Code::new(AbstractOp::EndEnum));
        let mut f = Code::new(AbstractOp::DefineFunction);
        f.ident = Some(function);
        f.belong = Some(format);
        m.code.push(f);
        m.code.push(Code::new(AbstractOp::EndFunction));
        m.rebind_ident_index();

        sort_functions_into_formats(&mut m).unwrap();
        let ops: Vec<AbstractOp> = m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::DefineFormat,
                AbstractOp::EndFormat,
                AbstractOp::DefineFunction,
                AbstractOp::EndFunction,
                AbstractOp::DefineEnum,
                AbstractOp::EndEnum,
            ]
        );
    }
}
