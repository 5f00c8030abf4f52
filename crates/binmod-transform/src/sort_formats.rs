//! Format dependency sort.
//!
//! Top-level format, enum, and state definitions are reordered so that a
//! definition whose fields reference another definition comes after it.
//! Dependencies are read off the storage shapes of the contained opcodes;
//! `RECURSIVE_STRUCT_REF` edges are the sanctioned cycle edges and are
//! skipped. Declare stubs at the top of each program are reordered to
//! match. Ties keep the original order, so the result is deterministic.

use std::collections::HashMap;

use binmod_core::{AbstractOp, Code, Module, ObjectId, StorageType};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;

use crate::error::TransformError;

/// A contiguous top-level span of code.
struct Block {
    start: usize,
    end: usize,
    ident: Option<ObjectId>,
    sortable: bool,
}

fn top_level_blocks(m: &Module) -> Result<Vec<Block>, TransformError> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < m.code.len() {
        let op = m.code[i].op;
        match op.end_op() {
            Some(close) => {
                let mut depth = 0usize;
                let mut j = i;
                loop {
                    if j >= m.code.len() {
                        return Err(TransformError::inconsistent(format!(
                            "unterminated {:?} at {}",
                            op, i
                        )));
                    }
                    if m.code[j].op == op {
                        depth += 1;
                    } else if m.code[j].op == close {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    j += 1;
                }
                blocks.push(Block {
                    start: i,
                    end: j,
                    ident: m.code[i].ident,
                    sortable: matches!(
                        op,
                        AbstractOp::DefineFormat
                            | AbstractOp::DefineEnum
                            | AbstractOp::DefineState
                    ),
                });
                i = j + 1;
            }
            None => {
                blocks.push(Block {
                    start: i,
                    end: i,
                    ident: m.code[i].ident,
                    sortable: false,
                });
                i += 1;
            }
        }
    }
    Ok(blocks)
}

/// Definition idents referenced by the storage shapes inside a span.
fn span_dependencies(m: &Module, start: usize, end: usize) -> Vec<ObjectId> {
    let mut deps = Vec::new();
    for code in &m.code[start..=end] {
        for ty in [code.ty, code.from_ty].into_iter().flatten() {
            if let Ok(shape) = m.get_storage(ty) {
                for storage in &shape.storages {
                    let referencing = matches!(
                        storage.kind,
                        StorageType::StructRef | StorageType::Enum | StorageType::Variant
                    );
                    if referencing && storage.ref_id.is_some() && !deps.contains(&storage.ref_id)
                    {
                        deps.push(storage.ref_id);
                    }
                }
            }
        }
    }
    deps
}

pub fn sort_formats(m: &mut Module) -> Result<(), TransformError> {
    let blocks = top_level_blocks(m)?;
    let sortable: Vec<usize> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| b.sortable)
        .map(|(i, _)| i)
        .collect();
    if sortable.len() < 2 {
        return Ok(());
    }

    let mut by_ident: HashMap<ObjectId, usize> = HashMap::new();
    for &bi in &sortable {
        if let Some(ident) = blocks[bi].ident {
            by_ident.insert(ident, bi);
        }
    }

    // dependency -> dependent edges, so a DFS post-order visits
    // dependencies first
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut node_of: HashMap<usize, NodeIndex> = HashMap::new();
    for &bi in &sortable {
        node_of.insert(bi, graph.add_node(bi));
    }
    for &bi in &sortable {
        for dep in span_dependencies(m, blocks[bi].start, blocks[bi].end) {
            if let Some(&dep_block) = by_ident.get(&dep) {
                if dep_block != bi {
                    graph.add_edge(node_of[&dep_block], node_of[&bi], ());
                }
            }
        }
    }

    // Deterministic order: post-order DFS from each block in original
    // order over reversed edges yields dependencies before dependents.
    let reversed = petgraph::visit::Reversed(&graph);
    let mut order: Vec<usize> = Vec::with_capacity(sortable.len());
    let mut dfs = DfsPostOrder::empty(reversed);
    for &bi in &sortable {
        dfs.move_to(node_of[&bi]);
        while let Some(node) = dfs.next(reversed) {
            order.push(graph[node]);
        }
    }

    // Rebuild: sortable slots receive blocks in the computed order;
    // everything else stays put.
    let mut sorted_iter = order.into_iter();
    let mut new_code: Vec<Code> = Vec::with_capacity(m.code.len());
    let mut new_sequence: Vec<ObjectId> = Vec::new();
    for block in &blocks {
        if block.sortable {
            let source = sorted_iter.next().ok_or_else(|| {
                TransformError::inconsistent("dependency sort lost a block")
            })?;
            let source = &blocks[source];
            if let Some(ident) = source.ident {
                new_sequence.push(ident);
            }
            new_code.extend(m.code[source.start..=source.end].iter().cloned());
        } else {
            new_code.extend(m.code[block.start..=block.end].iter().cloned());
        }
    }
    m.code = new_code;

    reorder_declares(m, &new_sequence);
    Ok(())
}

/// Rewrites the top declare stubs of each program so they list the sorted
/// definitions in their new order.
fn reorder_declares(m: &mut Module, sequence: &[ObjectId]) {
    let declare_ops = [
        AbstractOp::DeclareFormat,
        AbstractOp::DeclareEnum,
        AbstractOp::DeclareState,
    ];
    let positions: Vec<usize> = m
        .code
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            declare_ops.contains(&c.op)
                && c.ref_id.map(|r| sequence.contains(&r)).unwrap_or(false)
        })
        .map(|(i, _)| i)
        .collect();
    if positions.len() < 2 {
        return;
    }
    let mut stubs: Vec<Code> = Vec::with_capacity(positions.len());
    for &ident in sequence {
        if let Some(code) = m
            .code
            .iter()
            .find(|c| declare_ops.contains(&c.op) && c.ref_id == Some(ident))
        {
            stubs.push(code.clone());
        }
    }
    for (&pos, stub) in positions.iter().zip(stubs) {
        m.code[pos] = stub;
    }
}
