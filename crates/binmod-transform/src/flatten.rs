//! Flatten pass: hoist nested definitions to the top level.
//!
//! Whenever a format, enum, state, union, union member, bit field, or
//! function definition is nested inside another definition, its whole
//! `DEFINE_X .. END_X` span is moved to the end of the module and a
//! `DECLARE_X ref=<moved ident>` stub is left in its place. Stubs keep
//! the textual order of the original definitions.

use binmod_core::{AbstractOp, Code, Module};

use crate::error::TransformError;

/// The definitions the pass hoists, paired with their declare stubs.
fn declare_op_for(op: AbstractOp) -> Option<AbstractOp> {
    Some(match op {
        AbstractOp::DefineFormat => AbstractOp::DeclareFormat,
        AbstractOp::DefineEnum => AbstractOp::DeclareEnum,
        AbstractOp::DefineState => AbstractOp::DeclareState,
        AbstractOp::DefineUnion => AbstractOp::DeclareUnion,
        AbstractOp::DefineUnionMember => AbstractOp::DeclareUnionMember,
        AbstractOp::DefineBitField => AbstractOp::DeclareBitField,
        AbstractOp::DefineFunction => AbstractOp::DeclareFunction,
        _ => return None,
    })
}

/// Position of the `END_X` matching the `DEFINE_X` at `start`, honoring
/// nesting of same-shaped definitions.
fn matching_end(code: &[Code], start: usize) -> Result<usize, TransformError> {
    let open = code[start].op;
    let close = open
        .end_op()
        .ok_or_else(|| TransformError::inconsistent("matching_end on a non-definition"))?;
    let mut depth = 0usize;
    for (i, c) in code.iter().enumerate().skip(start) {
        if c.op == open {
            depth += 1;
        } else if c.op == close {
            depth -= 1;
            if depth == 0 {
                return Ok(i);
            }
        }
    }
    Err(TransformError::inconsistent(format!(
        "unterminated {:?} at {}",
        open, start
    )))
}

/// One hoisting step: extract the first hoistable definition found at
/// depth one or more, append it at the end, and leave a declare stub.
/// Returns `false` once the module is flat.
fn hoist_one(m: &mut Module) -> Result<bool, TransformError> {
    let mut depth = 0usize;
    for i in 0..m.code.len() {
        let op = m.code[i].op;
        if depth > 0 {
            if let Some(declare) = declare_op_for(op) {
                let end = matching_end(&m.code, i)?;
                let ident = m.code[i].require_ident()?;
                let moved: Vec<Code> = m.code.drain(i..=end).collect();
                let mut stub = Code::new(declare);
                stub.ref_id = Some(ident);
                m.code.insert(i, stub);
                m.code.extend(moved);
                return Ok(true);
            }
        }
        if op.end_op().is_some() {
            depth += 1;
        } else if is_definition_end(op) {
            depth = depth.saturating_sub(1);
        }
    }
    Ok(false)
}

fn is_definition_end(op: AbstractOp) -> bool {
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

/// Hoists until every definition in the hoistable family sits at the top
/// level.
pub fn flatten(m: &mut Module) -> Result<(), TransformError> {
    while hoist_one(m)? {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_core::ObjectId;

    fn define(op: AbstractOp, ident: u64) -> Code {
        let mut c = Code::new(op);
        c.ident = Some(ObjectId(ident));
        c
    }

    #[test]
    fn nested_format_is_hoisted_with_stub() {
        let mut m = Module::new();
        m.code.push(define(AbstractOp::DefineProgram, 1));
        m.code.push(define(AbstractOp::DefineFormat, 2));
        m.code.push(define(AbstractOp::DefineFormat, 3));
        m.code.push(define(AbstractOp::DefineField, 4));
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(Code::new(AbstractOp::EndProgram));

        flatten(&mut m).unwrap();

        let ops: Vec<AbstractOp> = m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::DefineProgram,
                AbstractOp::DeclareFormat,
                AbstractOp::EndProgram,
                AbstractOp::DefineFormat,
                AbstractOp::DeclareFormat,
                AbstractOp::EndFormat,
                AbstractOp::DefineFormat,
                AbstractOp::DefineField,
                AbstractOp::EndFormat,
            ]
        );
        // the outer stub points at the outer format, the inner stub at
        // the inner one
        assert_eq!(m.code[1].ref_id, Some(ObjectId(2)));
        assert_eq!(m.code[4].ref_id, Some(ObjectId(3)));
    }

    #[test]
    fn stub_order_matches_definition_order() {
        let mut m = Module::new();
        m.code.push(define(AbstractOp::DefineProgram, 1));
        m.code.push(define(AbstractOp::DefineFormat, 2));
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(define(AbstractOp::DefineEnum, 3));
        m.code.push(Code::new(AbstractOp::EndEnum));
        m.code.push(define(AbstractOp::DefineFormat, 4));
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(Code::new(AbstractOp::EndProgram));

        flatten(&mut m).unwrap();

        let stubs: Vec<(AbstractOp, ObjectId)> = m.code[1..4]
            .iter()
            .map(|c| (c.op, c.ref_id.unwrap()))
            .collect();
        assert_eq!(
            stubs,
            vec![
                (AbstractOp::DeclareFormat, ObjectId(2)),
                (AbstractOp::DeclareEnum, ObjectId(3)),
                (AbstractOp::DeclareFormat, ObjectId(4)),
            ]
        );
    }

    #[test]
    fn function_inside_format_is_hoisted() {
        let mut m = Module::new();
        m.code.push(define(AbstractOp::DefineProgram, 1));
        m.code.push(define(AbstractOp::DefineFormat, 2));
        m.code.push(define(AbstractOp::DefineFunction, 3));
        m.code.push(Code::new(AbstractOp::EndFunction));
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(Code::new(AbstractOp::EndProgram));

        flatten(&mut m).unwrap();

        let ops: Vec<AbstractOp> = m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::DefineProgram,
                AbstractOp::DeclareFormat,
                AbstractOp::EndProgram,
                AbstractOp::DefineFormat,
                AbstractOp::DeclareFunction,
                AbstractOp::EndFormat,
                AbstractOp::DefineFunction,
                AbstractOp::EndFunction,
            ]
        );
    }

    #[test]
    fn already_flat_module_is_untouched() {
        let mut m = Module::new();
        m.code.push(define(AbstractOp::DefineProgram, 1));
        m.code.push(Code::new(AbstractOp::EndProgram));
        m.code.push(define(AbstractOp::DefineFormat, 2));
        m.code.push(Code::new(AbstractOp::EndFormat));
        let before = m.code.clone();
        flatten(&mut m).unwrap();
        assert_eq!(m.code, before);
    }
}
