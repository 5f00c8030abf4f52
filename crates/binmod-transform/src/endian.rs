//! Byte-order fallbacks.
//!
//! An int coder whose order is only known at run time (native platform
//! order, or a dynamic variable) gets a fallback block probing
//! `IS_LITTLE_ENDIAN` and carrying one explicit little-endian and one
//! explicit big-endian copy of the operation. Coders inside packed
//! operations already received richer fallbacks from the bit-operation
//! expansion and are left alone.

use binmod_core::{AbstractOp, Code, Endian, EndianExpr, Module};

use crate::emit::emit;
use crate::error::TransformError;

fn is_int_coder(op: AbstractOp) -> bool {
    matches!(
        op,
        AbstractOp::EncodeInt
            | AbstractOp::DecodeInt
            | AbstractOp::EncodeIntVector
            | AbstractOp::EncodeIntVectorFixed
            | AbstractOp::DecodeIntVector
            | AbstractOp::DecodeIntVectorFixed
            | AbstractOp::DecodeIntVectorUntilEof
            | AbstractOp::PeekIntVector
    )
}

fn apply_fallback(m: &mut Module, which: Endian) -> Result<(), TransformError> {
    let mut out: Vec<Code> = Vec::new();
    for i in 0..m.code.len() {
        let code = m.code[i].clone();
        if !is_int_coder(code.op) || code.fallback.is_some() {
            continue;
        }
        let Some(endian) = code.endian else { continue };
        if endian.endian != which {
            continue;
        }
        let fallback = m.new_id();
        m.code[i].fallback = Some(fallback);

        emit(&mut out, AbstractOp::DefineFallback, |c| {
            c.ident = Some(fallback)
        });
        let cond = m.new_id();
        emit(&mut out, AbstractOp::IsLittleEndian, |c| {
            c.ident = Some(cond);
            c.ref_id = Some(endian.dynamic_ref);
        });
        emit(&mut out, AbstractOp::If, |c| c.ref_id = Some(cond));
        let mut little = code.clone();
        little.endian = Some(EndianExpr::new(Endian::Little, endian.signed));
        little.ident = None;
        out.push(little);
        emit(&mut out, AbstractOp::Else, |_| {});
        let mut big = code.clone();
        big.endian = Some(EndianExpr::new(Endian::Big, endian.signed));
        big.ident = None;
        out.push(big);
        emit(&mut out, AbstractOp::EndIf, |_| {});
        emit(&mut out, AbstractOp::EndFallback, |_| {});
    }
    m.code.extend(out);
    Ok(())
}

/// Fallbacks for platform-order coders.
pub fn apply_native_endian_fallback(m: &mut Module) -> Result<(), TransformError> {
    apply_fallback(m, Endian::Native)
}

/// Fallbacks for coders whose order a runtime variable selects.
pub fn apply_dynamic_endian_fallback(m: &mut Module) -> Result<(), TransformError> {
    apply_fallback(m, Endian::Dynamic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_core::ObjectId;

    fn int_coder(m: &mut Module, endian: EndianExpr) -> usize {
        let field = m.new_id();
        let mut c = Code::new(AbstractOp::EncodeInt);
        c.ref_id = Some(field);
        c.endian = Some(endian);
        c.bit_size = Some(16);
        c.belong = Some(field);
        let index = m.code.len();
        m.code.push(c);
        index
    }

    #[test]
    fn dynamic_coder_gets_both_branches() {
        let mut m = Module::new();
        let selector = m.new_id();
        let mut endian = EndianExpr::new(Endian::Dynamic, false);
        endian.dynamic_ref = selector;
        let i = int_coder(&mut m, endian);

        apply_dynamic_endian_fallback(&mut m).unwrap();
        m.rebind_ident_index();

        let fb = m.code[i].fallback.expect("fallback attached");
        let fb_index = m.ident_index(fb).unwrap();
        assert_eq!(m.code[fb_index].op, AbstractOp::DefineFallback);
        let probe = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::IsLittleEndian)
            .unwrap();
        assert_eq!(probe.ref_id, Some(selector));
        let branch_orders: Vec<Endian> = m.code[fb_index..]
            .iter()
            .filter(|c| c.op == AbstractOp::EncodeInt)
            .map(|c| c.endian.unwrap().endian)
            .collect();
        assert_eq!(branch_orders, vec![Endian::Little, Endian::Big]);
    }

    #[test]
    fn native_coder_probes_without_a_selector() {
        let mut m = Module::new();
        let i = int_coder(&mut m, EndianExpr::new(Endian::Native, true));
        apply_native_endian_fallback(&mut m).unwrap();
        assert!(m.code[i].fallback.is_some());
        let probe = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::IsLittleEndian)
            .unwrap();
        assert_eq!(probe.ref_id, Some(ObjectId::NONE));
        // signedness is preserved in both branches
        assert!(m
            .code
            .iter()
            .filter(|c| c.op == AbstractOp::EncodeInt && c.ident.is_none())
            .all(|c| c.endian.unwrap().signed));
    }

    #[test]
    fn static_orders_are_left_alone() {
        let mut m = Module::new();
        let big = int_coder(&mut m, EndianExpr::new(Endian::Big, false));
        let unspec = int_coder(&mut m, EndianExpr::new(Endian::Unspec, false));
        apply_native_endian_fallback(&mut m).unwrap();
        apply_dynamic_endian_fallback(&mut m).unwrap();
        assert!(m.code[big].fallback.is_none());
        assert!(m.code[unspec].fallback.is_none());
        assert!(!m.code.iter().any(|c| c.op == AbstractOp::DefineFallback));
    }

    #[test]
    fn packed_coders_with_existing_fallbacks_are_skipped() {
        let mut m = Module::new();
        let i = int_coder(&mut m, EndianExpr::new(Endian::Native, false));
        let existing = m.new_id();
        m.code[i].fallback = Some(existing);
        apply_native_endian_fallback(&mut m).unwrap();
        assert_eq!(m.code[i].fallback, Some(existing));
    }
}
