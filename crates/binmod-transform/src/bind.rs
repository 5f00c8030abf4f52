//! Coder binding: relocate `DEFINE_ENCODER`/`DEFINE_DECODER` records next
//! to their format, and rewrite `CALL_ENCODE`/`CALL_DECODE` left refs
//! from the temporary format id to the bound function id.

use std::collections::HashMap;

use binmod_core::{AbstractOp, Code, Module, ObjectId};

use crate::error::TransformError;

/// Moves every coder binding record directly after its format's
/// `DEFINE_FORMAT`, in encoder-then-decoder order.
pub fn bind_encoder_decoder(m: &mut Module) -> Result<(), TransformError> {
    let mut encoders: HashMap<ObjectId, Code> = HashMap::new();
    let mut decoders: HashMap<ObjectId, Code> = HashMap::new();
    let mut rest = Vec::with_capacity(m.code.len());
    for code in m.code.drain(..) {
        match code.op {
            AbstractOp::DefineEncoder => {
                encoders.insert(code.require_left()?, code);
            }
            AbstractOp::DefineDecoder => {
                decoders.insert(code.require_left()?, code);
            }
            _ => rest.push(code),
        }
    }
    let mut out = Vec::with_capacity(rest.len() + encoders.len() + decoders.len());
    for code in rest {
        let format = if code.op == AbstractOp::DefineFormat {
            code.ident
        } else {
            None
        };
        out.push(code);
        if let Some(format) = format {
            if let Some(binding) = encoders.remove(&format) {
                out.push(binding);
            }
            if let Some(binding) = decoders.remove(&format) {
                out.push(binding);
            }
        }
    }
    if !encoders.is_empty() || !decoders.is_empty() {
        return Err(TransformError::inconsistent(
            "coder binding without a matching format",
        ));
    }
    m.code = out;
    Ok(())
}

/// Rewrites coder call sites to target the bound function.
pub fn replace_call_coder_refs(m: &mut Module) -> Result<(), TransformError> {
    let mut encoder_of: HashMap<ObjectId, ObjectId> = HashMap::new();
    let mut decoder_of: HashMap<ObjectId, ObjectId> = HashMap::new();
    for code in &m.code {
        match code.op {
            AbstractOp::DefineEncoder => {
                encoder_of.insert(code.require_left()?, code.require_right()?);
            }
            AbstractOp::DefineDecoder => {
                decoder_of.insert(code.require_left()?, code.require_right()?);
            }
            _ => {}
        }
    }
    for code in &mut m.code {
        match code.op {
            AbstractOp::CallEncode => {
                let target = code.require_left()?;
                if let Some(&function) = encoder_of.get(&target) {
                    code.left = Some(function);
                }
            }
            AbstractOp::CallDecode => {
                let target = code.require_left()?;
                if let Some(&function) = decoder_of.get(&target) {
                    code.left = Some(function);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_fields(op: AbstractOp, set: impl FnOnce(&mut Code)) -> Code {
        let mut c = Code::new(op);
        set(&mut c);
        c
    }

    #[test]
    fn bindings_move_next_to_their_format() {
        let mut m = Module::new();
        let fmt = m.new_id();
        let enc = m.new_id();
        let dec = m.new_id();
        m.code.push(with_fields(AbstractOp::DefineFormat, |c| {
            c.ident = Some(fmt)
        }));
        m.code.push(Code::new(AbstractOp::EndFormat));
        m.code.push(with_fields(AbstractOp::DefineDecoder, |c| {
            c.left = Some(fmt);
            c.right = Some(dec);
        }));
        m.code.push(with_fields(AbstractOp::DefineEncoder, |c| {
            c.left = Some(fmt);
            c.right = Some(enc);
        }));

        bind_encoder_decoder(&mut m).unwrap();
        let ops: Vec<AbstractOp> = m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::DefineFormat,
                AbstractOp::DefineEncoder,
                AbstractOp::DefineDecoder,
                AbstractOp::EndFormat,
            ]
        );
    }

    #[test]
    fn call_refs_rewritten_to_functions() {
        let mut m = Module::new();
        let fmt = m.new_id();
        let enc = m.new_id();
        let value = m.new_id();
        m.code.push(with_fields(AbstractOp::DefineEncoder, |c| {
            c.left = Some(fmt);
            c.right = Some(enc);
        }));
        m.code.push(with_fields(AbstractOp::CallEncode, |c| {
            c.left = Some(fmt);
            c.right = Some(value);
        }));

        replace_call_coder_refs(&mut m).unwrap();
        assert_eq!(m.code[1].left, Some(enc));
        assert_eq!(m.code[1].right, Some(value));
    }

    #[test]
    fn orphan_binding_is_rejected() {
        let mut m = Module::new();
        let fmt = m.new_id();
        let enc = m.new_id();
        m.code.push(with_fields(AbstractOp::DefineEncoder, |c| {
            c.left = Some(fmt);
            c.right = Some(enc);
        }));
        assert!(bind_encoder_decoder(&mut m).is_err());
    }
}
