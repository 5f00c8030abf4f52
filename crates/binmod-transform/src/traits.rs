//! Encoder/decoder trait analysis.
//!
//! Walks every coder function, marking which stream capabilities its body
//! needs (end-of-stream probing, peeking, seeking, remaining-byte
//! queries), then propagates the flags through `CALL_ENCODE` /
//! `CALL_DECODE` edges until a fixed point. Work inside a sub-range only
//! sets the sub-range flag; it does not leak the inner capabilities to
//! the outer stream, and the sub-range flag itself never crosses a call.

use std::collections::HashMap;

use binmod_core::{AbstractOp, Module, ObjectId};

use crate::error::TransformError;

#[derive(Default, Clone, Copy)]
struct CoderFrame {
    encoder_param: Option<usize>,
    decoder_param: Option<usize>,
    sub_range_depth: usize,
    function: ObjectId,
}

pub fn analyze_coder_traits(m: &mut Module) -> Result<(), TransformError> {
    // function ident -> its coder parameter index
    let mut encoder_param_of: HashMap<ObjectId, usize> = HashMap::new();
    let mut decoder_param_of: HashMap<ObjectId, usize> = HashMap::new();
    // function ident -> called coder functions
    let mut calls: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();

    let mut stack: Vec<CoderFrame> = Vec::new();
    for i in 0..m.code.len() {
        let op = m.code[i].op;
        match op {
            AbstractOp::DefineFunction => {
                stack.push(CoderFrame {
                    function: m.code[i].require_ident()?,
                    ..Default::default()
                });
                continue;
            }
            AbstractOp::EndFunction => {
                stack.pop();
                continue;
            }
            _ => {}
        }
        let Some(frame) = stack.last_mut() else {
            continue;
        };
        match op {
            AbstractOp::EncoderParameter => {
                frame.encoder_param = Some(i);
                encoder_param_of.insert(frame.function, i);
            }
            AbstractOp::DecoderParameter => {
                frame.decoder_param = Some(i);
                decoder_param_of.insert(frame.function, i);
            }
            AbstractOp::BeginEncodeSubRange | AbstractOp::BeginDecodeSubRange => {
                frame.sub_range_depth += 1;
                if let Some(param) = frame.decoder_param {
                    let mut flags = m.code[param].decode_flags.unwrap_or_default();
                    flags.set_sub_range(true);
                    m.code[param].decode_flags = Some(flags);
                }
                if let Some(param) = frame.encoder_param {
                    let mut flags = m.code[param].encode_flags.unwrap_or_default();
                    flags.set_sub_range(true);
                    m.code[param].encode_flags = Some(flags);
                }
            }
            AbstractOp::EndEncodeSubRange | AbstractOp::EndDecodeSubRange => {
                frame.sub_range_depth = frame.sub_range_depth.saturating_sub(1);
            }
            AbstractOp::CallEncode | AbstractOp::CallDecode => {
                let callee = m.code[i].require_left()?;
                calls.entry(frame.function).or_default().push(callee);
            }
            _ => {}
        }
        let frame = *stack.last().expect("frame just inspected");
        // Inner-sub-range work does not touch the outer stream.
        if frame.sub_range_depth > 0 {
            continue;
        }
        if let Some(param) = frame.decoder_param {
            let mut flags = m.code[param].decode_flags.unwrap_or_default();
            match op {
                AbstractOp::CanRead => flags.set_eof(true),
                AbstractOp::RemainBytes => flags.set_remain_bytes(true),
                AbstractOp::PeekIntVector => flags.set_peek(true),
                AbstractOp::BackwardInput | AbstractOp::InputByteOffset => flags.set_seek(true),
                _ => {}
            }
            m.code[param].decode_flags = Some(flags);
        }
        if let Some(param) = frame.encoder_param {
            let mut flags = m.code[param].encode_flags.unwrap_or_default();
            match op {
                AbstractOp::BackwardOutput | AbstractOp::OutputByteOffset => {
                    flags.set_seek(true)
                }
                _ => {}
            }
            m.code[param].encode_flags = Some(flags);
        }
    }

    // Fixed-point propagation over the call graph.
    loop {
        let mut changed = false;
        for (caller, callees) in &calls {
            for callee in callees {
                if let (Some(&caller_param), Some(&callee_param)) =
                    (decoder_param_of.get(caller), decoder_param_of.get(callee))
                {
                    let callee_flags = m.code[callee_param].decode_flags.unwrap_or_default();
                    let mut caller_flags = m.code[caller_param].decode_flags.unwrap_or_default();
                    if caller_flags.absorb(callee_flags) {
                        m.code[caller_param].decode_flags = Some(caller_flags);
                        changed = true;
                    }
                }
                if let (Some(&caller_param), Some(&callee_param)) =
                    (encoder_param_of.get(caller), encoder_param_of.get(callee))
                {
                    let callee_flags = m.code[callee_param].encode_flags.unwrap_or_default();
                    let mut caller_flags = m.code[caller_param].encode_flags.unwrap_or_default();
                    if caller_flags.absorb(callee_flags) {
                        m.code[caller_param].encode_flags = Some(caller_flags);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_core::Code;

    fn coder_fn(
        m: &mut Module,
        kind: AbstractOp,
        body: impl FnOnce(&mut Module),
    ) -> (ObjectId, usize) {
        let function = m.new_id();
        let mut def = Code::new(AbstractOp::DefineFunction);
        def.ident = Some(function);
        m.code.push(def);
        let param = m.new_id();
        let mut p = Code::new(kind);
        p.ident = Some(param);
        p.belong = Some(function);
        if kind == AbstractOp::DecoderParameter {
            p.decode_flags = Some(Default::default());
        } else {
            p.encode_flags = Some(Default::default());
        }
        let param_index = m.code.len();
        m.code.push(p);
        body(m);
        m.code.push(Code::new(AbstractOp::EndFunction));
        (function, param_index)
    }

    #[test]
    fn intra_function_flags_are_marked() {
        let mut m = Module::new();
        let (_, param) = coder_fn(&mut m, AbstractOp::DecoderParameter, |m| {
            let id = m.new_id();
            let mut c = Code::new(AbstractOp::CanRead);
            c.ident = Some(id);
            m.code.push(c);
            let id = m.new_id();
            let mut c = Code::new(AbstractOp::RemainBytes);
            c.ident = Some(id);
            m.code.push(c);
        });
        m.rebind_ident_index();
        analyze_coder_traits(&mut m).unwrap();
        let flags = m.code[param].decode_flags.unwrap();
        assert!(flags.has_eof());
        assert!(flags.has_remain_bytes());
        assert!(!flags.has_peek());
        assert!(!flags.has_seek());
    }

    #[test]
    fn flags_propagate_through_calls_to_fixed_point() {
        let mut m = Module::new();
        // leaf decoder peeks
        let (leaf, leaf_param) = coder_fn(&mut m, AbstractOp::DecoderParameter, |m| {
            let id = m.new_id();
            let mut c = Code::new(AbstractOp::PeekIntVector);
            c.ident = Some(id);
            m.code.push(c);
        });
        // middle calls leaf, top calls middle
        let (middle, middle_param) = coder_fn(&mut m, AbstractOp::DecoderParameter, |m| {
            let mut c = Code::new(AbstractOp::CallDecode);
            c.left = Some(leaf);
            c.right = Some(ObjectId(999));
            m.code.push(c);
        });
        let (_, top_param) = coder_fn(&mut m, AbstractOp::DecoderParameter, |m| {
            let mut c = Code::new(AbstractOp::CallDecode);
            c.left = Some(middle);
            c.right = Some(ObjectId(999));
            m.code.push(c);
        });
        m.rebind_ident_index();
        analyze_coder_traits(&mut m).unwrap();
        assert!(m.code[leaf_param].decode_flags.unwrap().has_peek());
        assert!(m.code[middle_param].decode_flags.unwrap().has_peek());
        assert!(m.code[top_param].decode_flags.unwrap().has_peek());
    }

    #[test]
    fn sub_range_work_sets_only_the_sub_range_flag() {
        let mut m = Module::new();
        let (_, param) = coder_fn(&mut m, AbstractOp::DecoderParameter, |m| {
            m.code.push(Code::new(AbstractOp::BeginDecodeSubRange));
            let id = m.new_id();
            let mut c = Code::new(AbstractOp::CanRead);
            c.ident = Some(id);
            m.code.push(c);
            m.code.push(Code::new(AbstractOp::EndDecodeSubRange));
        });
        m.rebind_ident_index();
        analyze_coder_traits(&mut m).unwrap();
        let flags = m.code[param].decode_flags.unwrap();
        assert!(flags.has_sub_range());
        assert!(!flags.has_eof());
    }

    #[test]
    fn encoder_seek_marks_and_propagates() {
        let mut m = Module::new();
        let (leaf, _) = coder_fn(&mut m, AbstractOp::EncoderParameter, |m| {
            let id = m.new_id();
            let mut c = Code::new(AbstractOp::OutputByteOffset);
            c.ident = Some(id);
            m.code.push(c);
        });
        let (_, top_param) = coder_fn(&mut m, AbstractOp::EncoderParameter, |m| {
            let mut c = Code::new(AbstractOp::CallEncode);
            c.left = Some(leaf);
            c.right = Some(ObjectId(999));
            m.code.push(c);
        });
        m.rebind_ident_index();
        analyze_coder_traits(&mut m).unwrap();
        assert!(m.code[top_param].encode_flags.unwrap().has_seek());
    }
}
