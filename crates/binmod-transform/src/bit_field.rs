//! Bit-field sizing pass.
//!
//! For each `DEFINE_BIT_FIELD`, sums the member field widths. When every
//! member width is statically known the group is `FIXED` with the summed
//! size and gets a matching unsigned storage; otherwise it is `VARIABLE`
//! with size zero. The decision is copied onto every packed-operation
//! marker belonging to the group so the bit-operation expansion can read
//! it back.

use binmod_core::{AbstractOp, Module, StorageType, Storages};

use crate::error::TransformError;

pub fn decide_bit_field_size(m: &mut Module) -> Result<(), TransformError> {
    use binmod_core::PackedOpType;

    let mut decisions = Vec::new();
    let mut i = 0;
    while i < m.code.len() {
        if m.code[i].op != AbstractOp::DefineBitField {
            i += 1;
            continue;
        }
        let group = m.code[i].require_ident()?;
        let mut sum_bits = 0u64;
        let mut variable = false;
        let mut j = i + 1;
        while j < m.code.len() && m.code[j].op != AbstractOp::EndBitField {
            if m.code[j].op == AbstractOp::DefineField {
                let ty = m.code[j].require_ty()?;
                let shape = m.get_storage(ty)?;
                match shape.head() {
                    Some(head)
                        if matches!(head.kind, StorageType::Uint | StorageType::Int)
                            && head.size > 0 =>
                    {
                        sum_bits += head.size;
                    }
                    _ => variable = true,
                }
            }
            j += 1;
        }
        let packed = if variable {
            PackedOpType::Variable
        } else {
            PackedOpType::Fixed
        };
        decisions.push((i, group, packed, if variable { 0 } else { sum_bits }));
        i = j + 1;
    }

    for &(index, group, packed, bits) in &decisions {
        // A variable group still needs a container wide enough for its
        // statically known members, rounded up to whole bytes.
        let ty = if packed == PackedOpType::Fixed {
            Some(m.get_storage_ref(Storages::uint(bits)))
        } else {
            let known: u64 = {
                let mut sum = 0;
                let mut j = index + 1;
                while j < m.code.len() && m.code[j].op != AbstractOp::EndBitField {
                    if m.code[j].op == AbstractOp::DefineField {
                        if let Some(ty) = m.code[j].ty {
                            if let Ok(shape) = m.get_storage(ty) {
                                if let Some(head) = shape.head() {
                                    if matches!(
                                        head.kind,
                                        StorageType::Uint | StorageType::Int
                                    ) {
                                        sum += head.size;
                                    }
                                }
                            }
                        }
                    }
                    j += 1;
                }
                sum
            };
            let rounded = ((known.max(1) + 7) / 8) * 8;
            Some(m.get_storage_ref(Storages::uint(rounded)))
        };
        let code = &mut m.code[index];
        code.packed_kind = Some(packed);
        code.bit_size = Some(bits);
        code.ty = ty;
        for code in &mut m.code {
            if matches!(
                code.op,
                AbstractOp::BeginEncodePackedOperation | AbstractOp::BeginDecodePackedOperation
            ) && code.belong == Some(group)
            {
                code.packed_kind = Some(packed);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_core::{Code, PackedOpType};

    #[test]
    fn fixed_group_sums_member_widths() {
        let mut m = Module::new();
        let t3 = m.get_storage_ref(Storages::uint(3));
        let t5 = m.get_storage_ref(Storages::uint(5));
        let group = m.new_id();
        let mut bf = Code::new(AbstractOp::DefineBitField);
        bf.ident = Some(group);
        m.code.push(bf);
        for ty in [t3, t5] {
            let id = m.new_id();
            let mut f = Code::new(AbstractOp::DefineField);
            f.ident = Some(id);
            f.belong = Some(group);
            f.ty = Some(ty);
            m.code.push(f);
        }
        m.code.push(Code::new(AbstractOp::EndBitField));
        let mut begin = Code::new(AbstractOp::BeginEncodePackedOperation);
        begin.ident = Some(m.new_id());
        begin.belong = Some(group);
        begin.packed_kind = Some(PackedOpType::Variable);
        m.code.push(begin);

        decide_bit_field_size(&mut m).unwrap();

        let bf = &m.code[0];
        assert_eq!(bf.packed_kind, Some(PackedOpType::Fixed));
        assert_eq!(bf.bit_size, Some(8));
        let shape = m.get_storage(bf.ty.unwrap()).unwrap();
        assert_eq!(shape, &Storages::uint(8));
        // the packed-operation marker was corrected to match
        assert_eq!(m.code[4].packed_kind, Some(PackedOpType::Fixed));
    }

    #[test]
    fn vector_member_makes_group_variable() {
        let mut m = Module::new();
        let vec_ty = m.get_storage_ref(
            Storages::uint(8).wrapped(binmod_core::Storage::plain(StorageType::Vector)),
        );
        let group = m.new_id();
        let mut bf = Code::new(AbstractOp::DefineBitField);
        bf.ident = Some(group);
        m.code.push(bf);
        let mut f = Code::new(AbstractOp::DefineField);
        f.ident = Some(m.new_id());
        f.belong = Some(group);
        f.ty = Some(vec_ty);
        m.code.push(f);
        m.code.push(Code::new(AbstractOp::EndBitField));

        decide_bit_field_size(&mut m).unwrap();

        let bf = &m.code[0];
        assert_eq!(bf.packed_kind, Some(PackedOpType::Variable));
        assert_eq!(bf.bit_size, Some(0));
        // the container still gets a byte-rounded width
        let shape = m.get_storage(bf.ty.unwrap()).unwrap();
        assert_eq!(shape, &Storages::uint(8));
    }
}
