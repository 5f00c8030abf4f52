//! Conditional-field merge.
//!
//! A cascade of `CONDITIONAL_FIELD` opcodes belonging to the same
//! property collapses into one `MERGED_CONDITIONAL_FIELD` carrying the
//! cascade in its `param` list. When every alternative shares one type
//! the merged field takes it (`COMMON_TYPE`, or `STRICT_COMMON_TYPE` when
//! a catch-all alternative makes the cascade exhaustive); otherwise the
//! merged field is a tagged variant over the alternative types.

use binmod_core::{
    AbstractOp, Code, MergeMode, Module, ObjectId, Storage, StorageType, Storages,
};

use crate::error::TransformError;

pub fn merge_conditional_fields(m: &mut Module) -> Result<(), TransformError> {
    // property ident -> conditional field idents, in stream order
    let mut cascades: Vec<(ObjectId, Vec<ObjectId>)> = Vec::new();
    for code in &m.code {
        if code.op != AbstractOp::ConditionalField {
            continue;
        }
        let property = code.require_belong()?;
        let ident = code.require_ident()?;
        match cascades.iter_mut().find(|(p, _)| *p == property) {
            Some((_, refs)) => refs.push(ident),
            None => cascades.push((property, vec![ident])),
        }
    }

    for (property, refs) in cascades {
        let mut alternative_types = Vec::with_capacity(refs.len());
        let mut has_catch_all = false;
        for &cf in &refs {
            let code = m.code_by_ident(cf)?;
            let field_ref = code.require_right()?;
            let cond_ref = code.require_left()?;
            if field_ref.is_none() {
                continue;
            }
            let field = m.code_by_ident(field_ref)?;
            let ty = field.require_ty()?;
            alternative_types.push(m.get_storage(ty)?.clone());
            // The cascade is exhaustive when its last condition is the
            // always-true immediate (directly or through the chain).
            let cond = m.code_by_ident(cond_ref)?;
            let final_cond = if cond.op == AbstractOp::NotPrevThen {
                cond.require_right()?
            } else {
                cond_ref
            };
            has_catch_all = Some(final_cond) == m.true_id;
        }
        if alternative_types.is_empty() {
            continue;
        }

        let first_key = alternative_types[0].key();
        let all_same = alternative_types.iter().all(|t| t.key() == first_key);
        let (mode, merged_shape) = if all_same {
            let mode = if has_catch_all {
                MergeMode::StrictCommonType
            } else {
                MergeMode::CommonType
            };
            (mode, alternative_types[0].clone())
        } else {
            // tagged union over the alternatives, headed by the union id
            let union_id = union_of_property(m, property);
            let mut shape = Storages::default();
            let mut head = Storage::referencing(StorageType::Variant, union_id);
            head.size = alternative_types.len() as u64;
            shape.storages.push(head);
            for alt in &alternative_types {
                shape.storages.extend(alt.storages.iter().copied());
            }
            (MergeMode::UnionFields, shape)
        };
        let ty = m.get_storage_ref(merged_shape);

        let merged_id = m.new_id();
        let mut merged = Code::new(AbstractOp::MergedConditionalField);
        merged.ident = Some(merged_id);
        merged.belong = Some(property);
        merged.merge_mode = Some(mode);
        merged.ty = Some(ty);
        merged.params = Some(refs.clone());

        // insert directly after the cascade's last conditional field
        let insert_at = m
            .ident_index(*refs.last().expect("cascade is non-empty"))?
            + 1;
        m.code.insert(insert_at, merged);
        m.rebind_ident_index();
    }
    Ok(())
}

/// The union declared inside a property (a stub after flattening).
fn union_of_property(m: &Module, property: ObjectId) -> ObjectId {
    for (i, code) in m.code.iter().enumerate() {
        if code.op == AbstractOp::DefineProperty && code.ident == Some(property) {
            for inner in &m.code[i + 1..] {
                match inner.op {
                    AbstractOp::DeclareUnion => return inner.ref_id.unwrap_or(ObjectId::NONE),
                    AbstractOp::DefineUnion => return inner.ident.unwrap_or(ObjectId::NONE),
                    AbstractOp::EndProperty => return ObjectId::NONE,
                    _ => {}
                }
            }
        }
    }
    ObjectId::NONE
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A property with two conditional alternatives of the given types.
    fn build_cascade(
        m: &mut Module,
        ty_a: binmod_core::StorageRef,
        ty_b: binmod_core::StorageRef,
        catch_all: bool,
    ) -> ObjectId {
        let property = m.new_named_id("value");
        let mut prop = Code::new(AbstractOp::DefineProperty);
        prop.ident = Some(property);
        m.code.push(prop);

        let cond_a = m.new_id();
        let mut imm = Code::new(AbstractOp::ImmediateTrue);
        imm.ident = Some(cond_a);
        m.code.push(imm);
        if catch_all {
            m.true_id = Some(cond_a);
        }

        let mut fields = Vec::new();
        for ty in [ty_a, ty_b] {
            let field = m.new_id();
            let mut f = Code::new(AbstractOp::DefineField);
            f.ident = Some(field);
            f.belong = Some(property);
            f.ty = Some(ty);
            m.code.push(f);
            fields.push(field);
        }
        for &field in &fields {
            let cf = m.new_id();
            let mut c = Code::new(AbstractOp::ConditionalField);
            c.ident = Some(cf);
            c.left = Some(cond_a);
            c.right = Some(field);
            c.belong = Some(property);
            m.code.push(c);
        }
        m.code.push(Code::new(AbstractOp::EndProperty));
        m.rebind_ident_index();
        property
    }

    #[test]
    fn common_type_cascade_merges_with_shared_shape() {
        let mut m = Module::new();
        let u8_ref = m.get_storage_ref(Storages::uint(8));
        let property = build_cascade(&mut m, u8_ref, u8_ref, false);

        merge_conditional_fields(&mut m).unwrap();
        let merged = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::MergedConditionalField)
            .expect("merged field");
        assert_eq!(merged.belong, Some(property));
        assert_eq!(merged.merge_mode, Some(MergeMode::CommonType));
        assert_eq!(merged.ty, Some(u8_ref));
        assert_eq!(merged.params.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn catch_all_cascade_is_strict() {
        let mut m = Module::new();
        let u8_ref = m.get_storage_ref(Storages::uint(8));
        build_cascade(&mut m, u8_ref, u8_ref, true);
        merge_conditional_fields(&mut m).unwrap();
        let merged = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::MergedConditionalField)
            .unwrap();
        assert_eq!(merged.merge_mode, Some(MergeMode::StrictCommonType));
    }

    #[test]
    fn differing_types_become_a_variant() {
        let mut m = Module::new();
        let u8_ref = m.get_storage_ref(Storages::uint(8));
        let u16_ref = m.get_storage_ref(Storages::uint(16));
        build_cascade(&mut m, u8_ref, u16_ref, false);
        merge_conditional_fields(&mut m).unwrap();
        let merged = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::MergedConditionalField)
            .unwrap();
        assert_eq!(merged.merge_mode, Some(MergeMode::UnionFields));
        let shape = m.get_storage(merged.ty.unwrap()).unwrap();
        assert_eq!(shape.head().unwrap().kind, StorageType::Variant);
        assert_eq!(shape.head().unwrap().size, 2);
        // both alternatives trail the head
        assert_eq!(shape.storages.len(), 3);
    }

    #[test]
    fn merged_record_sits_after_the_cascade() {
        let mut m = Module::new();
        let u8_ref = m.get_storage_ref(Storages::uint(8));
        build_cascade(&mut m, u8_ref, u8_ref, false);
        merge_conditional_fields(&mut m).unwrap();
        let last_cf = m
            .code
            .iter()
            .rposition(|c| c.op == AbstractOp::ConditionalField)
            .unwrap();
        assert_eq!(
            m.code[last_cf + 1].op,
            AbstractOp::MergedConditionalField
        );
    }
}
