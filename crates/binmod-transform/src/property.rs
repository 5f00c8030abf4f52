//! Property-function derivation.
//!
//! For every merged conditional field this pass synthesizes a getter
//! (returning `optional<T>` for common-type merges, `ptr<T>` otherwise)
//! and a setter (returning the property-setter status), plus a
//! vector-length setter for every vector field whose length is a plain
//! sibling-field identifier. Assignments targeting a common-type merged
//! property are rewritten to `PROPERTY_ASSIGN` through the setter.

use std::collections::{HashMap, HashSet};

use binmod_core::{
    storage::cast_kind_between, AbstractOp, BinaryOp, Code, FunctionKind, MergeMode, Module,
    ObjectId, Storage, StorageType, Storages, UnionCheckAt,
};

use crate::emit::{binary, emit, immediate};
use crate::error::TransformError;

/// Free-variable scan over a condition expression: enclosing-scope state
/// variables become `STATE_VARIABLE_PARAMETER` declarations, local
/// temporaries become `DECLARE_VARIABLE` references, and φ results are
/// replayed as an if/elif chain of plain assignments.
#[derive(Default)]
struct RetrieveCtx {
    seen: HashSet<ObjectId>,
}

fn is_state_field(m: &Module, field: ObjectId) -> bool {
    let Ok(code) = m.code_by_ident(field) else {
        return false;
    };
    let Some(belong) = code.belong else {
        return false;
    };
    matches!(
        m.code_by_ident(belong).map(|c| c.op),
        Ok(AbstractOp::DefineState)
    )
}

fn retrieve_var(
    m: &mut Module,
    out: &mut Vec<Code>,
    id: ObjectId,
    ctx: &mut RetrieveCtx,
) -> Result<(), TransformError> {
    if id.is_none() {
        return Ok(());
    }
    let code = m.code_by_ident(id)?.clone();
    match code.op {
        AbstractOp::NotPrevThen
        | AbstractOp::Index
        | AbstractOp::Append
        | AbstractOp::Binary
        | AbstractOp::FieldAvailable => {
            if let Some(left) = code.left {
                retrieve_var(m, out, left, ctx)?;
            }
            if let Some(right) = code.right {
                retrieve_var(m, out, right, ctx)?;
            }
        }
        AbstractOp::Cast
        | AbstractOp::ArraySize
        | AbstractOp::Unary
        | AbstractOp::DefineVariableRef
        | AbstractOp::EvalExpr => {
            retrieve_var(m, out, code.require_ref()?, ctx)?;
        }
        AbstractOp::Assign => {
            retrieve_var(m, out, code.require_left()?, ctx)?;
            retrieve_var(m, out, code.require_right()?, ctx)?;
        }
        AbstractOp::Access => {
            retrieve_var(m, out, code.require_left()?, ctx)?;
        }
        AbstractOp::Call | AbstractOp::CallCast => {
            if let Some(r) = code.ref_id {
                retrieve_var(m, out, r, ctx)?;
            }
            for p in code.params.clone().unwrap_or_default() {
                retrieve_var(m, out, p, ctx)?;
            }
        }
        AbstractOp::DefineField => {
            if is_state_field(m, id) && ctx.seen.insert(id) {
                emit(out, AbstractOp::StateVariableParameter, |c| {
                    c.ref_id = Some(id)
                });
            }
        }
        AbstractOp::DefineVariable => {
            retrieve_var(m, out, code.require_ref()?, ctx)?;
            if ctx.seen.insert(id) {
                emit(out, AbstractOp::DeclareVariable, |c| c.ref_id = Some(id));
            }
        }
        AbstractOp::Phi => {
            if !ctx.seen.insert(id) {
                return Ok(());
            }
            let params = code.phi_params.clone().unwrap_or_default();
            let target = code.require_ref()?;
            for p in &params {
                if p.condition.is_some() {
                    retrieve_var(m, out, p.condition, ctx)?;
                }
                retrieve_var(m, out, p.assign, ctx)?;
            }
            // replay the join as plain conditional assignments
            let mut first = true;
            let mut opened = false;
            for p in &params {
                if p.condition.is_none() {
                    if !first {
                        emit(out, AbstractOp::Else, |_| {});
                    }
                } else if first {
                    emit(out, AbstractOp::If, |c| c.ref_id = Some(p.condition));
                    first = false;
                    opened = true;
                } else {
                    emit(out, AbstractOp::Elif, |c| c.ref_id = Some(p.condition));
                }
                if let Ok(assign) = m.code_by_ident(p.assign) {
                    if assign.op == AbstractOp::Assign {
                        let right = assign.right;
                        let next = m.new_id();
                        emit(out, AbstractOp::Assign, |c| {
                            c.ident = Some(next);
                            c.left = Some(target);
                            c.right = right;
                        });
                    }
                }
            }
            if opened {
                emit(out, AbstractOp::EndIf, |_| {});
            }
        }
        AbstractOp::ImmediateInt
        | AbstractOp::ImmediateInt64
        | AbstractOp::ImmediateChar
        | AbstractOp::ImmediateString
        | AbstractOp::ImmediateTrue
        | AbstractOp::ImmediateFalse
        | AbstractOp::ImmediateType
        | AbstractOp::NewObject
        | AbstractOp::DefineParameter
        | AbstractOp::DefineProperty
        | AbstractOp::DefineConstant
        | AbstractOp::EndCondBlock
        | AbstractOp::IsLittleEndian => {}
        other => {
            return Err(TransformError::inconsistent(format!(
                "cannot retrieve variables through {:?}",
                other
            )))
        }
    }
    Ok(())
}

fn property_name_suffix(m: &Module, shape: &Storages) -> String {
    let mut suffix = String::new();
    for storage in &shape.storages {
        match storage.kind {
            StorageType::Array => suffix.push_str("array_"),
            StorageType::Vector => suffix.push_str("vector_"),
            StorageType::Optional => suffix.push_str("optional_"),
            StorageType::Ptr => suffix.push_str("ptr_"),
            StorageType::Variant => suffix.push_str("variant_"),
            StorageType::StructRef | StorageType::RecursiveStructRef => {
                match m.ident_table.get(&storage.ref_id) {
                    Some(name) => suffix.push_str(name),
                    None => suffix.push_str(&format!("struct_{}", storage.ref_id)),
                }
            }
            StorageType::Enum => match m.ident_table.get(&storage.ref_id) {
                Some(name) => {
                    suffix.push_str(name);
                    break;
                }
                None => suffix.push_str(&format!("enum_{}", storage.ref_id)),
            },
            StorageType::Uint => suffix.push_str(&format!("uint{}", storage.size)),
            StorageType::Int => suffix.push_str(&format!("int{}", storage.size)),
            StorageType::Float => suffix.push_str(&format!("float{}", storage.size)),
            StorageType::Bool => suffix.push_str("bool"),
            _ => suffix.push_str("unknown"),
        }
    }
    suffix
}

/// One merged field's derived accessor pair.
struct Accessors {
    getter: ObjectId,
    setter: ObjectId,
}

pub fn derive_property_functions(m: &mut Module) -> Result<(), TransformError> {
    let mut funcs: Vec<Code> = Vec::new();
    let mut merged_fields: HashMap<ObjectId, Accessors> = HashMap::new();
    let mut merged_order: Vec<ObjectId> = Vec::new();
    let mut properties_to_merged: HashMap<ObjectId, ObjectId> = HashMap::new();
    let mut vector_setters: Vec<(ObjectId, ObjectId, u64, ObjectId)> = Vec::new();

    // Pass 1: allocate accessor idents and find vector-length candidates.
    for i in 0..m.code.len() {
        let code = m.code[i].clone();
        match code.op {
            AbstractOp::MergedConditionalField => {
                let property = code.require_belong()?;
                let merged = code.require_ident()?;
                let mode = code.merge_mode.ok_or_else(|| {
                    TransformError::inconsistent("merged field without a merge mode")
                })?;
                let base_name = m
                    .ident_table
                    .get(&property)
                    .cloned()
                    .unwrap_or_else(|| format!("property_{}", property));
                let name = if matches!(mode, MergeMode::CommonType | MergeMode::StrictCommonType)
                {
                    properties_to_merged.insert(property, merged);
                    base_name
                } else {
                    let shape = m.get_storage(code.require_ty()?)?.clone();
                    format!("{}_{}", base_name, property_name_suffix(m, &shape))
                };
                let getter = m.new_named_id(&name);
                let setter = m.new_named_id(&name);
                merged_fields.insert(merged, Accessors { getter, setter });
                merged_order.push(merged);
            }
            AbstractOp::DefineField => {
                // the definition pass links vector fields to their length
                // field through `right` + `bit_size`
                let (Some(length_field), Some(bits)) = (code.right, code.bit_size) else {
                    continue;
                };
                let Some(belong) = code.belong else { continue };
                if !matches!(
                    m.code_by_ident(belong).map(|c| c.op),
                    Ok(AbstractOp::DefineFormat)
                ) {
                    continue;
                }
                let field = code.require_ident()?;
                let name = m
                    .ident_table
                    .get(&field)
                    .cloned()
                    .unwrap_or_else(|| format!("field_{}", field));
                let func = m.new_named_id(&name);
                vector_setters.push((field, length_field, bits, func));
            }
            _ => {}
        }
    }

    // Pass 2: rewrite assignments into common-type merged properties.
    for code in &mut m.code {
        if code.op != AbstractOp::Assign {
            continue;
        }
        let Some(left) = code.left else { continue };
        if let Some(merged) = properties_to_merged.get(&left) {
            if let Some(accessors) = merged_fields.get(merged) {
                code.op = AbstractOp::PropertyAssign;
                code.left = Some(accessors.setter);
            }
        }
    }

    // Pass 3: derive accessor bodies.
    for &merged in &merged_order {
        let base = m.code_by_ident(merged)?.clone();
        derive_getter_setter(m, &mut funcs, &base, &merged_fields)?;
    }
    for &(field, length_field, bits, func) in &vector_setters {
        derive_vector_setter(m, &mut funcs, field, length_field, bits, func)?;
    }

    // Pass 4: declare the accessors next to their merged field.
    let mut insertions: Vec<(usize, ObjectId)> = Vec::new();
    for (i, code) in m.code.iter().enumerate() {
        if code.op == AbstractOp::MergedConditionalField {
            insertions.push((i, code.require_ident()?));
        }
    }
    for (i, merged) in insertions.into_iter().rev() {
        let Some(accessors) = merged_fields.get(&merged) else {
            continue;
        };
        let mut getter = Code::new(AbstractOp::DefinePropertyGetter);
        getter.left = Some(merged);
        getter.right = Some(accessors.getter);
        let mut setter = Code::new(AbstractOp::DefinePropertySetter);
        setter.left = Some(merged);
        setter.right = Some(accessors.setter);
        m.code.insert(i + 1, setter);
        m.code.insert(i + 1, getter);
    }

    m.code.extend(funcs);
    Ok(())
}

/// The priority chain of one conditional field: leading guard conditions
/// that must all be false (through `NOT_PREV_THEN`) and the arm's own
/// condition.
fn split_chain(
    m: &Module,
    cond: ObjectId,
    prev_cond: Option<ObjectId>,
) -> Result<(Vec<ObjectId>, ObjectId), TransformError> {
    let code = m.code_by_ident(cond)?;
    if code.op != AbstractOp::NotPrevThen {
        return Ok((Vec::new(), cond));
    }
    let own = code.require_right()?;
    let mut guards = Vec::new();
    let mut current = code.require_left()?;
    loop {
        if Some(current) == prev_cond {
            break;
        }
        let prev = m.code_by_ident(current)?;
        if prev.op == AbstractOp::NotPrevThen {
            guards.push(prev.require_right()?);
            current = prev.require_left()?;
        } else {
            guards.push(current);
            break;
        }
    }
    Ok((guards, own))
}

fn derive_getter_setter(
    m: &mut Module,
    funcs: &mut Vec<Code>,
    base: &Code,
    merged_fields: &HashMap<ObjectId, Accessors>,
) -> Result<(), TransformError> {
    let merged = base.require_ident()?;
    let property = base.require_belong()?;
    let format = m.code_by_ident(property)?.require_belong()?;
    let mode = base
        .merge_mode
        .ok_or_else(|| TransformError::inconsistent("merged field without a merge mode"))?;
    let original_ty = base.require_ty()?;
    let original_shape = m.get_storage(original_ty)?.clone();
    let params = base.params.clone().unwrap_or_default();
    let accessors = &merged_fields[&merged];
    let (getter, setter) = (accessors.getter, accessors.setter);
    let common = matches!(mode, MergeMode::CommonType | MergeMode::StrictCommonType);

    // -- getter --
    emit(funcs, AbstractOp::DefineFunction, |c| {
        c.ident = Some(getter);
        c.belong = Some(format);
        c.func_kind = Some(FunctionKind::UnionGetter);
    });
    let wrapper = if common {
        Storage::plain(StorageType::Optional)
    } else {
        Storage::plain(StorageType::Ptr)
    };
    let ret_shape = original_shape.clone().wrapped(wrapper);
    let ret_ty = m.get_storage_ref(ret_shape);
    emit(funcs, AbstractOp::ReturnType, |c| c.ty = Some(ret_ty));
    emit(funcs, AbstractOp::PropertyFunction, |c| {
        c.ref_id = Some(merged)
    });

    let ret_empty = |m: &mut Module, funcs: &mut Vec<Code>| {
        let id = m.new_id();
        let op = if common {
            AbstractOp::EmptyOptional
        } else {
            AbstractOp::EmptyPtr
        };
        emit(funcs, op, |c| c.ident = Some(id));
        emit(funcs, AbstractOp::Ret, |c| {
            c.ref_id = Some(id);
            c.belong = Some(getter);
        });
    };

    let mut ctx = RetrieveCtx::default();
    for &cf in &params {
        let cond = m.code_by_ident(cf)?.require_left()?;
        retrieve_var(m, funcs, cond, &mut ctx)?;
    }

    let mut prev_cond: Option<ObjectId> = None;
    for &cf in &params {
        let cf_code = m.code_by_ident(cf)?.clone();
        let cond = cf_code.require_left()?;
        let field_ref = cf_code.require_right()?;
        let (guards, own) = split_chain(m, cond, prev_cond)?;
        if !guards.is_empty() {
            let mut all = guards[0];
            for &g in &guards[1..] {
                all = binary(m, funcs, BinaryOp::LogicalOr, g, all);
            }
            emit(funcs, AbstractOp::If, |c| c.ref_id = Some(all));
            ret_empty(m, funcs);
            emit(funcs, AbstractOp::EndIf, |_| {});
        }
        emit(funcs, AbstractOp::If, |c| c.ref_id = Some(own));
        if cf_code.op == AbstractOp::ConditionalProperty {
            let inner = merged_fields.get(&field_ref).ok_or_else(|| {
                TransformError::inconsistent("conditional property without a merged target")
            })?;
            let id = m.new_id();
            let inner_getter = inner.getter;
            emit(funcs, AbstractOp::Call, |c| {
                c.ident = Some(id);
                c.ref_id = Some(inner_getter);
            });
            emit(funcs, AbstractOp::Ret, |c| {
                c.ref_id = Some(id);
                c.belong = Some(getter);
            });
        } else {
            let member = m.code_by_ident(field_ref)?.require_belong()?;
            emit(funcs, AbstractOp::CheckUnion, |c| {
                c.ref_id = Some(member);
                c.check_at = Some(if common {
                    UnionCheckAt::PropertyGetterOptional
                } else {
                    UnionCheckAt::PropertyGetterPtr
                });
            });
            let id = m.new_id();
            if common {
                emit(funcs, AbstractOp::OptionalOf, |c| {
                    c.ident = Some(id);
                    c.ref_id = Some(field_ref);
                    c.ty = Some(original_ty);
                });
            } else {
                emit(funcs, AbstractOp::AddressOf, |c| {
                    c.ident = Some(id);
                    c.ref_id = Some(field_ref);
                });
            }
            emit(funcs, AbstractOp::Ret, |c| {
                c.ref_id = Some(id);
                c.belong = Some(getter);
            });
        }
        emit(funcs, AbstractOp::EndIf, |_| {});
        prev_cond = Some(cond);
    }
    ret_empty(m, funcs);
    emit(funcs, AbstractOp::EndFunction, |_| {});

    // -- setter --
    emit(funcs, AbstractOp::DefineFunction, |c| {
        c.ident = Some(setter);
        c.belong = Some(format);
        c.func_kind = Some(FunctionKind::UnionSetter);
    });
    let input = m.new_id();
    emit(funcs, AbstractOp::PropertyInputParameter, |c| {
        c.ident = Some(input);
        c.left = Some(merged);
        c.right = Some(setter);
        c.ty = Some(original_ty);
    });
    let status_ty = m.get_storage_ref(Storages::single(Storage::plain(
        StorageType::PropertySetterReturn,
    )));
    emit(funcs, AbstractOp::ReturnType, |c| c.ty = Some(status_ty));
    emit(funcs, AbstractOp::PropertyFunction, |c| {
        c.ref_id = Some(merged)
    });

    let ret_fail = |funcs: &mut Vec<Code>| {
        emit(funcs, AbstractOp::RetPropertySetterFail, |c| {
            c.belong = Some(setter)
        });
    };

    let mut ctx = RetrieveCtx::default();
    let mut prev_cond: Option<ObjectId> = None;
    for &cf in &params {
        let cf_code = m.code_by_ident(cf)?.clone();
        let cond = cf_code.require_left()?;
        retrieve_var(m, funcs, cond, &mut ctx)?;
        let field_ref = cf_code.require_right()?;
        let (guards, own) = split_chain(m, cond, prev_cond)?;
        if !guards.is_empty() {
            let mut all = guards[0];
            for &g in &guards[1..] {
                all = binary(m, funcs, BinaryOp::LogicalOr, g, all);
            }
            emit(funcs, AbstractOp::If, |c| c.ref_id = Some(all));
            ret_fail(funcs);
            emit(funcs, AbstractOp::EndIf, |_| {});
        }
        emit(funcs, AbstractOp::If, |c| c.ref_id = Some(own));
        if cf_code.op == AbstractOp::ConditionalProperty {
            let inner = merged_fields.get(&field_ref).ok_or_else(|| {
                TransformError::inconsistent("conditional property without a merged target")
            })?;
            let inner_setter = inner.setter;
            emit(funcs, AbstractOp::PropertyAssign, |c| {
                c.left = Some(inner_setter);
                c.right = Some(input);
            });
        } else {
            let field_code = m.code_by_ident(field_ref)?.clone();
            let member = field_code.require_belong()?;
            emit(funcs, AbstractOp::SwitchUnion, |c| c.ref_id = Some(member));
            // a vector alternative with a linked length field keeps that
            // length in sync
            if let (Some(length_field), Some(bits)) = (field_code.right, field_code.bit_size) {
                add_array_length_setter(m, funcs, length_field, bits, input, setter)?;
            }
            let field_shape = m.get_storage(field_code.require_ty()?)?.clone();
            let mut right = input;
            if field_shape.key() != original_shape.key() {
                let kind = cast_kind_between(&field_shape, &original_shape);
                let to = m.get_storage_ref(field_shape);
                let id = m.new_id();
                emit(funcs, AbstractOp::Cast, |c| {
                    c.ident = Some(id);
                    c.ty = Some(to);
                    c.from_ty = Some(original_ty);
                    c.ref_id = Some(input);
                    c.cast_kind = Some(kind);
                });
                right = id;
            }
            let assign = m.new_id();
            emit(funcs, AbstractOp::Assign, |c| {
                c.ident = Some(assign);
                c.left = Some(field_ref);
                c.right = Some(right);
            });
        }
        emit(funcs, AbstractOp::RetPropertySetterOk, |c| {
            c.belong = Some(setter)
        });
        emit(funcs, AbstractOp::EndIf, |_| {});
        prev_cond = Some(cond);
    }
    ret_fail(funcs);
    emit(funcs, AbstractOp::EndFunction, |_| {});
    Ok(())
}

/// Asserts the new length fits the length field's width, then assigns the
/// narrowed length into the length field.
fn add_array_length_setter(
    m: &mut Module,
    funcs: &mut Vec<Code>,
    length_field: ObjectId,
    length_bits: u64,
    array_ref: ObjectId,
    function: ObjectId,
) -> Result<(), TransformError> {
    if is_state_field(m, length_field) {
        emit(funcs, AbstractOp::StateVariableParameter, |c| {
            c.ref_id = Some(length_field)
        });
    }
    let max_value = if length_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << length_bits) - 1
    };
    let max_id = immediate(m, funcs, max_value);
    let size = m.new_id();
    emit(funcs, AbstractOp::ArraySize, |c| {
        c.ident = Some(size);
        c.ref_id = Some(array_ref);
    });
    let fits = binary(m, funcs, BinaryOp::LessOrEq, size, max_id);
    emit(funcs, AbstractOp::Assert, |c| {
        c.ref_id = Some(fits);
        c.belong = Some(function);
    });
    let narrow = m.get_storage_ref(Storages::uint(length_bits));
    let wide = m.get_storage_ref(Storages::uint(64));
    let cast = m.new_id();
    emit(funcs, AbstractOp::Cast, |c| {
        c.ident = Some(cast);
        c.ty = Some(narrow);
        c.from_ty = Some(wide);
        c.ref_id = Some(size);
        c.cast_kind = Some(binmod_core::CastType::LargeIntToSmallInt);
    });
    let assign = m.new_id();
    emit(funcs, AbstractOp::Assign, |c| {
        c.ident = Some(assign);
        c.left = Some(length_field);
        c.right = Some(cast);
    });
    Ok(())
}

/// The standalone length setter for a plain (non-union) vector field.
fn derive_vector_setter(
    m: &mut Module,
    funcs: &mut Vec<Code>,
    field: ObjectId,
    length_field: ObjectId,
    length_bits: u64,
    function: ObjectId,
) -> Result<(), TransformError> {
    let field_code = m.code_by_ident(field)?.clone();
    let belong = field_code.require_belong()?;
    let field_ty = field_code.require_ty()?;
    emit(funcs, AbstractOp::DefineFunction, |c| {
        c.ident = Some(function);
        c.belong = Some(belong);
        c.func_kind = Some(FunctionKind::VectorSetter);
    });
    let input = m.new_id();
    emit(funcs, AbstractOp::PropertyInputParameter, |c| {
        c.ident = Some(input);
        c.left = Some(field);
        c.right = Some(function);
        c.ty = Some(field_ty);
    });
    let status_ty = m.get_storage_ref(Storages::single(Storage::plain(
        StorageType::PropertySetterReturn,
    )));
    emit(funcs, AbstractOp::ReturnType, |c| c.ty = Some(status_ty));
    emit(funcs, AbstractOp::PropertyFunction, |c| {
        c.ref_id = Some(field)
    });
    add_array_length_setter(m, funcs, length_field, length_bits, input, function)?;
    let assign = m.new_id();
    emit(funcs, AbstractOp::Assign, |c| {
        c.ident = Some(assign);
        c.left = Some(field);
        c.right = Some(input);
    });
    emit(funcs, AbstractOp::RetPropertySetterOk, |c| {
        c.belong = Some(function)
    });
    emit(funcs, AbstractOp::EndFunction, |_| {});
    Ok(())
}
