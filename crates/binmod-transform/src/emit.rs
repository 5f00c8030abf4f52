//! Shared opcode-buffer emission helpers for passes that synthesize code
//! into a side buffer before appending it to the module.

use binmod_core::{AbstractOp, BinaryOp, Code, Module, ObjectId, StorageRef};

pub(crate) fn emit(out: &mut Vec<Code>, op: AbstractOp, set: impl FnOnce(&mut Code)) {
    let mut code = Code::new(op);
    set(&mut code);
    out.push(code);
}

/// Deduplicated integer immediate emitted into the buffer.
pub(crate) fn immediate(m: &mut Module, out: &mut Vec<Code>, value: u64) -> ObjectId {
    if let Some(&id) = m.immediate_table.get(&value) {
        return id;
    }
    let id = m.new_id();
    emit(out, AbstractOp::ImmediateInt, |c| {
        c.ident = Some(id);
        c.int_value = Some(value);
    });
    m.immediate_table.insert(value, id);
    id
}

pub(crate) fn binary(
    m: &mut Module,
    out: &mut Vec<Code>,
    op: BinaryOp,
    left: ObjectId,
    right: ObjectId,
) -> ObjectId {
    let id = m.new_id();
    emit(out, AbstractOp::Binary, |c| {
        c.ident = Some(id);
        c.bin_op = Some(op);
        c.left = Some(left);
        c.right = Some(right);
    });
    id
}

/// `DEFINE_VARIABLE` initialized from an existing value.
pub(crate) fn new_var(
    m: &mut Module,
    out: &mut Vec<Code>,
    ty: StorageRef,
    init: ObjectId,
) -> ObjectId {
    let id = m.new_id();
    emit(out, AbstractOp::DefineVariable, |c| {
        c.ident = Some(id);
        c.ref_id = Some(init);
        c.ty = Some(ty);
    });
    id
}

/// `NEW_OBJECT` + `DEFINE_VARIABLE` of a default-initialized value.
pub(crate) fn new_default_var(m: &mut Module, out: &mut Vec<Code>, ty: StorageRef) -> ObjectId {
    let object = m.new_id();
    emit(out, AbstractOp::NewObject, |c| {
        c.ident = Some(object);
        c.ty = Some(ty);
    });
    new_var(m, out, ty, object)
}

/// Plain `ASSIGN left = right` into the buffer.
pub(crate) fn assign(
    m: &mut Module,
    out: &mut Vec<Code>,
    left: ObjectId,
    right: ObjectId,
) -> ObjectId {
    let id = m.new_id();
    emit(out, AbstractOp::Assign, |c| {
        c.ident = Some(id);
        c.left = Some(left);
        c.right = Some(right);
    });
    id
}
