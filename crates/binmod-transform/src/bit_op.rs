//! Bit-operation expansion.
//!
//! Every packed operation gets a byte-oriented fallback so back-ends
//! without native bit-level stream access can still code bit fields. The
//! begin marker's fallback allocates the packed container, a bit counter,
//! and (for variable groups) a byte buffer with a read counter; each
//! inner `ENCODE_INT`/`DECODE_INT` gets shift-and-mask packing code with
//! little/big branches as its endianness demands; the end marker flushes
//! the container. Fallback blocks are appended at the end of the module
//! and linked through the original opcodes' `fallback` field.

use binmod_core::{
    storage::cast_kind_between, AbstractOp, BinaryOp, Code, EndianExpr, Module, ObjectId,
    PackedOpType, Storage, StorageRef, StorageType, Storages,
};

use crate::emit::{assign, binary, emit, immediate, new_default_var, new_var};
use crate::error::TransformError;

/// Per-group expansion state while scanning the stream.
struct Group {
    endian: EndianExpr,
    packed: PackedOpType,
    belong: ObjectId,
    bit_size: u64,
    target: ObjectId,
    target_ty: StorageRef,
    counter: ObjectId,
    counter_ty: StorageRef,
    tmp_array: ObjectId,
    read_bytes: ObjectId,
}

struct Expander<'m> {
    m: &'m mut Module,
    out: Vec<Code>,
}

impl<'m> Expander<'m> {
    /// Emits per-byte-order code: explicit orders get one side, native
    /// and dynamic orders an `IS_LITTLE_ENDIAN` test with both sides.
    fn endian_specific(
        &mut self,
        endian: EndianExpr,
        mut little: impl FnMut(&mut Self) -> Result<(), TransformError>,
        mut big: impl FnMut(&mut Self) -> Result<(), TransformError>,
    ) -> Result<(), TransformError> {
        if endian.is_runtime_order() {
            let cond = self.m.new_id();
            let dynamic_ref = endian.dynamic_ref;
            emit(&mut self.out, AbstractOp::IsLittleEndian, |c| {
                c.ident = Some(cond);
                c.ref_id = Some(dynamic_ref);
            });
            emit(&mut self.out, AbstractOp::If, |c| c.ref_id = Some(cond));
            little(self)?;
            emit(&mut self.out, AbstractOp::Else, |_| {});
            big(self)?;
            emit(&mut self.out, AbstractOp::EndIf, |_| {});
            return Ok(());
        }
        match endian.endian {
            binmod_core::Endian::Little => little(self),
            _ => big(self),
        }
    }

    /// `target = target | ((target_ty(value) & mask) << shift_index)`
    fn assign_to_target(
        &mut self,
        group: &Group,
        value: ObjectId,
        mask: ObjectId,
        shift_index: ObjectId,
        value_ty: StorageRef,
    ) -> Result<(), TransformError> {
        let target_shape = self.m.get_storage(group.target_ty)?.clone();
        let value_shape = self.m.get_storage(value_ty)?.clone();
        let value = if target_shape.key() == value_shape.key() {
            value
        } else {
            let kind = cast_kind_between(&target_shape, &value_shape);
            let id = self.m.new_id();
            let target_ty = group.target_ty;
            emit(&mut self.out, AbstractOp::Cast, |c| {
                c.ident = Some(id);
                c.ty = Some(target_ty);
                c.from_ty = Some(value_ty);
                c.ref_id = Some(value);
                c.cast_kind = Some(kind);
            });
            id
        };
        let masked = binary(self.m, &mut self.out, BinaryOp::BitAnd, value, mask);
        let shifted = binary(
            self.m,
            &mut self.out,
            BinaryOp::LeftLogicalShift,
            masked,
            shift_index,
        );
        let merged = binary(
            self.m,
            &mut self.out,
            BinaryOp::BitOr,
            group.target,
            shifted,
        );
        assign(self.m, &mut self.out, group.target, merged);
        Ok(())
    }

    /// `counter = counter + bits`
    fn add_counter(&mut self, group: &Group, bits: u64) -> Result<(), TransformError> {
        let imm = immediate(self.m, &mut self.out, bits);
        let sum = binary(self.m, &mut self.out, BinaryOp::Add, group.counter, imm);
        assign(self.m, &mut self.out, group.counter, sum);
        Ok(())
    }

    fn uint_ref(&mut self, bits: u64, signed: bool) -> StorageRef {
        let shape = if signed {
            Storages::int(bits)
        } else {
            Storages::uint(bits)
        };
        self.m.get_storage_ref(shape)
    }
}

/// Bits needed to count up to and including `width`.
fn counter_bits(width: u64) -> u64 {
    64 - width.leading_zeros() as u64
}

fn mask_for(bits: u64) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

pub fn expand_bit_operation(m: &mut Module) -> Result<(), TransformError> {
    let mut x = Expander { m, out: Vec::new() };
    let mut group: Option<Group> = None;

    for i in 0..x.m.code.len() {
        let code = x.m.code[i].clone();
        match code.op {
            AbstractOp::BeginEncodePackedOperation | AbstractOp::BeginDecodePackedOperation => {
                let belong = code.require_belong()?;
                let holder = x.m.code_by_ident(belong)?;
                if holder.op != AbstractOp::DefineBitField {
                    return Err(TransformError::inconsistent(
                        "packed operation outside a bit field",
                    ));
                }
                let target_ty = holder.require_ty()?;
                let width = x
                    .m
                    .get_storage(target_ty)?
                    .head()
                    .map(|h| h.size)
                    .unwrap_or(0);
                let endian = code
                    .endian
                    .unwrap_or(EndianExpr::new(binmod_core::Endian::Unspec, false));
                let packed = code.packed_kind.unwrap_or(PackedOpType::Fixed);

                let fallback = x.m.new_id();
                x.m.code[i].bit_size = Some(width);
                x.m.code[i].fallback = Some(fallback);

                emit(&mut x.out, AbstractOp::DefineFallback, |c| {
                    c.ident = Some(fallback)
                });
                let target = new_default_var(x.m, &mut x.out, target_ty);
                let counter_ty = x.uint_ref(counter_bits(width), false);
                let zero = immediate(x.m, &mut x.out, 0);
                let counter = new_var(x.m, &mut x.out, counter_ty, zero);
                let mut tmp_array = ObjectId::NONE;
                let mut read_bytes = ObjectId::NONE;
                if packed == PackedOpType::Variable {
                    let array_shape = Storages::uint(8)
                        .wrapped(Storage::sized(StorageType::Array, width / 8));
                    let array_ty = x.m.get_storage_ref(array_shape);
                    tmp_array = new_default_var(x.m, &mut x.out, array_ty);
                }
                if code.op == AbstractOp::BeginDecodePackedOperation {
                    if packed == PackedOpType::Fixed {
                        emit(&mut x.out, AbstractOp::DecodeInt, |c| {
                            c.ref_id = Some(target);
                            c.endian = Some(endian);
                            c.bit_size = Some(width);
                            c.belong = Some(belong);
                        });
                    } else {
                        read_bytes = new_var(x.m, &mut x.out, counter_ty, zero);
                    }
                }
                emit(&mut x.out, AbstractOp::EndFallback, |_| {});

                group = Some(Group {
                    endian,
                    packed,
                    belong,
                    bit_size: width,
                    target,
                    target_ty,
                    counter,
                    counter_ty,
                    tmp_array,
                    read_bytes,
                });
            }
            AbstractOp::EndEncodePackedOperation | AbstractOp::EndDecodePackedOperation => {
                let g = group.take().ok_or_else(|| {
                    TransformError::inconsistent("packed operation end without a begin")
                })?;
                let fallback = x.m.new_id();
                x.m.code[i].fallback = Some(fallback);
                emit(&mut x.out, AbstractOp::DefineFallback, |c| {
                    c.ident = Some(fallback)
                });
                if code.op == AbstractOp::EndEncodePackedOperation {
                    if g.packed == PackedOpType::Fixed {
                        let endian = g.endian;
                        let (target, belong, bits) = (g.target, g.belong, g.bit_size);
                        emit(&mut x.out, AbstractOp::EncodeInt, |c| {
                            c.ref_id = Some(target);
                            c.endian = Some(endian);
                            c.bit_size = Some(bits);
                            c.belong = Some(belong);
                        });
                    } else {
                        flush_variable_encode(&mut x, &g)?;
                    }
                }
                emit(&mut x.out, AbstractOp::EndFallback, |_| {});
            }
            AbstractOp::EncodeInt if group.is_some() => {
                let g = group.as_ref().expect("guarded");
                let fallback = x.m.new_id();
                x.m.code[i].fallback = Some(fallback);
                emit(&mut x.out, AbstractOp::DefineFallback, |c| {
                    c.ident = Some(fallback)
                });
                let bits = code.bit_size.unwrap_or(0);
                let signed = code.endian.map(|e| e.signed).unwrap_or(false);
                let value = code.require_ref()?;
                let value_ty = x.uint_ref(bits, signed);
                let mask = immediate(x.m, &mut x.out, mask_for(bits));
                let outer = g.endian;
                x.endian_specific(
                    outer,
                    |x| {
                        // fill from the LSB, then advance
                        x.assign_to_target(g, value, mask, g.counter, value_ty)?;
                        x.add_counter(g, bits)
                    },
                    |x| {
                        // advance, then fill from the MSB
                        x.add_counter(g, bits)?;
                        let width = immediate(x.m, &mut x.out, g.bit_size);
                        let shift =
                            binary(x.m, &mut x.out, BinaryOp::Sub, width, g.counter);
                        x.assign_to_target(g, value, mask, shift, value_ty)
                    },
                )?;
                emit(&mut x.out, AbstractOp::EndFallback, |_| {});
            }
            AbstractOp::DecodeInt if group.is_some() => {
                let g = group.as_ref().expect("guarded");
                let fallback = x.m.new_id();
                x.m.code[i].fallback = Some(fallback);
                emit(&mut x.out, AbstractOp::DefineFallback, |c| {
                    c.ident = Some(fallback)
                });
                let bits = code.bit_size.unwrap_or(0);
                let dec_endian = code
                    .endian
                    .unwrap_or(EndianExpr::new(binmod_core::Endian::Unspec, false));
                let signed = dec_endian.signed;
                let dest = code.require_ref()?;
                let dest_ty = x.uint_ref(bits, signed);

                if g.packed == PackedOpType::Variable {
                    read_ahead_bytes(&mut x, g, bits, dest)?;
                }

                // extract the requested slice and narrow to the field type
                let mask_value = mask_for(bits);
                let extract =
                    |x: &mut Expander<'_>, shift_index: ObjectId| -> Result<(), TransformError> {
                        let shifted = binary(
                            x.m,
                            &mut x.out,
                            BinaryOp::RightLogicalShift,
                            g.target,
                            shift_index,
                        );
                        let mask = immediate(x.m, &mut x.out, mask_value);
                        let masked =
                            binary(x.m, &mut x.out, BinaryOp::BitAnd, shifted, mask);
                        let dest_shape = x.m.get_storage(dest_ty)?.clone();
                        let target_shape = x.m.get_storage(g.target_ty)?.clone();
                        let value = if dest_shape.key() == target_shape.key() {
                            masked
                        } else {
                            let kind = cast_kind_between(&dest_shape, &target_shape);
                            let id = x.m.new_id();
                            let target_ty = g.target_ty;
                            emit(&mut x.out, AbstractOp::Cast, |c| {
                                c.ident = Some(id);
                                c.ty = Some(dest_ty);
                                c.from_ty = Some(target_ty);
                                c.ref_id = Some(masked);
                                c.cast_kind = Some(kind);
                            });
                            id
                        };
                        assign(x.m, &mut x.out, dest, value);
                        Ok(())
                    };
                x.endian_specific(
                    dec_endian,
                    |x| {
                        extract(x, g.counter)?;
                        x.add_counter(g, bits)
                    },
                    |x| {
                        x.add_counter(g, bits)?;
                        let width = immediate(x.m, &mut x.out, g.bit_size);
                        let shift =
                            binary(x.m, &mut x.out, BinaryOp::Sub, width, g.counter);
                        extract(x, shift)
                    },
                )?;
                emit(&mut x.out, AbstractOp::EndFallback, |_| {});
            }
            _ => {}
        }
    }

    let out = std::mem::take(&mut x.out);
    x.m.code.extend(out);
    Ok(())
}

/// Variable-group encode flush: write `counter / 8` buffered bytes.
fn flush_variable_encode(x: &mut Expander, g: &Group) -> Result<(), TransformError> {
    let eight = immediate(x.m, &mut x.out, 8);
    let count = binary(x.m, &mut x.out, BinaryOp::Div, g.counter, eight);
    let zero = immediate(x.m, &mut x.out, 0);
    let byte_count = new_var(x.m, &mut x.out, g.counter_ty, count);
    let index = new_var(x.m, &mut x.out, g.counter_ty, zero);
    let cond = binary(x.m, &mut x.out, BinaryOp::Less, index, byte_count);
    emit(&mut x.out, AbstractOp::LoopCondition, |c| {
        c.ref_id = Some(cond)
    });
    let store_byte = |x: &mut Expander<'_>, shift_index: ObjectId| -> Result<(), TransformError> {
        let eight = immediate(x.m, &mut x.out, 8);
        let shift_bits = binary(x.m, &mut x.out, BinaryOp::Mul, shift_index, eight);
        let shifted = binary(
            x.m,
            &mut x.out,
            BinaryOp::RightLogicalShift,
            g.target,
            shift_bits,
        );
        let ff = immediate(x.m, &mut x.out, 0xff);
        let byte = binary(x.m, &mut x.out, BinaryOp::BitAnd, shifted, ff);
        let u8_ty = x.uint_ref(8, false);
        let cast = x.m.new_id();
        let target_ty = g.target_ty;
        emit(&mut x.out, AbstractOp::Cast, |c| {
            c.ident = Some(cast);
            c.ty = Some(u8_ty);
            c.from_ty = Some(target_ty);
            c.ref_id = Some(byte);
            c.cast_kind = Some(binmod_core::CastType::LargeIntToSmallInt);
        });
        let slot = x.m.new_id();
        let tmp_array = g.tmp_array;
        emit(&mut x.out, AbstractOp::Index, |c| {
            c.ident = Some(slot);
            c.left = Some(tmp_array);
            c.right = Some(index);
        });
        assign(x.m, &mut x.out, slot, cast);
        Ok(())
    };
    x.endian_specific(
        g.endian,
        |x| store_byte(x, index),
        |x| {
            let last = immediate(x.m, &mut x.out, g.bit_size / 8 - 1);
            let reversed = binary(x.m, &mut x.out, BinaryOp::Sub, last, index);
            store_byte(x, reversed)
        },
    )?;
    emit(&mut x.out, AbstractOp::Inc, |c| c.ref_id = Some(index));
    emit(&mut x.out, AbstractOp::EndLoop, |_| {});
    let (endian, belong, tmp_array, len) = (g.endian, g.belong, g.tmp_array, g.bit_size / 8);
    emit(&mut x.out, AbstractOp::EncodeIntVectorFixed, |c| {
        c.left = Some(tmp_array);
        c.right = Some(byte_count);
        c.endian = Some(endian);
        c.bit_size = Some(8);
        c.belong = Some(belong);
        c.array_length = Some(len);
    });
    Ok(())
}

/// Variable-group decode read-ahead: pull in any bytes the requested
/// slice needs that have not been consumed yet, merging each into the
/// container at its endian-appropriate position.
fn read_ahead_bytes(
    x: &mut Expander,
    g: &Group,
    bits: u64,
    requester: ObjectId,
) -> Result<(), TransformError> {
    let seven = immediate(x.m, &mut x.out, 7);
    let size = immediate(x.m, &mut x.out, bits);
    let eight = immediate(x.m, &mut x.out, 8);
    let new_total = binary(x.m, &mut x.out, BinaryOp::Add, g.counter, size);
    let padded = binary(x.m, &mut x.out, BinaryOp::Add, new_total, seven);
    let consumed = binary(x.m, &mut x.out, BinaryOp::Div, padded, eight);
    let consumed_var = new_var(x.m, &mut x.out, g.counter_ty, consumed);
    let need_more = binary(
        x.m,
        &mut x.out,
        BinaryOp::Less,
        g.read_bytes,
        consumed_var,
    );
    emit(&mut x.out, AbstractOp::If, |c| c.ref_id = Some(need_more));

    let index = new_var(x.m, &mut x.out, g.counter_ty, g.read_bytes);
    let more = binary(x.m, &mut x.out, BinaryOp::Less, index, consumed_var);
    emit(&mut x.out, AbstractOp::LoopCondition, |c| {
        c.ref_id = Some(more)
    });
    let slot = x.m.new_id();
    let tmp_array = g.tmp_array;
    emit(&mut x.out, AbstractOp::Index, |c| {
        c.ident = Some(slot);
        c.left = Some(tmp_array);
        c.right = Some(index);
    });
    let endian = g.endian;
    emit(&mut x.out, AbstractOp::DecodeInt, |c| {
        c.ref_id = Some(slot);
        c.endian = Some(endian);
        c.bit_size = Some(8);
        c.belong = Some(requester);
    });
    let u8_ty = x.uint_ref(8, false);
    let ff = immediate(x.m, &mut x.out, 0xff);
    x.endian_specific(
        g.endian,
        |x| {
            let eight = immediate(x.m, &mut x.out, 8);
            let shift = binary(x.m, &mut x.out, BinaryOp::Mul, index, eight);
            x.assign_to_target(g, slot, ff, shift, u8_ty)
        },
        |x| {
            let last = immediate(x.m, &mut x.out, g.bit_size / 8 - 1);
            let reversed = binary(x.m, &mut x.out, BinaryOp::Sub, last, index);
            let eight = immediate(x.m, &mut x.out, 8);
            let shift = binary(x.m, &mut x.out, BinaryOp::Mul, reversed, eight);
            x.assign_to_target(g, slot, ff, shift, u8_ty)
        },
    )?;
    emit(&mut x.out, AbstractOp::Inc, |c| c.ref_id = Some(index));
    emit(&mut x.out, AbstractOp::EndLoop, |_| {});
    assign(x.m, &mut x.out, g.read_bytes, consumed_var);
    emit(&mut x.out, AbstractOp::EndIf, |_| {});
    Ok(())
}
