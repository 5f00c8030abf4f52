//! Encoder/decoder synthesis.
//!
//! For each format without user-supplied coders, one encoder and one
//! decoder function is synthesized by dispatching on each field's type.
//! Open-ended vectors pick a strategy from the field's position in the
//! format: byte-alignment padding, read-until-EOF, remaining-bytes minus
//! a fixed tail, or peek-for-terminator.

use binmod_ast::{FieldArguments, Node, NodeId};
use binmod_core::{
    AbstractOp, BinaryOp, EndianExpr, FunctionKind, ObjectId, PackedOpType, ReserveType,
    Storage, StorageType, Storages, SubRangeType,
};

use crate::error::LowerError;
use crate::{IdentSalt, Lowerer, Mode};

/// What comes after an open-ended array field in its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Follow {
    /// Nothing follows: read until end of stream.
    End,
    /// Everything after has a statically known size, summing to this many
    /// bits.
    FixedTail(u64),
    /// The next field is a string-literal terminator.
    Constant(NodeId),
    /// Anything else; open arrays cannot be decoded here.
    Unknown,
}

impl<'a> Lowerer<'a> {
    /// Synthesizes (or binds) the encoder or decoder of a format.
    pub(crate) fn synthesize_coder(&mut self, node: NodeId, mode: Mode) -> Result<(), LowerError> {
        let (ident, body, encode_fn, decode_fn) = match self.tree.get(node)? {
            Node::Format {
                ident,
                body,
                encode_fn,
                decode_fn,
            } => (*ident, body.clone(), *encode_fn, *decode_fn),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "synthesize_coder on {:?}",
                    other
                )))
            }
        };
        let fmt_id = self.lookup_ident(ident)?;
        let on_encode = mode == Mode::Encode;
        let bind_op = if on_encode {
            AbstractOp::DefineEncoder
        } else {
            AbstractOp::DefineDecoder
        };

        // A user-supplied coder binds directly; nothing is synthesized.
        let user_fn = if on_encode { encode_fn } else { decode_fn };
        if let Some(user_fn) = user_fn {
            let fn_ident = match self.tree.get(user_fn)? {
                Node::FunctionDecl { ident, .. } => *ident,
                other => {
                    return Err(LowerError::invalid(format!(
                        "coder binding expects a function, got {:?}",
                        other
                    )))
                }
            };
            let fn_id = self.lookup_ident(fn_ident)?;
            self.m.op_with(bind_op, |c| {
                c.left = Some(fmt_id);
                c.right = Some(fn_id);
            });
            return Ok(());
        }

        let (salt, name, kind) = if on_encode {
            (IdentSalt::EncodeFn, "encode", FunctionKind::Encode)
        } else {
            (IdentSalt::DecodeFn, "decode", FunctionKind::Decode)
        };
        let fn_id = self.synthesized_ident(node, salt, name);
        self.m.op_with(AbstractOp::DefineFunction, |c| {
            c.ident = Some(fn_id);
            c.belong = Some(fmt_id);
            c.func_kind = Some(kind);
        });
        let ret = self
            .m
            .get_storage_ref(Storages::single(Storage::plain(StorageType::CoderReturn)));
        self.m.op_with(AbstractOp::ReturnType, |c| c.ty = Some(ret));
        let coder_param = self.m.new_id();
        if on_encode {
            self.m.op_with(AbstractOp::EncoderParameter, |c| {
                c.ident = Some(coder_param);
                c.belong = Some(fn_id);
                c.encode_flags = Some(Default::default());
            });
        } else {
            self.m.op_with(AbstractOp::DecoderParameter, |c| {
                c.ident = Some(coder_param);
                c.belong = Some(fn_id);
                c.decode_flags = Some(Default::default());
            });
        }

        self.m.on_encode_fn = on_encode;
        self.m.init_phi_stack(ObjectId::NONE);
        self.m.enter_function(fn_id);
        self.walk_coder_body(&body, mode)?;
        self.m.exit_function();
        self.m
            .op_with(AbstractOp::RetSuccess, |c| c.belong = Some(fn_id));
        self.m.op(AbstractOp::EndFunction);
        self.m.end_phi_stack();

        self.m.op_with(bind_op, |c| {
            c.left = Some(fmt_id);
            c.right = Some(fn_id);
        });
        Ok(())
    }

    /// Walks a format body in a coder mode, wrapping packed (bit-field)
    /// runs in `BEGIN/END_*_PACKED_OPERATION`.
    fn walk_coder_body(&mut self, body: &[NodeId], mode: Mode) -> Result<(), LowerError> {
        let on_encode = mode == Mode::Encode;
        for (index, &element) in body.iter().enumerate() {
            if let Some(&group) = self.bit_field_begin.get(&element) {
                let packed = self.packed_kind_of_run(body, index)?;
                let endian = self.first_field_endian(element)?;
                let id = self.m.new_id();
                let op = if on_encode {
                    AbstractOp::BeginEncodePackedOperation
                } else {
                    AbstractOp::BeginDecodePackedOperation
                };
                self.m.op_with(op, |c| {
                    c.ident = Some(id);
                    c.belong = Some(group);
                    c.packed_kind = Some(packed);
                    c.endian = Some(endian);
                });
            }
            self.m.set_prev_expr(ObjectId::NONE);
            self.eval_node(element, mode)?;
            if self.bit_field_end.contains(&element) {
                let op = if on_encode {
                    AbstractOp::EndEncodePackedOperation
                } else {
                    AbstractOp::EndDecodePackedOperation
                };
                self.m.op(op);
            }
        }
        Ok(())
    }

    /// Fixed when every member of the packed run has a statically known
    /// width, variable otherwise.
    fn packed_kind_of_run(
        &self,
        body: &[NodeId],
        start: usize,
    ) -> Result<PackedOpType, LowerError> {
        for &element in &body[start..] {
            if let Ok(Node::Field { field_type, .. }) = self.tree.get(element) {
                if self.tree.type_bit_size(*field_type).is_none() {
                    return Ok(PackedOpType::Variable);
                }
            }
            if self.bit_field_end.contains(&element) {
                break;
            }
        }
        Ok(PackedOpType::Fixed)
    }

    fn first_field_endian(&mut self, field: NodeId) -> Result<EndianExpr, LowerError> {
        let endian = match self.tree.get(field)? {
            Node::Field { field_type, .. } => {
                match self.tree.get(self.tree.resolve_type(*field_type)?)? {
                    Node::IntType { endian, .. } | Node::FloatType { endian, .. } => {
                        map_endian(*endian)
                    }
                    _ => binmod_core::Endian::Unspec,
                }
            }
            _ => binmod_core::Endian::Unspec,
        };
        Ok(self.m.resolve_endian(endian, false))
    }

    // -- field shells --

    pub(crate) fn encode_field(&mut self, node: NodeId) -> Result<(), LowerError> {
        self.code_field(node, Mode::Encode)
    }

    pub(crate) fn decode_field(&mut self, node: NodeId) -> Result<(), LowerError> {
        self.code_field(node, Mode::Decode)
    }

    fn code_field(&mut self, node: NodeId, mode: Mode) -> Result<(), LowerError> {
        let (ident, field_type, is_state_variable, arguments) = match self.tree.get(node)? {
            Node::Field {
                ident,
                field_type,
                is_state_variable,
                arguments,
            } => (*ident, *field_type, *is_state_variable, arguments.clone()),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "code_field on {:?}",
                    other
                )))
            }
        };
        if is_state_variable {
            return Ok(());
        }
        let on_encode = mode == Mode::Encode;
        let id = match ident {
            Some(ident) => self.lookup_ident(ident)?,
            None => self
                .m
                .code
                .iter()
                .rev()
                .find(|c| c.op == AbstractOp::DefineField)
                .and_then(|c| c.ident)
                .unwrap_or(ObjectId::NONE),
        };

        if on_encode {
            self.field_argument_assert(id, arguments.as_ref())?;
        }

        // Sub-byte ranges: optionally seek to a start offset (restoring
        // afterwards), then scope the coder to a byte length.
        let mut seek_restore = None;
        let mut sub_range_open = false;
        if let Some(args) = arguments.as_ref() {
            if args.sub_byte_begin.is_some() || args.sub_byte_length.is_some() {
                let (offset_op, seek_op) = if on_encode {
                    (AbstractOp::OutputByteOffset, AbstractOp::SeekEncoder)
                } else {
                    (AbstractOp::InputByteOffset, AbstractOp::SeekDecoder)
                };
                if let Some(begin) = args.sub_byte_begin {
                    let offset = self.get_expr(begin)?;
                    let saved = self.m.new_id();
                    self.m.op_with(offset_op, |c| c.ident = Some(saved));
                    let holder = self.define_int_tmp_var(saved)?;
                    seek_restore = Some((seek_op, holder));
                    self.m.op_with(seek_op, |c| {
                        c.ref_id = Some(offset);
                        c.belong = Some(id);
                    });
                }
                match args.sub_byte_length {
                    Some(length) if !args.sub_byte_length_is_open => {
                        let len = self.get_expr(length)?;
                        let begin_op = if on_encode {
                            AbstractOp::BeginEncodeSubRange
                        } else {
                            AbstractOp::BeginDecodeSubRange
                        };
                        self.m.op_with(begin_op, |c| {
                            c.sub_range_kind = Some(SubRangeType::ByteLen);
                            c.ref_id = Some(len);
                            c.belong = Some(id);
                        });
                        sub_range_open = true;
                    }
                    _ => {
                        if args.sub_byte_begin.is_none() {
                            return Err(LowerError::invalid(
                                "an until-eof sub range needs a start offset",
                            ));
                        }
                    }
                }
            }
        }

        let mapped = arguments.as_ref().and_then(|a| a.type_map);
        if on_encode {
            self.encode_type(field_type, id, mapped, Some(node), true)?;
        } else {
            self.decode_type(field_type, id, mapped, Some(node), true)?;
        }

        if sub_range_open {
            let end_op = if on_encode {
                AbstractOp::EndEncodeSubRange
            } else {
                AbstractOp::EndDecodeSubRange
            };
            self.m.op(end_op);
        }
        if let Some((seek_op, holder)) = seek_restore {
            self.m.op_with(seek_op, |c| {
                c.ref_id = Some(holder);
                c.belong = Some(id);
            });
        }

        if !on_encode {
            self.field_argument_assert(id, arguments.as_ref())?;
        }
        Ok(())
    }

    /// OR-chain of equality against each allowed value, asserted.
    fn field_argument_assert(
        &mut self,
        field_id: ObjectId,
        arguments: Option<&FieldArguments>,
    ) -> Result<(), LowerError> {
        let Some(args) = arguments else {
            return Ok(());
        };
        if args.arguments.is_empty() || !args.direct_mapping {
            return Ok(());
        }
        let mut prev: Option<ObjectId> = None;
        for &arg in &args.arguments {
            let value = self.get_expr(arg)?;
            let eq = self.emit_binary(BinaryOp::Equal, field_id, value);
            prev = Some(match prev {
                Some(p) => self.emit_binary(BinaryOp::LogicalOr, eq, p),
                None => eq,
            });
        }
        let Some(cond) = prev else {
            return Ok(());
        };
        let belong = self.m.current_function();
        self.m.op_with(AbstractOp::Assert, |c| {
            c.ref_id = Some(cond);
            c.belong = Some(belong);
        });
        Ok(())
    }

    // -- per-type dispatch --

    pub(crate) fn encode_type(
        &mut self,
        type_node: NodeId,
        base_ref: ObjectId,
        mapped: Option<NodeId>,
        field: Option<NodeId>,
        init_recursive: bool,
    ) -> Result<(), LowerError> {
        let resolved = self.tree.resolve_type(type_node)?;
        match self.tree.get(resolved)?.clone() {
            Node::IntType {
                bit_size,
                endian,
                is_signed,
            } => {
                let endian = self.m.resolve_endian(map_endian(endian), is_signed);
                let belong = self.field_ref(field)?;
                self.m.op_with(AbstractOp::EncodeInt, |c| {
                    c.ref_id = Some(base_ref);
                    c.endian = Some(endian);
                    c.bit_size = Some(bit_size);
                    c.belong = Some(belong);
                });
                Ok(())
            }
            Node::FloatType { bit_size, endian } => {
                let from = self.build_storages(resolved, false)?;
                let to = Storages::uint(bit_size);
                let from_ref = self.m.get_storage_ref(from);
                let to_ref = self.m.get_storage_ref(to);
                let casted = self.emit_cast(
                    to_ref,
                    from_ref,
                    base_ref,
                    binmod_core::CastType::FloatToIntBit,
                );
                let endian = self.m.resolve_endian(map_endian(endian), false);
                let belong = self.field_ref(field)?;
                self.m.op_with(AbstractOp::EncodeInt, |c| {
                    c.ref_id = Some(casted);
                    c.endian = Some(endian);
                    c.bit_size = Some(bit_size);
                    c.belong = Some(belong);
                });
                Ok(())
            }
            Node::StrLiteralType { literal, bit_size } => {
                let str_ref = self.static_str(literal)?;
                let max_len = self.immediate(bit_size / 8)?;
                let belong = self.field_ref(field)?;
                self.counter_loop(max_len, |l, counter| {
                    let index = l.emit_index(str_ref, counter);
                    let endian = l.m.resolve_endian(binmod_core::Endian::Unspec, false);
                    l.m.op_with(AbstractOp::EncodeInt, |c| {
                        c.ref_id = Some(index);
                        c.endian = Some(endian);
                        c.bit_size = Some(8);
                        c.belong = Some(belong);
                    });
                    Ok(())
                })
            }
            Node::ArrayType {
                element_type,
                length,
                length_value,
            } => self.encode_array(
                element_type,
                length,
                length_value,
                base_ref,
                mapped,
                field,
                init_recursive,
            ),
            Node::StructType { base } => {
                self.call_coder(base, base_ref, init_recursive, true)
            }
            Node::OptionalType { base } => {
                self.encode_type(base, base_ref, mapped, field, init_recursive)
            }
            Node::EnumType { base } => {
                let (enum_ident, base_type) = match self.tree.get(base)? {
                    Node::EnumDecl {
                        ident, base_type, ..
                    } => (*ident, *base_type),
                    other => {
                        return Err(LowerError::inconsistent(format!(
                            "enum type with base {:?}",
                            other
                        )))
                    }
                };
                let wire_type = match mapped.or(base_type) {
                    Some(t) => t,
                    None => {
                        let name = self
                            .tree
                            .ident_name(enum_ident)
                            .unwrap_or("<anonymous>")
                            .to_string();
                        return Err(LowerError::invalid(format!(
                            "abstract enum {} cannot be encoded",
                            name
                        )));
                    }
                };
                let to = self.build_storages(wire_type, false)?;
                let from = self.build_storages(resolved, false)?;
                let to_ref = self.m.get_storage_ref(to);
                let from_ref = self.m.get_storage_ref(from);
                let casted = self.emit_cast(
                    to_ref,
                    from_ref,
                    base_ref,
                    binmod_core::CastType::EnumToInt,
                );
                self.encode_type(wire_type, casted, None, field, init_recursive)
            }
            Node::UnionType { candidates, .. } => {
                self.code_union(&candidates, Mode::Encode)
            }
            other => Err(LowerError::invalid(format!(
                "unsupported type on encode: {:?}",
                other
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_array(
        &mut self,
        element_type: NodeId,
        length: Option<NodeId>,
        length_value: Option<u64>,
        base_ref: ObjectId,
        mapped: Option<NodeId>,
        field: Option<NodeId>,
        init_recursive: bool,
    ) -> Result<(), LowerError> {
        let elem = self.tree.resolve_type(element_type)?;
        let elem_int = match self.tree.get(elem)? {
            Node::IntType {
                bit_size,
                endian,
                is_signed,
            } => Some((*bit_size, *endian, *is_signed)),
            _ => None,
        };
        let belong = self.field_ref(field)?;

        if let Some(len) = length_value {
            let imm = self.immediate(len)?;
            if let Some((bits, endian, signed)) = elem_int {
                let endian = self.m.resolve_endian(map_endian(endian), signed);
                self.m.op_with(AbstractOp::EncodeIntVectorFixed, |c| {
                    c.left = Some(base_ref);
                    c.right = Some(imm);
                    c.endian = Some(endian);
                    c.bit_size = Some(bits);
                    c.belong = Some(belong);
                    c.array_length = Some(len);
                });
                return Ok(());
            }
            return self.counter_loop(imm, |l, counter| {
                let index = l.emit_index(base_ref, counter);
                l.encode_type(element_type, index, mapped, field, init_recursive)
            });
        }

        let size_id = self.m.new_id();
        self.m.op_with(AbstractOp::ArraySize, |c| {
            c.ident = Some(size_id);
            c.ref_id = Some(base_ref);
        });

        match length {
            None => {
                if self.is_alignment_vector(field)? {
                    let req = self.alignment_requirement(field, true)?;
                    let align = self.field_alignment(field)?;
                    let endian = self.m.resolve_endian(binmod_core::Endian::Unspec, false);
                    self.m.op_with(AbstractOp::EncodeIntVectorFixed, |c| {
                        c.left = Some(base_ref);
                        c.right = Some(req);
                        c.endian = Some(endian);
                        c.bit_size = Some(8);
                        c.belong = Some(belong);
                        c.array_length = Some(align / 8 - 1);
                    });
                    return Ok(());
                }
            }
            Some(length) => {
                let len_init = self.get_expr(length)?;
                let shape = match self.may_get_type(length)? {
                    Some(shape) => shape,
                    None => Storages::uint(64),
                };
                let ty = self.m.get_storage_ref(shape);
                let expected = self.define_typed_tmp_var(len_init, ty)?;
                self.m.op_with(AbstractOp::LengthCheck, |c| {
                    c.left = Some(base_ref);
                    c.right = Some(expected);
                    c.belong = Some(belong);
                });
            }
        }

        if let Some((bits, endian, signed)) = elem_int {
            let endian = self.m.resolve_endian(map_endian(endian), signed);
            self.m.op_with(AbstractOp::EncodeIntVector, |c| {
                c.left = Some(base_ref);
                c.right = Some(size_id);
                c.endian = Some(endian);
                c.bit_size = Some(bits);
                c.belong = Some(belong);
            });
            return Ok(());
        }
        self.counter_loop(size_id, |l, counter| {
            let index = l.emit_index(base_ref, counter);
            l.encode_type(element_type, index, mapped, field, init_recursive)
        })
    }

    pub(crate) fn decode_type(
        &mut self,
        type_node: NodeId,
        base_ref: ObjectId,
        mapped: Option<NodeId>,
        field: Option<NodeId>,
        init_recursive: bool,
    ) -> Result<(), LowerError> {
        let resolved = self.tree.resolve_type(type_node)?;
        match self.tree.get(resolved)?.clone() {
            Node::IntType {
                bit_size,
                endian,
                is_signed,
            } => {
                let endian = self.m.resolve_endian(map_endian(endian), is_signed);
                let belong = self.field_ref(field)?;
                self.m.op_with(AbstractOp::DecodeInt, |c| {
                    c.ref_id = Some(base_ref);
                    c.endian = Some(endian);
                    c.bit_size = Some(bit_size);
                    c.belong = Some(belong);
                });
                Ok(())
            }
            Node::FloatType { bit_size, endian } => {
                let from = Storages::uint(bit_size);
                let to = self.build_storages(resolved, false)?;
                let from_ref = self.m.get_storage_ref(from);
                let to_ref = self.m.get_storage_ref(to);
                let object = self.new_object(from_ref);
                let tmp = self.define_typed_tmp_var(object, from_ref)?;
                let endian = self.m.resolve_endian(map_endian(endian), false);
                let belong = self.field_ref(field)?;
                self.m.op_with(AbstractOp::DecodeInt, |c| {
                    c.ref_id = Some(tmp);
                    c.endian = Some(endian);
                    c.bit_size = Some(bit_size);
                    c.belong = Some(belong);
                });
                let casted = self.emit_cast(
                    to_ref,
                    from_ref,
                    tmp,
                    binmod_core::CastType::IntToFloatBit,
                );
                self.do_assign(None, None, base_ref, casted, false)?;
                Ok(())
            }
            Node::StrLiteralType { literal, bit_size } => {
                let str_ref = self.static_str(literal)?;
                let max_len = self.immediate(bit_size / 8)?;
                let belong = self.field_ref(field)?;
                let u8_ref = self.m.get_storage_ref(Storages::uint(8));
                self.counter_loop(max_len, |l, counter| {
                    let object = l.new_object(u8_ref);
                    let tmp = l.define_typed_tmp_var(object, u8_ref)?;
                    let endian = l.m.resolve_endian(binmod_core::Endian::Unspec, false);
                    l.m.op_with(AbstractOp::DecodeInt, |c| {
                        c.ref_id = Some(tmp);
                        c.endian = Some(endian);
                        c.bit_size = Some(8);
                        c.belong = Some(belong);
                    });
                    let index = l.emit_index(str_ref, counter);
                    let cmp = l.emit_binary(BinaryOp::Equal, index, tmp);
                    let function = l.m.current_function();
                    l.m.op_with(AbstractOp::Assert, |c| {
                        c.ref_id = Some(cmp);
                        c.belong = Some(function);
                    });
                    Ok(())
                })
            }
            Node::ArrayType {
                element_type,
                length,
                length_value,
            } => self.decode_array(
                element_type,
                length,
                length_value,
                base_ref,
                mapped,
                field,
                init_recursive,
            ),
            Node::StructType { base } => {
                self.call_coder(base, base_ref, init_recursive, false)
            }
            Node::OptionalType { base } => {
                self.decode_type(base, base_ref, mapped, field, init_recursive)
            }
            Node::EnumType { base } => {
                let (enum_ident, base_type) = match self.tree.get(base)? {
                    Node::EnumDecl {
                        ident, base_type, ..
                    } => (*ident, *base_type),
                    other => {
                        return Err(LowerError::inconsistent(format!(
                            "enum type with base {:?}",
                            other
                        )))
                    }
                };
                let wire_type = match mapped.or(base_type) {
                    Some(t) => t,
                    None => {
                        let name = self
                            .tree
                            .ident_name(enum_ident)
                            .unwrap_or("<anonymous>")
                            .to_string();
                        return Err(LowerError::invalid(format!(
                            "abstract enum {} cannot be decoded",
                            name
                        )));
                    }
                };
                let from = self.build_storages(wire_type, false)?;
                let from_ref = self.m.get_storage_ref(from);
                let object = self.new_object(from_ref);
                let tmp = self.define_typed_tmp_var(object, from_ref)?;
                self.decode_type(wire_type, tmp, None, field, init_recursive)?;
                let to = self.build_storages(resolved, false)?;
                let to_ref = self.m.get_storage_ref(to);
                let casted =
                    self.emit_cast(to_ref, from_ref, tmp, binmod_core::CastType::IntToEnum);
                self.do_assign(None, None, base_ref, casted, false)?;
                Ok(())
            }
            Node::UnionType { candidates, .. } => {
                self.code_union(&candidates, Mode::Decode)
            }
            other => Err(LowerError::invalid(format!(
                "unsupported type on decode: {:?}",
                other
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_array(
        &mut self,
        element_type: NodeId,
        length: Option<NodeId>,
        length_value: Option<u64>,
        base_ref: ObjectId,
        mapped: Option<NodeId>,
        field: Option<NodeId>,
        init_recursive: bool,
    ) -> Result<(), LowerError> {
        let elem = self.tree.resolve_type(element_type)?;
        let elem_int = match self.tree.get(elem)? {
            Node::IntType {
                bit_size,
                endian,
                is_signed,
            } => Some((*bit_size, *endian, *is_signed)),
            _ => None,
        };
        let belong = self.field_ref(field)?;

        if let Some(len) = length_value {
            let imm = self.immediate(len)?;
            if let Some((bits, endian, signed)) = elem_int {
                let endian = self.m.resolve_endian(map_endian(endian), signed);
                self.m.op_with(AbstractOp::DecodeIntVectorFixed, |c| {
                    c.left = Some(base_ref);
                    c.right = Some(imm);
                    c.endian = Some(endian);
                    c.bit_size = Some(bits);
                    c.belong = Some(belong);
                    c.array_length = Some(len);
                });
                return Ok(());
            }
            self.m.op_with(AbstractOp::ReserveSize, |c| {
                c.left = Some(base_ref);
                c.right = Some(imm);
                c.reserve_kind = Some(ReserveType::Static);
            });
            return self.counter_loop(imm, |l, counter| {
                let index = l.emit_index(base_ref, counter);
                l.decode_type(element_type, index, mapped, field, init_recursive)
            });
        }

        if let Some(length) = length {
            // Runtime length expression.
            let len_init = self.get_expr(length)?;
            let shape = match self.may_get_type(length)? {
                Some(shape) => shape,
                None => Storages::uint(64),
            };
            let ty = self.m.get_storage_ref(shape);
            let len_var = self.define_typed_tmp_var(len_init, ty)?;
            if let Some((bits, endian, signed)) = elem_int {
                let endian = self.m.resolve_endian(map_endian(endian), signed);
                self.m.op_with(AbstractOp::DecodeIntVector, |c| {
                    c.left = Some(base_ref);
                    c.right = Some(len_var);
                    c.endian = Some(endian);
                    c.bit_size = Some(bits);
                    c.belong = Some(belong);
                });
                return Ok(());
            }
            self.m.op_with(AbstractOp::ReserveSize, |c| {
                c.left = Some(base_ref);
                c.right = Some(len_var);
                c.reserve_kind = Some(ReserveType::Dynamic);
            });
            return self.counter_loop(len_var, |l, _| {
                l.append_decoded_element(element_type, base_ref, mapped, init_recursive)
            });
        }

        // Open-ended vector: strategy from the field's position.
        let field_node =
            field.ok_or_else(|| LowerError::invalid("open array outside a field"))?;

        if self.is_alignment_vector(field)? {
            let req = self.alignment_requirement(field, false)?;
            let align = self.field_alignment(field)?;
            let endian = self.m.resolve_endian(binmod_core::Endian::Unspec, false);
            self.m.op_with(AbstractOp::DecodeIntVectorFixed, |c| {
                c.left = Some(base_ref);
                c.right = Some(req);
                c.endian = Some(endian);
                c.bit_size = Some(8);
                c.belong = Some(belong);
                c.array_length = Some(align / 8 - 1);
            });
            return Ok(());
        }

        // A sub-byte scoped field reads to the end of its range, exactly
        // like a trailing field reads to the end of the stream.
        let follow = self.field_follow(field_node)?;
        if matches!(follow, Follow::End) || self.field_has_sub_range(field_node)? {
            if let Some((bits, endian, signed)) = elem_int {
                let endian = self.m.resolve_endian(map_endian(endian), signed);
                self.m.op_with(AbstractOp::DecodeIntVectorUntilEof, |c| {
                    c.ref_id = Some(base_ref);
                    c.endian = Some(endian);
                    c.bit_size = Some(bits);
                    c.belong = Some(belong);
                });
                return Ok(());
            }
            let can_read = self.m.new_id();
            self.m.op_with(AbstractOp::CanRead, |c| {
                c.ident = Some(can_read);
                c.belong = Some(belong);
            });
            return self.conditional_loop(can_read, |l| {
                l.append_decoded_element(element_type, base_ref, mapped, init_recursive)
            });
        }
        match follow {
            Follow::End => unreachable!("handled above"),
            Follow::FixedTail(tail_bits) => {
                let tail = self.immediate(tail_bits / 8)?;
                let remain = self.m.new_id();
                self.m
                    .op_with(AbstractOp::RemainBytes, |c| c.ident = Some(remain));
                if let Some((bits, endian, signed)) = elem_int {
                    let avail = self.emit_binary(BinaryOp::Sub, remain, tail);
                    let elem_size = self.immediate(bits / 8)?;
                    let zero = self.immediate(0)?;
                    let rem = self.emit_binary(BinaryOp::Mod, avail, elem_size);
                    let ok = self.emit_binary(BinaryOp::Equal, rem, zero);
                    let function = self.m.current_function();
                    self.m.op_with(AbstractOp::Assert, |c| {
                        c.ref_id = Some(ok);
                        c.belong = Some(function);
                    });
                    let endian = self.m.resolve_endian(map_endian(endian), signed);
                    self.m.op_with(AbstractOp::DecodeIntVector, |c| {
                        c.left = Some(base_ref);
                        c.right = Some(avail);
                        c.endian = Some(endian);
                        c.bit_size = Some(bits);
                        c.belong = Some(belong);
                    });
                    return Ok(());
                }
                let more = self.emit_binary(BinaryOp::Greater, remain, tail);
                self.conditional_loop(more, |l| {
                    l.append_decoded_element(element_type, base_ref, mapped, init_recursive)
                })
            }
            Follow::Constant(terminator) => self.decode_until_terminator(
                terminator,
                element_type,
                base_ref,
                mapped,
                belong,
                init_recursive,
            ),
            Follow::Unknown => Err(LowerError::invalid(
                "an open array must be last, before a fixed tail, or before a literal terminator",
            )),
        }
    }

    /// Decode one element into a fresh temporary and append it.
    fn append_decoded_element(
        &mut self,
        element_type: NodeId,
        base_ref: ObjectId,
        mapped: Option<NodeId>,
        init_recursive: bool,
    ) -> Result<(), LowerError> {
        let shape = self.build_storages(element_type, false)?;
        let ty = self.m.get_storage_ref(shape);
        let object = self.new_object(ty);
        let tmp = self.define_typed_tmp_var(object, ty)?;
        self.decode_type(element_type, tmp, mapped, None, init_recursive)?;
        let latest = self.m.prev_assign(tmp);
        self.m.op_with(AbstractOp::Append, |c| {
            c.left = Some(base_ref);
            c.right = Some(latest);
        });
        Ok(())
    }

    /// Peek-terminated decode: peek the terminator's width after each
    /// element, stop once the bytes match.
    #[allow(clippy::too_many_arguments)]
    fn decode_until_terminator(
        &mut self,
        terminator: NodeId,
        element_type: NodeId,
        base_ref: ObjectId,
        mapped: Option<NodeId>,
        belong: ObjectId,
        init_recursive: bool,
    ) -> Result<(), LowerError> {
        let (literal, bit_size) = match self.tree.get(terminator)? {
            Node::StrLiteralType { literal, bit_size } => (*literal, *bit_size),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "constant follow without a literal type: {:?}",
                    other
                )))
            }
        };
        let str_ref = self.static_str(literal)?;
        let byte_len = self.immediate(bit_size / 8)?;
        let holder_shape =
            Storages::uint(8).wrapped(Storage::sized(StorageType::Array, bit_size / 8));
        let holder_ty = self.m.get_storage_ref(holder_shape);
        let holder_obj = self.new_object(holder_ty);
        let holder = self.define_typed_tmp_var(holder_obj, holder_ty)?;

        self.m.op(AbstractOp::LoopInfinite);
        let endian = self.m.resolve_endian(binmod_core::Endian::Unspec, false);
        self.m.op_with(AbstractOp::PeekIntVector, |c| {
            c.left = Some(holder);
            c.right = Some(byte_len);
            c.endian = Some(endian);
            c.bit_size = Some(8);
            c.belong = Some(belong);
        });
        let bool_ty = self.m.get_storage_ref(Storages::bool());
        let flag_obj = self.new_object(bool_ty);
        let is_match = self.define_typed_tmp_var(flag_obj, bool_ty)?;
        let yes = self.immediate_bool(true)?;
        let no = self.immediate_bool(false)?;
        self.do_assign(None, None, is_match, yes, false)?;
        self.counter_loop(byte_len, |l, i| {
            let begin = l.open_cond_block();
            let expected = l.emit_index(str_ref, i);
            let peeked = l.emit_index(holder, i);
            let differs = l.emit_binary(BinaryOp::NotEqual, expected, peeked);
            let block = l.close_cond_block(begin, differs);
            l.m.init_phi_stack(block);
            l.m.op_with(AbstractOp::If, |c| c.ref_id = Some(block));
            l.do_assign(None, None, is_match, no, false)?;
            l.m.op(AbstractOp::Break);
            l.m.op(AbstractOp::EndIf);
            let frame = l.m.end_phi_stack();
            l.insert_phi(frame)
        })?;
        let latest = self.m.prev_assign(is_match);
        self.m
            .op_with(AbstractOp::If, |c| c.ref_id = Some(latest));
        self.m.op(AbstractOp::Break);
        self.m.op(AbstractOp::EndIf);
        self.append_decoded_element(element_type, base_ref, mapped, init_recursive)?;
        self.m.op(AbstractOp::EndLoop);
        Ok(())
    }

    /// Per-alternative coding of a union-typed field: the encoder guards
    /// each alternative with `CHECK_UNION`, the decoder activates it with
    /// `SWITCH_UNION`.
    fn code_union(
        &mut self,
        candidates: &[binmod_ast::UnionCandidate],
        mode: Mode,
    ) -> Result<(), LowerError> {
        let on_encode = mode == Mode::Encode;
        let mut chain_open = false;
        for candidate in candidates {
            let cond = match candidate.condition {
                Some(cond) => Some(self.get_expr(cond)?),
                None => None,
            };
            match cond {
                Some(cond) if !chain_open => {
                    self.m.init_phi_stack(cond);
                    self.m.op_with(AbstractOp::If, |c| c.ref_id = Some(cond));
                    chain_open = true;
                }
                Some(cond) => {
                    self.m.next_phi_candidate(cond);
                    self.m.op_with(AbstractOp::Elif, |c| c.ref_id = Some(cond));
                }
                None if chain_open => {
                    self.m.next_phi_candidate(ObjectId::NONE);
                    self.m.op(AbstractOp::Else);
                }
                None => {}
            }
            if let Some(field) = candidate.field {
                let member = self.union_member_ids.get(&field).copied();
                if let Some(member) = member {
                    if on_encode {
                        self.m.op_with(AbstractOp::CheckUnion, |c| {
                            c.ref_id = Some(member);
                            c.check_at = Some(binmod_core::UnionCheckAt::Encoder);
                        });
                    } else {
                        self.m
                            .op_with(AbstractOp::SwitchUnion, |c| c.ref_id = Some(member));
                    }
                }
                if on_encode {
                    self.encode_field(field)?;
                } else {
                    self.decode_field(field)?;
                }
            }
        }
        if chain_open {
            self.m.op(AbstractOp::EndIf);
            let frame = self.m.end_phi_stack();
            self.insert_phi(frame)?;
        }
        Ok(())
    }

    /// `CALL_ENCODE`/`CALL_DECODE` to another format's coder. The left ref
    /// temporarily names the format; a later pass rewrites it to the bound
    /// function.
    fn call_coder(
        &mut self,
        format: NodeId,
        base_ref: ObjectId,
        init_recursive: bool,
        on_encode: bool,
    ) -> Result<(), LowerError> {
        let ident = match self.tree.get(format)? {
            Node::Format { ident, .. } | Node::State { ident, .. } => *ident,
            other => {
                return Err(LowerError::invalid(format!(
                    "only formats can be coded, got {:?}",
                    other
                )))
            }
        };
        let fmt_id = self.lookup_ident(ident)?;
        let bit_size_plus = match self.tree.struct_bit_size(format) {
            Some(bits) => bits + 1,
            None => 0,
        };
        if init_recursive && self.recursive_formats.contains(&format) {
            let guard_op = if on_encode {
                AbstractOp::CheckRecursiveStruct
            } else {
                AbstractOp::InitRecursiveStruct
            };
            self.m.op_with(guard_op, |c| {
                c.left = Some(fmt_id);
                c.right = Some(base_ref);
            });
        }
        let call_op = if on_encode {
            AbstractOp::CallEncode
        } else {
            AbstractOp::CallDecode
        };
        self.m.op_with(call_op, |c| {
            c.left = Some(fmt_id);
            c.right = Some(base_ref);
            c.bit_size_plus = Some(bit_size_plus);
        });
        Ok(())
    }

    // -- field context helpers --

    fn field_ref(&mut self, field: Option<NodeId>) -> Result<ObjectId, LowerError> {
        match field {
            Some(node) => match self.tree.get(node)? {
                Node::Field {
                    ident: Some(ident), ..
                } => {
                    let ident = *ident;
                    self.lookup_ident(ident)
                }
                _ => Ok(ObjectId::NONE),
            },
            None => Ok(ObjectId::NONE),
        }
    }

    fn field_arguments(&self, field: Option<NodeId>) -> Option<FieldArguments> {
        let node = field?;
        match self.tree.get(node).ok()? {
            Node::Field {
                arguments: Some(args),
                ..
            } => Some(args.clone()),
            _ => None,
        }
    }

    /// An open byte vector with an alignment requirement pads the stream
    /// to the next alignment boundary.
    fn is_alignment_vector(&self, field: Option<NodeId>) -> Result<bool, LowerError> {
        Ok(self
            .field_arguments(field)
            .and_then(|a| a.alignment_value)
            .is_some())
    }

    fn field_alignment(&self, field: Option<NodeId>) -> Result<u64, LowerError> {
        self.field_arguments(field)
            .and_then(|a| a.alignment_value)
            .ok_or_else(|| LowerError::inconsistent("alignment vector without alignment"))
    }

    /// `(align - (offset % align)) % align` bytes, held in a temporary.
    fn alignment_requirement(
        &mut self,
        field: Option<NodeId>,
        on_encode: bool,
    ) -> Result<ObjectId, LowerError> {
        let align_bits = self.field_alignment(field)?;
        let offset = self.m.new_id();
        let offset_op = if on_encode {
            AbstractOp::OutputByteOffset
        } else {
            AbstractOp::InputByteOffset
        };
        self.m.op_with(offset_op, |c| c.ident = Some(offset));
        let align = self.immediate(align_bits / 8)?;
        let rem = self.emit_binary(BinaryOp::Mod, offset, align);
        let fill = self.emit_binary(BinaryOp::Sub, align, rem);
        let req = self.emit_binary(BinaryOp::Mod, fill, align);
        self.define_int_tmp_var(req)
    }

    fn field_has_sub_range(&self, field: NodeId) -> Result<bool, LowerError> {
        Ok(self
            .field_arguments(Some(field))
            .map(|a| a.sub_byte_length.is_some() || a.sub_byte_begin.is_some())
            .unwrap_or(false))
    }

    /// Classifies what follows an open-array field in its format.
    fn field_follow(&self, field: NodeId) -> Result<Follow, LowerError> {
        let Some(&(format, index)) = self.field_position.get(&field) else {
            return Ok(Follow::End);
        };
        let body = match self.tree.get(format)? {
            Node::Format { body, .. } => body,
            _ => return Ok(Follow::End),
        };
        let rest: Vec<NodeId> = body[index + 1..]
            .iter()
            .copied()
            .filter(|&n| {
                matches!(
                    self.tree.get(n),
                    Ok(Node::Field {
                        is_state_variable: false,
                        ..
                    })
                )
            })
            .collect();
        if rest.is_empty() {
            return Ok(Follow::End);
        }
        if let Ok(Node::Field { field_type, .. }) = self.tree.get(rest[0]) {
            let resolved = self.tree.resolve_type(*field_type)?;
            if matches!(self.tree.get(resolved)?, Node::StrLiteralType { .. }) {
                return Ok(Follow::Constant(resolved));
            }
        }
        let mut tail = 0u64;
        for &next in &rest {
            let Ok(Node::Field { field_type, .. }) = self.tree.get(next) else {
                return Ok(Follow::Unknown);
            };
            match self.tree.type_bit_size(*field_type) {
                Some(bits) => tail += bits,
                None => return Ok(Follow::Unknown),
            }
        }
        Ok(Follow::FixedTail(tail))
    }
}

fn map_endian(endian: binmod_ast::AstEndian) -> binmod_core::Endian {
    match endian {
        binmod_ast::AstEndian::Unspec => binmod_core::Endian::Unspec,
        binmod_ast::AstEndian::Big => binmod_core::Endian::Big,
        binmod_ast::AstEndian::Little => binmod_core::Endian::Little,
        binmod_ast::AstEndian::Native => binmod_core::Endian::Native,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_ast::{AstEndian, Tree};
    use binmod_core::Endian;

    fn ident(tree: &mut Tree, name: &str) -> NodeId {
        tree.add(Node::Ident {
            name: name.into(),
            base: None,
            expr_type: None,
        })
    }

    fn uint(tree: &mut Tree, bits: u64) -> NodeId {
        tree.add(Node::IntType {
            bit_size: bits,
            endian: AstEndian::Unspec,
            is_signed: false,
        })
    }

    fn field(tree: &mut Tree, name: &str, ty: NodeId) -> NodeId {
        let id = ident(tree, name);
        tree.add(Node::Field {
            ident: Some(id),
            field_type: ty,
            is_state_variable: false,
            arguments: None,
        })
    }

    fn format(tree: &mut Tree, name: &str, body: Vec<NodeId>) -> NodeId {
        let id = ident(tree, name);
        tree.add(Node::Format {
            ident: id,
            body,
            encode_fn: None,
            decode_fn: None,
        })
    }

    fn lower_format(tree: &Tree, fmt: NodeId) -> binmod_core::Module {
        let mut l = Lowerer::new(tree);
        l.define_format(fmt).unwrap();
        l.synthesize_coder(fmt, Mode::Encode).unwrap();
        l.synthesize_coder(fmt, Mode::Decode).unwrap();
        l.m.rebind_ident_index();
        l.m
    }

    #[test]
    fn fixed_int_field_coders() {
        let mut tree = Tree::new();
        let t16 = uint(&mut tree, 16);
        let f = field(&mut tree, "x", t16);
        let fmt = format(&mut tree, "F", vec![f]);
        let m = lower_format(&tree, fmt);

        let encode = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::EncodeInt)
            .expect("encoder writes the field");
        assert_eq!(encode.bit_size, Some(16));
        assert_eq!(encode.endian.unwrap().endian, Endian::Unspec);

        let decode = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::DecodeInt)
            .expect("decoder reads the field");
        assert_eq!(decode.bit_size, Some(16));
        assert_eq!(decode.ref_id, encode.ref_id);

        // both coders got bound to the format
        assert!(m.code.iter().any(|c| c.op == AbstractOp::DefineEncoder));
        assert!(m.code.iter().any(|c| c.op == AbstractOp::DefineDecoder));
        // the u16 shape is in the storage table
        assert!(m
            .storage_table
            .values()
            .any(|s| s == &Storages::uint(16)));
    }

    #[test]
    fn coder_functions_carry_return_type_and_parameter() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let f = field(&mut tree, "x", t8);
        let fmt = format(&mut tree, "F", vec![f]);
        let m = lower_format(&tree, fmt);

        let ops: Vec<AbstractOp> = m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops.iter()
                .filter(|&&o| o == AbstractOp::DefineFunction)
                .count(),
            2
        );
        assert!(ops.contains(&AbstractOp::EncoderParameter));
        assert!(ops.contains(&AbstractOp::DecoderParameter));
        assert_eq!(
            ops.iter()
                .filter(|&&o| o == AbstractOp::RetSuccess)
                .count(),
            2
        );
        // CODER_RETURN storage registered
        assert!(m
            .storage_table
            .values()
            .any(|s| s.head().map(|h| h.kind) == Some(StorageType::CoderReturn)));
    }

    #[test]
    fn variable_length_vector_scenario() {
        // format F { n :u8; data :[n]u8 }
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let n = field(&mut tree, "n", t8);
        let n_use = tree.add(Node::Ident {
            name: "n".into(),
            base: Some(n),
            expr_type: Some(t8),
        });
        let vec_ty = tree.add(Node::ArrayType {
            element_type: t8,
            length: Some(n_use),
            length_value: None,
        });
        let data = field(&mut tree, "data", vec_ty);
        let fmt = format(&mut tree, "F", vec![n, data]);
        let m = lower_format(&tree, fmt);

        // encoder: LENGTH_CHECK then ENCODE_INT_VECTOR
        let length_check = m
            .code
            .iter()
            .position(|c| c.op == AbstractOp::LengthCheck)
            .expect("length check on encode");
        let encode_vec = m
            .code
            .iter()
            .position(|c| c.op == AbstractOp::EncodeIntVector)
            .expect("vector encode");
        assert!(length_check < encode_vec);

        // decoder: DECODE_INT(n) then DECODE_INT_VECTOR with the length
        // temporary on the right
        let decode_vec = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::DecodeIntVector)
            .expect("vector decode");
        assert_eq!(decode_vec.bit_size, Some(8));
        let len_tmp = decode_vec.right.unwrap();
        let tmp_def = m.code_by_ident(len_tmp).unwrap();
        assert_eq!(tmp_def.op, AbstractOp::DefineVariable);
    }

    #[test]
    fn packed_bit_field_scenario() {
        // format F { bits :u3; more :u5 }
        let mut tree = Tree::new();
        let t3 = uint(&mut tree, 3);
        let t5 = uint(&mut tree, 5);
        let f1 = field(&mut tree, "bits", t3);
        let f2 = field(&mut tree, "more", t5);
        let fmt = format(&mut tree, "F", vec![f1, f2]);
        let m = lower_format(&tree, fmt);

        let begin = m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::BeginEncodePackedOperation)
            .expect("packed encode begin");
        assert_eq!(begin.packed_kind, Some(PackedOpType::Fixed));
        let encode_bits: Vec<u64> = m
            .code
            .iter()
            .filter(|c| c.op == AbstractOp::EncodeInt)
            .map(|c| c.bit_size.unwrap())
            .collect();
        assert_eq!(encode_bits, vec![3, 5]);
        assert!(m
            .code
            .iter()
            .any(|c| c.op == AbstractOp::EndEncodePackedOperation));
        assert!(m
            .code
            .iter()
            .any(|c| c.op == AbstractOp::BeginDecodePackedOperation));
    }

    #[test]
    fn recursive_format_scenario() {
        // format Tree { left :Tree?; right :Tree? } (format node id 6)
        let mut tree = Tree::new();
        let struct_ty = tree.add(Node::StructType { base: NodeId(6) });
        let opt_ty = tree.add(Node::OptionalType { base: struct_ty });
        let left = field(&mut tree, "left", opt_ty);
        let right = field(&mut tree, "right", opt_ty);
        let fmt = format(&mut tree, "Tree", vec![left, right]);
        assert_eq!(fmt, NodeId(6));
        let m = lower_format(&tree, fmt);

        // storage is OPTIONAL + RECURSIVE_STRUCT_REF
        assert!(m.storage_table.values().any(|s| {
            s.storages.len() == 2
                && s.storages[0].kind == StorageType::Optional
                && s.storages[1].kind == StorageType::RecursiveStructRef
        }));
        // encoder guards, decoder initializes
        assert_eq!(
            m.code
                .iter()
                .filter(|c| c.op == AbstractOp::CheckRecursiveStruct)
                .count(),
            2
        );
        assert_eq!(
            m.code
                .iter()
                .filter(|c| c.op == AbstractOp::InitRecursiveStruct)
                .count(),
            2
        );
    }

    #[test]
    fn array_of_recursive_structs_keeps_the_recursion_guard() {
        // format Node { child :Node? }  (format node id 5)
        // format Forest { roots :[4]Node }
        let mut tree = Tree::new();
        let self_ty = tree.add(Node::StructType { base: NodeId(5) });
        let opt_ty = tree.add(Node::OptionalType { base: self_ty });
        let child = field(&mut tree, "child", opt_ty);
        let node_fmt = format(&mut tree, "Node", vec![child]);
        assert_eq!(node_fmt, NodeId(5));

        let elem_ty = tree.add(Node::StructType { base: node_fmt });
        let arr_ty = tree.add(Node::ArrayType {
            element_type: elem_ty,
            length: None,
            length_value: Some(4),
        });
        let roots = field(&mut tree, "roots", arr_ty);
        let forest = format(&mut tree, "Forest", vec![roots]);

        let mut l = Lowerer::new(&tree);
        l.define_format(node_fmt).unwrap();
        l.define_format(forest).unwrap();
        l.synthesize_coder(forest, Mode::Encode).unwrap();
        l.synthesize_coder(forest, Mode::Decode).unwrap();
        let m = l.m;

        // the per-element calls are the outermost call sites for the
        // recursion, so the guards must survive the array loop
        assert_eq!(
            m.code
                .iter()
                .filter(|c| c.op == AbstractOp::CheckRecursiveStruct)
                .count(),
            1
        );
        assert_eq!(
            m.code
                .iter()
                .filter(|c| c.op == AbstractOp::InitRecursiveStruct)
                .count(),
            1
        );
        // and each guard sits right before its coder call
        let check = m
            .code
            .iter()
            .position(|c| c.op == AbstractOp::CheckRecursiveStruct)
            .unwrap();
        assert_eq!(m.code[check + 1].op, AbstractOp::CallEncode);
    }

    #[test]
    fn open_byte_vector_reads_until_eof() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let open = tree.add(Node::ArrayType {
            element_type: t8,
            length: None,
            length_value: None,
        });
        let f = field(&mut tree, "rest", open);
        let fmt = format(&mut tree, "F", vec![f]);
        let m = lower_format(&tree, fmt);
        assert!(m
            .code
            .iter()
            .any(|c| c.op == AbstractOp::DecodeIntVectorUntilEof));
    }

    #[test]
    fn open_vector_before_fixed_tail_uses_remain_bytes() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let t32 = uint(&mut tree, 32);
        let open = tree.add(Node::ArrayType {
            element_type: t8,
            length: None,
            length_value: None,
        });
        let data = field(&mut tree, "data", open);
        let crc = field(&mut tree, "crc", t32);
        let fmt = format(&mut tree, "F", vec![data, crc]);
        let m = lower_format(&tree, fmt);
        assert!(m.code.iter().any(|c| c.op == AbstractOp::RemainBytes));
        // remainder divisibility is asserted
        assert!(m.code.iter().any(|c| c.op == AbstractOp::Assert));
    }

    #[test]
    fn string_literal_field_asserts_on_decode() {
        let mut tree = Tree::new();
        let lit = tree.add(Node::StrLiteral {
            value: "MAGIC".into(),
            length: 5,
        });
        let lit_ty = tree.add(Node::StrLiteralType {
            literal: lit,
            bit_size: 40,
        });
        let f = field(&mut tree, "magic", lit_ty);
        let fmt = format(&mut tree, "F", vec![f]);
        let m = lower_format(&tree, fmt);
        assert!(m.code.iter().any(|c| c.op == AbstractOp::ImmediateString));
        assert!(m.code.iter().any(|c| c.op == AbstractOp::Assert));
        assert!(m.string_table.contains_key("MAGIC"));
    }

    #[test]
    fn float_field_roundtrips_through_int_bits() {
        let mut tree = Tree::new();
        let f32_ty = tree.add(Node::FloatType {
            bit_size: 32,
            endian: AstEndian::Unspec,
        });
        let f = field(&mut tree, "value", f32_ty);
        let fmt = format(&mut tree, "F", vec![f]);
        let m = lower_format(&tree, fmt);
        let casts: Vec<_> = m
            .code
            .iter()
            .filter(|c| c.op == AbstractOp::Cast)
            .collect();
        assert!(casts
            .iter()
            .any(|c| c.cast_kind == Some(binmod_core::CastType::FloatToIntBit)));
        assert!(casts
            .iter()
            .any(|c| c.cast_kind == Some(binmod_core::CastType::IntToFloatBit)));
    }

    #[test]
    fn enum_field_casts_through_base_type() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let m_ident = ident(&mut tree, "A");
        let v = tree.add(Node::IntLiteral {
            value: 0,
            expr_type: None,
        });
        let member = tree.add(Node::EnumMember {
            ident: m_ident,
            value: v,
        });
        let e_ident = ident(&mut tree, "Color");
        let e = tree.add(Node::EnumDecl {
            ident: e_ident,
            base_type: Some(t8),
            members: vec![member],
        });
        let e_ty = tree.add(Node::EnumType { base: e });
        let f = field(&mut tree, "color", e_ty);
        let fmt = format(&mut tree, "F", vec![f]);

        let mut l = Lowerer::new(&tree);
        l.define_enum(e).unwrap();
        l.define_format(fmt).unwrap();
        l.synthesize_coder(fmt, Mode::Encode).unwrap();
        l.synthesize_coder(fmt, Mode::Decode).unwrap();
        let m = l.m;

        let casts: Vec<_> = m
            .code
            .iter()
            .filter(|c| c.op == AbstractOp::Cast)
            .collect();
        assert!(casts
            .iter()
            .any(|c| c.cast_kind == Some(binmod_core::CastType::EnumToInt)));
        assert!(casts
            .iter()
            .any(|c| c.cast_kind == Some(binmod_core::CastType::IntToEnum)));
    }
}
