//! Definition lowering: formats, enums, states, fields, unions, and
//! bit-field grouping.
//!
//! Definitions are emitted nested exactly as written; the flatten pass
//! later hoists inner definitions to the top level and leaves `DECLARE_*`
//! stubs behind. A run of consecutive fields whose widths do not land on
//! byte boundaries is wrapped in a `DEFINE_BIT_FIELD` group; a field with
//! a union type becomes a `DEFINE_PROPERTY` holding the union scaffolding
//! plus one `CONDITIONAL_FIELD` per alternative.

use binmod_ast::{Node, NodeId};
use binmod_core::{AbstractOp, ObjectId, Storage, StorageType, Storages};

use crate::error::LowerError;
use crate::{IdentSalt, Lowerer, Mode};

impl<'a> Lowerer<'a> {
    pub(crate) fn define_format(&mut self, node: NodeId) -> Result<(), LowerError> {
        let (ident, body) = match self.tree.get(node)? {
            Node::Format { ident, body, .. } => (*ident, body.clone()),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "define_format on {:?}",
                    other
                )))
            }
        };
        let id = self.lookup_ident(ident)?;
        let belong = self.current_scope();
        let shape = Storages::single(Storage::referencing(StorageType::StructRef, id));
        let ty = self.m.get_storage_ref(shape);
        self.m.op_with(AbstractOp::DefineFormat, |c| {
            c.ident = Some(id);
            c.belong = Some(belong);
            c.ty = Some(ty);
        });
        self.scope_stack.push(id);
        self.group_bit_fields(&body)?;
        self.define_format_body(&body)?;
        self.scope_stack.pop();
        self.m.op(AbstractOp::EndFormat);
        Ok(())
    }

    /// Walks a format body in definition mode, wrapping packed runs in
    /// `DEFINE_BIT_FIELD` groups.
    fn define_format_body(&mut self, body: &[NodeId]) -> Result<(), LowerError> {
        let mut open_bit_field = false;
        for &element in body {
            if let Some(&group) = self.bit_field_begin.get(&element) {
                let belong = self.current_scope();
                self.m.op_with(AbstractOp::DefineBitField, |c| {
                    c.ident = Some(group);
                    c.belong = Some(belong);
                });
                self.scope_stack.push(group);
                open_bit_field = true;
            }
            self.m.set_prev_expr(ObjectId::NONE);
            self.eval_node(element, Mode::Definition)?;
            if open_bit_field && self.bit_field_end.contains(&element) {
                self.scope_stack.pop();
                self.m.op(AbstractOp::EndBitField);
                open_bit_field = false;
            }
        }
        Ok(())
    }

    /// Finds maximal runs of int fields that straddle byte boundaries and
    /// records their begin/end markers for both the definition walk and
    /// the coder walks.
    pub(crate) fn group_bit_fields(&mut self, body: &[NodeId]) -> Result<(), LowerError> {
        let mut run: Vec<NodeId> = Vec::new();
        let mut run_bits: u64 = 0;
        let mut flush = |l: &mut Self, run: &mut Vec<NodeId>, run_bits: &mut u64| {
            if run.len() > 1 {
                let group = l.m.new_id();
                l.bit_field_begin.insert(run[0], group);
                l.bit_field_end.insert(*run.last().unwrap());
            }
            run.clear();
            *run_bits = 0;
        };
        for &element in body {
            let field_bits = match self.tree.get(element)? {
                Node::Field {
                    field_type,
                    is_state_variable: false,
                    ..
                } => self.int_type_bits(*field_type)?,
                _ => None,
            };
            match field_bits {
                Some(bits) if bits % 8 != 0 || run_bits % 8 != 0 => {
                    run.push(element);
                    run_bits += bits;
                    if run_bits % 8 == 0 {
                        flush(self, &mut run, &mut run_bits);
                    }
                }
                _ => flush(self, &mut run, &mut run_bits),
            }
        }
        flush(self, &mut run, &mut run_bits);
        Ok(())
    }

    fn int_type_bits(&self, type_node: NodeId) -> Result<Option<u64>, LowerError> {
        let resolved = self.tree.resolve_type(type_node)?;
        Ok(match self.tree.get(resolved)? {
            Node::IntType { bit_size, .. } => Some(*bit_size),
            _ => None,
        })
    }

    pub(crate) fn define_field(&mut self, node: NodeId) -> Result<(), LowerError> {
        let (ident, field_type) = match self.tree.get(node)? {
            Node::Field {
                ident, field_type, ..
            } => (*ident, *field_type),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "define_field on {:?}",
                    other
                )))
            }
        };
        let resolved = self.tree.resolve_type(field_type)?;
        if let Node::UnionType { .. } = self.tree.get(resolved)? {
            return self.define_union_field(node, resolved);
        }

        let id = match ident {
            Some(ident) => self.lookup_ident(ident)?,
            None => self.m.new_id(),
        };
        let belong = self.current_scope();
        let ty = self.define_storage(field_type, true)?;

        // Record the vector-length link for the property pass: a vector
        // field whose length is a plain sibling-field identifier gets a
        // derived length setter later.
        let mut length_field = None;
        let mut length_bits = None;
        if let Node::ArrayType {
            length: Some(length),
            length_value: None,
            ..
        } = self.tree.get(resolved)?
        {
            if let Node::Ident { .. } = self.tree.get(*length)? {
                if matches!(
                    self.tree.get(self.ident_decl(*length)),
                    Ok(Node::Field { .. })
                ) {
                    length_field = Some(self.lookup_ident(*length)?);
                    length_bits = self
                        .tree
                        .expr_type(*length)
                        .and_then(|t| self.tree.type_bit_size(t));
                }
            }
        }

        self.m.op_with(AbstractOp::DefineField, |c| {
            c.ident = Some(id);
            c.belong = Some(belong);
            c.ty = Some(ty);
            c.right = length_field;
            c.bit_size = length_bits;
        });
        Ok(())
    }

    /// A union-typed field becomes a property holding the union
    /// scaffolding and a cascade of conditional fields, one per
    /// alternative, whose conditions chain through `NOT_PREV_THEN`.
    fn define_union_field(
        &mut self,
        field_node: NodeId,
        union_type: NodeId,
    ) -> Result<(), LowerError> {
        let ident = match self.tree.get(field_node)? {
            Node::Field { ident, .. } => *ident,
            _ => unreachable!("checked by caller"),
        };
        let candidates = match self.tree.get(union_type)? {
            Node::UnionType { candidates, .. } => candidates.clone(),
            _ => unreachable!("checked by caller"),
        };
        let property_id = match ident {
            Some(ident) => self.lookup_ident(ident)?,
            None => self.m.new_id(),
        };
        let belong = self.current_scope();
        self.m.op_with(AbstractOp::DefineProperty, |c| {
            c.ident = Some(property_id);
            c.belong = Some(belong);
        });
        self.scope_stack.push(property_id);

        let union_id = self.synthesized_ident(union_type, IdentSalt::Union, "union");
        self.m.op_with(AbstractOp::DefineUnion, |c| {
            c.ident = Some(union_id);
            c.belong = Some(property_id);
        });
        let mut member_fields = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let member_id = self.m.new_id();
            self.m.op_with(AbstractOp::DefineUnionMember, |c| {
                c.ident = Some(member_id);
                c.belong = Some(union_id);
            });
            if let Some(field) = candidate.field {
                self.union_member_ids.insert(field, member_id);
            }
            self.scope_stack.push(member_id);
            let field_id = match candidate.field {
                Some(field) => {
                    self.define_field(field)?;
                    self.m
                        .code
                        .last()
                        .and_then(|c| c.ident)
                        .ok_or_else(|| LowerError::inconsistent("union member without field"))?
                }
                None => ObjectId::NONE,
            };
            self.scope_stack.pop();
            self.m.op(AbstractOp::EndUnionMember);
            member_fields.push(field_id);
        }
        self.m.op(AbstractOp::EndUnion);

        // Conditional-field cascade: each alternative's effective
        // condition links to the previous one through NOT_PREV_THEN so
        // later passes can reconstruct the priority chain.
        let mut prev_effective: Option<ObjectId> = None;
        for (candidate, &field_id) in candidates.iter().zip(&member_fields) {
            let own_cond = match candidate.condition {
                Some(cond) => self.get_expr(cond)?,
                None => self.immediate_bool(true)?,
            };
            let effective = match prev_effective {
                None => own_cond,
                Some(prev) => {
                    let id = self.m.new_id();
                    self.m.op_with(AbstractOp::NotPrevThen, |c| {
                        c.ident = Some(id);
                        c.left = Some(prev);
                        c.right = Some(own_cond);
                    });
                    id
                }
            };
            let cf = self.m.new_id();
            self.m.op_with(AbstractOp::ConditionalField, |c| {
                c.ident = Some(cf);
                c.left = Some(effective);
                c.right = Some(field_id);
                c.belong = Some(property_id);
            });
            prev_effective = Some(effective);
        }

        self.scope_stack.pop();
        self.m.op(AbstractOp::EndProperty);
        Ok(())
    }

    pub(crate) fn define_enum(&mut self, node: NodeId) -> Result<(), LowerError> {
        let (ident, base_type, members) = match self.tree.get(node)? {
            Node::EnumDecl {
                ident,
                base_type,
                members,
            } => (*ident, *base_type, members.clone()),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "define_enum on {:?}",
                    other
                )))
            }
        };
        let id = self.lookup_ident(ident)?;
        let belong = self.current_scope();
        let ty = match base_type {
            Some(bt) => Some(self.define_storage(bt, false)?),
            None => None,
        };
        self.m.op_with(AbstractOp::DefineEnum, |c| {
            c.ident = Some(id);
            c.belong = Some(belong);
            c.ty = ty;
        });
        for member in members {
            let (member_ident, value) = match self.tree.get(member)? {
                Node::EnumMember { ident, value } => (*ident, *value),
                other => {
                    return Err(LowerError::invalid(format!(
                        "enum member expected, got {:?}",
                        other
                    )))
                }
            };
            let value_id = self.get_expr(value)?;
            let member_id = self.lookup_ident(member_ident)?;
            self.m.op_with(AbstractOp::DefineEnumMember, |c| {
                c.ident = Some(member_id);
                c.belong = Some(id);
                c.ref_id = Some(value_id);
            });
        }
        self.m.op(AbstractOp::EndEnum);
        Ok(())
    }

    pub(crate) fn define_state(&mut self, node: NodeId) -> Result<(), LowerError> {
        let (ident, fields) = match self.tree.get(node)? {
            Node::State { ident, fields } => (*ident, fields.clone()),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "define_state on {:?}",
                    other
                )))
            }
        };
        let id = self.lookup_ident(ident)?;
        let belong = self.current_scope();
        self.m.op_with(AbstractOp::DefineState, |c| {
            c.ident = Some(id);
            c.belong = Some(belong);
        });
        self.scope_stack.push(id);
        for field in fields {
            self.define_field(field)?;
        }
        self.scope_stack.pop();
        self.m.op(AbstractOp::EndState);
        Ok(())
    }

    pub(crate) fn define_function(&mut self, node: NodeId) -> Result<(), LowerError> {
        let (ident, params, body, return_type) = match self.tree.get(node)? {
            Node::FunctionDecl {
                ident,
                params,
                body,
                return_type,
                ..
            } => (*ident, params.clone(), body.clone(), *return_type),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "define_function on {:?}",
                    other
                )))
            }
        };
        let id = self.lookup_ident(ident)?;
        let belong = self.current_scope();
        self.m.op_with(AbstractOp::DefineFunction, |c| {
            c.ident = Some(id);
            c.belong = Some(belong);
            c.func_kind = Some(binmod_core::FunctionKind::Free);
        });
        if let Some(rt) = return_type {
            let ty = self.define_storage(rt, false)?;
            self.m
                .op_with(AbstractOp::ReturnType, |c| c.ty = Some(ty));
        }
        for param in params {
            let (param_ident, param_type) = match self.tree.get(param)? {
                Node::Field {
                    ident: Some(ident),
                    field_type,
                    ..
                } => (*ident, *field_type),
                other => {
                    return Err(LowerError::invalid(format!(
                        "function parameter expected, got {:?}",
                        other
                    )))
                }
            };
            let param_id = self.lookup_ident(param_ident)?;
            let ty = self.define_storage(param_type, false)?;
            self.m.op_with(AbstractOp::DefineParameter, |c| {
                c.ident = Some(param_id);
                c.belong = Some(id);
                c.ty = Some(ty);
            });
        }
        self.m.enter_function(id);
        self.scope_stack.push(id);
        self.eval_stmt_list(&body, Mode::Definition)?;
        self.scope_stack.pop();
        self.m.exit_function();
        self.m.op(AbstractOp::EndFunction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_ast::{AstEndian, Tree, UnionCandidate};

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

    #[test]
    fn format_definition_emits_fields_in_order() {
        let mut tree = Tree::new();
        let t16 = uint(&mut tree, 16);
        let f = field(&mut tree, "x", t16);
        let fmt_ident = ident(&mut tree, "F");
        let fmt = tree.add(Node::Format {
            ident: fmt_ident,
            body: vec![f],
            encode_fn: None,
            decode_fn: None,
        });
        let mut l = Lowerer::new(&tree);
        l.define_format(fmt).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::DefineFormat,
                AbstractOp::DefineField,
                AbstractOp::EndFormat
            ]
        );
        let field_code = &l.m.code[1];
        assert_eq!(field_code.belong, l.m.code[0].ident);
    }

    #[test]
    fn bit_field_grouping_wraps_sub_byte_run() {
        let mut tree = Tree::new();
        let t3 = uint(&mut tree, 3);
        let t5 = uint(&mut tree, 5);
        let t8 = uint(&mut tree, 8);
        let f1 = field(&mut tree, "bits", t3);
        let f2 = field(&mut tree, "more", t5);
        let f3 = field(&mut tree, "tail", t8);
        let fmt_ident = ident(&mut tree, "F");
        let fmt = tree.add(Node::Format {
            ident: fmt_ident,
            body: vec![f1, f2, f3],
            encode_fn: None,
            decode_fn: None,
        });
        let mut l = Lowerer::new(&tree);
        l.define_format(fmt).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::DefineFormat,
                AbstractOp::DefineBitField,
                AbstractOp::DefineField,
                AbstractOp::DefineField,
                AbstractOp::EndBitField,
                AbstractOp::DefineField,
                AbstractOp::EndFormat
            ]
        );
        // members belong to the bit field, the byte-aligned tail to the
        // format
        let group = l.m.code[1].ident.unwrap();
        assert_eq!(l.m.code[2].belong, Some(group));
        assert_eq!(l.m.code[3].belong, Some(group));
        assert_eq!(l.m.code[5].belong, l.m.code[0].ident);
    }

    #[test]
    fn byte_aligned_fields_are_not_grouped() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let t16 = uint(&mut tree, 16);
        let f1 = field(&mut tree, "a", t8);
        let f2 = field(&mut tree, "b", t16);
        let fmt_ident = ident(&mut tree, "F");
        let fmt = tree.add(Node::Format {
            ident: fmt_ident,
            body: vec![f1, f2],
            encode_fn: None,
            decode_fn: None,
        });
        let mut l = Lowerer::new(&tree);
        l.define_format(fmt).unwrap();
        assert!(!l
            .m
            .code
            .iter()
            .any(|c| c.op == AbstractOp::DefineBitField));
    }

    #[test]
    fn enum_definition_emits_members_with_values() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let m1_ident = ident(&mut tree, "A");
        let v1 = tree.add(Node::IntLiteral {
            value: 1,
            expr_type: None,
        });
        let m1 = tree.add(Node::EnumMember {
            ident: m1_ident,
            value: v1,
        });
        let e_ident = ident(&mut tree, "E");
        let e = tree.add(Node::EnumDecl {
            ident: e_ident,
            base_type: Some(t8),
            members: vec![m1],
        });
        let mut l = Lowerer::new(&tree);
        l.define_enum(e).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::ImmediateInt,
                AbstractOp::DefineEnum,
                AbstractOp::DefineEnumMember,
                AbstractOp::EndEnum
            ]
        );
    }

    #[test]
    fn union_field_emits_property_with_conditional_cascade() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let t16 = uint(&mut tree, 16);
        let alt1 = field(&mut tree, "narrow", t8);
        let alt2 = field(&mut tree, "wide", t16);
        let cond1 = tree.add(Node::BoolLiteral { value: true });
        let union_ty = tree.add(Node::UnionType {
            cond_base: None,
            candidates: vec![
                UnionCandidate {
                    condition: Some(cond1),
                    field: Some(alt1),
                },
                UnionCandidate {
                    condition: None,
                    field: Some(alt2),
                },
            ],
            common_type: None,
        });
        let u_ident = ident(&mut tree, "value");
        let u_field = tree.add(Node::Field {
            ident: Some(u_ident),
            field_type: union_ty,
            is_state_variable: false,
            arguments: None,
        });
        let fmt_ident = ident(&mut tree, "F");
        let fmt = tree.add(Node::Format {
            ident: fmt_ident,
            body: vec![u_field],
            encode_fn: None,
            decode_fn: None,
        });
        let mut l = Lowerer::new(&tree);
        l.define_format(fmt).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert!(ops.contains(&AbstractOp::DefineProperty));
        assert!(ops.contains(&AbstractOp::DefineUnion));
        assert_eq!(
            ops.iter()
                .filter(|&&o| o == AbstractOp::DefineUnionMember)
                .count(),
            2
        );
        assert_eq!(
            ops.iter()
                .filter(|&&o| o == AbstractOp::ConditionalField)
                .count(),
            2
        );
        assert!(ops.contains(&AbstractOp::NotPrevThen));

        // second conditional field chains through NOT_PREV_THEN
        let cfs: Vec<_> = l
            .m
            .code
            .iter()
            .filter(|c| c.op == AbstractOp::ConditionalField)
            .collect();
        let chain = l
            .m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::NotPrevThen)
            .unwrap();
        assert_eq!(cfs[1].left, chain.ident);
        assert_eq!(cfs[0].left, chain.left);
    }

    #[test]
    fn vector_field_records_length_link() {
        let mut tree = Tree::new();
        let t8 = uint(&mut tree, 8);
        let n_field = field(&mut tree, "n", t8);
        let n_use = tree.add(Node::Ident {
            name: "n".into(),
            base: Some(n_field),
            expr_type: Some(t8),
        });
        let vec_ty = tree.add(Node::ArrayType {
            element_type: t8,
            length: Some(n_use),
            length_value: None,
        });
        let data = field(&mut tree, "data", vec_ty);
        let fmt_ident = ident(&mut tree, "F");
        let fmt = tree.add(Node::Format {
            ident: fmt_ident,
            body: vec![n_field, data],
            encode_fn: None,
            decode_fn: None,
        });
        let mut l = Lowerer::new(&tree);
        l.define_format(fmt).unwrap();
        let data_code = l
            .m
            .code
            .iter()
            .filter(|c| c.op == AbstractOp::DefineField)
            .last()
            .unwrap();
        let n_code = l
            .m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::DefineField)
            .unwrap();
        assert_eq!(data_code.right, n_code.ident);
        assert_eq!(data_code.bit_size, Some(8));
    }
}
