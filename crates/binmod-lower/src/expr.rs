//! Expression lowering.
//!
//! Every expression lowers to the id of the opcode producing its value;
//! subexpression opcodes are appended along the way. Integer and boolean
//! immediates are deduplicated module-wide.

use binmod_ast::{AstBinaryOp, AstUnaryOp, Node, NodeId};
use binmod_core::varint::fits_varint;
use binmod_core::{
    AbstractOp, BinaryOp, CastType, ObjectId, StorageRef, Storages, UnaryOp,
};

use crate::error::LowerError;
use crate::{Lowerer, Mode};

impl<'a> Lowerer<'a> {
    /// Deduplicated integer immediate. Values outside the varint range
    /// fall back to the raw 64-bit form.
    pub fn immediate(&mut self, value: u64) -> Result<ObjectId, LowerError> {
        if let Some(&id) = self.m.immediate_table.get(&value) {
            return Ok(id);
        }
        let id = self.m.new_id();
        if fits_varint(value) {
            self.m.op_with(AbstractOp::ImmediateInt, |c| {
                c.ident = Some(id);
                c.int_value = Some(value);
            });
        } else {
            self.m.op_with(AbstractOp::ImmediateInt64, |c| {
                c.ident = Some(id);
                c.int_value64 = Some(value);
            });
        }
        self.m.immediate_table.insert(value, id);
        Ok(id)
    }

    /// The singleton true/false immediates.
    pub fn immediate_bool(&mut self, value: bool) -> Result<ObjectId, LowerError> {
        if value {
            if let Some(id) = self.m.true_id {
                return Ok(id);
            }
        } else if let Some(id) = self.m.false_id {
            return Ok(id);
        }
        let id = self.m.new_id();
        if value {
            self.m
                .op_with(AbstractOp::ImmediateTrue, |c| c.ident = Some(id));
            self.m.true_id = Some(id);
        } else {
            self.m
                .op_with(AbstractOp::ImmediateFalse, |c| c.ident = Some(id));
            self.m.false_id = Some(id);
        }
        Ok(id)
    }

    /// Interned string literal immediate, one opcode per distinct string.
    pub fn static_str(&mut self, literal: NodeId) -> Result<ObjectId, LowerError> {
        let value = match self.tree.get(literal)? {
            Node::StrLiteral { value, .. } => value.clone(),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "expected string literal, got {:?}",
                    other
                )))
            }
        };
        let interned = self.m.intern_string(&value);
        if let Some(&id) = self.string_immediates.get(&interned) {
            return Ok(id);
        }
        let id = self.m.new_id();
        self.m.op_with(AbstractOp::ImmediateString, |c| {
            c.ident = Some(id);
            c.string_ref = Some(interned);
        });
        self.string_immediates.insert(interned, id);
        Ok(id)
    }

    /// The storage shape of an expression, when its type is known.
    pub fn may_get_type(&mut self, expr: NodeId) -> Result<Option<Storages>, LowerError> {
        let Some(mut ty) = self.tree.expr_type(expr) else {
            return Ok(None);
        };
        // A union-typed expression reads as its common type.
        if let Node::UnionType {
            common_type: Some(common),
            ..
        } = self.tree.get(self.tree.resolve_type(ty)?)?
        {
            ty = *common;
        }
        match self.build_storages(ty, false) {
            Ok(shape) => Ok(Some(shape)),
            Err(_) => Ok(None),
        }
    }

    /// Lowers an expression, returning the id of its value.
    pub fn get_expr(&mut self, expr: NodeId) -> Result<ObjectId, LowerError> {
        let node = self.tree.get(expr)?.clone();
        let id = match node {
            Node::IntLiteral { value, .. } => self.immediate(value)?,
            Node::BoolLiteral { value } => self.immediate_bool(value)?,
            Node::StrLiteral { .. } => self.static_str(expr)?,
            Node::CharLiteral { value } => {
                let id = self.m.new_id();
                self.m.op_with(AbstractOp::ImmediateChar, |c| {
                    c.ident = Some(id);
                    c.int_value = Some(value as u64);
                });
                id
            }
            Node::Ident { .. } => self.lookup_ident(expr)?,
            Node::Binary {
                op, left, right, ..
            } => self.lower_binary(op, left, right)?,
            Node::Unary { op, operand, .. } => {
                let inner = self.get_expr(operand)?;
                let id = self.m.new_id();
                let un_op = match op {
                    AstUnaryOp::Not => UnaryOp::LogicalNot,
                    AstUnaryOp::BitNot => UnaryOp::BitNot,
                    AstUnaryOp::Minus => UnaryOp::MinusSign,
                };
                self.m.op_with(AbstractOp::Unary, |c| {
                    c.ident = Some(id);
                    c.ref_id = Some(inner);
                    c.un_op = Some(un_op);
                });
                id
            }
            Node::MemberAccess { target, member, .. } => {
                // Enum member access resolves to the member itself.
                let enum_member = matches!(
                    self.tree.get(self.ident_decl(member)),
                    Ok(Node::EnumMember { .. })
                );
                if enum_member {
                    self.lookup_ident(member)?
                } else {
                    let left = self.get_expr(target)?;
                    let right = self.lookup_ident(member)?;
                    let id = self.m.new_id();
                    self.m.op_with(AbstractOp::Access, |c| {
                        c.ident = Some(id);
                        c.left = Some(left);
                        c.right = Some(right);
                    });
                    id
                }
            }
            Node::IndexExpr { target, index, .. } => {
                let left = self.get_expr(target)?;
                let right = self.get_expr(index)?;
                self.emit_index(left, right)
            }
            Node::CastExpr { target_type, expr: inner } => {
                let value = self.get_expr(inner)?;
                let to = self.build_storages(target_type, false)?;
                let from = self.may_get_type(inner)?;
                let to_ref = self.m.get_storage_ref(to.clone());
                let (from_ref, kind) = match from {
                    Some(from) => (
                        self.m.get_storage_ref(from.clone()),
                        get_cast_type(&to, &from),
                    ),
                    None => (StorageRef::NONE, CastType::Other),
                };
                self.emit_cast(to_ref, from_ref, value, kind)
            }
            Node::CallExpr { callee, args, .. } => {
                let callee_id = self.get_expr(callee)?;
                let mut params = Vec::with_capacity(args.len());
                for arg in args {
                    params.push(self.get_expr(arg)?);
                }
                let id = self.m.new_id();
                self.m.op_with(AbstractOp::Call, |c| {
                    c.ident = Some(id);
                    c.ref_id = Some(callee_id);
                    c.params = Some(params);
                });
                id
            }
            Node::If { .. } => {
                self.convert_if(expr, Mode::Definition)?;
                self.m.prev_expr().ok_or_else(|| {
                    LowerError::invalid("if used as expression yields no value")
                })?
            }
            Node::Match { .. } => {
                self.convert_match(expr, Mode::Definition)?;
                self.m.prev_expr().ok_or_else(|| {
                    LowerError::invalid("match used as expression yields no value")
                })?
            }
            Node::RangeExpr { .. } => {
                return Err(LowerError::invalid(
                    "a bare range is only meaningful inside a comparison or loop",
                ))
            }
            other => {
                return Err(LowerError::invalid(format!(
                    "cannot lower {:?} as an expression",
                    other
                )))
            }
        };
        self.m.set_prev_expr(id);
        Ok(id)
    }

    fn lower_binary(
        &mut self,
        op: AstBinaryOp,
        left: NodeId,
        right: NodeId,
    ) -> Result<ObjectId, LowerError> {
        // `x == a..b` / `x != a..b` funnel through the range comparison.
        if matches!(op, AstBinaryOp::Equal | AstBinaryOp::NotEqual) {
            if let Ok(Node::RangeExpr { .. }) = self.tree.get(right) {
                let base = self.get_expr(left)?;
                let outer = if op == AstBinaryOp::Equal {
                    BinaryOp::Equal
                } else {
                    BinaryOp::NotEqual
                };
                return self.do_range_compare(outer, right, base);
            }
        }
        match op {
            AstBinaryOp::LogicalAnd => self.lower_short_circuit(left, right, true),
            AstBinaryOp::LogicalOr => self.lower_short_circuit(left, right, false),
            AstBinaryOp::Assign | AstBinaryOp::DefineAssign | AstBinaryOp::ConstAssign => {
                Err(LowerError::invalid(
                    "assignment is a statement, not an expression",
                ))
            }
            AstBinaryOp::InAssign => Err(LowerError::invalid(
                "`in` binding is only valid as a loop initializer",
            )),
            other => {
                let bin_op = map_binary_op(other)?;
                let l = self.get_expr(left)?;
                let r = self.get_expr(right)?;
                Ok(self.emit_binary(bin_op, l, r))
            }
        }
    }

    /// `a && b` / `a || b` through a temporary so the right operand only
    /// evaluates when needed.
    fn lower_short_circuit(
        &mut self,
        left: NodeId,
        right: NodeId,
        is_and: bool,
    ) -> Result<ObjectId, LowerError> {
        let lhs = self.get_expr(left)?;
        let tmp = self.define_bool_tmp_var(lhs)?;
        let cond = if is_and {
            tmp
        } else {
            let id = self.m.new_id();
            self.m.op_with(AbstractOp::Unary, |c| {
                c.ident = Some(id);
                c.ref_id = Some(tmp);
                c.un_op = Some(UnaryOp::LogicalNot);
            });
            id
        };
        self.m.init_phi_stack(cond);
        self.m.op_with(AbstractOp::If, |c| c.ref_id = Some(cond));
        let rhs = self.get_expr(right)?;
        self.do_assign(None, None, tmp, rhs, false)?;
        self.m.op(AbstractOp::EndIf);
        let frame = self.m.end_phi_stack();
        self.insert_phi(frame)?;
        Ok(self.m.prev_assign(tmp))
    }

    /// Range membership: `base in [lo..hi]` as `lo <= base && base < hi`
    /// (`<=` for the inclusive form). `outer` selects membership or its
    /// negation.
    pub fn do_range_compare(
        &mut self,
        outer: BinaryOp,
        range: NodeId,
        base: ObjectId,
    ) -> Result<ObjectId, LowerError> {
        let (start, end, inclusive) = match self.tree.get(range)? {
            Node::RangeExpr {
                start,
                end,
                inclusive,
                ..
            } => (*start, *end, *inclusive),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "range comparison against {:?}",
                    other
                )))
            }
        };
        let lo = match start {
            Some(s) => {
                let lo = self.get_expr(s)?;
                Some(self.emit_binary(BinaryOp::LessOrEq, lo, base))
            }
            None => None,
        };
        let hi = match end {
            Some(e) => {
                let hi = self.get_expr(e)?;
                let op = if inclusive {
                    BinaryOp::LessOrEq
                } else {
                    BinaryOp::Less
                };
                Some(self.emit_binary(op, base, hi))
            }
            None => None,
        };
        let within = match (lo, hi) {
            (Some(l), Some(h)) => self.emit_binary(BinaryOp::LogicalAnd, l, h),
            (Some(l), None) => l,
            (None, Some(h)) => h,
            (None, None) => self.immediate_bool(true)?,
        };
        let result = if outer == BinaryOp::NotEqual {
            let id = self.m.new_id();
            self.m.op_with(AbstractOp::Unary, |c| {
                c.ident = Some(id);
                c.ref_id = Some(within);
                c.un_op = Some(UnaryOp::LogicalNot);
            });
            id
        } else {
            within
        };
        self.m.set_prev_expr(result);
        Ok(result)
    }

    // -- small emit helpers --

    pub(crate) fn emit_binary(&mut self, op: BinaryOp, left: ObjectId, right: ObjectId) -> ObjectId {
        let id = self.m.new_id();
        self.m.op_with(AbstractOp::Binary, |c| {
            c.ident = Some(id);
            c.bin_op = Some(op);
            c.left = Some(left);
            c.right = Some(right);
        });
        id
    }

    pub(crate) fn emit_index(&mut self, target: ObjectId, index: ObjectId) -> ObjectId {
        let id = self.m.new_id();
        self.m.op_with(AbstractOp::Index, |c| {
            c.ident = Some(id);
            c.left = Some(target);
            c.right = Some(index);
        });
        id
    }

    pub(crate) fn emit_cast(
        &mut self,
        to: StorageRef,
        from: StorageRef,
        value: ObjectId,
        kind: CastType,
    ) -> ObjectId {
        let id = self.m.new_id();
        self.m.op_with(AbstractOp::Cast, |c| {
            c.ident = Some(id);
            c.ty = Some(to);
            c.from_ty = Some(from);
            c.ref_id = Some(value);
            c.cast_kind = Some(kind);
        });
        id
    }

    pub(crate) fn new_object(&mut self, ty: StorageRef) -> ObjectId {
        let id = self.m.new_id();
        self.m.op_with(AbstractOp::NewObject, |c| {
            c.ident = Some(id);
            c.ty = Some(ty);
        });
        id
    }

    /// `DEFINE_VARIABLE ident ref=init type=ty`, returning the variable id.
    pub(crate) fn define_var(
        &mut self,
        ident: ObjectId,
        init: ObjectId,
        ty: StorageRef,
    ) -> ObjectId {
        self.m.op_with(AbstractOp::DefineVariable, |c| {
            c.ident = Some(ident);
            c.ref_id = Some(init);
            c.ty = Some(ty);
        });
        ident
    }

    /// Anonymous typed temporary initialized from `init`.
    pub(crate) fn define_typed_tmp_var(
        &mut self,
        init: ObjectId,
        ty: StorageRef,
    ) -> Result<ObjectId, LowerError> {
        let id = self.m.new_id();
        Ok(self.define_var(id, init, ty))
    }

    pub(crate) fn define_int_tmp_var(&mut self, init: ObjectId) -> Result<ObjectId, LowerError> {
        let ty = self.m.get_storage_ref(Storages::uint(64));
        self.define_typed_tmp_var(init, ty)
    }

    pub(crate) fn define_bool_tmp_var(&mut self, init: ObjectId) -> Result<ObjectId, LowerError> {
        let ty = self.m.get_storage_ref(Storages::bool());
        self.define_typed_tmp_var(init, ty)
    }

    /// A u64 counter variable initialized to `init`.
    pub(crate) fn define_counter(&mut self, init: u64) -> Result<ObjectId, LowerError> {
        let imm = self.immediate(init)?;
        self.define_int_tmp_var(imm)
    }

    /// Captures a condition expression in a temporary so later arms can
    /// compare against it.
    pub(crate) fn define_expr_variable(&mut self, expr: NodeId) -> Result<ObjectId, LowerError> {
        let value = self.get_expr(expr)?;
        match self.may_get_type(expr)? {
            Some(shape) => {
                let ty = self.m.get_storage_ref(shape);
                self.define_typed_tmp_var(value, ty)
            }
            None => self.define_int_tmp_var(value),
        }
    }

    /// Inserts an implicit conversion when the assignment's source and
    /// destination shapes differ. Returns the cast's id when one was
    /// emitted. With `recursive_assign`, identical shapes containing a
    /// recursive ref still get the recursion-untying cast.
    pub(crate) fn add_assign_cast(
        &mut self,
        dest: Option<&Storages>,
        src: Option<&Storages>,
        right: ObjectId,
        recursive_assign: bool,
    ) -> Result<Option<ObjectId>, LowerError> {
        let (Some(dest), Some(src)) = (dest, src) else {
            return Ok(None);
        };
        let mut src = src.clone();
        if dest.key() == src.key() {
            if !recursive_assign || !src.contains_recursive_ref() {
                return Ok(None);
            }
            src = src.untie_recursive_refs();
        }
        let kind = get_cast_type(dest, &src);
        let to = self.m.get_storage_ref(dest.clone());
        let from = self.m.get_storage_ref(src);
        Ok(Some(self.emit_cast(to, from, right, kind)))
    }
}

pub(crate) fn map_binary_op(op: AstBinaryOp) -> Result<BinaryOp, LowerError> {
    Ok(match op {
        AstBinaryOp::Add => BinaryOp::Add,
        AstBinaryOp::Sub => BinaryOp::Sub,
        AstBinaryOp::Mul => BinaryOp::Mul,
        AstBinaryOp::Div => BinaryOp::Div,
        AstBinaryOp::Mod => BinaryOp::Mod,
        AstBinaryOp::BitAnd => BinaryOp::BitAnd,
        AstBinaryOp::BitOr => BinaryOp::BitOr,
        AstBinaryOp::BitXor => BinaryOp::BitXor,
        AstBinaryOp::LogicalAnd => BinaryOp::LogicalAnd,
        AstBinaryOp::LogicalOr => BinaryOp::LogicalOr,
        AstBinaryOp::LeftShift => BinaryOp::LeftLogicalShift,
        AstBinaryOp::RightShift => BinaryOp::RightLogicalShift,
        AstBinaryOp::Equal => BinaryOp::Equal,
        AstBinaryOp::NotEqual => BinaryOp::NotEqual,
        AstBinaryOp::Less => BinaryOp::Less,
        AstBinaryOp::LessOrEq => BinaryOp::LessOrEq,
        AstBinaryOp::Greater => BinaryOp::Greater,
        AstBinaryOp::GreaterOrEq => BinaryOp::GreaterOrEq,
        other => {
            return Err(LowerError::invalid(format!(
                "operator {:?} is not a value-producing binary op",
                other
            )))
        }
    })
}

pub(crate) use binmod_core::storage::cast_kind_between as get_cast_type;
