//! Statement and control-flow lowering.
//!
//! The same `if`/`match`/`loop` shapes are walked three times per format:
//! once to define, once to synthesize the encoder, once the decoder; the
//! [`Mode`] selects what a field means in the current walk. Each
//! `IF`/`ELIF`/`ELSE` chain owns a φ frame; at `END_IF` a `PHI` opcode is
//! emitted for every variable written in two or more arms.

use binmod_ast::{AstBinaryOp, Node, NodeId};
use binmod_core::{AbstractOp, BinaryOp, ObjectId, PhiFrame, PhiParam, Storages};

use crate::error::LowerError;
use crate::{Lowerer, Mode};

impl<'a> Lowerer<'a> {
    /// Statement dispatch for one node in the given walk mode.
    pub fn eval_node(&mut self, node: NodeId, mode: Mode) -> Result<(), LowerError> {
        let n = self.tree.get(node)?.clone();
        match n {
            Node::Format { .. } => match mode {
                Mode::Definition => self.define_format(node),
                Mode::Encode | Mode::Decode => self.synthesize_coder(node, mode),
            },
            Node::EnumDecl { .. } => match mode {
                Mode::Definition => self.define_enum(node),
                _ => Ok(()),
            },
            Node::State { .. } => match mode {
                Mode::Definition => self.define_state(node),
                _ => Ok(()),
            },
            Node::FunctionDecl { .. } => match mode {
                Mode::Definition => self.define_function(node),
                _ => Ok(()),
            },
            Node::Field { .. } => match mode {
                Mode::Definition => self.define_field(node),
                Mode::Encode => self.encode_field(node),
                Mode::Decode => self.decode_field(node),
            },
            Node::If { .. } => self.convert_if(node, mode),
            Node::Match { .. } => self.convert_match(node, mode),
            Node::Loop { .. } => self.convert_loop(node, mode),
            Node::Block { elements } => self.eval_stmt_list(&elements, mode),
            Node::Break => {
                self.m.op(AbstractOp::Break);
                Ok(())
            }
            Node::Continue => {
                self.m.op(AbstractOp::Continue);
                Ok(())
            }
            Node::Assert { cond } => {
                let cond = self.get_expr(cond)?;
                let belong = self.m.current_function();
                self.m.op_with(AbstractOp::Assert, |c| {
                    c.ref_id = Some(cond);
                    c.belong = Some(belong);
                });
                Ok(())
            }
            Node::ExplicitError { message, args } => {
                let message = self.m.intern_string(&message);
                let mut params = Vec::with_capacity(args.len());
                for arg in args {
                    params.push(self.get_expr(arg)?);
                }
                let belong = self.m.current_function();
                self.m.op_with(AbstractOp::ExplicitError, |c| {
                    c.string_ref = Some(message);
                    c.params = Some(params);
                    c.belong = Some(belong);
                });
                Ok(())
            }
            Node::Return { value } => {
                let value = match value {
                    Some(v) => Some(self.get_expr(v)?),
                    None => None,
                };
                let belong = self.m.current_function();
                self.m.op_with(AbstractOp::Ret, |c| {
                    c.ref_id = value;
                    c.belong = Some(belong);
                });
                Ok(())
            }
            Node::SpecifyOrder { order, order_value } => self.specify_order(order, order_value),
            Node::MetadataStmt { name, values } => {
                let name = self.m.intern_metadata(&name);
                let mut refs = Vec::with_capacity(values.len());
                for value in values {
                    refs.push(self.get_expr(value)?);
                }
                self.m.op_with(AbstractOp::Metadata, |c| {
                    c.metadata = Some(binmod_core::MetadataRef { name, refs });
                });
                Ok(())
            }
            Node::Import { path } => {
                let path = self.m.intern_string(&path);
                self.m
                    .op_with(AbstractOp::Import, |c| c.string_ref = Some(path));
                Ok(())
            }
            Node::Binary {
                op:
                    op @ (AstBinaryOp::Assign | AstBinaryOp::DefineAssign | AstBinaryOp::ConstAssign),
                left,
                right,
                ..
            } => self.lower_assignment(op, left, right),
            ref other if other.is_expr() => {
                self.get_expr(node)?;
                Ok(())
            }
            other => Err(LowerError::invalid(format!(
                "cannot lower {:?} as a statement",
                other
            ))),
        }
    }

    /// Walks a statement list, resetting the previous-expression slot per
    /// statement and materializing standalone expressions as `EVAL_EXPR`.
    pub fn eval_stmt_list(&mut self, nodes: &[NodeId], mode: Mode) -> Result<(), LowerError> {
        for &node in nodes {
            self.m.set_prev_expr(ObjectId::NONE);
            self.eval_node(node, mode)?;
            self.maybe_insert_eval_expr(node)?;
        }
        Ok(())
    }

    fn maybe_insert_eval_expr(&mut self, node: NodeId) -> Result<(), LowerError> {
        if !self.tree.get(node)?.is_expr() {
            return Ok(());
        }
        if let Some(prev) = self.m.prev_expr() {
            self.m
                .op_with(AbstractOp::EvalExpr, |c| c.ref_id = Some(prev));
        }
        Ok(())
    }

    fn specify_order(
        &mut self,
        order: NodeId,
        order_value: Option<u64>,
    ) -> Result<(), LowerError> {
        use binmod_core::Endian;
        match order_value {
            Some(0) => {
                self.m.set_default_endian(Endian::Big, ObjectId::NONE);
                Ok(())
            }
            Some(1) => {
                self.m.set_default_endian(Endian::Little, ObjectId::NONE);
                Ok(())
            }
            Some(2) => {
                self.m.set_default_endian(Endian::Native, ObjectId::NONE);
                Ok(())
            }
            Some(other) => Err(LowerError::invalid(format!(
                "byte order selector {} is out of range",
                other
            ))),
            None => {
                // Run-time selected order: bind the selector expression and
                // let every subsequent int coder reference it.
                let selector = self.get_expr(order)?;
                let id = self.m.new_id();
                self.m.op_with(AbstractOp::DynamicEndian, |c| {
                    c.ident = Some(id);
                    c.ref_id = Some(selector);
                });
                self.m.set_default_endian(Endian::Dynamic, id);
                Ok(())
            }
        }
    }

    fn lower_assignment(
        &mut self,
        op: AstBinaryOp,
        left: NodeId,
        right: NodeId,
    ) -> Result<(), LowerError> {
        if op == AstBinaryOp::Assign {
            let target_ty = self.may_get_type(left)?;
            let source_ty = self.may_get_type(right)?;
            let left_id = self.get_expr(left)?;
            let right_id = self.get_expr(right)?;
            self.do_assign(
                target_ty.as_ref(),
                source_ty.as_ref(),
                left_id,
                right_id,
                false,
            )?;
            // an assignment is a statement; it leaves no value behind
            self.m.set_prev_expr(ObjectId::NONE);
            return Ok(());
        }
        // `:=` / `::=` define a new binding.
        let ident = match self.tree.get(left)? {
            Node::Ident { .. } => self.lookup_ident(left)?,
            other => {
                return Err(LowerError::invalid(format!(
                    "binding target must be an identifier, got {:?}",
                    other
                )))
            }
        };
        let value = self.get_expr(right)?;
        let ty = match self.may_get_type(right)? {
            Some(shape) => self.m.get_storage_ref(shape),
            None => self.m.get_storage_ref(Storages::uint(64)),
        };
        let def_op = if op == AstBinaryOp::ConstAssign {
            AbstractOp::DefineConstant
        } else {
            AbstractOp::DefineVariable
        };
        self.m.op_with(def_op, |c| {
            c.ident = Some(ident);
            c.ref_id = Some(value);
            c.ty = Some(ty);
        });
        self.m.set_prev_expr(ObjectId::NONE);
        Ok(())
    }

    /// `ASSIGN left = right`, inserting an implicit cast when both shapes
    /// are known and differ. Returns the assignment's id.
    pub(crate) fn do_assign(
        &mut self,
        target_ty: Option<&Storages>,
        source_ty: Option<&Storages>,
        left: ObjectId,
        right: ObjectId,
        recursive_assign: bool,
    ) -> Result<ObjectId, LowerError> {
        let casted = self.add_assign_cast(target_ty, source_ty, right, recursive_assign)?;
        let value = casted.unwrap_or(right);
        let id = self.m.new_id();
        self.m.op_with(AbstractOp::Assign, |c| {
            c.ident = Some(id);
            c.left = Some(left);
            c.right = Some(value);
        });
        self.m.notify_assign(left, id);
        Ok(id)
    }

    /// Emits the `PHI` opcodes for a finished `IF` chain: one per variable
    /// written in two or more predecessor arms. Arms that did not write
    /// the variable contribute the definition reaching the chain from
    /// before it opened (a reassignment ahead of the `IF` must win over
    /// the variable's declaration).
    pub(crate) fn insert_phi(&mut self, frame: PhiFrame) -> Result<(), LowerError> {
        if frame.candidates.len() < 2 {
            return Ok(());
        }
        let mut variables: Vec<ObjectId> = Vec::new();
        for candidate in &frame.candidates {
            for &var in candidate.assigns.keys() {
                if !variables.contains(&var) {
                    variables.push(var);
                }
            }
        }
        for var in variables {
            let writers = frame
                .candidates
                .iter()
                .filter(|c| c.assigns.contains_key(&var))
                .count();
            if writers < 2 {
                continue;
            }
            let pre_branch = self.m.prev_assign_before(var, frame.start);
            let params: Vec<PhiParam> = frame
                .candidates
                .iter()
                .map(|c| PhiParam {
                    condition: c.condition,
                    assign: c.assigns.get(&var).copied().unwrap_or(pre_branch),
                })
                .collect();
            let id = self.m.new_id();
            self.m.op_with(AbstractOp::Phi, |c| {
                c.ident = Some(id);
                c.ref_id = Some(var);
                c.phi_params = Some(params);
            });
            self.m.notify_assign(var, id);
        }
        Ok(())
    }

    /// Wraps a condition expression in a cond block and returns the
    /// block's value id (the `END_COND_BLOCK` opcode).
    pub(crate) fn lower_cond_in_block(&mut self, cond: NodeId) -> Result<ObjectId, LowerError> {
        let begin = self.m.new_id();
        self.m
            .op_with(AbstractOp::BeginCondBlock, |c| c.ident = Some(begin));
        let value = self.get_expr(cond)?;
        let end = self.m.new_id();
        self.m.op_with(AbstractOp::EndCondBlock, |c| {
            c.ident = Some(end);
            c.ref_id = Some(value);
            c.belong = Some(begin);
        });
        Ok(end)
    }

    /// Closes an already-open cond block around a computed value.
    pub(crate) fn close_cond_block(&mut self, begin: ObjectId, value: ObjectId) -> ObjectId {
        let end = self.m.new_id();
        self.m.op_with(AbstractOp::EndCondBlock, |c| {
            c.ident = Some(end);
            c.ref_id = Some(value);
            c.belong = Some(begin);
        });
        end
    }

    pub(crate) fn open_cond_block(&mut self) -> ObjectId {
        let begin = self.m.new_id();
        self.m
            .op_with(AbstractOp::BeginCondBlock, |c| c.ident = Some(begin));
        begin
    }

    // -- if --

    pub(crate) fn convert_if(&mut self, node: NodeId, mode: Mode) -> Result<(), LowerError> {
        let (cond, then, els, expr_type) = match self.tree.get(node)? {
            Node::If {
                cond,
                then,
                els,
                expr_type,
            } => (*cond, then.clone(), *els, *expr_type),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "convert_if on {:?}",
                    other
                )))
            }
        };
        let (yield_var, yield_storage) = self.prepare_yield(expr_type)?;

        let cond_id = self.lower_cond_in_block(cond)?;
        self.m.init_phi_stack(cond_id);
        self.m.op_with(AbstractOp::If, |c| c.ref_id = Some(cond_id));
        let last = self.eval_arm(&then, mode)?;
        self.yield_arm_value(yield_var, yield_storage.as_ref(), last)?;

        let mut els = els;
        while let Some(e) = els {
            match self.tree.get(e)?.clone() {
                Node::If {
                    cond,
                    then,
                    els: next,
                    ..
                } => {
                    let cond_id = self.get_expr(cond)?;
                    self.m.next_phi_candidate(cond_id);
                    self.m
                        .op_with(AbstractOp::Elif, |c| c.ref_id = Some(cond_id));
                    let last = self.eval_arm(&then, mode)?;
                    self.yield_arm_value(yield_var, yield_storage.as_ref(), last)?;
                    els = next;
                }
                Node::Block { elements } => {
                    self.m.next_phi_candidate(ObjectId::NONE);
                    self.m.op(AbstractOp::Else);
                    let last = self.eval_arm(&elements, mode)?;
                    self.yield_arm_value(yield_var, yield_storage.as_ref(), last)?;
                    break;
                }
                other => {
                    return Err(LowerError::invalid(format!(
                        "else chain must be an if or a block, got {:?}",
                        other
                    )))
                }
            }
        }

        self.m.op(AbstractOp::EndIf);
        let frame = self.m.end_phi_stack();
        self.insert_phi(frame)?;
        if let Some(var) = yield_var {
            self.m.set_prev_expr(var);
        }
        Ok(())
    }

    fn eval_arm(&mut self, nodes: &[NodeId], mode: Mode) -> Result<Option<NodeId>, LowerError> {
        let mut last = None;
        for &n in nodes {
            self.m.set_prev_expr(ObjectId::NONE);
            self.eval_node(n, mode)?;
            self.maybe_insert_eval_expr(n)?;
            last = Some(n);
        }
        Ok(last)
    }

    /// Pre-allocates the yield variable for an `if`/`match` used as an
    /// expression. Void-typed statements get none.
    fn prepare_yield(
        &mut self,
        expr_type: Option<NodeId>,
    ) -> Result<(Option<ObjectId>, Option<Storages>), LowerError> {
        let Some(ty) = expr_type else {
            return Ok((None, None));
        };
        if matches!(
            self.tree.get(self.tree.resolve_type(ty)?)?,
            Node::VoidType
        ) {
            return Ok((None, None));
        }
        let shape = self.build_storages(ty, false)?;
        let storage_ref = self.m.get_storage_ref(shape.clone());
        let object = self.new_object(storage_ref);
        let var = self.define_typed_tmp_var(object, storage_ref)?;
        Ok((Some(var), Some(shape)))
    }

    /// Converts an arm's trailing expression into an assignment to the
    /// yield variable.
    fn yield_arm_value(
        &mut self,
        yield_var: Option<ObjectId>,
        yield_storage: Option<&Storages>,
        last: Option<NodeId>,
    ) -> Result<(), LowerError> {
        let Some(var) = yield_var else {
            return Ok(());
        };
        let last = last.ok_or_else(|| {
            LowerError::invalid("an arm of a value-producing branch is empty")
        })?;
        let value = self
            .m
            .prev_expr()
            .ok_or_else(|| LowerError::invalid("arm does not end in an expression"))?;
        let source_ty = self.may_get_type(last)?;
        self.do_assign(yield_storage, source_ty.as_ref(), var, value, false)?;
        Ok(())
    }

    // -- match --

    pub(crate) fn convert_match(&mut self, node: NodeId, mode: Mode) -> Result<(), LowerError> {
        let (cond, branches, exhaustive, expr_type) = match self.tree.get(node)? {
            Node::Match {
                cond,
                branches,
                exhaustive,
                expr_type,
            } => (*cond, branches.clone(), *exhaustive, *expr_type),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "convert_match on {:?}",
                    other
                )))
            }
        };
        let (yield_var, yield_storage) = self.prepare_yield(expr_type)?;

        if self.can_be_numeric_match(cond, &branches)? {
            let cond = cond.ok_or_else(|| {
                LowerError::inconsistent("numeric match requires a scrutinee")
            })?;
            let cond_id = self.get_expr(cond)?;
            self.m.init_phi_stack(cond_id);
            let op = if exhaustive {
                AbstractOp::ExhaustiveMatch
            } else {
                AbstractOp::Match
            };
            self.m.op_with(op, |c| c.ref_id = Some(cond_id));
            for &branch in &branches {
                let (pattern, body) = self.branch_parts(branch)?;
                if self.is_any_range(pattern)? {
                    self.m.next_phi_candidate(ObjectId::NONE);
                    self.m.op(AbstractOp::DefaultCase);
                } else {
                    let pattern_id = self.get_expr(pattern)?;
                    self.m.next_phi_candidate(pattern_id);
                    self.m
                        .op_with(AbstractOp::Case, |c| c.ref_id = Some(pattern_id));
                }
                let last = self.eval_branch_body(body, mode)?;
                self.yield_arm_value(yield_var, yield_storage.as_ref(), last)?;
                self.m.op(AbstractOp::EndCase);
            }
            self.m.op(AbstractOp::EndMatch);
            let frame = self.m.end_phi_stack();
            self.insert_phi(frame)?;
            if let Some(var) = yield_var {
                self.m.set_prev_expr(var);
            }
            return Ok(());
        }

        // General form: desugar into an IF/ELIF/ELSE cascade comparing a
        // temporary holding the scrutinee.
        let base = match cond {
            Some(c) => Some(self.define_expr_variable(c)?),
            None => None,
        };
        let mut chain_open = false;
        for &branch in &branches {
            let (pattern, body) = self.branch_parts(branch)?;
            if self.is_any_range(pattern)? {
                if chain_open {
                    self.m.next_phi_candidate(ObjectId::NONE);
                    self.m.op(AbstractOp::Else);
                }
            } else {
                let begin = self.open_cond_block();
                let cond_value = match self.tree.get(pattern)? {
                    Node::RangeExpr { .. } => {
                        let base = base.ok_or_else(|| {
                            LowerError::invalid(
                                "a range pattern requires a match scrutinee",
                            )
                        })?;
                        self.do_range_compare(BinaryOp::Equal, pattern, base)?
                    }
                    _ => {
                        let value = self.get_expr(pattern)?;
                        match base {
                            Some(base) => self.emit_binary(BinaryOp::Equal, base, value),
                            None => value,
                        }
                    }
                };
                let block = self.close_cond_block(begin, cond_value);
                if !chain_open {
                    self.m.init_phi_stack(block);
                    self.m.op_with(AbstractOp::If, |c| c.ref_id = Some(block));
                    chain_open = true;
                } else {
                    self.m.next_phi_candidate(block);
                    self.m.op_with(AbstractOp::Elif, |c| c.ref_id = Some(block));
                }
            }
            let last = self.eval_branch_body(body, mode)?;
            self.yield_arm_value(yield_var, yield_storage.as_ref(), last)?;
        }
        if chain_open {
            self.m.op(AbstractOp::EndIf);
            let frame = self.m.end_phi_stack();
            self.insert_phi(frame)?;
        }
        if let Some(var) = yield_var {
            self.m.set_prev_expr(var);
        }
        Ok(())
    }

    fn branch_parts(&self, branch: NodeId) -> Result<(NodeId, NodeId), LowerError> {
        match self.tree.get(branch)? {
            Node::MatchBranch { cond, body } => Ok((*cond, *body)),
            other => Err(LowerError::invalid(format!(
                "match branch expected, got {:?}",
                other
            ))),
        }
    }

    fn eval_branch_body(
        &mut self,
        body: NodeId,
        mode: Mode,
    ) -> Result<Option<NodeId>, LowerError> {
        match self.tree.get(body)?.clone() {
            Node::Block { elements } => self.eval_arm(&elements, mode),
            _ => {
                self.m.set_prev_expr(ObjectId::NONE);
                self.eval_node(body, mode)?;
                self.maybe_insert_eval_expr(body)?;
                Ok(Some(body))
            }
        }
    }

    /// `..` with neither bound marks the default arm.
    pub(crate) fn is_any_range(&self, node: NodeId) -> Result<bool, LowerError> {
        Ok(matches!(
            self.tree.get(node)?,
            Node::RangeExpr {
                start: None,
                end: None,
                ..
            }
        ))
    }

    /// The numeric fast path requires the scrutinee and every non-default
    /// pattern to be integer-like (int, int literal, or enum member).
    fn can_be_numeric_match(
        &self,
        cond: Option<NodeId>,
        branches: &[NodeId],
    ) -> Result<bool, LowerError> {
        let Some(cond) = cond else {
            return Ok(false);
        };
        if !self.is_integer_like(cond)? {
            return Ok(false);
        }
        for &branch in branches {
            let (pattern, _) = self.branch_parts(branch)?;
            if self.is_any_range(pattern)? {
                continue;
            }
            if !self.is_integer_like(pattern)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_integer_like(&self, expr: NodeId) -> Result<bool, LowerError> {
        if matches!(self.tree.get(expr)?, Node::IntLiteral { .. }) {
            return Ok(true);
        }
        if matches!(
            self.tree.get(self.ident_decl(expr)),
            Ok(Node::EnumMember { .. })
        ) {
            return Ok(true);
        }
        if let Node::MemberAccess { member, .. } = self.tree.get(expr)? {
            if matches!(
                self.tree.get(self.ident_decl(*member)),
                Ok(Node::EnumMember { .. })
            ) {
                return Ok(true);
            }
        }
        let Some(mut ty) = self.tree.expr_type(expr) else {
            return Ok(false);
        };
        ty = self.tree.resolve_type(ty)?;
        if let Node::UnionType {
            common_type: Some(common),
            ..
        } = self.tree.get(ty)?
        {
            ty = self.tree.resolve_type(*common)?;
        }
        Ok(matches!(
            self.tree.get(ty)?,
            Node::IntType { .. } | Node::EnumType { .. }
        ))
    }

    // -- loops --

    pub(crate) fn convert_loop(&mut self, node: NodeId, mode: Mode) -> Result<(), LowerError> {
        let (init, cond, step, body) = match self.tree.get(node)? {
            Node::Loop {
                init,
                cond,
                step,
                body,
            } => (*init, *cond, *step, body.clone()),
            other => {
                return Err(LowerError::inconsistent(format!(
                    "convert_loop on {:?}",
                    other
                )))
            }
        };

        if let Some(init) = init {
            if let Node::Binary {
                op: AstBinaryOp::InAssign,
                left,
                right,
                ..
            } = self.tree.get(init)?.clone()
            {
                return self.convert_for_in(left, right, &body, mode);
            }
            self.m.set_prev_expr(ObjectId::NONE);
            self.eval_node(init, mode)?;
        }

        match cond {
            Some(cond) => {
                let block = self.lower_cond_in_block(cond)?;
                self.m
                    .op_with(AbstractOp::LoopCondition, |c| c.ref_id = Some(block));
            }
            None => self.m.op(AbstractOp::LoopInfinite),
        }
        self.eval_stmt_list(&body, mode)?;
        if let Some(step) = step {
            self.m.set_prev_expr(ObjectId::NONE);
            self.eval_node(step, mode)?;
        }
        self.m.op(AbstractOp::EndLoop);
        Ok(())
    }

    fn convert_for_in(
        &mut self,
        binder: NodeId,
        source: NodeId,
        body: &[NodeId],
        mode: Mode,
    ) -> Result<(), LowerError> {
        if !matches!(self.tree.get(binder)?, Node::Ident { .. }) {
            return Err(LowerError::invalid("loop binder must be an identifier"));
        }
        let source_node = self.tree.get(source)?.clone();

        // `for x in "literal"` iterates the literal's bytes.
        if let Node::StrLiteral { length, .. } = source_node {
            let str_id = self.static_str(source)?;
            let len = self.immediate(length)?;
            return self.counter_loop(len, |l, counter| {
                let index = l.emit_index(str_id, counter);
                let binder_id = l.lookup_ident(binder)?;
                l.m.op_with(AbstractOp::DefineVariableRef, |c| {
                    c.ident = Some(binder_id);
                    c.ref_id = Some(index);
                });
                l.eval_stmt_list(body, mode)
            });
        }

        // `for x in a..b` counts through the range.
        if let Node::RangeExpr {
            start,
            end,
            inclusive,
            ..
        } = source_node
        {
            let start_id = match start {
                Some(s) => self.get_expr(s)?,
                None => self.immediate(0)?,
            };
            let end_id = match end {
                Some(e) => Some(self.get_expr(e)?),
                None => None,
            };
            let binder_id = self.lookup_ident(binder)?;
            let ty = match self.may_get_type(binder)? {
                Some(shape) => self.m.get_storage_ref(shape),
                None => self.m.get_storage_ref(Storages::uint(64)),
            };
            let counter = self.define_var(binder_id, start_id, ty);
            match end_id {
                Some(end) => {
                    let op = if inclusive {
                        BinaryOp::LessOrEq
                    } else {
                        BinaryOp::Less
                    };
                    let cmp = self.emit_binary(op, counter, end);
                    self.m
                        .op_with(AbstractOp::LoopCondition, |c| c.ref_id = Some(cmp));
                }
                None => self.m.op(AbstractOp::LoopInfinite),
            }
            self.eval_stmt_list(body, mode)?;
            self.m
                .op_with(AbstractOp::Inc, |c| c.ref_id = Some(counter));
            self.m.op(AbstractOp::EndLoop);
            return Ok(());
        }

        let target = self.get_expr(source)?;
        let source_ty = self
            .tree
            .expr_type(source)
            .map(|t| self.tree.resolve_type(t))
            .transpose()?;

        // `for x in <int>` counts from zero.
        if let Some(ty) = source_ty {
            if matches!(self.tree.get(ty)?, Node::IntType { .. }) {
                return self.counter_loop(target, |l, counter| {
                    let binder_id = l.lookup_ident(binder)?;
                    let ty = match l.may_get_type(binder)? {
                        Some(shape) => l.m.get_storage_ref(shape),
                        None => l.m.get_storage_ref(Storages::uint(64)),
                    };
                    l.define_var(binder_id, counter, ty);
                    l.eval_stmt_list(body, mode)
                });
            }
            if matches!(self.tree.get(ty)?, Node::ArrayType { .. }) {
                let size = self.m.new_id();
                self.m.op_with(AbstractOp::ArraySize, |c| {
                    c.ident = Some(size);
                    c.ref_id = Some(target);
                });
                return self.counter_loop(size, |l, counter| {
                    let index = l.emit_index(target, counter);
                    let binder_id = l.lookup_ident(binder)?;
                    l.m.op_with(AbstractOp::DefineVariableRef, |c| {
                        c.ident = Some(binder_id);
                        c.ref_id = Some(index);
                    });
                    l.eval_stmt_list(body, mode)
                });
            }
        }
        Err(LowerError::invalid(
            "`for .. in` source must be an int, range, array, or string literal",
        ))
    }

    /// Zero-based counter loop: `counter < length` with `INC` per pass.
    pub(crate) fn counter_loop<F>(
        &mut self,
        length: ObjectId,
        mut body: F,
    ) -> Result<(), LowerError>
    where
        F: FnMut(&mut Self, ObjectId) -> Result<(), LowerError>,
    {
        let counter = self.define_counter(0)?;
        let cmp = self.emit_binary(BinaryOp::Less, counter, length);
        self.m
            .op_with(AbstractOp::LoopCondition, |c| c.ref_id = Some(cmp));
        body(self, counter)?;
        self.m
            .op_with(AbstractOp::Inc, |c| c.ref_id = Some(counter));
        self.m.op(AbstractOp::EndLoop);
        Ok(())
    }

    /// `while cond` loop around `body`.
    pub(crate) fn conditional_loop<F>(
        &mut self,
        cond: ObjectId,
        mut body: F,
    ) -> Result<(), LowerError>
    where
        F: FnMut(&mut Self) -> Result<(), LowerError>,
    {
        self.m
            .op_with(AbstractOp::LoopCondition, |c| c.ref_id = Some(cond));
        body(self)?;
        self.m.op(AbstractOp::EndLoop);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_ast::Tree;

    #[test]
    fn if_chain_emits_phi_for_twice_written_variable() {
        // if true { v = 1 } else { v = 2 }
        let mut tree = Tree::new();
        let var_decl = tree.add(Node::Ident {
            name: "v".into(),
            base: None,
            expr_type: None,
        });
        let init = tree.add(Node::IntLiteral {
            value: 0,
            expr_type: None,
        });
        let define = tree.add(Node::Binary {
            op: AstBinaryOp::DefineAssign,
            left: var_decl,
            right: init,
            expr_type: None,
        });
        let cond = tree.add(Node::BoolLiteral { value: true });
        let use1 = tree.add(Node::Ident {
            name: "v".into(),
            base: Some(var_decl),
            expr_type: None,
        });
        let one = tree.add(Node::IntLiteral {
            value: 1,
            expr_type: None,
        });
        let assign1 = tree.add(Node::Binary {
            op: AstBinaryOp::Assign,
            left: use1,
            right: one,
            expr_type: None,
        });
        let use2 = tree.add(Node::Ident {
            name: "v".into(),
            base: Some(var_decl),
            expr_type: None,
        });
        let two = tree.add(Node::IntLiteral {
            value: 2,
            expr_type: None,
        });
        let assign2 = tree.add(Node::Binary {
            op: AstBinaryOp::Assign,
            left: use2,
            right: two,
            expr_type: None,
        });
        let else_block = tree.add(Node::Block {
            elements: vec![assign2],
        });
        let if_node = tree.add(Node::If {
            cond,
            then: vec![assign1],
            els: Some(else_block),
            expr_type: None,
        });

        let mut l = Lowerer::new(&tree);
        l.eval_node(define, Mode::Definition).unwrap();
        l.eval_node(if_node, Mode::Definition).unwrap();

        let phi = l
            .m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::Phi)
            .expect("a phi should be emitted");
        let params = phi.phi_params.as_ref().unwrap();
        assert_eq!(params.len(), 2);
        // else arm carries the null condition
        assert!(params[1].condition.is_none());
        assert_ne!(params[0].assign, params[1].assign);
    }

    #[test]
    fn non_writing_arm_carries_the_pre_branch_assignment() {
        // v := 0; v = 5; if a { v = 1 } elif b { v = 2 } else {}
        // The else arm must contribute the `v = 5` assignment, not the
        // stale declaration.
        let mut tree = Tree::new();
        let var_decl = tree.add(Node::Ident {
            name: "v".into(),
            base: None,
            expr_type: None,
        });
        let init = tree.add(Node::IntLiteral {
            value: 0,
            expr_type: None,
        });
        let define = tree.add(Node::Binary {
            op: AstBinaryOp::DefineAssign,
            left: var_decl,
            right: init,
            expr_type: None,
        });
        let use0 = tree.add(Node::Ident {
            name: "v".into(),
            base: Some(var_decl),
            expr_type: None,
        });
        let five = tree.add(Node::IntLiteral {
            value: 5,
            expr_type: None,
        });
        let pre_assign = tree.add(Node::Binary {
            op: AstBinaryOp::Assign,
            left: use0,
            right: five,
            expr_type: None,
        });
        let cond_a = tree.add(Node::BoolLiteral { value: true });
        let cond_b = tree.add(Node::BoolLiteral { value: false });
        let mut arm_assign = |tree: &mut Tree, value| {
            let use_v = tree.add(Node::Ident {
                name: "v".into(),
                base: Some(var_decl),
                expr_type: None,
            });
            let lit = tree.add(Node::IntLiteral {
                value,
                expr_type: None,
            });
            tree.add(Node::Binary {
                op: AstBinaryOp::Assign,
                left: use_v,
                right: lit,
                expr_type: None,
            })
        };
        let assign1 = arm_assign(&mut tree, 1);
        let assign2 = arm_assign(&mut tree, 2);
        let else_block = tree.add(Node::Block { elements: vec![] });
        let elif = tree.add(Node::If {
            cond: cond_b,
            then: vec![assign2],
            els: Some(else_block),
            expr_type: None,
        });
        let if_node = tree.add(Node::If {
            cond: cond_a,
            then: vec![assign1],
            els: Some(elif),
            expr_type: None,
        });

        let mut l = Lowerer::new(&tree);
        l.eval_node(define, Mode::Definition).unwrap();
        l.eval_node(pre_assign, Mode::Definition).unwrap();
        let pre_assign_id = l.m.code.last().unwrap().ident.unwrap();
        l.eval_node(if_node, Mode::Definition).unwrap();

        let phi = l
            .m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::Phi)
            .expect("a phi should be emitted");
        let params = phi.phi_params.as_ref().unwrap();
        assert_eq!(params.len(), 3);
        // writing arms carry their own assignments
        assert_ne!(params[0].assign, pre_assign_id);
        assert_ne!(params[1].assign, pre_assign_id);
        // the silent else arm carries the latest pre-branch definition
        assert!(params[2].condition.is_none());
        assert_eq!(params[2].assign, pre_assign_id);
    }

    #[test]
    fn single_arm_write_emits_no_phi() {
        let mut tree = Tree::new();
        let var_decl = tree.add(Node::Ident {
            name: "v".into(),
            base: None,
            expr_type: None,
        });
        let init = tree.add(Node::IntLiteral {
            value: 0,
            expr_type: None,
        });
        let define = tree.add(Node::Binary {
            op: AstBinaryOp::DefineAssign,
            left: var_decl,
            right: init,
            expr_type: None,
        });
        let cond = tree.add(Node::BoolLiteral { value: true });
        let use1 = tree.add(Node::Ident {
            name: "v".into(),
            base: Some(var_decl),
            expr_type: None,
        });
        let one = tree.add(Node::IntLiteral {
            value: 1,
            expr_type: None,
        });
        let assign1 = tree.add(Node::Binary {
            op: AstBinaryOp::Assign,
            left: use1,
            right: one,
            expr_type: None,
        });
        let if_node = tree.add(Node::If {
            cond,
            then: vec![assign1],
            els: None,
            expr_type: None,
        });

        let mut l = Lowerer::new(&tree);
        l.eval_node(define, Mode::Definition).unwrap();
        l.eval_node(if_node, Mode::Definition).unwrap();
        assert!(!l.m.code.iter().any(|c| c.op == AbstractOp::Phi));
    }

    #[test]
    fn numeric_match_emits_cases() {
        let mut tree = Tree::new();
        let u8_ty = tree.add(Node::IntType {
            bit_size: 8,
            endian: Default::default(),
            is_signed: false,
        });
        let scrutinee = tree.add(Node::IntLiteral {
            value: 1,
            expr_type: Some(u8_ty),
        });
        let p1 = tree.add(Node::IntLiteral {
            value: 1,
            expr_type: Some(u8_ty),
        });
        let b1_body = tree.add(Node::Block { elements: vec![] });
        let b1 = tree.add(Node::MatchBranch {
            cond: p1,
            body: b1_body,
        });
        let default_pattern = tree.add(Node::RangeExpr {
            start: None,
            end: None,
            inclusive: false,
            expr_type: None,
        });
        let b2_body = tree.add(Node::Block { elements: vec![] });
        let b2 = tree.add(Node::MatchBranch {
            cond: default_pattern,
            body: b2_body,
        });
        let match_node = tree.add(Node::Match {
            cond: Some(scrutinee),
            branches: vec![b1, b2],
            exhaustive: false,
            expr_type: None,
        });

        let mut l = Lowerer::new(&tree);
        l.eval_node(match_node, Mode::Definition).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert!(ops.contains(&AbstractOp::Match));
        assert!(ops.contains(&AbstractOp::Case));
        assert!(ops.contains(&AbstractOp::DefaultCase));
        assert!(ops.contains(&AbstractOp::EndMatch));
        let cases = ops.iter().filter(|&&o| o == AbstractOp::EndCase).count();
        assert_eq!(cases, 2);
    }

    #[test]
    fn non_numeric_match_desugars_to_if_chain() {
        let mut tree = Tree::new();
        let scrutinee = tree.add(Node::BoolLiteral { value: true });
        let p1 = tree.add(Node::BoolLiteral { value: false });
        let body1 = tree.add(Node::Block { elements: vec![] });
        let b1 = tree.add(Node::MatchBranch {
            cond: p1,
            body: body1,
        });
        let match_node = tree.add(Node::Match {
            cond: Some(scrutinee),
            branches: vec![b1],
            exhaustive: false,
            expr_type: None,
        });
        let mut l = Lowerer::new(&tree);
        l.eval_node(match_node, Mode::Definition).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert!(!ops.contains(&AbstractOp::Match));
        assert!(ops.contains(&AbstractOp::If));
        assert!(ops.contains(&AbstractOp::EndIf));
    }

    #[test]
    fn counter_loop_shape() {
        let tree = Tree::new();
        let mut l = Lowerer::new(&tree);
        let len = l.immediate(4).unwrap();
        l.counter_loop(len, |_, _| Ok(())).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert!(ops.contains(&AbstractOp::DefineVariable));
        assert!(ops.contains(&AbstractOp::LoopCondition));
        assert!(ops.contains(&AbstractOp::Inc));
        assert_eq!(*ops.last().unwrap(), AbstractOp::EndLoop);
    }

    #[test]
    fn infinite_loop_with_break() {
        let mut tree = Tree::new();
        let brk = tree.add(Node::Break);
        let loop_node = tree.add(Node::Loop {
            init: None,
            cond: None,
            step: None,
            body: vec![brk],
        });
        let mut l = Lowerer::new(&tree);
        l.eval_node(loop_node, Mode::Definition).unwrap();
        let ops: Vec<AbstractOp> = l.m.code.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                AbstractOp::LoopInfinite,
                AbstractOp::Break,
                AbstractOp::EndLoop
            ]
        );
    }

    #[test]
    fn dynamic_specify_order_defines_selector() {
        let mut tree = Tree::new();
        let selector = tree.add(Node::IntLiteral {
            value: 1,
            expr_type: None,
        });
        let order = tree.add(Node::SpecifyOrder {
            order: selector,
            order_value: None,
        });
        let mut l = Lowerer::new(&tree);
        l.eval_node(order, Mode::Definition).unwrap();
        let dyn_op = l
            .m
            .code
            .iter()
            .find(|c| c.op == AbstractOp::DynamicEndian)
            .expect("dynamic endian op");
        let id = dyn_op.ident.unwrap();
        let resolved = l.m.resolve_endian(binmod_core::Endian::Unspec, false);
        assert_eq!(resolved.endian, binmod_core::Endian::Dynamic);
        assert_eq!(resolved.dynamic_ref, id);
    }
}
