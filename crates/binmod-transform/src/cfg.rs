//! Control-flow graph construction.
//!
//! Each function's structured opcode span is parsed into basic blocks
//! connected by edges: conditional chains fork and join, loops carry a
//! back edge to their header, `BREAK`/`CONTINUE` jump to the loop exit or
//! header, and returns terminate. The graph is what the CLI's
//! `--cfg-output` flag renders; the pipeline builds it once to validate
//! every function body parses as well-formed structured control flow.

use binmod_core::{AbstractOp, Code, Module, ObjectId, Range};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::TransformError;

/// One function's control-flow graph. Nodes carry the opcode index range
/// of their basic block.
pub struct FunctionCfg {
    pub function: ObjectId,
    pub graph: DiGraph<Range, ()>,
    pub entry: NodeIndex,
}

struct Builder<'a> {
    code: &'a [Code],
    graph: DiGraph<Range, ()>,
    loop_stack: Vec<LoopCtx>,
    returns: Vec<NodeIndex>,
}

struct LoopCtx {
    header: NodeIndex,
    breaks: Vec<NodeIndex>,
}

impl<'a> Builder<'a> {
    fn block(&mut self, start: usize, end: usize, preds: &[NodeIndex]) -> NodeIndex {
        let node = self.graph.add_node(Range {
            start: start as u64,
            end: end as u64,
        });
        for &pred in preds {
            self.graph.add_edge(pred, node, ());
        }
        node
    }

    /// Parses `[i, limit)` until one of `stops` at this nesting level.
    /// Returns the stop index and the open exits of the sequence.
    fn parse_seq(
        &mut self,
        mut i: usize,
        limit: usize,
        stops: &[AbstractOp],
        preds: Vec<NodeIndex>,
    ) -> Result<(usize, Vec<NodeIndex>), TransformError> {
        let mut block_start = i;
        let mut preds = preds;
        let mut terminated = false;

        macro_rules! close_block {
            ($end:expr) => {{
                let node = self.block(block_start, $end, &preds);
                preds = vec![node];
                node
            }};
        }

        while i < limit {
            let op = self.code[i].op;
            if stops.contains(&op) {
                if !terminated {
                    close_block!(i);
                } else {
                    preds = Vec::new();
                }
                return Ok((i, preds));
            }
            match op {
                AbstractOp::If => {
                    let cond = close_block!(i + 1);
                    let mut arm_exits: Vec<NodeIndex> = Vec::new();
                    let mut arm_preds = vec![cond];
                    let mut fall_through = Some(cond);
                    let mut j = i + 1;
                    loop {
                        let (stop, exits) = self.parse_seq(
                            j,
                            limit,
                            &[AbstractOp::Elif, AbstractOp::Else, AbstractOp::EndIf],
                            arm_preds.clone(),
                        )?;
                        arm_exits.extend(exits);
                        match self.code[stop].op {
                            AbstractOp::Elif => {
                                let elif = self.block(stop, stop + 1, &[cond]);
                                arm_preds = vec![elif];
                                fall_through = Some(elif);
                                j = stop + 1;
                            }
                            AbstractOp::Else => {
                                arm_preds =
                                    vec![fall_through.take().expect("chain has a head")];
                                j = stop + 1;
                            }
                            AbstractOp::EndIf => {
                                i = stop + 1;
                                break;
                            }
                            other => {
                                return Err(TransformError::inconsistent(format!(
                                    "unexpected {:?} in if chain",
                                    other
                                )))
                            }
                        }
                    }
                    if let Some(head) = fall_through {
                        arm_exits.push(head);
                    }
                    preds = arm_exits;
                    block_start = i;
                    terminated = false;
                    continue;
                }
                AbstractOp::LoopInfinite | AbstractOp::LoopCondition => {
                    close_block!(i);
                    let header = self.block(i, i + 1, &preds);
                    self.loop_stack.push(LoopCtx {
                        header,
                        breaks: Vec::new(),
                    });
                    let (stop, exits) =
                        self.parse_seq(i + 1, limit, &[AbstractOp::EndLoop], vec![header])?;
                    for exit in exits {
                        self.graph.add_edge(exit, header, ());
                    }
                    let ctx = self.loop_stack.pop().expect("loop context pushed above");
                    let mut after = ctx.breaks;
                    if op == AbstractOp::LoopCondition {
                        after.push(header);
                    }
                    preds = after;
                    i = stop + 1;
                    block_start = i;
                    terminated = false;
                    continue;
                }
                AbstractOp::Match | AbstractOp::ExhaustiveMatch => {
                    let scrutinee = close_block!(i + 1);
                    let mut arm_exits = Vec::new();
                    let mut has_default = false;
                    let mut j = i + 1;
                    loop {
                        match self.code[j].op {
                            AbstractOp::Case | AbstractOp::DefaultCase => {
                                has_default |= self.code[j].op == AbstractOp::DefaultCase;
                                let case = self.block(j, j + 1, &[scrutinee]);
                                let (stop, exits) = self.parse_seq(
                                    j + 1,
                                    limit,
                                    &[AbstractOp::EndCase],
                                    vec![case],
                                )?;
                                arm_exits.extend(exits);
                                j = stop + 1;
                            }
                            AbstractOp::EndMatch => {
                                i = j + 1;
                                break;
                            }
                            other => {
                                return Err(TransformError::inconsistent(format!(
                                    "unexpected {:?} in match",
                                    other
                                )))
                            }
                        }
                    }
                    if !has_default && op == AbstractOp::Match {
                        arm_exits.push(scrutinee);
                    }
                    preds = arm_exits;
                    block_start = i;
                    terminated = false;
                    continue;
                }
                AbstractOp::Break => {
                    let node = close_block!(i + 1);
                    let ctx = self.loop_stack.last_mut().ok_or_else(|| {
                        TransformError::invalid("break outside a loop")
                    })?;
                    ctx.breaks.push(node);
                    preds = Vec::new();
                    terminated = true;
                    i += 1;
                    block_start = i;
                    continue;
                }
                AbstractOp::Continue => {
                    let node = close_block!(i + 1);
                    let header = self
                        .loop_stack
                        .last()
                        .map(|c| c.header)
                        .ok_or_else(|| TransformError::invalid("continue outside a loop"))?;
                    self.graph.add_edge(node, header, ());
                    preds = Vec::new();
                    terminated = true;
                    i += 1;
                    block_start = i;
                    continue;
                }
                AbstractOp::Ret
                | AbstractOp::RetSuccess
                | AbstractOp::RetPropertySetterOk
                | AbstractOp::RetPropertySetterFail => {
                    let node = close_block!(i + 1);
                    self.returns.push(node);
                    preds = Vec::new();
                    terminated = true;
                    i += 1;
                    block_start = i;
                    continue;
                }
                _ => {
                    i += 1;
                }
            }
        }
        if !terminated {
            close_block!(limit);
        } else {
            preds = Vec::new();
        }
        Ok((limit, preds))
    }
}

/// Builds the CFG of every function in the module.
pub fn build_cfgs(m: &Module) -> Result<Vec<FunctionCfg>, TransformError> {
    let mut cfgs = Vec::new();
    let mut i = 0;
    while i < m.code.len() {
        if m.code[i].op != AbstractOp::DefineFunction {
            i += 1;
            continue;
        }
        let function = m.code[i].require_ident()?;
        let mut depth = 0usize;
        let mut end = i;
        for (j, code) in m.code.iter().enumerate().skip(i) {
            match code.op {
                AbstractOp::DefineFunction => depth += 1,
                AbstractOp::EndFunction => {
                    depth -= 1;
                    if depth == 0 {
                        end = j;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end == i {
            return Err(TransformError::inconsistent("unterminated function"));
        }
        let mut builder = Builder {
            code: &m.code,
            graph: DiGraph::new(),
            loop_stack: Vec::new(),
            returns: Vec::new(),
        };
        let entry = builder.graph.add_node(Range {
            start: i as u64,
            end: i as u64 + 1,
        });
        builder.parse_seq(i + 1, end, &[], vec![entry])?;
        cfgs.push(FunctionCfg {
            function,
            graph: builder.graph,
            entry,
        });
        i = end + 1;
    }
    Ok(cfgs)
}

/// Pipeline step: build (and thereby validate) every function's CFG.
pub fn generate_cfg(m: &Module) -> Result<(), TransformError> {
    build_cfgs(m).map(|_| ())
}

/// Renders the CFGs as text for the `--cfg-output` flag.
pub fn write_cfg_text(m: &Module) -> Result<String, TransformError> {
    use std::fmt::Write;
    let mut out = String::new();
    for cfg in build_cfgs(m)? {
        let name = m
            .ident_table
            .get(&cfg.function)
            .map(String::as_str)
            .unwrap_or("<anonymous>");
        writeln!(out, "fn {} ({})", name, cfg.function).expect("string write");
        for node in cfg.graph.node_indices() {
            let range = cfg.graph[node];
            let successors: Vec<String> = cfg
                .graph
                .neighbors(node)
                .map(|n| format!("b{}", n.index()))
                .collect();
            writeln!(
                out,
                "  b{}: [{}..{}) -> {}",
                node.index(),
                range.start,
                range.end,
                if successors.is_empty() {
                    "-".to_string()
                } else {
                    successors.join(", ")
                }
            )
            .expect("string write");
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fn_with_body(body: Vec<Code>) -> Module {
        let mut m = Module::new();
        let function = m.new_named_id("decode");
        let mut def = Code::new(AbstractOp::DefineFunction);
        def.ident = Some(function);
        m.code.push(def);
        m.code.extend(body);
        m.code.push(Code::new(AbstractOp::EndFunction));
        m.rebind_ident_index();
        m
    }

    fn ref_op(op: AbstractOp, target: u64) -> Code {
        let mut c = Code::new(op);
        c.ref_id = Some(ObjectId(target));
        c
    }

    #[test]
    fn straight_line_function_is_one_chain() {
        let m = fn_with_body(vec![
            ref_op(AbstractOp::DecodeInt, 5),
            ref_op(AbstractOp::DecodeInt, 6),
        ]);
        let cfgs = build_cfgs(&m).unwrap();
        assert_eq!(cfgs.len(), 1);
        let cfg = &cfgs[0];
        // entry plus one body block
        assert_eq!(cfg.graph.node_count(), 2);
        assert_eq!(cfg.graph.edge_count(), 1);
    }

    #[test]
    fn if_else_forks_and_joins() {
        let m = fn_with_body(vec![
            ref_op(AbstractOp::If, 9),
            ref_op(AbstractOp::DecodeInt, 5),
            Code::new(AbstractOp::Else),
            ref_op(AbstractOp::DecodeInt, 6),
            Code::new(AbstractOp::EndIf),
            ref_op(AbstractOp::DecodeInt, 7),
        ]);
        let cfgs = build_cfgs(&m).unwrap();
        let graph = &cfgs[0].graph;
        // entry, cond, then-arm, else-arm, join
        assert_eq!(graph.node_count(), 5);
        // both arms feed the join block
        let join = graph
            .node_indices()
            .find(|&n| graph.neighbors(n).count() == 0)
            .expect("join exists");
        let join_preds = graph
            .node_indices()
            .filter(|&n| graph.neighbors(n).any(|s| s == join))
            .count();
        assert_eq!(join_preds, 2);
    }

    #[test]
    fn loop_has_back_edge_and_exit() {
        let m = fn_with_body(vec![
            ref_op(AbstractOp::LoopCondition, 9),
            ref_op(AbstractOp::DecodeInt, 5),
            Code::new(AbstractOp::EndLoop),
            ref_op(AbstractOp::DecodeInt, 7),
        ]);
        let cfgs = build_cfgs(&m).unwrap();
        let graph = &cfgs[0].graph;
        // some node has an edge back to an earlier node (the header)
        let has_back_edge = graph
            .edge_indices()
            .filter_map(|e| graph.edge_endpoints(e))
            .any(|(a, b)| b.index() < a.index());
        assert!(has_back_edge);
    }

    #[test]
    fn break_exits_the_loop() {
        let m = fn_with_body(vec![
            Code::new(AbstractOp::LoopInfinite),
            Code::new(AbstractOp::Break),
            Code::new(AbstractOp::EndLoop),
            ref_op(AbstractOp::DecodeInt, 7),
        ]);
        let cfgs = build_cfgs(&m).unwrap();
        // parses cleanly; the block after the loop is reachable only via
        // the break edge
        assert_eq!(cfgs.len(), 1);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let m = fn_with_body(vec![Code::new(AbstractOp::Break)]);
        assert!(build_cfgs(&m).is_err());
    }

    #[test]
    fn match_arms_fork_from_scrutinee() {
        let m = fn_with_body(vec![
            ref_op(AbstractOp::Match, 9),
            ref_op(AbstractOp::Case, 1),
            ref_op(AbstractOp::DecodeInt, 5),
            Code::new(AbstractOp::EndCase),
            Code::new(AbstractOp::DefaultCase),
            ref_op(AbstractOp::DecodeInt, 6),
            Code::new(AbstractOp::EndCase),
            Code::new(AbstractOp::EndMatch),
        ]);
        let cfgs = build_cfgs(&m).unwrap();
        assert!(cfgs[0].graph.node_count() >= 5);
    }

    #[test]
    fn cfg_text_lists_blocks() {
        let m = fn_with_body(vec![ref_op(AbstractOp::DecodeInt, 5)]);
        let text = write_cfg_text(&m).unwrap();
        assert!(text.contains("fn decode"));
        assert!(text.contains("b0"));
    }
}
