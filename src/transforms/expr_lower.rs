// src/transforms/expr_lower.rs
//! Statement-list-expression lowering.
//!
//! First phase of the closure-iterator transform: after it runs, no
//! expression subtree contains a `yield`. Every compound expression that
//! transitively suspends is rewritten into a statement sequence that
//! materializes sub-results into hidden temporaries, so suspension only
//! ever happens between statements.
//!
//! The rewrite is bottom-up. A lowered subtree that still carries a value
//! comes back as a `StmtListExpr`; parents splice its statements out and
//! keep the tail in the original value position (hoisting it through a
//! temporary where evaluation order would otherwise change).

use tracing::trace;

use crate::errors::InternalError;
use crate::frontend::ast::{Node, NodeKind};
use crate::sema::sym::{Magic, SymKind};
use crate::sema::types::{TyKind, TypeId};
use crate::transforms::closure_iter::Ctx;

/// True if `n` transitively contains a `yield`.
pub(crate) fn has_yield(n: &Node) -> bool {
    match n.kind {
        NodeKind::Yield => true,
        _ => n.kids.iter().any(has_yield),
    }
}

/// Post-condition check of the lowering, and the gate for constructs
/// earlier passes must have eliminated.
pub(crate) fn verify_lowered(n: &Node) -> Result<(), InternalError> {
    verify_node(n, false)
}

fn verify_node(n: &Node, in_expr: bool) -> Result<(), InternalError> {
    match n.kind {
        NodeKind::Yield if in_expr => {
            return Err(InternalError::YieldInExpression {
                span: n.span.into(),
            });
        }
        NodeKind::For
        | NodeKind::Continue
        | NodeKind::GotoState
        | NodeKind::State(_)
        | NodeKind::StateLit(_) => {
            return Err(InternalError::UnsupportedConstruct {
                construct: n.kind_name(),
                span: n.span.into(),
            });
        }
        _ => {}
    }
    let last = n.kids.len().saturating_sub(1);
    for (i, kid) in n.kids.iter().enumerate() {
        let kid_in_expr = match n.kind {
            NodeKind::StmtList
            | NodeKind::If
            | NodeKind::Else
            | NodeKind::Finally
            | NodeKind::Block
            | NodeKind::Try
            | NodeKind::VarSection => false,
            NodeKind::StmtListExpr => i == last,
            NodeKind::ElifBranch | NodeKind::While | NodeKind::Case => i == 0,
            NodeKind::OfBranch | NodeKind::ExceptBranch => i < last,
            _ => true,
        };
        verify_node(kid, in_expr || kid_in_expr)?;
    }
    Ok(())
}

impl Ctx<'_> {
    pub(crate) fn lower(&mut self, mut n: Node) -> Result<Node, InternalError> {
        if !has_yield(&n) {
            return Ok(n);
        }
        match n.kind {
            NodeKind::Yield => {
                let span = n.span;
                if !n.kids.is_empty() && has_yield(&n.kids[0]) {
                    let arg = n.take_kid(0);
                    let arg = self.lower(arg)?;
                    let mut stmts = Vec::new();
                    let tail = self.to_tail(arg, &mut stmts);
                    n.kids[0] = tail;
                    stmts.push(n);
                    Ok(Node::stmt_list(stmts, span))
                } else {
                    Ok(n)
                }
            }

            NodeKind::StmtList | NodeKind::StmtListExpr => self.lower_stmt_seq(n),

            NodeKind::Asgn => {
                let span = n.span;
                let lhs = n.take_kid(0);
                let rhs = n.take_kid(1);
                let lhs = self.lower(lhs)?;
                let rhs = self.lower(rhs)?;
                let mut stmts = Vec::new();
                let lhs = self.to_tail(lhs, &mut stmts);
                let rhs = self.to_tail(rhs, &mut stmts);
                n.kids[0] = lhs;
                n.kids[1] = rhs;
                if stmts.is_empty() {
                    Ok(n)
                } else {
                    stmts.push(n);
                    Ok(Node::stmt_list(stmts, span))
                }
            }

            NodeKind::Call => {
                let magic = self.g.sym_of(&n.kids[0]).and_then(|s| s.magic);
                if matches!(magic, Some(Magic::And | Magic::Or))
                    && n.kids[1..].iter().any(has_yield)
                {
                    return self.lower_short_circuit(n, magic == Some(Magic::And));
                }
                let span = n.span;
                let ty = n.ty;
                let mut stmts = Vec::new();
                self.hoist_operands(&mut n, true, &mut stmts)?;
                if stmts.is_empty() {
                    return Ok(n);
                }
                stmts.push(n);
                let kind = if ty.is_some() {
                    NodeKind::StmtListExpr
                } else {
                    NodeKind::StmtList
                };
                let mut res = Node::new(kind, span).with_kids(stmts);
                res.ty = ty;
                Ok(res)
            }

            NodeKind::Conv
            | NodeKind::Cast
            | NodeKind::Deref
            | NodeKind::FieldAccess
            | NodeKind::BracketExpr
            | NodeKind::RangeCheck => {
                let span = n.span;
                let ty = n.ty;
                let mut stmts = Vec::new();
                self.hoist_operands(&mut n, false, &mut stmts)?;
                if stmts.is_empty() {
                    return Ok(n);
                }
                stmts.push(n);
                let mut res = Node::new(NodeKind::StmtListExpr, span).with_kids(stmts);
                res.ty = ty;
                Ok(res)
            }

            NodeKind::TupleConstr | NodeKind::ArrayConstr | NodeKind::ObjConstr => {
                self.lower_constructor(n)
            }

            NodeKind::If => self.lower_if(n),
            NodeKind::Case => self.lower_case(n),
            NodeKind::Try => self.lower_try(n),
            NodeKind::While => self.lower_while(n),
            NodeKind::Block => self.lower_block(n),
            NodeKind::VarSection => self.lower_var_section(n),

            NodeKind::Return | NodeKind::Raise => {
                let span = n.span;
                let value = n.take_kid(0);
                let value = self.lower(value)?;
                let mut stmts = Vec::new();
                let tail = self.to_tail(value, &mut stmts);
                n.kids[0] = tail;
                if stmts.is_empty() {
                    Ok(n)
                } else {
                    stmts.push(n);
                    Ok(Node::stmt_list(stmts, span))
                }
            }

            NodeKind::For | NodeKind::Continue => Err(InternalError::UnsupportedConstruct {
                construct: n.kind_name(),
                span: n.span.into(),
            }),

            _ => {
                for i in 0..n.kids.len() {
                    let kid = n.take_kid(i);
                    n.kids[i] = self.lower(kid)?;
                }
                Ok(n)
            }
        }
    }

    fn lower_stmt_seq(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let is_expr = n.kind == NodeKind::StmtListExpr;
        let kids = std::mem::take(&mut n.kids);
        let last = kids.len().saturating_sub(1);
        let mut out = Vec::with_capacity(kids.len());
        for (i, kid) in kids.into_iter().enumerate() {
            let kid = self.lower(kid)?;
            if (is_expr && i == last) || kid.kind == NodeKind::StmtListExpr {
                // splice nested statements; the tail keeps its position
                let tail = self.to_tail(kid, &mut out);
                out.push(tail);
            } else {
                out.push(kid);
            }
        }
        n.kids = out;
        Ok(n)
    }

    /// Hoist yielding operands (and, for calls, every other call-kind
    /// operand, so evaluation order survives the introduced statements).
    fn hoist_operands(
        &mut self,
        n: &mut Node,
        hoist_sibling_calls: bool,
        stmts: &mut Vec<Node>,
    ) -> Result<(), InternalError> {
        if !n.kids.iter().any(has_yield) {
            return Ok(());
        }
        for i in 0..n.kids.len() {
            if has_yield(&n.kids[i]) {
                let kid = n.take_kid(i);
                let kid = self.lower(kid)?;
                let tail = self.to_tail(kid, stmts);
                n.kids[i] = self.hoist_to_temp(tail, stmts);
            } else if hoist_sibling_calls && i > 0 && n.kids[i].kind == NodeKind::Call {
                let kid = n.take_kid(i);
                n.kids[i] = self.hoist_to_temp(kid, stmts);
            }
        }
        Ok(())
    }

    fn lower_constructor(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let ty = n.ty;
        let mut stmts = Vec::new();
        for i in 0..n.kids.len() {
            if !has_yield(&n.kids[i]) {
                continue;
            }
            let kid = n.take_kid(i);
            let new_kid = if kid.kind == NodeKind::ExprColonExpr {
                let mut colon = kid;
                let value = colon.take_kid(1);
                let value = self.lower(value)?;
                let tail = self.to_tail(value, &mut stmts);
                colon.kids[1] = self.hoist_to_temp(tail, &mut stmts);
                colon
            } else {
                let kid = self.lower(kid)?;
                let tail = self.to_tail(kid, &mut stmts);
                self.hoist_to_temp(tail, &mut stmts)
            };
            n.kids[i] = new_kid;
        }
        stmts.push(n);
        let mut res = Node::new(NodeKind::StmtListExpr, span).with_kids(stmts);
        res.ty = ty;
        Ok(res)
    }

    fn lower_if(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let is_expr = n.ty.is_some();
        let result_ty = n.ty;

        let kids = std::mem::take(&mut n.kids);
        let mut branches: Vec<(Option<Node>, Node)> = Vec::with_capacity(kids.len());
        for mut b in kids {
            match b.kind {
                NodeKind::ElifBranch => {
                    let cond = b.take_kid(0);
                    let body = b.take_kid(1);
                    branches.push((Some(self.lower(cond)?), self.lower(body)?));
                }
                NodeKind::Else => {
                    let body = b.take_kid(0);
                    branches.push((None, self.lower(body)?));
                }
                _ => {
                    return Err(InternalError::InvariantViolation {
                        message: "malformed if branch".into(),
                        span: b.span.into(),
                    });
                }
            }
        }

        // Value form: every branch tail assigns a fresh temporary.
        let tmp = if is_expr {
            Some(self.new_temp_var(result_ty.unwrap_or_else(|| self.int_fallback())))
        } else {
            None
        };
        let mut stmt_branches: Vec<(Option<Node>, Node)> = Vec::with_capacity(branches.len());
        for (cond, body) in branches {
            let body = match tmp {
                Some(t) => {
                    let mut bstmts = Vec::new();
                    let tail = self.to_tail(body, &mut bstmts);
                    let lhs = self.access_of(t, span);
                    bstmts.push(Node::asgn(lhs, tail));
                    Node::stmt_list(bstmts, span)
                }
                None => body.into_stmt_list(),
            };
            stmt_branches.push((cond, body));
        }

        let any_cond_split = stmt_branches
            .iter()
            .any(|(c, _)| matches!(c, Some(x) if x.kind == NodeKind::StmtListExpr));

        let mut stmts = if any_cond_split {
            // Later conditions may suspend: nest them under else so they
            // only evaluate when reached.
            let mut acc: Option<Vec<Node>> = None;
            for (cond, body) in stmt_branches.into_iter().rev() {
                match cond {
                    None => acc = Some(vec![body]),
                    Some(c) => {
                        let mut level = Vec::new();
                        let tail = self.to_tail(c, &mut level);
                        let mut iff = Node::new(NodeKind::If, span).with_kids(vec![
                            Node::new(NodeKind::ElifBranch, span).with_kids(vec![tail, body]),
                        ]);
                        if let Some(rest) = acc.take() {
                            iff.kids.push(
                                Node::new(NodeKind::Else, span)
                                    .with_kids(vec![Node::stmt_list(rest, span)]),
                            );
                        }
                        level.push(iff);
                        acc = Some(level);
                    }
                }
            }
            acc.unwrap_or_default()
        } else {
            let mut iff = Node::new(NodeKind::If, span);
            for (cond, body) in stmt_branches {
                match cond {
                    Some(c) => iff.kids.push(
                        Node::new(NodeKind::ElifBranch, span).with_kids(vec![c, body]),
                    ),
                    None => iff
                        .kids
                        .push(Node::new(NodeKind::Else, span).with_kids(vec![body])),
                }
            }
            vec![iff]
        };

        match tmp {
            Some(t) => {
                let read = self.access_of(t, span);
                stmts.push(read);
                let mut res = Node::new(NodeKind::StmtListExpr, span).with_kids(stmts);
                res.ty = result_ty;
                Ok(res)
            }
            None => {
                if stmts.len() == 1 {
                    Ok(stmts.remove(0))
                } else {
                    Ok(Node::stmt_list(stmts, span))
                }
            }
        }
    }

    fn lower_case(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let is_expr = n.ty.is_some();
        let result_ty = n.ty;

        let mut stmts = Vec::new();
        if has_yield(&n.kids[0]) {
            let sel = n.take_kid(0);
            let sel = self.lower(sel)?;
            let tail = self.to_tail(sel, &mut stmts);
            n.kids[0] = self.hoist_to_temp(tail, &mut stmts);
        }

        let tmp = if is_expr {
            Some(self.new_temp_var(result_ty.unwrap_or_else(|| self.int_fallback())))
        } else {
            None
        };
        for i in 1..n.kids.len() {
            let mut branch = n.take_kid(i);
            let body_idx = match branch.kind {
                NodeKind::OfBranch => branch.kids.len() - 1,
                NodeKind::Else => 0,
                _ => {
                    return Err(InternalError::InvariantViolation {
                        message: "malformed case branch".into(),
                        span: branch.span.into(),
                    });
                }
            };
            let body = branch.take_kid(body_idx);
            let body = self.lower(body)?;
            branch.kids[body_idx] = match tmp {
                Some(t) => {
                    let mut bstmts = Vec::new();
                    let tail = self.to_tail(body, &mut bstmts);
                    let lhs = self.access_of(t, span);
                    bstmts.push(Node::asgn(lhs, tail));
                    Node::stmt_list(bstmts, span)
                }
                None => body,
            };
            n.kids[i] = branch;
        }

        n.ty = None;
        match tmp {
            Some(t) => {
                stmts.push(n);
                let read = self.access_of(t, span);
                stmts.push(read);
                let mut res = Node::new(NodeKind::StmtListExpr, span).with_kids(stmts);
                res.ty = result_ty;
                Ok(res)
            }
            None => {
                if stmts.is_empty() {
                    Ok(n)
                } else {
                    stmts.push(n);
                    Ok(Node::stmt_list(stmts, span))
                }
            }
        }
    }

    fn lower_try(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let is_expr = n.ty.is_some();
        let result_ty = n.ty;
        let tmp = if is_expr {
            Some(self.new_temp_var(result_ty.unwrap_or_else(|| self.int_fallback())))
        } else {
            None
        };

        for i in 0..n.kids.len() {
            let is_value_position = match n.kids[i].kind {
                NodeKind::ExceptBranch => true,
                NodeKind::Finally => false,
                _ => i == 0,
            };
            match n.kids[i].kind {
                NodeKind::ExceptBranch | NodeKind::Finally => {
                    let mut branch = n.take_kid(i);
                    let body_idx = branch.kids.len() - 1;
                    let body = branch.take_kid(body_idx);
                    let body = self.lower(body)?;
                    branch.kids[body_idx] = match (tmp, is_value_position) {
                        (Some(t), true) => {
                            let mut bstmts = Vec::new();
                            let tail = self.to_tail(body, &mut bstmts);
                            let lhs = self.access_of(t, span);
                            bstmts.push(Node::asgn(lhs, tail));
                            Node::stmt_list(bstmts, span)
                        }
                        _ => body,
                    };
                    n.kids[i] = branch;
                }
                _ => {
                    let body = n.take_kid(i);
                    let body = self.lower(body)?;
                    n.kids[i] = match tmp {
                        Some(t) => {
                            let mut bstmts = Vec::new();
                            let tail = self.to_tail(body, &mut bstmts);
                            let lhs = self.access_of(t, span);
                            bstmts.push(Node::asgn(lhs, tail));
                            Node::stmt_list(bstmts, span)
                        }
                        None => body,
                    };
                }
            }
        }

        n.ty = None;
        match tmp {
            Some(t) => {
                let read = self.access_of(t, span);
                let mut res =
                    Node::new(NodeKind::StmtListExpr, span).with_kids(vec![n, read]);
                res.ty = result_ty;
                Ok(res)
            }
            None => Ok(n),
        }
    }

    fn lower_while(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let cond = n.take_kid(0);
        let cond = self.lower(cond)?;
        let body = n.take_kid(1);
        let body = self.lower(body)?;

        if cond.kind != NodeKind::StmtListExpr {
            n.kids[0] = cond;
            n.kids[1] = body;
            return Ok(n);
        }

        // The condition suspends: re-evaluate it at the top of every
        // round inside an endless loop, leaving through a labeled block.
        let label = self
            .g
            .new_unique_sym(self.idgen, ":whileLoop", SymKind::Label, None);
        let mut loop_body = Vec::new();
        let tail = self.to_tail(cond, &mut loop_body);
        let not_cond = self.magic_call(Magic::Not, vec![tail], TyKind::Bool, span);
        let brk = Node::new(NodeKind::Break, span).with_kids(vec![Node::sym(label, span)]);
        loop_body.push(Node::new(NodeKind::If, span).with_kids(vec![
            Node::new(NodeKind::ElifBranch, span)
                .with_kids(vec![not_cond, Node::stmt_list(vec![brk], span)]),
        ]));
        loop_body.push(body);
        let tru = self.bool_lit(true, span);
        let new_loop = Node::new(NodeKind::While, span)
            .with_kids(vec![tru, Node::stmt_list(loop_body, span)]);
        Ok(Node::new(NodeKind::Block, span).with_kids(vec![
            Node::sym(label, span),
            Node::stmt_list(vec![new_loop], span),
        ]))
    }

    fn lower_block(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let result_ty = n.ty;
        let body = n.take_kid(1);
        let body = self.lower(body)?;
        match result_ty {
            Some(ty) => {
                // Block expression: statement form plus a temporary.
                let tmp = self.new_temp_var(ty);
                let mut bstmts = Vec::new();
                let tail = self.to_tail(body, &mut bstmts);
                let lhs = self.access_of(tmp, span);
                bstmts.push(Node::asgn(lhs, tail));
                n.kids[1] = Node::stmt_list(bstmts, span);
                n.ty = None;
                let read = self.access_of(tmp, span);
                let mut res =
                    Node::new(NodeKind::StmtListExpr, span).with_kids(vec![n, read]);
                res.ty = Some(ty);
                Ok(res)
            }
            None => {
                n.kids[1] = body;
                Ok(n)
            }
        }
    }

    fn lower_var_section(&mut self, mut n: Node) -> Result<Node, InternalError> {
        let span = n.span;
        let kids = std::mem::take(&mut n.kids);
        let mut out: Vec<Node> = Vec::new();
        let mut pending: Vec<Node> = Vec::new();
        for mut def in kids {
            if def.kids.len() > 1 && has_yield(&def.kids[1]) {
                if !pending.is_empty() {
                    out.push(
                        Node::new(NodeKind::VarSection, span)
                            .with_kids(std::mem::take(&mut pending)),
                    );
                }
                let init = def.take_kid(1);
                let init = self.lower(init)?;
                let tail = self.to_tail(init, &mut out);
                def.kids[1] = tail;
                out.push(Node::new(NodeKind::VarSection, span).with_kids(vec![def]));
            } else {
                pending.push(def);
            }
        }
        if !pending.is_empty() {
            out.push(Node::new(NodeKind::VarSection, span).with_kids(pending));
        }
        if out.len() == 1 {
            Ok(out.remove(0))
        } else {
            Ok(Node::stmt_list(out, span))
        }
    }

    fn lower_short_circuit(
        &mut self,
        mut n: Node,
        is_and: bool,
    ) -> Result<Node, InternalError> {
        let span = n.span;
        let bool_ty = self.g.sys_type(TyKind::Bool);
        let a = n.take_kid(1);
        let b = n.take_kid(2);
        let a = self.lower(a)?;
        let b = self.lower(b)?;

        let mut stmts = Vec::new();
        let a_tail = self.to_tail(a, &mut stmts);
        let tmp = self.new_temp_var(bool_ty);
        let lhs = self.access_of(tmp, span);
        stmts.push(Node::asgn(lhs, a_tail));

        let mut bstmts = Vec::new();
        let b_tail = self.to_tail(b, &mut bstmts);
        let lhs2 = self.access_of(tmp, span);
        bstmts.push(Node::asgn(lhs2, b_tail));

        let guard = self.access_of(tmp, span);
        let cond = if is_and {
            guard
        } else {
            self.magic_call(Magic::Not, vec![guard], TyKind::Bool, span)
        };
        stmts.push(Node::new(NodeKind::If, span).with_kids(vec![
            Node::new(NodeKind::ElifBranch, span)
                .with_kids(vec![cond, Node::stmt_list(bstmts, span)]),
        ]));
        let read = self.access_of(tmp, span);
        stmts.push(read);
        let mut res = Node::new(NodeKind::StmtListExpr, span).with_kids(stmts);
        res.ty = Some(bool_ty);
        Ok(res)
    }

    fn to_tail(&mut self, n: Node, stmts: &mut Vec<Node>) -> Node {
        if n.kind == NodeKind::StmtListExpr {
            let span = n.span;
            let mut kids = n.kids;
            match kids.pop() {
                Some(tail) => {
                    stmts.extend(kids);
                    tail
                }
                None => Node::empty(span),
            }
        } else {
            n
        }
    }

    fn hoist_to_temp(&mut self, value: Node, stmts: &mut Vec<Node>) -> Node {
        let span = value.span;
        let ty = self.expr_ty(&value);
        let tmp = self.new_temp_var(ty);
        trace!("hoisting subexpression into a temporary");
        let lhs = self.access_of(tmp, span);
        stmts.push(Node::asgn(lhs, value));
        self.access_of(tmp, span)
    }

    fn expr_ty(&self, n: &Node) -> TypeId {
        match n.ty {
            Some(t) => t,
            None => self.int_fallback(),
        }
    }

    fn int_fallback(&self) -> TypeId {
        self.g.sys_type(TyKind::Int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::render_body;
    use crate::frontend::Span;
    use crate::sema::{IdGen, ModuleGraph, SymKind};

    fn sp() -> Span {
        Span::default()
    }

    fn lower_body(g: &mut ModuleGraph, idgen: &mut IdGen, f: crate::sema::SymId, body: Node) -> Node {
        let mut ctx = Ctx::new(g, idgen, f, body.span).unwrap();
        let lowered = ctx.lower(body).unwrap();
        verify_lowered(&lowered).unwrap();
        lowered
    }

    #[test]
    fn yield_inside_condition_is_hoisted() {
        // if (yield 1; 2) == 2: yield 3
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let int = g.sys_type(TyKind::Int);
        let bool_ty = g.sys_type(TyKind::Bool);
        let f = g.declare_routine(&mut idgen, "items", Some(int));
        let eq = g.sys_magic(&mut idgen, crate::sema::Magic::EqI);

        let sle = Node::new(NodeKind::StmtListExpr, sp())
            .with_kids(vec![
                Node::new(NodeKind::Yield, sp())
                    .with_kids(vec![Node::int_lit(1, sp()).with_ty(int)]),
                Node::int_lit(2, sp()).with_ty(int),
            ])
            .with_ty(int);
        let cond = Node::call(
            Node::sym(eq, sp()),
            vec![sle, Node::int_lit(2, sp()).with_ty(int)],
            sp(),
        )
        .with_ty(bool_ty);
        let body = Node::stmt_list(
            vec![Node::new(NodeKind::If, sp()).with_kids(vec![
                Node::new(NodeKind::ElifBranch, sp()).with_kids(vec![
                    cond,
                    Node::stmt_list(
                        vec![Node::new(NodeKind::Yield, sp())
                            .with_kids(vec![Node::int_lit(3, sp()).with_ty(int)])],
                        sp(),
                    ),
                ]),
            ])],
            sp(),
        );

        let lowered = lower_body(&mut g, &mut idgen, f, body);
        let rendered = render_body(&g, &lowered);
        let yield_pos = rendered.find("yield 1").unwrap();
        let if_pos = rendered.find("if ").unwrap();
        assert!(yield_pos < if_pos, "{rendered}");
        assert!(rendered.contains(":tmp"), "{rendered}");
    }

    #[test]
    fn yielding_while_condition_becomes_endless_loop() {
        // while (yield 1; a): discard  ->  block: while true: ...
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let int = g.sys_type(TyKind::Int);
        let bool_ty = g.sys_type(TyKind::Bool);
        let f = g.declare_routine(&mut idgen, "items", Some(int));
        let a = g.new_sym(&mut idgen, "a", SymKind::Var, Some(bool_ty));

        let cond = Node::new(NodeKind::StmtListExpr, sp())
            .with_kids(vec![
                Node::new(NodeKind::Yield, sp())
                    .with_kids(vec![Node::int_lit(1, sp()).with_ty(int)]),
                Node::sym(a, sp()).with_ty(bool_ty),
            ])
            .with_ty(bool_ty);
        let body = Node::stmt_list(
            vec![Node::new(NodeKind::While, sp()).with_kids(vec![
                cond,
                Node::stmt_list(vec![], sp()),
            ])],
            sp(),
        );

        let lowered = lower_body(&mut g, &mut idgen, f, body);
        let rendered = render_body(&g, &lowered);
        assert!(rendered.contains("while true:"), "{rendered}");
        assert!(rendered.contains("break :whileLoop"), "{rendered}");
        assert!(rendered.contains("not a"), "{rendered}");
    }

    #[test]
    fn short_circuit_and_keeps_second_operand_guarded() {
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let int = g.sys_type(TyKind::Int);
        let bool_ty = g.sys_type(TyKind::Bool);
        let f = g.declare_routine(&mut idgen, "items", Some(int));
        let a = g.new_sym(&mut idgen, "a", SymKind::Var, Some(bool_ty));
        let and_sym = g.sys_magic(&mut idgen, crate::sema::Magic::And);

        let rhs = Node::new(NodeKind::StmtListExpr, sp())
            .with_kids(vec![
                Node::new(NodeKind::Yield, sp())
                    .with_kids(vec![Node::int_lit(1, sp()).with_ty(int)]),
                Node::sym(a, sp()).with_ty(bool_ty),
            ])
            .with_ty(bool_ty);
        let and_call = Node::call(
            Node::sym(and_sym, sp()),
            vec![Node::sym(a, sp()).with_ty(bool_ty), rhs],
            sp(),
        )
        .with_ty(bool_ty);
        let body = Node::stmt_list(
            vec![Node::new(NodeKind::If, sp()).with_kids(vec![
                Node::new(NodeKind::ElifBranch, sp()).with_kids(vec![
                    and_call,
                    Node::stmt_list(vec![], sp()),
                ]),
            ])],
            sp(),
        );

        let lowered = lower_body(&mut g, &mut idgen, f, body);
        let rendered = render_body(&g, &lowered);
        // the second operand only evaluates under the first
        let guard = rendered.find("if :tmp").unwrap();
        let inner_yield = rendered.find("yield 1").unwrap();
        assert!(guard < inner_yield, "{rendered}");
    }

    #[test]
    fn yield_free_body_is_untouched() {
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let int = g.sys_type(TyKind::Int);
        let f = g.declare_routine(&mut idgen, "items", Some(int));
        let a = g.new_sym(&mut idgen, "a", SymKind::Var, Some(int));
        let body = Node::stmt_list(
            vec![Node::asgn(
                Node::sym(a, sp()).with_ty(int),
                Node::int_lit(1, sp()).with_ty(int),
            )],
            sp(),
        );
        let before = format!("{body:?}");
        let lowered = lower_body(&mut g, &mut idgen, f, body);
        assert_eq!(before, format!("{lowered:?}"));
    }
}
