// src/transforms/closure_iter.rs
//! Closure-iterator lowering.
//!
//! Rewrites the body of a resumable routine (one that may `yield`) into a
//! flat state machine: a single `while` loop dispatching on a numbered
//! program counter. Control flow is split at every suspension point;
//! `try`/`except`/`finally` semantics survive suspension through a hidden
//! current-exception slot and a per-state exception table.
//!
//! ## Example transformation
//!
//! Input:
//! ```text
//! iterator countdown(a: int): int =
//!     while 0 < a:
//!         yield a
//!         dec(a)
//! ```
//! Output (rendered):
//! ```text
//! while true:
//!   block :stateLoop:
//!     gotoState :state
//!     var :state: int16
//!     state 0:
//!       if 0 < a:
//!         :state = 1
//!         :result = a
//!         return
//!       else:
//!         :state = -1
//!         break :stateLoop
//!     state 1:
//!       dec(a)
//!       :state = 0
//!       break :stateLoop
//! ```
//!
//! The pass runs in phases: statement-list-expression lowering (see
//! `expr_lower`), the state splitter, empty-state folding, state-assignment
//! lowering, and finally the loop/catch wrapping. Hidden variables live as
//! locals when lambda-lifting has not run yet (the lifter then sinks them,
//! `:state` first), or as fresh fields of the environment record when it
//! has.

use tracing::{debug, trace};

use crate::errors::InternalError;
use crate::frontend::ast::{Node, NodeKind};
use crate::frontend::Span;
use crate::sema::sym::{Magic, SymId, SymKind};
use crate::sema::types::{TyKind, Type, TypeId};
use crate::sema::{IdGen, ModuleGraph};
use crate::transforms::expr_lower::verify_lowered;

/// The virtual exit state. Never stored in the state list.
pub(crate) const EXIT_STATE: i64 = -1;

/// Exception-handler link of one state: where control goes when an
/// exception escapes it. `Finally` targets unroll, `Except` targets handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExcTarget {
    None,
    Except(usize),
    Finally(usize),
}

/// One basic block of the machine under construction. Identified by its
/// position in `Ctx::states` until `delete_empty_states` assigns final ids.
pub(crate) struct StateRecord {
    pub(crate) body: Node,
    pub(crate) exc_handler: ExcTarget,
    /// Final 0-based index, set during empty-state folding.
    pub(crate) final_id: i64,
    /// Signed exception-table entry: `-k` except state, `+k` finally
    /// state, `0` no handler.
    pub(crate) exc_final: i64,
    empty: bool,
}

/// Resolution data for one `break` target.
#[derive(Debug, Clone, Copy)]
struct BreakScope {
    label: Option<SymId>,
    /// Where control goes after the block/loop, as a state position.
    out: i64,
    /// Innermost finally enclosing the block at registration time
    /// (position; 0 = none).
    nearest_finally: usize,
    is_loop: bool,
}

#[derive(Debug, Clone, Copy)]
struct EnvInfo {
    param: SymId,
    ty: TypeId,
    state_field: SymId,
}

enum ChaseResult {
    Exit,
    State(usize),
}

pub(crate) struct Ctx<'a> {
    pub(crate) g: &'a mut ModuleGraph,
    pub(crate) idgen: &'a mut IdGen,
    fn_sym: SymId,
    body_span: Span,
    env: Option<EnvInfo>,
    /// The hidden `:state` local when lambda-lifting has not run yet. The
    /// lifter later sinks it as field 0 of the environment record.
    state_var: Option<SymId>,
    state_loop_label: SymId,
    tmp_result: Option<SymId>,
    unroll_finally: Option<SymId>,
    unroll_until: Option<SymId>,
    after_unroll: Option<SymId>,
    cur_exc: Option<SymId>,
    /// Hidden locals (temporaries included) when not lifted; emitted into
    /// the loop scaffold so the lifter sees them.
    local_vars: Vec<SymId>,
    states: Vec<StateRecord>,
    /// Position of the innermost enclosing finally state; 0 = none (the
    /// entry state is allocated first and is never a finally).
    nearest_finally: usize,
    cur_exc_handling: ExcTarget,
    has_exceptions: bool,
    scopes: Vec<BreakScope>,
}

/// Entry point. Consumes the iterator body and returns the state-machine
/// replacement. `fn_sym` must be a routine registered with the graph;
/// whether lambda-lifting already ran is detected from its environment
/// parameter.
pub fn transform_closure_iterator(
    g: &mut ModuleGraph,
    idgen: &mut IdGen,
    fn_sym: SymId,
    body: Node,
) -> Result<Node, InternalError> {
    let mut ctx = Ctx::new(g, idgen, fn_sym, body.span)?;

    let n = body.into_stmt_list();
    let n = ctx.lower_stmt_list_exprs(n)?;
    verify_lowered(&n)?;

    let entry = ctx.reserve_state_with(n.span, ExcTarget::None);
    let transformed = ctx.transform_body(n, EXIT_STATE)?;
    ctx.fill_state(entry, transformed);

    ctx.delete_empty_states()?;
    debug!(
        states = ctx.states.len(),
        has_exceptions = ctx.has_exceptions,
        "closure iterator split complete"
    );

    let concat = ctx.concat_states();
    let concat = ctx.transform_state_assignments(concat)?;
    Ok(ctx.wrap_into_state_loop(concat))
}

/// True if evaluating `n` can leave the enclosing fragment: it contains a
/// `yield` or a `break` somewhere below.
pub(crate) fn has_control_flow(n: &Node) -> bool {
    match n.kind {
        NodeKind::Yield | NodeKind::Break => true,
        _ => n.kids.iter().any(has_control_flow),
    }
}

/// Strip single-statement list wrappers.
fn skip_stmt_list(n: &Node) -> &Node {
    let mut cur = n;
    while matches!(cur.kind, NodeKind::StmtList | NodeKind::StmtListExpr) && cur.kids.len() == 1 {
        cur = &cur.kids[0];
    }
    cur
}

fn rewrite_state_lits(n: &mut Node, resolved: &[i64]) {
    if let NodeKind::StateLit(v) = n.kind
        && v >= 0
    {
        n.kind = NodeKind::StateLit(resolved[v as usize]);
    }
    for kid in &mut n.kids {
        rewrite_state_lits(kid, resolved);
    }
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        g: &'a mut ModuleGraph,
        idgen: &'a mut IdGen,
        fn_sym: SymId,
        body_span: Span,
    ) -> Result<Self, InternalError> {
        let env = match g.env_param(fn_sym) {
            Some(param) => {
                let ty = g.syms.get(param).ty.ok_or_else(|| {
                    InternalError::InvariantViolation {
                        message: "environment parameter has no type".into(),
                        span: body_span.into(),
                    }
                })?;
                let state_field =
                    g.state_field(fn_sym)
                        .ok_or_else(|| InternalError::InvariantViolation {
                            message: "lifted environment without a state field".into(),
                            span: body_span.into(),
                        })?;
                Some(EnvInfo {
                    param,
                    ty,
                    state_field,
                })
            }
            None => None,
        };
        let state_var = if env.is_none() {
            let ty = g.closure_iter_state_type(fn_sym);
            Some(g.new_sym(idgen, ":state", SymKind::Var, Some(ty)))
        } else {
            None
        };
        let state_loop_label = g.new_sym(idgen, ":stateLoop", SymKind::Label, None);
        Ok(Ctx {
            g,
            idgen,
            fn_sym,
            body_span,
            env,
            state_var,
            state_loop_label,
            tmp_result: None,
            unroll_finally: None,
            unroll_until: None,
            after_unroll: None,
            cur_exc: None,
            local_vars: Vec::new(),
            states: Vec::new(),
            nearest_finally: 0,
            cur_exc_handling: ExcTarget::None,
            has_exceptions: false,
            scopes: Vec::new(),
        })
    }

    fn invariant(&self, message: impl Into<String>, span: Span) -> InternalError {
        InternalError::InvariantViolation {
            message: message.into(),
            span: span.into(),
        }
    }

    // ------------------------------------------------------------------
    // Hidden variables and accessors
    // ------------------------------------------------------------------

    /// Allocate a hidden variable: a fresh environment field when lifted,
    /// otherwise a local the lifter will pick up later.
    fn make_hidden(&mut self, base: &str, ty: TypeId) -> SymId {
        let sym = match self.env {
            Some(env) => self.g.add_unique_field(self.idgen, env.ty, base, ty),
            None => {
                let s = self.g.new_sym(self.idgen, base, SymKind::Var, Some(ty));
                self.local_vars.push(s);
                s
            }
        };
        trace!(name = base, lifted = self.env.is_some(), "hidden variable");
        sym
    }

    /// Read/write access to a hidden (or ordinary) symbol.
    pub(crate) fn access_of(&self, sym: SymId, span: Span) -> Node {
        let s = self.g.syms.get(sym);
        let ty = s.ty;
        let mut node = if s.kind == SymKind::Field {
            match self.env {
                Some(env) => {
                    let deref = Node::new(NodeKind::Deref, span)
                        .with_kids(vec![Node::sym(env.param, span)]);
                    Node::new(NodeKind::FieldAccess, span)
                        .with_kids(vec![deref, Node::sym(sym, span)])
                }
                None => Node::sym(sym, span),
            }
        } else {
            Node::sym(sym, span)
        };
        node.ty = ty;
        node
    }

    pub(crate) fn new_temp_var(&mut self, ty: TypeId) -> SymId {
        match self.env {
            Some(env) => self.g.add_unique_field(self.idgen, env.ty, ":tmp", ty),
            None => {
                let s = self.g.new_unique_sym(self.idgen, ":tmp", SymKind::Temp, Some(ty));
                self.local_vars.push(s);
                s
            }
        }
    }

    fn state_access(&mut self, span: Span) -> Node {
        match self.env {
            Some(env) => self.access_of(env.state_field, span),
            None => match self.state_var {
                Some(sv) => self.access_of(sv, span),
                None => Node::empty(span),
            },
        }
    }

    fn tmp_result_access(&mut self, span: Span) -> Result<Node, InternalError> {
        if self.tmp_result.is_none() {
            let ty = self
                .g
                .return_type(self.fn_sym)
                .ok_or(InternalError::MissingReturnType { span: span.into() })?;
            self.tmp_result = Some(self.make_hidden(":tmpResult", ty));
        }
        let sym = self.tmp_result.ok_or(InternalError::MissingReturnType { span: span.into() })?;
        Ok(self.access_of(sym, span))
    }

    fn unroll_finally_access(&mut self, span: Span) -> Node {
        if self.unroll_finally.is_none() {
            let ty = self.g.sys_type(TyKind::Bool);
            self.unroll_finally = Some(self.make_hidden(":unrollFinally", ty));
        }
        match self.unroll_finally {
            Some(s) => self.access_of(s, span),
            None => Node::empty(span),
        }
    }

    fn unroll_until_access(&mut self, span: Span) -> Node {
        if self.unroll_until.is_none() {
            let ty = self.g.sys_type(TyKind::Int);
            self.unroll_until = Some(self.make_hidden(":unrollUntil", ty));
        }
        match self.unroll_until {
            Some(s) => self.access_of(s, span),
            None => Node::empty(span),
        }
    }

    fn after_unroll_access(&mut self, span: Span) -> Node {
        if self.after_unroll.is_none() {
            let ty = self.g.sys_type(TyKind::Int);
            self.after_unroll = Some(self.make_hidden(":afterUnroll", ty));
        }
        match self.after_unroll {
            Some(s) => self.access_of(s, span),
            None => Node::empty(span),
        }
    }

    fn cur_exc_access(&mut self, span: Span) -> Node {
        if self.cur_exc.is_none() {
            let ty = self.g.sys_type(TyKind::Exception);
            self.cur_exc = Some(self.make_hidden(":curExc", ty));
        }
        match self.cur_exc {
            Some(s) => self.access_of(s, span),
            None => Node::empty(span),
        }
    }

    fn nullify_cur_exc(&mut self, span: Span) -> Node {
        let ce = self.cur_exc_access(span);
        Node::asgn(ce, Node::nil_lit(span))
    }

    fn result_access(&mut self, span: Span) -> Node {
        let sym = self.g.closure_iter_result(self.idgen, self.fn_sym);
        self.access_of(sym, span)
    }

    // ------------------------------------------------------------------
    // Small node builders
    // ------------------------------------------------------------------

    pub(crate) fn bool_lit(&self, value: bool, span: Span) -> Node {
        Node::int_lit(value as i64, span).with_ty(self.g.sys_type(TyKind::Bool))
    }

    fn int_node(&self, value: i64, span: Span) -> Node {
        Node::int_lit(value, span).with_ty(self.g.sys_type(TyKind::Int))
    }

    fn state_int(&self, value: i64, span: Span) -> Node {
        Node::int_lit(value, span).with_ty(self.g.closure_iter_state_type(self.fn_sym))
    }

    pub(crate) fn magic_call(
        &mut self,
        magic: Magic,
        args: Vec<Node>,
        ty: TyKind,
        span: Span,
    ) -> Node {
        let sym = self.g.sys_magic(self.idgen, magic);
        Node::call(Node::sym(sym, span), args, span).with_ty(self.g.sys_type(ty))
    }

    fn get_current_exception(&mut self, span: Span) -> Node {
        let ty = self.g.sys_type(TyKind::Exception);
        self.g
            .call_codegen_proc(self.idgen, "getCurrentException", vec![], span, Some(ty))
    }

    fn new_goto(&self, target: i64, span: Span) -> Node {
        Node::goto_state(Node::state_lit(target, span), span)
    }

    // ------------------------------------------------------------------
    // State bookkeeping
    // ------------------------------------------------------------------

    fn reserve_state(&mut self, span: Span) -> usize {
        let handler = self.cur_exc_handling;
        self.reserve_state_with(span, handler)
    }

    fn reserve_state_with(&mut self, span: Span, handler: ExcTarget) -> usize {
        let pos = self.states.len();
        self.states.push(StateRecord {
            body: Node::empty(span),
            exc_handler: handler,
            final_id: 0,
            exc_final: 0,
            empty: false,
        });
        trace!(state = pos, handler = ?handler, "reserve state");
        pos
    }

    fn fill_state(&mut self, pos: usize, body: Node) {
        self.states[pos].body = body;
    }

    // ------------------------------------------------------------------
    // Try/return/break pre-processing
    // ------------------------------------------------------------------

    /// Rewrite every `return` under the innermost finally into the
    /// finally-unroll protocol. Nested trys that will themselves be split
    /// are left alone; their own pass handles them against the right
    /// finally.
    fn transform_returns_in_try(&mut self, mut n: Node) -> Result<Node, InternalError> {
        match n.kind {
            NodeKind::Return => {
                if self.nearest_finally == 0 {
                    return Ok(n);
                }
                let span = n.span;
                let value = if n.kids.is_empty() {
                    Node::empty(span)
                } else {
                    n.take_kid(0)
                };
                let mut stmts = Vec::with_capacity(5);
                let uf = self.unroll_finally_access(span);
                let tru = self.bool_lit(true, span);
                stmts.push(Node::asgn(uf, tru));
                let uu = self.unroll_until_access(span);
                stmts.push(Node::asgn(uu, Node::state_lit(EXIT_STATE, span)));
                if !value.is_empty() {
                    let tr = self.tmp_result_access(span)?;
                    stmts.push(Node::asgn(tr, value));
                }
                stmts.push(self.nullify_cur_exc(span));
                stmts.push(self.new_goto(self.nearest_finally as i64, span));
                Ok(Node::stmt_list(stmts, span))
            }
            NodeKind::Try if has_control_flow(&n) => Ok(n),
            _ => {
                for i in 0..n.kids.len() {
                    let kid = n.take_kid(i);
                    n.kids[i] = self.transform_returns_in_try(kid)?;
                }
                Ok(n)
            }
        }
    }

    /// Build the body of an except state: nullify the current exception,
    /// then dispatch over the handler types.
    fn collect_except_state(
        &mut self,
        branches: Vec<Node>,
        span: Span,
    ) -> Result<Node, InternalError> {
        let nullify = self.nullify_cur_exc(span);
        let mut if_branches: Vec<Node> = Vec::new();
        let mut catch_all: Option<Node> = None;
        for mut b in branches {
            let body_idx = b.kids.len() - 1;
            let body = b.take_kid(body_idx).into_stmt_list();
            let n_types = body_idx;
            if n_types == 0 {
                catch_all = Some(body);
                break; // branches after a catch-all are unreachable
            }
            let first_ty = b.take_kid(0);
            let cur = self.get_current_exception(span);
            let mut cond = self.magic_call(Magic::Of, vec![cur, first_ty], TyKind::Bool, span);
            for i in 1..n_types {
                let t = b.take_kid(i);
                let cur = self.get_current_exception(span);
                let test = self.magic_call(Magic::Of, vec![cur, t], TyKind::Bool, span);
                cond = self.magic_call(Magic::Or, vec![cond, test], TyKind::Bool, span);
            }
            if_branches
                .push(Node::new(NodeKind::ElifBranch, span).with_kids(vec![cond, body]));
        }
        let dispatch = if if_branches.is_empty() {
            match catch_all {
                Some(body) => body,
                None => Node::stmt_list(vec![], span),
            }
        } else {
            let mut iff = Node::new(NodeKind::If, span).with_kids(if_branches);
            if let Some(body) = catch_all {
                iff.kids.push(Node::new(NodeKind::Else, span).with_kids(vec![body]));
            }
            iff
        };
        Ok(Node::stmt_list(vec![nullify, dispatch], span))
    }

    /// When not every exception class is matched, the unmatched path must
    /// keep unrolling: re-capture the exception and head for the finally.
    fn add_else_to_except(&mut self, body: &mut Node, span: Span) {
        if body.kind != NodeKind::StmtList || body.kids.len() < 2 {
            return;
        }
        let needs_else = {
            let dispatch = &body.kids[1];
            dispatch.kind == NodeKind::If
                && dispatch.kids.last().map(|k| k.kind) != Some(NodeKind::Else)
        };
        if !needs_else {
            return;
        }
        let uf = self.unroll_finally_access(span);
        let tru = self.bool_lit(true, span);
        let uu = self.unroll_until_access(span);
        let ce = self.cur_exc_access(span);
        let cur = self.get_current_exception(span);
        let branch = Node::stmt_list(
            vec![
                Node::asgn(uf, tru),
                Node::asgn(uu, Node::state_lit(EXIT_STATE, span)),
                Node::asgn(ce, cur),
                self.new_goto(self.nearest_finally as i64, span),
            ],
            span,
        );
        body.kids[1]
            .kids
            .push(Node::new(NodeKind::Else, span).with_kids(vec![branch]));
    }

    /// The protocol appended after a user finally body. Resumes a partial
    /// unroll when this finally is the last one before the break target;
    /// otherwise finishes a pending return (bubbling through any enclosing
    /// finally first) or re-raises the pending exception.
    fn new_end_finally_node(
        &mut self,
        enclosing: usize,
        span: Span,
    ) -> Result<Node, InternalError> {
        let uu = self.unroll_until_access(span);
        let cmp = self.magic_call(
            Magic::EqI,
            vec![uu, Node::state_lit(enclosing as i64, span)],
            TyKind::Bool,
            span,
        );
        let uf = self.unroll_finally_access(span);
        let fls = self.bool_lit(false, span);
        let uu2 = self.unroll_until_access(span);
        let au = self.after_unroll_access(span);
        let resume = Node::stmt_list(
            vec![
                Node::asgn(uf, fls),
                Node::asgn(uu2, Node::state_lit(EXIT_STATE, span)),
                Node::goto_state(au, span),
            ],
            span,
        );
        let unroll_check = Node::new(NodeKind::If, span)
            .with_kids(vec![Node::new(NodeKind::ElifBranch, span).with_kids(vec![cmp, resume])]);

        let ce = self.cur_exc_access(span);
        let is_nil = self.magic_call(
            Magic::EqRef,
            vec![ce, Node::nil_lit(span)],
            TyKind::Bool,
            span,
        );
        let finish = if enclosing == 0 {
            let value = if self.g.has_return_type(self.fn_sym) {
                self.tmp_result_access(span)?
            } else {
                Node::empty(span)
            };
            Node::new(NodeKind::Return, span).with_kids(vec![value])
        } else {
            self.new_goto(enclosing as i64, span)
        };
        let setup =
            self.g
                .call_codegen_proc(self.idgen, "closureIterSetupExc", vec![Node::nil_lit(span)], span, None);
        let ce2 = self.cur_exc_access(span);
        let reraise = Node::new(NodeKind::Raise, span).with_kids(vec![ce2]);
        let finish_if = Node::new(NodeKind::If, span).with_kids(vec![
            Node::new(NodeKind::ElifBranch, span)
                .with_kids(vec![is_nil, Node::stmt_list(vec![finish], span)]),
            Node::new(NodeKind::Else, span)
                .with_kids(vec![Node::stmt_list(vec![setup, reraise], span)]),
        ]);

        let body = Node::stmt_list(vec![unroll_check, finish_if], span);
        let uf2 = self.unroll_finally_access(span);
        Ok(Node::new(NodeKind::If, span)
            .with_kids(vec![Node::new(NodeKind::ElifBranch, span).with_kids(vec![uf2, body])]))
    }

    // ------------------------------------------------------------------
    // State splitter
    // ------------------------------------------------------------------

    /// Split `n` into states. `out` is the state position (or the exit
    /// state) where control continues when this fragment falls through.
    fn transform_body(&mut self, mut n: Node, out: i64) -> Result<Node, InternalError> {
        match n.kind {
            NodeKind::StmtList | NodeKind::StmtListExpr => {
                n.kind = NodeKind::StmtList;
                let needs_goto = match n.kids.last() {
                    Some(k) => k.kind != NodeKind::GotoState,
                    None => true,
                };
                if needs_goto {
                    let span = n.span;
                    n.kids.push(self.new_goto(out, span));
                }
                let mut i = 0;
                while i < n.kids.len() {
                    if has_control_flow(&n.kids[i]) {
                        // Everything after the split point becomes its own
                        // state; the split child continues there.
                        let suffix: Vec<Node> = n.kids.drain(i + 1..).collect();
                        let span = match suffix.first() {
                            Some(s) => s.span,
                            None => n.span,
                        };
                        let suffix_pos = self.reserve_state(span);
                        let child = n.take_kid(i);
                        n.kids[i] = self.transform_body(child, suffix_pos as i64)?;
                        let suffix_body = Node::stmt_list(suffix, span);
                        let suffix_body = self.transform_body(suffix_body, out)?;
                        self.fill_state(suffix_pos, suffix_body);
                        break;
                    }
                    i += 1;
                }
                Ok(n)
            }

            NodeKind::Yield => {
                let span = n.span;
                let goto = self.new_goto(out, span);
                Ok(Node::stmt_list(vec![n, goto], span))
            }

            NodeKind::If => {
                for i in 0..n.kids.len() {
                    let mut branch = n.take_kid(i);
                    match branch.kind {
                        NodeKind::ElifBranch => {
                            let body = branch.take_kid(1).into_stmt_list();
                            branch.kids[1] = self.transform_body(body, out)?;
                        }
                        NodeKind::Else => {
                            let body = branch.take_kid(0).into_stmt_list();
                            branch.kids[0] = self.transform_body(body, out)?;
                        }
                        _ => {
                            return Err(self.invariant("malformed if branch", branch.span));
                        }
                    }
                    n.kids[i] = branch;
                }
                if n.kids.last().map(|k| k.kind) != Some(NodeKind::Else) {
                    let span = n.span;
                    let goto = self.new_goto(out, span);
                    n.kids.push(
                        Node::new(NodeKind::Else, span)
                            .with_kids(vec![Node::stmt_list(vec![goto], span)]),
                    );
                }
                Ok(n)
            }

            NodeKind::Case => {
                for i in 1..n.kids.len() {
                    let mut branch = n.take_kid(i);
                    match branch.kind {
                        NodeKind::OfBranch => {
                            let body_idx = branch.kids.len() - 1;
                            let body = branch.take_kid(body_idx).into_stmt_list();
                            branch.kids[body_idx] = self.transform_body(body, out)?;
                        }
                        NodeKind::Else => {
                            let body = branch.take_kid(0).into_stmt_list();
                            branch.kids[0] = self.transform_body(body, out)?;
                        }
                        _ => {
                            return Err(self.invariant("malformed case branch", branch.span));
                        }
                    }
                    n.kids[i] = branch;
                }
                if n.kids.last().map(|k| k.kind) != Some(NodeKind::Else) {
                    let span = n.span;
                    let goto = self.new_goto(out, span);
                    n.kids.push(
                        Node::new(NodeKind::Else, span)
                            .with_kids(vec![Node::stmt_list(vec![goto], span)]),
                    );
                }
                Ok(n)
            }

            NodeKind::While => {
                // while cond: body
                //
                // -> BEGIN:
                //      if cond: body; goto BEGIN
                //      else: goto OUT
                let span = n.span;
                let begin_pos = self.reserve_state(span);
                let cond = n.take_kid(0);
                let body = n.take_kid(1).into_stmt_list();
                self.scopes.push(BreakScope {
                    label: None,
                    out,
                    nearest_finally: self.nearest_finally,
                    is_loop: true,
                });
                let body = self.transform_body(body, begin_pos as i64)?;
                self.scopes.pop();
                let goto_out = self.new_goto(out, span);
                let if_node = Node::new(NodeKind::If, span).with_kids(vec![
                    Node::new(NodeKind::ElifBranch, span).with_kids(vec![cond, body]),
                    Node::new(NodeKind::Else, span)
                        .with_kids(vec![Node::stmt_list(vec![goto_out], span)]),
                ]);
                self.fill_state(begin_pos, Node::stmt_list(vec![if_node], span));
                Ok(self.new_goto(begin_pos as i64, span))
            }

            NodeKind::Block => {
                let label = match n.kids.first().map(|k| k.kind) {
                    Some(NodeKind::Sym(s)) => Some(s),
                    _ => None,
                };
                self.scopes.push(BreakScope {
                    label,
                    out,
                    nearest_finally: self.nearest_finally,
                    is_loop: false,
                });
                let body = n.take_kid(1).into_stmt_list();
                n.kids[1] = self.transform_body(body, out)?;
                self.scopes.pop();
                Ok(n)
            }

            NodeKind::Break => {
                let span = n.span;
                let label = match n.kids.first().map(|k| k.kind) {
                    Some(NodeKind::Sym(s)) => Some(s),
                    _ => None,
                };
                let scope = self
                    .scopes
                    .iter()
                    .rev()
                    .find(|sc| match label {
                        Some(l) => sc.label == Some(l),
                        None => sc.is_loop,
                    })
                    .copied()
                    .ok_or_else(|| self.invariant("break target not in scope", span))?;
                if scope.nearest_finally == self.nearest_finally {
                    Ok(self.new_goto(scope.out, span))
                } else if self.nearest_finally == 0 {
                    Err(self.invariant("break target inside a finally the break is not in", span))
                } else {
                    // Partial unroll: run every finally between here and
                    // the block, then resume after the block.
                    let uf = self.unroll_finally_access(span);
                    let tru = self.bool_lit(true, span);
                    let uu = self.unroll_until_access(span);
                    let au = self.after_unroll_access(span);
                    Ok(Node::stmt_list(
                        vec![
                            Node::asgn(uf, tru),
                            Node::asgn(uu, Node::state_lit(scope.nearest_finally as i64, span)),
                            Node::asgn(au, Node::state_lit(scope.out, span)),
                            self.new_goto(self.nearest_finally as i64, span),
                        ],
                        span,
                    ))
                }
            }

            NodeKind::Try => self.transform_try(n, out),

            NodeKind::For | NodeKind::Continue | NodeKind::GotoState | NodeKind::State(_)
            | NodeKind::StateLit(_) => Err(InternalError::UnsupportedConstruct {
                construct: n.kind_name(),
                span: n.span.into(),
            }),

            _ => Err(self.invariant(
                format!("cannot split control flow inside {}", n.kind_name()),
                n.span,
            )),
        }
    }

    fn transform_try(&mut self, mut n: Node, out: i64) -> Result<Node, InternalError> {
        self.has_exceptions = true;
        let span = n.span;

        let mut kids = std::mem::take(&mut n.kids);
        if kids.is_empty() {
            return Err(self.invariant("try without a body", span));
        }
        let body = kids.remove(0).into_stmt_list();
        let mut except_branches = Vec::new();
        let mut finally_body = None;
        for mut k in kids {
            match k.kind {
                NodeKind::ExceptBranch => except_branches.push(k),
                NodeKind::Finally => finally_body = Some(k.take_kid(0)),
                _ => return Err(self.invariant("malformed try", k.span)),
            }
        }
        let has_except = !except_branches.is_empty();

        let enclosing_finally = self.nearest_finally;
        let outer_exc = self.cur_exc_handling;

        let try_pos = self.states.len();
        let except_pos = try_pos + 1;
        let finally_pos = try_pos + 1 + has_except as usize;

        let try_handler = if has_except {
            ExcTarget::Except(except_pos)
        } else {
            ExcTarget::Finally(finally_pos)
        };
        self.reserve_state_with(span, try_handler);
        if has_except {
            self.reserve_state_with(span, ExcTarget::Finally(finally_pos));
        }
        self.reserve_state_with(span, outer_exc);

        // Every try gets a finally state: the unroll protocol needs a
        // place to run even when the user wrote none.
        let mut fin = match finally_body {
            Some(f) => f.into_stmt_list(),
            None => Node::stmt_list(vec![], span),
        };
        fin = self.transform_returns_in_try(fin)?;
        let end_fin = self.new_end_finally_node(enclosing_finally, span)?;
        fin.kids.push(end_fin);

        self.nearest_finally = finally_pos;
        self.cur_exc_handling = try_handler;
        let body = self.transform_returns_in_try(body)?;
        let body = self.transform_body(body, finally_pos as i64)?;
        self.fill_state(try_pos, body);

        if has_except {
            self.cur_exc_handling = ExcTarget::Finally(finally_pos);
            let exc_body = self.collect_except_state(except_branches, span)?;
            let mut exc_body = self.transform_returns_in_try(exc_body)?;
            self.add_else_to_except(&mut exc_body, span);
            let exc_body = self.transform_body(exc_body, finally_pos as i64)?;
            self.fill_state(except_pos, exc_body);
        }

        self.cur_exc_handling = outer_exc;
        self.nearest_finally = enclosing_finally;

        let fin = self.transform_body(fin, out)?;
        self.fill_state(finally_pos, fin);

        Ok(self.new_goto(try_pos as i64, span))
    }

    // ------------------------------------------------------------------
    // Empty-state folding
    // ------------------------------------------------------------------

    fn chase(&self, start: usize) -> Result<ChaseResult, InternalError> {
        let mut cur = start;
        let mut steps = 0;
        loop {
            if !self.states[cur].empty {
                return Ok(ChaseResult::State(cur));
            }
            let body = skip_stmt_list(&self.states[cur].body);
            let target = match body.kids.first().map(|k| k.kind) {
                Some(NodeKind::StateLit(v)) => v,
                _ => {
                    return Err(InternalError::InvariantViolation {
                        message: "empty state with a computed jump".into(),
                        span: body.span.into(),
                    });
                }
            };
            if target < 0 {
                return Ok(ChaseResult::Exit);
            }
            cur = target as usize;
            steps += 1;
            if steps > self.states.len() {
                return Err(InternalError::InvariantViolation {
                    message: "cycle through empty states".into(),
                    span: body.span.into(),
                });
            }
        }
    }

    /// Remove states whose body is a bare forwarding jump, renumber the
    /// survivors contiguously, and redirect every state reference.
    fn delete_empty_states(&mut self) -> Result<(), InternalError> {
        for s in self.states.iter_mut() {
            let body = skip_stmt_list(&s.body);
            s.empty = body.kind == NodeKind::GotoState
                && matches!(body.kids.first().map(|k| k.kind), Some(NodeKind::StateLit(_)));
        }
        // The entry state may only be folded when the machine still starts
        // at the right place: its chain must land on the state that
        // becomes state 0.
        if self.states[0].empty {
            let target = self.chase(0)?;
            let first_non_empty = self.states.iter().position(|s| !s.empty);
            let foldable = match (target, first_non_empty) {
                (ChaseResult::State(p), Some(f)) => p == f,
                _ => false,
            };
            if !foldable {
                self.states[0].empty = false;
            }
        }

        let mut next = 0i64;
        for s in self.states.iter_mut() {
            if !s.empty {
                s.final_id = next;
                next += 1;
            }
        }

        let mut resolved = Vec::with_capacity(self.states.len());
        for i in 0..self.states.len() {
            let id = match self.chase(i)? {
                ChaseResult::Exit => EXIT_STATE,
                ChaseResult::State(p) => self.states[p].final_id,
            };
            resolved.push(id);
        }

        for i in 0..self.states.len() {
            let entry = match self.states[i].exc_handler {
                ExcTarget::None => 0,
                ExcTarget::Except(p) => {
                    let f = resolved[p];
                    if f < 0 {
                        return Err(InternalError::InvariantViolation {
                            message: "except handler folded away".into(),
                            span: self.body_span.into(),
                        });
                    }
                    -f
                }
                ExcTarget::Finally(p) => {
                    let f = resolved[p];
                    if f < 0 {
                        return Err(InternalError::InvariantViolation {
                            message: "finally handler folded away".into(),
                            span: self.body_span.into(),
                        });
                    }
                    f
                }
            };
            self.states[i].exc_final = entry;
        }

        for s in self.states.iter_mut() {
            if !s.empty {
                rewrite_state_lits(&mut s.body, &resolved);
            }
        }
        let before = self.states.len();
        self.states.retain(|s| !s.empty);
        trace!(folded = before - self.states.len(), kept = self.states.len(), "empty states");
        Ok(())
    }

    // ------------------------------------------------------------------
    // State-assignment lowering and wrapping
    // ------------------------------------------------------------------

    fn concat_states(&mut self) -> Node {
        let span = self.body_span;
        let mut kids = Vec::with_capacity(self.states.len());
        for s in self.states.iter_mut() {
            let body = std::mem::replace(&mut s.body, Node::empty(span));
            let body_span = body.span;
            kids.push(Node::new(NodeKind::State(s.final_id), body_span).with_kids(vec![body]));
        }
        Node::stmt_list(kids, span)
    }

    /// Replace the abstract markers: `yield; goto k` becomes a suspension,
    /// bare gotos become state assignment plus loop break, returns become
    /// terminal.
    fn transform_state_assignments(&mut self, mut n: Node) -> Result<Node, InternalError> {
        match n.kind {
            NodeKind::StmtList | NodeKind::StmtListExpr => {
                let kids = std::mem::take(&mut n.kids);
                let mut out = Vec::with_capacity(kids.len());
                let mut iter = kids.into_iter();
                while let Some(kid) = iter.next() {
                    if kid.kind == NodeKind::Yield {
                        let span = kid.span;
                        let goto = iter.next().ok_or_else(|| {
                            self.invariant("yield without a following state jump", span)
                        })?;
                        let target = match (goto.kind, goto.kids.first().map(|k| k.kind)) {
                            (NodeKind::GotoState, Some(NodeKind::StateLit(v))) => v,
                            _ => {
                                return Err(self
                                    .invariant("yield without a direct state jump", span));
                            }
                        };
                        let sa = self.state_access(span);
                        out.push(Node::asgn(sa, self.state_int(target, span)));
                        let mut y = kid;
                        let value = if y.kids.is_empty() {
                            Node::empty(span)
                        } else {
                            y.take_kid(0)
                        };
                        if !value.is_empty() {
                            let res = self.result_access(span);
                            out.push(Node::asgn(res, value));
                        }
                        out.push(
                            Node::new(NodeKind::Return, span).with_kids(vec![Node::empty(span)]),
                        );
                    } else {
                        out.push(self.transform_state_assignments(kid)?);
                    }
                }
                n.kids = out;
                Ok(n)
            }

            NodeKind::GotoState => {
                let span = n.span;
                let target = n.take_kid(0);
                let rhs = match target.kind {
                    NodeKind::StateLit(v) => self.state_int(v, span),
                    _ => target,
                };
                let sa = self.state_access(span);
                let brk = Node::new(NodeKind::Break, span)
                    .with_kids(vec![Node::sym(self.state_loop_label, span)]);
                Ok(Node::stmt_list(vec![Node::asgn(sa, rhs), brk], span))
            }

            NodeKind::Return => {
                let span = n.span;
                let value = if n.kids.is_empty() {
                    Node::empty(span)
                } else {
                    n.take_kid(0)
                };
                let sa = self.state_access(span);
                let mut out = vec![Node::asgn(sa, self.state_int(EXIT_STATE, span))];
                if !value.is_empty() {
                    let res = self.result_access(span);
                    out.push(Node::asgn(res, value));
                }
                out.push(Node::new(NodeKind::Return, span).with_kids(vec![Node::empty(span)]));
                Ok(Node::stmt_list(out, span))
            }

            NodeKind::Yield => {
                Err(self.invariant("yield outside a statement sequence", n.span))
            }

            NodeKind::StateLit(v) => Ok(self.int_node(v, n.span)),

            _ => {
                for i in 0..n.kids.len() {
                    let kid = n.take_kid(i);
                    n.kids[i] = self.transform_state_assignments(kid)?;
                }
                Ok(n)
            }
        }
    }

    fn build_exception_table(&mut self, span: Span) -> Node {
        let int16 = self.g.sys_type(TyKind::Int16);
        let entries: Vec<Node> = self
            .states
            .iter()
            // Entries are 16-bit; machines beyond 32767 states wrap silently.
            .map(|s| Node::int_lit((s.exc_final as i16) as i64, span).with_ty(int16))
            .collect();
        let len = entries.len() as u32;
        let arr_ty = self.g.types.add(Type::Array { elem: int16, len });
        debug!(entries = len, "exception table");
        Node::new(NodeKind::ArrayConstr, span)
            .with_kids(entries)
            .with_ty(arr_ty)
    }

    /// The catch-all wrapper around the state loop body: route the
    /// exception through the table, then re-enter the loop at the handler
    /// state.
    fn new_catch_body(&mut self, span: Span) -> Node {
        let table = self.build_exception_table(span);
        let int16 = self.g.closure_iter_state_type(self.fn_sym);
        let sa = self.state_access(span);
        let lookup = Node::new(NodeKind::BracketExpr, span)
            .with_kids(vec![table, sa])
            .with_ty(int16);
        let sa2 = self.state_access(span);
        let route = Node::asgn(sa2, lookup);

        let sa3 = self.state_access(span);
        let unhandled = self.magic_call(
            Magic::EqI,
            vec![sa3, self.int_node(0, span)],
            TyKind::Bool,
            span,
        );
        let reraise = Node::new(NodeKind::Raise, span).with_kids(vec![Node::empty(span)]);
        let reraise_if = Node::new(NodeKind::If, span).with_kids(vec![
            Node::new(NodeKind::ElifBranch, span)
                .with_kids(vec![unhandled, Node::stmt_list(vec![reraise], span)]),
        ]);

        let sa4 = self.state_access(span);
        let is_finally = self.magic_call(
            Magic::LtI,
            vec![self.int_node(0, span), sa4],
            TyKind::Bool,
            span,
        );
        let uf = self.unroll_finally_access(span);
        let mark_unroll = Node::asgn(uf, is_finally);
        let uu = self.unroll_until_access(span);
        let clear_until = Node::asgn(uu, self.int_node(-1, span));

        let sa5 = self.state_access(span);
        let negative = self.magic_call(
            Magic::LtI,
            vec![sa5, self.int_node(0, span)],
            TyKind::Bool,
            span,
        );
        let sa6 = self.state_access(span);
        let negated = self.magic_call(Magic::NegI, vec![sa6], TyKind::Int16, span);
        let sa7 = self.state_access(span);
        let flip = Node::new(NodeKind::If, span).with_kids(vec![
            Node::new(NodeKind::ElifBranch, span).with_kids(vec![
                negative,
                Node::stmt_list(vec![Node::asgn(sa7, negated)], span),
            ]),
        ]);

        let cur = self.get_current_exception(span);
        let ce = self.cur_exc_access(span);
        let capture = Node::asgn(ce, cur);

        Node::stmt_list(
            vec![route, reraise_if, mark_unroll, clear_until, flip, capture],
            span,
        )
    }

    fn wrap_into_try_except(&mut self, body: Node) -> Node {
        let span = self.body_span;
        let ce = self.cur_exc_access(span);
        let setup =
            self.g
                .call_codegen_proc(self.idgen, "closureIterSetupExc", vec![ce], span, None);
        let try_body = Node::stmt_list(vec![setup, body], span);
        let catch = self.new_catch_body(span);
        let except = Node::new(NodeKind::ExceptBranch, span).with_kids(vec![catch]);
        Node::new(NodeKind::Try, span).with_kids(vec![try_body, except])
    }

    fn wrap_into_state_loop(&mut self, states: Node) -> Node {
        let span = self.body_span;
        let sa = self.state_access(span);
        let mut dispatch = Node::goto_state(sa, span);
        dispatch.ty = Some(self.g.closure_iter_state_type(self.fn_sym));

        let mut block_kids = vec![dispatch];
        if let Some(sv) = self.state_var {
            // Not lifted yet: declare the hidden locals where the lifter
            // will find them, :state first.
            let mut defs = Vec::with_capacity(1 + self.local_vars.len());
            for &sym in std::iter::once(&sv).chain(self.local_vars.iter()) {
                defs.push(Node::new(NodeKind::IdentDefs, span).with_kids(vec![
                    Node::sym(sym, span),
                    Node::empty(span),
                ]));
            }
            block_kids.push(Node::new(NodeKind::VarSection, span).with_kids(defs));
        }
        block_kids.push(states);

        let mut block_body = Node::stmt_list(block_kids, span);
        if self.has_exceptions {
            block_body = self.wrap_into_try_except(block_body);
        }
        let block = Node::new(NodeKind::Block, span)
            .with_kids(vec![Node::sym(self.state_loop_label, span), block_body]);
        let tru = self.bool_lit(true, span);
        Node::new(NodeKind::While, span)
            .with_kids(vec![tru, Node::stmt_list(vec![block], span)])
    }

    pub(crate) fn lower_stmt_list_exprs(&mut self, n: Node) -> Result<Node, InternalError> {
        self.lower(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::render_body;

    fn setup() -> (ModuleGraph, IdGen) {
        (ModuleGraph::new(), IdGen::new())
    }

    fn sp() -> Span {
        Span::default()
    }

    #[test]
    fn no_yield_body_is_a_single_state() {
        let (mut g, mut idgen) = setup();
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
        let out = transform_closure_iterator(&mut g, &mut idgen, f, body).unwrap();
        let states = collect_states(&out);
        assert_eq!(states, vec![0]);
        let rendered = render_body(&g, &out);
        assert!(rendered.contains("state 0:"), "{rendered}");
        assert!(rendered.contains(":state = -1"), "{rendered}");
    }

    #[test]
    fn goto_targets_resolve_to_existing_states() {
        let (mut g, mut idgen) = setup();
        let int = g.sys_type(TyKind::Int);
        let f = g.declare_routine(&mut idgen, "items", Some(int));
        let body = Node::stmt_list(
            vec![
                Node::new(NodeKind::Yield, sp()).with_kids(vec![Node::int_lit(1, sp()).with_ty(int)]),
                Node::new(NodeKind::Yield, sp()).with_kids(vec![Node::int_lit(2, sp()).with_ty(int)]),
            ],
            sp(),
        );
        let out = transform_closure_iterator(&mut g, &mut idgen, f, body).unwrap();
        let states = collect_states(&out);
        assert_eq!(states, vec![0, 1]);
        let mut targets = Vec::new();
        collect_state_assignments(&g, &out, &mut targets);
        for t in targets {
            assert!(t == -1 || (0..states.len() as i64).contains(&t), "target {t}");
        }
    }

    #[test]
    fn stray_goto_in_input_is_rejected() {
        let (mut g, mut idgen) = setup();
        let f = g.declare_routine(&mut idgen, "items", None);
        let body = Node::stmt_list(
            vec![Node::goto_state(Node::state_lit(3, sp()), sp())],
            sp(),
        );
        let err = transform_closure_iterator(&mut g, &mut idgen, f, body).unwrap_err();
        assert!(matches!(err, InternalError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn for_loop_in_input_is_rejected() {
        let (mut g, mut idgen) = setup();
        let int = g.sys_type(TyKind::Int);
        let f = g.declare_routine(&mut idgen, "items", Some(int));
        let body = Node::stmt_list(
            vec![Node::new(NodeKind::For, sp()).with_kids(vec![
                Node::empty(sp()),
                Node::empty(sp()),
                Node::stmt_list(
                    vec![Node::new(NodeKind::Yield, sp())
                        .with_kids(vec![Node::int_lit(1, sp()).with_ty(int)])],
                    sp(),
                ),
            ])],
            sp(),
        );
        let err = transform_closure_iterator(&mut g, &mut idgen, f, body).unwrap_err();
        assert!(matches!(err, InternalError::UnsupportedConstruct { .. }));
    }

    fn collect_states(n: &Node) -> Vec<i64> {
        let mut out = Vec::new();
        fn walk(n: &Node, out: &mut Vec<i64>) {
            if let NodeKind::State(id) = n.kind {
                out.push(id);
            }
            for kid in &n.kids {
                walk(kid, out);
            }
        }
        walk(n, &mut out);
        out.sort_unstable();
        out
    }

    /// Collect integer values assigned to the hidden state variable.
    fn collect_state_assignments(g: &ModuleGraph, n: &Node, out: &mut Vec<i64>) {
        if n.kind == NodeKind::Asgn
            && let Some(sym) = g.sym_of(&n.kids[0])
            && g.interner.resolve(sym.name) == ":state"
            && let NodeKind::IntLit(v) = n.kids[1].kind
        {
            out.push(v);
        }
        for kid in &n.kids {
            collect_state_assignments(g, kid, out);
        }
    }
}
