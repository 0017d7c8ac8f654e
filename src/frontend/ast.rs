// src/frontend/ast.rs
//! The mid-end AST.
//!
//! By the time a routine body reaches the mid-end transforms, names are
//! resolved to symbols and types are attached where later passes need them.
//! The tree is deliberately uniform: every node is a `kind` tag plus a
//! `kids` vector, so structural passes can fall back to "visit all
//! children" and only special-case the kinds they rewrite.
//!
//! Child layout per kind is documented on [`NodeKind`]. Two kinds are
//! introduced by the closure-iterator lowering and understood by the
//! backend: [`NodeKind::State`] and [`NodeKind::GotoState`].
//! [`NodeKind::StateLit`] is internal to that pass and never survives it.

use crate::frontend::Span;
use crate::sema::sym::SymId;
use crate::sema::types::TypeId;

/// A node of the mid-end tree. `ty` is present on value-producing
/// expressions; statements leave it `None`.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub ty: Option<TypeId>,
    pub kids: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Empty,
    /// Integer literal. With a `Bool` type this doubles as `false`/`true`.
    IntLit(i64),
    NilLit,
    /// Reference to a resolved symbol.
    Sym(SymId),

    /// Statement sequence.
    StmtList,
    /// Statement sequence whose last child is the value of the whole node.
    StmtListExpr,
    /// `[lhs, rhs]`
    Asgn,
    /// `[callee, args..]`
    Call,
    /// `[ElifBranch.., Else?]`
    If,
    /// `[cond, body]`
    ElifBranch,
    /// `[body]`
    Else,
    /// `[selector, OfBranch.., Else?]`
    Case,
    /// `[lit.., body]`
    OfBranch,
    /// `[cond, body]`
    While,
    /// `[label (Sym | Empty), body]`
    Block,
    /// `[label (Sym | Empty)]`
    Break,
    /// `[value | Empty]`
    Return,
    /// `[value | Empty]`
    Yield,
    /// `[value | Empty]` — empty value re-raises.
    Raise,
    /// `[body, ExceptBranch.., Finally?]`
    Try,
    /// `[exception type Sym.., body]` — no types means catch-all.
    ExceptBranch,
    /// `[body]`
    Finally,
    /// `[IdentDefs..]`
    VarSection,
    /// `[sym, init | Empty]` — the binding's type lives on the symbol.
    IdentDefs,
    /// `[elem..]`
    TupleConstr,
    /// `[type Sym, ExprColonExpr..]`
    ObjConstr,
    /// `[elem..]`
    ArrayConstr,
    /// `[field, value]`
    ExprColonExpr,
    /// `[expr]` — conversion to `ty`.
    Conv,
    /// `[expr]` — bit cast to `ty`.
    Cast,
    /// `[expr]`
    Deref,
    /// `[obj, Sym(field)]`
    FieldAccess,
    /// `[obj, index]`
    BracketExpr,
    /// `[expr, lo, hi]` — range-checked conversion.
    RangeCheck,
    /// `[pat, iterable, body]` — must be eliminated before the mid-end.
    For,
    /// Must be eliminated before the mid-end.
    Continue,

    /// A labeled basic block of the synthesized state machine: `[body]`.
    /// The payload is the final 0-based state index.
    State(i64),
    /// `[target]` — jump to a state. The target is a `StateLit` (direct
    /// jump, resolved by the lowering) or an arbitrary expression (the
    /// computed dispatch at the top of the state loop).
    GotoState,
    /// A state id in value position. Internal to the closure-iterator
    /// lowering: holds a position into its state list until renumbering,
    /// then the final index, and is lowered to `IntLit` before output.
    /// `-1` is the exit state.
    StateLit(i64),
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Node {
        Node {
            kind,
            span,
            ty: None,
            kids: Vec::new(),
        }
    }

    pub fn with_ty(mut self, ty: TypeId) -> Node {
        self.ty = Some(ty);
        self
    }

    pub fn with_kids(mut self, kids: Vec<Node>) -> Node {
        self.kids = kids;
        self
    }

    pub fn empty(span: Span) -> Node {
        Node::new(NodeKind::Empty, span)
    }

    pub fn int_lit(value: i64, span: Span) -> Node {
        Node::new(NodeKind::IntLit(value), span)
    }

    pub fn nil_lit(span: Span) -> Node {
        Node::new(NodeKind::NilLit, span)
    }

    pub fn sym(id: SymId, span: Span) -> Node {
        Node::new(NodeKind::Sym(id), span)
    }

    pub fn stmt_list(kids: Vec<Node>, span: Span) -> Node {
        Node::new(NodeKind::StmtList, span).with_kids(kids)
    }

    pub fn asgn(lhs: Node, rhs: Node) -> Node {
        let span = lhs.span;
        Node::new(NodeKind::Asgn, span).with_kids(vec![lhs, rhs])
    }

    pub fn call(callee: Node, args: Vec<Node>, span: Span) -> Node {
        let mut kids = Vec::with_capacity(args.len() + 1);
        kids.push(callee);
        kids.extend(args);
        Node::new(NodeKind::Call, span).with_kids(kids)
    }

    pub fn goto_state(target: Node, span: Span) -> Node {
        Node::new(NodeKind::GotoState, span).with_kids(vec![target])
    }

    pub fn state_lit(value: i64, span: Span) -> Node {
        Node::new(NodeKind::StateLit(value), span)
    }

    pub fn is_empty(&self) -> bool {
        self.kind == NodeKind::Empty
    }

    /// Wrap into a `StmtList` unless the node already is one.
    pub fn into_stmt_list(self) -> Node {
        if self.kind == NodeKind::StmtList {
            self
        } else {
            let span = self.span;
            Node::stmt_list(vec![self], span)
        }
    }

    /// Replace child `i` with `Empty`, returning the old child.
    pub fn take_kid(&mut self, i: usize) -> Node {
        let span = self.kids[i].span;
        std::mem::replace(&mut self.kids[i], Node::empty(span))
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Empty => "empty",
            NodeKind::IntLit(_) => "int literal",
            NodeKind::NilLit => "nil literal",
            NodeKind::Sym(_) => "symbol",
            NodeKind::StmtList => "statement list",
            NodeKind::StmtListExpr => "statement list expression",
            NodeKind::Asgn => "assignment",
            NodeKind::Call => "call",
            NodeKind::If => "if",
            NodeKind::ElifBranch => "elif branch",
            NodeKind::Else => "else",
            NodeKind::Case => "case",
            NodeKind::OfBranch => "of branch",
            NodeKind::While => "while",
            NodeKind::Block => "block",
            NodeKind::Break => "break",
            NodeKind::Return => "return",
            NodeKind::Yield => "yield",
            NodeKind::Raise => "raise",
            NodeKind::Try => "try",
            NodeKind::ExceptBranch => "except branch",
            NodeKind::Finally => "finally",
            NodeKind::VarSection => "var section",
            NodeKind::IdentDefs => "ident defs",
            NodeKind::TupleConstr => "tuple constructor",
            NodeKind::ObjConstr => "object constructor",
            NodeKind::ArrayConstr => "array constructor",
            NodeKind::ExprColonExpr => "colon expression",
            NodeKind::Conv => "conversion",
            NodeKind::Cast => "cast",
            NodeKind::Deref => "dereference",
            NodeKind::FieldAccess => "field access",
            NodeKind::BracketExpr => "bracket expression",
            NodeKind::RangeCheck => "range check",
            NodeKind::For => "for",
            NodeKind::Continue => "continue",
            NodeKind::State(_) => "state",
            NodeKind::GotoState => "goto state",
            NodeKind::StateLit(_) => "state literal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_stmt_list_wraps_once() {
        let n = Node::int_lit(1, Span::default());
        let wrapped = n.into_stmt_list();
        assert_eq!(wrapped.kind, NodeKind::StmtList);
        let again = wrapped.into_stmt_list();
        assert_eq!(again.kids.len(), 1);
    }

    #[test]
    fn take_kid_leaves_empty() {
        let mut list = Node::stmt_list(
            vec![Node::int_lit(1, Span::default())],
            Span::default(),
        );
        let taken = list.take_kid(0);
        assert_eq!(taken.kind, NodeKind::IntLit(1));
        assert!(list.kids[0].is_empty());
    }
}
