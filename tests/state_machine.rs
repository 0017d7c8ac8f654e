// tests/state_machine.rs
//! End-to-end tests for the closure-iterator lowering: drive the public
//! entry point on hand-built bodies and check the rendered machine plus
//! the structural invariants of the output.

use tarnc::fmt::render_body;
use tarnc::frontend::Span;
use tarnc::frontend::ast::{Node, NodeKind};
use tarnc::sema::{IdGen, Magic, ModuleGraph, SymId, SymKind, TyKind};
use tarnc::transforms::transform_closure_iterator;

fn sp() -> Span {
    Span::default()
}

fn yield_val(v: Node) -> Node {
    Node::new(NodeKind::Yield, sp()).with_kids(vec![v])
}

fn ret(v: Node) -> Node {
    Node::new(NodeKind::Return, sp()).with_kids(vec![v])
}

fn try_finally(body: Vec<Node>, fin: Vec<Node>) -> Node {
    Node::new(NodeKind::Try, sp()).with_kids(vec![
        Node::stmt_list(body, sp()),
        Node::new(NodeKind::Finally, sp()).with_kids(vec![Node::stmt_list(fin, sp())]),
    ])
}

/// All `State` ids in the output, sorted.
fn collect_states(n: &Node) -> Vec<i64> {
    fn walk(n: &Node, out: &mut Vec<i64>) {
        if let NodeKind::State(id) = n.kind {
            out.push(id);
        }
        for kid in &n.kids {
            walk(kid, out);
        }
    }
    let mut out = Vec::new();
    walk(n, &mut out);
    out.sort_unstable();
    out
}

/// Integer values assigned to the hidden state variable.
fn state_targets(g: &ModuleGraph, n: &Node) -> Vec<i64> {
    fn walk(g: &ModuleGraph, n: &Node, out: &mut Vec<i64>) {
        if n.kind == NodeKind::Asgn
            && let Some(sym) = g.sym_of(&n.kids[0])
            && g.interner.resolve(sym.name) == ":state"
            && let NodeKind::IntLit(v) = n.kids[1].kind
        {
            out.push(v);
        }
        for kid in &n.kids {
            walk(g, kid, out);
        }
    }
    let mut out = Vec::new();
    walk(g, n, &mut out);
    out
}

/// The exception table literal, when the machine carries one.
fn exception_table(n: &Node) -> Option<Vec<i64>> {
    if n.kind == NodeKind::ArrayConstr {
        let mut entries = Vec::new();
        for kid in &n.kids {
            match kid.kind {
                NodeKind::IntLit(v) => entries.push(v),
                _ => return None,
            }
        }
        return Some(entries);
    }
    for kid in &n.kids {
        if let Some(t) = exception_table(kid) {
            return Some(t);
        }
    }
    None
}

/// A state body must end in exactly one control transfer; branches count
/// through their tails.
fn ends_with_transfer(n: &Node) -> bool {
    match n.kind {
        NodeKind::Return | NodeKind::Raise | NodeKind::Break => true,
        NodeKind::StmtList | NodeKind::StmtListExpr => {
            n.kids.last().is_some_and(ends_with_transfer)
        }
        NodeKind::Block => ends_with_transfer(&n.kids[1]),
        NodeKind::If => n.kids.iter().all(|b| match b.kind {
            NodeKind::ElifBranch => ends_with_transfer(&b.kids[1]),
            NodeKind::Else => ends_with_transfer(&b.kids[0]),
            _ => false,
        }),
        NodeKind::Case => n.kids[1..].iter().all(|b| match b.kind {
            NodeKind::OfBranch => b.kids.last().is_some_and(ends_with_transfer),
            NodeKind::Else => ends_with_transfer(&b.kids[0]),
            _ => false,
        }),
        _ => false,
    }
}

fn check_invariants(g: &ModuleGraph, out: &Node) {
    let states = collect_states(out);
    let n = states.len() as i64;
    // contiguous, unique ids
    assert_eq!(states, (0..n).collect::<Vec<_>>(), "state ids not compact");
    // every direct jump addresses an existing state or the exit
    for t in state_targets(g, out) {
        assert!(t == -1 || (0..n).contains(&t), "jump to unknown state {t}");
    }
    // every state body ends in a control transfer
    fn walk_states(n: &Node, check: &dyn Fn(&Node)) {
        if let NodeKind::State(_) = n.kind {
            check(&n.kids[0]);
        }
        for kid in &n.kids {
            walk_states(kid, check);
        }
    }
    walk_states(out, &|body| {
        assert!(ends_with_transfer(body), "state body does not end in a transfer");
    });
    // the exception table, when present, is state-indexed and in range
    if let Some(table) = exception_table(out) {
        assert_eq!(table.len() as i64, n, "table length != state count");
        for e in table {
            assert!(e.unsigned_abs() < n as u64, "table entry {e} out of range");
        }
    }
}

struct Fx {
    g: ModuleGraph,
    idgen: IdGen,
    f: SymId,
}

fn fixture(with_return_type: bool) -> Fx {
    let mut g = ModuleGraph::new();
    let mut idgen = IdGen::new();
    let ret_ty = with_return_type.then(|| g.sys_type(TyKind::Int));
    let f = g.declare_routine(&mut idgen, "items", ret_ty);
    Fx { g, idgen, f }
}

fn int_lit(g: &ModuleGraph, v: i64) -> Node {
    Node::int_lit(v, sp()).with_ty(g.sys_type(TyKind::Int))
}

#[test]
fn simple_counter_becomes_two_states() {
    // while 0 < a: yield a; dec(a)
    let mut fx = fixture(true);
    let int = fx.g.sys_type(TyKind::Int);
    let bool_ty = fx.g.sys_type(TyKind::Bool);
    let a = fx.g.new_sym(&mut fx.idgen, "a", SymKind::Var, Some(int));
    let lt = fx.g.sys_magic(&mut fx.idgen, Magic::LtI);
    let dec = fx.g.new_sym(&mut fx.idgen, "dec", SymKind::Proc, None);

    let cond = Node::call(
        Node::sym(lt, sp()),
        vec![int_lit(&fx.g, 0), Node::sym(a, sp()).with_ty(int)],
        sp(),
    )
    .with_ty(bool_ty);
    let body = Node::stmt_list(
        vec![Node::new(NodeKind::While, sp()).with_kids(vec![
            cond,
            Node::stmt_list(
                vec![
                    yield_val(Node::sym(a, sp()).with_ty(int)),
                    Node::call(Node::sym(dec, sp()), vec![Node::sym(a, sp()).with_ty(int)], sp()),
                ],
                sp(),
            ),
        ])],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);
    assert_eq!(collect_states(&out), vec![0, 1]);

    let rendered = render_body(&fx.g, &out);
    assert!(rendered.contains("while true:"), "{rendered}");
    assert!(rendered.contains("gotoState :state"), "{rendered}");
    assert!(rendered.contains("if 0 < a:"), "{rendered}");
    assert!(rendered.contains(":result = a"), "{rendered}");
    assert!(rendered.contains("dec(a)"), "{rendered}");
    assert!(rendered.contains(":state = -1"), "{rendered}");
    // the loop head is state 0, the loop tail state 1, and the tail jumps
    // back to the head
    let head = rendered.find("state 0:").unwrap();
    let cond_pos = rendered.find("if 0 < a:").unwrap();
    let tail = rendered.find("state 1:").unwrap();
    let dec_pos = rendered.find("dec(a)").unwrap();
    assert!(head < cond_pos && cond_pos < tail && tail < dec_pos, "{rendered}");
    assert!(rendered[tail..].contains(":state = 0"), "{rendered}");
    // no exception machinery for a try-free iterator
    assert!(!rendered.contains("closureIterSetupExc"), "{rendered}");
}

#[test]
fn try_except_with_yield_builds_exception_table() {
    // try: yield 1; raise e
    // except: yield 2
    let mut fx = fixture(true);
    let exc_ty = fx.g.sys_type(TyKind::Exception);
    let e = fx.g.new_sym(&mut fx.idgen, "e", SymKind::Var, Some(exc_ty));

    let body = Node::stmt_list(
        vec![Node::new(NodeKind::Try, sp()).with_kids(vec![
            Node::stmt_list(
                vec![
                    yield_val(int_lit(&fx.g, 1)),
                    Node::new(NodeKind::Raise, sp())
                        .with_kids(vec![Node::sym(e, sp()).with_ty(exc_ty)]),
                ],
                sp(),
            ),
            Node::new(NodeKind::ExceptBranch, sp()).with_kids(vec![Node::stmt_list(
                vec![yield_val(int_lit(&fx.g, 2))],
                sp(),
            )]),
        ])],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);
    // try, except, finally, post-raise continuation
    assert_eq!(collect_states(&out), vec![0, 1, 2, 3]);

    let table = exception_table(&out).expect("exception table missing");
    // exception in the try region routes to the except state (negative),
    // exception in the except region unrolls to the finally (positive)
    assert_eq!(table, vec![-1, 2, 0, -1]);

    let rendered = render_body(&fx.g, &out);
    assert!(rendered.contains("closureIterSetupExc(:curExc)"), "{rendered}");
    assert!(rendered.contains("except:"), "{rendered}");
    assert!(rendered.contains(":curExc = nil"), "{rendered}");
    assert!(rendered.contains(":curExc = getCurrentException()"), "{rendered}");
    // the except-state body starts by marking the exception handled
    let except_state = rendered.find("state 1:").unwrap();
    let nullify = rendered[except_state..].find(":curExc = nil").unwrap();
    let except_yield = rendered[except_state..].find(":result = 2").unwrap();
    assert!(nullify < except_yield, "{rendered}");
}

#[test]
fn return_inside_try_finally_unrolls() {
    // try: return 7
    // finally: yield 0
    let mut fx = fixture(true);
    let body = Node::stmt_list(
        vec![try_finally(
            vec![ret(int_lit(&fx.g, 7))],
            vec![yield_val(int_lit(&fx.g, 0))],
        )],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);

    let rendered = render_body(&fx.g, &out);
    assert!(rendered.contains(":unrollFinally = true"), "{rendered}");
    assert!(rendered.contains(":tmpResult = 7"), "{rendered}");
    assert!(rendered.contains(":curExc = nil"), "{rendered}");
    // the end-of-finally sequence returns the materialized result once no
    // exception is pending
    assert!(rendered.contains("if :curExc == nil:"), "{rendered}");
    assert!(rendered.contains(":result = :tmpResult"), "{rendered}");
    // the pending return is finalized, not re-entered
    assert_eq!(exception_table(&out).map(|t| t.len()), Some(3));
}

#[test]
fn break_across_finally_uses_partial_unroll() {
    // block b:
    //   try: yield 1; break b
    //   finally: yield 2
    let mut fx = fixture(true);
    let b = fx.g.new_sym(&mut fx.idgen, "b", SymKind::Label, None);
    let body = Node::stmt_list(
        vec![Node::new(NodeKind::Block, sp()).with_kids(vec![
            Node::sym(b, sp()),
            Node::stmt_list(
                vec![try_finally(
                    vec![
                        yield_val(int_lit(&fx.g, 1)),
                        Node::new(NodeKind::Break, sp()).with_kids(vec![Node::sym(b, sp())]),
                    ],
                    vec![yield_val(int_lit(&fx.g, 2))],
                )],
                sp(),
            ),
        ])],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);

    let rendered = render_body(&fx.g, &out);
    // the break writes the whole partial-unroll protocol
    assert!(rendered.contains(":unrollFinally = true"), "{rendered}");
    assert!(rendered.contains(":unrollUntil = 0"), "{rendered}");
    assert!(rendered.contains(":afterUnroll = "), "{rendered}");
    // the end-of-finally sequence dispatches to the recorded resume state
    assert!(rendered.contains("if :unrollUntil == 0:"), "{rendered}");
    assert!(rendered.contains(":unrollFinally = false"), "{rendered}");
    assert!(rendered.contains(":state = :afterUnroll"), "{rendered}");
}

#[test]
fn yield_inside_expression_is_hoisted_before_splitting() {
    // if (yield 1; 2) == 2: yield 3
    let mut fx = fixture(true);
    let int = fx.g.sys_type(TyKind::Int);
    let bool_ty = fx.g.sys_type(TyKind::Bool);
    let eq = fx.g.sys_magic(&mut fx.idgen, Magic::EqI);

    let sle = Node::new(NodeKind::StmtListExpr, sp())
        .with_kids(vec![yield_val(int_lit(&fx.g, 1)), int_lit(&fx.g, 2)])
        .with_ty(int);
    let cond = Node::call(Node::sym(eq, sp()), vec![sle, int_lit(&fx.g, 2)], sp())
        .with_ty(bool_ty);
    let body = Node::stmt_list(
        vec![Node::new(NodeKind::If, sp()).with_kids(vec![
            Node::new(NodeKind::ElifBranch, sp()).with_kids(vec![
                cond,
                Node::stmt_list(vec![yield_val(int_lit(&fx.g, 3))], sp()),
            ]),
        ])],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);

    let rendered = render_body(&fx.g, &out);
    // first state yields 1, the temporary comparison happens after resume
    let s0 = rendered.find("state 0:").unwrap();
    let first_yield = rendered[s0..].find(":result = 1").unwrap();
    let cmp = rendered.find("== 2:").unwrap();
    assert!(s0 + first_yield < cmp, "{rendered}");
    assert!(rendered.contains(":tmp"), "{rendered}");
}

#[test]
fn forwarding_states_are_folded() {
    // block b: yield 1
    // yield 2
    let mut fx = fixture(true);
    let b = fx.g.new_sym(&mut fx.idgen, "b", SymKind::Label, None);
    let body = Node::stmt_list(
        vec![
            Node::new(NodeKind::Block, sp()).with_kids(vec![
                Node::sym(b, sp()),
                Node::stmt_list(vec![yield_val(int_lit(&fx.g, 1))], sp()),
            ]),
            yield_val(int_lit(&fx.g, 2)),
        ],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);
    // the block exit and the final fall-through forward somewhere else;
    // both chains collapse
    assert_eq!(collect_states(&out), vec![0, 1]);
    let targets = state_targets(&fx.g, &out);
    assert!(targets.contains(&1), "{targets:?}");
    assert!(targets.contains(&-1), "{targets:?}");
}

#[test]
fn no_yield_round_trip_is_one_state() {
    let mut fx = fixture(true);
    let int = fx.g.sys_type(TyKind::Int);
    let a = fx.g.new_sym(&mut fx.idgen, "a", SymKind::Var, Some(int));
    let body = Node::stmt_list(
        vec![Node::asgn(Node::sym(a, sp()).with_ty(int), int_lit(&fx.g, 3))],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);
    assert_eq!(collect_states(&out), vec![0]);
    let rendered = render_body(&fx.g, &out);
    assert!(rendered.contains("a = 3"), "{rendered}");
}

#[test]
fn typed_except_gets_an_unrolling_else() {
    // try: yield 1
    // except SomeError: yield 2
    let mut fx = fixture(true);
    let some_error = fx
        .g
        .new_sym(&mut fx.idgen, "SomeError", SymKind::Type, None);
    let body = Node::stmt_list(
        vec![Node::new(NodeKind::Try, sp()).with_kids(vec![
            Node::stmt_list(vec![yield_val(int_lit(&fx.g, 1))], sp()),
            Node::new(NodeKind::ExceptBranch, sp()).with_kids(vec![
                Node::sym(some_error, sp()),
                Node::stmt_list(vec![yield_val(int_lit(&fx.g, 2))], sp()),
            ]),
        ])],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);

    let rendered = render_body(&fx.g, &out);
    assert!(
        rendered.contains("if getCurrentException() of SomeError:"),
        "{rendered}"
    );
    // unmatched exceptions re-capture and keep unrolling
    assert!(rendered.contains(":curExc = getCurrentException()"), "{rendered}");
}

#[test]
fn nested_finallys_bubble_pending_returns() {
    // try:
    //   try: return 5
    //   finally: yield 1
    // finally: yield 2
    let mut fx = fixture(true);
    let inner = try_finally(
        vec![ret(int_lit(&fx.g, 5))],
        vec![yield_val(int_lit(&fx.g, 1))],
    );
    let body = Node::stmt_list(
        vec![Node::new(NodeKind::Try, sp()).with_kids(vec![
            Node::stmt_list(vec![inner], sp()),
            Node::new(NodeKind::Finally, sp())
                .with_kids(vec![Node::stmt_list(vec![yield_val(int_lit(&fx.g, 2))], sp())]),
        ])],
        sp(),
    );

    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);

    let rendered = render_body(&fx.g, &out);
    assert!(rendered.contains(":tmpResult = 5"), "{rendered}");
    // the pending return only finalizes at the outermost finally
    assert!(rendered.contains(":result = :tmpResult"), "{rendered}");
    let finalize_count = rendered.matches(":result = :tmpResult").count();
    assert_eq!(finalize_count, 1, "{rendered}");
    // both finallys run: yields of 1 and 2 are suspension points
    assert!(rendered.contains(":result = 1"), "{rendered}");
    assert!(rendered.contains(":result = 2"), "{rendered}");
}

#[test]
fn lifted_iterators_use_environment_fields() {
    let mut fx = fixture(true);
    let (_env_param, env_ty) = fx.g.register_lifted_env(&mut fx.idgen, fx.f);

    let body = Node::stmt_list(
        vec![try_finally(
            vec![ret(int_lit(&fx.g, 1))],
            vec![yield_val(int_lit(&fx.g, 0))],
        )],
        sp(),
    );
    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();

    let rendered = render_body(&fx.g, &out);
    // hidden state lives behind the environment parameter
    assert!(rendered.contains(":env[].:state = "), "{rendered}");
    assert!(!rendered.contains("var :state"), "{rendered}");

    // the state field stays field 0; the new hidden variables sank behind it
    let fields = fx.g.types.record_fields(env_ty);
    assert_eq!(fields[0], fx.g.state_field(fx.f).unwrap());
    assert!(fields.len() > 1, "hidden variables were not sunk into the env");
}

#[test]
fn unit_iterator_return_in_try_has_no_tmp_result() {
    // no return type: `return` must not materialize a result
    let mut fx = fixture(false);
    let body = Node::stmt_list(
        vec![try_finally(
            vec![Node::new(NodeKind::Return, sp()).with_kids(vec![Node::empty(sp())])],
            vec![yield_val(Node::empty(sp()))],
        )],
        sp(),
    );
    let out = transform_closure_iterator(&mut fx.g, &mut fx.idgen, fx.f, body).unwrap();
    check_invariants(&fx.g, &out);
    let rendered = render_body(&fx.g, &out);
    assert!(!rendered.contains(":tmpResult"), "{rendered}");
    assert!(rendered.contains(":unrollFinally = true"), "{rendered}");
}
