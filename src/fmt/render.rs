// src/fmt/render.rs
//! Plain-text rendering of mid-end trees.
//!
//! Produces a deterministic, indentation-based dump used by tests and for
//! debugging lowered state machines. This is a diagnostic format, not a
//! re-parsable surface syntax.

use crate::frontend::ast::{Node, NodeKind};
use crate::sema::types::{TyKind, Type, TypeId};
use crate::sema::ModuleGraph;

pub fn render_body(g: &ModuleGraph, n: &Node) -> String {
    let mut out = String::new();
    write_stmt(g, n, 0, &mut out);
    out
}

fn line(out: &mut String, indent: usize, text: &str) {
    for _ in 0..indent {
        out.push_str("  ");
    }
    out.push_str(text);
    out.push('\n');
}

fn sym_name(g: &ModuleGraph, n: &Node) -> String {
    match n.kind {
        NodeKind::Sym(id) => g.interner.resolve(g.syms.get(id).name).to_string(),
        NodeKind::Empty => String::new(),
        _ => expr_str(g, n),
    }
}

fn write_stmt(g: &ModuleGraph, n: &Node, indent: usize, out: &mut String) {
    match n.kind {
        NodeKind::Empty => {}
        NodeKind::StmtList | NodeKind::StmtListExpr => {
            for kid in &n.kids {
                write_stmt(g, kid, indent, out);
            }
        }
        NodeKind::State(id) => {
            line(out, indent, &format!("state {id}:"));
            for kid in &n.kids {
                write_stmt(g, kid, indent + 1, out);
            }
        }
        NodeKind::GotoState => {
            line(out, indent, &format!("gotoState {}", expr_str(g, &n.kids[0])));
        }
        NodeKind::Asgn => {
            line(
                out,
                indent,
                &format!("{} = {}", expr_str(g, &n.kids[0]), expr_str(g, &n.kids[1])),
            );
        }
        NodeKind::If => {
            let mut first = true;
            for branch in &n.kids {
                match branch.kind {
                    NodeKind::ElifBranch => {
                        let kw = if first { "if" } else { "elif" };
                        line(
                            out,
                            indent,
                            &format!("{kw} {}:", expr_str(g, &branch.kids[0])),
                        );
                        write_stmt(g, &branch.kids[1], indent + 1, out);
                        first = false;
                    }
                    NodeKind::Else => {
                        line(out, indent, "else:");
                        write_stmt(g, &branch.kids[0], indent + 1, out);
                    }
                    _ => line(out, indent, "<malformed branch>"),
                }
            }
        }
        NodeKind::Case => {
            line(out, indent, &format!("case {}", expr_str(g, &n.kids[0])));
            for branch in &n.kids[1..] {
                match branch.kind {
                    NodeKind::OfBranch => {
                        let lits: Vec<String> = branch.kids[..branch.kids.len() - 1]
                            .iter()
                            .map(|l| expr_str(g, l))
                            .collect();
                        line(out, indent, &format!("of {}:", lits.join(", ")));
                        write_stmt(g, branch.kids.last().unwrap_or(branch), indent + 1, out);
                    }
                    NodeKind::Else => {
                        line(out, indent, "else:");
                        write_stmt(g, &branch.kids[0], indent + 1, out);
                    }
                    _ => line(out, indent, "<malformed branch>"),
                }
            }
        }
        NodeKind::While => {
            line(out, indent, &format!("while {}:", expr_str(g, &n.kids[0])));
            write_stmt(g, &n.kids[1], indent + 1, out);
        }
        NodeKind::Block => {
            let label = sym_name(g, &n.kids[0]);
            if label.is_empty() {
                line(out, indent, "block:");
            } else {
                line(out, indent, &format!("block {label}:"));
            }
            write_stmt(g, &n.kids[1], indent + 1, out);
        }
        NodeKind::Break => {
            let label = n.kids.first().map(|k| sym_name(g, k)).unwrap_or_default();
            if label.is_empty() {
                line(out, indent, "break");
            } else {
                line(out, indent, &format!("break {label}"));
            }
        }
        NodeKind::Return | NodeKind::Yield | NodeKind::Raise => {
            let kw = match n.kind {
                NodeKind::Return => "return",
                NodeKind::Yield => "yield",
                _ => "raise",
            };
            let value = n.kids.first().map(|k| expr_str(g, k)).unwrap_or_default();
            if value.is_empty() {
                line(out, indent, kw);
            } else {
                line(out, indent, &format!("{kw} {value}"));
            }
        }
        NodeKind::Try => {
            line(out, indent, "try:");
            write_stmt(g, &n.kids[0], indent + 1, out);
            for branch in &n.kids[1..] {
                match branch.kind {
                    NodeKind::ExceptBranch => {
                        let types: Vec<String> = branch.kids[..branch.kids.len() - 1]
                            .iter()
                            .map(|t| sym_name(g, t))
                            .collect();
                        if types.is_empty() {
                            line(out, indent, "except:");
                        } else {
                            line(out, indent, &format!("except {}:", types.join(", ")));
                        }
                        write_stmt(g, branch.kids.last().unwrap_or(branch), indent + 1, out);
                    }
                    NodeKind::Finally => {
                        line(out, indent, "finally:");
                        write_stmt(g, &branch.kids[0], indent + 1, out);
                    }
                    _ => line(out, indent, "<malformed branch>"),
                }
            }
        }
        NodeKind::VarSection => {
            for def in &n.kids {
                let name = sym_name(g, &def.kids[0]);
                let ty = match def.kids[0].kind {
                    NodeKind::Sym(id) => g.syms.get(id).ty,
                    _ => None,
                };
                let ty_str = ty.map(|t| type_str(g, t)).unwrap_or_default();
                let mut text = if ty_str.is_empty() {
                    format!("var {name}")
                } else {
                    format!("var {name}: {ty_str}")
                };
                if def.kids.len() > 1 && !def.kids[1].is_empty() {
                    text.push_str(&format!(" = {}", expr_str(g, &def.kids[1])));
                }
                line(out, indent, &text);
            }
        }
        _ => {
            line(out, indent, &expr_str(g, n));
        }
    }
}

fn expr_str(g: &ModuleGraph, n: &Node) -> String {
    match n.kind {
        NodeKind::Empty => String::new(),
        NodeKind::IntLit(v) => {
            if n.ty == Some(g.sys_type(TyKind::Bool)) {
                if v == 0 { "false".into() } else { "true".into() }
            } else {
                v.to_string()
            }
        }
        NodeKind::NilLit => "nil".into(),
        NodeKind::Sym(id) => g.interner.resolve(g.syms.get(id).name).to_string(),
        NodeKind::Call => {
            let magic = g.sym_of(&n.kids[0]).and_then(|s| s.magic);
            match magic {
                Some(m) if n.kids.len() == 3 => format!(
                    "{} {} {}",
                    expr_str(g, &n.kids[1]),
                    m.op_str(),
                    expr_str(g, &n.kids[2])
                ),
                Some(m) if n.kids.len() == 2 => {
                    let sep = if m.op_str().chars().all(char::is_alphabetic) {
                        " "
                    } else {
                        ""
                    };
                    format!("{}{sep}{}", m.op_str(), expr_str(g, &n.kids[1]))
                }
                _ => {
                    let args: Vec<String> =
                        n.kids[1..].iter().map(|a| expr_str(g, a)).collect();
                    format!("{}({})", expr_str(g, &n.kids[0]), args.join(", "))
                }
            }
        }
        NodeKind::FieldAccess => format!(
            "{}.{}",
            expr_str(g, &n.kids[0]),
            sym_name(g, &n.kids[1])
        ),
        NodeKind::Deref => format!("{}[]", expr_str(g, &n.kids[0])),
        NodeKind::BracketExpr => format!(
            "{}[{}]",
            expr_str(g, &n.kids[0]),
            expr_str(g, &n.kids[1])
        ),
        NodeKind::ArrayConstr => {
            let elems: Vec<String> = n.kids.iter().map(|e| expr_str(g, e)).collect();
            format!("[{}]", elems.join(", "))
        }
        NodeKind::TupleConstr => {
            let elems: Vec<String> = n.kids.iter().map(|e| expr_str(g, e)).collect();
            format!("({})", elems.join(", "))
        }
        NodeKind::ObjConstr => {
            let fields: Vec<String> = n.kids[1..].iter().map(|e| expr_str(g, e)).collect();
            format!("{}({})", sym_name(g, &n.kids[0]), fields.join(", "))
        }
        NodeKind::ExprColonExpr => format!(
            "{}: {}",
            sym_name(g, &n.kids[0]),
            expr_str(g, &n.kids[1])
        ),
        NodeKind::Conv => format!("conv({})", expr_str(g, &n.kids[0])),
        NodeKind::Cast => format!("cast({})", expr_str(g, &n.kids[0])),
        NodeKind::RangeCheck => format!(
            "rangeCheck({}, {}, {})",
            expr_str(g, &n.kids[0]),
            expr_str(g, &n.kids[1]),
            expr_str(g, &n.kids[2])
        ),
        NodeKind::StateLit(v) => format!("#{v}"),
        NodeKind::GotoState => format!("gotoState {}", expr_str(g, &n.kids[0])),
        NodeKind::Asgn => format!(
            "{} = {}",
            expr_str(g, &n.kids[0]),
            expr_str(g, &n.kids[1])
        ),
        NodeKind::Yield => format!("yield {}", expr_str(g, &n.kids[0])),
        NodeKind::StmtListExpr => {
            let parts: Vec<String> = n.kids.iter().map(|k| expr_str(g, k)).collect();
            format!("({})", parts.join("; "))
        }
        _ => format!("<{}>", n.kind_name()),
    }
}

fn type_str(g: &ModuleGraph, ty: TypeId) -> String {
    match g.types.get(ty) {
        Type::Void => "void".into(),
        Type::Int => "int".into(),
        Type::Int16 => "int16".into(),
        Type::Bool => "bool".into(),
        Type::NilT => "nil".into(),
        Type::Exception => "exception".into(),
        Type::Array { elem, len } => format!("array[{len}, {}]", type_str(g, *elem)),
        Type::Record { .. } => "object".into(),
        Type::Named(name) => g.interner.resolve(*name).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::Span;
    use crate::sema::{IdGen, SymKind};

    #[test]
    fn renders_nested_statements() {
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let int = g.sys_type(TyKind::Int);
        let a = g.new_sym(&mut idgen, "a", SymKind::Var, Some(int));
        let sp = Span::default();
        let body = Node::stmt_list(
            vec![Node::new(NodeKind::While, sp).with_kids(vec![
                Node::int_lit(1, sp).with_ty(g.sys_type(TyKind::Bool)),
                Node::stmt_list(
                    vec![Node::asgn(
                        Node::sym(a, sp).with_ty(int),
                        Node::int_lit(2, sp).with_ty(int),
                    )],
                    sp,
                ),
            ])],
            sp,
        );
        let rendered = render_body(&g, &body);
        assert_eq!(rendered, "while true:\n  a = 2\n");
    }
}
