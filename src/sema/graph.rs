// src/sema/graph.rs
//! Per-compilation store the mid-end transforms run against.
//!
//! `ModuleGraph` owns the interner, symbol and type arenas, and caches the
//! well-known symbols passes synthesize calls to: intrinsic operators
//! ("magics") and runtime support procs reachable from generated code
//! (`getCurrentException`, `closureIterSetupExc`). It also records per-
//! routine facts earlier passes established: return type, environment
//! parameter (present iff lambda-lifting already ran) and the state field
//! lambda-lifting reserved at position 0 of the environment record.

use rustc_hash::FxHashMap;

use crate::frontend::ast::{Node, NodeKind};
use crate::frontend::{Interner, Name, Span};
use crate::sema::sym::{Magic, SymId, SymKind, SymTable, Symbol};
use crate::sema::types::{Type, TyKind, TypeArena, TypeId};

/// Injected monotonic id allocator. Threaded mutably through every
/// synthesizing call so generated symbols get process-unique ids.
#[derive(Debug, Default)]
pub struct IdGen {
    next: u32,
}

impl IdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Facts about one routine, filled in by earlier passes and lazily
/// extended by the closure-iterator lowering.
#[derive(Debug, Default)]
struct RoutineInfo {
    ret_ty: Option<TypeId>,
    env_param: Option<SymId>,
    state_field: Option<SymId>,
    result_sym: Option<SymId>,
}

#[derive(Debug)]
pub struct ModuleGraph {
    pub interner: Interner,
    pub syms: SymTable,
    pub types: TypeArena,
    routines: FxHashMap<SymId, RoutineInfo>,
    codegen_procs: FxHashMap<Name, SymId>,
    magic_syms: FxHashMap<Magic, SymId>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        ModuleGraph {
            interner: Interner::new(),
            syms: SymTable::new(),
            types: TypeArena::new(),
            routines: FxHashMap::default(),
            codegen_procs: FxHashMap::default(),
            magic_syms: FxHashMap::default(),
        }
    }

    pub fn new_sym(
        &mut self,
        idgen: &mut IdGen,
        name: &str,
        kind: SymKind,
        ty: Option<TypeId>,
    ) -> SymId {
        let name = self.interner.intern(name);
        self.syms.add(Symbol {
            name,
            kind,
            ty,
            magic: None,
            uid: idgen.next(),
        })
    }

    /// Like [`new_sym`](Self::new_sym), but the uid is baked into the
    /// name so same-based symbols stay distinguishable in dumps.
    pub fn new_unique_sym(
        &mut self,
        idgen: &mut IdGen,
        base: &str,
        kind: SymKind,
        ty: Option<TypeId>,
    ) -> SymId {
        let uid = idgen.next();
        let name = self.interner.intern(&format!("{base}{uid}"));
        self.syms.add(Symbol {
            name,
            kind,
            ty,
            magic: None,
            uid,
        })
    }

    pub fn sys_type(&self, kind: TyKind) -> TypeId {
        self.types.primitive(kind)
    }

    /// Symbol for an intrinsic operator, interned on first use.
    pub fn sys_magic(&mut self, idgen: &mut IdGen, magic: Magic) -> SymId {
        if let Some(&id) = self.magic_syms.get(&magic) {
            return id;
        }
        let name = self.interner.intern(magic.op_str());
        let id = self.syms.add(Symbol {
            name,
            kind: SymKind::Proc,
            ty: None,
            magic: Some(magic),
            uid: idgen.next(),
        });
        self.magic_syms.insert(magic, id);
        id
    }

    /// Symbol for a runtime support proc, interned on first use.
    pub fn codegen_proc(&mut self, idgen: &mut IdGen, name: &str) -> SymId {
        let interned = self.interner.intern(name);
        if let Some(&id) = self.codegen_procs.get(&interned) {
            return id;
        }
        let id = self.syms.add(Symbol {
            name: interned,
            kind: SymKind::Proc,
            ty: None,
            magic: None,
            uid: idgen.next(),
        });
        self.codegen_procs.insert(interned, id);
        id
    }

    /// Build a call to a runtime support proc.
    pub fn call_codegen_proc(
        &mut self,
        idgen: &mut IdGen,
        name: &str,
        args: Vec<Node>,
        span: Span,
        ty: Option<TypeId>,
    ) -> Node {
        let proc = self.codegen_proc(idgen, name);
        let mut call = Node::call(Node::sym(proc, span), args, span);
        call.ty = ty;
        call
    }

    /// Register a routine the mid-end will transform. `ret_ty` is `None`
    /// for unit iterators.
    pub fn declare_routine(
        &mut self,
        idgen: &mut IdGen,
        name: &str,
        ret_ty: Option<TypeId>,
    ) -> SymId {
        let id = self.new_sym(idgen, name, SymKind::Proc, ret_ty);
        self.routines.insert(
            id,
            RoutineInfo {
                ret_ty,
                ..RoutineInfo::default()
            },
        );
        id
    }

    /// The environment parameter, present iff lambda-lifting already ran.
    pub fn env_param(&self, f: SymId) -> Option<SymId> {
        self.routines.get(&f).and_then(|r| r.env_param)
    }

    pub fn return_type(&self, f: SymId) -> Option<TypeId> {
        self.routines.get(&f).and_then(|r| r.ret_ty)
    }

    pub fn has_return_type(&self, f: SymId) -> bool {
        self.return_type(f).is_some()
    }

    /// The state field lambda-lifting reserved at position 0 of the
    /// environment record.
    pub fn state_field(&self, f: SymId) -> Option<SymId> {
        self.routines.get(&f).and_then(|r| r.state_field)
    }

    /// The symbol the yielded/returned value passes through.
    pub fn closure_iter_result(&mut self, idgen: &mut IdGen, f: SymId) -> SymId {
        if let Some(existing) = self.routines.get(&f).and_then(|r| r.result_sym) {
            return existing;
        }
        let ty = self.return_type(f);
        let sym = self.new_sym(idgen, ":result", SymKind::Var, ty);
        self.routines.entry(f).or_default().result_sym = Some(sym);
        sym
    }

    /// Integer type of the hidden state variable. The exception table and
    /// the state dispatcher share this width.
    pub fn closure_iter_state_type(&self, _f: SymId) -> TypeId {
        self.sys_type(TyKind::Int16)
    }

    /// Simulate lambda-lifting having run for `f`: create an environment
    /// record whose field 0 is the state variable, and an environment
    /// parameter of that type.
    pub fn register_lifted_env(&mut self, idgen: &mut IdGen, f: SymId) -> (SymId, TypeId) {
        let state_ty = self.closure_iter_state_type(f);
        let state_field = self.new_sym(idgen, ":state", SymKind::Field, Some(state_ty));
        let env_ty = self.types.add(Type::Record {
            fields: smallvec::smallvec![state_field],
        });
        let env_param = self.new_sym(idgen, ":env", SymKind::Param, Some(env_ty));
        let info = self.routines.entry(f).or_default();
        info.env_param = Some(env_param);
        info.state_field = Some(state_field);
        (env_param, env_ty)
    }

    /// Sink a hidden variable into an environment record under a name no
    /// other field uses.
    pub fn add_unique_field(
        &mut self,
        idgen: &mut IdGen,
        env_ty: TypeId,
        base_name: &str,
        ty: TypeId,
    ) -> SymId {
        let uid = idgen.next();
        let name = self.interner.intern(&format!("{base_name}{uid}"));
        let sym = self.syms.add(Symbol {
            name,
            kind: SymKind::Field,
            ty: Some(ty),
            magic: None,
            uid,
        });
        match self.types.get_mut(env_ty) {
            Type::Record { fields } => fields.push(sym),
            _ => panic!("add_unique_field on non-record environment type"),
        }
        sym
    }

    /// Kind of `n` when it is a symbol reference.
    pub fn sym_of(&self, n: &Node) -> Option<&Symbol> {
        match n.kind {
            NodeKind::Sym(id) => Some(self.syms.get(id)),
            _ => None,
        }
    }
}

impl Default for ModuleGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codegen_procs_are_cached() {
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let a = g.codegen_proc(&mut idgen, "getCurrentException");
        let b = g.codegen_proc(&mut idgen, "getCurrentException");
        assert_eq!(a, b);
    }

    #[test]
    fn lifted_env_puts_state_first() {
        let mut g = ModuleGraph::new();
        let mut idgen = IdGen::new();
        let f = g.declare_routine(&mut idgen, "items", None);
        let (_env, env_ty) = g.register_lifted_env(&mut idgen, f);
        let extra = g.add_unique_field(&mut idgen, env_ty, ":tmp", g.sys_type(TyKind::Int));
        let fields = g.types.record_fields(env_ty);
        assert_eq!(fields[0], g.state_field(f).unwrap());
        assert_eq!(*fields.last().unwrap(), extra);
    }
}
