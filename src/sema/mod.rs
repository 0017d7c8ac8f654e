// src/sema/mod.rs
pub mod graph;
pub mod sym;
pub mod types;

pub use graph::{IdGen, ModuleGraph};
pub use sym::{Magic, SymId, SymKind, SymTable, Symbol};
pub use types::{TyKind, Type, TypeArena, TypeId};
