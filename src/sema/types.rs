// src/sema/types.rs
//! Type arena.
//!
//! `TypeId` is a `u32` handle into per-compilation storage. Primitives are
//! created once at arena construction so handle comparison is enough for
//! them; compound types are push-only. Environment records are mutable
//! (lambda-lifting and the closure-iterator pass both sink fields into
//! them), so the arena does not deduplicate.

use smallvec::SmallVec;

use crate::frontend::Name;
use crate::sema::sym::SymId;

/// Handle to a type in the [`TypeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Field lists are small; keep them inline.
pub type FieldVec = SmallVec<[SymId; 4]>;

#[derive(Debug, Clone)]
pub enum Type {
    Void,
    Int,
    Int16,
    Bool,
    NilT,
    Exception,
    Array { elem: TypeId, len: u32 },
    /// An environment (or user) record. Field order is significant: the
    /// code generator reads the iterator state from field 0.
    Record { fields: FieldVec },
    Named(Name),
}

/// Well-known type selector for [`TypeArena::sys_type`]-style lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TyKind {
    Void,
    Int,
    Int16,
    Bool,
    Nil,
    Exception,
}

#[derive(Debug)]
pub struct TypeArena {
    types: Vec<Type>,
}

impl TypeArena {
    pub fn new() -> Self {
        // Primitive order must match `primitive()`.
        TypeArena {
            types: vec![
                Type::Void,
                Type::Int,
                Type::Int16,
                Type::Bool,
                Type::NilT,
                Type::Exception,
            ],
        }
    }

    pub fn primitive(&self, kind: TyKind) -> TypeId {
        TypeId(match kind {
            TyKind::Void => 0,
            TyKind::Int => 1,
            TyKind::Int16 => 2,
            TyKind::Bool => 3,
            TyKind::Nil => 4,
            TyKind::Exception => 5,
        })
    }

    pub fn add(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.0 as usize]
    }

    /// Fields of a record type. Panics on non-records; callers hold a
    /// `TypeId` they know is an environment record.
    pub fn record_fields(&self, id: TypeId) -> &FieldVec {
        match self.get(id) {
            Type::Record { fields } => fields,
            other => panic!("record_fields on non-record type {other:?}"),
        }
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn primitives_are_preallocated() {
        let arena = TypeArena::new();
        assert!(matches!(arena.get(arena.primitive(TyKind::Bool)), Type::Bool));
        assert!(matches!(
            arena.get(arena.primitive(TyKind::Exception)),
            Type::Exception
        ));
    }

    #[test]
    fn records_are_mutable() {
        let mut arena = TypeArena::new();
        let rec = arena.add(Type::Record {
            fields: smallvec![SymId(0)],
        });
        match arena.get_mut(rec) {
            Type::Record { fields } => fields.push(SymId(1)),
            _ => unreachable!(),
        }
        assert_eq!(arena.record_fields(rec).len(), 2);
    }
}
