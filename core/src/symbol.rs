//! Symbol tables: a tree of scopes, each labelled with the kind of
//! construct that owns it, holding named entries for types, variables,
//! functions (with overload lists), namespaces, modules, fields and labels.
//!
//! All scopes of a compilation live in one [SymbolArena] and refer to each
//! other by [ScopeId]/[SymbolId]. Scopes distinguish *owned* entries
//! (declared here, names must be unique) from *borrowed* entries (brought
//! in by `using`; owned names always shadow them, and two borrows of the
//! same name poison it until the conflict is reported).

use crate::ast::AstId;
use crate::ty::TypeId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ScopeId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SymbolId(pub u32);

/// What kind of construct owns a scope. Lookup can be bounded by an owner
/// kind: `get(name, true, OwnerKind::Function)` will not escape the
/// enclosing function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum OwnerKind {
    Free,
    Block,
    Namespace,
    Loop,
    Function,
    Struct,
    Module,
    Union,
    Enum,
    /// A child scope that behaves exactly like its parent
    Copy,
}

/// One overload of a function symbol.
#[derive(Clone, Debug, Serialize)]
pub struct Overload {
    /// The superfunction type of this signature
    pub ty: TypeId,
    /// The function body
    pub value: Option<AstId>,
    pub defined: bool,
    /// Scope holding parameters and compile-time constants
    pub scope: Option<ScopeId>,
}

#[derive(Clone, Debug, Serialize)]
pub enum SymbolKind {
    /// A named type (struct/union/enum/tuple definitions)
    Type {
        ty: TypeId,
        defined: bool,
        scope: Option<ScopeId>,
        /// The type-literal AST that defines this type
        value: Option<AstId>,
    },
    Variable {
        ty: TypeId,
        value: Option<AstId>,
        compiletime: bool,
        reference: bool,
        thisarg: bool,
        is_return: bool,
        defined: bool,
    },
    Function {
        overloads: Vec<Overload>,
        /// Scope for signatures and overload records
        scope: Option<ScopeId>,
        defined: bool,
    },
    Namespace {
        scope: ScopeId,
    },
    Module {
        /// Root scope of the imported module
        scope: ScopeId,
    },
    /// A member of a supercompound, for dotted lookup
    Field {
        index: u64,
        parent: TypeId,
    },
    /// A single overload viewed as its own symbol
    OverloadRef {
        function: SymbolId,
        index: usize,
    },
    Label,
}

#[derive(Clone, Debug, Serialize)]
pub struct Symbol {
    pub name: String,
    /// The AST node that declared this symbol
    pub decl: Option<AstId>,
    pub kind: SymbolKind,
}

impl Symbol {
    /// Has this symbol finished compiling? Used by the semantic fibers to
    /// decide whether to stall.
    pub fn is_defined(&self) -> bool {
        match &self.kind {
            SymbolKind::Type { defined, .. }
            | SymbolKind::Variable { defined, .. }
            | SymbolKind::Function { defined, .. } => *defined,
            _ => true,
        }
    }

    pub fn ty(&self) -> Option<TypeId> {
        match &self.kind {
            SymbolKind::Type { ty, .. } | SymbolKind::Variable { ty, .. } => {
                Some(*ty)
            }
            _ => None,
        }
    }

    pub fn scope(&self) -> Option<ScopeId> {
        match &self.kind {
            SymbolKind::Type { scope, .. }
            | SymbolKind::Function { scope, .. } => *scope,
            SymbolKind::Namespace { scope }
            | SymbolKind::Module { scope } => Some(*scope),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Scope {
    pub owner: OwnerKind,
    pub parent: Option<ScopeId>,
    entries: HashMap<String, SymbolId>,
    borrowed: HashMap<String, SymbolId>,
    /// Names imported by more than one `using`; looking one up is an error
    ambiguous: HashSet<String>,
}

/// Result of a name lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(SymbolId),
    /// The name is poisoned by conflicting `using` imports
    Ambiguous,
    NotFound,
}

impl Lookup {
    pub fn found(self) -> Option<SymbolId> {
        match self {
            Self::Found(id) => Some(id),
            _ => None,
        }
    }
}

/// Every scope and symbol of one compilation.
#[derive(Debug, Default, Serialize)]
pub struct SymbolArena {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
}

impl SymbolArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_scope(
        &mut self,
        owner: OwnerKind,
        parent: Option<ScopeId>,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            owner,
            parent,
            entries: HashMap::new(),
            borrowed: HashMap::new(),
            ambiguous: HashSet::new(),
        });
        id
    }

    /// A child scope. [OwnerKind::Copy] children adopt the parent's owner
    /// for boundary purposes.
    pub fn make_child(&mut self, parent: ScopeId, owner: OwnerKind) -> ScopeId {
        let owner = if owner == OwnerKind::Copy {
            self.scope(parent).owner
        } else {
            owner
        };
        self.new_scope(owner, Some(parent))
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    // ===== Lookup =====

    /// Walk from `scope` towards the root looking for `name`. Owned entries
    /// shadow borrowed ones. `propagate = false` checks only `scope`
    /// itself. The walk stops after searching a scope whose owner equals
    /// `until` (pass [OwnerKind::Free] for an unbounded walk).
    pub fn get(
        &self,
        scope: ScopeId,
        name: &str,
        propagate: bool,
        until: OwnerKind,
    ) -> Lookup {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let scope = self.scope(id);
            if let Some(&sym) = scope.entries.get(name) {
                return Lookup::Found(sym);
            }
            if scope.ambiguous.contains(name) {
                return Lookup::Ambiguous;
            }
            if let Some(&sym) = scope.borrowed.get(name) {
                return Lookup::Found(sym);
            }
            if !propagate || (until != OwnerKind::Free && scope.owner == until)
            {
                break;
            }
            cur = scope.parent;
        }
        Lookup::NotFound
    }

    /// Does `name` resolve from `scope`?
    pub fn has(&self, scope: ScopeId, name: &str, propagate: bool) -> bool {
        !matches!(
            self.get(scope, name, propagate, OwnerKind::Free),
            Lookup::NotFound
        )
    }

    // ===== Insertion =====

    /// Add an owned entry. Fails with the existing symbol on redeclaration.
    pub fn add(
        &mut self,
        scope: ScopeId,
        name: &str,
        decl: Option<AstId>,
        kind: SymbolKind,
    ) -> Result<SymbolId, SymbolId> {
        if let Some(&existing) =
            self.scopes[scope.0 as usize].entries.get(name)
        {
            return Err(existing);
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.into(),
            decl,
            kind,
        });
        self.scopes[scope.0 as usize]
            .entries
            .insert(name.into(), id);
        Ok(id)
    }

    pub fn add_variable(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: TypeId,
        value: Option<AstId>,
        decl: Option<AstId>,
    ) -> Result<SymbolId, SymbolId> {
        self.add(
            scope,
            name,
            decl,
            SymbolKind::Variable {
                ty,
                value,
                compiletime: false,
                reference: false,
                thisarg: false,
                is_return: false,
                defined: false,
            },
        )
    }

    pub fn add_type(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: TypeId,
        inner: Option<ScopeId>,
        decl: Option<AstId>,
    ) -> Result<SymbolId, SymbolId> {
        self.add(
            scope,
            name,
            decl,
            SymbolKind::Type {
                ty,
                defined: false,
                scope: inner,
                value: None,
            },
        )
    }

    /// Get the function entry named `name` in `scope`, creating an empty
    /// one if needed. Fails if the name is taken by a non-function.
    pub fn add_or_get_function(
        &mut self,
        scope: ScopeId,
        name: &str,
        decl: Option<AstId>,
    ) -> Result<SymbolId, SymbolId> {
        if let Some(&existing) =
            self.scopes[scope.0 as usize].entries.get(name)
        {
            return match self.symbol(existing).kind {
                SymbolKind::Function { .. } => Ok(existing),
                _ => Err(existing),
            };
        }
        self.add(
            scope,
            name,
            decl,
            SymbolKind::Function {
                overloads: Vec::new(),
                scope: None,
                defined: false,
            },
        )
    }

    /// Append an overload to a function symbol; returns its index.
    pub fn add_overload(
        &mut self,
        function: SymbolId,
        overload: Overload,
    ) -> usize {
        match &mut self.symbol_mut(function).kind {
            SymbolKind::Function { overloads, .. } => {
                overloads.push(overload);
                overloads.len() - 1
            }
            _ => panic!("add_overload on a non-function symbol"),
        }
    }

    pub fn add_namespace(
        &mut self,
        scope: ScopeId,
        name: &str,
        inner: ScopeId,
        decl: Option<AstId>,
    ) -> Result<SymbolId, SymbolId> {
        self.add(scope, name, decl, SymbolKind::Namespace { scope: inner })
    }

    pub fn add_module(
        &mut self,
        scope: ScopeId,
        name: &str,
        root: ScopeId,
    ) -> Result<SymbolId, SymbolId> {
        self.add(scope, name, None, SymbolKind::Module { scope: root })
    }

    pub fn add_field(
        &mut self,
        scope: ScopeId,
        name: &str,
        index: u64,
        parent: TypeId,
        decl: Option<AstId>,
    ) -> Result<SymbolId, SymbolId> {
        self.add(scope, name, decl, SymbolKind::Field { index, parent })
    }

    pub fn add_label(
        &mut self,
        scope: ScopeId,
        name: &str,
        decl: Option<AstId>,
    ) -> Result<SymbolId, SymbolId> {
        self.add(scope, name, decl, SymbolKind::Label)
    }

    /// Borrow an entry into `scope` (the `using` directive). Borrowed
    /// entries are not owned by the scope and never shadow owned names. A
    /// second borrow of the same name poisons it.
    pub fn borrow(&mut self, scope: ScopeId, name: &str, sym: SymbolId) {
        let scope = &mut self.scopes[scope.0 as usize];
        if scope.ambiguous.contains(name) {
            return;
        }
        match scope.borrowed.get(name) {
            Some(&existing) if existing != sym => {
                scope.borrowed.remove(name);
                scope.ambiguous.insert(name.into());
            }
            _ => {
                scope.borrowed.insert(name.into(), sym);
            }
        }
    }

    /// Borrow every owned entry of `from` into `into`.
    pub fn borrow_all(&mut self, into: ScopeId, from: ScopeId) {
        let entries: Vec<(String, SymbolId)> = self.scopes[from.0 as usize]
            .entries
            .iter()
            .map(|(name, &sym)| (name.clone(), sym))
            .collect();
        for (name, sym) in entries {
            self.borrow(into, &name, sym);
        }
    }

    /// Owned entries of a scope, for iteration in tests and printing.
    pub fn entries(
        &self,
        scope: ScopeId,
    ) -> impl Iterator<Item = (&String, SymbolId)> {
        self.scope(scope).entries.iter().map(|(name, &id)| (name, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_root() -> (SymbolArena, ScopeId) {
        let mut arena = SymbolArena::new();
        let root = arena.new_scope(OwnerKind::Module, None);
        (arena, root)
    }

    #[test]
    fn test_redeclaration_fails() {
        let (mut arena, root) = arena_with_root();
        let ty = TypeId(0);
        let first = arena.add_variable(root, "x", ty, None, None).unwrap();
        let err = arena.add_variable(root, "x", ty, None, None);
        assert_eq!(err, Err(first));
    }

    #[test]
    fn test_lookup_propagates_until_boundary() {
        let (mut arena, root) = arena_with_root();
        let func = arena.make_child(root, OwnerKind::Function);
        let block = arena.make_child(func, OwnerKind::Block);

        let ty = TypeId(0);
        let global = arena.add_variable(root, "g", ty, None, None).unwrap();
        let local = arena.add_variable(block, "l", ty, None, None).unwrap();

        // Unbounded walk sees both
        assert_eq!(
            arena.get(block, "g", true, OwnerKind::Free),
            Lookup::Found(global)
        );
        assert_eq!(
            arena.get(block, "l", true, OwnerKind::Free),
            Lookup::Found(local)
        );
        // Bounded at the function boundary, the global is invisible
        assert_eq!(
            arena.get(block, "g", true, OwnerKind::Function),
            Lookup::NotFound
        );
        // Strict lookup sees only the scope itself
        assert_eq!(
            arena.get(func, "l", false, OwnerKind::Free),
            Lookup::NotFound
        );
    }

    #[test]
    fn test_copy_scope_adopts_owner() {
        let (mut arena, root) = arena_with_root();
        let func = arena.make_child(root, OwnerKind::Function);
        let copy = arena.make_child(func, OwnerKind::Copy);
        assert_eq!(arena.scope(copy).owner, OwnerKind::Function);
    }

    #[test]
    fn test_borrowed_shadowed_by_owned() {
        let (mut arena, root) = arena_with_root();
        let other = arena.new_scope(OwnerKind::Module, None);
        let ty = TypeId(0);
        let theirs = arena.add_variable(other, "x", ty, None, None).unwrap();
        arena.borrow(root, "x", theirs);
        assert_eq!(
            arena.get(root, "x", false, OwnerKind::Free),
            Lookup::Found(theirs)
        );

        let ours = arena.add_variable(root, "x", ty, None, None).unwrap();
        assert_eq!(
            arena.get(root, "x", false, OwnerKind::Free),
            Lookup::Found(ours)
        );
    }

    #[test]
    fn test_conflicting_borrows_poison() {
        let (mut arena, root) = arena_with_root();
        let a = arena.new_scope(OwnerKind::Module, None);
        let b = arena.new_scope(OwnerKind::Module, None);
        let ty = TypeId(0);
        let from_a = arena.add_variable(a, "x", ty, None, None).unwrap();
        let from_b = arena.add_variable(b, "x", ty, None, None).unwrap();
        arena.borrow(root, "x", from_a);
        arena.borrow(root, "x", from_b);
        assert_eq!(
            arena.get(root, "x", false, OwnerKind::Free),
            Lookup::Ambiguous
        );
    }
}
