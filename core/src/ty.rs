//! The type table: every type the compiler knows about, interned by
//! structural identity and addressed by dense [TypeId]s. Names and default
//! values are *not* part of a type's identity: `(s32, s32)` spelled in two
//! places is one type. The owned scope of a struct or function
//! definition is, which keeps distinct nominal types distinct even when
//! their members coincide.
//!
//! Sizes are computed by a fixed-point pass ([TypeTable::set_size]): a type
//! sizes successfully once all the types it contains by value have sizes.
//! Pointers always size to [PTR_SIZE], which is what lets recursive types
//! bottom out.

use crate::ast::AstId;
use crate::symbol::ScopeId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

/// Handle to an interned type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TypeId(pub u32);

/// Size of any pointer, in bytes.
pub const PTR_SIZE: u64 = 8;
/// Size of an unsized array reference: pointer + length.
pub const FAT_ARRAY_SIZE: u64 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveKind {
    Signed,
    Unsigned,
    Boolean,
    Floating,
    Character,
    Error,
    Type,
    Any,
    Void,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PointerKind {
    Naked,
    Unique,
    Shared,
    Weak,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SpecialKind {
    /// Becomes whatever type is assigned to it
    Infer,
    /// Selected at compile time
    Generic,
    /// The result of operations on GENERIC values inside generic code
    GenericUnknown,
    /// The result of spreading a generic
    GenericCompound,
    /// Does not initialize to zero
    Nothing,
    /// Has no type
    Typeless,
    /// Has undecided type
    None,
    NoneArray,
    NoneStruct,
    NoneTuple,
    NoneFunction,
    /// The type of `null`
    Null,
    /// Type error; absorbs all operations
    ErrorType,
    /// The result of spreading a type error
    ErrorCompound,
}

/// One member of a compound.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Member {
    pub ty: TypeId,
    pub compiletime: bool,
    pub reference: bool,
}

/// One parameter of a function type. Names and defaults live on the
/// superfunction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Param {
    pub ty: TypeId,
    pub compiletime: bool,
    pub reference: bool,
    pub spread: bool,
    pub generic: bool,
    pub binding: bool,
    pub thisarg: bool,
}

impl Param {
    pub fn plain(ty: TypeId) -> Self {
        Self {
            ty,
            compiletime: false,
            reference: false,
            spread: false,
            generic: false,
            binding: false,
            thisarg: false,
        }
    }
}

/// One return of a function type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Ret {
    pub ty: TypeId,
    pub compiletime: bool,
    pub reference: bool,
}

impl Ret {
    pub fn plain(ty: TypeId) -> Self {
        Self {
            ty,
            compiletime: false,
            reference: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SuperKind {
    Struct,
    Union,
    Enum,
    Tuple,
}

/// Parameter name/default for a superfunction. Not part of type identity.
#[derive(Clone, Debug, Serialize)]
pub struct ParamInfo {
    pub name: String,
    pub default: Option<AstId>,
}

#[derive(Clone, Debug, Serialize)]
pub enum TypeKind {
    Primitive {
        kind: PrimitiveKind,
        bits: u16,
    },
    Pointer {
        kind: PointerKind,
        at: TypeId,
    },
    Array {
        of: TypeId,
        /// `None` for unsized arrays
        length: Option<u64>,
    },
    Compound {
        members: Vec<Member>,
    },
    /// struct/union/enum/tuple: a compound plus a name-bearing scope
    Supercompound {
        kind: SuperKind,
        compound: TypeId,
        scope: Option<ScopeId>,
        generic: bool,
        generated: bool,
    },
    Function {
        params: Vec<Param>,
        rets: Vec<Ret>,
    },
    /// A function plus parameter names, defaults, return names and scope
    Superfunction {
        function: TypeId,
        params: Vec<ParamInfo>,
        ret_names: Vec<String>,
        scope: Option<ScopeId>,
        generic: bool,
        generated: bool,
    },
    Special(SpecialKind),
}

#[derive(Clone, Debug, Serialize)]
pub struct Type {
    pub id: TypeId,
    pub kind: TypeKind,
    pub is_const: bool,
    pub is_volatile: bool,
    /// Set by the fixed-point sizing pass; `None` until all contained
    /// types have sizes themselves
    pub size: Option<u64>,
}

impl Type {
    pub fn is_primitive(&self, kind: PrimitiveKind) -> bool {
        matches!(self.kind, TypeKind::Primitive { kind: k, .. } if k == kind)
    }

    pub fn is_special(&self, kind: SpecialKind) -> bool {
        matches!(self.kind, TypeKind::Special(k) if k == kind)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer { .. })
    }

    pub fn is_supercompound(&self) -> bool {
        matches!(self.kind, TypeKind::Supercompound { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Special(SpecialKind::ErrorType)
                | TypeKind::Special(SpecialKind::ErrorCompound)
        )
    }
}

/// Structural identity key. Mirrors [TypeKind] minus everything that is
/// display-only (names, defaults).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum TypeKey {
    Primitive(PrimitiveKind, u16, bool, bool),
    Pointer(PointerKind, TypeId, bool, bool),
    Array(TypeId, Option<u64>, bool, bool),
    Compound(Vec<Member>, bool, bool),
    /// Named supercompounds are identified by their owned scope alone (the
    /// compound payload is patched in once members finish compiling);
    /// anonymous ones by their compound.
    Supercompound(SuperKind, Option<TypeId>, Option<ScopeId>, bool, bool),
    Function(Vec<Param>, Vec<Ret>, bool, bool),
    Superfunction(TypeId, Option<ScopeId>, bool, bool),
    Special(SpecialKind, bool, bool),
}

macro_rules! well_known {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        /// Ids of the types that exist before any user code is seen.
        #[derive(Copy, Clone, Debug)]
        #[allow(non_snake_case)]
        pub struct WellKnown {
            $($(#[$attr])* pub $name: TypeId,)*
        }
    };
}

well_known! {
    U0, U1, U8, U16, U32, U64,
    S8, S16, S32, S64,
    E64, F32, F64, C8, C16, C32,
    TYPE, ANY,
    INFER, GENERIC, GENERIC_UNKNOWN, GENERIC_COMPOUND,
    NOTHING, TYPELESS, NONE,
    NONE_ARRAY, NONE_STRUCT, NONE_TUPLE, NONE_FUNCTION,
    NULL, ERROR_TYPE, ERROR_COMPOUND,
}

/// The process-wide table of interned types.
#[derive(Debug)]
pub struct TypeTable {
    types: Vec<Type>,
    interned: HashMap<TypeKey, TypeId>,
    well_known: WellKnown,
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = Self {
            types: Vec::new(),
            interned: HashMap::new(),
            well_known: WellKnown {
                // Patched immediately below; TypeId(0) is U0 anyway
                U0: TypeId(0), U1: TypeId(0), U8: TypeId(0), U16: TypeId(0),
                U32: TypeId(0), U64: TypeId(0), S8: TypeId(0), S16: TypeId(0),
                S32: TypeId(0), S64: TypeId(0), E64: TypeId(0),
                F32: TypeId(0), F64: TypeId(0), C8: TypeId(0), C16: TypeId(0),
                C32: TypeId(0), TYPE: TypeId(0), ANY: TypeId(0),
                INFER: TypeId(0), GENERIC: TypeId(0),
                GENERIC_UNKNOWN: TypeId(0), GENERIC_COMPOUND: TypeId(0),
                NOTHING: TypeId(0), TYPELESS: TypeId(0), NONE: TypeId(0),
                NONE_ARRAY: TypeId(0), NONE_STRUCT: TypeId(0),
                NONE_TUPLE: TypeId(0), NONE_FUNCTION: TypeId(0),
                NULL: TypeId(0), ERROR_TYPE: TypeId(0),
                ERROR_COMPOUND: TypeId(0),
            },
        };

        use PrimitiveKind::*;
        let wk = WellKnown {
            U0: table_add_primitive(&mut table, Void, 0),
            U1: table_add_primitive(&mut table, Boolean, 1),
            U8: table_add_primitive(&mut table, Unsigned, 8),
            U16: table_add_primitive(&mut table, Unsigned, 16),
            U32: table_add_primitive(&mut table, Unsigned, 32),
            U64: table_add_primitive(&mut table, Unsigned, 64),
            S8: table_add_primitive(&mut table, Signed, 8),
            S16: table_add_primitive(&mut table, Signed, 16),
            S32: table_add_primitive(&mut table, Signed, 32),
            S64: table_add_primitive(&mut table, Signed, 64),
            E64: table_add_primitive(&mut table, Error, 64),
            F32: table_add_primitive(&mut table, Floating, 32),
            F64: table_add_primitive(&mut table, Floating, 64),
            C8: table_add_primitive(&mut table, Character, 8),
            C16: table_add_primitive(&mut table, Character, 16),
            C32: table_add_primitive(&mut table, Character, 32),
            TYPE: table_add_primitive(&mut table, Type, 0),
            ANY: table_add_primitive(&mut table, Any, 0),
            INFER: table_add_special(&mut table, SpecialKind::Infer),
            GENERIC: table_add_special(&mut table, SpecialKind::Generic),
            GENERIC_UNKNOWN: table_add_special(
                &mut table,
                SpecialKind::GenericUnknown,
            ),
            GENERIC_COMPOUND: table_add_special(
                &mut table,
                SpecialKind::GenericCompound,
            ),
            NOTHING: table_add_special(&mut table, SpecialKind::Nothing),
            TYPELESS: table_add_special(&mut table, SpecialKind::Typeless),
            NONE: table_add_special(&mut table, SpecialKind::None),
            NONE_ARRAY: table_add_special(&mut table, SpecialKind::NoneArray),
            NONE_STRUCT: table_add_special(
                &mut table,
                SpecialKind::NoneStruct,
            ),
            NONE_TUPLE: table_add_special(&mut table, SpecialKind::NoneTuple),
            NONE_FUNCTION: table_add_special(
                &mut table,
                SpecialKind::NoneFunction,
            ),
            NULL: table_add_special(&mut table, SpecialKind::Null),
            ERROR_TYPE: table_add_special(&mut table, SpecialKind::ErrorType),
            ERROR_COMPOUND: table_add_special(
                &mut table,
                SpecialKind::ErrorCompound,
            ),
        };
        table.well_known = wk;
        table
    }

    pub fn well_known(&self) -> &WellKnown {
        &self.well_known
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    // ===== Constructors =====
    //
    // All of these intern: adding a structurally identical type returns the
    // pre-existing id.

    fn intern(&mut self, key: TypeKey, kind: TypeKind, flags: (bool, bool)) -> TypeId {
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        let size = immediate_size(&kind);
        self.types.push(Type {
            id,
            kind,
            is_const: flags.0,
            is_volatile: flags.1,
            size,
        });
        self.interned.insert(key, id);
        id
    }

    pub fn pointer_to(&mut self, kind: PointerKind, at: TypeId) -> TypeId {
        self.intern(
            TypeKey::Pointer(kind, at, false, false),
            TypeKind::Pointer { kind, at },
            (false, false),
        )
    }

    pub fn array_of(&mut self, of: TypeId, length: Option<u64>) -> TypeId {
        self.intern(
            TypeKey::Array(of, length, false, false),
            TypeKind::Array { of, length },
            (false, false),
        )
    }

    pub fn add_compound(&mut self, members: Vec<Member>) -> TypeId {
        self.intern(
            TypeKey::Compound(members.clone(), false, false),
            TypeKind::Compound { members },
            (false, false),
        )
    }

    pub fn add_supercompound(
        &mut self,
        kind: SuperKind,
        compound: TypeId,
        scope: Option<ScopeId>,
        generic: bool,
        generated: bool,
    ) -> TypeId {
        let key_compound = match scope {
            Some(_) => None,
            None => Some(compound),
        };
        self.intern(
            TypeKey::Supercompound(kind, key_compound, scope, false, false),
            TypeKind::Supercompound {
                kind,
                compound,
                scope,
                generic,
                generated,
            },
            (false, false),
        )
    }

    /// Patch the compound of a named supercompound once its members have
    /// compiled. Identity is unaffected (named supercompounds are keyed by
    /// scope), and any previously failed sizing will be retried.
    pub fn set_supercompound_compound(&mut self, id: TypeId, new: TypeId) {
        match &mut self.types[id.0 as usize].kind {
            TypeKind::Supercompound { compound, .. } => *compound = new,
            other => {
                panic!("set_supercompound_compound on {:?}", other)
            }
        }
    }

    pub fn add_function(
        &mut self,
        params: Vec<Param>,
        rets: Vec<Ret>,
    ) -> TypeId {
        self.intern(
            TypeKey::Function(params.clone(), rets.clone(), false, false),
            TypeKind::Function { params, rets },
            (false, false),
        )
    }

    pub fn add_superfunction(
        &mut self,
        function: TypeId,
        params: Vec<ParamInfo>,
        ret_names: Vec<String>,
        scope: Option<ScopeId>,
        generic: bool,
        generated: bool,
    ) -> TypeId {
        self.intern(
            TypeKey::Superfunction(function, scope, false, false),
            TypeKind::Superfunction {
                function,
                params,
                ret_names,
                scope,
                generic,
                generated,
            },
            (false, false),
        )
    }

    /// A const- or volatile-qualified version of an existing type.
    pub fn qualified(
        &mut self,
        id: TypeId,
        is_const: bool,
        is_volatile: bool,
    ) -> TypeId {
        let ty = self.get(id);
        if ty.is_const == is_const && ty.is_volatile == is_volatile {
            return id;
        }
        let kind = ty.kind.clone();
        let key = match &kind {
            TypeKind::Primitive { kind, bits } => {
                TypeKey::Primitive(*kind, *bits, is_const, is_volatile)
            }
            TypeKind::Pointer { kind, at } => {
                TypeKey::Pointer(*kind, *at, is_const, is_volatile)
            }
            TypeKind::Array { of, length } => {
                TypeKey::Array(*of, *length, is_const, is_volatile)
            }
            TypeKind::Compound { members } => {
                TypeKey::Compound(members.clone(), is_const, is_volatile)
            }
            TypeKind::Supercompound { kind, compound, scope, .. } => {
                let key_compound = match scope {
                    Some(_) => None,
                    None => Some(*compound),
                };
                TypeKey::Supercompound(
                    *kind, key_compound, *scope, is_const, is_volatile,
                )
            }
            TypeKind::Function { params, rets } => TypeKey::Function(
                params.clone(),
                rets.clone(),
                is_const,
                is_volatile,
            ),
            TypeKind::Superfunction { function, scope, .. } => {
                TypeKey::Superfunction(
                    *function, *scope, is_const, is_volatile,
                )
            }
            TypeKind::Special(kind) => {
                TypeKey::Special(*kind, is_const, is_volatile)
            }
        };
        self.intern(key, kind, (is_const, is_volatile))
    }

    // ===== Sizing =====

    /// Try to compute the size of `id`. Returns true when the size is (or
    /// already was) known. A type whose contained types are not all sized
    /// yet fails and should be retried after other fibers make progress;
    /// a type that contains itself by value can never size and fails on
    /// every attempt (which is how dependency cycles surface).
    pub fn set_size(&mut self, id: TypeId) -> bool {
        let mut visiting = std::collections::HashSet::new();
        self.set_size_inner(id, &mut visiting)
    }

    fn set_size_inner(
        &mut self,
        id: TypeId,
        visiting: &mut std::collections::HashSet<TypeId>,
    ) -> bool {
        if self.get(id).size.is_some() {
            return true;
        }
        // A by-value cycle: this type's size depends on itself
        if !visiting.insert(id) {
            return false;
        }
        let computed = match &self.get(id).kind {
            TypeKind::Compound { members } => {
                let members: Vec<TypeId> =
                    members.iter().map(|m| m.ty).collect();
                self.layout(&members, visiting)
            }
            TypeKind::Supercompound { kind, compound, .. } => {
                let (kind, compound) = (*kind, *compound);
                match kind {
                    SuperKind::Struct | SuperKind::Tuple => {
                        if self.set_size_inner(compound, visiting) {
                            self.get(compound).size
                        } else {
                            None
                        }
                    }
                    SuperKind::Union => {
                        let members = match &self.get(compound).kind {
                            TypeKind::Compound { members } => members.clone(),
                            _ => return false,
                        };
                        let mut max = 0;
                        let mut all_sized = true;
                        for member in &members {
                            match self.sized(member.ty, visiting) {
                                Some(size) => max = max.max(size),
                                None => all_sized = false,
                            }
                        }
                        if all_sized {
                            Some(align_to(max, self.align_of(compound)))
                        } else {
                            None
                        }
                    }
                    // Enums are their discriminant
                    SuperKind::Enum => Some(8),
                }
            }
            TypeKind::Array { of, length } => {
                let (of, length) = (*of, *length);
                match length {
                    Some(n) => {
                        self.sized(of, visiting).map(|size| size * n)
                    }
                    None => Some(FAT_ARRAY_SIZE),
                }
            }
            // Primitives, pointers, functions and specials size eagerly in
            // immediate_size; reaching here means the size is simply unset
            _ => immediate_size(&self.get(id).kind),
        };
        match computed {
            Some(size) => {
                self.types[id.0 as usize].size = Some(size);
                true
            }
            None => false,
        }
    }

    /// Size if already known, attempting to compute it first.
    fn sized(
        &mut self,
        id: TypeId,
        visiting: &mut std::collections::HashSet<TypeId>,
    ) -> Option<u64> {
        self.set_size_inner(id, visiting);
        self.get(id).size
    }

    /// C-style layout of members laid out in order with natural alignment.
    fn layout(
        &mut self,
        members: &[TypeId],
        visiting: &mut std::collections::HashSet<TypeId>,
    ) -> Option<u64> {
        let mut offset = 0u64;
        let mut max_align = 1u64;
        for &member in members {
            let size = self.sized(member, visiting)?;
            let align = self.align_of(member);
            max_align = max_align.max(align);
            offset = align_to(offset, align) + size;
        }
        Some(align_to(offset, max_align))
    }

    /// Natural alignment. Only meaningful once sizes are known; unsized
    /// types get pointer alignment.
    pub fn align_of(&self, id: TypeId) -> u64 {
        match &self.get(id).kind {
            TypeKind::Array { of, .. } => self.align_of(*of),
            TypeKind::Compound { members } => members
                .iter()
                .map(|m| self.align_of(m.ty))
                .max()
                .unwrap_or(1),
            TypeKind::Supercompound { compound, .. } => {
                self.align_of(*compound)
            }
            _ => match self.get(id).size {
                Some(0) | None => 1,
                Some(size) => size.min(PTR_SIZE).next_power_of_two(),
            },
        }
    }

    // ===== Display =====

    /// Human-readable spelling, used in diagnostics.
    pub fn to_string(&self, id: TypeId) -> String {
        let ty = self.get(id);
        let mut out = String::new();
        if ty.is_const {
            out.push_str("const ");
        }
        if ty.is_volatile {
            out.push_str("volat ");
        }
        match &ty.kind {
            TypeKind::Primitive { kind, bits } => {
                let name = match kind {
                    PrimitiveKind::Signed => format!("s{}", bits),
                    PrimitiveKind::Unsigned => format!("u{}", bits),
                    PrimitiveKind::Boolean => "u1".into(),
                    PrimitiveKind::Floating => format!("f{}", bits),
                    PrimitiveKind::Character => format!("c{}", bits),
                    PrimitiveKind::Error => "e64".into(),
                    PrimitiveKind::Type => "type".into(),
                    PrimitiveKind::Any => "any".into(),
                    PrimitiveKind::Void => "u0".into(),
                };
                out.push_str(&name);
            }
            TypeKind::Pointer { kind, at } => {
                out.push_str(&self.to_string(*at));
                out.push(match kind {
                    PointerKind::Naked => '*',
                    PointerKind::Unique => '!',
                    PointerKind::Shared => '+',
                    PointerKind::Weak => '?',
                });
            }
            TypeKind::Array { of, length } => {
                out.push_str(&self.to_string(*of));
                match length {
                    Some(n) => {
                        let _ = write!(out, "[{}]", n);
                    }
                    None => out.push_str("[]"),
                }
            }
            TypeKind::Compound { members } => {
                out.push('(');
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.to_string(member.ty));
                }
                out.push(')');
            }
            TypeKind::Supercompound { kind, compound, .. } => {
                out.push_str(match kind {
                    SuperKind::Struct => "struct ",
                    SuperKind::Union => "union ",
                    SuperKind::Enum => "enum ",
                    SuperKind::Tuple => "tuple ",
                });
                out.push_str(&self.to_string(*compound));
            }
            TypeKind::Function { params, rets } => {
                out.push_str("fun(");
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.to_string(param.ty));
                }
                out.push_str(") -> ");
                for (i, ret) in rets.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.to_string(ret.ty));
                }
            }
            TypeKind::Superfunction { function, .. } => {
                out.push_str(&self.to_string(*function));
            }
            TypeKind::Special(kind) => {
                let name = match kind {
                    SpecialKind::Infer => "infer",
                    SpecialKind::Generic => "<generic>",
                    SpecialKind::GenericUnknown => "<generic?>",
                    SpecialKind::GenericCompound => "<generic...>",
                    SpecialKind::Nothing => "---",
                    SpecialKind::Typeless => "<typeless>",
                    SpecialKind::None => "<none>",
                    SpecialKind::NoneArray => "<none[]>",
                    SpecialKind::NoneStruct => "<none struct>",
                    SpecialKind::NoneTuple => "<none tuple>",
                    SpecialKind::NoneFunction => "<none fun>",
                    SpecialKind::Null => "null",
                    SpecialKind::ErrorType => "<error>",
                    SpecialKind::ErrorCompound => "<error...>",
                };
                out.push_str(name);
            }
        }
        out
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn table_add_primitive(
    table: &mut TypeTable,
    kind: PrimitiveKind,
    bits: u16,
) -> TypeId {
    table.intern(
        TypeKey::Primitive(kind, bits, false, false),
        TypeKind::Primitive { kind, bits },
        (false, false),
    )
}

fn table_add_special(table: &mut TypeTable, kind: SpecialKind) -> TypeId {
    table.intern(
        TypeKey::Special(kind, false, false),
        TypeKind::Special(kind),
        (false, false),
    )
}

/// Sizes that never depend on other types and are known on construction.
fn immediate_size(kind: &TypeKind) -> Option<u64> {
    match kind {
        TypeKind::Primitive { bits, .. } => Some(u64::from(bits + 7) / 8),
        TypeKind::Pointer { .. } => Some(PTR_SIZE),
        TypeKind::Function { .. } | TypeKind::Superfunction { .. } => {
            Some(PTR_SIZE)
        }
        // Error types must not block dependents; everything else special
        // has no size until resolved
        TypeKind::Special(SpecialKind::ErrorType)
        | TypeKind::Special(SpecialKind::ErrorCompound) => Some(0),
        _ => None,
    }
}

fn align_to(offset: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_idempotent() {
        let mut tt = TypeTable::new();
        let s32 = tt.well_known().S32;
        let p1 = tt.pointer_to(PointerKind::Naked, s32);
        let p2 = tt.pointer_to(PointerKind::Naked, s32);
        assert_eq!(p1, p2);

        let a1 = tt.array_of(p1, Some(4));
        let a2 = tt.array_of(p2, Some(4));
        assert_eq!(a1, a2);
        assert_ne!(a1, tt.array_of(p1, Some(5)));
        assert_ne!(a1, tt.array_of(p1, None));
    }

    #[test]
    fn test_function_interning_ignores_names() {
        let mut tt = TypeTable::new();
        let s32 = tt.well_known().S32;
        let u0 = tt.well_known().U0;
        let f1 = tt.add_function(
            vec![Param::plain(s32), Param::plain(s32)],
            vec![Ret::plain(u0)],
        );
        let f2 = tt.add_function(
            vec![Param::plain(s32), Param::plain(s32)],
            vec![Ret::plain(u0)],
        );
        assert_eq!(f1, f2);
    }

    #[test]
    fn test_struct_layout() {
        // struct { s32; ptr } sizes to 16 after alignment
        let mut tt = TypeTable::new();
        let s32 = tt.well_known().S32;
        let ptr = tt.pointer_to(PointerKind::Naked, s32);
        let compound = tt.add_compound(vec![
            Member { ty: s32, compiletime: false, reference: false },
            Member { ty: ptr, compiletime: false, reference: false },
        ]);
        let st = tt.add_supercompound(
            SuperKind::Struct,
            compound,
            None,
            false,
            false,
        );
        assert!(tt.set_size(st));
        assert_eq!(tt.get(st).size, Some(12 + 4));
    }

    #[test]
    fn test_union_size_is_max() {
        let mut tt = TypeTable::new();
        let s64 = tt.well_known().S64;
        let u8t = tt.well_known().U8;
        let compound = tt.add_compound(vec![
            Member { ty: u8t, compiletime: false, reference: false },
            Member { ty: s64, compiletime: false, reference: false },
        ]);
        let un = tt.add_supercompound(
            SuperKind::Union,
            compound,
            None,
            false,
            false,
        );
        assert!(tt.set_size(un));
        assert_eq!(tt.get(un).size, Some(8));
    }

    #[test]
    fn test_recursive_by_value_never_sizes() {
        use crate::symbol::ScopeId;
        let mut tt = TypeTable::new();
        let placeholder = tt.well_known().NONE;
        let a = tt.add_supercompound(
            SuperKind::Struct,
            placeholder,
            Some(ScopeId(0)),
            false,
            false,
        );
        let b = tt.add_supercompound(
            SuperKind::Struct,
            placeholder,
            Some(ScopeId(1)),
            false,
            false,
        );
        let member = |ty| Member {
            ty,
            compiletime: false,
            reference: false,
        };
        let compound_a = tt.add_compound(vec![member(b)]);
        let compound_b = tt.add_compound(vec![member(a)]);
        tt.set_supercompound_compound(a, compound_a);
        tt.set_supercompound_compound(b, compound_b);
        // The by-value cycle can never size, but asking must terminate
        assert!(!tt.set_size(a));
        assert!(!tt.set_size(b));
        assert_eq!(tt.get(a).size, None);
    }

    #[test]
    fn test_sizing_blocks_on_unsized_member() {
        let mut tt = TypeTable::new();
        let infer = tt.well_known().INFER;
        let compound = tt.add_compound(vec![Member {
            ty: infer,
            compiletime: false,
            reference: false,
        }]);
        assert!(!tt.set_size(compound));
        assert_eq!(tt.get(compound).size, None);
    }

    #[test]
    fn test_to_string() {
        let mut tt = TypeTable::new();
        let s32 = tt.well_known().S32;
        let ptr = tt.pointer_to(PointerKind::Weak, s32);
        let arr = tt.array_of(ptr, None);
        assert_eq!(tt.to_string(arr), "s32?[]");
    }
}
