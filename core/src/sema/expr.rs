//! Expression, type-expression and conversion checking for the semantic
//! phase. Everything here is `impl Sema`; the statement-level driver lives
//! in the parent module.
//!
//! The ERROR_TYPE discipline: any operand that already failed produces
//! ERROR_TYPE, and every rule here treats ERROR_TYPE as compatible with
//! everything without emitting further diagnostics, so one broken
//! expression reports exactly once.

use super::{const_eval, Sema, StmtCtx};
use crate::ast::{AstId, AstKind};
use crate::error::CompileError;
use crate::grammar::Symbol;
use crate::sema::fiber::Progress;
use crate::symbol::{Lookup, OwnerKind, SymbolId, SymbolKind};
use crate::ty::{
    Member, Param, PointerKind, PrimitiveKind, Ret, SpecialKind, TypeId,
    TypeKind,
};

impl<'a> Sema<'a> {
    // ===== Expressions =====

    pub(super) fn compile_expr(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        if self.ast.get(node).compiled.is_some() {
            return Ok(self.ast.get(node).ty);
        }
        match self.ast.get(node).kind.clone() {
            AstKind::None => Ok(self.ast.get(node).ty),
            AstKind::Value { .. } => {
                self.ast.get_mut(node).compiletime = true;
                let ty = self.ast.get(node).ty;
                Ok(self.finish(node, ty))
            }
            AstKind::String { bytes } => {
                // The literal's array type is interned here; the optional
                // prefix (`c`, `u8`, `u16`, `u32`) lives on the token
                let wk = self.wk();
                let text = self.token_text(node);
                let elem = match text.split('"').next().unwrap_or("") {
                    "u8" => wk.U8,
                    "u16" => wk.C16,
                    "u32" => wk.C32,
                    _ => wk.C8,
                };
                let length = if elem == wk.C16 || elem == wk.C32 {
                    String::from_utf8_lossy(&bytes).chars().count() as u64
                } else {
                    bytes.len() as u64
                };
                let ty = self.types.array_of(elem, Some(length));
                self.ast.get_mut(node).compiletime = true;
                Ok(self.finish(node, ty))
            }
            AstKind::Type { .. } => {
                self.ast.get_mut(node).compiletime = true;
                let type_ty = self.wk().TYPE;
                Ok(self.finish(node, type_ty))
            }
            AstKind::Zero { sym } => match sym {
                Symbol::KwThis => {
                    match self
                        .symbols
                        .get(ctx.scope, "this", true, OwnerKind::Function)
                        .found()
                    {
                        Some(this) => {
                            let ty =
                                self.symbols.symbol(this).ty().unwrap();
                            self.ast.get_mut(node).kind =
                                AstKind::Identifier { sym: Some(this) };
                            Ok(self.finish(node, ty))
                        }
                        None => Ok(self.poison(node, CompileError::Undeclared)),
                    }
                }
                _ => {
                    let typeless = self.wk().TYPELESS;
                    Ok(self.finish(node, typeless))
                }
            },
            AstKind::Identifier { .. } => self.compile_identifier(node, ctx),
            AstKind::Compound { elems } => {
                self.compile_compound_expr(node, elems, ctx)
            }
            AstKind::Block { .. } => {
                // Blocks in expression position have no value
                let typeless = self.wk().TYPELESS;
                Ok(self.finish(node, typeless))
            }
            AstKind::Unary { sym, node: operand, post } => {
                self.compile_unary(node, sym, operand, post, ctx)
            }
            AstKind::Binary { sym, left, right } => {
                self.compile_binary(node, sym, left, right, ctx)
            }
        }
    }

    fn compile_identifier(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        let sym = match self.ast.get(node).kind {
            AstKind::Identifier { sym: Some(sym) } => sym,
            _ => {
                let name = self.token_text(node);
                match self.symbols.get(ctx.scope, &name, true, OwnerKind::Free)
                {
                    Lookup::Found(sym) => sym,
                    Lookup::Ambiguous => {
                        return Ok(self.poison(
                            node,
                            CompileError::AmbiguousUsing { name },
                        ))
                    }
                    Lookup::NotFound => {
                        return Ok(
                            self.poison(node, CompileError::Undeclared)
                        )
                    }
                }
            }
        };
        let (ty, compiletime) = self.symbol_value_type(sym)?;
        self.ast.get_mut(node).kind = AstKind::Identifier { sym: Some(sym) };
        self.ast.get_mut(node).compiletime = compiletime;
        Ok(self.finish(node, ty))
    }

    /// The type an identifier expression gets from the symbol it resolved
    /// to. Stalls until the symbol's own fiber has done enough work.
    fn symbol_value_type(
        &mut self,
        sym: SymbolId,
    ) -> Progress<(TypeId, bool)> {
        match &self.symbols.symbol(sym).kind {
            SymbolKind::Variable {
                ty, compiletime, defined, ..
            } => {
                let (ty, compiletime, defined) =
                    (*ty, *compiletime, *defined);
                if !defined {
                    self.define_wait(sym)?;
                }
                Ok((ty, compiletime))
            }
            SymbolKind::Type { .. } => {
                // A named type used as a value has type `type`
                Ok((self.wk().TYPE, true))
            }
            SymbolKind::Function { .. } => {
                self.define_wait(sym)?;
                match &self.symbols.symbol(sym).kind {
                    SymbolKind::Function { overloads, .. } => Ok((
                        overloads
                            .first()
                            .map(|o| o.ty)
                            .unwrap_or(self.wk().NONE_FUNCTION),
                        true,
                    )),
                    _ => unreachable!(),
                }
            }
            SymbolKind::Field { index, parent } => {
                // Bare enum members inside their own scope
                let (_, parent) = (*index, *parent);
                Ok((parent, true))
            }
            SymbolKind::OverloadRef { function, index } => {
                let (function, index) = (*function, *index);
                match &self.symbols.symbol(function).kind {
                    SymbolKind::Function { overloads, .. } => {
                        Ok((overloads[index].ty, true))
                    }
                    _ => unreachable!(),
                }
            }
            SymbolKind::Namespace { .. } | SymbolKind::Module { .. } => {
                Ok((self.wk().TYPELESS, true))
            }
            SymbolKind::Label => Ok((self.wk().TYPELESS, false)),
        }
    }

    /// Literal compounds: `'[..]`, `'{..}`, `'(..)` and bare parenthesized
    /// lists. The parser tagged the node with the matching NONE_* type.
    fn compile_compound_expr(
        &mut self,
        node: AstId,
        elems: Vec<AstId>,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        // Function definitions share the COMPOUND shape; route them away
        if self.ast.get(node).ty == self.wk().NONE_FUNCTION {
            return self.compile_fn_type_expr(node, ctx);
        }
        let mut tys = Vec::new();
        for &elem in &elems {
            tys.push(self.compile_expr(elem, ctx)?);
        }
        let tag = self.ast.get(node).ty;
        let ty = if tag == self.wk().NONE_ARRAY {
            // All elements weak-convert to the first's type
            let elem_ty = tys.first().copied().unwrap_or(self.wk().NONE);
            for (i, &ty) in tys.iter().enumerate().skip(1) {
                if !self.weak_convertible(ty, elem_ty, Some(elems[i])) {
                    let from = self.types.to_string(ty);
                    let to = self.types.to_string(elem_ty);
                    self.error_node(
                        elems[i],
                        CompileError::TypeMismatch { from, to },
                    );
                }
            }
            self.types.array_of(elem_ty, Some(tys.len() as u64))
        } else {
            let members = tys
                .iter()
                .map(|&ty| Member {
                    ty,
                    compiletime: false,
                    reference: false,
                })
                .collect();
            self.types.add_compound(members)
        };
        Ok(self.finish(node, ty))
    }

    /// `fun(...) -> ...` in expression or type position. With a body this
    /// would be a closure literal, which this compiler does not support;
    /// without one it is a function type value.
    fn compile_fn_type_expr(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        let elems = match &self.ast.get(node).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => unreachable!(),
        };
        let body = elems[3];
        if !self.ast.get(body).is_none() {
            return Ok(self.poison(node, CompileError::CapturedClosure));
        }
        let ty = self.fn_signature_type(elems[2], ctx)?;
        self.ast.get_mut(node).kind = AstKind::Type { ty };
        self.ast.get_mut(node).compiletime = true;
        let type_ty = self.wk().TYPE;
        Ok(self.finish(node, type_ty))
    }

    /// Build the FUNCTION type named by a bodiless signature.
    fn fn_signature_type(
        &mut self,
        signature: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        let (_, param_list, rets_node) = self.ast.binary(signature);
        let param_nodes = match &self.ast.get(param_list).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => Vec::new(),
        };
        let mut params = Vec::new();
        for param_node in param_nodes {
            let (declarator, _, typed) = self.ast.binary(param_node);
            let (colon, ty_ast, spread) = self.ast.binary(typed);
            let ty = self.compile_type_node(ty_ast, ctx)?;
            let mut param = Param::plain(ty);
            param.compiletime = declarator == Symbol::KwLet;
            param.reference = declarator == Symbol::KwRef;
            param.binding = colon == Symbol::DColon;
            param.spread = !self.ast.get(spread).is_none();
            params.push(param);
        }
        let (_, rets_inner, _) = self.ast.unary(rets_node);
        let mut rets = Vec::new();
        match self.ast.get(rets_inner).kind.clone() {
            AstKind::Type { ty } => rets.push(Ret::plain(ty)),
            AstKind::Compound { elems } => {
                for ret_node in elems {
                    let (_, _, ty_ast) = self.ast.binary(ret_node);
                    let ty = self.compile_type_node(ty_ast, ctx)?;
                    rets.push(Ret::plain(ty));
                }
            }
            _ => {}
        }
        Ok(self.types.add_function(params, rets))
    }

    fn compile_unary(
        &mut self,
        node: AstId,
        sym: Symbol,
        operand: AstId,
        post: bool,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        // Type constructors applied postfix (`T*`) or as qualifiers
        if (post
            && matches!(
                sym,
                Symbol::Mul | Symbol::Not | Symbol::Add | Symbol::WeakPtr
            ))
            || matches!(sym, Symbol::KwConst | Symbol::KwVolat)
        {
            let ty = self.compile_type_node(node, ctx)?;
            self.ast.get_mut(node).kind = AstKind::Type { ty };
            self.ast.get_mut(node).compiletime = true;
            let type_ty = self.wk().TYPE;
            return Ok(self.finish(node, type_ty));
        }

        let oty = self.compile_expr(operand, ctx)?;
        if self.types.get(oty).is_error() {
            let error_ty = self.wk().ERROR_TYPE;
            return Ok(self.finish(node, error_ty));
        }
        if self.is_generic(oty) {
            let unknown = self.wk().GENERIC_UNKNOWN;
            return Ok(self.finish(node, unknown));
        }

        let illegal = |sema: &mut Self, node: AstId| {
            let ty = sema.types.to_string(oty);
            sema.poison(
                node,
                CompileError::IllegalOperator {
                    op: sym.text().into(),
                    ty,
                },
            )
        };

        let result = match sym {
            Symbol::Sub => {
                if self.is_numeric(oty) {
                    self.signed_of(oty)
                } else {
                    return Ok(illegal(self, node));
                }
            }
            Symbol::Add => {
                // If the operand is a type value this is a shared-pointer
                // constructor; on numbers it is a no-op
                if oty == self.wk().TYPE {
                    return self.retype_as_pointer(
                        node,
                        operand,
                        PointerKind::Shared,
                        ctx,
                    );
                } else if self.is_numeric(oty) {
                    oty
                } else {
                    return Ok(illegal(self, node));
                }
            }
            Symbol::Decrement => {
                if self.is_numeric(oty) {
                    oty
                } else {
                    return Ok(illegal(self, node));
                }
            }
            Symbol::Not => {
                if oty == self.wk().TYPE {
                    return self.retype_as_pointer(
                        node,
                        operand,
                        PointerKind::Unique,
                        ctx,
                    );
                } else if self.is_integer(oty) {
                    oty
                } else if self.is_truthy(oty) {
                    self.wk().U1
                } else {
                    return Ok(illegal(self, node));
                }
            }
            Symbol::Lnot => {
                if self.is_truthy(oty) {
                    self.wk().U1
                } else {
                    return Ok(illegal(self, node));
                }
            }
            Symbol::At => match self.pointee(oty) {
                Some(inner) => inner,
                None => return Ok(illegal(self, node)),
            },
            Symbol::Mul => {
                if oty == self.wk().TYPE {
                    return self.retype_as_pointer(
                        node,
                        operand,
                        PointerKind::Naked,
                        ctx,
                    );
                }
                self.types.pointer_to(PointerKind::Naked, oty)
            }
            Symbol::WeakPtr => {
                if oty == self.wk().TYPE {
                    return self.retype_as_pointer(
                        node,
                        operand,
                        PointerKind::Weak,
                        ctx,
                    );
                }
                return Ok(illegal(self, node));
            }
            Symbol::Spread => match self.ast.get(operand).ty {
                ty if self.element_type(ty).is_some() => {
                    self.wk().GENERIC_COMPOUND
                }
                _ => return Ok(illegal(self, node)),
            },
            Symbol::KwSizeof => {
                let target = self.type_of_operand(operand, ctx)?;
                self.size_wait(target)?;
                let size = self.types.get(target).size.unwrap_or(0);
                let token = self.ast.get(node).token;
                let u64_ty = self.wk().U64;
                let value = self.ast.make_value(size, token, u64_ty);
                self.ast.get_mut(value).compiled = Some(value);
                self.ast.get_mut(value).compiletime = true;
                self.ast.get_mut(node).compiled = Some(value);
                self.ast.get_mut(node).ty = u64_ty;
                self.ast.get_mut(node).compiletime = true;
                return Ok(u64_ty);
            }
            Symbol::KwTypeof => {
                let token = self.ast.get(node).token;
                let type_ty = self.wk().TYPE;
                let replacement = self.ast.make_type(oty, token, type_ty);
                self.ast.get_mut(replacement).compiled = Some(replacement);
                self.ast.get_mut(replacement).compiletime = true;
                self.ast.get_mut(node).compiled = Some(replacement);
                self.ast.get_mut(node).ty = type_ty;
                self.ast.get_mut(node).compiletime = true;
                return Ok(type_ty);
            }
            Symbol::KwTypeinfo => {
                let target = self.type_of_operand(operand, ctx)?;
                let token = self.ast.get(node).token;
                let u64_ty = self.wk().U64;
                let value =
                    self.ast.make_value(u64::from(target.0), token, u64_ty);
                self.ast.get_mut(value).compiled = Some(value);
                self.ast.get_mut(node).compiled = Some(value);
                self.ast.get_mut(node).ty = u64_ty;
                return Ok(u64_ty);
            }
            _ => return Ok(illegal(self, node)),
        };
        let _ = post;
        Ok(self.finish(node, result))
    }

    /// Rebuild a unary pointer-marker expression as the pointer type it
    /// denotes (`T*`, `T!`, `T+`, `T?` used as values).
    fn retype_as_pointer(
        &mut self,
        node: AstId,
        operand: AstId,
        kind: PointerKind,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        let inner = self.type_of_operand(operand, ctx)?;
        let ty = self.types.pointer_to(kind, inner);
        self.ast.get_mut(node).kind = AstKind::Type { ty };
        self.ast.get_mut(node).compiletime = true;
        let type_ty = self.wk().TYPE;
        Ok(self.finish(node, type_ty))
    }

    /// The type denoted by an already-compiled operand: either the type
    /// value it names (`sizeof(u32)`, `sizeof(list)`) or, for plain
    /// values, the value's own type (`sizeof(x)`).
    fn type_of_operand(
        &mut self,
        operand: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        let oty = self.compile_expr(operand, ctx)?;
        if oty != self.wk().TYPE {
            return Ok(oty);
        }
        match self.ast.get(operand).kind.clone() {
            AstKind::Type { ty } => Ok(ty),
            AstKind::Identifier { sym: Some(sym) } => {
                match self.symbols.symbol(sym).kind {
                    SymbolKind::Type { ty, .. } => Ok(ty),
                    _ => self.compile_type_node(operand, ctx),
                }
            }
            _ => self.compile_type_node(operand, ctx),
        }
    }

    fn compile_binary(
        &mut self,
        node: AstId,
        sym: Symbol,
        left: AstId,
        right: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        match sym {
            Symbol::Period => {
                return self.compile_dot(node, left, right, ctx)
            }
            Symbol::OParen => {
                return self.compile_call(node, left, right, ctx)
            }
            Symbol::DColon => {
                // Generic selection: the arguments are compile-time
                // values, the result keeps the base's identity
                let base = self.compile_expr(left, ctx)?;
                if let AstKind::Compound { elems } =
                    self.ast.get(right).kind.clone()
                {
                    for arg in elems {
                        self.compile_expr(arg, ctx)?;
                    }
                }
                self.ast.get_mut(right).compiled = Some(right);
                return Ok(self.finish(node, base));
            }
            Symbol::DQuestion => {
                let cond_ty = self.compile_expr(left, ctx)?;
                if !self.is_truthy(cond_ty) {
                    let from = self.types.to_string(cond_ty);
                    self.error_node(
                        left,
                        CompileError::TypeMismatch {
                            from,
                            to: "u1".into(),
                        },
                    );
                }
                let (_, then, orelse) = self.ast.binary(right);
                let then_ty = self.compile_expr(then, ctx)?;
                let else_ty = self.compile_expr(orelse, ctx)?;
                let result = if self
                    .weak_convertible(else_ty, then_ty, Some(orelse))
                {
                    then_ty
                } else if self.weak_convertible(then_ty, else_ty, Some(then))
                {
                    else_ty
                } else {
                    let from = self.types.to_string(else_ty);
                    let to = self.types.to_string(then_ty);
                    self.error_node(
                        orelse,
                        CompileError::TypeMismatch { from, to },
                    );
                    self.wk().ERROR_TYPE
                };
                self.ast.get_mut(right).compiled = Some(right);
                return Ok(self.finish(node, result));
            }
            Symbol::KwNew => {
                let (_, ty_ast, count) = self.ast.binary(right);
                let target = self.compile_type_node(ty_ast, ctx)?;
                let count_ty = self.compile_expr(count, ctx)?;
                if !self.is_integer(count_ty)
                    && !self.types.get(count_ty).is_error()
                {
                    let from = self.types.to_string(count_ty);
                    self.error_node(
                        count,
                        CompileError::TypeMismatch {
                            from,
                            to: "u64".into(),
                        },
                    );
                }
                if !self.ast.get(left).is_none() {
                    let init_ty = self.compile_expr(left, ctx)?;
                    if !self.weak_convertible(init_ty, target, Some(left)) {
                        let from = self.types.to_string(init_ty);
                        let to = self.types.to_string(target);
                        self.error_node(
                            left,
                            CompileError::TypeMismatch { from, to },
                        );
                    }
                } else {
                    self.ast.get_mut(left).compiled = Some(left);
                }
                self.ast.get_mut(right).compiled = Some(right);
                let ty = self.types.pointer_to(PointerKind::Naked, target);
                return Ok(self.finish(node, ty));
            }
            Symbol::KwAs => {
                let from = self.compile_expr(left, ctx)?;
                let to = self.compile_type_node(right, ctx)?;
                if !self.strong_convertible(from, to) {
                    let from = self.types.to_string(from);
                    let to_str = self.types.to_string(to);
                    self.error_node(
                        node,
                        CompileError::TypeMismatch { from, to: to_str },
                    );
                    let error_ty = self.wk().ERROR_TYPE;
                    return Ok(self.finish(node, error_ty));
                }
                return Ok(self.finish(node, to));
            }
            Symbol::OBrack => {
                let lty = self.compile_expr(left, ctx)?;
                let rty = self.compile_expr(right, ctx)?;
                // `iden[...]` may also be a sized-array type expression
                if lty == self.wk().TYPE {
                    let ty = self.compile_type_node(node, ctx)?;
                    self.ast.get_mut(node).kind = AstKind::Type { ty };
                    self.ast.get_mut(node).compiletime = true;
                    let type_ty = self.wk().TYPE;
                    return Ok(self.finish(node, type_ty));
                }
                if !self.is_integer(rty) && !self.types.get(rty).is_error() {
                    let from = self.types.to_string(rty);
                    self.error_node(
                        right,
                        CompileError::TypeMismatch {
                            from,
                            to: "u64".into(),
                        },
                    );
                }
                let result = match self.element_type(lty) {
                    Some(elem) => elem,
                    None if self.types.get(lty).is_error() => lty,
                    None => {
                        let ty = self.types.to_string(lty);
                        return Ok(self.poison(
                            node,
                            CompileError::IllegalOperator {
                                op: "[]".into(),
                                ty,
                            },
                        ));
                    }
                };
                return Ok(self.finish(node, result));
            }
            sym if sym == Symbol::Assign || sym.assign_op().is_some() => {
                self.compile_assign(node, sym, left, right, ctx)?;
                let u0 = self.wk().U0;
                return Ok(u0);
            }
            _ => {}
        }

        // Ordinary arithmetic, bitwise, comparison and logic operators
        let lty = self.compile_expr(left, ctx)?;
        let rty = self.compile_expr(right, ctx)?;
        let result =
            self.operator_result_at(node, sym, lty, rty, Some(left), Some(right));
        Ok(self.finish(node, result))
    }

    /// Assignment and compound assignment, shared by the statement and
    /// expression paths. Both sides are compound lists; a single call
    /// producing multiple values satisfies multiple targets.
    pub(super) fn compile_assign(
        &mut self,
        node: AstId,
        sym: Symbol,
        lefts: AstId,
        rights: AstId,
        ctx: StmtCtx,
    ) -> Progress<()> {
        if self.ast.get(node).compiled.is_some() {
            return Ok(());
        }
        let right_elems = match &self.ast.get(rights).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![rights],
        };
        let mut value_tys: Vec<(TypeId, Option<AstId>)> = Vec::new();
        for &value in &right_elems {
            let ty = self.compile_expr(value, ctx)?;
            match self.compound_members(ty) {
                Some(members) if right_elems.len() == 1 => {
                    for member in members {
                        value_tys.push((member, None));
                    }
                }
                _ => value_tys.push((ty, Some(value))),
            }
        }

        let left_elems = match &self.ast.get(lefts).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![lefts],
        };
        if left_elems.len() != value_tys.len() {
            self.error_node(
                node,
                CompileError::ValueCountMismatch {
                    expected: left_elems.len(),
                    found: value_tys.len(),
                },
            );
        }

        for (i, &target) in left_elems.iter().enumerate() {
            let target_ty = self.compile_expr(target, ctx)?;
            if !self.is_lvalue(target) {
                self.error_node(
                    target,
                    CompileError::Expected {
                        expected: "an assignable expression".into(),
                    },
                );
                continue;
            }
            let (value_ty, value_node) = match value_tys.get(i) {
                Some(&(ty, node)) => (ty, node),
                None => continue,
            };
            if let Some(op) = sym.assign_op() {
                // `a op= b` checks like `a op b`
                self.operator_result_at(
                    node, op, target_ty, value_ty, None, value_node,
                );
            } else if !self.weak_convertible(value_ty, target_ty, value_node)
            {
                let from = self.types.to_string(value_ty);
                let to = self.types.to_string(target_ty);
                self.error_node(
                    value_node.unwrap_or(target),
                    CompileError::TypeMismatch { from, to },
                );
            }
        }
        let u0 = self.wk().U0;
        self.ast.get_mut(lefts).compiled = Some(lefts);
        self.ast.get_mut(rights).compiled = Some(rights);
        self.finish(node, u0);
        Ok(())
    }

    fn is_lvalue(&self, node: AstId) -> bool {
        match &self.ast.get(node).kind {
            AstKind::Identifier { .. } => true,
            AstKind::Binary { sym, .. } => {
                matches!(sym, Symbol::OBrack | Symbol::Period)
            }
            AstKind::Unary { sym, post, .. } => {
                *sym == Symbol::At && !post
            }
            _ => false,
        }
    }

    /// Dotted access. For each link: resolve through namespaces/modules,
    /// then through the left side's type (auto-dereferencing pointers),
    /// looking the name up in the type's own scope.
    fn compile_dot(
        &mut self,
        node: AstId,
        left: AstId,
        right: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        if matches!(
            self.ast.get(right).kind,
            AstKind::Zero { sym: Symbol::Mul }
        ) {
            // `.*` globs are only meaningful under `using`
            return Ok(self.poison(node, CompileError::InvalidStatement));
        }

        let lty = self.compile_expr(left, ctx)?;

        // Scope-bearing symbols resolve the right side by name. A type
        // whose members are still being compiled by another fiber stalls
        // rather than reporting a missing member prematurely.
        let left_scope = match self.ast.get(left).kind {
            AstKind::Identifier { sym: Some(sym) } => {
                match self.symbols.symbol(sym).kind {
                    SymbolKind::Namespace { scope }
                    | SymbolKind::Module { scope } => Some(scope),
                    SymbolKind::Type { scope, .. } => {
                        self.define_wait(sym)?;
                        scope
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        let scope = match left_scope {
            Some(scope) => Some(scope),
            None => {
                // Through the value's type, auto-dereferencing
                let mut ty = lty;
                while let Some(inner) = self.pointee(ty) {
                    ty = inner;
                }
                if self.types.get(ty).is_error() {
                    let error_ty = self.wk().ERROR_TYPE;
                    return Ok(self.finish(node, error_ty));
                }
                if !self.supercompound_ready(ty) {
                    return Err(crate::sema::fiber::Stall::Size(ty));
                }
                match &self.types.get(ty).kind {
                    TypeKind::Supercompound { scope, .. } => *scope,
                    _ => None,
                }
            }
        };

        let scope = match scope {
            Some(scope) => scope,
            None => {
                let ty = self.types.to_string(lty);
                return Ok(self.poison(
                    node,
                    CompileError::IllegalOperator { op: ".".into(), ty },
                ));
            }
        };

        // A call on the right side binds the left side as `this`
        if let AstKind::Binary {
            sym: Symbol::OParen,
            left: callee,
            right: args,
        } = self.ast.get(right).kind.clone()
        {
            let member = self.resolve_member(callee, scope, ctx)?;
            let result =
                self.check_call(right, callee, args, member, ctx, true)?;
            self.finish(right, result);
            return Ok(self.finish(node, result));
        }

        let member_ty = self.resolve_member(right, scope, ctx)?;
        Ok(self.finish(node, member_ty))
    }

    /// Resolve a member-name node inside a scope, filling in its symbol.
    fn resolve_member(
        &mut self,
        name_node: AstId,
        scope: crate::symbol::ScopeId,
        _ctx: StmtCtx,
    ) -> Progress<TypeId> {
        if self.ast.get(name_node).compiled.is_some() {
            return Ok(self.ast.get(name_node).ty);
        }
        let name = self.token_text(name_node);
        let sym = match self.symbols.get(scope, &name, false, OwnerKind::Free)
        {
            Lookup::Found(sym) => sym,
            Lookup::Ambiguous => {
                return Ok(self
                    .poison(name_node, CompileError::AmbiguousUsing { name }))
            }
            Lookup::NotFound => {
                return Ok(self.poison(name_node, CompileError::Undeclared))
            }
        };
        let ty = match self.symbols.symbol(sym).kind.clone() {
            SymbolKind::Field { index, parent } => {
                match &self.types.get(parent).kind {
                    TypeKind::Supercompound {
                        kind: crate::ty::SuperKind::Enum,
                        ..
                    } => parent,
                    TypeKind::Supercompound { compound, .. } => {
                        match &self.types.get(*compound).kind {
                            TypeKind::Compound { members } => members
                                .get(index as usize)
                                .map(|m| m.ty)
                                .unwrap_or(self.wk().ERROR_TYPE),
                            _ => self.wk().ERROR_TYPE,
                        }
                    }
                    _ => self.wk().ERROR_TYPE,
                }
            }
            SymbolKind::Function { .. } => {
                self.define_wait(sym)?;
                match &self.symbols.symbol(sym).kind {
                    SymbolKind::Function { overloads, .. } => overloads
                        .first()
                        .map(|o| o.ty)
                        .unwrap_or(self.wk().NONE_FUNCTION),
                    _ => unreachable!(),
                }
            }
            SymbolKind::Variable { ty, defined, .. } => {
                if !defined {
                    self.define_wait(sym)?;
                }
                ty
            }
            SymbolKind::Type { .. } => self.wk().TYPE,
            _ => self.wk().TYPELESS,
        };
        self.ast.get_mut(name_node).kind =
            AstKind::Identifier { sym: Some(sym) };
        Ok(self.finish(name_node, ty))
    }

    /// Function calls. Resolves the callee, selects an overload when the
    /// callee is a named function, and type-checks the arguments. Method
    /// calls never reach here: the parser nests the call inside the dot,
    /// so [Sema::compile_dot] handles receiver binding.
    fn compile_call(
        &mut self,
        node: AstId,
        callee: AstId,
        args: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        let callee_ty = self.compile_expr(callee, ctx)?;
        let result =
            self.check_call(node, callee, args, callee_ty, ctx, false)?;
        Ok(self.finish(node, result))
    }

    /// Check one call against a callable. When the callee names a function
    /// symbol with several overloads, the arguments choose between them.
    fn check_call(
        &mut self,
        node: AstId,
        callee: AstId,
        args: AstId,
        callee_ty: TypeId,
        ctx: StmtCtx,
        method: bool,
    ) -> Progress<TypeId> {
        let arg_nodes = match &self.ast.get(args).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => Vec::new(),
        };
        let mut arg_tys = Vec::new();
        for &arg in &arg_nodes {
            arg_tys.push(self.compile_expr(arg, ctx)?);
        }
        self.ast.get_mut(args).compiled = Some(args);

        if self.types.get(callee_ty).is_error() {
            return Ok(self.wk().ERROR_TYPE);
        }

        // Collect candidate signatures
        let candidates: Vec<TypeId> = match self.ast.get(callee).kind {
            AstKind::Identifier { sym: Some(sym) }
                if matches!(
                    self.symbols.symbol(sym).kind,
                    SymbolKind::Function { .. }
                ) =>
            {
                self.define_wait(sym)?;
                match &self.symbols.symbol(sym).kind {
                    SymbolKind::Function { overloads, .. } => {
                        overloads.iter().map(|o| o.ty).collect()
                    }
                    _ => unreachable!(),
                }
            }
            _ => vec![callee_ty],
        };

        let mut matching = Vec::new();
        for &candidate in &candidates {
            if self.signature_matches(
                candidate, &arg_tys, &arg_nodes, method,
            ) {
                matching.push(candidate);
            }
        }

        let chosen = match matching.len() {
            1 => matching[0],
            0 => {
                let name = self.token_text(callee);
                return Ok(self.poison(
                    node,
                    CompileError::AmbiguousOverload {
                        name,
                        candidates: 0,
                    },
                ));
            }
            n => {
                if candidates.len() == 1 {
                    matching[0]
                } else {
                    let name = self.token_text(callee);
                    return Ok(self.poison(
                        node,
                        CompileError::AmbiguousOverload {
                            name,
                            candidates: n,
                        },
                    ));
                }
            }
        };

        // The call's type comes from the chosen signature's returns
        let rets = self.signature_rets(chosen);
        let result = match rets.len() {
            0 => self.wk().U0,
            1 => rets[0].ty,
            _ => {
                let members = rets
                    .iter()
                    .map(|ret| Member {
                        ty: ret.ty,
                        compiletime: ret.compiletime,
                        reference: ret.reference,
                    })
                    .collect();
                self.types.add_compound(members)
            }
        };
        Ok(result)
    }

    /// The parameters of a function or superfunction type.
    fn signature_params(&self, ty: TypeId) -> Vec<Param> {
        match &self.types.get(ty).kind {
            TypeKind::Function { params, .. } => params.clone(),
            TypeKind::Superfunction { function, .. } => {
                self.signature_params(*function)
            }
            _ => Vec::new(),
        }
    }

    fn signature_rets(&self, ty: TypeId) -> Vec<Ret> {
        match &self.types.get(ty).kind {
            TypeKind::Function { rets, .. } => rets.clone(),
            TypeKind::Superfunction { function, .. } => {
                self.signature_rets(*function)
            }
            _ => Vec::new(),
        }
    }

    fn signature_matches(
        &mut self,
        signature: TypeId,
        arg_tys: &[TypeId],
        arg_nodes: &[AstId],
        method: bool,
    ) -> bool {
        // The receiver of a method call was bound by the dot already
        let _ = method;
        let params: Vec<Param> = self
            .signature_params(signature)
            .into_iter()
            .filter(|param| !param.thisarg)
            .collect();
        let spread = params.last().map(|p| p.spread).unwrap_or(false);
        if spread {
            if arg_tys.len() < params.len() - 1 {
                return false;
            }
        } else if arg_tys.len() > params.len() {
            return false;
        }
        for (i, param) in params.iter().enumerate() {
            if param.spread {
                break;
            }
            match arg_tys.get(i) {
                Some(&arg) => {
                    if param.generic {
                        continue;
                    }
                    if !self.weak_convertible(
                        arg,
                        param.ty,
                        arg_nodes.get(i).copied(),
                    ) {
                        return false;
                    }
                }
                // Missing arguments are fine only past the last required
                // parameter; defaults are checked by the superfunction
                None => return self.has_defaults_from(signature, i),
            }
        }
        true
    }

    fn has_defaults_from(&self, signature: TypeId, index: usize) -> bool {
        match &self.types.get(signature).kind {
            TypeKind::Superfunction { params, .. } => params
                .iter()
                .filter(|info| info.name != "this")
                .skip(index)
                .all(|info| info.default.is_some()),
            _ => false,
        }
    }

    // ===== Type expressions =====

    /// Compile a type-denoting AST into a [TypeId]. Emits NotAType /
    /// NotCompiletime diagnostics (and yields ERROR_TYPE) when the
    /// expression doesn't denote a compile-time type.
    pub(super) fn compile_type_node(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        if let AstKind::Type { ty } = self.ast.get(node).kind {
            return Ok(ty);
        }
        if self.ast.get(node).compiled.is_some() {
            // Re-entry after a replacement
            if let Some(replacement) = self.ast.get(node).compiled {
                if let AstKind::Type { ty } = self.ast.get(replacement).kind {
                    return Ok(ty);
                }
            }
        }
        let ty = self.compile_type_inner(node, ctx)?;
        // Collapse the expression into a TYPE node for later passes
        self.ast.get_mut(node).kind = AstKind::Type { ty };
        self.ast.get_mut(node).compiletime = true;
        let type_ty = self.wk().TYPE;
        self.finish(node, type_ty);
        Ok(ty)
    }

    fn compile_type_inner(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
    ) -> Progress<TypeId> {
        match self.ast.get(node).kind.clone() {
            AstKind::Type { ty } => Ok(ty),
            AstKind::Identifier { .. } => {
                let name = self.token_text(node);
                let sym = match self.symbols.get(
                    ctx.scope,
                    &name,
                    true,
                    OwnerKind::Free,
                ) {
                    Lookup::Found(sym) => sym,
                    Lookup::Ambiguous => {
                        self.error_node(
                            node,
                            CompileError::AmbiguousUsing { name },
                        );
                        return Ok(self.wk().ERROR_TYPE);
                    }
                    Lookup::NotFound => {
                        self.error_node(node, CompileError::Undeclared);
                        return Ok(self.wk().ERROR_TYPE);
                    }
                };
                self.ast.get_mut(node).kind =
                    AstKind::Identifier { sym: Some(sym) };
                match self.symbols.symbol(sym).kind.clone() {
                    SymbolKind::Type { ty, .. } => Ok(ty),
                    SymbolKind::Variable {
                        compiletime: true,
                        value: Some(value),
                        ..
                    } => {
                        // `let T = u32;` style aliases
                        self.compile_type_node(value, ctx)
                    }
                    _ => {
                        self.error_node(node, CompileError::NotAType);
                        Ok(self.wk().ERROR_TYPE)
                    }
                }
            }
            AstKind::Unary { sym, node: inner, post } => match sym {
                Symbol::Mul if post => {
                    let target = self.compile_type_node(inner, ctx)?;
                    Ok(self.types.pointer_to(PointerKind::Naked, target))
                }
                Symbol::Not if post => {
                    let target = self.compile_type_node(inner, ctx)?;
                    Ok(self.types.pointer_to(PointerKind::Unique, target))
                }
                Symbol::Add if post => {
                    let target = self.compile_type_node(inner, ctx)?;
                    Ok(self.types.pointer_to(PointerKind::Shared, target))
                }
                Symbol::WeakPtr if post => {
                    let target = self.compile_type_node(inner, ctx)?;
                    Ok(self.types.pointer_to(PointerKind::Weak, target))
                }
                Symbol::KwConst => {
                    let target = self.compile_type_node(inner, ctx)?;
                    Ok(self.types.qualified(target, true, false))
                }
                Symbol::KwVolat => {
                    let target = self.compile_type_node(inner, ctx)?;
                    Ok(self.types.qualified(target, false, true))
                }
                _ => {
                    self.error_node(node, CompileError::NotAType);
                    Ok(self.wk().ERROR_TYPE)
                }
            },
            AstKind::Binary { sym, left, right } => match sym {
                // `T[n]`, `T[]`, and the prefix form `[n]T`
                Symbol::OBrack | Symbol::CBrack => {
                    let of = self.compile_type_node(left, ctx)?;
                    if self.ast.get(right).is_none() {
                        return Ok(self.types.array_of(of, None));
                    }
                    self.compile_expr(right, ctx)?;
                    match const_eval(self.ast, self.symbols, right) {
                        Some(length) => {
                            Ok(self.types.array_of(of, Some(length)))
                        }
                        None => {
                            self.error_node(
                                right,
                                CompileError::NotCompiletime,
                            );
                            Ok(self.wk().ERROR_TYPE)
                        }
                    }
                }
                Symbol::Period => {
                    // Scoped type name: walk the chain through scopes
                    let scope = match self.ast.get(left).kind.clone() {
                        AstKind::Identifier { .. } => {
                            let name = self.token_text(left);
                            self.symbols
                                .get(ctx.scope, &name, true, OwnerKind::Free)
                                .found()
                                .and_then(|sym| {
                                    self.symbols.symbol(sym).scope()
                                })
                        }
                        AstKind::Binary {
                            sym: Symbol::Period, ..
                        } => {
                            let base = self.compile_type_node(left, ctx)?;
                            match &self.types.get(base).kind {
                                TypeKind::Supercompound {
                                    scope, ..
                                } => *scope,
                                _ => None,
                            }
                        }
                        _ => None,
                    };
                    let scope = match scope {
                        Some(scope) => scope,
                        None => {
                            self.error_node(left, CompileError::NotAType);
                            return Ok(self.wk().ERROR_TYPE);
                        }
                    };
                    let name = self.token_text(right);
                    match self
                        .symbols
                        .get(scope, &name, false, OwnerKind::Free)
                        .found()
                        .map(|sym| (sym, self.symbols.symbol(sym).kind.clone()))
                    {
                        Some((sym, SymbolKind::Type { ty, .. })) => {
                            self.ast.get_mut(right).kind =
                                AstKind::Identifier { sym: Some(sym) };
                            Ok(ty)
                        }
                        _ => {
                            self.error_node(right, CompileError::NotAType);
                            Ok(self.wk().ERROR_TYPE)
                        }
                    }
                }
                Symbol::DColon => {
                    // Generic instantiation; the base's identity is kept
                    self.compile_type_node(left, ctx)
                }
                Symbol::KwStruct | Symbol::KwUnion | Symbol::KwEnum
                | Symbol::KwTuple => {
                    // Anonymous supertypes are not supported; types must
                    // be named through def
                    self.error_node(
                        node,
                        CompileError::Expected {
                            expected: "a named type".into(),
                        },
                    );
                    Ok(self.wk().ERROR_TYPE)
                }
                _ => {
                    self.error_node(node, CompileError::NotAType);
                    Ok(self.wk().ERROR_TYPE)
                }
            },
            AstKind::Compound { elems } => {
                if self.ast.get(node).ty == self.wk().NONE_FUNCTION {
                    // A bodiless `fun` signature
                    let body = elems[3];
                    if !self.ast.get(body).is_none() {
                        self.error_node(node, CompileError::CapturedClosure);
                        return Ok(self.wk().ERROR_TYPE);
                    }
                    return self.fn_signature_type(elems[2], ctx);
                }
                // A parenthesized list of types is an anonymous compound
                let mut members = Vec::new();
                for elem in elems {
                    let ty = self.compile_type_node(elem, ctx)?;
                    members.push(Member {
                        ty,
                        compiletime: false,
                        reference: false,
                    });
                }
                Ok(self.types.add_compound(members))
            }
            AstKind::None => Ok(self.wk().ERROR_TYPE),
            _ => {
                self.error_node(node, CompileError::NotAType);
                Ok(self.wk().ERROR_TYPE)
            }
        }
    }

    // ===== Conversions and classification =====

    fn prim(&self, ty: TypeId) -> Option<(PrimitiveKind, u16)> {
        match self.types.get(ty).kind {
            TypeKind::Primitive { kind, bits } => Some((kind, bits)),
            _ => None,
        }
    }

    pub(super) fn is_numeric(&self, ty: TypeId) -> bool {
        matches!(
            self.prim(ty),
            Some((
                PrimitiveKind::Signed
                    | PrimitiveKind::Unsigned
                    | PrimitiveKind::Floating
                    | PrimitiveKind::Boolean
                    | PrimitiveKind::Error,
                _
            ))
        )
    }

    fn is_integer(&self, ty: TypeId) -> bool {
        matches!(
            self.prim(ty),
            Some((
                PrimitiveKind::Signed
                    | PrimitiveKind::Unsigned
                    | PrimitiveKind::Boolean
                    | PrimitiveKind::Error,
                _
            ))
        )
    }

    fn is_float(&self, ty: TypeId) -> bool {
        matches!(self.prim(ty), Some((PrimitiveKind::Floating, _)))
    }

    fn is_generic(&self, ty: TypeId) -> bool {
        self.types.get(ty).is_special(SpecialKind::Generic)
            || self.types.get(ty).is_special(SpecialKind::GenericUnknown)
    }

    /// Types that can be used where a boolean is wanted.
    pub(super) fn is_truthy(&self, ty: TypeId) -> bool {
        self.is_numeric(ty)
            || matches!(self.prim(ty), Some((PrimitiveKind::Character, _)))
            || self.types.get(ty).is_pointer()
            || self.types.get(ty).is_error()
            || self.is_generic(ty)
    }

    pub(super) fn is_pointer_or_error(&self, ty: TypeId) -> bool {
        self.types.get(ty).is_pointer() || self.types.get(ty).is_error()
    }

    fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.types.get(ty).kind {
            TypeKind::Pointer { at, .. } => Some(at),
            _ => None,
        }
    }

    /// The element type produced by indexing or iterating.
    pub(super) fn element_type(&self, ty: TypeId) -> Option<TypeId> {
        match self.types.get(ty).kind {
            TypeKind::Array { of, .. } => Some(of),
            TypeKind::Pointer { at, .. } => Some(at),
            _ => None,
        }
    }

    /// The member types of a compound value (e.g. a multi-return call).
    pub(super) fn compound_members(
        &self,
        ty: TypeId,
    ) -> Option<Vec<TypeId>> {
        match &self.types.get(ty).kind {
            TypeKind::Compound { members } if members.len() > 1 => {
                Some(members.iter().map(|m| m.ty).collect())
            }
            _ => None,
        }
    }

    /// Has a supercompound's member list been interned yet? Until then,
    /// member lookups must wait for the defining fiber.
    fn supercompound_ready(&self, ty: TypeId) -> bool {
        match &self.types.get(ty).kind {
            TypeKind::Supercompound { compound, .. } => {
                !self.types.get(*compound).is_special(SpecialKind::None)
            }
            _ => true,
        }
    }

    /// The signed counterpart of an unsigned type (for unary minus).
    fn signed_of(&mut self, ty: TypeId) -> TypeId {
        match self.prim(ty) {
            Some((PrimitiveKind::Unsigned, bits))
            | Some((PrimitiveKind::Boolean, bits)) => {
                let wk = self.wk();
                match bits.max(8) {
                    8 => wk.S8,
                    16 => wk.S16,
                    32 => wk.S32,
                    _ => wk.S64,
                }
            }
            _ => ty,
        }
    }

    /// A literal's numeric value, looking through unary minus, for the
    /// fits-in-target allowance.
    fn literal_value(&self, node: AstId) -> Option<i128> {
        match &self.ast.get(node).kind {
            AstKind::Value { value } => Some(*value as i128),
            AstKind::Unary {
                sym: Symbol::Sub,
                node: inner,
                ..
            } => self.literal_value(*inner).map(|v| -v),
            _ => None,
        }
    }

    /// Implicit conversions. `from_node`, when supplied and a literal,
    /// enables the fits-in-range allowance for narrower targets.
    pub(super) fn weak_convertible(
        &mut self,
        from: TypeId,
        to: TypeId,
        from_node: Option<AstId>,
    ) -> bool {
        if from == to {
            return true;
        }
        let (from_t, to_t) = (self.types.get(from), self.types.get(to));
        if from_t.is_error() || to_t.is_error() {
            return true;
        }
        if self.is_generic(from) || self.is_generic(to) {
            return true;
        }
        // Everything goes to `any`
        if to_t.is_primitive(PrimitiveKind::Any) {
            return true;
        }
        // `null` to any pointer
        if from_t.is_special(SpecialKind::Null) && to_t.is_pointer() {
            return true;
        }

        // Literals convert to anything they fit in
        if let Some(value) = from_node.and_then(|n| self.literal_value(n)) {
            if let Some((kind, bits)) = self.prim(to) {
                let fits = match kind {
                    PrimitiveKind::Unsigned | PrimitiveKind::Character => {
                        value >= 0
                            && (bits >= 64
                                || value < (1i128 << bits))
                    }
                    PrimitiveKind::Signed | PrimitiveKind::Error => {
                        bits >= 64
                            || (value < (1i128 << (bits - 1))
                                && value >= -(1i128 << (bits - 1)))
                    }
                    PrimitiveKind::Floating => true,
                    PrimitiveKind::Boolean => value == 0 || value == 1,
                    _ => false,
                };
                if fits && self.is_numeric_node(from) {
                    return true;
                }
            }
        }

        match (self.prim(from), self.prim(to)) {
            // Numeric widening
            (
                Some((PrimitiveKind::Unsigned, fb)),
                Some((PrimitiveKind::Unsigned, tb)),
            ) => fb <= tb,
            (
                Some((PrimitiveKind::Signed, fb)),
                Some((PrimitiveKind::Signed, tb)),
            ) => fb <= tb,
            (
                Some((PrimitiveKind::Unsigned, fb)),
                Some((PrimitiveKind::Signed, tb)),
            ) => fb < tb,
            (
                Some((PrimitiveKind::Boolean, _)),
                Some((
                    PrimitiveKind::Unsigned | PrimitiveKind::Signed,
                    _,
                )),
            ) => true,
            (
                Some((
                    PrimitiveKind::Unsigned | PrimitiveKind::Signed
                    | PrimitiveKind::Boolean,
                    _,
                )),
                Some((PrimitiveKind::Floating, _)),
            ) => true,
            (
                Some((PrimitiveKind::Floating, fb)),
                Some((PrimitiveKind::Floating, tb)),
            ) => fb <= tb,
            (
                Some((PrimitiveKind::Character, fb)),
                Some((PrimitiveKind::Character, tb)),
            ) => fb <= tb,
            (
                Some((PrimitiveKind::Character, fb)),
                Some((PrimitiveKind::Unsigned, tb)),
            ) => fb <= tb,
            // Raising into the error channel
            (
                Some((PrimitiveKind::Unsigned, _)),
                Some((PrimitiveKind::Error, _)),
            ) => true,
            (
                Some((PrimitiveKind::Error, _)),
                Some((PrimitiveKind::Unsigned, 64)),
            ) => true,
            _ => {
                // Arrays: a sized array converts to an unsized one, and
                // (element-wise) to an array whose element type its own
                // elements weakly convert to. The latter is what types
                // `'[1, 2, 3]` against `s64[3]`.
                match (
                    self.types.get(from).kind.clone(),
                    self.types.get(to).kind.clone(),
                ) {
                    (
                        TypeKind::Array {
                            of: from_of,
                            length: from_len,
                        },
                        TypeKind::Array {
                            of: to_of,
                            length: to_len,
                        },
                    ) => {
                        let length_ok = match (from_len, to_len) {
                            (_, None) => from_len.is_some(),
                            (Some(a), Some(b)) => a == b,
                            (None, Some(_)) => false,
                        };
                        length_ok
                            && (from_of == to_of
                                || self
                                    .weak_convertible(from_of, to_of, None)
                                || (self
                                    .prim(from_of)
                                    .map(|(kind, bits)| {
                                        kind == PrimitiveKind::Unsigned
                                            && bits == 64
                                    })
                                    .unwrap_or(false)
                                    && self.is_numeric(to_of)))
                    }
                    // Owning pointers lend themselves as naked pointers
                    (
                        TypeKind::Pointer { at: from_at, .. },
                        TypeKind::Pointer {
                            kind: PointerKind::Naked,
                            at: to_at,
                        },
                    ) => from_at == to_at,
                    _ => false,
                }
            }
        }
    }

    fn is_numeric_node(&self, ty: TypeId) -> bool {
        self.is_numeric(ty)
            || matches!(self.prim(ty), Some((PrimitiveKind::Character, _)))
    }

    /// Explicit `as` conversions: everything weak, plus reinterpretation
    /// between numerics, pointers, and type values.
    fn strong_convertible(&mut self, from: TypeId, to: TypeId) -> bool {
        if self.weak_convertible(from, to, None) {
            return true;
        }
        let numericish = |sema: &Self, ty: TypeId| {
            sema.is_numeric(ty)
                || matches!(
                    sema.prim(ty),
                    Some((PrimitiveKind::Character, _))
                )
        };
        if numericish(self, from) && numericish(self, to) {
            return true;
        }
        let from_t = self.types.get(from);
        let to_t = self.types.get(to);
        if from_t.is_pointer() && to_t.is_pointer() {
            return true;
        }
        if (from_t.is_pointer() && self.prim(to).map(|p| p.1) == Some(64))
            || (to_t.is_pointer()
                && self.prim(from).map(|p| p.1) == Some(64))
        {
            return true;
        }
        if from_t.is_primitive(PrimitiveKind::Type)
            && to_t.is_primitive(PrimitiveKind::Type)
        {
            return true;
        }
        // Enums cast to and from their discriminant
        let is_enum = |sema: &Self, ty: TypeId| {
            matches!(
                sema.types.get(ty).kind,
                TypeKind::Supercompound {
                    kind: crate::ty::SuperKind::Enum,
                    ..
                }
            )
        };
        if (is_enum(self, from) && self.is_integer(to))
            || (is_enum(self, to) && self.is_integer(from))
        {
            return true;
        }
        false
    }

    /// Result type of an infix operator, with diagnostics. ERROR_TYPE
    /// operands short-circuit silently. A bare literal on one side adopts
    /// the other side's type instead of forcing a widening (so `n - 1`
    /// stays in `n`'s type).
    fn operator_result_at(
        &mut self,
        node: AstId,
        sym: Symbol,
        lty: TypeId,
        rty: TypeId,
        left: Option<AstId>,
        right: Option<AstId>,
    ) -> TypeId {
        if self.types.get(lty).is_error() || self.types.get(rty).is_error() {
            return self.wk().ERROR_TYPE;
        }
        if self.is_generic(lty) || self.is_generic(rty) {
            return self.wk().GENERIC_UNKNOWN;
        }

        let left_literal = left
            .map(|n| self.literal_value(n).is_some())
            .unwrap_or(false);
        let right_literal = right
            .map(|n| self.literal_value(n).is_some())
            .unwrap_or(false);
        let (lty, rty) = if right_literal
            && !left_literal
            && self.is_numeric(lty)
            && self.is_numeric(rty)
        {
            (lty, lty)
        } else if left_literal
            && !right_literal
            && self.is_numeric(lty)
            && self.is_numeric(rty)
        {
            (rty, rty)
        } else {
            (lty, rty)
        };

        let mismatch = |sema: &mut Self| {
            let from = sema.types.to_string(rty);
            let to = sema.types.to_string(lty);
            sema.error_node(node, CompileError::TypeMismatch { from, to });
            sema.wk().ERROR_TYPE
        };
        let illegal = |sema: &mut Self| {
            let ty = sema.types.to_string(lty);
            sema.error_node(
                node,
                CompileError::IllegalOperator {
                    op: sym.text().into(),
                    ty,
                },
            );
            sema.wk().ERROR_TYPE
        };

        match sym {
            // Comparisons yield booleans
            Symbol::Lt | Symbol::Le | Symbol::Gt | Symbol::Ge
            | Symbol::Equals | Symbol::NotEquals => {
                let comparable = (self.is_numeric_node(lty)
                    && self.is_numeric_node(rty))
                    || (self.types.get(lty).is_pointer()
                        && self.types.get(rty).is_pointer())
                    || lty == rty
                    || self.weak_convertible(rty, lty, None)
                    || self.weak_convertible(lty, rty, None);
                if comparable {
                    self.wk().U1
                } else {
                    mismatch(self)
                }
            }
            // Logic wants truthiness on both sides
            Symbol::Land | Symbol::Lor | Symbol::KwAnd | Symbol::KwOr => {
                if self.is_truthy(lty) && self.is_truthy(rty) {
                    self.wk().U1
                } else {
                    illegal(self)
                }
            }
            // Shifts, rotations and single-bit ops keep the left type
            Symbol::Shl | Symbol::Shr | Symbol::Rtl | Symbol::Rtr
            | Symbol::BitSet | Symbol::BitClear | Symbol::BitToggle => {
                if self.is_integer(lty) && self.is_integer(rty) {
                    lty
                } else {
                    illegal(self)
                }
            }
            Symbol::BitCheck => {
                if self.is_integer(lty) && self.is_integer(rty) {
                    self.wk().U1
                } else {
                    illegal(self)
                }
            }
            Symbol::And | Symbol::Or | Symbol::Xor => {
                if self.is_integer(lty) && self.is_integer(rty) {
                    self.common_wider(lty, rty)
                } else {
                    illegal(self)
                }
            }
            Symbol::Add | Symbol::Sub | Symbol::Mul | Symbol::Div
            | Symbol::IntDiv | Symbol::Modulo => {
                if self.is_numeric(lty) && self.is_numeric(rty) {
                    self.common_wider(lty, rty)
                } else if self.types.get(lty).is_pointer()
                    && self.is_integer(rty)
                    && matches!(sym, Symbol::Add | Symbol::Sub)
                {
                    lty
                } else {
                    illegal(self)
                }
            }
            Symbol::Concat => {
                // Arrays of the same element concatenate
                match (self.element_type(lty), self.element_type(rty)) {
                    (Some(a), Some(b)) if a == b => {
                        self.types.array_of(a, None)
                    }
                    _ => illegal(self),
                }
            }
            _ => illegal(self),
        }
    }

    /// The wider common type of two numerics, for arithmetic results.
    fn common_wider(&mut self, lty: TypeId, rty: TypeId) -> TypeId {
        if lty == rty {
            return lty;
        }
        let wk = self.wk();
        let (lk, lb) = self.prim(lty).unwrap_or((PrimitiveKind::Error, 64));
        let (rk, rb) = self.prim(rty).unwrap_or((PrimitiveKind::Error, 64));
        if self.is_float(lty) || self.is_float(rty) {
            let bits = match (lk, rk) {
                (PrimitiveKind::Floating, PrimitiveKind::Floating) => {
                    lb.max(rb)
                }
                (PrimitiveKind::Floating, _) => lb,
                _ => rb,
            };
            return if bits <= 32 { wk.F32 } else { wk.F64 };
        }
        let bits = lb.max(rb).max(8);
        let signed = matches!(lk, PrimitiveKind::Signed)
            && matches!(rk, PrimitiveKind::Signed)
            || (matches!(lk, PrimitiveKind::Signed) && lb > rb)
            || (matches!(rk, PrimitiveKind::Signed) && rb > lb);
        match (signed, bits) {
            (true, 8) => wk.S8,
            (true, 16) => wk.S16,
            (true, 32) => wk.S32,
            (true, _) => wk.S64,
            (false, 8) => wk.U8,
            (false, 16) => wk.U16,
            (false, 32) => wk.U32,
            (false, _) => wk.U64,
        }
    }
}
