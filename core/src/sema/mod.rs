//! Semantic analysis: walk the parsed AST top-down, resolving names,
//! checking and annotating types, and publishing symbols. The phase is
//! organized around cooperative fibers (see [fiber]): every top-level
//! `def` compiles as its own re-runnable task, so declarations may freely
//! reference types and functions that are defined later in the file (or
//! recursively), as long as the dependency graph eventually bottoms out.
//!
//! At each block the compiler does a two-phase scan: placeholder symbols
//! for every `def` in the block are published first (and a fiber enqueued
//! per def), then the remaining statements compile in order. A fiber that
//! needs a symbol that has no definition yet, or a type that cannot be
//! sized yet, stalls and is retried; exhausting the retry budget produces
//! the circular-dependency diagnostic.

mod expr;
pub mod fiber;

use crate::ast::{AstArena, AstId, AstKind};
use crate::error::{CompileError, SourceErrorWrapper};
use crate::grammar::Symbol;
use crate::symbol::{
    Lookup, Overload, OwnerKind, ScopeId, SymbolArena, SymbolId, SymbolKind,
};
use crate::token::TokenStream;
use crate::ty::{
    Param, ParamInfo, Ret, SuperKind, TypeId, TypeTable, WellKnown,
};
use fiber::{Fiber, FiberQueue, FiberTask, Progress, Stall};
use std::collections::{HashMap, HashSet};

/// Statement-level context, cheap to copy into child constructs.
#[derive(Copy, Clone, Debug)]
struct StmtCtx {
    scope: ScopeId,
    /// The enclosing BLOCK node, for `defer` registration
    block: AstId,
    in_loop: bool,
    in_switch: bool,
    in_try: bool,
}

impl StmtCtx {
    fn with_scope(self, scope: ScopeId, block: AstId) -> Self {
        Self {
            scope,
            block,
            ..self
        }
    }
}

/// Per-function compilation state: the declared (or inferred) returns and
/// the gotos waiting for their labels.
struct FnCtx {
    sym: SymbolId,
    /// Scope holding parameters and labels
    scope: ScopeId,
    rets: Vec<Ret>,
    /// The function was declared `-> infer`
    infer: bool,
    /// Set once the first `return` patched the inferred returns
    inferred: bool,
    gotos: Vec<AstId>,
    has_e64: bool,
}

/// Analyze one module. Imported modules must have been bound into the
/// module scope (as MODULE symbols) beforehand.
pub fn analyze_module(
    types: &mut TypeTable,
    symbols: &mut SymbolArena,
    ast: &mut AstArena,
    tokens: &TokenStream,
    src: &str,
    errors: &mut Vec<SourceErrorWrapper<CompileError>>,
    module_scope: ScopeId,
    root: AstId,
) {
    let mut sema = Sema {
        types,
        symbols,
        ast,
        tokens,
        src,
        errors,
        queue: FiberQueue::new(),
        block_scopes: HashMap::new(),
        prescanned: HashSet::new(),
        def_syms: HashMap::new(),
        def_scopes: HashMap::new(),
    };
    sema.queue.push(Fiber::new(FiberTask::Root {
        node: root,
        scope: module_scope,
    }));
    sema.run();
}

struct Sema<'a> {
    types: &'a mut TypeTable,
    symbols: &'a mut SymbolArena,
    ast: &'a mut AstArena,
    tokens: &'a TokenStream,
    src: &'a str,
    errors: &'a mut Vec<SourceErrorWrapper<CompileError>>,
    queue: FiberQueue,
    /// Stable block-to-scope assignment across fiber re-runs
    block_scopes: HashMap<AstId, ScopeId>,
    /// Blocks whose defs have been published and enqueued
    prescanned: HashSet<AstId>,
    /// The symbol each def statement publishes
    def_syms: HashMap<AstId, SymbolId>,
    /// Stable (params, signature) scopes per function def
    def_scopes: HashMap<AstId, (ScopeId, ScopeId)>,
}

impl<'a> Sema<'a> {
    fn wk(&self) -> WellKnown {
        *self.types.well_known()
    }

    fn run(&mut self) {
        while let Some(mut fiber) = self.queue.pop() {
            let result = match fiber.task {
                FiberTask::Root { node, scope } => {
                    let ctx = StmtCtx {
                        scope,
                        block: node,
                        in_loop: false,
                        in_switch: false,
                        in_try: false,
                    };
                    self.compile_block_in(node, scope, ctx, None)
                }
                FiberTask::Def {
                    node,
                    scope,
                    parent,
                } => self.compile_def(node, scope, parent),
            };
            if result.is_err() {
                fiber.tries -= 1;
                fiber.stalled = true;
                if fiber.tries == 0 {
                    self.report_circular(&fiber.task);
                } else {
                    self.queue.push(fiber);
                }
            }
        }
    }

    fn report_circular(&mut self, task: &FiberTask) {
        let node = task.node();
        let name = self.def_name_text(node).unwrap_or_default();
        self.error_node(node, CompileError::CircularDependency { name });
        // Stop re-compiling this subtree; its symbol stays undefined
        let error_ty = self.wk().ERROR_TYPE;
        let ast_node = self.ast.get_mut(node);
        ast_node.ty = error_ty;
        ast_node.compiled = Some(node);
    }

    // ===== Shared helpers (also used by expr.rs) =====

    fn token_text(&self, node: AstId) -> String {
        self.tokens.get(self.ast.get(node).token).text.clone()
    }

    fn error_node(&mut self, node: AstId, error: CompileError) {
        let span = self.tokens.get(self.ast.get(node).token).span;
        self.errors
            .push(SourceErrorWrapper::new(error, span, self.src));
    }

    /// Mark a node compiled with the given type; the standard way for an
    /// expression to finish.
    fn finish(&mut self, node: AstId, ty: TypeId) -> TypeId {
        let ast_node = self.ast.get_mut(node);
        ast_node.ty = ty;
        ast_node.compiled = Some(node);
        ty
    }

    /// Diagnose and poison a node in one step.
    fn poison(&mut self, node: AstId, error: CompileError) -> TypeId {
        self.error_node(node, error);
        let error_ty = self.wk().ERROR_TYPE;
        self.finish(node, error_ty)
    }

    fn define_wait(&self, sym: SymbolId) -> Progress<()> {
        if self.symbols.symbol(sym).is_defined() {
            Ok(())
        } else {
            Err(Stall::Define(sym))
        }
    }

    fn size_wait(&mut self, ty: TypeId) -> Progress<()> {
        if self.types.set_size(ty) {
            Ok(())
        } else {
            Err(Stall::Size(ty))
        }
    }

    /// Resolve a declaration-name node to a symbol, creating it on first
    /// visit. The created symbol id is written back into the node, which
    /// is what makes declaration re-runs idempotent. Placeholders (`_`)
    /// yield `None`; redeclarations are diagnosed and resolve to the
    /// original symbol.
    fn bind_name(
        &mut self,
        name_node: AstId,
        make: impl FnOnce(&mut SymbolArena, &str) -> Result<SymbolId, SymbolId>,
    ) -> Option<SymbolId> {
        match &self.ast.get(name_node).kind {
            AstKind::Zero { .. } => return None,
            AstKind::Identifier { sym: Some(sym) } => return Some(*sym),
            _ => {}
        }
        let name = self.token_text(name_node);
        let sym = match make(self.symbols, &name) {
            Ok(sym) => sym,
            Err(existing) => {
                let original = self
                    .symbols
                    .symbol(existing)
                    .decl
                    .map(|decl| self.tokens.get(self.ast.get(decl).token).span)
                    .unwrap_or_default();
                self.error_node(
                    name_node,
                    CompileError::Redeclaration { original },
                );
                existing
            }
        };
        self.ast.get_mut(name_node).kind =
            AstKind::Identifier { sym: Some(sym) };
        self.ast.get_mut(name_node).compiled = Some(name_node);
        Some(sym)
    }

    // ===== Blocks =====

    /// Compile a block in a fresh child scope.
    fn compile_block(
        &mut self,
        node: AstId,
        owner: OwnerKind,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let scope = match self.block_scopes.get(&node) {
            Some(&scope) => scope,
            None => {
                let scope = self.symbols.make_child(ctx.scope, owner);
                self.block_scopes.insert(node, scope);
                scope
            }
        };
        self.compile_block_in(node, scope, ctx.with_scope(scope, node), fnctx)
    }

    /// Compile a block whose scope has already been decided (module roots,
    /// namespaces, function bodies).
    fn compile_block_in(
        &mut self,
        node: AstId,
        scope: ScopeId,
        ctx: StmtCtx,
        mut fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let elems = match &self.ast.get(node).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            other => panic!("compile_block on {:?}", other),
        };

        // Phase one: publish every def's placeholder and enqueue a fiber
        // for it, so the whole block's names exist before any statement
        // compiles
        if !self.prescanned.contains(&node) {
            self.prescanned.insert(node);
            let parent = fnctx.as_ref().map(|ctx| ctx.sym);
            for &stmt in &elems {
                if self.is_def(stmt) {
                    self.publish_def(stmt, scope, parent);
                    self.queue.push(Fiber::new(FiberTask::Def {
                        node: stmt,
                        scope,
                        parent,
                    }));
                }
            }
        }

        // Phase two: everything that is not a def, in order
        for &stmt in &elems {
            if !self.is_def(stmt) {
                self.compile_stmt(stmt, ctx, fnctx.as_deref_mut())?;
            }
        }
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn is_def(&self, node: AstId) -> bool {
        matches!(
            self.ast.get(node).kind,
            AstKind::Unary { sym: Symbol::KwDef, .. }
        )
    }

    // ===== Statements =====

    fn compile_stmt(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        if self.ast.get(node).compiled.is_some() {
            return Ok(());
        }
        match self.ast.get(node).kind.clone() {
            // Compiler notes and recovered errors
            AstKind::None => {
                self.ast.get_mut(node).compiled = Some(node);
                Ok(())
            }
            AstKind::Block { .. } => {
                self.compile_block(node, OwnerKind::Block, ctx, fnctx)
            }
            AstKind::Zero { sym } => {
                match sym {
                    Symbol::KwBreak if !ctx.in_loop => {
                        self.poison(node, CompileError::NotInLoop);
                    }
                    Symbol::KwContinue
                        if !ctx.in_loop && !ctx.in_switch =>
                    {
                        self.poison(node, CompileError::NotInLoop);
                    }
                    _ => {
                        self.ast.get_mut(node).compiled = Some(node);
                    }
                }
                Ok(())
            }
            AstKind::Unary { sym, node: inner, .. } => match sym {
                Symbol::KwDef => {
                    // Defs reached outside of a block prescan (e.g. a
                    // stray nested def) still compile in place
                    self.compile_def(node, ctx.scope, None)
                }
                Symbol::KwImport => {
                    // Binding happened in the module driver
                    self.ast.get_mut(node).compiled = Some(node);
                    Ok(())
                }
                Symbol::KwUsing => self.compile_using(node, inner, ctx),
                Symbol::KwReturn => self.compile_return(node, ctx, fnctx),
                Symbol::KwRaise => self.compile_raise(node, inner, ctx, fnctx),
                Symbol::KwGoto => {
                    match fnctx {
                        Some(fnctx) => fnctx.gotos.push(node),
                        None => {
                            self.poison(node, CompileError::UnknownLabel);
                        }
                    }
                    self.ast.get_mut(node).compiled = Some(node);
                    Ok(())
                }
                Symbol::KwLabel => self.compile_label(node, inner, fnctx),
                Symbol::KwDefer => self.compile_defer(node, inner, ctx, fnctx),
                Symbol::KwDelete => {
                    let ty = self.compile_expr(inner, ctx)?;
                    if !self.is_pointer_or_error(ty) {
                        let found = self.types.to_string(ty);
                        self.error_node(
                            inner,
                            CompileError::IllegalOperator {
                                op: "delete".into(),
                                ty: found,
                            },
                        );
                    }
                    let u0 = self.wk().U0;
                    self.finish(node, u0);
                    Ok(())
                }
                Symbol::KwLoop => {
                    let mut loop_ctx = ctx;
                    loop_ctx.in_loop = true;
                    self.compile_block(
                        inner,
                        OwnerKind::Loop,
                        loop_ctx,
                        fnctx,
                    )?;
                    self.ast.get_mut(node).compiled = Some(node);
                    Ok(())
                }
                _ => {
                    self.compile_expr(node, ctx)?;
                    Ok(())
                }
            },
            AstKind::Binary { sym, left, right } => match sym {
                Symbol::KwNamespace => {
                    self.compile_namespace(node, left, right, ctx, fnctx)
                }
                Symbol::KwVar | Symbol::KwLet | Symbol::KwRef => {
                    self.compile_decl(node, ctx, None)
                }
                Symbol::KwIf => self.compile_if(node, left, right, ctx, fnctx),
                Symbol::KwWhile => {
                    self.compile_while(node, left, right, ctx, fnctx)
                }
                Symbol::KwDo => {
                    self.compile_dowhile(node, left, right, ctx, fnctx)
                }
                Symbol::KwFor => self.compile_for(node, left, right, ctx, fnctx),
                Symbol::KwSwitch => {
                    self.compile_switch(node, left, right, ctx, fnctx)
                }
                Symbol::KwTry => self.compile_try(node, left, right, ctx, fnctx),
                sym if sym == Symbol::Assign || sym.assign_op().is_some() => {
                    self.compile_assign(node, sym, left, right, ctx)
                }
                _ => {
                    self.compile_expr(node, ctx)?;
                    Ok(())
                }
            },
            _ => {
                self.compile_expr(node, ctx)?;
                Ok(())
            }
        }
    }

    /// A list of conditions: every entry but the last may be a declaration
    /// or expression; the last is the boolean.
    fn compile_conds(&mut self, conds: AstId, ctx: StmtCtx) -> Progress<()> {
        let elems = match &self.ast.get(conds).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![conds],
        };
        for (i, &cond) in elems.iter().enumerate() {
            let is_decl = matches!(
                self.ast.get(cond).kind,
                AstKind::Binary {
                    sym: Symbol::KwVar | Symbol::KwLet | Symbol::KwRef,
                    ..
                }
            );
            if is_decl {
                self.compile_decl(cond, ctx, None)?;
            } else {
                let ty = self.compile_expr(cond, ctx)?;
                if i + 1 == elems.len() && !self.is_truthy(ty) {
                    let from = self.types.to_string(ty);
                    self.error_node(
                        cond,
                        CompileError::TypeMismatch {
                            from,
                            to: "u1".into(),
                        },
                    );
                }
            }
        }
        self.ast.get_mut(conds).compiled = Some(conds);
        Ok(())
    }

    fn compile_if(
        &mut self,
        node: AstId,
        conds: AstId,
        branches: AstId,
        ctx: StmtCtx,
        mut fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        // Conditions may declare variables that are visible in both arms
        let scope = match self.block_scopes.get(&node) {
            Some(&scope) => scope,
            None => {
                let scope =
                    self.symbols.make_child(ctx.scope, OwnerKind::Block);
                self.block_scopes.insert(node, scope);
                scope
            }
        };
        let inner = ctx.with_scope(scope, ctx.block);
        self.compile_conds(conds, inner)?;
        let (_, then, orelse) = self.ast.binary(branches);
        self.compile_block(then, OwnerKind::Block, inner, fnctx.as_deref_mut())?;
        if !self.ast.get(orelse).is_none() {
            self.compile_block(orelse, OwnerKind::Block, inner, fnctx)?;
        } else {
            self.ast.get_mut(orelse).compiled = Some(orelse);
        }
        self.ast.get_mut(branches).compiled = Some(branches);
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_while(
        &mut self,
        node: AstId,
        conds: AstId,
        body: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let scope = self.loop_scope(node, ctx);
        let mut inner = ctx.with_scope(scope, ctx.block);
        inner.in_loop = true;
        self.compile_conds(conds, inner)?;
        self.compile_block(body, OwnerKind::Block, inner, fnctx)?;
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_dowhile(
        &mut self,
        node: AstId,
        body: AstId,
        conds: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let scope = self.loop_scope(node, ctx);
        let mut inner = ctx.with_scope(scope, ctx.block);
        inner.in_loop = true;
        self.compile_block(body, OwnerKind::Block, inner, fnctx)?;
        self.compile_conds(conds, inner)?;
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn loop_scope(&mut self, node: AstId, ctx: StmtCtx) -> ScopeId {
        match self.block_scopes.get(&node) {
            Some(&scope) => scope,
            None => {
                let scope =
                    self.symbols.make_child(ctx.scope, OwnerKind::Loop);
                self.block_scopes.insert(node, scope);
                scope
            }
        }
    }

    fn compile_for(
        &mut self,
        node: AstId,
        header: AstId,
        body: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let scope = self.loop_scope(node, ctx);
        let mut inner = ctx.with_scope(scope, ctx.block);
        inner.in_loop = true;

        match self.ast.get(header).kind.clone() {
            // classic: [init, cond, step]
            AstKind::Compound { elems } => {
                let (init, cond, step) = (elems[0], elems[1], elems[2]);
                if !self.ast.get(init).is_none() {
                    self.compile_stmt(init, inner, None)?;
                } else {
                    self.ast.get_mut(init).compiled = Some(init);
                }
                if !self.ast.get(cond).is_none() {
                    let ty = self.compile_expr(cond, inner)?;
                    if !self.is_truthy(ty) {
                        let from = self.types.to_string(ty);
                        self.error_node(
                            cond,
                            CompileError::TypeMismatch {
                                from,
                                to: "u1".into(),
                            },
                        );
                    }
                } else {
                    self.ast.get_mut(cond).compiled = Some(cond);
                }
                if !self.ast.get(step).is_none() {
                    self.compile_stmt(step, inner, None)?;
                } else {
                    self.ast.get_mut(step).compiled = Some(step);
                }
            }
            // for-each: decl `in` sequence
            AstKind::Binary {
                sym: Symbol::KwIn,
                left: decl,
                right: seq,
            } => {
                let seq_ty = self.compile_expr(seq, inner)?;
                let elem = self.element_type(seq_ty).unwrap_or_else(|| {
                    let from = self.types.to_string(seq_ty);
                    self.error_node(
                        seq,
                        CompileError::IllegalOperator {
                            op: "in".into(),
                            ty: from,
                        },
                    );
                    self.wk().ERROR_TYPE
                });
                self.compile_decl(decl, inner, Some(elem))?;
            }
            // numeric: decl `=` (start, stop[, step])
            AstKind::Binary {
                sym: Symbol::Assign,
                left: decl,
                right: range,
            } => {
                let bounds = match &self.ast.get(range).kind {
                    AstKind::Compound { elems } => elems.clone(),
                    _ => vec![range],
                };
                let mut bound_ty = self.wk().S64;
                for &bound in &bounds {
                    let ty = self.compile_expr(bound, inner)?;
                    if !self.is_numeric(ty) && !self.types.get(ty).is_error() {
                        let from = self.types.to_string(ty);
                        self.error_node(
                            bound,
                            CompileError::TypeMismatch {
                                from,
                                to: "s64".into(),
                            },
                        );
                    } else if !self.types.get(ty).is_error() {
                        bound_ty = ty;
                    }
                }
                self.ast.get_mut(range).compiled = Some(range);
                self.compile_decl(decl, inner, Some(bound_ty))?;
            }
            ref other => panic!("bad for header {:?}", other),
        }
        self.ast.get_mut(header).compiled = Some(header);
        self.compile_block(body, OwnerKind::Block, inner, fnctx)?;
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_switch(
        &mut self,
        node: AstId,
        conds: AstId,
        cases: AstId,
        ctx: StmtCtx,
        mut fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let scope = match self.block_scopes.get(&node) {
            Some(&scope) => scope,
            None => {
                let scope =
                    self.symbols.make_child(ctx.scope, OwnerKind::Block);
                self.block_scopes.insert(node, scope);
                scope
            }
        };
        let inner = ctx.with_scope(scope, ctx.block);
        self.compile_conds(conds, inner)?;
        let subject_ty = self.last_cond_type(conds);

        let case_list = match &self.ast.get(cases).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            other => panic!("switch cases were {:?}", other),
        };
        let mut case_ctx = inner;
        case_ctx.in_switch = true;
        for case in case_list {
            if self.ast.get(case).compiled.is_some() {
                continue;
            }
            let (_, values, body) = self.ast.binary(case);
            if let AstKind::Compound { elems } =
                self.ast.get(values).kind.clone()
            {
                for value in elems {
                    let ty = self.compile_expr(value, case_ctx)?;
                    if !self.weak_convertible(ty, subject_ty, Some(value)) {
                        let from = self.types.to_string(ty);
                        let to = self.types.to_string(subject_ty);
                        self.error_node(
                            value,
                            CompileError::TypeMismatch { from, to },
                        );
                    }
                }
            }
            self.ast.get_mut(values).compiled = Some(values);
            self.compile_block(
                body,
                OwnerKind::Block,
                case_ctx,
                fnctx.as_deref_mut(),
            )?;
            self.ast.get_mut(case).compiled = Some(case);
        }
        self.ast.get_mut(cases).compiled = Some(cases);
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_try(
        &mut self,
        node: AstId,
        body: AstId,
        catch: AstId,
        ctx: StmtCtx,
        mut fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let mut try_ctx = ctx;
        try_ctx.in_try = true;
        self.compile_block(
            body,
            OwnerKind::Block,
            try_ctx,
            fnctx.as_deref_mut(),
        )?;

        let (_, err_name, handler) = self.ast.binary(catch);
        // The error binding lives in the handler's scope
        let handler_scope = match self.block_scopes.get(&handler) {
            Some(&scope) => scope,
            None => {
                let scope =
                    self.symbols.make_child(ctx.scope, OwnerKind::Block);
                self.block_scopes.insert(handler, scope);
                scope
            }
        };
        let e64 = self.wk().E64;
        if let Some(sym) = self.bind_name(err_name, |symbols, name| {
            symbols.add_variable(handler_scope, name, e64, None, None)
        }) {
            if let SymbolKind::Variable { defined, .. } =
                &mut self.symbols.symbol_mut(sym).kind
            {
                *defined = true;
            }
        }
        let handler_ctx = ctx.with_scope(handler_scope, handler);
        self.compile_block_in(handler, handler_scope, handler_ctx, fnctx)?;
        self.ast.get_mut(catch).compiled = Some(catch);
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_return(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let values = match self.ast.get(node).kind {
            AstKind::Unary { node: values, .. } => values,
            ref other => panic!("return was {:?}", other),
        };
        let elems = match &self.ast.get(values).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![values],
        };
        let mut tys = Vec::new();
        for &value in &elems {
            tys.push(self.compile_expr(value, ctx)?);
        }

        let fnctx = match fnctx {
            Some(fnctx) => fnctx,
            None => {
                self.poison(node, CompileError::InvalidStatement);
                return Ok(());
            }
        };

        if fnctx.infer && !fnctx.inferred {
            // Sole `infer` return adopts the expression types verbatim
            fnctx.rets = tys.iter().map(|&ty| Ret::plain(ty)).collect();
            fnctx.inferred = true;
        } else if fnctx.rets.iter().any(|ret| ret.ty == self.wk().INFER)
            && !fnctx.inferred
        {
            // Multi-return with an infer slot is patched on first return
            let infer = self.wk().INFER;
            for (ret, &ty) in fnctx.rets.iter_mut().zip(&tys) {
                if ret.ty == infer {
                    ret.ty = ty;
                }
            }
            fnctx.inferred = true;
        }

        let expected = fnctx.rets.len();
        let e64 = self.wk().E64;
        let has_tail_e64 =
            fnctx.rets.last().map(|ret| ret.ty == e64).unwrap_or(false);
        let arity_ok = tys.len() == expected
            || (has_tail_e64 && tys.len() + 1 == expected)
            || (expected == 1
                && tys.is_empty()
                && fnctx.rets[0].ty == self.wk().U0);
        if !arity_ok {
            self.error_node(
                node,
                CompileError::ValueCountMismatch {
                    expected,
                    found: tys.len(),
                },
            );
        } else {
            let rets = fnctx.rets.clone();
            for (i, &ty) in tys.iter().enumerate() {
                let want = rets[i].ty;
                if !self.weak_convertible(ty, want, elems.get(i).copied()) {
                    let from = self.types.to_string(ty);
                    let to = self.types.to_string(want);
                    self.error_node(
                        elems[i],
                        CompileError::TypeMismatch { from, to },
                    );
                }
            }
        }
        self.ast.get_mut(values).compiled = Some(values);
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_raise(
        &mut self,
        node: AstId,
        value: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        let ty = self.compile_expr(value, ctx)?;
        let e64 = self.wk().E64;
        if !self.weak_convertible(ty, e64, Some(value)) {
            let from = self.types.to_string(ty);
            self.error_node(
                value,
                CompileError::TypeMismatch {
                    from,
                    to: "e64".into(),
                },
            );
        }
        let raisable = fnctx.map(|f| f.has_e64).unwrap_or(false);
        if !raisable && !ctx.in_try {
            self.error_node(node, CompileError::RaiseWithoutErrorReturn);
        }
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_label(
        &mut self,
        node: AstId,
        name: AstId,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        match fnctx {
            Some(fnctx) => {
                let scope = fnctx.scope;
                self.bind_name(name, |symbols, text| {
                    symbols.add_label(scope, text, Some(node))
                });
            }
            None => {
                self.poison(node, CompileError::InvalidStatement);
            }
        }
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    /// Compile the deferred expression and queue it on the enclosing
    /// block; execution order at block exit is the reverse of declaration
    /// order.
    fn compile_defer(
        &mut self,
        node: AstId,
        inner: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        self.compile_stmt(inner, ctx, fnctx)?;
        match &mut self.ast.get_mut(ctx.block).kind {
            AstKind::Block { at_end, .. } => at_end.insert(0, inner),
            other => panic!("defer outside of a block: {:?}", other),
        }
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_using(
        &mut self,
        node: AstId,
        target: AstId,
        ctx: StmtCtx,
    ) -> Progress<()> {
        // Walk the dotted chain by name, without compiling it as an
        // expression
        enum UseTarget {
            Symbol(SymbolId),
            Glob(ScopeId),
        }
        fn walk(
            sema: &mut Sema<'_>,
            node: AstId,
            ctx: StmtCtx,
        ) -> Option<UseTarget> {
            match sema.ast.get(node).kind.clone() {
                AstKind::Identifier { .. } => {
                    let name = sema.token_text(node);
                    match sema.symbols.get(
                        ctx.scope,
                        &name,
                        true,
                        OwnerKind::Free,
                    ) {
                        Lookup::Found(sym) => Some(UseTarget::Symbol(sym)),
                        Lookup::Ambiguous => {
                            sema.poison(
                                node,
                                CompileError::AmbiguousUsing { name },
                            );
                            None
                        }
                        Lookup::NotFound => {
                            sema.poison(node, CompileError::Undeclared);
                            None
                        }
                    }
                }
                AstKind::Binary {
                    sym: Symbol::Period,
                    left,
                    right,
                } => {
                    let base = walk(sema, left, ctx)?;
                    let base_scope = match base {
                        UseTarget::Symbol(sym) => {
                            match sema.symbols.symbol(sym).scope() {
                                Some(scope) => scope,
                                None => {
                                    sema.poison(
                                        left,
                                        CompileError::Undeclared,
                                    );
                                    return None;
                                }
                            }
                        }
                        UseTarget::Glob(_) => {
                            sema.poison(left, CompileError::Undeclared);
                            return None;
                        }
                    };
                    if matches!(
                        sema.ast.get(right).kind,
                        AstKind::Zero { sym: Symbol::Mul }
                    ) {
                        return Some(UseTarget::Glob(base_scope));
                    }
                    let name = sema.token_text(right);
                    match sema.symbols.get(
                        base_scope,
                        &name,
                        false,
                        OwnerKind::Free,
                    ) {
                        Lookup::Found(sym) => Some(UseTarget::Symbol(sym)),
                        _ => {
                            sema.poison(right, CompileError::Undeclared);
                            None
                        }
                    }
                }
                _ => {
                    sema.poison(node, CompileError::InvalidStatement);
                    None
                }
            }
        }

        match walk(self, target, ctx) {
            Some(UseTarget::Symbol(sym)) => {
                let name = self.symbols.symbol(sym).name.clone();
                self.symbols.borrow(ctx.scope, &name, sym);
            }
            Some(UseTarget::Glob(scope)) => {
                self.symbols.borrow_all(ctx.scope, scope);
            }
            None => {}
        }
        self.ast.get_mut(target).compiled = Some(target);
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    fn compile_namespace(
        &mut self,
        node: AstId,
        name: AstId,
        body: AstId,
        ctx: StmtCtx,
        fnctx: Option<&mut FnCtx>,
    ) -> Progress<()> {
        // Namespaces are reopenable: a second declaration of the same
        // name extends the first one's scope
        let name_text = self.token_text(name);
        let existing = self
            .symbols
            .get(ctx.scope, &name_text, false, OwnerKind::Free)
            .found()
            .filter(|&sym| {
                matches!(
                    self.symbols.symbol(sym).kind,
                    SymbolKind::Namespace { .. }
                )
            });
        let scope = match existing {
            Some(sym) => self.symbols.symbol(sym).scope().unwrap(),
            None => {
                let scope =
                    self.symbols.make_child(ctx.scope, OwnerKind::Namespace);
                self.bind_name(name, |symbols, text| {
                    symbols.add_namespace(ctx.scope, text, scope, Some(node))
                });
                scope
            }
        };
        self.block_scopes.insert(body, scope);
        let inner = ctx.with_scope(scope, body);
        self.compile_block_in(body, scope, inner, fnctx)?;
        self.ast.get_mut(node).compiled = Some(node);
        Ok(())
    }

    /// Variable declarations: `var a, b: T = x, y`. `forced_ty` overrides
    /// the declared type (used by for-each and numeric-for headers).
    fn compile_decl(
        &mut self,
        node: AstId,
        ctx: StmtCtx,
        forced_ty: Option<TypeId>,
    ) -> Progress<()> {
        if self.ast.get(node).compiled.is_some() {
            return Ok(());
        }
        let (declarator, typed, values) = self.ast.binary(node);
        let (_, names, ty_ast) = self.ast.binary(typed);

        let declared = match forced_ty {
            Some(ty) => ty,
            None => self.compile_type_node(ty_ast, ctx)?,
        };

        // Values, with compound expansion: one call producing n values
        // satisfies n names
        let value_elems = match &self.ast.get(values).kind {
            AstKind::Compound { elems } => elems.clone(),
            AstKind::None => Vec::new(),
            _ => vec![values],
        };
        let mut value_tys: Vec<(TypeId, Option<AstId>)> = Vec::new();
        for &value in &value_elems {
            let ty = self.compile_expr(value, ctx)?;
            match self.compound_members(ty) {
                Some(members) if value_elems.len() == 1 => {
                    for member in members {
                        value_tys.push((member, None));
                    }
                }
                _ => value_tys.push((ty, Some(value))),
            }
        }

        let name_nodes = match &self.ast.get(names).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![names],
        };

        if !value_tys.is_empty() && value_tys.len() != name_nodes.len() {
            self.error_node(
                node,
                CompileError::ValueCountMismatch {
                    expected: name_nodes.len(),
                    found: value_tys.len(),
                },
            );
        }

        let infer = self.wk().INFER;
        for (i, &name) in name_nodes.iter().enumerate() {
            let value_ty = value_tys.get(i).map(|(ty, _)| *ty);
            let ty = if declared == infer {
                match value_ty {
                    Some(ty) => ty,
                    None => {
                        self.error_node(
                            name,
                            CompileError::Expected {
                                expected: "a type or an initializer".into(),
                            },
                        );
                        self.wk().ERROR_TYPE
                    }
                }
            } else {
                if let Some(value_ty) = value_ty {
                    let value_node =
                        value_tys.get(i).and_then(|(_, node)| *node);
                    if !self.weak_convertible(value_ty, declared, value_node)
                    {
                        let from = self.types.to_string(value_ty);
                        let to = self.types.to_string(declared);
                        self.error_node(
                            value_node.unwrap_or(name),
                            CompileError::TypeMismatch { from, to },
                        );
                    }
                }
                declared
            };

            let value_ast = value_elems.get(i).copied();
            let scope = ctx.scope;
            if let Some(sym) = self.bind_name(name, |symbols, text| {
                symbols.add_variable(scope, text, ty, value_ast, Some(node))
            }) {
                if let SymbolKind::Variable {
                    defined,
                    compiletime,
                    reference,
                    ty: sym_ty,
                    ..
                } = &mut self.symbols.symbol_mut(sym).kind
                {
                    *sym_ty = ty;
                    *defined = true;
                    *compiletime = declarator == Symbol::KwLet;
                    *reference = declarator == Symbol::KwRef;
                }
            }
        }
        let u0 = self.wk().U0;
        self.ast.get_mut(typed).compiled = Some(typed);
        self.ast.get_mut(values).compiled = Some(values);
        self.finish(node, u0);
        Ok(())
    }

    // ===== Definitions =====

    fn def_target(&self, def: AstId) -> AstId {
        match self.ast.get(def).kind {
            AstKind::Unary {
                sym: Symbol::KwDef,
                node,
                ..
            } => node,
            ref other => panic!("def was {:?}", other),
        }
    }

    /// The declared name of a def, for diagnostics.
    fn def_name_text(&self, def: AstId) -> Option<String> {
        let target = match self.ast.get(def).kind {
            AstKind::Unary {
                sym: Symbol::KwDef,
                node,
                ..
            } => node,
            _ => return None,
        };
        let name = match &self.ast.get(target).kind {
            AstKind::Binary { left, .. } => *left,
            AstKind::Compound { elems } => *elems.get(1)?,
            _ => return None,
        };
        Some(self.token_text(name))
    }

    /// Publish the placeholder symbol for a def so the whole block can see
    /// the name before the def's own fiber runs. Idempotent.
    fn publish_def(
        &mut self,
        def: AstId,
        scope: ScopeId,
        parent: Option<SymbolId>,
    ) {
        if self.def_syms.contains_key(&def) {
            return;
        }
        let target = self.def_target(def);
        match self.ast.get(target).kind.clone() {
            AstKind::Binary { sym, left: name, .. } => {
                let kind = match sym {
                    Symbol::KwStruct => SuperKind::Struct,
                    Symbol::KwUnion => SuperKind::Union,
                    Symbol::KwEnum => SuperKind::Enum,
                    Symbol::KwTuple => SuperKind::Tuple,
                    _ => return,
                };
                let owner = match kind {
                    SuperKind::Struct | SuperKind::Tuple => OwnerKind::Struct,
                    SuperKind::Union => OwnerKind::Union,
                    SuperKind::Enum => OwnerKind::Enum,
                };
                let inner = self.symbols.make_child(scope, owner);
                // The type id is stable from here on: named supercompounds
                // are identified by their scope
                let placeholder = self.wk().NONE;
                let ty = self.types.add_supercompound(
                    kind,
                    placeholder,
                    Some(inner),
                    false,
                    false,
                );
                if let Some(sym) = self.bind_name(name, |symbols, text| {
                    symbols.add_type(scope, text, ty, Some(inner), Some(def))
                }) {
                    self.def_syms.insert(def, sym);
                }
            }
            AstKind::Compound { elems } => {
                let name = elems[1];
                if let Some(sym) = self.bind_name(name, |symbols, text| {
                    symbols.add_or_get_function(scope, text, Some(def))
                }) {
                    self.def_syms.insert(def, sym);
                    let _ = parent;
                }
            }
            _ => {}
        }
    }

    fn compile_def(
        &mut self,
        def: AstId,
        scope: ScopeId,
        parent: Option<SymbolId>,
    ) -> Progress<()> {
        if self.ast.get(def).compiled.is_some() {
            return Ok(());
        }
        self.publish_def(def, scope, parent);
        let target = self.def_target(def);
        match self.ast.get(target).kind.clone() {
            AstKind::Binary {
                sym: Symbol::KwStruct,
                right: body,
                ..
            } => self.compile_super_def(def, body, SuperKind::Struct, scope)?,
            AstKind::Binary {
                sym: Symbol::KwUnion,
                right: body,
                ..
            } => self.compile_super_def(def, body, SuperKind::Union, scope)?,
            AstKind::Binary {
                sym: Symbol::KwEnum,
                right: body,
                ..
            } => self.compile_enum_def(def, body)?,
            AstKind::Binary {
                sym: Symbol::KwTuple,
                right: body,
                ..
            } => self.compile_tuple_def(def, body, scope)?,
            AstKind::Compound { .. } => {
                self.compile_fn_def(def, target, scope, parent)?
            }
            _ => {
                self.poison(def, CompileError::InvalidStatement);
            }
        }
        self.ast.get_mut(def).compiled = Some(def);
        Ok(())
    }

    /// Structs and unions: compile members into the inner scope, intern
    /// the final compound, then wait for the fixed-point size.
    fn compile_super_def(
        &mut self,
        def: AstId,
        body: AstId,
        kind: SuperKind,
        scope: ScopeId,
    ) -> Progress<()> {
        let sym = match self.def_syms.get(&def) {
            Some(&sym) => sym,
            None => return Ok(()), // name was a placeholder; diagnosed
        };
        let (sct, inner) = match &self.symbols.symbol(sym).kind {
            SymbolKind::Type { ty, scope, .. } => (*ty, scope.unwrap()),
            _ => return Ok(()),
        };

        let elems = match &self.ast.get(body).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            other => panic!("struct body was {:?}", other),
        };

        // Publish and enqueue methods first, like any block
        if !self.prescanned.contains(&body) {
            self.prescanned.insert(body);
            for &stmt in &elems {
                if self.is_def(stmt) {
                    self.publish_def(stmt, inner, Some(sym));
                    self.queue.push(Fiber::new(FiberTask::Def {
                        node: stmt,
                        scope: inner,
                        parent: Some(sym),
                    }));
                }
            }
        }

        // Member declarations, in order
        let ctx = StmtCtx {
            scope: inner,
            block: body,
            in_loop: false,
            in_switch: false,
            in_try: false,
        };
        let mut members = Vec::new();
        let mut index = 0u64;
        for &stmt in &elems {
            if self.is_def(stmt) {
                continue;
            }
            match self.ast.get(stmt).kind.clone() {
                AstKind::Binary {
                    sym:
                        declarator @ (Symbol::KwVar
                        | Symbol::KwLet
                        | Symbol::KwRef),
                    left: typed,
                    right: values,
                } => {
                    let (_, names, ty_ast) = self.ast.binary(typed);
                    let member_ty = self.compile_type_node(ty_ast, ctx)?;
                    if !self.ast.get(values).is_none() {
                        let value_elems =
                            match &self.ast.get(values).kind {
                                AstKind::Compound { elems } => elems.clone(),
                                _ => vec![values],
                            };
                        for value in value_elems {
                            let ty = self.compile_expr(value, ctx)?;
                            if !self.weak_convertible(
                                ty,
                                member_ty,
                                Some(value),
                            ) {
                                let from = self.types.to_string(ty);
                                let to = self.types.to_string(member_ty);
                                self.error_node(
                                    value,
                                    CompileError::TypeMismatch { from, to },
                                );
                            }
                        }
                        self.ast.get_mut(values).compiled = Some(values);
                    }
                    let name_nodes = match &self.ast.get(names).kind {
                        AstKind::Compound { elems } => elems.clone(),
                        _ => vec![names],
                    };
                    for name in name_nodes {
                        let field_index = index;
                        self.bind_name(name, |symbols, text| {
                            symbols.add_field(
                                inner,
                                text,
                                field_index,
                                sct,
                                Some(stmt),
                            )
                        });
                        members.push(crate::ty::Member {
                            ty: member_ty,
                            compiletime: declarator == Symbol::KwLet,
                            reference: declarator == Symbol::KwRef,
                        });
                        index += 1;
                    }
                    self.ast.get_mut(typed).compiled = Some(typed);
                    self.ast.get_mut(stmt).compiled = Some(stmt);
                }
                AstKind::None => {
                    self.ast.get_mut(stmt).compiled = Some(stmt);
                }
                _ => {
                    self.error_node(stmt, CompileError::InvalidStatement);
                    self.ast.get_mut(stmt).compiled = Some(stmt);
                }
            }
        }

        let compound = self.types.add_compound(members);
        self.types.set_supercompound_compound(sct, compound);
        self.size_wait(sct)?;

        let node = self.ast.get_mut(def);
        node.compiletime = true;
        if let SymbolKind::Type { defined, .. } =
            &mut self.symbols.symbol_mut(sym).kind
        {
            *defined = true;
        }
        let _ = kind;
        Ok(())
    }

    /// Enums: members are named constants of the enum type, counting up
    /// from zero unless assigned.
    fn compile_enum_def(&mut self, def: AstId, body: AstId) -> Progress<()> {
        let sym = match self.def_syms.get(&def) {
            Some(&sym) => sym,
            None => return Ok(()),
        };
        let (sct, inner) = match &self.symbols.symbol(sym).kind {
            SymbolKind::Type { ty, scope, .. } => (*ty, scope.unwrap()),
            _ => return Ok(()),
        };
        let elems = match &self.ast.get(body).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            other => panic!("enum body was {:?}", other),
        };
        let mut next_value = 0u64;
        for entry in elems {
            let (name, value) = match self.ast.get(entry).kind.clone() {
                AstKind::Binary {
                    sym: Symbol::Assign,
                    left,
                    right,
                } => {
                    let value =
                        const_eval(self.ast, self.symbols, right)
                            .unwrap_or_else(|| {
                                self.error_node(
                                    right,
                                    CompileError::NotCompiletime,
                                );
                                next_value
                            });
                    (left, value)
                }
                _ => (entry, next_value),
            };
            next_value = value.wrapping_add(1);
            self.bind_name(name, |symbols, text| {
                symbols.add_field(inner, text, value, sct, Some(entry))
            });
            self.ast.get_mut(entry).compiled = Some(entry);
        }
        let u64_ty = self.wk().U64;
        let compound = self.types.add_compound(vec![crate::ty::Member {
            ty: u64_ty,
            compiletime: true,
            reference: false,
        }]);
        self.types.set_supercompound_compound(sct, compound);
        self.size_wait(sct)?;
        if let SymbolKind::Type { defined, .. } =
            &mut self.symbols.symbol_mut(sym).kind
        {
            *defined = true;
        }
        Ok(())
    }

    fn compile_tuple_def(
        &mut self,
        def: AstId,
        body: AstId,
        scope: ScopeId,
    ) -> Progress<()> {
        let sym = match self.def_syms.get(&def) {
            Some(&sym) => sym,
            None => return Ok(()),
        };
        let sct = match &self.symbols.symbol(sym).kind {
            SymbolKind::Type { ty, .. } => *ty,
            _ => return Ok(()),
        };
        let elems = match &self.ast.get(body).kind {
            AstKind::Compound { elems } => elems.clone(),
            other => panic!("tuple body was {:?}", other),
        };
        let ctx = StmtCtx {
            scope,
            block: body,
            in_loop: false,
            in_switch: false,
            in_try: false,
        };
        let mut members = Vec::new();
        for ty_ast in elems {
            let ty = self.compile_type_node(ty_ast, ctx)?;
            members.push(crate::ty::Member {
                ty,
                compiletime: false,
                reference: false,
            });
        }
        let compound = self.types.add_compound(members);
        self.types.set_supercompound_compound(sct, compound);
        self.size_wait(sct)?;
        if let SymbolKind::Type { defined, .. } =
            &mut self.symbols.symbol_mut(sym).kind
        {
            *defined = true;
        }
        Ok(())
    }

    /// Functions: compile the signature (parameter/return types must be
    /// compile-time type values), publish the overload, then compile the
    /// body. Methods wait for their parent type and receive `this`.
    fn compile_fn_def(
        &mut self,
        def: AstId,
        target: AstId,
        scope: ScopeId,
        parent: Option<SymbolId>,
    ) -> Progress<()> {
        let sym = match self.def_syms.get(&def) {
            Some(&sym) => sym,
            None => return Ok(()),
        };
        let elems = match &self.ast.get(target).kind {
            AstKind::Compound { elems } => elems.clone(),
            other => panic!("function def was {:?}", other),
        };
        let (_captures, _name, signature, body) =
            (elems[0], elems[1], elems[2], elems[3]);

        let (ftable, inner) = match self.def_scopes.get(&def) {
            Some(&scopes) => scopes,
            None => {
                let ftable =
                    self.symbols.make_child(scope, OwnerKind::Function);
                let inner =
                    self.symbols.make_child(scope, OwnerKind::Function);
                self.def_scopes.insert(def, (ftable, inner));
                (ftable, inner)
            }
        };

        let method = parent
            .map(|p| {
                matches!(self.symbols.symbol(p).kind, SymbolKind::Type { .. })
            })
            .unwrap_or(false);

        let mut params: Vec<Param> = Vec::new();
        let mut infos: Vec<ParamInfo> = Vec::new();

        if method {
            let parent = parent.unwrap();
            // Methods cannot influence their parent type, so the parent is
            // guaranteed to eventually define (or fail on its own)
            self.define_wait(parent)?;
            let parent_ty = self.symbols.symbol(parent).ty().unwrap();
            let mut this = Param::plain(parent_ty);
            this.reference = true;
            this.thisarg = true;
            params.push(this);
            infos.push(ParamInfo {
                name: "this".into(),
                default: None,
            });
            if let Ok(this_sym) = self.symbols.add_variable(
                ftable,
                "this",
                parent_ty,
                None,
                Some(def),
            ) {
                if let SymbolKind::Variable {
                    defined,
                    thisarg,
                    reference,
                    ..
                } = &mut self.symbols.symbol_mut(this_sym).kind
                {
                    *defined = true;
                    *thisarg = true;
                    *reference = true;
                }
            }
        }

        let sig_ctx = StmtCtx {
            scope: ftable,
            block: body,
            in_loop: false,
            in_switch: false,
            in_try: false,
        };

        // Parameters
        let (_, param_list, rets_node) = self.ast.binary(signature);
        let param_nodes = match &self.ast.get(param_list).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => Vec::new(),
        };
        let generic_ty = self.wk().GENERIC;
        for param_node in param_nodes {
            let (declarator, named, typed) = self.ast.binary(param_node);
            let (_, name, default) = self.ast.binary(named);
            let (colon, ty_ast, spread) = self.ast.binary(typed);

            let ty = self.compile_type_node(ty_ast, sig_ctx)?;
            let mut param = Param::plain(ty);
            param.compiletime = declarator == Symbol::KwLet;
            param.reference = declarator == Symbol::KwRef;
            param.binding = colon == Symbol::DColon;
            param.generic = ty == generic_ty;
            param.spread = !self.ast.get(spread).is_none();

            if !self.ast.get(default).is_none() {
                self.compile_expr(default, sig_ctx)?;
            }

            let name_text = match &self.ast.get(name).kind {
                AstKind::Zero { .. } => String::new(),
                _ => self.token_text(name),
            };
            if !name_text.is_empty() {
                if let Some(param_sym) =
                    self.bind_name(name, |symbols, text| {
                        symbols.add_variable(
                            ftable,
                            text,
                            ty,
                            None,
                            Some(param_node),
                        )
                    })
                {
                    if let SymbolKind::Variable {
                        defined,
                        compiletime,
                        reference,
                        ty: sym_ty,
                        ..
                    } = &mut self.symbols.symbol_mut(param_sym).kind
                    {
                        *sym_ty = ty;
                        *defined = true;
                        *compiletime = param.compiletime;
                        *reference = param.reference;
                    }
                }
            }
            params.push(param);
            infos.push(ParamInfo {
                name: name_text,
                default: if self.ast.get(default).is_none() {
                    None
                } else {
                    Some(default)
                },
            });
            self.ast.get_mut(param_node).compiled = Some(param_node);
        }

        // Returns
        let (_, rets_inner, _) = self.ast.unary(rets_node);
        let infer_ty = self.wk().INFER;
        let mut rets: Vec<Ret> = Vec::new();
        let mut ret_names: Vec<String> = Vec::new();
        let mut any_infer = false;
        match self.ast.get(rets_inner).kind.clone() {
            AstKind::Type { ty } if ty == infer_ty => {
                any_infer = true;
            }
            AstKind::Compound { elems } => {
                for ret_node in elems {
                    let (declarator, name, ty_ast) = self.ast.binary(ret_node);
                    let ty = self.compile_type_node(ty_ast, sig_ctx)?;
                    if ty == infer_ty {
                        any_infer = true;
                    }
                    let mut ret = Ret::plain(ty);
                    ret.compiletime = declarator == Symbol::KwLet;
                    ret.reference = declarator == Symbol::KwRef;
                    rets.push(ret);
                    ret_names.push(match &self.ast.get(name).kind {
                        AstKind::Zero { .. } => String::new(),
                        _ => self.token_text(name),
                    });
                    self.ast.get_mut(ret_node).compiled = Some(ret_node);
                }
            }
            ref other => panic!("function returns were {:?}", other),
        }

        let e64 = self.wk().E64;
        let has_e64 = rets.iter().any(|ret| ret.ty == e64);

        // A fully declared signature defines the function now, which is
        // what lets mutually recursive bodies compile
        if !any_infer {
            self.intern_function(
                sym,
                def,
                body,
                params.clone(),
                rets.clone(),
                infos.clone(),
                ret_names.clone(),
                inner,
            );
        }
        self.ast.get_mut(signature).compiled = Some(signature);

        // Body
        if !self.ast.get(body).is_none() {
            let mut fnctx = FnCtx {
                sym,
                scope: ftable,
                rets: if any_infer && rets.is_empty() {
                    vec![Ret::plain(infer_ty)]
                } else {
                    rets.clone()
                },
                infer: any_infer && rets.is_empty(),
                inferred: false,
                gotos: Vec::new(),
                has_e64,
            };
            let body_ctx = StmtCtx {
                scope: ftable,
                block: body,
                in_loop: false,
                in_switch: false,
                in_try: false,
            };
            self.block_scopes.entry(body).or_insert(ftable);
            self.compile_block_in(body, ftable, body_ctx, Some(&mut fnctx))?;
            self.resolve_gotos(&mut fnctx);

            if any_infer {
                // Anything still inferred becomes void; partial inference
                // failures are diagnosed
                let mut final_rets = fnctx.rets.clone();
                if !fnctx.inferred && final_rets.len() == 1 {
                    let u0 = self.wk().U0;
                    final_rets[0] = Ret::plain(u0);
                } else {
                    let mut had_error = false;
                    for ret in &mut final_rets {
                        if ret.ty == infer_ty {
                            if !had_error {
                                had_error = true;
                                self.error_node(
                                    def,
                                    CompileError::Expected {
                                        expected:
                                            "returns that determine the \
                                             inferred types"
                                                .into(),
                                    },
                                );
                            }
                            ret.ty = self.wk().ERROR_TYPE;
                        }
                    }
                }
                self.intern_function(
                    sym, def, body, params, final_rets, infos, ret_names,
                    inner,
                );
            }
        } else if any_infer {
            // Signature-only function type with inferred returns
            self.error_node(
                def,
                CompileError::Expected {
                    expected: "a function body".into(),
                },
            );
        }
        Ok(())
    }

    /// Intern the function/superfunction pair, record the overload and
    /// mark the symbol defined. Idempotent across fiber re-runs.
    #[allow(clippy::too_many_arguments)]
    fn intern_function(
        &mut self,
        sym: SymbolId,
        def: AstId,
        body: AstId,
        params: Vec<Param>,
        rets: Vec<Ret>,
        infos: Vec<ParamInfo>,
        ret_names: Vec<String>,
        inner: ScopeId,
    ) {
        let generic = params.iter().any(|param| param.generic);
        let function = self.types.add_function(params, rets);
        let superfunction = self.types.add_superfunction(
            function,
            infos,
            ret_names,
            Some(inner),
            generic,
            false,
        );
        let body_value = if self.ast.get(body).is_none() {
            None
        } else {
            Some(body)
        };
        if let SymbolKind::Function {
            overloads, defined, ..
        } = &mut self.symbols.symbol_mut(sym).kind
        {
            match overloads.iter_mut().find(|o| o.value == body_value) {
                Some(overload) => overload.ty = superfunction,
                None => overloads.push(Overload {
                    ty: superfunction,
                    value: body_value,
                    defined: true,
                    scope: Some(inner),
                }),
            }
            *defined = true;
        }
        let _ = def;
    }

    fn resolve_gotos(&mut self, fnctx: &mut FnCtx) {
        let gotos = std::mem::take(&mut fnctx.gotos);
        for goto in gotos {
            let target = match self.ast.get(goto).kind {
                AstKind::Unary { node, .. } => node,
                _ => continue,
            };
            if matches!(
                self.ast.get(target).kind,
                AstKind::Identifier { sym: Some(_) }
            ) {
                continue;
            }
            let name = self.token_text(target);
            match self.symbols.get(fnctx.scope, &name, false, OwnerKind::Free)
            {
                Lookup::Found(label)
                    if matches!(
                        self.symbols.symbol(label).kind,
                        SymbolKind::Label
                    ) =>
                {
                    self.ast.get_mut(target).kind =
                        AstKind::Identifier { sym: Some(label) };
                    self.ast.get_mut(target).compiled = Some(target);
                }
                _ => {
                    self.error_node(target, CompileError::UnknownLabel);
                }
            }
        }
    }

    /// The type of the last condition in a compound, once compiled.
    fn last_cond_type(&self, conds: AstId) -> TypeId {
        match &self.ast.get(conds).kind {
            AstKind::Compound { elems } => elems
                .last()
                .map(|&last| self.ast.get(last).ty)
                .unwrap_or(self.ast.get(conds).ty),
            _ => self.ast.get(conds).ty,
        }
    }
}

/// Best-effort compile-time evaluation of integer constants: literals,
/// `let` bindings, unary minus and the basic integer arithmetic. Used for
/// enum values, array sizes and numeric-for step direction.
pub fn const_eval(
    ast: &AstArena,
    symbols: &SymbolArena,
    node: AstId,
) -> Option<u64> {
    let n = ast.get(node);
    // Follow semantic replacements
    if let Some(replacement) = n.compiled {
        if replacement != node {
            return const_eval(ast, symbols, replacement);
        }
    }
    match &n.kind {
        AstKind::Value { value } => Some(*value),
        AstKind::Identifier { sym: Some(sym) } => {
            match &symbols.symbol(*sym).kind {
                SymbolKind::Variable {
                    value: Some(value),
                    compiletime: true,
                    ..
                } => const_eval(ast, symbols, *value),
                SymbolKind::Field { index, .. } => Some(*index),
                _ => None,
            }
        }
        AstKind::Unary {
            sym: Symbol::Sub,
            node,
            ..
        } => const_eval(ast, symbols, *node).map(u64::wrapping_neg),
        AstKind::Binary { sym, left, right } => {
            let lhs = const_eval(ast, symbols, *left)?;
            let rhs = const_eval(ast, symbols, *right)?;
            match sym {
                Symbol::Add => Some(lhs.wrapping_add(rhs)),
                Symbol::Sub => Some(lhs.wrapping_sub(rhs)),
                Symbol::Mul => Some(lhs.wrapping_mul(rhs)),
                Symbol::Div if rhs != 0 => Some(lhs / rhs),
                Symbol::Modulo if rhs != 0 => Some(lhs % rhs),
                Symbol::Shl => Some(lhs.wrapping_shl(rhs as u32)),
                Symbol::Shr => Some(lhs.wrapping_shr(rhs as u32)),
                Symbol::Or => Some(lhs | rhs),
                Symbol::And => Some(lhs & rhs),
                Symbol::Xor => Some(lhs ^ rhs),
                _ => None,
            }
        }
        _ => None,
    }
}
