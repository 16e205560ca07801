//! Lowering from the typed AST to the three-address IR. The builder keeps
//! a stack of block records whose end sentinels are created up front and
//! spliced in when the block closes, so jumps to "after this block" can be
//! produced before the block's contents exist. Deferred expressions are
//! emitted between the last statement and the block-end sentinel, and a
//! function-wide `returning` temp is tested after every block that saw an
//! early return, which is what unwinds through the defer chains.

use crate::ast::{AstArena, AstId, AstKind};
use crate::error::{CompileError, SourceErrorWrapper};
use crate::grammar::Symbol;
use crate::ir::{IrBody, IrOp, IrParam, TripleId};
use crate::sema::const_eval;
use crate::symbol::{SymbolArena, SymbolId, SymbolKind};
use crate::token::TokenStream;
use crate::ty::{PrimitiveKind, TypeId, TypeKind, TypeTable};
use std::collections::HashMap;

/// Lower a module's root block. Non-def statements become the module's
/// top-level flow; every function definition (at any nesting depth) is
/// appended after it between FUNCTION_START/FUNCTION_END sentinels.
pub fn lower_module(
    ast: &AstArena,
    symbols: &SymbolArena,
    types: &TypeTable,
    tokens: &TokenStream,
    src: &str,
    root: AstId,
    errors: &mut Vec<SourceErrorWrapper<CompileError>>,
) -> IrBody {
    let mut lowerer = Lowerer {
        ast,
        symbols,
        types,
        tokens,
        src,
        errors,
        body: IrBody::new(),
        latest: None,
        blocks: Vec::new(),
        loops: Vec::new(),
        switches: Vec::new(),
        tries: Vec::new(),
        fn_end: None,
        returning: None,
        labels: HashMap::new(),
        pending_gotos: Vec::new(),
        functions: Vec::new(),
    };

    let start = lowerer.append(IrOp::BlockStart);
    lowerer.body.start = Some(start);
    lowerer.lower_block_body(root);
    lowerer.append(IrOp::BlockEnd);

    // Functions, in discovery order (nested ones were queued while
    // lowering their parents' statements or collected from defs)
    lowerer.collect_functions(root);
    let mut i = 0;
    while i < lowerer.functions.len() {
        let def = lowerer.functions[i];
        lowerer.lower_function(def);
        i += 1;
    }

    let mut body = std::mem::take(&mut lowerer.body);
    body.remove_dead_noops();
    body
}

struct LoopCtx {
    /// Target of `continue`
    continue_to: TripleId,
    /// Target of `break`
    break_to: TripleId,
}

struct SwitchCtx {
    /// Target of `break`
    end: TripleId,
    /// Target of `continue` (the next case's body), when there is one
    next_case: Option<TripleId>,
}

struct TryCtx {
    catch: TripleId,
    err_tmp: TripleId,
}

struct BlockCtx {
    /// Jump target for leaving the block: the head of its defer region.
    /// Early exits land here so deferred expressions still run.
    exit: TripleId,
    /// A return was lowered somewhere inside; unwind tests are needed
    saw_return: bool,
}

struct Lowerer<'a> {
    ast: &'a AstArena,
    symbols: &'a SymbolArena,
    types: &'a TypeTable,
    tokens: &'a TokenStream,
    src: &'a str,
    errors: &'a mut Vec<SourceErrorWrapper<CompileError>>,
    body: IrBody,
    latest: Option<TripleId>,
    blocks: Vec<BlockCtx>,
    loops: Vec<LoopCtx>,
    switches: Vec<SwitchCtx>,
    tries: Vec<TryCtx>,
    fn_end: Option<TripleId>,
    /// The function-wide early-return flag temp
    returning: Option<TripleId>,
    labels: HashMap<SymbolId, TripleId>,
    pending_gotos: Vec<(SymbolId, TripleId)>,
    /// Function defs discovered during lowering
    functions: Vec<AstId>,
}

impl<'a> Lowerer<'a> {
    // ===== Chain plumbing =====

    fn append(&mut self, op: IrOp) -> TripleId {
        self.append_with(op, IrParam::None, IrParam::None)
    }

    fn append_with(
        &mut self,
        op: IrOp,
        p1: IrParam,
        p2: IrParam,
    ) -> TripleId {
        let id = self.body.make_with(op, p1, p2);
        if let Some(latest) = self.latest {
            self.body.link(latest, id);
        }
        self.latest = Some(id);
        id
    }

    fn append_typed(
        &mut self,
        op: IrOp,
        p1: IrParam,
        p2: IrParam,
        ty: TypeId,
    ) -> TripleId {
        let id = self.append_with(op, p1, p2);
        self.body.get_mut(id).result_ty = Some(ty);
        id
    }

    /// A detached NOOP to be spliced in later as a jump target.
    fn make_pending(&mut self) -> TripleId {
        self.body.make(IrOp::Noop)
    }

    /// Splice a previously made pending triple in at the current point.
    fn place(&mut self, id: TripleId) {
        if let Some(latest) = self.latest {
            self.body.link(latest, id);
        }
        self.latest = Some(id);
    }

    fn jump_to(&mut self, target: TripleId) -> TripleId {
        let jump = self.append(IrOp::Jump);
        self.body.get_mut(jump).cond = Some(target);
        jump
    }

    fn branch(&mut self, op: IrOp, value: TripleId, target: TripleId) {
        let branch =
            self.append_with(op, IrParam::Triple(value), IrParam::None);
        self.body.get_mut(branch).cond = Some(target);
    }

    fn error_node(&mut self, node: AstId, error: CompileError) {
        let span = self.tokens.get(self.ast.get(node).token).span;
        self.errors
            .push(SourceErrorWrapper::new(error, span, self.src));
    }

    /// Follow the `compiled` replacement chain set by semantic analysis.
    fn resolve(&self, node: AstId) -> AstId {
        match self.ast.get(node).compiled {
            Some(replacement) if replacement != node => {
                self.resolve(replacement)
            }
            _ => node,
        }
    }

    // ===== Functions =====

    /// Collect every function def reachable from a block (functions nested
    /// in structs included).
    fn collect_functions(&mut self, block: AstId) {
        let elems = match &self.ast.get(block).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            _ => return,
        };
        for stmt in elems {
            if let AstKind::Unary {
                sym: Symbol::KwDef,
                node: target,
                ..
            } = self.ast.get(stmt).kind
            {
                match self.ast.get(target).kind.clone() {
                    AstKind::Compound { .. } => self.functions.push(stmt),
                    AstKind::Binary { right: body, .. } => {
                        // Supertypes: scan their bodies for methods
                        if matches!(
                            self.ast.get(body).kind,
                            AstKind::Block { .. }
                        ) {
                            self.collect_functions(body);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn lower_function(&mut self, def: AstId) {
        let target = match self.ast.get(def).kind {
            AstKind::Unary { node, .. } => node,
            _ => return,
        };
        let elems = match &self.ast.get(target).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => return,
        };
        let (captures, name, _signature, body) =
            (elems[0], elems[1], elems[2], elems[3]);

        if let AstKind::Compound { elems } = &self.ast.get(captures).kind {
            if !elems.is_empty() {
                // Capture lowering is deliberately unsupported
                self.error_node(def, CompileError::CapturedClosure);
                return;
            }
        }
        if self.ast.get(body).is_none() {
            return;
        }

        let fn_sym = match self.ast.get(name).kind {
            AstKind::Identifier { sym: Some(sym) } => Some(sym),
            _ => None,
        };

        let start = self.make_pending();
        self.body.get_mut(start).op = IrOp::FunctionStart;
        if let Some(sym) = fn_sym {
            self.body.get_mut(start).p1 = IrParam::Symbol(sym);
            self.body.get_mut(start).label =
                Some(self.symbols.symbol(sym).name.clone());
        }
        self.place(start);

        let end = self.make_pending();
        self.body.get_mut(end).op = IrOp::FunctionEnd;

        let returning = self.append_with(
            IrOp::Temp,
            IrParam::Immediate(0),
            IrParam::None,
        );

        let old_end = self.fn_end.replace(end);
        let old_returning = self.returning.replace(returning);
        let old_labels = std::mem::take(&mut self.labels);
        let old_gotos = std::mem::take(&mut self.pending_gotos);

        self.lower_block(body);

        // Resolve any gotos against the labels of this function
        let gotos = std::mem::take(&mut self.pending_gotos);
        for (label, jump) in gotos {
            if let Some(&target) = self.labels.get(&label) {
                self.body.get_mut(jump).cond = Some(target);
            }
        }

        self.place(end);
        self.append(IrOp::Return);

        // Nested function defs lower after this one
        self.collect_functions(body);

        self.fn_end = old_end;
        self.returning = old_returning;
        self.labels = old_labels;
        self.pending_gotos = old_gotos;
    }

    // ===== Blocks and statements =====

    fn lower_block(&mut self, block: AstId) {
        self.append(IrOp::BlockStart);
        let exit = self.make_pending();
        self.blocks.push(BlockCtx {
            exit,
            saw_return: false,
        });

        self.lower_block_body(block);

        let ctx = self.blocks.pop().expect("block stack underflow");

        // Deferred expressions run between the exit point and the end
        // sentinel, already in reverse declaration order; early exits
        // jump to `exit`, so they pass through here too
        self.place(exit);
        let at_end = match &self.ast.get(block).kind {
            AstKind::Block { at_end, .. } => at_end.clone(),
            _ => Vec::new(),
        };
        for deferred in at_end {
            self.lower_stmt(deferred);
        }
        self.append(IrOp::BlockEnd);

        // If a return happened inside, unwind: jump onward to the next
        // enclosing block's exit (whose defers then also run) or to the
        // function end
        if ctx.saw_return {
            if let Some(returning) = self.returning {
                let target = match self.blocks.last() {
                    Some(outer) => Some(outer.exit),
                    None => self.fn_end,
                };
                if let Some(target) = target {
                    self.branch(IrOp::IfNotZero, returning, target);
                    if let Some(outer) = self.blocks.last_mut() {
                        outer.saw_return = true;
                    }
                }
            }
        }
    }

    fn lower_block_body(&mut self, block: AstId) {
        let elems = match &self.ast.get(block).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            _ => return,
        };
        for stmt in elems {
            self.lower_stmt(stmt);
        }
    }

    fn lower_stmt(&mut self, node: AstId) {
        match self.ast.get(node).kind.clone() {
            AstKind::None => {}
            AstKind::Unary {
                sym: Symbol::KwDef, ..
            } => {
                // Type defs produce no code; function defs are lowered
                // separately
            }
            AstKind::Block { .. } => self.lower_block(node),
            AstKind::Zero { sym: Symbol::KwBreak } => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.break_to)
                    .or_else(|| self.switches.last().map(|s| s.end));
                if let Some(target) = target {
                    self.jump_to(target);
                }
            }
            AstKind::Zero {
                sym: Symbol::KwContinue,
            } => {
                // Inside a switch case `continue` falls through to the
                // next case; inside a loop it restarts it
                if let Some(switch) = self.switches.last() {
                    if let Some(next) = switch.next_case {
                        self.jump_to(next);
                        return;
                    }
                }
                if let Some(target) =
                    self.loops.last().map(|l| l.continue_to)
                {
                    self.jump_to(target);
                }
            }
            AstKind::Unary { sym, node: inner, .. } => match sym {
                Symbol::KwImport | Symbol::KwUsing => {}
                Symbol::KwReturn => self.lower_return(node, inner),
                Symbol::KwRaise => self.lower_raise(inner),
                Symbol::KwGoto => self.lower_goto(inner),
                Symbol::KwLabel => self.lower_label(inner),
                Symbol::KwDefer => {
                    // Emission happens at block end; nothing here
                }
                Symbol::KwDelete => {
                    let value = self.lower_expr(inner);
                    self.append_with(
                        IrOp::Delete,
                        IrParam::Triple(value),
                        IrParam::None,
                    );
                }
                Symbol::KwLoop => self.lower_loop(inner),
                _ => {
                    self.lower_expr(node);
                }
            },
            AstKind::Binary { sym, left, right } => match sym {
                Symbol::KwNamespace => self.lower_block_body(right),
                Symbol::KwVar | Symbol::KwLet | Symbol::KwRef => {
                    self.lower_decl(node, left, right)
                }
                Symbol::KwIf => self.lower_if(left, right),
                Symbol::KwWhile => self.lower_while(left, right),
                Symbol::KwDo => self.lower_dowhile(left, right),
                Symbol::KwFor => self.lower_for(left, right),
                Symbol::KwSwitch => self.lower_switch(left, right),
                Symbol::KwTry => self.lower_try(left, right),
                sym if sym == Symbol::Assign
                    || sym.assign_op().is_some() =>
                {
                    self.lower_assign(sym, left, right)
                }
                _ => {
                    self.lower_expr(node);
                }
            },
            _ => {
                self.lower_expr(node);
            }
        }
    }

    /// Lower a condition list; the returned triple carries the boolean.
    fn lower_conds(&mut self, conds: AstId) -> TripleId {
        let elems = match &self.ast.get(conds).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![conds],
        };
        let mut last = None;
        for &cond in &elems {
            let is_decl = matches!(
                self.ast.get(cond).kind,
                AstKind::Binary {
                    sym: Symbol::KwVar | Symbol::KwLet | Symbol::KwRef,
                    ..
                }
            );
            if is_decl {
                self.lower_stmt(cond);
            } else {
                last = Some(self.lower_expr(cond));
            }
        }
        last.unwrap_or_else(|| {
            self.append_with(
                IrOp::Value,
                IrParam::Immediate(1),
                IrParam::None,
            )
        })
    }

    fn lower_decl(&mut self, _node: AstId, typed: AstId, values: AstId) {
        let (_, names, _) = self.ast.binary(typed);
        let name_nodes = match &self.ast.get(names).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![names],
        };
        let value_elems = match &self.ast.get(values).kind {
            AstKind::Compound { elems } => elems.clone(),
            AstKind::None => Vec::new(),
            _ => vec![values],
        };

        // A single multi-valued call feeding several names projects with
        // INDEX
        if value_elems.len() == 1 && name_nodes.len() > 1 {
            let call = self.lower_expr(value_elems[0]);
            for (i, &name) in name_nodes.iter().enumerate() {
                if let Some(sym) = self.name_symbol(name) {
                    let projected = self.append_with(
                        IrOp::Index,
                        IrParam::Triple(call),
                        IrParam::Immediate(i as u64),
                    );
                    let place = self.append_with(
                        IrOp::Symbol,
                        IrParam::Symbol(sym),
                        IrParam::None,
                    );
                    self.append_with(
                        IrOp::Copy,
                        IrParam::Triple(place),
                        IrParam::Triple(projected),
                    );
                }
            }
            return;
        }

        for (i, &name) in name_nodes.iter().enumerate() {
            let sym = match self.name_symbol(name) {
                Some(sym) => sym,
                None => continue,
            };
            let place = self.append_with(
                IrOp::Symbol,
                IrParam::Symbol(sym),
                IrParam::None,
            );
            match value_elems.get(i) {
                Some(&value) => {
                    let value = self.lower_expr(value);
                    self.append_with(
                        IrOp::Copy,
                        IrParam::Triple(place),
                        IrParam::Triple(value),
                    );
                }
                None => {
                    // Declarations without initializers zero their storage
                    self.append_with(
                        IrOp::Zero,
                        IrParam::Triple(place),
                        IrParam::None,
                    );
                }
            }
        }
    }

    fn name_symbol(&self, name: AstId) -> Option<SymbolId> {
        match self.ast.get(name).kind {
            AstKind::Identifier { sym } => sym,
            _ => None,
        }
    }

    fn lower_if(&mut self, conds: AstId, branches: AstId) {
        let (_, then, orelse) = self.ast.binary(branches);
        let cond = self.lower_conds(conds);
        let else_target = self.make_pending();
        let end = self.make_pending();

        self.branch(IrOp::IfZero, cond, else_target);
        self.lower_block(then);
        self.jump_to(end);
        self.place(else_target);
        if !self.ast.get(orelse).is_none() {
            self.lower_block(orelse);
        }
        self.place(end);
    }

    fn lower_while(&mut self, conds: AstId, body: AstId) {
        let cond_start = self.append(IrOp::Noop);
        let end = self.make_pending();
        let cond = self.lower_conds(conds);
        self.branch(IrOp::IfZero, cond, end);
        self.loops.push(LoopCtx {
            continue_to: cond_start,
            break_to: end,
        });
        self.lower_block(body);
        self.loops.pop();
        self.jump_to(cond_start);
        self.place(end);
    }

    fn lower_loop(&mut self, body: AstId) {
        let start = self.append(IrOp::Noop);
        let end = self.make_pending();
        self.loops.push(LoopCtx {
            continue_to: start,
            break_to: end,
        });
        self.lower_block(body);
        self.loops.pop();
        self.jump_to(start);
        self.place(end);
    }

    fn lower_dowhile(&mut self, body: AstId, conds: AstId) {
        let start = self.append(IrOp::Noop);
        let end = self.make_pending();
        let cond_start = self.make_pending();
        self.loops.push(LoopCtx {
            continue_to: cond_start,
            break_to: end,
        });
        self.lower_block(body);
        self.loops.pop();
        self.place(cond_start);
        let cond = self.lower_conds(conds);
        self.branch(IrOp::IfNotZero, cond, start);
        self.place(end);
    }

    fn lower_for(&mut self, header: AstId, body: AstId) {
        match self.ast.get(header).kind.clone() {
            AstKind::Compound { elems } => {
                self.lower_for_classic(elems[0], elems[1], elems[2], body)
            }
            AstKind::Binary {
                sym: Symbol::KwIn,
                left: decl,
                right: seq,
            } => self.lower_for_each(decl, seq, body),
            AstKind::Binary {
                sym: Symbol::Assign,
                left: decl,
                right: range,
            } => self.lower_for_numeric(decl, range, body),
            ref other => panic!("bad for header {:?}", other),
        }
    }

    /// `for init; cond; step`: init, jump to the condition, body, step,
    /// condition, conditional jump back.
    fn lower_for_classic(
        &mut self,
        init: AstId,
        cond: AstId,
        step: AstId,
        body: AstId,
    ) {
        if !self.ast.get(init).is_none() {
            self.lower_stmt(init);
        }
        let cond_start = self.make_pending();
        let body_start = self.make_pending();
        let continue_to = self.make_pending();
        let end = self.make_pending();

        self.jump_to(cond_start);
        self.place(body_start);
        self.loops.push(LoopCtx {
            continue_to,
            break_to: end,
        });
        self.lower_block(body);
        self.loops.pop();
        self.place(continue_to);
        if !self.ast.get(step).is_none() {
            self.lower_stmt(step);
        }
        self.place(cond_start);
        if self.ast.get(cond).is_none() {
            self.jump_to(body_start);
        } else {
            let value = self.lower_expr(cond);
            self.branch(IrOp::IfZero, value, end);
            self.jump_to(body_start);
        }
        self.place(end);
    }

    /// `for var x in seq`: LENGTH-bounded counter loop indexing into the
    /// sequence.
    fn lower_for_each(&mut self, decl: AstId, seq: AstId, body: AstId) {
        let seq_value = self.lower_expr(seq);
        let limit = self.append_with(
            IrOp::Length,
            IrParam::Triple(seq_value),
            IrParam::None,
        );
        let counter = self.append_with(
            IrOp::Temp,
            IrParam::Immediate(0),
            IrParam::None,
        );

        let cond_start = self.make_pending();
        let body_start = self.make_pending();
        let continue_to = self.make_pending();
        let end = self.make_pending();

        self.jump_to(cond_start);
        self.place(body_start);

        // Bind the loop variable to the current element
        let (_, typed, _) = self.ast.binary(decl);
        let (_, names, _) = self.ast.binary(typed);
        let name = match &self.ast.get(names).kind {
            AstKind::Compound { elems } => elems[0],
            _ => names,
        };
        if let Some(sym) = self.name_symbol(name) {
            let element = self.append_with(
                IrOp::Index,
                IrParam::Triple(seq_value),
                IrParam::Triple(counter),
            );
            let place = self.append_with(
                IrOp::Symbol,
                IrParam::Symbol(sym),
                IrParam::None,
            );
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(place),
                IrParam::Triple(element),
            );
        }

        self.loops.push(LoopCtx {
            continue_to,
            break_to: end,
        });
        self.lower_block(body);
        self.loops.pop();

        self.place(continue_to);
        self.append_with(
            IrOp::Increment,
            IrParam::Triple(counter),
            IrParam::None,
        );
        self.place(cond_start);
        let compare = self.append_with(
            IrOp::Less,
            IrParam::Triple(counter),
            IrParam::Triple(limit),
        );
        self.branch(IrOp::IfNotZero, compare, body_start);
        self.place(end);
    }

    /// `for var i = start, stop[, step]`: when the step is omitted it is
    /// derived at compile time from the ordering of constant bounds
    /// (inclusive on both ends); an explicit step selects its comparison
    /// at runtime by sign.
    fn lower_for_numeric(&mut self, decl: AstId, range: AstId, body: AstId) {
        let bounds = match &self.ast.get(range).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![range],
        };
        let start_node = bounds[0];
        let stop_node = bounds.get(1).copied().unwrap_or(bounds[0]);
        let step_node = bounds.get(2).copied();

        let (_, typed, _) = self.ast.binary(decl);
        let (_, names, _) = self.ast.binary(typed);
        let name = match &self.ast.get(names).kind {
            AstKind::Compound { elems } => elems[0],
            _ => names,
        };
        let sym = match self.name_symbol(name) {
            Some(sym) => sym,
            None => return,
        };

        let start_value = self.lower_expr(start_node);
        let stop_value = self.lower_expr(stop_node);
        let place = self.append_with(
            IrOp::Symbol,
            IrParam::Symbol(sym),
            IrParam::None,
        );
        self.append_with(
            IrOp::Copy,
            IrParam::Triple(place),
            IrParam::Triple(start_value),
        );

        // Step: explicit, or ±1 decided from the constant bounds
        let derived_down = match step_node {
            Some(_) => false,
            None => {
                let start = const_eval(self.ast, self.symbols, start_node);
                let stop = const_eval(self.ast, self.symbols, stop_node);
                match (start, stop) {
                    (Some(a), Some(b)) => (a as i64) > (b as i64),
                    _ => false,
                }
            }
        };
        let step_value = match step_node {
            Some(step) => self.lower_expr(step),
            None => self.append_with(
                IrOp::Value,
                IrParam::Immediate(if derived_down {
                    (-1i64) as u64
                } else {
                    1
                }),
                IrParam::None,
            ),
        };

        let cond_start = self.make_pending();
        let body_start = self.make_pending();
        let continue_to = self.make_pending();
        let end = self.make_pending();

        self.jump_to(cond_start);
        self.place(body_start);
        self.loops.push(LoopCtx {
            continue_to,
            break_to: end,
        });
        self.lower_block(body);
        self.loops.pop();

        self.place(continue_to);
        let var = self.append_with(
            IrOp::Symbol,
            IrParam::Symbol(sym),
            IrParam::None,
        );
        let stepped = self.append_with(
            IrOp::Add,
            IrParam::Triple(var),
            IrParam::Triple(step_value),
        );
        let var_place = self.append_with(
            IrOp::Symbol,
            IrParam::Symbol(sym),
            IrParam::None,
        );
        self.append_with(
            IrOp::Copy,
            IrParam::Triple(var_place),
            IrParam::Triple(stepped),
        );

        self.place(cond_start);
        let var = self.append_with(
            IrOp::Symbol,
            IrParam::Symbol(sym),
            IrParam::None,
        );
        let in_range = if step_node.is_some() {
            // Runtime sign test selects the comparison direction
            let zero = self.append_with(
                IrOp::Value,
                IrParam::Immediate(0),
                IrParam::None,
            );
            let non_negative = self.append_with(
                IrOp::GreaterEquals,
                IrParam::Triple(step_value),
                IrParam::Triple(zero),
            );
            let result = self.append_with(
                IrOp::Temp,
                IrParam::Immediate(0),
                IrParam::None,
            );
            let downward = self.make_pending();
            let merged = self.make_pending();
            self.branch(IrOp::IfZero, non_negative, downward);
            let upward_check = self.append_with(
                IrOp::LessEquals,
                IrParam::Triple(var),
                IrParam::Triple(stop_value),
            );
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(result),
                IrParam::Triple(upward_check),
            );
            self.jump_to(merged);
            self.place(downward);
            let downward_check = self.append_with(
                IrOp::GreaterEquals,
                IrParam::Triple(var),
                IrParam::Triple(stop_value),
            );
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(result),
                IrParam::Triple(downward_check),
            );
            self.place(merged);
            result
        } else if derived_down {
            self.append_with(
                IrOp::GreaterEquals,
                IrParam::Triple(var),
                IrParam::Triple(stop_value),
            )
        } else {
            self.append_with(
                IrOp::LessEquals,
                IrParam::Triple(var),
                IrParam::Triple(stop_value),
            )
        };
        self.branch(IrOp::IfNotZero, in_range, body_start);
        self.place(end);
    }

    fn lower_switch(&mut self, conds: AstId, cases: AstId) {
        let subject = self.lower_conds(conds);
        let end = self.make_pending();

        let case_list = match &self.ast.get(cases).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            _ => Vec::new(),
        };

        // One pending body label per case, so dispatch can be emitted
        // first and fallthrough (`continue`) can target the next body
        let body_labels: Vec<TripleId> =
            case_list.iter().map(|_| self.make_pending()).collect();

        let mut else_target = None;
        for (i, &case) in case_list.iter().enumerate() {
            let (_, values, _) = self.ast.binary(case);
            match &self.ast.get(values).kind {
                AstKind::Zero { .. } => else_target = Some(body_labels[i]),
                AstKind::Compound { elems } => {
                    for &value in &elems.clone() {
                        let value_triple = self.lower_expr(value);
                        let equals = self.append_with(
                            IrOp::Equals,
                            IrParam::Triple(subject),
                            IrParam::Triple(value_triple),
                        );
                        self.branch(
                            IrOp::IfNotZero,
                            equals,
                            body_labels[i],
                        );
                    }
                }
                _ => {}
            }
        }
        match else_target {
            Some(target) => self.jump_to(target),
            None => self.jump_to(end),
        };

        for (i, &case) in case_list.iter().enumerate() {
            let (_, _, body) = self.ast.binary(case);
            self.place(body_labels[i]);
            self.switches.push(SwitchCtx {
                end,
                next_case: body_labels.get(i + 1).copied(),
            });
            self.lower_block(body);
            self.switches.pop();
            self.jump_to(end);
        }
        self.place(end);
    }

    fn lower_try(&mut self, body: AstId, catch: AstId) {
        let (_, err_name, handler) = self.ast.binary(catch);
        let err_tmp = self.append_with(
            IrOp::Temp,
            IrParam::Immediate(0),
            IrParam::None,
        );
        let catch_target = self.make_pending();
        let end = self.make_pending();

        self.tries.push(TryCtx {
            catch: catch_target,
            err_tmp,
        });
        self.lower_block(body);
        self.tries.pop();
        self.jump_to(end);

        self.place(catch_target);
        if let Some(sym) = self.name_symbol(err_name) {
            let place = self.append_with(
                IrOp::Symbol,
                IrParam::Symbol(sym),
                IrParam::None,
            );
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(place),
                IrParam::Triple(err_tmp),
            );
        }
        self.lower_block(handler);
        self.place(end);
    }

    fn lower_return(&mut self, _node: AstId, values: AstId) {
        let elems = match &self.ast.get(values).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![values],
        };
        for (i, &value) in elems.iter().enumerate() {
            let value_triple = self.lower_expr(value);
            self.append_with(
                IrOp::Retval,
                IrParam::Triple(value_triple),
                IrParam::Immediate(i as u64),
            );
        }
        self.unwind_return();
    }

    fn lower_raise(&mut self, value: AstId) {
        let value_triple = self.lower_expr(value);
        if let Some(t) = self.tries.last() {
            // Locally handled: store the error and enter the catch block
            let (catch, err_tmp) = (t.catch, t.err_tmp);
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(err_tmp),
                IrParam::Triple(value_triple),
            );
            self.jump_to(catch);
        } else {
            // Raising out of the function: the error travels in the e64
            // return slot
            self.append_with(
                IrOp::Retval,
                IrParam::Triple(value_triple),
                IrParam::Immediate(u64::MAX),
            );
            self.unwind_return();
        }
    }

    /// Set the returning flag and leave through the current block's end,
    /// so deferred expressions run.
    fn unwind_return(&mut self) {
        if let Some(returning) = self.returning {
            let one = self.append_with(
                IrOp::Value,
                IrParam::Immediate(1),
                IrParam::None,
            );
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(returning),
                IrParam::Triple(one),
            );
        }
        let target = match self.blocks.last() {
            Some(block) => Some(block.exit),
            None => self.fn_end,
        };
        if let Some(target) = target {
            self.jump_to(target);
        }
        if let Some(block) = self.blocks.last_mut() {
            block.saw_return = true;
        }
    }

    fn lower_goto(&mut self, target: AstId) {
        if let Some(sym) = self.name_symbol(target) {
            let jump = self.append(IrOp::Jump);
            self.pending_gotos.push((sym, jump));
        }
    }

    fn lower_label(&mut self, name: AstId) {
        if let Some(sym) = self.name_symbol(name) {
            let label = self.append(IrOp::Noop);
            self.body.get_mut(label).label =
                Some(self.symbols.symbol(sym).name.clone());
            self.labels.insert(sym, label);
        }
    }

    fn lower_assign(&mut self, sym: Symbol, lefts: AstId, rights: AstId) {
        let left_elems = match &self.ast.get(lefts).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![lefts],
        };
        let right_elems = match &self.ast.get(rights).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => vec![rights],
        };

        // Destructured call: project each value with INDEX
        if right_elems.len() == 1 && left_elems.len() > 1 {
            let call = self.lower_expr(right_elems[0]);
            for (i, &target) in left_elems.iter().enumerate() {
                let projected = self.append_with(
                    IrOp::Index,
                    IrParam::Triple(call),
                    IrParam::Immediate(i as u64),
                );
                let place = self.lower_place(target);
                self.append_with(
                    IrOp::Copy,
                    IrParam::Triple(place),
                    IrParam::Triple(projected),
                );
            }
            return;
        }

        for (i, &target) in left_elems.iter().enumerate() {
            let value = match right_elems.get(i) {
                Some(&value) => value,
                None => continue,
            };
            // Evaluate the right side, then the target place
            let mut value_triple = self.lower_expr(value);
            let place = self.lower_place(target);
            if let Some(op) = sym.assign_op() {
                let current = self.lower_expr(target);
                let combined = self.append_with(
                    self.binary_ir_op(op),
                    IrParam::Triple(current),
                    IrParam::Triple(value_triple),
                );
                value_triple = combined;
            }
            self.append_with(
                IrOp::Copy,
                IrParam::Triple(place),
                IrParam::Triple(value_triple),
            );
        }
    }

    /// Lower an expression as a place to store into.
    fn lower_place(&mut self, node: AstId) -> TripleId {
        let node = self.resolve(node);
        match self.ast.get(node).kind.clone() {
            AstKind::Identifier { sym: Some(sym) } => self.append_with(
                IrOp::Symbol,
                IrParam::Symbol(sym),
                IrParam::None,
            ),
            AstKind::Binary {
                sym: Symbol::OBrack,
                left,
                right,
            } => {
                let base = self.lower_expr(left);
                let index = self.lower_expr(right);
                self.append_with(
                    IrOp::Index,
                    IrParam::Triple(base),
                    IrParam::Triple(index),
                )
            }
            AstKind::Binary {
                sym: Symbol::Period,
                left,
                right,
            } => self.lower_field_access(left, right),
            AstKind::Unary {
                sym: Symbol::At,
                node: inner,
                ..
            } => {
                let value = self.lower_expr(inner);
                self.append_with(
                    IrOp::Dereference,
                    IrParam::Triple(value),
                    IrParam::None,
                )
            }
            _ => self.lower_expr(node),
        }
    }

    // ===== Expressions =====

    fn lower_expr(&mut self, node: AstId) -> TripleId {
        let node = self.resolve(node);
        let ty = self.ast.get(node).ty;
        match self.ast.get(node).kind.clone() {
            AstKind::None | AstKind::Zero { .. } => self.append_typed(
                IrOp::Value,
                IrParam::Immediate(0),
                IrParam::None,
                ty,
            ),
            AstKind::Value { .. } | AstKind::String { .. } => self
                .append_typed(
                    IrOp::Value,
                    IrParam::Literal(node),
                    IrParam::None,
                    ty,
                ),
            AstKind::Type { .. } => self.append_typed(
                IrOp::Value,
                IrParam::Immediate(0),
                IrParam::None,
                ty,
            ),
            AstKind::Identifier { sym: Some(sym) } => {
                match self.symbols.symbol(sym).kind {
                    SymbolKind::Field { index, .. } => self.append_typed(
                        IrOp::Value,
                        IrParam::Immediate(index),
                        IrParam::None,
                        ty,
                    ),
                    _ => self.append_typed(
                        IrOp::Symbol,
                        IrParam::Symbol(sym),
                        IrParam::None,
                        ty,
                    ),
                }
            }
            AstKind::Identifier { sym: None } => self.append_typed(
                IrOp::Value,
                IrParam::Immediate(0),
                IrParam::None,
                ty,
            ),
            AstKind::Compound { elems } => {
                // Literal compounds: each element, then a VALUE carrier
                // referencing the literal node
                for &elem in &elems {
                    self.lower_expr(elem);
                }
                self.append_typed(
                    IrOp::Value,
                    IrParam::Literal(node),
                    IrParam::None,
                    ty,
                )
            }
            AstKind::Block { .. } => {
                self.lower_block(node);
                self.append_typed(
                    IrOp::Value,
                    IrParam::Immediate(0),
                    IrParam::None,
                    ty,
                )
            }
            AstKind::Unary { sym, node: operand, .. } => {
                self.lower_unary(node, sym, operand, ty)
            }
            AstKind::Binary { sym, left, right } => {
                self.lower_binary(node, sym, left, right, ty)
            }
        }
    }

    fn lower_unary(
        &mut self,
        _node: AstId,
        sym: Symbol,
        operand: AstId,
        ty: TypeId,
    ) -> TripleId {
        let value = self.lower_expr(operand);
        let op = match sym {
            Symbol::Sub => IrOp::Negate,
            Symbol::Not => IrOp::Not,
            Symbol::Lnot => {
                return self.append_typed(
                    IrOp::Equals,
                    IrParam::Triple(value),
                    IrParam::Immediate(0),
                    ty,
                )
            }
            Symbol::At => IrOp::Dereference,
            Symbol::Mul => IrOp::Address,
            Symbol::Decrement => {
                let decremented = self.append_typed(
                    IrOp::Decrement,
                    IrParam::Triple(value),
                    IrParam::None,
                    ty,
                );
                let place = self.lower_place(operand);
                self.append_with(
                    IrOp::Copy,
                    IrParam::Triple(place),
                    IrParam::Triple(decremented),
                );
                return decremented;
            }
            Symbol::Spread => IrOp::Length,
            _ => {
                return self.append_typed(
                    IrOp::Value,
                    IrParam::Triple(value),
                    IrParam::None,
                    ty,
                )
            }
        };
        self.append_typed(op, IrParam::Triple(value), IrParam::None, ty)
    }

    fn lower_binary(
        &mut self,
        node: AstId,
        sym: Symbol,
        left: AstId,
        right: AstId,
        ty: TypeId,
    ) -> TripleId {
        match sym {
            Symbol::OParen => return self.lower_call(node, left, right, ty),
            Symbol::Period => {
                // Method call or field access
                if let AstKind::Binary {
                    sym: Symbol::OParen,
                    left: callee,
                    right: args,
                } = self.ast.get(right).kind.clone()
                {
                    return self.lower_method_call(
                        left, callee, args, ty,
                    );
                }
                return self.lower_field_access(left, right);
            }
            Symbol::OBrack => {
                let base = self.lower_expr(left);
                let index = self.lower_expr(right);
                return self.append_typed(
                    IrOp::Index,
                    IrParam::Triple(base),
                    IrParam::Triple(index),
                    ty,
                );
            }
            Symbol::DColon => return self.lower_expr(left),
            Symbol::DQuestion => {
                let (_, then, orelse) = self.ast.binary(right);
                let result = self.append_typed(
                    IrOp::Temp,
                    IrParam::Immediate(0),
                    IrParam::None,
                    ty,
                );
                let else_target = self.make_pending();
                let end = self.make_pending();
                let cond = self.lower_expr(left);
                self.branch(IrOp::IfZero, cond, else_target);
                let then_value = self.lower_expr(then);
                self.append_with(
                    IrOp::Copy,
                    IrParam::Triple(result),
                    IrParam::Triple(then_value),
                );
                self.jump_to(end);
                self.place(else_target);
                let else_value = self.lower_expr(orelse);
                self.append_with(
                    IrOp::Copy,
                    IrParam::Triple(result),
                    IrParam::Triple(else_value),
                );
                self.place(end);
                return result;
            }
            Symbol::KwNew => {
                let (_, ty_ast, count) = self.ast.binary(right);
                let elem_ty = match self.ast.get(self.resolve(ty_ast)).kind {
                    AstKind::Type { ty } => ty,
                    _ => ty,
                };
                let size =
                    self.types.get(elem_ty).size.unwrap_or(0).max(1);
                let count_value = self.lower_expr(count);
                let allocated = self.append_typed(
                    IrOp::New,
                    IrParam::Immediate(size),
                    IrParam::Triple(count_value),
                    ty,
                );
                if !self.ast.get(left).is_none() {
                    let init = self.lower_expr(left);
                    let slot = self.append_with(
                        IrOp::Dereference,
                        IrParam::Triple(allocated),
                        IrParam::None,
                    );
                    self.append_with(
                        IrOp::Copy,
                        IrParam::Triple(slot),
                        IrParam::Triple(init),
                    );
                }
                return allocated;
            }
            Symbol::KwAs => {
                let value = self.lower_expr(left);
                let from = self.ast.get(left).ty;
                return match self.conversion_op(from, ty) {
                    Some(op) => self.append_typed(
                        op,
                        IrParam::Triple(value),
                        IrParam::None,
                        ty,
                    ),
                    None => value,
                };
            }
            sym if sym == Symbol::Assign || sym.assign_op().is_some() => {
                self.lower_assign(sym, left, right);
                return self.append_typed(
                    IrOp::Value,
                    IrParam::Immediate(0),
                    IrParam::None,
                    ty,
                );
            }
            _ => {}
        }

        // Plain binary operators, with operand casts to the result class
        let mut lhs = self.lower_expr(left);
        let mut rhs = self.lower_expr(right);
        let result_class_src = match sym {
            // Comparisons compute in the operands' class
            Symbol::Lt | Symbol::Le | Symbol::Gt | Symbol::Ge
            | Symbol::Equals | Symbol::NotEquals => self.ast.get(left).ty,
            _ => ty,
        };
        if let Some(op) =
            self.conversion_op(self.ast.get(left).ty, result_class_src)
        {
            lhs = self.append_with(op, IrParam::Triple(lhs), IrParam::None);
        }
        if let Some(op) =
            self.conversion_op(self.ast.get(right).ty, result_class_src)
        {
            rhs = self.append_with(op, IrParam::Triple(rhs), IrParam::None);
        }
        self.append_typed(
            self.binary_ir_op(sym),
            IrParam::Triple(lhs),
            IrParam::Triple(rhs),
            ty,
        )
    }

    fn lower_call(
        &mut self,
        _node: AstId,
        callee: AstId,
        args: AstId,
        ty: TypeId,
    ) -> TripleId {
        let arg_nodes = match &self.ast.get(args).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => Vec::new(),
        };
        let mut arg_values = Vec::new();
        for &arg in &arg_nodes {
            arg_values.push(self.lower_expr(arg));
        }
        for (i, value) in arg_values.iter().enumerate() {
            self.append_with(
                IrOp::Param,
                IrParam::Triple(*value),
                IrParam::Immediate(i as u64),
            );
        }
        let callee_param = match self.ast.get(self.resolve(callee)).kind {
            AstKind::Identifier { sym: Some(sym) } => IrParam::Symbol(sym),
            _ => {
                let value = self.lower_expr(callee);
                IrParam::Triple(value)
            }
        };
        let call =
            self.append_typed(IrOp::Call, callee_param, IrParam::None, ty);
        self.maybe_check_raise(callee, call);
        call
    }

    fn lower_method_call(
        &mut self,
        receiver: AstId,
        callee: AstId,
        args: AstId,
        ty: TypeId,
    ) -> TripleId {
        let this_value = self.lower_expr(receiver);
        self.append_with(
            IrOp::Param,
            IrParam::Triple(this_value),
            IrParam::Immediate(0),
        );
        let arg_nodes = match &self.ast.get(args).kind {
            AstKind::Compound { elems } => elems.clone(),
            _ => Vec::new(),
        };
        let mut arg_values = Vec::new();
        for &arg in &arg_nodes {
            arg_values.push(self.lower_expr(arg));
        }
        for (i, value) in arg_values.iter().enumerate() {
            self.append_with(
                IrOp::Param,
                IrParam::Triple(*value),
                IrParam::Immediate(1 + i as u64),
            );
        }
        let callee_param = match self.ast.get(callee).kind {
            AstKind::Identifier { sym: Some(sym) } => IrParam::Symbol(sym),
            _ => IrParam::None,
        };
        let call =
            self.append_typed(IrOp::Call, callee_param, IrParam::None, ty);
        self.maybe_check_raise(callee, call);
        call
    }

    /// Inside a `try`, a call that can raise tests its e64 result and
    /// enters the catch block on failure.
    fn maybe_check_raise(&mut self, callee: AstId, call: TripleId) {
        let t = match self.tries.last() {
            Some(t) => TryCtx {
                catch: t.catch,
                err_tmp: t.err_tmp,
            },
            None => return,
        };
        let raises = match self.ast.get(callee).kind {
            AstKind::Identifier { sym: Some(sym) } => {
                match &self.symbols.symbol(sym).kind {
                    SymbolKind::Function { overloads, .. } => {
                        overloads.first().map(|o| {
                            self.signature_raises(o.ty)
                        }).unwrap_or(false)
                    }
                    _ => false,
                }
            }
            _ => false,
        };
        if !raises {
            return;
        }
        let e64_slot = self.append_with(
            IrOp::Retval,
            IrParam::Triple(call),
            IrParam::Immediate(u64::MAX),
        );
        self.append_with(
            IrOp::Copy,
            IrParam::Triple(t.err_tmp),
            IrParam::Triple(e64_slot),
        );
        self.branch(IrOp::IfNotZero, t.err_tmp, t.catch);
    }

    fn signature_raises(&self, ty: TypeId) -> bool {
        match &self.types.get(ty).kind {
            TypeKind::Function { rets, .. } => rets.iter().any(|ret| {
                matches!(
                    self.types.get(ret.ty).kind,
                    TypeKind::Primitive {
                        kind: PrimitiveKind::Error,
                        ..
                    }
                )
            }),
            TypeKind::Superfunction { function, .. } => {
                self.signature_raises(*function)
            }
            _ => false,
        }
    }

    fn lower_field_access(&mut self, left: AstId, right: AstId) -> TripleId {
        let base = self.lower_expr(left);
        let ty = self.ast.get(right).ty;
        match self.ast.get(right).kind {
            AstKind::Identifier { sym: Some(sym) } => {
                match self.symbols.symbol(sym).kind {
                    SymbolKind::Field { index, parent } => {
                        // Enum members are constants; struct fields are
                        // byte offsets into the value
                        if self.is_enum(parent) {
                            return self.append_typed(
                                IrOp::Value,
                                IrParam::Immediate(index),
                                IrParam::None,
                                ty,
                            );
                        }
                        let offset = self.field_offset(parent, index);
                        self.append_typed(
                            IrOp::Offset,
                            IrParam::Triple(base),
                            IrParam::Immediate(offset),
                            ty,
                        )
                    }
                    _ => self.append_typed(
                        IrOp::Symbol,
                        IrParam::Symbol(sym),
                        IrParam::None,
                        ty,
                    ),
                }
            }
            _ => base,
        }
    }

    fn is_enum(&self, ty: TypeId) -> bool {
        matches!(
            self.types.get(ty).kind,
            TypeKind::Supercompound {
                kind: crate::ty::SuperKind::Enum,
                ..
            }
        )
    }

    /// Byte offset of a field inside its supercompound, using the same
    /// layout the sizing pass computed.
    fn field_offset(&self, parent: TypeId, index: u64) -> u64 {
        let compound = match &self.types.get(parent).kind {
            TypeKind::Supercompound { compound, .. } => *compound,
            _ => return index,
        };
        let members = match &self.types.get(compound).kind {
            TypeKind::Compound { members } => members,
            _ => return index,
        };
        let mut offset = 0u64;
        for (i, member) in members.iter().enumerate() {
            let size = self.types.get(member.ty).size.unwrap_or(0);
            let align = self.types.align_of(member.ty).max(1);
            offset = (offset + align - 1) & !(align - 1);
            if i as u64 == index {
                return offset;
            }
            offset += size;
        }
        offset
    }

    fn binary_ir_op(&self, sym: Symbol) -> IrOp {
        match sym {
            Symbol::Add => IrOp::Add,
            Symbol::Sub => IrOp::Subtract,
            Symbol::Mul => IrOp::Multiply,
            Symbol::Div | Symbol::IntDiv => IrOp::Divide,
            Symbol::Modulo => IrOp::Modulo,
            Symbol::Concat => IrOp::Concatenate,
            Symbol::Shl => IrOp::ShiftLeft,
            Symbol::Shr => IrOp::ShiftRight,
            Symbol::Rtl => IrOp::RotateLeft,
            Symbol::Rtr => IrOp::RotateRight,
            Symbol::And | Symbol::Land | Symbol::KwAnd => IrOp::And,
            Symbol::Or | Symbol::Lor | Symbol::KwOr => IrOp::Or,
            Symbol::Xor => IrOp::Xor,
            Symbol::Lt => IrOp::Less,
            Symbol::Le => IrOp::LessEquals,
            Symbol::Gt => IrOp::Greater,
            Symbol::Ge => IrOp::GreaterEquals,
            Symbol::Equals => IrOp::Equals,
            Symbol::NotEquals => IrOp::NotEquals,
            Symbol::BitSet => IrOp::Or,
            Symbol::BitClear => IrOp::And,
            Symbol::BitToggle => IrOp::Xor,
            Symbol::BitCheck => IrOp::BitSet,
            _ => IrOp::Noop,
        }
    }

    /// The machine value classes are unsigned, signed, f32 and f64; a cast
    /// triple is needed whenever two types differ in class.
    fn conversion_op(&self, from: TypeId, to: TypeId) -> Option<IrOp> {
        #[derive(PartialEq, Clone, Copy)]
        enum Class {
            U,
            S,
            F,
            D,
        }
        let classify = |ty: TypeId| match self.types.get(ty).kind {
            TypeKind::Primitive { kind, bits } => match kind {
                PrimitiveKind::Signed => Class::S,
                PrimitiveKind::Floating => {
                    if bits <= 32 {
                        Class::F
                    } else {
                        Class::D
                    }
                }
                _ => Class::U,
            },
            _ => Class::U,
        };
        let (from, to) = (classify(from), classify(to));
        if from == to {
            return None;
        }
        Some(match (from, to) {
            (Class::U, Class::S) => IrOp::CastUtS,
            (Class::U, Class::F) => IrOp::CastUtF,
            (Class::U, Class::D) => IrOp::CastUtD,
            (Class::S, Class::U) => IrOp::CastStU,
            (Class::S, Class::F) => IrOp::CastStF,
            (Class::S, Class::D) => IrOp::CastStD,
            (Class::F, Class::U) => IrOp::CastFtU,
            (Class::F, Class::S) => IrOp::CastFtS,
            (Class::F, Class::D) => IrOp::CastFtD,
            (Class::D, Class::U) => IrOp::CastDtU,
            (Class::D, Class::S) => IrOp::CastDtS,
            (Class::D, Class::F) => IrOp::CastDtF,
            _ => unreachable!(),
        })
    }
}
