//! The three-address intermediate representation. Triples live in an arena
//! and are chained into a linked list by `next`; jumps carry their target
//! in `cond`, so control flow is part of the structure rather than encoded
//! in operands. The AST-to-IR builder lives in [crate::lower].

use crate::ast::AstId;
use crate::symbol::SymbolId;
use crate::ty::TypeId;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TripleId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum IrOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Increment,
    Decrement,
    Negate,
    ShiftLeft,
    ShiftRight,
    RotateLeft,
    RotateRight,
    And,
    Or,
    Xor,
    Not,
    Concatenate,

    // Casts between the four machine value classes
    CastFtD,
    CastDtF,
    CastStU,
    CastUtS,
    CastUtF,
    CastStF,
    CastUtD,
    CastStD,
    CastFtU,
    CastFtS,
    CastDtU,
    CastDtS,

    // Compares
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    Equals,
    NotEquals,
    BitSet,
    BitNotSet,

    // Control; targets live in the triple's `cond` link
    Jump,
    IfZero,
    IfNotZero,
    Call,
    Return,

    // Value carriers
    Value,
    Symbol,
    Temp,

    // Parameter passing
    Param,
    Retval,

    // Memory
    New,
    Delete,
    Copy,
    Index,
    Offset,
    Address,
    Dereference,
    Length,
    Zero,

    // Sentinels
    Noop,
    BlockStart,
    BlockEnd,
    FunctionStart,
    FunctionEnd,
}

impl IrOp {
    /// Sentinels mark structure; they execute nothing.
    pub fn is_sentinel(self) -> bool {
        matches!(
            self,
            IrOp::Noop
                | IrOp::BlockStart
                | IrOp::BlockEnd
                | IrOp::FunctionStart
                | IrOp::FunctionEnd
        )
    }
}

/// One operand of a triple.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub enum IrParam {
    None,
    /// A literal AST node (VALUE or STRING)
    Literal(AstId),
    /// A resolved symbol
    Symbol(SymbolId),
    /// The result of another triple
    Triple(TripleId),
    Immediate(u64),
}

impl IrParam {
    pub fn is_none(self) -> bool {
        matches!(self, IrParam::None)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Triple {
    pub op: IrOp,
    pub p1: IrParam,
    pub p2: IrParam,
    /// Next triple in execution order
    pub next: Option<TripleId>,
    /// Jump target for control-flow ops
    pub cond: Option<TripleId>,
    /// Type of the produced value, when one is produced
    pub result_ty: Option<TypeId>,
    /// Debug label, carried into printouts
    pub label: Option<String>,
}

/// The IR of one compilation unit: an arena of triples plus the entry
/// point of the chain.
#[derive(Debug, Default, Serialize)]
pub struct IrBody {
    triples: Vec<Triple>,
    pub start: Option<TripleId>,
}

impl IrBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self, op: IrOp) -> TripleId {
        self.make_with(op, IrParam::None, IrParam::None)
    }

    pub fn make_with(
        &mut self,
        op: IrOp,
        p1: IrParam,
        p2: IrParam,
    ) -> TripleId {
        let id = TripleId(self.triples.len() as u32);
        self.triples.push(Triple {
            op,
            p1,
            p2,
            next: None,
            cond: None,
            result_ty: None,
            label: None,
        });
        id
    }

    pub fn get(&self, id: TripleId) -> &Triple {
        &self.triples[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TripleId) -> &mut Triple {
        &mut self.triples[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Link `a` directly in front of `b`.
    pub fn link(&mut self, a: TripleId, b: TripleId) {
        self.get_mut(a).next = Some(b);
    }

    /// Iterate the chain in execution order.
    pub fn iter_chain(&self) -> ChainIter<'_> {
        ChainIter {
            body: self,
            cur: self.start,
        }
    }

    /// Drop NOOP triples that no jump targets, splicing the chain around
    /// them. This is the only optimization the toolchain performs.
    pub fn remove_dead_noops(&mut self) {
        use std::collections::HashSet;
        let targets: HashSet<TripleId> = self
            .triples
            .iter()
            .filter_map(|triple| triple.cond)
            .collect();

        // Redirect every `next` edge past deletable noops
        let deletable = |body: &IrBody, id: TripleId| {
            body.get(id).op == IrOp::Noop && !targets.contains(&id)
        };
        let skip_from = |body: &IrBody, mut id: Option<TripleId>| {
            while let Some(t) = id {
                if deletable(body, t) {
                    id = body.get(t).next;
                } else {
                    break;
                }
            }
            id
        };
        self.start = skip_from(self, self.start);
        for i in 0..self.triples.len() {
            let next = self.triples[i].next;
            self.triples[i].next = skip_from(self, next);
        }
    }
}

pub struct ChainIter<'a> {
    body: &'a IrBody,
    cur: Option<TripleId>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (TripleId, &'a Triple);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let triple = self.body.get(id);
        self.cur = triple.next;
        Some((id, triple))
    }
}

impl Display for IrBody {
    /// Print the chain in execution order with stable per-line indices,
    /// naming jump targets by index.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use std::collections::HashMap;
        let order: HashMap<TripleId, usize> = self
            .iter_chain()
            .enumerate()
            .map(|(i, (id, _))| (id, i))
            .collect();
        for (i, (_, triple)) in self.iter_chain().enumerate() {
            write!(f, "{:5}: {:?}", i, triple.op)?;
            for param in [&triple.p1, &triple.p2] {
                match param {
                    IrParam::None => {}
                    IrParam::Literal(ast) => write!(f, " | lit {}", ast.0)?,
                    IrParam::Symbol(sym) => write!(f, " | sym {}", sym.0)?,
                    IrParam::Triple(t) => write!(
                        f,
                        " | ({})",
                        order.get(t).map(|i| *i as i64).unwrap_or(-1)
                    )?,
                    IrParam::Immediate(value) => {
                        write!(f, " | imm {}", value)?
                    }
                }
            }
            if let Some(target) = triple.cond {
                write!(
                    f,
                    " -> ({})",
                    order.get(&target).map(|i| *i as i64).unwrap_or(-1)
                )?;
            }
            if let Some(label) = &triple.label {
                write!(f, " ; {}", label)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_iteration() {
        let mut body = IrBody::new();
        let a = body.make(IrOp::Value);
        let b = body.make(IrOp::Add);
        let c = body.make(IrOp::Return);
        body.start = Some(a);
        body.link(a, b);
        body.link(b, c);
        let ops: Vec<IrOp> =
            body.iter_chain().map(|(_, t)| t.op).collect();
        assert_eq!(ops, vec![IrOp::Value, IrOp::Add, IrOp::Return]);
    }

    #[test]
    fn test_dead_noop_removal_keeps_targets() {
        let mut body = IrBody::new();
        let a = body.make(IrOp::Value);
        let dead = body.make(IrOp::Noop);
        let target = body.make(IrOp::Noop);
        let jump = body.make(IrOp::Jump);
        let end = body.make(IrOp::Return);
        body.start = Some(a);
        body.link(a, dead);
        body.link(dead, target);
        body.link(target, jump);
        body.link(jump, end);
        body.get_mut(jump).cond = Some(target);

        body.remove_dead_noops();
        let ops: Vec<IrOp> =
            body.iter_chain().map(|(_, t)| t.op).collect();
        // The targeted noop stays, the dead one is gone
        assert_eq!(
            ops,
            vec![IrOp::Value, IrOp::Noop, IrOp::Jump, IrOp::Return]
        );
    }
}
