//! The abstract syntax tree. Nodes live in a per-module arena and point at
//! each other (and at their declaring tokens) by id, so the tree can be
//! relinked freely during operator reordering and semantic replacement.
//! Nodes never form cycles.

use crate::grammar::{Symbol, NOT_REORDERABLE};
use crate::symbol::SymbolId;
use crate::token::{TokenId, TokenStream};
use crate::ty::TypeId;
use serde::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct AstId(pub u32);

#[derive(Clone, Debug, Serialize)]
pub enum AstKind {
    /// Placeholder; also the synthetic node produced by error recovery
    None,
    /// A bare symbol used as an atom (`_`, `this`, `break`, ...)
    Zero { sym: Symbol },
    Unary {
        sym: Symbol,
        node: AstId,
        /// Post-unary (`x++`) rather than pre-unary (`++x`)
        post: bool,
    },
    Binary {
        sym: Symbol,
        left: AstId,
        right: AstId,
    },
    /// A literal; interpretation is up to the node's type
    Value { value: u64 },
    String { bytes: Vec<u8> },
    /// Ordered children of peer kind: array elements, parameters, the
    /// parts of a function definition
    Compound { elems: Vec<AstId> },
    /// Statements plus the list of deferred expressions to run at block
    /// exit (in reverse order of declaration)
    Block {
        elems: Vec<AstId>,
        at_end: Vec<AstId>,
    },
    /// A resolved type expression
    Type { ty: TypeId },
    /// An identifier; `sym` is `None` until semantic analysis resolves it.
    /// The spelling lives on the declaring token.
    Identifier { sym: Option<SymbolId> },
}

#[derive(Clone, Debug, Serialize)]
pub struct AstNode {
    pub kind: AstKind,
    /// The token this node was built from
    pub token: TokenId,
    /// Resolved type; starts as the table's NONE
    pub ty: TypeId,
    /// Set once semantic analysis has processed the node: either the node
    /// itself or its compiled replacement
    pub compiled: Option<AstId>,
    pub compiletime: bool,
    /// Reordering precedence; [NOT_REORDERABLE] for anything that is not
    /// an operator application
    pub precedence: i16,
    pub inherited_precedence: i16,
}

impl AstNode {
    pub fn is_binary(&self, sym: Symbol) -> bool {
        matches!(self.kind, AstKind::Binary { sym: s, .. } if s == sym)
    }

    pub fn is_zero(&self, sym: Symbol) -> bool {
        matches!(self.kind, AstKind::Zero { sym: s } if s == sym)
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, AstKind::None)
    }
}

/// The AST arena for one module.
#[derive(Debug, Default, Serialize)]
pub struct AstArena {
    nodes: Vec<AstNode>,
}

impl AstArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AstId) -> &AstNode {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: AstId) -> &mut AstNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, kind: AstKind, token: TokenId, ty: TypeId) -> AstId {
        let id = AstId(self.nodes.len() as u32);
        self.nodes.push(AstNode {
            kind,
            token,
            ty,
            compiled: None,
            compiletime: false,
            precedence: NOT_REORDERABLE,
            inherited_precedence: NOT_REORDERABLE,
        });
        id
    }

    // ===== Constructors =====

    pub fn make_none(&mut self, token: TokenId, ty: TypeId) -> AstId {
        self.push(AstKind::None, token, ty)
    }

    pub fn make_zero(
        &mut self,
        sym: Symbol,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Zero { sym }, token, ty)
    }

    pub fn make_unary(
        &mut self,
        sym: Symbol,
        node: AstId,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Unary { sym, node, post: false }, token, ty)
    }

    pub fn make_binary(
        &mut self,
        sym: Symbol,
        left: AstId,
        right: AstId,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Binary { sym, left, right }, token, ty)
    }

    pub fn make_value(
        &mut self,
        value: u64,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Value { value }, token, ty)
    }

    pub fn make_string(
        &mut self,
        bytes: Vec<u8>,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::String { bytes }, token, ty)
    }

    pub fn make_compound(
        &mut self,
        elems: Vec<AstId>,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Compound { elems }, token, ty)
    }

    pub fn make_block(
        &mut self,
        elems: Vec<AstId>,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(
            AstKind::Block {
                elems,
                at_end: Vec::new(),
            },
            token,
            ty,
        )
    }

    pub fn make_type(
        &mut self,
        ty_value: TypeId,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Type { ty: ty_value }, token, ty)
    }

    pub fn make_iden(
        &mut self,
        sym: Option<SymbolId>,
        token: TokenId,
        ty: TypeId,
    ) -> AstId {
        self.push(AstKind::Identifier { sym }, token, ty)
    }

    // ===== Structured access =====

    /// The (symbol, left, right) of a binary node. Panics otherwise.
    pub fn binary(&self, id: AstId) -> (Symbol, AstId, AstId) {
        match self.get(id).kind {
            AstKind::Binary { sym, left, right } => (sym, left, right),
            ref other => panic!("expected binary node, found {:?}", other),
        }
    }

    /// The (symbol, operand, post) of a unary node. Panics otherwise.
    pub fn unary(&self, id: AstId) -> (Symbol, AstId, bool) {
        match self.get(id).kind {
            AstKind::Unary { sym, node, post } => (sym, node, post),
            ref other => panic!("expected unary node, found {:?}", other),
        }
    }

    pub fn set_binary_left(&mut self, id: AstId, child: AstId) {
        match &mut self.get_mut(id).kind {
            AstKind::Binary { left, .. } => *left = child,
            other => panic!("expected binary node, found {:?}", other),
        }
    }

    pub fn set_binary_right(&mut self, id: AstId, child: AstId) {
        match &mut self.get_mut(id).kind {
            AstKind::Binary { right, .. } => *right = child,
            other => panic!("expected binary node, found {:?}", other),
        }
    }

    pub fn set_unary_node(&mut self, id: AstId, child: AstId) {
        match &mut self.get_mut(id).kind {
            AstKind::Unary { node, .. } => *node = child,
            other => panic!("expected unary node, found {:?}", other),
        }
    }

    /// Structural copy of a whole subtree. Symbol references are borrowed,
    /// so they are copied verbatim.
    pub fn clone_subtree(&mut self, id: AstId) -> AstId {
        let node = self.get(id).clone();
        let kind = match node.kind {
            AstKind::Unary { sym, node, post } => {
                let node = self.clone_subtree(node);
                AstKind::Unary { sym, node, post }
            }
            AstKind::Binary { sym, left, right } => {
                let left = self.clone_subtree(left);
                let right = self.clone_subtree(right);
                AstKind::Binary { sym, left, right }
            }
            AstKind::Compound { elems } => AstKind::Compound {
                elems: elems
                    .iter()
                    .map(|&elem| self.clone_subtree(elem))
                    .collect(),
            },
            AstKind::Block { elems, at_end } => AstKind::Block {
                elems: elems
                    .iter()
                    .map(|&elem| self.clone_subtree(elem))
                    .collect(),
                at_end: at_end
                    .iter()
                    .map(|&elem| self.clone_subtree(elem))
                    .collect(),
            },
            other => other,
        };
        let id = self.push(kind, node.token, node.ty);
        let cloned = self.get_mut(id);
        cloned.compiletime = node.compiletime;
        cloned.precedence = node.precedence;
        cloned.inherited_precedence = node.inherited_precedence;
        id
    }

    /// Render a subtree back to source-like text, fully parenthesized.
    /// Identifier spellings come from the token stream.
    pub fn print(&self, id: AstId, tokens: &TokenStream) -> String {
        let node = self.get(id);
        let token_text = || tokens.get(node.token).text.clone();
        match &node.kind {
            AstKind::None => "<none>".into(),
            AstKind::Zero { sym } => sym.text().into(),
            AstKind::Unary { sym, node: operand, post } => {
                let inner = self.print(*operand, tokens);
                if *post {
                    format!("({}{})", inner, sym)
                } else {
                    format!("({}{})", sym, inner)
                }
            }
            AstKind::Binary { sym, left, right } => format!(
                "({} {} {})",
                self.print(*left, tokens),
                sym,
                self.print(*right, tokens)
            ),
            AstKind::Value { .. } | AstKind::Identifier { .. } => token_text(),
            AstKind::String { bytes } => {
                format!("\"{}\"", String::from_utf8_lossy(bytes))
            }
            AstKind::Compound { elems } => {
                let parts: Vec<String> = elems
                    .iter()
                    .map(|&elem| self.print(elem, tokens))
                    .collect();
                format!("({})", parts.join(", "))
            }
            AstKind::Block { elems, .. } => {
                let parts: Vec<String> = elems
                    .iter()
                    .map(|&elem| self.print(elem, tokens))
                    .collect();
                format!("{{ {} }}", parts.join("; "))
            }
            AstKind::Type { .. } => token_text(),
        }
    }

    /// Leftmost token of a subtree, for diagnostics spanning whole
    /// expressions.
    pub fn leftmost_token(&self, id: AstId) -> TokenId {
        match &self.get(id).kind {
            AstKind::Unary { post, .. } if !post => self.get(id).token,
            AstKind::Unary { node, .. } => self.leftmost_token(*node),
            AstKind::Binary { left, .. } => self.leftmost_token(*left),
            AstKind::Compound { elems } | AstKind::Block { elems, .. } => {
                elems
                    .first()
                    .map(|&elem| self.leftmost_token(elem))
                    .unwrap_or(self.get(id).token)
            }
            _ => self.get(id).token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{TokenKind, TokenValue};
    use crate::util::Span;

    #[test]
    fn test_clone_subtree_is_structural() {
        let mut arena = AstArena::new();
        let token = TokenId(0);
        let ty = TypeId(0);
        let left = arena.make_value(1, token, ty);
        let right = arena.make_value(2, token, ty);
        let add = arena.make_binary(Symbol::Add, left, right, token, ty);

        let copy = arena.clone_subtree(add);
        assert_ne!(copy, add);
        let (sym, cl, cr) = arena.binary(copy);
        assert_eq!(sym, Symbol::Add);
        assert_ne!(cl, left);
        assert_ne!(cr, right);
        match arena.get(cl).kind {
            AstKind::Value { value } => assert_eq!(value, 1),
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_print() {
        let mut tokens = TokenStream::new();
        let t_a = tokens.push(
            TokenKind::Identifier,
            "1".into(),
            TokenValue::None,
            Span::default(),
        );
        let mut arena = AstArena::new();
        let ty = TypeId(0);
        let one = arena.make_value(1, t_a, ty);
        let two = arena.make_value(1, t_a, ty);
        let add = arena.make_binary(Symbol::Add, one, two, t_a, ty);
        let neg = arena.make_unary(Symbol::Sub, add, t_a, ty);
        assert_eq!(arena.print(neg, &tokens), "(-(1 + 1))");
    }
}
