//! Syntactic analysis: recursive descent from the token stream to a
//! BLOCK-rooted AST.
//!
//! Two mechanisms here deserve a note:
//!
//! - **Keyword promotion and symbol longest-match.** The lexer leaves
//!   keywords as identifiers and operators as maximal runs of operator
//!   characters. The parser promotes identifiers against the grammar table
//!   and resolves symbol runs to the longest known spelling, splitting the
//!   token in place when the run is longer (`>>=` can resolve to `>>` with
//!   `=` left over). When a specific symbol is *required*, it is preferred
//!   over a longer match, which is what turns `>>` into `>` `>` while
//!   closing nested generics.
//!
//! - **Precedence reparenting.** The expression cascade naturally
//!   right-associates and ignores relative precedence among consecutive
//!   operators, so every infix/unary construction is followed by a
//!   reordering step ([Parser::reorder_binary] / [Parser::reorder_unary])
//!   that walks the freshly built node down the left spine of its operand
//!   and reparents it at the right depth. Ties resolve left-to-right.
//!
//! All `require_*` functions report a diagnostic, produce a synthetic error
//! node and keep parsing; a single syntax error never aborts the parse.

use crate::ast::{AstArena, AstId, AstKind};
use crate::error::{CompileError, SourceErrorWrapper};
use crate::grammar::{
    infix_precedence, Grammar, Symbol, NOT_REORDERABLE, PREC_PREFIX,
    PREC_POST_UNARY, PREC_SELECT, PREC_SPREAD, PREC_TERNARY,
};
use crate::token::{TokenId, TokenKind, TokenStream, TokenValue};
use crate::ty::WellKnown;

/// What the parser hands back for one module.
#[derive(Debug)]
pub struct ParseOutput {
    /// Root BLOCK node of the file
    pub root: AstId,
    /// Import paths found in the file, with the AST node that requested
    /// each (relative paths, to be resolved against the importing module)
    pub imports: Vec<(String, AstId)>,
}

/// Parse a lexed module. The parser never touches the type table; it only
/// needs the well-known ids, which keeps module parses independent of each
/// other (and of the shared tables) for the parallel parser pool.
pub fn parse(
    src: &str,
    grammar: &Grammar,
    tokens: &mut TokenStream,
    ast: &mut AstArena,
    well_known: WellKnown,
    errors: &mut Vec<SourceErrorWrapper<CompileError>>,
) -> ParseOutput {
    let head = tokens.head().expect("token stream always has EOF");
    let mut parser = Parser {
        src,
        grammar,
        tokens,
        ast,
        well_known,
        errors,
        cur: head,
        imports: Vec::new(),
    };
    parser.cur = parser.resolve(head);
    let root = parser.program_unit();
    ParseOutput {
        root,
        imports: parser.imports,
    }
}

struct Parser<'a> {
    src: &'a str,
    grammar: &'a Grammar,
    tokens: &'a mut TokenStream,
    ast: &'a mut AstArena,
    well_known: WellKnown,
    errors: &'a mut Vec<SourceErrorWrapper<CompileError>>,
    /// Current (resolved) token
    cur: TokenId,
    imports: Vec<(String, AstId)>,
}

impl<'a> Parser<'a> {
    fn wk(&self) -> WellKnown {
        self.well_known
    }

    // ===== Cursor =====

    /// Walk forward from `id` to the next token the parser cares about,
    /// promoting keywords and resolving symbol runs on the way.
    fn resolve(&mut self, mut id: TokenId) -> TokenId {
        loop {
            let tok = self.tokens.get(id);
            match tok.kind {
                TokenKind::Whitespace
                | TokenKind::Newline
                | TokenKind::Comment
                | TokenKind::Error => {
                    // Lex errors were reported by the lexer already
                    match tok.next() {
                        Some(next) => id = next,
                        None => return id,
                    }
                }
                TokenKind::Identifier => {
                    if let Some(sym) = self.grammar.lookup(&tok.text) {
                        let tok = self.tokens.get_mut(id);
                        tok.kind = TokenKind::Keyword;
                        tok.value = TokenValue::Symbol(sym);
                    }
                    return id;
                }
                TokenKind::Symbol => {
                    if tok.value.symbol().is_none() {
                        self.resolve_symbol_run(id);
                    }
                    return id;
                }
                _ => return id,
            }
        }
    }

    /// Longest-match the head of a symbol run (at most 4 bytes), splitting
    /// off the remainder. Unknown runs are downgraded to error tokens.
    fn resolve_symbol_run(&mut self, id: TokenId) {
        let text = self.tokens.get(id).text.clone();
        let max = text.len().min(4);
        let found = (1..=max)
            .rev()
            .find_map(|len| self.grammar.lookup(&text[..len]).map(|s| (len, s)));
        match found {
            Some((len, sym)) => {
                if len < text.len() {
                    self.tokens.split(id, len);
                }
                self.tokens.get_mut(id).value = TokenValue::Symbol(sym);
            }
            None => {
                let span = self.tokens.get(id).span;
                self.tokens.get_mut(id).kind = TokenKind::Error;
                self.errors.push(SourceErrorWrapper::new(
                    CompileError::InvalidBytes,
                    span,
                    self.src,
                ));
            }
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.tokens.get(self.cur).next() {
            self.cur = self.resolve(next);
        }
    }

    /// Consume the current token, returning it.
    fn next(&mut self) -> TokenId {
        let cur = self.cur;
        self.advance();
        cur
    }

    /// Peek at the resolved token after the current one without consuming
    /// anything.
    fn peek_next(&mut self) -> Option<TokenId> {
        self.tokens.get(self.cur).next().map(|next| self.resolve(next))
    }

    fn cur_tok(&self) -> &crate::token::Token {
        self.tokens.get(self.cur)
    }

    fn is(&self, kind: TokenKind) -> bool {
        self.cur_tok().kind == kind
    }

    fn cur_symbol(&self) -> Option<Symbol> {
        let tok = self.cur_tok();
        match tok.kind {
            TokenKind::Symbol => tok.value.symbol(),
            _ => None,
        }
    }

    fn cur_keyword(&self) -> Option<Symbol> {
        let tok = self.cur_tok();
        match tok.kind {
            TokenKind::Keyword => tok.value.symbol(),
            _ => None,
        }
    }

    fn cur_op(&self) -> Option<Symbol> {
        self.cur_symbol().or_else(|| self.cur_keyword())
    }

    fn is_symbol(&self, sym: Symbol) -> bool {
        self.cur_symbol() == Some(sym)
    }

    fn is_keyword(&self, sym: Symbol) -> bool {
        self.cur_keyword() == Some(sym)
    }

    /// Like [Parser::is_symbol], but prefers `sym` over a longer match: if
    /// the current symbol token merely *starts with* the wanted spelling,
    /// it is split in place and re-tagged. This is what allows `>>` to
    /// close two nested generic argument lists.
    fn is_symbol_expected(&mut self, sym: Symbol) -> bool {
        if self.is_symbol(sym) {
            return true;
        }
        let tok = self.tokens.get(self.cur);
        if tok.kind != TokenKind::Symbol {
            return false;
        }
        let want = sym.text();
        if tok.text.len() > want.len() && tok.text.starts_with(want) {
            self.tokens.split(self.cur, want.len());
            self.tokens.get_mut(self.cur).value = TokenValue::Symbol(sym);
            true
        } else {
            false
        }
    }

    // ===== Diagnostics =====

    fn error_at(&mut self, token: TokenId, error: CompileError) {
        let span = self.tokens.get(token).span;
        self.errors
            .push(SourceErrorWrapper::new(error, span, self.src));
    }

    fn expected(&mut self, what: &str) {
        self.error_at(
            self.cur,
            CompileError::Expected {
                expected: what.into(),
            },
        );
    }

    fn make_error_ast(&mut self) -> AstId {
        let error_ty = self.wk().ERROR_TYPE;
        self.ast.make_none(self.cur, error_ty)
    }

    fn require(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.is(kind) {
            true
        } else {
            self.expected(what);
            false
        }
    }

    fn require_symbol(&mut self, sym: Symbol) -> bool {
        if self.is_symbol_expected(sym) {
            true
        } else {
            self.expected(&format!("`{}`", sym));
            false
        }
    }

    fn require_keyword(&mut self, sym: Symbol) -> bool {
        if self.is_keyword(sym) {
            true
        } else {
            self.expected(&format!("`{}`", sym));
            false
        }
    }

    // ===== Reordering =====

    /// Find the node along the left spine of `from`'s operand that `from`
    /// has to be reparented under: the lowest node whose precedence does
    /// not exceed `prec`. Equal precedence keeps descending, which makes
    /// ties associate left-to-right.
    fn find_leftmost(&mut self, from: AstId, prec: i16) -> Option<AstId> {
        let mut n = match self.ast.get(from).kind {
            AstKind::Unary { node, .. } => node,
            AstKind::Binary { right, .. } => right,
            _ => panic!("find_leftmost on a non-operator node"),
        };
        let mut found = None;
        loop {
            let node = self.ast.get(n);
            if node.precedence == NOT_REORDERABLE || node.precedence > prec {
                return found;
            }
            self.ast.get_mut(n).inherited_precedence = prec;
            found = Some(n);
            n = match self.ast.get(n).kind {
                AstKind::Unary { node, .. } => node,
                AstKind::Binary { left, .. } => left,
                _ => return found,
            };
        }
    }

    /// Precedence-sort the tree rooted at a freshly built unary node whose
    /// operand subtree is already sorted. Returns the new root.
    fn reorder_unary(&mut self, un: AstId) -> AstId {
        let prec = self.ast.get(un).precedence;
        if prec == NOT_REORDERABLE {
            return un;
        }
        let leftmost = match self.find_leftmost(un, prec) {
            Some(node) => node,
            None => return un,
        };
        match self.ast.get(leftmost).kind {
            AstKind::Unary { node: child, .. } => {
                self.ast.set_unary_node(leftmost, un);
                self.ast.set_unary_node(un, child);
            }
            AstKind::Binary { left: child, .. } => {
                self.ast.set_binary_left(leftmost, un);
                self.ast.set_unary_node(un, child);
            }
            _ => unreachable!("find_leftmost returned a non-operator"),
        }
        leftmost
    }

    /// Same as [Parser::reorder_unary] for a freshly built binary node
    /// whose right subtree is already sorted.
    fn reorder_binary(&mut self, bin: AstId) -> AstId {
        let prec = self.ast.get(bin).precedence;
        if prec == NOT_REORDERABLE {
            return bin;
        }
        let leftmost = match self.find_leftmost(bin, prec) {
            Some(node) => node,
            None => return bin,
        };
        let top = match self.ast.get(bin).kind {
            AstKind::Binary { right, .. } => right,
            _ => panic!("reorder_binary on a non-binary node"),
        };
        match self.ast.get(leftmost).kind {
            AstKind::Unary { node: child, .. } => {
                self.ast.set_unary_node(leftmost, bin);
                self.ast.set_binary_right(bin, child);
            }
            AstKind::Binary { left: child, .. } => {
                self.ast.set_binary_left(leftmost, bin);
                self.ast.set_binary_right(bin, child);
            }
            _ => unreachable!("find_leftmost returned a non-operator"),
        }
        top
    }

    fn set_precedence(&mut self, id: AstId, prec: i16, child: AstId) {
        let child_inh = self.ast.get(child).inherited_precedence;
        let node = self.ast.get_mut(id);
        node.precedence = prec;
        node.inherited_precedence = child_inh.max(prec);
    }

    // ===== Program structure =====

    fn program_unit(&mut self) -> AstId {
        let first = self.cur;
        let mut elems = Vec::new();
        while !self.is(TokenKind::EndOfFile) {
            let before = self.cur;
            elems.push(self.freestmt());
            // Always make progress, even on garbage
            if self.cur == before && !self.is(TokenKind::EndOfFile) {
                self.next();
            }
        }
        let none_ty = self.wk().NONE;
        self.ast.make_block(elems, first, none_ty)
    }

    fn freestmt(&mut self) -> AstId {
        if self.is(TokenKind::CompilerNote) {
            let tok = self.next();
            let typeless = self.wk().TYPELESS;
            return self.ast.make_none(tok, typeless);
        }
        match self.cur_keyword() {
            Some(Symbol::KwImport) => self.importstmt(),
            Some(Symbol::KwUsing) => self.usingstmt(),
            Some(Symbol::KwNamespace) => self.namespacestmt(),
            _ => self.stmt(),
        }
    }

    fn stmt(&mut self) -> AstId {
        match self.cur_keyword() {
            Some(Symbol::KwDef) => self.defstmt(),
            Some(Symbol::KwVar) | Some(Symbol::KwLet)
            | Some(Symbol::KwRef) => self.declstmt(),
            Some(Symbol::KwIf) => self.ifstmt(),
            Some(Symbol::KwFor) => self.forstmt(),
            Some(Symbol::KwWhile) => self.whilestmt(),
            Some(Symbol::KwLoop) => self.loopstmt(),
            Some(Symbol::KwDo) => self.dowhilestmt(),
            Some(Symbol::KwSwitch) => self.switchstmt(),
            Some(Symbol::KwTry) => self.trystmt(),
            Some(Symbol::KwReturn) => self.returnstmt(),
            Some(Symbol::KwRaise) => self.raisestmt(),
            Some(Symbol::KwGoto) => self.gotostmt(),
            Some(Symbol::KwLabel) => self.labelstmt(),
            Some(Symbol::KwDefer) => self.deferstmt(),
            Some(Symbol::KwBreak) => self.breakstmt(),
            Some(Symbol::KwContinue) => self.continuestmt(),
            Some(Symbol::KwDelete) => self.deletestmt(),
            _ => {
                if self.is_symbol(Symbol::OBrace) {
                    self.scope()
                } else {
                    self.assorexpr(true)
                }
            }
        }
    }

    /// `{ stmt* }`
    fn scope(&mut self) -> AstId {
        let first = self.cur;
        if self.require_symbol(Symbol::OBrace) {
            self.next();
        }
        let mut elems = Vec::new();
        while !self.is_symbol(Symbol::CBrace) && !self.is(TokenKind::EndOfFile)
        {
            let before = self.cur;
            elems.push(self.freestmt());
            if self.cur == before {
                self.next();
            }
        }
        if self.require_symbol(Symbol::CBrace) {
            self.next();
        }
        let none_ty = self.wk().NONE;
        self.ast.make_block(elems, first, none_ty)
    }

    /// Either a braced scope or `do <stmt>`, normalized to a block.
    fn optscope(&mut self) -> AstId {
        if self.is_symbol(Symbol::OBrace) {
            self.scope()
        } else if self.is_keyword(Symbol::KwDo) {
            let tok = self.next(); // do
            let stmt = self.stmt();
            let none_ty = self.wk().NONE;
            self.ast.make_block(vec![stmt], tok, none_ty)
        } else {
            self.expected("`{` or `do`");
            self.make_error_ast()
        }
    }

    /// An identifier or the `_` placeholder, unresolved.
    fn maybe_identifier(&mut self) -> AstId {
        if self.is_keyword(Symbol::KwPlaceholder) {
            let tok = self.next();
            let typeless = self.wk().TYPELESS;
            self.ast.make_zero(Symbol::KwPlaceholder, tok, typeless)
        } else if self.require(TokenKind::Identifier, "an identifier") {
            let tok = self.next();
            let none_ty = self.wk().NONE;
            self.ast.make_iden(None, tok, none_ty)
        } else {
            self.make_error_ast()
        }
    }

    // ===== Modules =====

    /// `import "path";` or `import a.b.c;`
    fn importstmt(&mut self) -> AstId {
        let tok = self.next(); // import
        let (target, path) = if self.is(TokenKind::String) {
            let strtok = self.next();
            let bytes = match &self.tokens.get(strtok).value {
                TokenValue::String(bytes) => bytes.clone(),
                _ => Vec::new(),
            };
            let path = String::from_utf8_lossy(&bytes).into_owned();
            let none_array = self.wk().NONE_ARRAY;
            (self.ast.make_string(bytes, strtok, none_array), path)
        } else {
            let mut segments = Vec::new();
            let mut node = self.maybe_identifier();
            segments.push(self.tokens.get(self.ast.get(node).token).text.clone());
            while self.is_symbol(Symbol::Period) {
                let dot = self.next();
                let rhs = self.maybe_identifier();
                segments
                    .push(self.tokens.get(self.ast.get(rhs).token).text.clone());
                let none_ty = self.wk().NONE;
                node = self.ast.make_binary(
                    Symbol::Period,
                    node,
                    rhs,
                    dot,
                    none_ty,
                );
            }
            (node, segments.join("/"))
        };
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        let node = self.ast.make_unary(Symbol::KwImport, target, tok, typeless);
        let path = if path.ends_with(".nn") {
            path
        } else {
            format!("{}.nn", path)
        };
        self.imports.push((path, node));
        node
    }

    /// `using a.b.c;` or `using a.*;`
    fn usingstmt(&mut self) -> AstId {
        let tok = self.next(); // using
        let target = self.expression();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwUsing, target, tok, typeless)
    }

    /// `namespace name { ... }`
    fn namespacestmt(&mut self) -> AstId {
        let tok = self.next(); // namespace
        let name = self.maybe_identifier();
        let body = self.scope();
        let typeless = self.wk().TYPELESS;
        self.ast
            .make_binary(Symbol::KwNamespace, name, body, tok, typeless)
    }

    // ===== Declarations =====

    fn declstmt(&mut self) -> AstId {
        let decl = self.simplevardecl();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        decl
    }

    /// `var a, b: T = x, y`: declarator, names, optional type, optional
    /// values. The type slot holds INFER when elided.
    fn simplevardecl(&mut self) -> AstId {
        let declarator = self
            .cur_keyword()
            .filter(|s| {
                matches!(s, Symbol::KwVar | Symbol::KwLet | Symbol::KwRef)
            })
            .unwrap_or(Symbol::KwVar);
        let tok = self.next(); // var/let/ref

        let mut names = vec![self.maybe_identifier()];
        while self.is_symbol(Symbol::Comma) {
            self.next();
            names.push(self.maybe_identifier());
        }
        let none_ty = self.wk().NONE;
        let names = self.ast.make_compound(names, tok, none_ty);

        let ty_ast = if self.is_symbol(Symbol::Colon) {
            self.next();
            self.type_expr()
        } else {
            let (infer, type_ty) = (self.wk().INFER, self.wk().TYPE);
            self.ast.make_type(infer, tok, type_ty)
        };
        let typed = self.ast.make_binary(
            Symbol::Colon,
            names,
            ty_ast,
            tok,
            none_ty,
        );

        let values = if self.is_symbol(Symbol::Assign) {
            self.next();
            let mut values = vec![self.expression()];
            while self.is_symbol(Symbol::Comma) {
                self.next();
                values.push(self.expression());
            }
            self.ast.make_compound(values, tok, none_ty)
        } else {
            let typeless = self.wk().TYPELESS;
            self.ast.make_none(tok, typeless)
        };

        self.ast.make_binary(declarator, typed, values, tok, none_ty)
    }

    /// `def name := struct { ... };` / `def name :: fun(...) ... { ... }`
    fn defstmt(&mut self) -> AstId {
        let tok = self.next(); // def
        let name = self.maybe_identifier();
        if self.is_symbol(Symbol::Colon) {
            // `:=` arrives as `:` `=` when the run was already split
            self.next();
            if self.is_symbol(Symbol::Assign) {
                self.next();
            }
        } else if self.is_symbol(Symbol::DColon) {
            self.next();
        } else {
            self.expected("`:=` or `::`");
        }

        let typeless = self.wk().TYPELESS;
        let target = match self.cur_keyword() {
            Some(sym @ Symbol::KwStruct) | Some(sym @ Symbol::KwUnion) => {
                let kw = self.next();
                let body = self.scope();
                self.ast.make_binary(sym, name, body, kw, typeless)
            }
            Some(Symbol::KwEnum) => {
                let kw = self.next();
                let body = self.enumscope();
                self.ast
                    .make_binary(Symbol::KwEnum, name, body, kw, typeless)
            }
            Some(Symbol::KwTuple) => {
                let kw = self.next();
                let body = self.tupletypes();
                self.ast
                    .make_binary(Symbol::KwTuple, name, body, kw, typeless)
            }
            Some(Symbol::KwFun) => self.funcdef(Some(name)),
            _ => {
                self.expected("`struct`, `union`, `enum`, `tuple` or `fun`");
                self.make_error_ast()
            }
        };
        if self.is_symbol(Symbol::Semicolon) {
            self.next();
        }
        self.ast.make_unary(Symbol::KwDef, target, tok, typeless)
    }

    /// `{ name [= value], ... }`
    fn enumscope(&mut self) -> AstId {
        let first = self.cur;
        if self.require_symbol(Symbol::OBrace) {
            self.next();
        }
        let mut members = Vec::new();
        let none_ty = self.wk().NONE;
        while !self.is_symbol(Symbol::CBrace) && !self.is(TokenKind::EndOfFile)
        {
            let name = self.maybe_identifier();
            let entry = if self.is_symbol(Symbol::Assign) {
                let eq = self.next();
                let value = self.expression();
                self.ast
                    .make_binary(Symbol::Assign, name, value, eq, none_ty)
            } else {
                name
            };
            members.push(entry);
            if self.is_symbol(Symbol::Comma) || self.is_symbol(Symbol::Semicolon)
            {
                self.next();
            } else {
                break;
            }
        }
        if self.require_symbol(Symbol::CBrace) {
            self.next();
        }
        self.ast.make_block(members, first, none_ty)
    }

    /// `( type, type, ... )`
    fn tupletypes(&mut self) -> AstId {
        let first = self.cur;
        if self.require_symbol(Symbol::OParen) {
            self.next();
        }
        let mut members = Vec::new();
        while !self.is_symbol(Symbol::CParen) && !self.is(TokenKind::EndOfFile)
        {
            members.push(self.type_expr());
            if self.is_symbol(Symbol::Comma) {
                self.next();
            } else {
                break;
            }
        }
        if self.require_symbol(Symbol::CParen) {
            self.next();
        }
        let none_ty = self.wk().NONE;
        self.ast.make_compound(members, first, none_ty)
    }

    // ===== Functions =====

    /// A function definition or literal: `fun [captures] (params) -> rets
    /// body`. Shape: COMPOUND[captures, name, signature, body]. An
    /// anonymous function carries a placeholder name.
    fn funcdef(&mut self, name: Option<AstId>) -> AstId {
        let tok = self.cur;
        if self.require_keyword(Symbol::KwFun) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        let name = name.unwrap_or_else(|| {
            self.ast.make_zero(Symbol::KwPlaceholder, tok, typeless)
        });

        let captures = self.capture_group();
        let signature = self.functypesig();
        let body = if self.is_symbol(Symbol::OBrace) {
            self.scope()
        } else {
            // A signature without a body is a function type expression
            let typeless = self.wk().TYPELESS;
            self.ast.make_none(tok, typeless)
        };
        // The NONE_FUNCTION tag is what distinguishes this compound from a
        // plain parenthesized list in later phases
        let none_fn = self.wk().NONE_FUNCTION;
        self.ast.make_compound(
            vec![captures, name, signature, body],
            tok,
            none_fn,
        )
    }

    /// `[a, b]`, parsed but rejected at lowering; an absent group is an
    /// empty compound.
    fn capture_group(&mut self) -> AstId {
        let first = self.cur;
        let none_ty = self.wk().NONE;
        if !self.is_symbol(Symbol::OBrack) {
            return self.ast.make_compound(Vec::new(), first, none_ty);
        }
        self.next(); // [
        let mut captures = Vec::new();
        while !self.is_symbol(Symbol::CBrack) && !self.is(TokenKind::EndOfFile)
        {
            captures.push(self.expression());
            if self.is_symbol(Symbol::Comma) {
                self.next();
            } else {
                break;
            }
        }
        if self.require_symbol(Symbol::CBrack) {
            self.next();
        }
        self.ast.make_compound(captures, first, none_ty)
    }

    /// `(params) -> rets` or `(params) => rets`. Shape:
    /// BINARY(`:`, COMPOUND[params], UNARY(arrow, rets)).
    fn functypesig(&mut self) -> AstId {
        let first = self.cur;
        let none_ty = self.wk().NONE;
        if self.require_symbol(Symbol::OParen) {
            self.next();
        }
        let mut params = Vec::new();
        while !self.is_symbol(Symbol::CParen) && !self.is(TokenKind::EndOfFile)
        {
            params.push(self.funcparam());
            if self.is_symbol(Symbol::Comma) {
                self.next();
            } else {
                break;
            }
        }
        if self.require_symbol(Symbol::CParen) {
            self.next();
        }
        let params = self.ast.make_compound(params, first, none_ty);

        let arrow = if self.is_symbol(Symbol::SRArrow) {
            Symbol::SRArrow
        } else {
            Symbol::RArrow
        };
        let arrow_tok = self.cur;
        if self.require_symbol(arrow) {
            self.next();
        }
        let rets = self.funcrets();
        let rets = self.ast.make_unary(arrow, rets, arrow_tok, none_ty);
        self.ast.make_binary(Symbol::Colon, params, rets, first, none_ty)
    }

    /// One parameter: `[var|let|ref] [name] (:|::) type [...] [= default]`.
    /// Shape: BINARY(declarator, BINARY(`=`, name, default),
    /// BINARY(:|::, type, spread-or-none)).
    fn funcparam(&mut self) -> AstId {
        let first = self.cur;
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;

        let declarator = match self.cur_keyword() {
            Some(sym @ Symbol::KwVar)
            | Some(sym @ Symbol::KwLet)
            | Some(sym @ Symbol::KwRef) => {
                self.next();
                sym
            }
            _ => Symbol::KwVar,
        };

        // A parameter is named if an identifier (or `_`) is followed by a
        // colon; otherwise the whole thing is a bare type.
        let named = match self.cur_tok().kind {
            TokenKind::Identifier => {
                let next = self.peek_next();
                next.map(|id| {
                    matches!(self.tokens.get(id).text.chars().next(), Some(':'))
                })
                .unwrap_or(false)
            }
            TokenKind::Keyword => self.is_keyword(Symbol::KwPlaceholder),
            _ => false,
        };

        let (name, binding) = if named {
            let name = self.maybe_identifier();
            let binding = if self.is_symbol(Symbol::DColon) {
                self.next();
                true
            } else {
                if self.require_symbol(Symbol::Colon) {
                    self.next();
                }
                false
            };
            (name, binding)
        } else {
            let name =
                self.ast.make_zero(Symbol::KwPlaceholder, first, typeless);
            (name, false)
        };

        let ty_ast = self.type_expr();
        let spread = if self.is_symbol(Symbol::Spread) {
            let tok = self.next();
            self.ast.make_zero(Symbol::Spread, tok, typeless)
        } else {
            self.ast.make_none(first, typeless)
        };
        let colon = if binding { Symbol::DColon } else { Symbol::Colon };
        let typed = self.ast.make_binary(colon, ty_ast, spread, first, none_ty);

        let default = if self.is_symbol(Symbol::Assign) {
            self.next();
            self.expression()
        } else {
            self.ast.make_none(first, typeless)
        };
        let named = self
            .ast
            .make_binary(Symbol::Assign, name, default, first, none_ty);

        self.ast.make_binary(declarator, named, typed, first, none_ty)
    }

    /// Returns after the arrow: `infer`, or a comma-separated list of
    /// `[var|let|ref] [name:] type` entries.
    fn funcrets(&mut self) -> AstId {
        let first = self.cur;
        let none_ty = self.wk().NONE;
        if self.is_keyword(Symbol::KwInfer) {
            let tok = self.next();
            let (infer, type_ty) = (self.wk().INFER, self.wk().TYPE);
            return self.ast.make_type(infer, tok, type_ty);
        }
        let mut rets = Vec::new();
        loop {
            rets.push(self.funcret());
            if self.is_symbol(Symbol::Comma) {
                self.next();
            } else {
                break;
            }
        }
        self.ast.make_compound(rets, first, none_ty)
    }

    fn funcret(&mut self) -> AstId {
        let first = self.cur;
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;
        let declarator = match self.cur_keyword() {
            Some(sym @ Symbol::KwVar)
            | Some(sym @ Symbol::KwLet)
            | Some(sym @ Symbol::KwRef) => {
                self.next();
                sym
            }
            _ => Symbol::KwVar,
        };
        let named = match self.cur_tok().kind {
            TokenKind::Identifier => self
                .peek_next()
                .map(|id| {
                    matches!(self.tokens.get(id).text.chars().next(), Some(':'))
                })
                .unwrap_or(false),
            _ => false,
        };
        let name = if named {
            let name = self.maybe_identifier();
            if self.require_symbol(Symbol::Colon) {
                self.next();
            }
            name
        } else {
            self.ast.make_zero(Symbol::KwPlaceholder, first, typeless)
        };
        let ty_ast = self.type_expr();
        self.ast.make_binary(declarator, name, ty_ast, first, none_ty)
    }

    // ===== Control flow =====

    /// Conditions are statements separated by `;`, the last of which is
    /// the boolean; variable declarations are allowed in all but the last
    /// position.
    fn condlist(&mut self) -> AstId {
        let first = self.cur;
        let mut conds = Vec::new();
        loop {
            let cond = match self.cur_keyword() {
                Some(Symbol::KwVar) | Some(Symbol::KwLet)
                | Some(Symbol::KwRef) => self.simplevardecl(),
                _ => self.assorexpr(false),
            };
            conds.push(cond);
            if self.is_symbol(Symbol::Semicolon) {
                self.next();
            } else {
                break;
            }
        }
        let none_ty = self.wk().NONE;
        self.ast.make_compound(conds, first, none_ty)
    }

    fn ifstmt(&mut self) -> AstId {
        let tok = self.next(); // if
        let conds = self.condlist();
        let then = self.optscope();
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;
        let orelse = if self.is_keyword(Symbol::KwElse) {
            let else_tok = self.next();
            if self.is_keyword(Symbol::KwIf) {
                let nested = self.ifstmt();
                self.ast.make_block(vec![nested], else_tok, none_ty)
            } else {
                self.optscope()
            }
        } else {
            self.ast.make_none(tok, typeless)
        };
        let branches =
            self.ast.make_binary(Symbol::KwElse, then, orelse, tok, none_ty);
        self.ast.make_binary(Symbol::KwIf, conds, branches, tok, none_ty)
    }

    /// Three forms share the `for` keyword; the header node shape
    /// distinguishes them:
    /// - classic `for init; cond; step` is COMPOUND[init, conds, step]
    /// - for-each `for var x in seq` is BINARY(`in`, decl, seq)
    /// - numeric `for var i = a, b[, c]` is BINARY(`=`, decl, COMPOUND)
    fn forstmt(&mut self) -> AstId {
        let tok = self.next(); // for
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;

        let is_decl = matches!(
            self.cur_keyword(),
            Some(Symbol::KwVar) | Some(Symbol::KwLet) | Some(Symbol::KwRef)
        );

        let header = if is_decl {
            let declarator = self.cur_keyword().unwrap();
            let decl_tok = self.next();
            let mut names = vec![self.maybe_identifier()];
            while self.is_symbol(Symbol::Comma) {
                self.next();
                names.push(self.maybe_identifier());
            }
            let names = self.ast.make_compound(names, decl_tok, none_ty);
            let ty_ast = if self.is_symbol(Symbol::Colon) {
                self.next();
                self.type_expr()
            } else {
                let (infer, type_ty) = (self.wk().INFER, self.wk().TYPE);
                self.ast.make_type(infer, decl_tok, type_ty)
            };
            let typed = self
                .ast
                .make_binary(Symbol::Colon, names, ty_ast, decl_tok, none_ty);

            if self.is_keyword(Symbol::KwIn) {
                // for-each
                let in_tok = self.next();
                let no_values = self.ast.make_none(decl_tok, typeless);
                let decl = self.ast.make_binary(
                    declarator, typed, no_values, decl_tok, none_ty,
                );
                let seq = self.expression();
                self.ast.make_binary(Symbol::KwIn, decl, seq, in_tok, none_ty)
            } else {
                let eq_tok = self.cur;
                if self.require_symbol(Symbol::Assign) {
                    self.next();
                }
                let mut values = vec![self.expression()];
                while self.is_symbol(Symbol::Comma) {
                    self.next();
                    values.push(self.expression());
                }
                if self.is_symbol(Symbol::Semicolon) {
                    // classic, with the declaration as init
                    self.next();
                    let values =
                        self.ast.make_compound(values, eq_tok, none_ty);
                    let init = self.ast.make_binary(
                        declarator, typed, values, decl_tok, none_ty,
                    );
                    self.forclassic(tok, init)
                } else {
                    // numeric (start, stop and optional step)
                    if values.len() < 2 || values.len() > 3 {
                        self.error_at(
                            eq_tok,
                            CompileError::ValueCountMismatch {
                                expected: 2,
                                found: values.len(),
                            },
                        );
                    }
                    let no_values = self.ast.make_none(decl_tok, typeless);
                    let decl = self.ast.make_binary(
                        declarator, typed, no_values, decl_tok, none_ty,
                    );
                    let range = self.ast.make_compound(values, eq_tok, none_ty);
                    self.ast.make_binary(
                        Symbol::Assign,
                        decl,
                        range,
                        eq_tok,
                        none_ty,
                    )
                }
            }
        } else {
            // classic with an expression (or empty) initializer
            let init = if self.is_symbol(Symbol::Semicolon) {
                self.ast.make_none(tok, typeless)
            } else {
                self.assorexpr(false)
            };
            if self.require_symbol(Symbol::Semicolon) {
                self.next();
            }
            self.forclassic(tok, init)
        };

        let body = self.optscope();
        let none_ty = self.wk().NONE;
        self.ast.make_binary(Symbol::KwFor, header, body, tok, none_ty)
    }

    /// Parse `cond; step` of a classic for, given the already parsed init.
    fn forclassic(&mut self, tok: TokenId, init: AstId) -> AstId {
        let typeless = self.wk().TYPELESS;
        let none_ty = self.wk().NONE;
        let cond = if self.is_symbol(Symbol::Semicolon) {
            self.ast.make_none(tok, typeless)
        } else {
            self.expression()
        };
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let step = if self.is_symbol(Symbol::OBrace)
            || self.is_keyword(Symbol::KwDo)
        {
            self.ast.make_none(tok, typeless)
        } else {
            self.assorexpr(false)
        };
        self.ast.make_compound(vec![init, cond, step], tok, none_ty)
    }

    fn whilestmt(&mut self) -> AstId {
        let tok = self.next(); // while
        let conds = self.condlist();
        let body = self.optscope();
        let none_ty = self.wk().NONE;
        self.ast.make_binary(Symbol::KwWhile, conds, body, tok, none_ty)
    }

    fn loopstmt(&mut self) -> AstId {
        let tok = self.next(); // loop
        let body = self.optscope();
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwLoop, body, tok, typeless)
    }

    /// `do { ... } while cond;`
    fn dowhilestmt(&mut self) -> AstId {
        let tok = self.next(); // do
        let body = self.scope();
        if self.require_keyword(Symbol::KwWhile) {
            self.next();
        }
        let conds = self.condlist();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let none_ty = self.wk().NONE;
        self.ast.make_binary(Symbol::KwDo, body, conds, tok, none_ty)
    }

    fn switchstmt(&mut self) -> AstId {
        let tok = self.next(); // switch
        let subject = self.condlist();
        let first = self.cur;
        if self.require_symbol(Symbol::OBrace) {
            self.next();
        }
        let mut cases = Vec::new();
        let none_ty = self.wk().NONE;
        while !self.is_symbol(Symbol::CBrace) && !self.is(TokenKind::EndOfFile)
        {
            let before = self.cur;
            cases.push(self.casedecl());
            if self.cur == before {
                self.next();
            }
        }
        if self.require_symbol(Symbol::CBrace) {
            self.next();
        }
        let cases = self.ast.make_block(cases, first, none_ty);
        self.ast.make_binary(Symbol::KwSwitch, subject, cases, tok, none_ty)
    }

    /// `case v1, v2 { ... }` or `else { ... }`
    fn casedecl(&mut self) -> AstId {
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;
        if self.is_keyword(Symbol::KwElse) {
            let tok = self.next();
            let body = self.optscope();
            let values = self.ast.make_zero(Symbol::KwElse, tok, typeless);
            return self
                .ast
                .make_binary(Symbol::KwCase, values, body, tok, none_ty);
        }
        let tok = self.cur;
        if self.require_keyword(Symbol::KwCase) {
            self.next();
        }
        let mut values = vec![self.expression()];
        while self.is_symbol(Symbol::Comma) {
            self.next();
            values.push(self.expression());
        }
        let values = self.ast.make_compound(values, tok, none_ty);
        let body = self.optscope();
        self.ast.make_binary(Symbol::KwCase, values, body, tok, none_ty)
    }

    /// `try { ... } catch err { ... }`
    fn trystmt(&mut self) -> AstId {
        let tok = self.next(); // try
        let body = self.optscope();
        let none_ty = self.wk().NONE;
        let catch_tok = self.cur;
        if self.require_keyword(Symbol::KwCatch) {
            self.next();
        }
        let err = self.maybe_identifier();
        let handler = self.optscope();
        let catch = self
            .ast
            .make_binary(Symbol::KwCatch, err, handler, catch_tok, none_ty);
        self.ast.make_binary(Symbol::KwTry, body, catch, tok, none_ty)
    }

    fn returnstmt(&mut self) -> AstId {
        let tok = self.next(); // return
        let none_ty = self.wk().NONE;
        let mut values = Vec::new();
        if !self.is_symbol(Symbol::Semicolon) {
            values.push(self.expression());
            while self.is_symbol(Symbol::Comma) {
                self.next();
                values.push(self.expression());
            }
        }
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let values = self.ast.make_compound(values, tok, none_ty);
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwReturn, values, tok, typeless)
    }

    fn raisestmt(&mut self) -> AstId {
        let tok = self.next(); // raise
        let value = self.expression();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwRaise, value, tok, typeless)
    }

    fn gotostmt(&mut self) -> AstId {
        let tok = self.next(); // goto
        let target = self.maybe_identifier();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwGoto, target, tok, typeless)
    }

    fn labelstmt(&mut self) -> AstId {
        let tok = self.next(); // label
        let name = self.maybe_identifier();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwLabel, name, tok, typeless)
    }

    fn deferstmt(&mut self) -> AstId {
        let tok = self.next(); // defer
        let inner = self.stmt();
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwDefer, inner, tok, typeless)
    }

    fn breakstmt(&mut self) -> AstId {
        let tok = self.next(); // break
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_zero(Symbol::KwBreak, tok, typeless)
    }

    fn continuestmt(&mut self) -> AstId {
        let tok = self.next(); // continue
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_zero(Symbol::KwContinue, tok, typeless)
    }

    fn deletestmt(&mut self) -> AstId {
        let tok = self.next(); // delete
        let value = self.expression();
        if self.require_symbol(Symbol::Semicolon) {
            self.next();
        }
        let typeless = self.wk().TYPELESS;
        self.ast.make_unary(Symbol::KwDelete, value, tok, typeless)
    }

    /// An expression statement, an assignment, or a destructuring
    /// assignment (`a, b = f()`). With `stmt` set the trailing `;` is
    /// required and a bare comma-list is diagnosed.
    fn assorexpr(&mut self, stmt: bool) -> AstId {
        let first = self.expression();
        let none_ty = self.wk().NONE;
        let mut lefts = vec![first];
        while self.is_symbol(Symbol::Comma) {
            self.next();
            lefts.push(self.expression());
        }

        let is_assign = self
            .cur_symbol()
            .map(|s| s == Symbol::Assign || s.assign_op().is_some())
            .unwrap_or(false);

        let node = if is_assign {
            let sym = self.cur_symbol().unwrap();
            let tok = self.next();
            let mut rights = vec![self.expression()];
            while self.is_symbol(Symbol::Comma) {
                self.next();
                rights.push(self.expression());
            }
            let lefts_tok = self.ast.get(lefts[0]).token;
            let lefts = self.ast.make_compound(lefts, lefts_tok, none_ty);
            let rights = self.ast.make_compound(rights, tok, none_ty);
            self.ast.make_binary(sym, lefts, rights, tok, none_ty)
        } else if lefts.len() > 1 {
            if stmt {
                self.error_at(self.cur, CompileError::InvalidStatement);
            }
            let tok = self.ast.get(lefts[0]).token;
            self.ast.make_compound(lefts, tok, none_ty)
        } else {
            first
        };

        if stmt {
            if self.require_symbol(Symbol::Semicolon) {
                self.next();
            }
        }
        node
    }

    // ===== Types =====

    /// A type expression: `const`/`volat` prefixes, a base (primitive
    /// keyword, possibly-dotted identifier, generic instantiation, `fun`
    /// signature, anonymous struct/union/enum/tuple, parenthesized list)
    /// and pointer/array suffixes.
    fn type_expr(&mut self) -> AstId {
        let none_ty = self.wk().NONE;
        let type_ty = self.wk().TYPE;
        let typeless = self.wk().TYPELESS;

        if self.is_keyword(Symbol::KwConst) || self.is_keyword(Symbol::KwVolat)
        {
            let sym = self.cur_keyword().unwrap();
            let tok = self.next();
            let inner = self.type_expr();
            return self.ast.make_unary(sym, inner, tok, none_ty);
        }

        let mut base = match self.cur_keyword() {
            Some(kw) => match primitive_type_of(kw, &self.wk()) {
                Some(ty) => {
                    let tok = self.next();
                    self.ast.make_type(ty, tok, type_ty)
                }
                None => match kw {
                    Symbol::KwInfer => {
                        let tok = self.next();
                        let infer = self.wk().INFER;
                        self.ast.make_type(infer, tok, type_ty)
                    }
                    Symbol::KwFun => self.funcdef(None),
                    Symbol::KwStruct | Symbol::KwUnion => {
                        let kw = self.next();
                        let name = self.ast.make_zero(
                            Symbol::KwPlaceholder,
                            kw,
                            typeless,
                        );
                        let body = self.scope();
                        self.ast.make_binary(
                            self.tokens.get(kw).value.symbol().unwrap(),
                            name,
                            body,
                            kw,
                            typeless,
                        )
                    }
                    Symbol::KwEnum => {
                        let kw = self.next();
                        let name = self.ast.make_zero(
                            Symbol::KwPlaceholder,
                            kw,
                            typeless,
                        );
                        let body = self.enumscope();
                        self.ast.make_binary(
                            Symbol::KwEnum,
                            name,
                            body,
                            kw,
                            typeless,
                        )
                    }
                    Symbol::KwTuple => {
                        let kw = self.next();
                        let name = self.ast.make_zero(
                            Symbol::KwPlaceholder,
                            kw,
                            typeless,
                        );
                        let body = self.tupletypes();
                        self.ast.make_binary(
                            Symbol::KwTuple,
                            name,
                            body,
                            kw,
                            typeless,
                        )
                    }
                    _ => {
                        self.expected("a type");
                        self.make_error_ast()
                    }
                },
            },
            None => {
                if self.is(TokenKind::Identifier) {
                    let tok = self.next();
                    let mut node = self.ast.make_iden(None, tok, none_ty);
                    // Dotted path to a type in another scope
                    while self.is_symbol(Symbol::Period) {
                        let dot = self.next();
                        let rhs = self.maybe_identifier();
                        node = self.ast.make_binary(
                            Symbol::Period,
                            node,
                            rhs,
                            dot,
                            none_ty,
                        );
                    }
                    // Generic instantiation with angle brackets
                    if self.is_symbol(Symbol::Lt) {
                        let lt = self.next();
                        let mut args = vec![self.type_expr()];
                        while self.is_symbol(Symbol::Comma) {
                            self.next();
                            args.push(self.type_expr());
                        }
                        if self.require_symbol(Symbol::Gt) {
                            self.next();
                        }
                        let args =
                            self.ast.make_compound(args, lt, none_ty);
                        node = self.ast.make_binary(
                            Symbol::DColon,
                            node,
                            args,
                            lt,
                            none_ty,
                        );
                    }
                    node
                } else if self.is_symbol(Symbol::OParen) {
                    let tok = self.next();
                    let mut members = Vec::new();
                    while !self.is_symbol(Symbol::CParen)
                        && !self.is(TokenKind::EndOfFile)
                    {
                        members.push(self.type_expr());
                        if self.is_symbol(Symbol::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                    if self.require_symbol(Symbol::CParen) {
                        self.next();
                    }
                    self.ast.make_compound(members, tok, none_ty)
                } else {
                    self.expected("a type");
                    self.make_error_ast()
                }
            }
        };

        // Pointer and array suffixes bind tightest and stack
        loop {
            let suffix = match self.cur_symbol() {
                Some(sym @ Symbol::Mul)
                | Some(sym @ Symbol::Not)
                | Some(sym @ Symbol::Add)
                | Some(sym @ Symbol::WeakPtr) => {
                    let tok = self.next();
                    let node = self.ast.make_unary(sym, base, tok, none_ty);
                    match &mut self.ast.get_mut(node).kind {
                        AstKind::Unary { post, .. } => *post = true,
                        _ => unreachable!(),
                    }
                    node
                }
                Some(Symbol::OBrack) => {
                    let tok = self.next();
                    let size = if self.is_symbol(Symbol::CBrack) {
                        self.ast.make_none(tok, typeless)
                    } else {
                        self.expression()
                    };
                    if self.require_symbol(Symbol::CBrack) {
                        self.next();
                    }
                    self.ast.make_binary(
                        Symbol::OBrack,
                        base,
                        size,
                        tok,
                        none_ty,
                    )
                }
                _ => break,
            };
            base = suffix;
        }
        base
    }

    // ===== Expressions =====

    fn expression(&mut self) -> AstId {
        self.ternaryexpr()
    }

    /// `cond ?? then <> else`
    fn ternaryexpr(&mut self) -> AstId {
        let cond = self.newexpr();
        if !self.is_symbol(Symbol::DQuestion) {
            return cond;
        }
        let tok = self.next(); // ??
        let none_ty = self.wk().NONE;
        let then = self.expression();
        if self.require_symbol(Symbol::Diamond) {
            self.next();
        }
        let orelse = self.expression();
        let choice = self
            .ast
            .make_binary(Symbol::Diamond, then, orelse, tok, none_ty);
        let ternary = self
            .ast
            .make_binary(Symbol::DQuestion, cond, choice, tok, none_ty);
        self.set_precedence(ternary, PREC_TERNARY, cond);
        ternary
    }

    /// `new [(count)] type [: init]`. Shape: BINARY(`new`, init-or-none,
    /// BINARY(`*`, type, count)).
    fn newexpr(&mut self) -> AstId {
        if !self.is_keyword(Symbol::KwNew) {
            return self.prefixexpr();
        }
        let tok = self.next(); // new
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;
        let u64_ty = self.wk().U64;

        let count = if self.is_symbol(Symbol::OParen) {
            self.next();
            let count = self.expression();
            if self.require_symbol(Symbol::CParen) {
                self.next();
            }
            count
        } else {
            self.ast.make_value(1, tok, u64_ty)
        };

        let ty_ast = self.type_expr();
        let init = if self.is_symbol(Symbol::Colon) {
            self.next();
            self.expression()
        } else {
            self.ast.make_none(tok, typeless)
        };
        let alloc =
            self.ast.make_binary(Symbol::Mul, ty_ast, count, tok, none_ty);
        self.ast.make_binary(Symbol::KwNew, init, alloc, tok, none_ty)
    }

    fn prefixexpr(&mut self) -> AstId {
        let op = self.cur_op();
        let is_prefix = op
            .map(|sym| self.grammar.is_prefix_op(sym))
            .unwrap_or(false);
        if !is_prefix {
            return self.postfixexpr();
        }
        let sym = op.unwrap();
        let none_ty = self.wk().NONE;

        if sym == Symbol::OBrack {
            // `[n]T`: array-type prefix form
            let tok = self.next(); // [
            let typeless = self.wk().TYPELESS;
            let inner = if self.is_symbol(Symbol::CBrack) {
                self.ast.make_none(tok, typeless)
            } else {
                self.expression()
            };
            if self.require_symbol(Symbol::CBrack) {
                self.next();
            }
            let of = self.expression();
            let node = self
                .ast
                .make_binary(Symbol::CBrack, of, inner, tok, none_ty);
            self.set_precedence(node, PREC_PREFIX, of);
            return self.reorder_binary(node);
        }

        let tok = self.next();
        let operand = self.expression();
        let node = self.ast.make_unary(sym, operand, tok, none_ty);
        let prec = if sym == Symbol::Spread {
            PREC_SPREAD
        } else {
            PREC_PREFIX
        };
        self.set_precedence(node, prec, operand);
        self.reorder_unary(node)
    }

    fn postfixexpr(&mut self) -> AstId {
        let mut node = self.infixexpr();
        loop {
            let op = self.cur_op();
            let is_post = op
                .map(|sym| self.grammar.is_postfix_op(sym))
                .unwrap_or(false);
            if !is_post {
                return node;
            }
            let sym = op.unwrap();
            let tok = self.next();
            let none_ty = self.wk().NONE;
            let unary = self.ast.make_unary(sym, node, tok, none_ty);
            match &mut self.ast.get_mut(unary).kind {
                AstKind::Unary { post, .. } => *post = true,
                _ => unreachable!(),
            }
            self.set_precedence(unary, PREC_POST_UNARY, node);
            node = self.reorder_unary(unary);
        }
    }

    fn infixexpr(&mut self) -> AstId {
        let left = self.dotexpr();
        let op = self.cur_op();
        let sym = match op {
            Some(sym) if self.grammar.is_infix_op(sym) => sym,
            _ => return left,
        };
        let prec = infix_precedence(sym).expect("infix op has precedence");
        let tok = self.next();
        let right = self.expression();
        let none_ty = self.wk().NONE;
        let node = self.ast.make_binary(sym, left, right, tok, none_ty);
        self.set_precedence(node, prec, right);
        self.reorder_binary(node)
    }

    /// Left-associative dotted access; `.*` terminates a chain as a glob.
    /// Dot nodes are never reordered.
    fn dotexpr(&mut self) -> AstId {
        let mut node = self.postcircumfixexpr();
        while self.is_symbol(Symbol::Period) {
            let tok = self.next();
            let none_ty = self.wk().NONE;
            let rhs = if self.is_symbol(Symbol::Mul) {
                let star = self.next();
                let typeless = self.wk().TYPELESS;
                self.ast.make_zero(Symbol::Mul, star, typeless)
            } else {
                self.postcircumfixexpr()
            };
            node = self.ast.make_binary(Symbol::Period, node, rhs, tok, none_ty);
            if matches!(self.ast.get(rhs).kind, AstKind::Zero { .. }) {
                break;
            }
        }
        node
    }

    /// Calls `f(...)`, indexing `a[...]` and selection `a::[...]`, chained.
    fn postcircumfixexpr(&mut self) -> AstId {
        let mut node = self.literalexpr();
        loop {
            let none_ty = self.wk().NONE;
            match self.cur_symbol() {
                Some(Symbol::OParen) => {
                    let tok = self.next();
                    let mut args = Vec::new();
                    while !self.is_symbol(Symbol::CParen)
                        && !self.is(TokenKind::EndOfFile)
                    {
                        args.push(self.expression());
                        if self.is_symbol(Symbol::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                    if self.require_symbol(Symbol::CParen) {
                        self.next();
                    }
                    let args = self.ast.make_compound(args, tok, none_ty);
                    node = self.ast.make_binary(
                        Symbol::OParen,
                        node,
                        args,
                        tok,
                        none_ty,
                    );
                }
                Some(Symbol::OBrack) => {
                    let tok = self.next();
                    let index = self.expression();
                    if self.require_symbol(Symbol::CBrack) {
                        self.next();
                    }
                    node = self.ast.make_binary(
                        Symbol::OBrack,
                        node,
                        index,
                        tok,
                        none_ty,
                    );
                }
                Some(Symbol::DColon) => {
                    let tok = self.next();
                    if self.require_symbol(Symbol::OBrack) {
                        self.next();
                    }
                    let mut args = Vec::new();
                    while !self.is_symbol(Symbol::CBrack)
                        && !self.is(TokenKind::EndOfFile)
                    {
                        args.push(self.expression());
                        if self.is_symbol(Symbol::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                    if self.require_symbol(Symbol::CBrack) {
                        self.next();
                    }
                    let args = self.ast.make_compound(args, tok, none_ty);
                    let select = self.ast.make_binary(
                        Symbol::DColon,
                        node,
                        args,
                        tok,
                        none_ty,
                    );
                    self.set_precedence(select, PREC_SELECT, node);
                    node = select;
                }
                _ => return node,
            }
        }
    }

    fn literalexpr(&mut self) -> AstId {
        let none_ty = self.wk().NONE;
        let typeless = self.wk().TYPELESS;
        match self.cur_tok().kind {
            TokenKind::Number | TokenKind::Integer | TokenKind::Floating => {
                self.number()
            }
            TokenKind::Character => {
                let tok = self.next();
                let c = match self.tokens.get(tok).value {
                    TokenValue::Character(c) => c,
                    _ => '\0',
                };
                let ty = if (c as u32) < 0x100 {
                    self.wk().C8
                } else {
                    self.wk().C32
                };
                self.ast.make_value(c as u64, tok, ty)
            }
            TokenKind::String => self.string_lit(),
            TokenKind::Identifier => {
                let tok = self.next();
                self.ast.make_iden(None, tok, none_ty)
            }
            TokenKind::Keyword => {
                let kw = self.cur_keyword().unwrap();
                match kw {
                    Symbol::KwTrue | Symbol::KwFalse => {
                        let tok = self.next();
                        let u1 = self.wk().U1;
                        self.ast.make_value(
                            (kw == Symbol::KwTrue) as u64,
                            tok,
                            u1,
                        )
                    }
                    Symbol::KwNull => {
                        let tok = self.next();
                        let null = self.wk().NULL;
                        self.ast.make_value(0, tok, null)
                    }
                    Symbol::KwThis => {
                        let tok = self.next();
                        self.ast.make_zero(Symbol::KwThis, tok, none_ty)
                    }
                    Symbol::KwPlaceholder => {
                        let tok = self.next();
                        self.ast.make_zero(Symbol::KwPlaceholder, tok, typeless)
                    }
                    Symbol::KwFun => self.funcdef(None),
                    // A type keyword in expression position is a type
                    // value (`sizeof(u32)`, `u8[] as ...`)
                    _ => {
                        if primitive_type_of(kw, &self.wk()).is_some()
                            || matches!(
                                kw,
                                Symbol::KwStruct
                                    | Symbol::KwUnion
                                    | Symbol::KwEnum
                                    | Symbol::KwTuple
                                    | Symbol::KwInfer
                            )
                        {
                            self.type_expr()
                        } else {
                            self.expected("an expression");
                            let node = self.make_error_ast();
                            self.next();
                            node
                        }
                    }
                }
            }
            TokenKind::Symbol => match self.cur_symbol() {
                Some(Symbol::OParen) => self.parenexpr(),
                Some(Symbol::LiteralArray) => {
                    self.literal_compound(Symbol::CBrack, self.wk().NONE_ARRAY)
                }
                Some(Symbol::LiteralStruct) => {
                    self.literal_compound(Symbol::CBrace, self.wk().NONE_STRUCT)
                }
                Some(Symbol::LiteralTuple) => {
                    self.literal_compound(Symbol::CParen, self.wk().NONE_TUPLE)
                }
                _ => {
                    self.expected("an expression");
                    self.make_error_ast()
                }
            },
            _ => {
                self.expected("an expression");
                self.make_error_ast()
            }
        }
    }

    fn parenexpr(&mut self) -> AstId {
        let tok = self.next(); // (
        let first = self.expression();
        let node = if self.is_symbol(Symbol::Comma) {
            let mut elems = vec![first];
            while self.is_symbol(Symbol::Comma) {
                self.next();
                elems.push(self.expression());
            }
            let none_tuple = self.wk().NONE_TUPLE;
            self.ast.make_compound(elems, tok, none_tuple)
        } else {
            first
        };
        if self.require_symbol(Symbol::CParen) {
            self.next();
        }
        node
    }

    /// `'[ ... ]`, `'{ ... }`, `'( ... )`
    fn literal_compound(
        &mut self,
        closer: Symbol,
        ty: crate::ty::TypeId,
    ) -> AstId {
        let tok = self.next(); // opener
        let mut elems = Vec::new();
        while !self.is_symbol(closer) && !self.is(TokenKind::EndOfFile) {
            elems.push(self.expression());
            if self.is_symbol(Symbol::Comma) {
                self.next();
            } else {
                break;
            }
        }
        if self.require_symbol(closer) {
            self.next();
        }
        self.ast.make_compound(elems, tok, ty)
    }

    /// String literals keep the NONE_ARRAY tag until semantic analysis
    /// interns the concrete character-array type (the prefix lives on the
    /// token text).
    fn string_lit(&mut self) -> AstId {
        let tok = self.next();
        let bytes = match &self.tokens.get(tok).value {
            TokenValue::String(bytes) => bytes.clone(),
            _ => Vec::new(),
        };
        let none_array = self.wk().NONE_ARRAY;
        self.ast.make_string(bytes, tok, none_array)
    }

    /// Decode a numeric literal per
    /// `0[bBoOxX]?[digits'_]*(.[digits])?([eE][+-]?[digits])?[fFdD]?`,
    /// re-tagging the token as INTEGER or FLOATING.
    fn number(&mut self) -> AstId {
        let tok = self.next();
        let raw = self.tokens.get(tok).text.clone();
        let text: String =
            raw.chars().filter(|&c| c != '\'' && c != '_').collect();

        let (value, kind, ty) = decode_number(&text, &self.wk());
        let token = self.tokens.get_mut(tok);
        token.kind = kind;
        token.value = match kind {
            TokenKind::Floating => {
                TokenValue::Floating(f64::from_bits(value))
            }
            _ => TokenValue::Integer(value),
        };
        match ty {
            Some(ty) => self.ast.make_value(value, tok, ty),
            None => {
                self.error_at(
                    tok,
                    CompileError::Expected {
                        expected: "a well-formed number".into(),
                    },
                );
                self.make_error_ast()
            }
        }
    }
}

/// The well-known type named by a primitive type keyword, if any.
fn primitive_type_of(kw: Symbol, wk: &WellKnown) -> Option<crate::ty::TypeId> {
    let ty = match kw {
        Symbol::KwU0 => wk.U0,
        Symbol::KwU1 => wk.U1,
        Symbol::KwU8 => wk.U8,
        Symbol::KwU16 => wk.U16,
        Symbol::KwU32 => wk.U32,
        Symbol::KwU64 => wk.U64,
        Symbol::KwS8 => wk.S8,
        Symbol::KwS16 => wk.S16,
        Symbol::KwS32 => wk.S32,
        Symbol::KwS64 => wk.S64,
        Symbol::KwE64 => wk.E64,
        Symbol::KwF32 => wk.F32,
        Symbol::KwF64 => wk.F64,
        Symbol::KwC8 => wk.C8,
        Symbol::KwC16 => wk.C16,
        Symbol::KwC32 => wk.C32,
        Symbol::KwType => wk.TYPE,
        Symbol::KwAny => wk.ANY,
        _ => return None,
    };
    Some(ty)
}

/// Decode a separator-stripped numeric literal. Returns the value bits, the
/// re-tag kind and the literal's type (`None` on malformed input).
fn decode_number(
    text: &str,
    wk: &WellKnown,
) -> (u64, TokenKind, Option<crate::ty::TypeId>) {
    let (base, digits) = match text.as_bytes() {
        [b'0', b'b', rest @ ..] | [b'0', b'B', rest @ ..] => (2, rest),
        [b'0', b'o', rest @ ..] | [b'0', b'O', rest @ ..] => (8, rest),
        [b'0', b'x', rest @ ..] | [b'0', b'X', rest @ ..] => (16, rest),
        _ => (10, text.as_bytes()),
    };
    let digits = std::str::from_utf8(digits).unwrap();

    if base != 10 {
        return match u64::from_str_radix(digits, base) {
            Ok(value) => (value, TokenKind::Integer, Some(wk.U64)),
            Err(_) => (0, TokenKind::Integer, None),
        };
    }

    let (body, float_width) = match digits.as_bytes().last() {
        Some(b'f') | Some(b'F') => (&digits[..digits.len() - 1], Some(32)),
        Some(b'd') | Some(b'D') => (&digits[..digits.len() - 1], Some(64)),
        _ => (digits, None),
    };

    let is_float = float_width.is_some()
        || body.contains('.')
        || body.contains('e')
        || body.contains('E');
    if is_float {
        match body.parse::<f64>() {
            Ok(value) => match float_width {
                Some(32) => (
                    f64::from(value as f32).to_bits(),
                    TokenKind::Floating,
                    Some(wk.F32),
                ),
                _ => (value.to_bits(), TokenKind::Floating, Some(wk.F64)),
            },
            Err(_) => (0, TokenKind::Floating, None),
        }
    } else {
        match body.parse::<u64>() {
            Ok(value) => (value, TokenKind::Integer, Some(wk.U64)),
            Err(_) => (0, TokenKind::Integer, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex;

    struct Fixture {
        tokens: TokenStream,
        ast: AstArena,
        errors: Vec<SourceErrorWrapper<CompileError>>,
    }

    fn parse_src(src: &str) -> (Fixture, ParseOutput) {
        let grammar = Grammar::new();
        let types = crate::ty::TypeTable::new();
        let mut errors = Vec::new();
        let mut tokens = lex::lex(src, &mut errors);
        let mut ast = AstArena::new();
        let output = parse(
            src,
            &grammar,
            &mut tokens,
            &mut ast,
            *types.well_known(),
            &mut errors,
        );
        (
            Fixture {
                tokens,
                ast,
                errors,
            },
            output,
        )
    }

    /// Parse a single expression statement and print its tree.
    fn expr_tree(expr: &str) -> String {
        let src = format!("{};", expr);
        let (fixture, output) = parse_src(&src);
        assert!(
            fixture.errors.is_empty(),
            "unexpected errors for `{}`: {:?}",
            expr,
            fixture.errors
        );
        let root = fixture.ast.get(output.root);
        let stmt = match &root.kind {
            AstKind::Block { elems, .. } => elems[0],
            other => panic!("root was {:?}", other),
        };
        fixture.ast.print(stmt, &fixture.tokens)
    }

    #[test]
    fn test_empty_file() {
        let (fixture, output) = parse_src("");
        assert!(fixture.errors.is_empty());
        match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => assert!(elems.is_empty()),
            other => panic!("root was {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        assert_eq!(expr_tree("a + b * c"), "(a + (b * c))");
        assert_eq!(expr_tree("a * b + c"), "((a * b) + c)");
    }

    #[test]
    fn test_precedence_ties_are_left_associative() {
        assert_eq!(expr_tree("a - b - c"), "((a - b) - c)");
        assert_eq!(expr_tree("a + b - c + d"), "(((a + b) - c) + d)");
    }

    #[test]
    fn test_precedence_comparisons_and_logic() {
        assert_eq!(
            expr_tree("a + 1 < b && c"),
            "(((a + 1) < b) && c)"
        );
        assert_eq!(expr_tree("a || b && c"), "(a || (b && c))");
    }

    #[test]
    fn test_prefix_reorders_against_infix() {
        assert_eq!(expr_tree("-a + b"), "((-a) + b)");
        assert_eq!(expr_tree("!a == b"), "((!a) == b)");
    }

    #[test]
    fn test_dot_chains_left_associative() {
        assert_eq!(expr_tree("a.b.c"), "((a . b) . c)");
    }

    #[test]
    fn test_method_call_shape() {
        // a.b(c) is a dot whose right side is the call
        let src = "a.b(c);";
        let (fixture, output) = parse_src(src);
        assert!(fixture.errors.is_empty());
        let stmt = match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => elems[0],
            other => panic!("root was {:?}", other),
        };
        let (sym, _, rhs) = fixture.ast.binary(stmt);
        assert_eq!(sym, Symbol::Period);
        let (sym, _, args) = fixture.ast.binary(rhs);
        assert_eq!(sym, Symbol::OParen);
        match &fixture.ast.get(args).kind {
            AstKind::Compound { elems } => assert_eq!(elems.len(), 1),
            other => panic!("args was {:?}", other),
        }
    }

    #[test]
    fn test_ternary() {
        assert_eq!(expr_tree("a ?? b <> c"), "(a ?? (b <> c))");
    }

    #[test]
    fn test_call_and_index_chain() {
        // f(a, b)[1] is an index whose left side is the call
        let src = "f(a, b)[1];";
        let (fixture, output) = parse_src(src);
        assert!(fixture.errors.is_empty());
        let stmt = match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => elems[0],
            other => panic!("root was {:?}", other),
        };
        let (sym, call, _) = fixture.ast.binary(stmt);
        assert_eq!(sym, Symbol::OBrack);
        let (sym, _, args) = fixture.ast.binary(call);
        assert_eq!(sym, Symbol::OParen);
        match &fixture.ast.get(args).kind {
            AstKind::Compound { elems } => assert_eq!(elems.len(), 2),
            other => panic!("args was {:?}", other),
        }
    }

    #[test]
    fn test_trailing_operator_recovers() {
        let (fixture, output) = parse_src("var x = 1 + ;");
        // One diagnostic, and the tree still exists with a NONE operand
        assert!(!fixture.errors.is_empty());
        let root = match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => elems[0],
            other => panic!("root was {:?}", other),
        };
        // var decl -> values compound -> binary + with error rhs
        let (_, _, values) = fixture.ast.binary(root);
        let value = match &fixture.ast.get(values).kind {
            AstKind::Compound { elems } => elems[0],
            other => panic!("values was {:?}", other),
        };
        let (sym, _, rhs) = fixture.ast.binary(value);
        assert_eq!(sym, Symbol::Add);
        assert!(fixture.ast.get(rhs).is_none());
    }

    #[test]
    fn test_nested_generic_close_splits() {
        let (fixture, _) = parse_src("var x: a<b<c>> = y;");
        assert!(
            fixture.errors.is_empty(),
            "unexpected errors: {:?}",
            fixture.errors
        );
        // The token stream now contains two separate `>` tokens
        let gts = fixture
            .tokens
            .iter()
            .filter(|(_, t)| t.kind == TokenKind::Symbol && t.text == ">")
            .count();
        assert_eq!(gts, 2);
    }

    #[test]
    fn test_def_struct() {
        let (fixture, output) = parse_src(
            "def list := struct { var head: s32; var next: list*; };",
        );
        assert!(
            fixture.errors.is_empty(),
            "unexpected errors: {:?}",
            fixture.errors
        );
        let stmt = match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => elems[0],
            other => panic!("root was {:?}", other),
        };
        let (sym, target, _) = fixture.ast.unary(stmt);
        assert_eq!(sym, Symbol::KwDef);
        let (sym, _, body) = fixture.ast.binary(target);
        assert_eq!(sym, Symbol::KwStruct);
        match &fixture.ast.get(body).kind {
            AstKind::Block { elems, .. } => assert_eq!(elems.len(), 2),
            other => panic!("struct body was {:?}", other),
        }
    }

    #[test]
    fn test_def_function() {
        let (fixture, output) = parse_src(
            "def f :: fun(n: s32) -> s32 { return n; }",
        );
        assert!(
            fixture.errors.is_empty(),
            "unexpected errors: {:?}",
            fixture.errors
        );
        let stmt = match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => elems[0],
            other => panic!("root was {:?}", other),
        };
        let (_, target, _) = fixture.ast.unary(stmt);
        match &fixture.ast.get(target).kind {
            AstKind::Compound { elems } => assert_eq!(elems.len(), 4),
            other => panic!("function def was {:?}", other),
        }
    }

    #[test]
    fn test_import_paths() {
        let (fixture, output) =
            parse_src("import std.io;\nimport \"vendor/x.nn\";");
        assert!(fixture.errors.is_empty());
        let paths: Vec<&str> =
            output.imports.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["std/io.nn", "vendor/x.nn"]);
    }

    #[test]
    fn test_number_decoding() {
        let (fixture, output) = parse_src("var x = 0x1F;\nvar y = 2.5f;");
        assert!(fixture.errors.is_empty());
        let decls = match &fixture.ast.get(output.root).kind {
            AstKind::Block { elems, .. } => elems.clone(),
            other => panic!("root was {:?}", other),
        };
        let value_of = |decl: AstId| {
            let (_, _, values) = fixture.ast.binary(decl);
            match &fixture.ast.get(values).kind {
                AstKind::Compound { elems } => elems[0],
                other => panic!("values was {:?}", other),
            }
        };
        match fixture.ast.get(value_of(decls[0])).kind {
            AstKind::Value { value } => assert_eq!(value, 0x1F),
            ref other => panic!("value was {:?}", other),
        }
        match fixture.ast.get(value_of(decls[1])).kind {
            AstKind::Value { value } => {
                assert_eq!(f64::from_bits(value), 2.5);
            }
            ref other => panic!("value was {:?}", other),
        }
    }

    #[test]
    fn test_multi_return_and_destructuring() {
        let (fixture, _) = parse_src("a, b = f();");
        assert!(
            fixture.errors.is_empty(),
            "unexpected errors: {:?}",
            fixture.errors
        );
    }

    #[test]
    fn test_statement_forms_parse_clean() {
        let src = r#"
            def main :: fun() -> u0 {
                var total: s64 = 0;
                for var i = 10, 1 { total += i; }
                for var x in xs do total += x;
                for var i = 0; i < 10; i += 1 { total += i; }
                while total > 0 { total -= 1; }
                loop { break; }
                do { total += 1; } while total < 5;
                if total == 5 do total = 0;
                else do total = 1;
                switch total {
                    case 0, 1 do total = 10;
                    else do total = 20;
                }
                try { raise 1; } catch err { total = 0; }
                defer total = 0;
                label top;
                goto top;
                delete xs;
                return;
            }
        "#;
        let (fixture, _) = parse_src(src);
        assert!(
            fixture.errors.is_empty(),
            "unexpected errors: {:?}",
            fixture.errors
        );
    }
}
