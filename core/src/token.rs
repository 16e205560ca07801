//! The token stream: decoded source text as a doubly-linked list of tokens.
//! The list is backed by an arena and addressed by [TokenId]s, so links are
//! plain ids instead of pointers. After lexing, the stream is mutable in
//! exactly one way: [TokenStream::split] splits a SYMBOL token in two, which
//! the parser uses to resolve operator runs against context (e.g. splitting
//! `>>` into `>` `>` while closing nested generics).

use crate::grammar::Symbol;
use crate::util::Span;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Handle to a token inside its [TokenStream].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TokenId(pub u32);

/// Classification of a token. The lexer emits `Number` for all numeric
/// literals; the parser re-tags them as `Integer` or `Floating` once the
/// literal has been decoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    Number,
    Integer,
    Floating,
    Character,
    String,
    CompilerNote,
    Identifier,
    Keyword,
    Symbol,
    Whitespace,
    Newline,
    Comment,
    Error,
    EndOfFile,
}

impl TokenKind {
    /// Tokens the parser never sees: they are emitted for tooling but
    /// skipped by `peek`.
    pub fn is_skippable(self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace | TokenKind::Newline | TokenKind::Comment
        )
    }
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Floating => "floating-point number",
            Self::Character => "character",
            Self::String => "string",
            Self::CompilerNote => "compiler note",
            Self::Identifier => "identifier",
            Self::Keyword => "keyword",
            Self::Symbol => "symbol",
            Self::Whitespace => "whitespace",
            Self::Newline => "newline",
            Self::Comment => "comment",
            Self::Error => "error",
            Self::EndOfFile => "end of file",
        };
        write!(f, "{}", name)
    }
}

/// Discriminant-specific payload of a token. Starts out [TokenValue::None]
/// for everything except strings and characters (which the lexer decodes
/// eagerly, escapes included); the parser fills in the rest.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TokenValue {
    None,
    Integer(u64),
    Floating(f64),
    Character(char),
    String(Vec<u8>),
    Symbol(Symbol),
}

impl TokenValue {
    pub fn symbol(&self) -> Option<Symbol> {
        match self {
            Self::Symbol(sym) => Some(*sym),
            _ => None,
        }
    }
}

/// One token. `text` is the slice of source it covers (decoded content for
/// strings lives in `value`, not `text`).
#[derive(Clone, Debug, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub value: TokenValue,
    pub span: Span,
    prev: Option<TokenId>,
    next: Option<TokenId>,
}

impl Token {
    pub fn prev(&self) -> Option<TokenId> {
        self.prev
    }

    pub fn next(&self) -> Option<TokenId> {
        self.next
    }
}

/// The token stream for one module.
#[derive(Debug, Default, Serialize)]
pub struct TokenStream {
    tokens: Vec<Token>,
    head: Option<TokenId>,
    tail: Option<TokenId>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<TokenId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, id: TokenId) -> &Token {
        &self.tokens[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TokenId) -> &mut Token {
        &mut self.tokens[id.0 as usize]
    }

    /// Append a token at the end of the stream.
    pub fn push(
        &mut self,
        kind: TokenKind,
        text: String,
        value: TokenValue,
        span: Span,
    ) -> TokenId {
        let id = TokenId(self.tokens.len() as u32);
        self.tokens.push(Token {
            kind,
            text,
            value,
            span,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.tokens[tail.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Split a SYMBOL token at byte offset `at`, producing two adjacent
    /// SYMBOL tokens. The first keeps the id and the leading text; the
    /// second is returned. Panics on non-symbol tokens or out-of-range
    /// offsets; both indicate a parser bug.
    pub fn split(&mut self, id: TokenId, at: usize) -> TokenId {
        let (tail_text, tail_span, old_next) = {
            let tok = self.get(id);
            assert_eq!(
                tok.kind,
                TokenKind::Symbol,
                "only symbol tokens can be split"
            );
            assert!(
                at > 0 && at < tok.text.len(),
                "split offset {} out of range for `{}`",
                at,
                tok.text
            );
            let tail_text = tok.text[at..].to_owned();
            let tail_span = Span::at(
                tok.span.offset + at,
                tok.text.len() - at,
                tok.span.start_line,
                tok.span.start_col + at,
            );
            (tail_text, tail_span, tok.next)
        };

        let new_id = TokenId(self.tokens.len() as u32);
        self.tokens.push(Token {
            kind: TokenKind::Symbol,
            text: tail_text,
            value: TokenValue::None,
            span: tail_span,
            prev: Some(id),
            next: old_next,
        });

        let tok = self.get_mut(id);
        tok.text.truncate(at);
        tok.span.length = at;
        tok.span.end_col = tok.span.start_col + at;
        tok.value = TokenValue::None;
        tok.next = Some(new_id);

        match old_next {
            Some(next) => self.tokens[next.0 as usize].prev = Some(new_id),
            None => self.tail = Some(new_id),
        }
        new_id
    }

    /// Iterate the stream in list order (which differs from arena order
    /// once tokens have been split).
    pub fn iter(&self) -> impl Iterator<Item = (TokenId, &Token)> {
        TokenIter {
            stream: self,
            cur: self.head,
        }
    }
}

struct TokenIter<'a> {
    stream: &'a TokenStream,
    cur: Option<TokenId>,
}

impl<'a> Iterator for TokenIter<'a> {
    type Item = (TokenId, &'a Token);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let tok = self.stream.get(id);
        self.cur = tok.next;
        Some((id, tok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(texts: &[(&str, TokenKind)]) -> TokenStream {
        let mut ts = TokenStream::new();
        let mut offset = 0;
        for (text, kind) in texts {
            let span = Span::at(offset, text.len(), 1, offset + 1);
            ts.push(*kind, (*text).into(), TokenValue::None, span);
            offset += text.len();
        }
        ts
    }

    #[test]
    fn test_linking() {
        let ts = stream_of(&[
            ("a", TokenKind::Identifier),
            ("+", TokenKind::Symbol),
            ("b", TokenKind::Identifier),
        ]);
        let texts: Vec<&str> =
            ts.iter().map(|(_, tok)| tok.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "+", "b"]);
        let head = ts.head().unwrap();
        assert_eq!(ts.get(head).prev(), None);
        let second = ts.get(head).next().unwrap();
        assert_eq!(ts.get(second).prev(), Some(head));
    }

    #[test]
    fn test_split() {
        let mut ts = stream_of(&[
            ("a", TokenKind::Identifier),
            (">>", TokenKind::Symbol),
            ("b", TokenKind::Identifier),
        ]);
        let sym = ts.head().map(|h| ts.get(h).next().unwrap()).unwrap();
        let tail = ts.split(sym, 1);

        let texts: Vec<&str> =
            ts.iter().map(|(_, tok)| tok.text.as_str()).collect();
        assert_eq!(texts, vec!["a", ">", ">", "b"]);

        // Spans stay contiguous
        let first = ts.get(sym);
        let second = ts.get(tail);
        assert_eq!(first.span.length, 1);
        assert_eq!(second.span.offset, first.span.offset + 1);
        assert_eq!(second.span.length, 1);

        // Links are intact in both directions
        assert_eq!(first.next(), Some(tail));
        assert_eq!(second.prev(), Some(sym));
        let b = second.next().unwrap();
        assert_eq!(ts.get(b).prev(), Some(tail));
    }

    #[test]
    #[should_panic(expected = "only symbol tokens can be split")]
    fn test_split_non_symbol_panics() {
        let mut ts = stream_of(&[("abc", TokenKind::Identifier)]);
        let head = ts.head().unwrap();
        ts.split(head, 1);
    }
}
