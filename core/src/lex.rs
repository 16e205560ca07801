//! Lexical analysis: classify raw bytes into the token stream. The lexer is
//! deliberately dumb about two things, which the parser resolves with more
//! context available:
//!
//! - keywords are emitted as [TokenKind::Identifier] and promoted lazily;
//! - operator characters are emitted as maximal SYMBOL runs (`>>=`,
//!   `++`, ...), which the parser longest-matches and splits.
//!
//! Whitespace, newline and comment tokens are emitted (so tooling can
//! reconstruct the file) but skipped by the parser. Malformed input becomes
//! an ERROR token covering the offending range, and lexing resumes at the
//! next whitespace.

use crate::error::{CompileError, SourceErrorWrapper};
use crate::grammar::is_symbol_char;
use crate::token::{TokenId, TokenKind, TokenStream, TokenValue};
use crate::util::Span;

/// String literal prefixes that change the element type of the resulting
/// array (`c8` by default).
const STRING_PREFIXES: &[&str] = &["c", "u8", "u16", "u32"];

/// Lex a whole file into a token stream. Always succeeds; recoverable
/// problems are reported through `errors` and as ERROR tokens.
pub fn lex(
    src: &str,
    errors: &mut Vec<SourceErrorWrapper<CompileError>>,
) -> TokenStream {
    let mut lexer = Lexer {
        src: src.as_bytes(),
        text: src,
        pos: 0,
        line: 1,
        col: 1,
        stream: TokenStream::new(),
        errors,
    };
    lexer.run();
    lexer.stream
}

struct Lexer<'a, 'e> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: usize,
    col: usize,
    stream: TokenStream,
    errors: &'e mut Vec<SourceErrorWrapper<CompileError>>,
}

impl<'a, 'e> Lexer<'a, 'e> {
    fn run(&mut self) {
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            match c {
                b'\n' => self.newline(),
                c if (c as char).is_ascii_whitespace() => self.whitespace(),
                b'/' if self.peek(1) == Some(b'/') => self.line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.block_comment(),
                b'#' => self.compiler_note(),
                b'"' => self.string(0),
                b'\'' => self.quote(),
                b'0'..=b'9' => self.number(),
                c if is_symbol_char(c) => self.symbol_run(),
                _ => self.identifier(),
            }
        }
        let span = Span::at(self.pos, 0, self.line, self.col);
        self.stream
            .push(TokenKind::EndOfFile, String::new(), TokenValue::None, span);
    }

    // ===== Cursor =====

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> u8 {
        let c = self.src[self.pos];
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        c
    }

    /// Mark the current position; see [Lexer::emit].
    fn mark(&self) -> (usize, usize, usize) {
        (self.pos, self.line, self.col)
    }

    fn emit(
        &mut self,
        kind: TokenKind,
        value: TokenValue,
        mark: (usize, usize, usize),
    ) -> TokenId {
        let (offset, line, col) = mark;
        let mut span = Span::at(offset, self.pos - offset, line, col);
        span.end_line = self.line;
        span.end_col = self.col;
        let text = self.text[offset..self.pos].to_owned();
        self.stream.push(kind, text, value, span)
    }

    fn error(&mut self, error: CompileError, mark: (usize, usize, usize)) {
        let token = self.emit(TokenKind::Error, TokenValue::None, mark);
        let span = self.stream.get(token).span;
        self.errors
            .push(SourceErrorWrapper::new(error, span, self.text));
        // Recover at the next whitespace
        while let Some(c) = self.peek(0) {
            if (c as char).is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
    }

    // ===== Token classes =====

    fn newline(&mut self) {
        let mark = self.mark();
        self.bump();
        self.emit(TokenKind::Newline, TokenValue::None, mark);
    }

    fn whitespace(&mut self) {
        let mark = self.mark();
        while let Some(c) = self.peek(0) {
            if c == b'\n' || !(c as char).is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
        self.emit(TokenKind::Whitespace, TokenValue::None, mark);
    }

    fn line_comment(&mut self) {
        let mark = self.mark();
        while let Some(c) = self.peek(0) {
            if c == b'\n' {
                break;
            }
            self.bump();
        }
        self.emit(TokenKind::Comment, TokenValue::None, mark);
    }

    /// `/* ... */` comments nest.
    fn block_comment(&mut self) {
        let mark = self.mark();
        self.bump(); // /
        self.bump(); // *
        let mut depth = 1usize;
        while depth > 0 {
            match (self.peek(0), self.peek(1)) {
                (Some(b'*'), Some(b'/')) => {
                    self.bump();
                    self.bump();
                    depth -= 1;
                }
                (Some(b'/'), Some(b'*')) => {
                    self.bump();
                    self.bump();
                    depth += 1;
                }
                (Some(_), _) => {
                    self.bump();
                }
                (None, _) => {
                    self.error(CompileError::UnterminatedComment, mark);
                    return;
                }
            }
        }
        self.emit(TokenKind::Comment, TokenValue::None, mark);
    }

    /// `#name`: a note for the compiler, attached to the next definition.
    fn compiler_note(&mut self) {
        let mark = self.mark();
        self.bump(); // #
        while let Some(c) = self.peek(0) {
            if (c as char).is_ascii_whitespace() || is_symbol_char(c) {
                break;
            }
            self.bump();
        }
        self.emit(TokenKind::CompilerNote, TokenValue::None, mark);
    }

    /// Numbers cover `0[bBoOxX]?[digits'_]*(.[digits])?([eE][+-]?[digits])?
    /// [fFdD]?`. The lexer only captures the lexeme; decoding (and the
    /// INTEGER/FLOATING re-tag) happens in the parser where the base prefix
    /// and suffix can be diagnosed in context.
    fn number(&mut self) {
        let mark = self.mark();
        while let Some(c) = self.peek(0) {
            if (c as char).is_ascii_alphanumeric() || c == b'_' {
                self.bump();
            } else if c == b'\'' {
                // Digit separator only when a digit follows, else this is
                // the start of a char literal
                match self.peek(1) {
                    Some(d) if (d as char).is_ascii_alphanumeric() => {
                        self.bump();
                    }
                    _ => break,
                }
            } else if c == b'.' {
                // Decimal point only when a digit follows; `1.x` is a
                // dotted access on a number
                match self.peek(1) {
                    Some(d) if (d as char).is_ascii_digit() => {
                        self.bump();
                    }
                    _ => break,
                }
            } else if c == b'+' || c == b'-' {
                // Exponent sign, only directly after e/E
                let prev = self.src[self.pos - 1];
                if prev == b'e' || prev == b'E' {
                    self.bump();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        self.emit(TokenKind::Number, TokenValue::None, mark);
    }

    /// A `'` either opens one of the literal forms (`'[`, `'{`, `'(`) or a
    /// character literal.
    fn quote(&mut self) {
        match self.peek(1) {
            // `'['` is a char literal of `[`; `'[ 1, 2 ]` opens an array
            // literal. Two bytes of lookahead decide.
            Some(b'[') | Some(b'{') | Some(b'(')
                if self.peek(2) != Some(b'\'') =>
            {
                let mark = self.mark();
                self.bump();
                self.bump();
                self.emit(TokenKind::Symbol, TokenValue::None, mark);
            }
            _ => self.character(),
        }
    }

    fn character(&mut self) {
        let mark = self.mark();
        self.bump(); // '
        let c = match self.peek(0) {
            None | Some(b'\n') => {
                self.error(CompileError::UnterminatedChar, mark);
                return;
            }
            Some(b'\\') => match self.escape() {
                Some(c) => c,
                None => {
                    self.error(CompileError::UnterminatedChar, mark);
                    return;
                }
            },
            Some(_) => {
                // Multibyte pass-through
                let rest = &self.text[self.pos..];
                let c = rest.chars().next().unwrap();
                for _ in 0..c.len_utf8() {
                    self.bump();
                }
                c
            }
        };
        if self.peek(0) == Some(b'\'') {
            self.bump();
            self.emit(TokenKind::Character, TokenValue::Character(c), mark);
        } else {
            self.error(CompileError::UnterminatedChar, mark);
        }
    }

    /// `prefix_len` is the length of an already-consumed string prefix
    /// (`c`, `u8`, ...); the span of the token covers it.
    fn string(&mut self, prefix_len: usize) {
        let mark = (self.pos - prefix_len, self.line, self.col - prefix_len);
        self.bump(); // "
        let mut bytes = Vec::new();
        loop {
            match self.peek(0) {
                None => {
                    self.error(CompileError::UnterminatedString, mark);
                    return;
                }
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => match self.escape() {
                    Some(c) => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(
                            c.encode_utf8(&mut buf).as_bytes(),
                        );
                    }
                    None => {
                        self.error(CompileError::UnterminatedString, mark);
                        return;
                    }
                },
                Some(c) => {
                    bytes.push(c);
                    self.bump();
                }
            }
        }
        self.emit(TokenKind::String, TokenValue::String(bytes), mark);
    }

    /// Decode one `\`-escape. The cursor sits on the backslash.
    fn escape(&mut self) -> Option<char> {
        self.bump(); // backslash
        let c = self.peek(0)?;
        self.bump();
        match c {
            b'n' => Some('\n'),
            b't' => Some('\t'),
            b'r' => Some('\r'),
            b'\\' => Some('\\'),
            b'0' => Some('\0'),
            b'x' => {
                let mut value = 0u32;
                for _ in 0..2 {
                    let d = (self.peek(0)? as char).to_digit(16)?;
                    self.bump();
                    value = value * 16 + d;
                }
                char::from_u32(value)
            }
            b'u' => {
                if self.peek(0)? != b'{' {
                    return None;
                }
                self.bump();
                let mut value = 0u32;
                loop {
                    let c = self.peek(0)?;
                    if c == b'}' {
                        self.bump();
                        break;
                    }
                    value = value * 16 + (c as char).to_digit(16)?;
                    self.bump();
                }
                char::from_u32(value)
            }
            c => Some(c as char),
        }
    }

    /// A maximal run of operator characters. Comment openers and quotes
    /// terminate the run; `'` only appears via the literal forms which are
    /// handled before this.
    fn symbol_run(&mut self) {
        let mark = self.mark();
        while let Some(c) = self.peek(0) {
            if !is_symbol_char(c) || matches!(c, b'"' | b'\'' | b'#') {
                break;
            }
            if c == b'/' && matches!(self.peek(1), Some(b'/') | Some(b'*')) {
                break;
            }
            self.bump();
        }
        self.emit(TokenKind::Symbol, TokenValue::None, mark);
    }

    /// Anything that is neither whitespace nor an operator character,
    /// multibyte UTF-8 included. A prefix identifier directly followed by a
    /// quote turns into a prefixed string literal.
    fn identifier(&mut self) {
        let mark = self.mark();
        while let Some(c) = self.peek(0) {
            if (c as char).is_ascii_whitespace() || is_symbol_char(c) {
                break;
            }
            self.bump();
        }
        let text = &self.text[mark.0..self.pos];
        if self.peek(0) == Some(b'"') && STRING_PREFIXES.contains(&text) {
            self.string(text.len());
        } else {
            self.emit(TokenKind::Identifier, TokenValue::None, mark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_kinds(src: &str) -> Vec<(TokenKind, String)> {
        let mut errors = Vec::new();
        let stream = lex(src, &mut errors);
        assert!(errors.is_empty(), "unexpected lex errors: {:?}", errors);
        stream
            .iter()
            .filter(|(_, tok)| !tok.kind.is_skippable())
            .map(|(_, tok)| (tok.kind, tok.text.clone()))
            .collect()
    }

    #[test]
    fn test_empty_file() {
        let kinds = lex_kinds("");
        assert_eq!(kinds, vec![(TokenKind::EndOfFile, String::new())]);
    }

    #[test]
    fn test_declaration() {
        let kinds = lex_kinds("var x: u32 = 10;");
        assert_eq!(
            kinds,
            vec![
                (TokenKind::Identifier, "var".into()),
                (TokenKind::Identifier, "x".into()),
                (TokenKind::Symbol, ":".into()),
                (TokenKind::Identifier, "u32".into()),
                (TokenKind::Symbol, "=".into()),
                (TokenKind::Number, "10".into()),
                (TokenKind::Symbol, ";".into()),
                (TokenKind::EndOfFile, "".into()),
            ]
        );
    }

    #[test]
    fn test_symbol_runs_are_maximal() {
        // `>>` stays one token; the parser splits it on demand
        let kinds = lex_kinds("a<b<c>>");
        assert_eq!(
            kinds,
            vec![
                (TokenKind::Identifier, "a".into()),
                (TokenKind::Symbol, "<".into()),
                (TokenKind::Identifier, "b".into()),
                (TokenKind::Symbol, "<".into()),
                (TokenKind::Identifier, "c".into()),
                (TokenKind::Symbol, ">>".into()),
                (TokenKind::EndOfFile, "".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let kinds = lex_kinds("0x1F 1'000_000 1.5e+3 2.5f 0b1010");
        let texts: Vec<String> =
            kinds.iter().map(|(_, text)| text.clone()).collect();
        assert_eq!(
            texts,
            vec!["0x1F", "1'000_000", "1.5e+3", "2.5f", "0b1010", ""]
        );
        assert!(kinds[..5].iter().all(|(k, _)| *k == TokenKind::Number));
    }

    #[test]
    fn test_number_then_dot_access() {
        let kinds = lex_kinds("1.x");
        assert_eq!(kinds[0], (TokenKind::Number, "1".into()));
        assert_eq!(kinds[1], (TokenKind::Symbol, ".".into()));
        assert_eq!(kinds[2], (TokenKind::Identifier, "x".into()));
    }

    #[test]
    fn test_strings_and_escapes() {
        let mut errors = Vec::new();
        let stream = lex(r#""a\n\x41\u{1F600}b" u8"hey""#, &mut errors);
        assert!(errors.is_empty());
        let strings: Vec<&crate::token::Token> = stream
            .iter()
            .filter(|(_, t)| t.kind == TokenKind::String)
            .map(|(_, t)| t)
            .collect();
        assert_eq!(strings.len(), 2);
        match &strings[0].value {
            TokenValue::String(bytes) => {
                assert_eq!(bytes, "a\nA\u{1F600}b".as_bytes())
            }
            other => panic!("expected string value, got {:?}", other),
        }
        assert!(strings[1].text.starts_with("u8\""));
    }

    #[test]
    fn test_char_literals() {
        let kinds = lex_kinds(r"'a' '\n' '['");
        assert!(kinds[..3].iter().all(|(k, _)| *k == TokenKind::Character));
    }

    #[test]
    fn test_literal_openers() {
        let kinds = lex_kinds("'[1] '{2} '(3)");
        assert_eq!(kinds[0], (TokenKind::Symbol, "'[".into()));
        assert_eq!(kinds[3], (TokenKind::Symbol, "'{".into()));
        assert_eq!(kinds[6], (TokenKind::Symbol, "'(".into()));
    }

    #[test]
    fn test_nested_comments() {
        let kinds = lex_kinds("a /* outer /* inner */ still */ b // line");
        assert_eq!(
            kinds,
            vec![
                (TokenKind::Identifier, "a".into()),
                (TokenKind::Identifier, "b".into()),
                (TokenKind::EndOfFile, "".into()),
            ]
        );
    }

    #[test]
    fn test_compiler_note() {
        let kinds = lex_kinds("#inline def");
        assert_eq!(kinds[0], (TokenKind::CompilerNote, "#inline".into()));
    }

    #[test]
    fn test_unterminated_string_recovers() {
        let mut errors = Vec::new();
        let stream = lex("\"oops\nnext", &mut errors);
        assert_eq!(errors.len(), 1);
        // An ERROR token is present and lexing continued afterwards
        assert!(stream.iter().any(|(_, t)| t.kind == TokenKind::Error));
        assert!(stream
            .iter()
            .any(|(_, t)| t.kind == TokenKind::Identifier && t.text == "next"));
    }

    #[test]
    fn test_multibyte_identifier() {
        let kinds = lex_kinds("変数 + 1");
        assert_eq!(kinds[0], (TokenKind::Identifier, "変数".into()));
    }
}
