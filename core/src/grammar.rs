//! The NN grammar tables: every keyword and operator symbol the language
//! knows about, the text ⇄ symbol mappings used for lazy keyword promotion
//! and symbol longest-match (see [crate::parse]), and the operator
//! precedence table.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};

/// Every keyword and operator in the language. Keywords carry a `Kw`
/// prefix. A few operator spellings serve several syntactic roles (the
/// parser decides by position): `+` is also the shared-pointer marker, `*`
/// the naked-pointer marker and address-of, `!` the unique-pointer marker,
/// `?` the weak-pointer marker, and `++` is concatenation when infix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Symbol {
    // Type keywords
    KwU0, KwU1, KwU8, KwU16, KwU32, KwU64,
    KwS8, KwS16, KwS32, KwS64,
    KwE64, KwF32, KwF64, KwC8, KwC16, KwC32,
    KwType, KwAny, KwFun, KwStruct, KwUnion, KwEnum, KwTuple,
    // Declarators
    KwInfer, KwVar, KwLet, KwRef, KwDef, KwConst, KwVolat,
    // Control
    KwIf, KwElse, KwFor, KwLoop, KwWhile, KwDo, KwSwitch, KwCase,
    KwReturn, KwRaise, KwBreak, KwContinue, KwGoto, KwLabel, KwDefer,
    KwTry, KwCatch,
    // Literals
    KwTrue, KwFalse, KwNull,
    // Modules
    KwImport, KwUsing, KwNamespace, KwAs, KwIn,
    // Memory
    KwNew, KwDelete, KwThis,
    // Meta
    KwPlaceholder, KwSizeof, KwTypeof, KwTypeinfo,
    // Reserved for later use
    KwYield, KwMatch, KwDynamic, KwStatic, KwAnd, KwOr,

    // Arithmetic
    Add, Sub, Mul, Div, IntDiv, Modulo, Concat,
    // Shifts and rotations
    Shl, Shr, Rtl, Rtr,
    // Single-bit operations
    BitSet, BitClear, BitToggle, BitCheck,
    // Bitwise and logical
    And, Land, Or, Lor, Xor, Not, Lnot,
    // Comparisons
    Lt, Gt, Le, Ge, Equals, NotEquals,
    // Pointers and unary
    At, WeakPtr, Increment, Decrement, Spread,
    // Punctuation
    Colon, DColon, DQuestion, Semicolon, Comma, Period,
    // Assignment
    Assign, AddAssign, SubAssign, ConcatAssign, MulAssign, DivAssign,
    IntDivAssign, ModuloAssign, ShlAssign, ShrAssign, RtlAssign, RtrAssign,
    BitSetAssign, BitClearAssign, BitToggleAssign, BitCheckAssign,
    AndAssign, OrAssign, XorAssign,
    // Literal openers
    LiteralArray, LiteralStruct, LiteralTuple,
    // Grouping
    OParen, CParen, OBrace, CBrace, OBrack, CBrack,
    // Arrows and misc
    RArrow, SRArrow, Diamond, Nothing, CommentClose,
}

/// Shared-pointer marker; same spelling as [Symbol::Add].
pub const SHARED_PTR: Symbol = Symbol::Add;
/// Naked pointer marker and address-of; same spelling as [Symbol::Mul].
pub const POINTER: Symbol = Symbol::Mul;
/// Unique-pointer marker; same spelling as [Symbol::Not].
pub const UNIQUE_PTR: Symbol = Symbol::Not;

/// One row per distinct spelling. Aliased roles (pointer markers etc.) are
/// resolved by the parser, not by this table.
const SYMBOL_TEXTS: &[(Symbol, &str)] = &[
    (Symbol::KwU0, "u0"), (Symbol::KwU1, "u1"), (Symbol::KwU8, "u8"),
    (Symbol::KwU16, "u16"), (Symbol::KwU32, "u32"), (Symbol::KwU64, "u64"),
    (Symbol::KwS8, "s8"), (Symbol::KwS16, "s16"), (Symbol::KwS32, "s32"),
    (Symbol::KwS64, "s64"), (Symbol::KwE64, "e64"), (Symbol::KwF32, "f32"),
    (Symbol::KwF64, "f64"), (Symbol::KwC8, "c8"), (Symbol::KwC16, "c16"),
    (Symbol::KwC32, "c32"), (Symbol::KwType, "type"), (Symbol::KwAny, "any"),
    (Symbol::KwFun, "fun"), (Symbol::KwStruct, "struct"),
    (Symbol::KwUnion, "union"), (Symbol::KwEnum, "enum"),
    (Symbol::KwTuple, "tuple"), (Symbol::KwInfer, "infer"),
    (Symbol::KwVar, "var"), (Symbol::KwLet, "let"), (Symbol::KwRef, "ref"),
    (Symbol::KwDef, "def"), (Symbol::KwConst, "const"),
    (Symbol::KwVolat, "volat"), (Symbol::KwIf, "if"),
    (Symbol::KwElse, "else"), (Symbol::KwFor, "for"),
    (Symbol::KwLoop, "loop"), (Symbol::KwWhile, "while"),
    (Symbol::KwDo, "do"), (Symbol::KwSwitch, "switch"),
    (Symbol::KwCase, "case"), (Symbol::KwReturn, "return"),
    (Symbol::KwRaise, "raise"), (Symbol::KwBreak, "break"),
    (Symbol::KwContinue, "continue"), (Symbol::KwGoto, "goto"),
    (Symbol::KwLabel, "label"), (Symbol::KwDefer, "defer"),
    (Symbol::KwTry, "try"), (Symbol::KwCatch, "catch"),
    (Symbol::KwTrue, "true"), (Symbol::KwFalse, "false"),
    (Symbol::KwNull, "null"), (Symbol::KwImport, "import"),
    (Symbol::KwUsing, "using"), (Symbol::KwNamespace, "namespace"),
    (Symbol::KwAs, "as"), (Symbol::KwIn, "in"), (Symbol::KwNew, "new"),
    (Symbol::KwDelete, "delete"), (Symbol::KwThis, "this"),
    (Symbol::KwPlaceholder, "_"), (Symbol::KwSizeof, "sizeof"),
    (Symbol::KwTypeof, "typeof"), (Symbol::KwTypeinfo, "typeinfo"),
    (Symbol::KwYield, "yield"), (Symbol::KwMatch, "match"),
    (Symbol::KwDynamic, "dynamic"), (Symbol::KwStatic, "static"),
    (Symbol::KwAnd, "and"), (Symbol::KwOr, "or"),

    (Symbol::Add, "+"), (Symbol::Sub, "-"), (Symbol::Mul, "*"),
    (Symbol::Div, "/"), (Symbol::IntDiv, "//"), (Symbol::Modulo, "%"),
    (Symbol::Concat, "++"),
    (Symbol::Shl, "<<"), (Symbol::Shr, ">>"), (Symbol::Rtl, "<<>"),
    (Symbol::Rtr, "<>>"),
    (Symbol::BitSet, "@|"), (Symbol::BitClear, "@&"),
    (Symbol::BitToggle, "@^"), (Symbol::BitCheck, "@?"),
    (Symbol::And, "&"), (Symbol::Land, "&&"), (Symbol::Or, "|"),
    (Symbol::Lor, "||"), (Symbol::Xor, "^"), (Symbol::Not, "!"),
    (Symbol::Lnot, "!!"),
    (Symbol::Lt, "<"), (Symbol::Gt, ">"), (Symbol::Le, "<="),
    (Symbol::Ge, ">="), (Symbol::Equals, "=="), (Symbol::NotEquals, "!="),
    (Symbol::At, "@"), (Symbol::WeakPtr, "?"), (Symbol::Increment, "++"),
    (Symbol::Decrement, "--"), (Symbol::Spread, "..."),
    (Symbol::Colon, ":"), (Symbol::DColon, "::"),
    (Symbol::DQuestion, "??"), (Symbol::Semicolon, ";"),
    (Symbol::Comma, ","), (Symbol::Period, "."),
    (Symbol::Assign, "="), (Symbol::AddAssign, "+="),
    (Symbol::SubAssign, "-="), (Symbol::ConcatAssign, "++="),
    (Symbol::MulAssign, "*="), (Symbol::DivAssign, "/="),
    (Symbol::IntDivAssign, "//="), (Symbol::ModuloAssign, "%="),
    (Symbol::ShlAssign, "<<="), (Symbol::ShrAssign, ">>="),
    (Symbol::RtlAssign, "<<>="), (Symbol::RtrAssign, "<>>="),
    (Symbol::BitSetAssign, "@|="), (Symbol::BitClearAssign, "@&="),
    (Symbol::BitToggleAssign, "@^="), (Symbol::BitCheckAssign, "@?="),
    (Symbol::AndAssign, "&="), (Symbol::OrAssign, "|="),
    (Symbol::XorAssign, "^="),
    (Symbol::LiteralArray, "'["), (Symbol::LiteralStruct, "'{"),
    (Symbol::LiteralTuple, "'("),
    (Symbol::OParen, "("), (Symbol::CParen, ")"), (Symbol::OBrace, "{"),
    (Symbol::CBrace, "}"), (Symbol::OBrack, "["), (Symbol::CBrack, "]"),
    (Symbol::RArrow, "->"), (Symbol::SRArrow, "=>"),
    (Symbol::Diamond, "<>"), (Symbol::Nothing, "---"),
    (Symbol::CommentClose, "*/"),
];

impl Symbol {
    /// The canonical spelling of this symbol.
    pub fn text(self) -> &'static str {
        // Increment shares its spelling with Concat; everything else is
        // present in the table.
        SYMBOL_TEXTS
            .iter()
            .find(|(sym, _)| *sym == self)
            .map(|(_, text)| *text)
            .unwrap_or("???")
    }

    pub fn is_keyword(self) -> bool {
        self.text().starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
    }

    /// Is this one of the compound-assignment spellings (`+=` etc.)? The
    /// underlying operator is returned for IR lowering.
    pub fn assign_op(self) -> Option<Symbol> {
        match self {
            Symbol::AddAssign => Some(Symbol::Add),
            Symbol::SubAssign => Some(Symbol::Sub),
            Symbol::ConcatAssign => Some(Symbol::Concat),
            Symbol::MulAssign => Some(Symbol::Mul),
            Symbol::DivAssign => Some(Symbol::Div),
            Symbol::IntDivAssign => Some(Symbol::IntDiv),
            Symbol::ModuloAssign => Some(Symbol::Modulo),
            Symbol::ShlAssign => Some(Symbol::Shl),
            Symbol::ShrAssign => Some(Symbol::Shr),
            Symbol::RtlAssign => Some(Symbol::Rtl),
            Symbol::RtrAssign => Some(Symbol::Rtr),
            Symbol::BitSetAssign => Some(Symbol::BitSet),
            Symbol::BitClearAssign => Some(Symbol::BitClear),
            Symbol::BitToggleAssign => Some(Symbol::BitToggle),
            Symbol::BitCheckAssign => Some(Symbol::BitCheck),
            Symbol::AndAssign => Some(Symbol::And),
            Symbol::OrAssign => Some(Symbol::Or),
            Symbol::XorAssign => Some(Symbol::Xor),
            _ => None,
        }
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

// ===== Precedence =====
//
// Higher binds tighter. Everything that cannot be reordered (dotted access,
// blocks, literals) has precedence NOT_REORDERABLE.

pub const NOT_REORDERABLE: i16 = -1;
pub const PREC_POST_UNARY: i16 = 0x3F;
pub const PREC_POST_CIRCUMFIX: i16 = 0x3F;
pub const PREC_SPREAD: i16 = 0x3E;
pub const PREC_SELECT: i16 = 0x3D;
pub const PREC_PREFIX: i16 = 0x3C;
pub const PREC_TERNARY: i16 = 0x30;

/// Infix binding power of a symbol, if it can be used infix.
pub fn infix_precedence(sym: Symbol) -> Option<i16> {
    let prec = match sym {
        Symbol::KwAs => 0x3F,
        Symbol::Mul | Symbol::Div | Symbol::IntDiv | Symbol::Modulo => 0x3B,
        Symbol::Add | Symbol::Sub | Symbol::Concat => 0x3A,
        Symbol::Shl | Symbol::Shr | Symbol::Rtl | Symbol::Rtr => 0x39,
        Symbol::BitSet
        | Symbol::BitClear
        | Symbol::BitToggle
        | Symbol::BitCheck => 0x38,
        Symbol::And => 0x37,
        Symbol::Or => 0x36,
        Symbol::Xor => 0x35,
        Symbol::Lt | Symbol::Le | Symbol::Gt | Symbol::Ge => 0x34,
        Symbol::Equals | Symbol::NotEquals => 0x33,
        Symbol::Land | Symbol::KwAnd => 0x32,
        Symbol::Lor | Symbol::KwOr => 0x31,
        _ => return None,
    };
    Some(prec)
}

/// The grammar tables, built once per [crate::Session]. Lookup of keywords
/// and symbol spellings plus the operator-position sets used by the
/// expression parser.
#[derive(Debug)]
pub struct Grammar {
    string_to_symbol: HashMap<&'static str, Symbol>,
    pre_ops: HashSet<Symbol>,
    post_ops: HashSet<Symbol>,
    infix_ops: HashSet<Symbol>,
}

impl Grammar {
    pub fn new() -> Self {
        use Symbol::*;

        let mut string_to_symbol = HashMap::new();
        for (sym, text) in SYMBOL_TEXTS {
            // First spelling wins; Increment resolves to Concat here and the
            // parser rewrites by position.
            string_to_symbol.entry(*text).or_insert(*sym);
        }

        let pre_ops = [
            Spread, Decrement, Sub, Add, Not, Lnot, At, Mul, WeakPtr,
            OBrack, KwTypeof, KwSizeof, KwTypeinfo, KwConst, KwVolat,
        ]
        .iter()
        .copied()
        .collect();

        let post_ops = [Decrement].iter().copied().collect();

        let infix_ops = [
            KwAs, Mul, Div, IntDiv, Modulo, Add, Sub, Concat, Shl, Shr, Rtl,
            Rtr, BitSet, BitClear, BitToggle, BitCheck, And, Or, Xor, Lt, Le,
            Gt, Ge, Equals, NotEquals, Land, Lor, KwAnd, KwOr,
        ]
        .iter()
        .copied()
        .collect();

        Self {
            string_to_symbol,
            pre_ops,
            post_ops,
            infix_ops,
        }
    }

    /// Exact lookup of a spelling, keyword or operator.
    pub fn lookup(&self, text: &str) -> Option<Symbol> {
        self.string_to_symbol.get(text).copied()
    }

    pub fn is_prefix_op(&self, sym: Symbol) -> bool {
        self.pre_ops.contains(&sym)
    }

    pub fn is_postfix_op(&self, sym: Symbol) -> bool {
        self.post_ops.contains(&sym)
    }

    pub fn is_infix_op(&self, sym: Symbol) -> bool {
        self.infix_ops.contains(&sym)
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Self::new()
    }
}

/// Is this byte one of the characters that can start or continue an
/// operator run? Identifiers are runs of anything that is neither
/// whitespace nor one of these (multibyte UTF-8 passes through).
pub fn is_symbol_char(c: u8) -> bool {
    matches!(
        c,
        b'+' | b'-' | b'*' | b'/' | b'%' | b'#' | b'~' | b'&' | b'@' | b'|'
            | b'^' | b'!' | b'?' | b':' | b';' | b'<' | b'>' | b',' | b'.'
            | b'\'' | b'"' | b'[' | b']' | b'{' | b'}' | b'(' | b')' | b'='
            | b'\\' | b'`'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_roundtrip() {
        let grammar = Grammar::new();
        for (sym, text) in SYMBOL_TEXTS {
            let found = grammar.lookup(text).unwrap();
            // Aliased spellings resolve to the first table entry
            assert_eq!(found.text(), sym.text());
        }
    }

    #[test]
    fn test_keyword_lookup() {
        let grammar = Grammar::new();
        assert_eq!(grammar.lookup("struct"), Some(Symbol::KwStruct));
        assert_eq!(grammar.lookup("_"), Some(Symbol::KwPlaceholder));
        assert_eq!(grammar.lookup("structs"), None);
        assert!(Symbol::KwStruct.is_keyword());
        assert!(!Symbol::Shl.is_keyword());
    }

    #[test]
    fn test_precedence_ordering() {
        // Multiplication binds tighter than addition, addition tighter than
        // comparison, comparison tighter than logic
        let mul = infix_precedence(Symbol::Mul).unwrap();
        let add = infix_precedence(Symbol::Add).unwrap();
        let lt = infix_precedence(Symbol::Lt).unwrap();
        let land = infix_precedence(Symbol::Land).unwrap();
        assert!(mul > add);
        assert!(add > lt);
        assert!(lt > land);
        assert!(infix_precedence(Symbol::Assign).is_none());
    }
}
