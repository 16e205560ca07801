//! All error-related NN types. Every phase of the toolchain is
//! diagnostic-collecting: it produces a best-effort result plus a list of
//! [SourceErrorWrapper]s, and only the driver decides whether the build as a
//! whole failed. Internal invariant violations panic; everything a user can
//! cause is represented here.

use crate::util::{self, Span};
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error;

/// How bad a diagnostic is. Warnings never fail a build on their own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A trait for any error that originates in source code. [SourceError]s rely
/// on having source code present in order to display themselves.
pub trait SourceError: 'static + Send + Sync + Debug + Serialize {
    /// A simple type label for this error, e.g. `"syntax"` or `"type"`.
    fn type_label(&self) -> &'static str;

    /// The severity of this error. Almost everything is an error.
    fn severity(&self) -> Severity {
        Severity::Error
    }

    /// Format this error into a simple message. `spanned_src` is the slice
    /// of the source code that corresponds to this error's [Span]. This
    /// needs to be provided by the caller in order to create a proper error
    /// message.
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result;
}

/// An error that occurs while turning NN source text into a typed AST. The
/// error is due to a flaw in the program, _not_ an internal compiler error;
/// compiler bugs always cause a panic.
#[derive(Clone, Debug, Serialize)]
pub enum CompileError {
    // ===== Lex errors =====
    /// A byte sequence the lexer could not classify
    InvalidBytes,
    /// A string literal without a closing quote
    UnterminatedString,
    /// A character literal without a closing quote
    UnterminatedChar,
    /// A `/* ... */` comment that never closes
    UnterminatedComment,

    // ===== Parse errors =====
    /// Generic "expected X" failure from a `require_*` parser function.
    /// `expected` names the element that was missing.
    Expected { expected: String },
    /// A statement that doesn't start with anything statement-like
    InvalidStatement,
    /// A module importing itself
    SelfImport,

    // ===== Semantic errors =====
    /// Identifier lookup failed in every reachable scope
    Undeclared,
    /// Two declarations of the same name in one scope
    Redeclaration { original: Span },
    /// No conversion between the two named types
    TypeMismatch { from: String, to: String },
    /// An operator applied to a type that doesn't support it
    IllegalOperator { op: String, ty: String },
    /// A call where more than one overload (or none) matches
    AmbiguousOverload { name: String, candidates: usize },
    /// A `using`-imported name that collides with another import
    AmbiguousUsing { name: String },
    /// An expression that must be compile-time but isn't
    NotCompiletime,
    /// A value used where a type is required
    NotAType,
    /// `raise` in a function with no e64 in its return list
    RaiseWithoutErrorReturn,
    /// `goto` to a label that is never declared
    UnknownLabel,
    /// Dependency cycle detected after yield-budget exhaustion
    CircularDependency { name: String },
    /// Destructuring/multi-return arity mismatch
    ValueCountMismatch { expected: usize, found: usize },
    /// `break`/`continue` outside of a loop
    NotInLoop,
    /// Functions with capture groups cannot be lowered (unsupported)
    CapturedClosure,
}

impl SourceError for CompileError {
    fn type_label(&self) -> &'static str {
        match self {
            Self::InvalidBytes
            | Self::UnterminatedString
            | Self::UnterminatedChar
            | Self::UnterminatedComment
            | Self::Expected { .. }
            | Self::InvalidStatement
            | Self::SelfImport => "syntax",
            _ => "type",
        }
    }

    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::InvalidBytes => {
                write!(f, "cannot make sense of `{}`", spanned_src)
            }
            Self::UnterminatedString => write!(f, "unterminated string"),
            Self::UnterminatedChar => {
                write!(f, "unterminated character literal")
            }
            Self::UnterminatedComment => write!(f, "unterminated comment"),
            Self::Expected { expected } => write!(f, "expected {}", expected),
            Self::InvalidStatement => write!(f, "invalid statement"),
            Self::SelfImport => write!(f, "module imports itself"),
            Self::Undeclared => {
                write!(f, "`{}` has not been declared", spanned_src)
            }
            Self::Redeclaration { original } => write!(
                f,
                "`{}` has already been declared on line {}",
                spanned_src, original.start_line
            ),
            Self::TypeMismatch { from, to } => {
                write!(f, "cannot convert `{}` to `{}`", from, to)
            }
            Self::IllegalOperator { op, ty } => {
                write!(f, "operator `{}` cannot be applied to `{}`", op, ty)
            }
            Self::AmbiguousOverload { name, candidates } => write!(
                f,
                "call to `{}` matches {} overloads",
                name, candidates
            ),
            Self::AmbiguousUsing { name } => write!(
                f,
                "`{}` was brought in by more than one using directive",
                name
            ),
            Self::NotCompiletime => {
                write!(f, "`{}` is not a compile-time value", spanned_src)
            }
            Self::NotAType => write!(f, "`{}` is not a type", spanned_src),
            Self::RaiseWithoutErrorReturn => {
                write!(f, "raise requires an e64 in the function returns")
            }
            Self::UnknownLabel => {
                write!(f, "goto target `{}` was never declared", spanned_src)
            }
            Self::CircularDependency { name } => {
                write!(f, "circular dependency while resolving `{}`", name)
            }
            Self::ValueCountMismatch { expected, found } => write!(
                f,
                "expected {} values but found {}",
                expected, found
            ),
            Self::NotInLoop => {
                write!(f, "`{}` used outside of a loop", spanned_src)
            }
            Self::CapturedClosure => {
                write!(f, "functions with captures cannot be lowered")
            }
        }
    }
}

/// An error that occurs while assembling `.nnasm` text into an executable
/// image.
#[derive(Clone, Debug, Serialize)]
pub enum AsmError {
    /// Operand text the tokenizer could not classify
    MalformedOperand,
    /// A mnemonic not present in the opcode table
    UnknownMnemonic,
    /// Operand where an instruction or pseudo-op was expected
    ExpectedMnemonic,
    /// More than three operands on one instruction
    TooManyOperands,
    /// No internal variant of the opcode accepts these operand kinds
    FormatMismatch { mnemonic: String },
    /// LBL/DB/DBS name declared twice
    DuplicateName,
    /// Pass 2 could not resolve an identifier to a label or data block
    UnknownIdentifier,
    /// `<name` reference to a VAL that was never declared
    UnknownValue,
    /// Pseudo-op missing its name operand
    ExpectedName,
    /// DB/DBS entry that is neither an immediate nor a string
    InvalidData,
}

impl SourceError for AsmError {
    fn type_label(&self) -> &'static str {
        "assembly"
    }

    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::MalformedOperand => {
                write!(f, "malformed operand `{}`", spanned_src)
            }
            Self::UnknownMnemonic => {
                write!(f, "unknown mnemonic `{}`", spanned_src)
            }
            Self::ExpectedMnemonic => {
                write!(f, "expected a mnemonic, found `{}`", spanned_src)
            }
            Self::TooManyOperands => write!(f, "too many operands"),
            Self::FormatMismatch { mnemonic } => write!(
                f,
                "operands of `{}` do not match any form of {}",
                spanned_src, mnemonic
            ),
            Self::DuplicateName => {
                write!(f, "`{}` has already been defined", spanned_src)
            }
            Self::UnknownIdentifier => {
                write!(f, "`{}` could not be resolved", spanned_src)
            }
            Self::UnknownValue => {
                write!(f, "`{}` does not name a VAL", spanned_src)
            }
            Self::ExpectedName => write!(f, "expected a name"),
            Self::InvalidData => {
                write!(f, "`{}` cannot appear in a data block", spanned_src)
            }
        }
    }
}

/// A wrapper around a [SourceError] that holds some extra data:
/// - The [Span] of the source code that caused the error
/// - The offending chunk of source code itself
///
/// This type on its own can be formatted, without any external data.
#[derive(Clone, Debug, Error, Serialize)]
pub struct SourceErrorWrapper<E: SourceError> {
    error: E,
    span: Span,
    spanned_source: String,
}

impl<E: SourceError> SourceErrorWrapper<E> {
    pub fn new(error: E, span: Span, src: &str) -> Self {
        Self {
            error,
            span,
            spanned_source: span.get_source_slice(src).into(),
        }
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn error(&self) -> &E {
        &self.error
    }

    /// Render this error with the standard `file:line:col:` prefix.
    pub fn fmt_with_source_name(
        &self,
        f: &mut Formatter<'_>,
        source_name: &str,
    ) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: ",
            source_name,
            self.span.start_line,
            self.span.start_col,
            self.error.severity(),
        )?;
        self.error.fmt_msg(f, &self.spanned_source)
    }
}

impl<E: SourceError> Display for SourceErrorWrapper<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_with_source_name(f, "<source>")
    }
}

/// A collection of errors together with the source code they refer to and
/// the name it should be reported under. The alternate formatter (`{:#}`)
/// renders each error with a caret-underlined snippet of the offending line.
#[derive(Clone, Debug, Error, Serialize)]
pub struct WithSource<E: SourceError> {
    errors: Vec<SourceErrorWrapper<E>>,
    source_name: String,
    #[serde(skip)]
    source_code: String,
}

impl<E: SourceError> WithSource<E> {
    /// Wrap a collection of errors with its source code.
    pub(crate) fn new(
        errors: impl IntoIterator<Item = SourceErrorWrapper<E>>,
        source_name: String,
        source: String,
    ) -> Self {
        Self {
            errors: errors.into_iter().collect(),
            source_name,
            source_code: source,
        }
    }

    /// Get a reference to the errors wrapped by this type.
    pub fn errors(&self) -> &[SourceErrorWrapper<E>] {
        &self.errors
    }

    /// Does this collection contain at least one [Severity::Error]?
    pub fn has_errors(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.error.severity() == Severity::Error)
    }
}

impl<E: SourceError> Display for WithSource<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }

            error.fmt_with_source_name(f, &self.source_name)?;
            if f.alternate() {
                util::fmt_src_highlights(f, &error.span, &self.source_code)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_format() {
        let src = "var x: u9 = 0;";
        let err = SourceErrorWrapper::new(
            CompileError::Undeclared,
            Span::at(7, 2, 1, 8),
            src,
        );
        let with_source = WithSource::new(
            vec![err],
            "main.nn".into(),
            src.into(),
        );
        assert_eq!(
            with_source.to_string(),
            "main.nn:1:8: error: `u9` has not been declared"
        );
        assert_eq!(
            format!("{:#}", with_source),
            "main.nn:1:8: error: `u9` has not been declared\n\
             \x20 var x: u9 = 0;\n\
             \x20        ^^"
        );
    }

    #[test]
    fn test_type_mismatch_names_both_types() {
        let err = CompileError::TypeMismatch {
            from: "s32".into(),
            to: "u8*".into(),
        };
        let wrapped = SourceErrorWrapper::new(err, Span::default(), "");
        assert_eq!(
            wrapped.to_string(),
            "<source>:0:0: error: cannot convert `s32` to `u8*`"
        );
    }
}
