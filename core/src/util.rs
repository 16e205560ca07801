//! Small shared utilities: source spans and source-code highlighting for
//! error output. Everything in here is independent of any compiler phase.

use serde::Serialize;
use std::fmt::{self, Formatter};

/// A range of source code, with both byte-level and line/column extents.
/// Lines and columns are 1-indexed, the offset is 0-indexed. Spans are
/// attached to tokens at lex time and flow through every later phase, so
/// that any diagnostic can point back at the code that caused it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Span {
    /// Byte offset of the start of this span, from the start of the file
    pub offset: usize,
    /// Length of the span, in bytes
    pub length: usize,
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    /// A span of `length` bytes starting at the given position. The end
    /// line/column are computed under the assumption that the span does not
    /// cross a line boundary, which holds for all tokens except strings;
    /// those use [Span::merge] over their constituent parts instead.
    pub fn at(offset: usize, length: usize, line: usize, col: usize) -> Self {
        Self {
            offset,
            length,
            start_line: line,
            start_col: col,
            end_line: line,
            end_col: col + length,
        }
    }

    /// The smallest span covering both `self` and `other`.
    pub fn merge(self, other: Span) -> Span {
        let (first, last) = if self.offset <= other.offset {
            (self, other)
        } else {
            (other, self)
        };
        Span {
            offset: first.offset,
            length: (last.offset + last.length).saturating_sub(first.offset),
            start_line: first.start_line,
            start_col: first.start_col,
            end_line: last.end_line,
            end_col: last.end_col,
        }
    }

    /// Get the slice of the source that this span points to.
    pub fn get_source_slice(self, src: &str) -> &str {
        let end = (self.offset + self.length).min(src.len());
        src.get(self.offset..end).unwrap_or("")
    }
}

/// Write the offending source line(s) with a caret underline, e.g.:
///
/// ```text
///   var x: u9 = 0;
///          ^^
/// ```
///
/// Used by the alternate formatter of error wrappers.
pub fn fmt_src_highlights(
    f: &mut Formatter<'_>,
    span: &Span,
    src: &str,
) -> fmt::Result {
    for (line_no, line) in src.lines().enumerate() {
        let line_no = line_no + 1;
        if line_no < span.start_line || line_no > span.end_line {
            continue;
        }

        writeln!(f, "\n  {}", line)?;

        // Caret span within this line. On interior lines of a multi-line
        // span the whole line is underlined.
        let from = if line_no == span.start_line {
            span.start_col - 1
        } else {
            0
        };
        let to = if line_no == span.end_line {
            (span.end_col - 1).min(line.len())
        } else {
            line.len()
        };
        write!(f, "  {}{}", " ".repeat(from), "^".repeat((to - from).max(1)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        let a = Span::at(4, 3, 1, 5);
        let b = Span::at(10, 2, 2, 3);
        let merged = a.merge(b);
        assert_eq!(merged.offset, 4);
        assert_eq!(merged.length, 8);
        assert_eq!(merged.start_line, 1);
        assert_eq!(merged.end_line, 2);
        // Merging is symmetric
        assert_eq!(merged, b.merge(a));
    }

    #[test]
    fn test_source_slice() {
        let src = "var x = 10;";
        assert_eq!(Span::at(4, 1, 1, 5).get_source_slice(src), "x");
        assert_eq!(Span::at(8, 2, 1, 9).get_source_slice(src), "10");
        // Out-of-bounds spans clamp rather than panic
        assert_eq!(Span::at(8, 100, 1, 9).get_source_slice(src), "10;");
    }
}
