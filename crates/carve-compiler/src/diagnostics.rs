//! Coded diagnostics with source positions.
//!
//! Front-end stages accumulate diagnostics instead of failing fast; the
//! caller decides when errors abort the pipeline. Codes follow the stage
//! convention: `L####` lexer, `P####` parser, `E####` validator, `C####`
//! lowering, `M####` preprocessor.

use std::fmt;
use std::ops::Range;

/// Byte span into the source text.
pub type Span = Range<usize>;

/// Severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single coded diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub severity: Severity,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &'static str, span: Span, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            span,
            message: message.into(),
            hint: None,
        }
    }

    pub fn warning(code: &'static str, span: Span, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            span,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render as `error[P0001] at line:col: message`.
    pub fn render(&self, index: &LineIndex) -> String {
        let (line, column) = index.position(self.span.start);
        let mut out = format!(
            "{}[{}] at {line}:{column}: {}",
            self.severity, self.code, self.message
        );
        if let Some(hint) = &self.hint {
            out.push_str(&format!(" (hint: {hint})"));
        }
        out
    }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    messages: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.messages.push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter()
    }

    /// The first error, if any.
    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.messages.iter().find(|d| d.is_error())
    }
}

/// Byte-offset → line/column conversion table.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (offset, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(offset + 1);
            }
        }
        Self { line_starts }
    }

    /// 1-based (line, column) for a byte offset.
    pub fn position(&self, offset: usize) -> (u32, u32) {
        let line = self
            .line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let column = offset - self.line_starts[line];
        (line as u32 + 1, column as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_positions() {
        let index = LineIndex::new("ab\ncd\n\nef");

        assert_eq!(index.position(0), (1, 1));
        assert_eq!(index.position(1), (1, 2));
        assert_eq!(index.position(3), (2, 1));
        assert_eq!(index.position(6), (3, 1));
        assert_eq!(index.position(7), (4, 1));
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::warning("E0001", 0..1, "odd"));
        assert!(!diagnostics.has_errors());

        diagnostics.push(Diagnostic::error("E0002", 1..2, "bad"));
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.first_error().unwrap().code, "E0002");
    }

    #[test]
    fn render_includes_code_and_position() {
        let index = LineIndex::new("abc\ndef");
        let diagnostic =
            Diagnostic::error("P0001", 4..5, "unexpected token").with_hint("expected `;`");

        assert_eq!(
            diagnostic.render(&index),
            "error[P0001] at 2:1: unexpected token (hint: expected `;`)"
        );
    }
}
