//! Diagnostics: evaluation errors and source positions.

use std::fmt;

use thiserror::Error;
use typst_syntax::Span;

/// Result type for evaluation operations.
pub type EvalResult<T> = Result<T, EvalError>;

/// A byte range in the source text.
///
/// Extracted eagerly from [`typst_syntax::Span`] so errors stay usable after
/// the syntax tree is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

impl SourceSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Extract the byte range from a parser span, if it carries one.
    pub fn from_syntax(span: Span) -> Option<Self> {
        let range = span.range()?;
        Some(Self { start: range.start, end: range.end })
    }

    /// The 1-based line and column of the span start within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let prefix = &source[..self.start.min(source.len())];
        let line = prefix.lines().count().max(1);
        let last_newline = prefix.rfind('\n').map(|i| i + 1).unwrap_or(0);
        (line, self.start - last_newline + 1)
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// What went wrong, without position information.
#[derive(Debug, Clone, Error)]
pub enum EvalErrorKind {
    /// A parse error reported by the external parser.
    #[error("parse: {0}")]
    Parse(String),
    /// Unknown identifier on lookup or assignment.
    #[error("{0} not defined in scope")]
    Undefined(String),
    /// A value had the wrong kind for the operation.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },
    /// An operation that is not defined for its operands.
    #[error("{0}")]
    InvalidOp(String),
    /// Missing positional, unknown named argument, unmatched destructuring.
    #[error("argument: {0}")]
    Argument(String),
    /// Empty-container access, out-of-bounds index, bad selector conversion.
    #[error("{0}")]
    Domain(String),
    /// Division by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// File reads surfacing through the world callback.
    #[error("io: {0}")]
    Io(String),
    /// Loop iteration guard tripped.
    #[error("loop seems to be infinite")]
    TooManyIterations,
    /// Call depth guard tripped.
    #[error("maximum function call depth exceeded ({0})")]
    TooDeep(usize),
    /// A method or operation the dialect intentionally leaves out.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
}

/// An evaluation error with an optional position and source file.
#[derive(Debug, Clone)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub span: Option<SourceSpan>,
    pub file: Option<String>,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind) -> Self {
        Self { kind, span: None, file: None }
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    /// Attach a parser span if the error does not carry a position yet.
    pub fn or_span(mut self, span: Span) -> Self {
        if self.span.is_none() {
            self.span = SourceSpan::from_syntax(span);
        }
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Parse(msg.into()))
    }

    pub fn undefined(name: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Undefined(name.into()))
    }

    pub fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::new(EvalErrorKind::TypeMismatch { expected, found })
    }

    pub fn invalid_op(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::InvalidOp(msg.into()))
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Argument(msg.into()))
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Domain(msg.into()))
    }

    pub fn div_zero() -> Self {
        Self::new(EvalErrorKind::DivisionByZero)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Io(msg.into()))
    }

    pub fn unimplemented(what: &'static str) -> Self {
        Self::new(EvalErrorKind::Unimplemented(what))
    }

    /// Prefix the message with an operation name, keeping span and file.
    pub fn prefixed(self, operation: &str) -> Self {
        EvalError {
            kind: EvalErrorKind::InvalidOp(format!("{}: {}", operation, self.kind)),
            span: self.span,
            file: self.file,
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}: ", file)?;
        }
        write!(f, "{}", self.kind)?;
        if let Some(span) = &self.span {
            write!(f, " at {}", span)?;
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {}

impl From<EvalErrorKind> for EvalError {
    fn from(kind: EvalErrorKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_message_names_identifier() {
        let err = EvalError::undefined("blorp");
        assert_eq!(err.to_string(), "blorp not defined in scope");
    }

    #[test]
    fn prefixed_keeps_span() {
        let err = EvalError::domain("empty array").with_span(SourceSpan::new(3, 7));
        let err = err.prefixed("eval");
        assert_eq!(err.span, Some(SourceSpan::new(3, 7)));
        assert!(err.to_string().starts_with("eval: "));
    }

    #[test]
    fn line_col() {
        let src = "abc\ndef\nghi";
        let span = SourceSpan::new(5, 6);
        assert_eq!(span.line_col(src), (2, 2));
    }
}
