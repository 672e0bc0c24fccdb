//! Error types for all phases: lexing, parsing, compilation, execution,
//! and module encoding/decoding.

use crate::span::Span;
use thiserror::Error;

/// Lexer errors. Oryx source is line-oriented: strings may not span
/// lines, `#` comments run to the line end, and `@` introduces a native
/// name.
#[derive(Debug, Error)]
pub enum LexError {
    #[error("Stray character '{ch}' at {span}")]
    StrayChar { ch: char, span: Span },

    #[error("String not closed before the end of the line at {span}")]
    UnclosedString { span: Span },

    #[error("Unknown escape '\\{ch}' in string at {span}")]
    UnknownEscape { ch: char, span: Span },

    #[error("Malformed number '{text}' at {span}")]
    MalformedNumber { text: String, span: Span },

    #[error("'@' needs a native name after it at {span}")]
    MissingNativeName { span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            Self::StrayChar { span, .. }
            | Self::UnclosedString { span }
            | Self::UnknownEscape { span, .. }
            | Self::MalformedNumber { span, .. }
            | Self::MissingNativeName { span } => *span,
        }
    }
}

/// Parser errors. `UnexpectedEnd` is load-bearing: the REPL keeps
/// reading continuation lines while a parse fails with it.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Expected {what}, found '{found}' at {span}")]
    Expected {
        what: String,
        found: String,
        span: Span,
    },

    #[error("Input ended before the expression was complete at {0}")]
    UnexpectedEnd(Span),

    #[error("This expression cannot be assigned to at {0}")]
    BadAssignTarget(Span),

    #[error("A '{{' would be ambiguous here; parenthesize the block or map at {span}")]
    BraceNotAllowed { span: Span },

    #[error("Unknown type name '{name}' at {span}")]
    UnknownTypeName { name: String, span: Span },
}

impl ParseError {
    pub fn expected(what: impl Into<String>, found: impl Into<String>, span: Span) -> Self {
        Self::Expected {
            what: what.into(),
            found: found.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::Expected { span, .. }
            | Self::BraceNotAllowed { span }
            | Self::UnknownTypeName { span, .. } => *span,
            Self::UnexpectedEnd(span) | Self::BadAssignTarget(span) => *span,
        }
    }
}

/// A single bytecode compilation diagnostic.
#[derive(Debug, Clone, Error)]
#[error("{message} at offset {offset}")]
pub struct CompileError {
    pub message: String,
    /// Byte offset into the source of the offending token.
    pub offset: usize,
}

impl CompileError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// All diagnostics from one compilation. The compiler accumulates into a
/// shared list and aborts on the first via a sentinel; the driver renders
/// the whole list.
#[derive(Debug, Error)]
#[error("{}", render_compile_errors(.0))]
pub struct CompileErrors(pub Vec<CompileError>);

fn render_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// One frame of a runtime traceback, derived from the debug line map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub path: String,
    pub line: usize,
    pub column: usize,
}

/// Runtime errors. The `message` is the rendering of the raised error
/// value; `trace` has one entry per unwound frame, innermost first.
#[derive(Debug, Error)]
#[error("{}", render_runtime_error(.message, .trace))]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

fn render_runtime_error(message: &str, trace: &[TraceFrame]) -> String {
    let mut out = format!("Runtime error: {}", message);
    for frame in trace {
        out.push_str(&format!(
            "\n  at {}:{}:{}",
            frame.path, frame.line, frame.column
        ));
    }
    out
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

/// Errors while encoding a module to the on-disk format.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Module section too large: {0} entries")]
    SectionTooLarge(usize),
}

/// Errors while decoding a module from the on-disk format. These are
/// fatal at load: the driver reports and exits immediately.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Bad magic bytes: not an Oryx module")]
    BadMagic,

    #[error("Unsupported module version {0}")]
    BadVersion(u8),

    #[error("Module truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Trailing bytes after module payload")]
    TrailingBytes,

    #[error("Invalid opcode byte {0}")]
    BadOpcode(u8),

    #[error("String pool is not valid UTF-8")]
    BadStringPool,
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum OryxError {
    #[error("Lex error: {0}")]
    Lex(#[from] LexError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileErrors),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_render_all() {
        let errs = CompileErrors(vec![
            CompileError::new("first", 3),
            CompileError::new("second", 9),
        ]);
        let rendered = errs.to_string();
        assert!(rendered.contains("first at offset 3"));
        assert!(rendered.contains("second at offset 9"));
    }

    #[test]
    fn test_front_end_errors_carry_spans() {
        let span = Span::new(4, 5, 1, 5);
        let lex = LexError::MissingNativeName { span };
        assert_eq!(lex.span(), span);
        assert!(lex.to_string().contains("native name"));

        let parse = ParseError::expected("a newline or ';'", "}", span);
        assert_eq!(parse.span(), span);
        assert!(parse.to_string().contains("Expected a newline or ';'"));
    }

    #[test]
    fn test_runtime_error_trace_render() {
        let err = RuntimeError {
            message: "division by zero".to_string(),
            trace: vec![TraceFrame {
                path: "main.ox".to_string(),
                line: 2,
                column: 5,
            }],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("division by zero"));
        assert!(rendered.contains("main.ox:2:5"));
    }
}
