//! Error taxonomy and diagnostic rendering.
//!
//! Compile-time problems (lex, parse, type) are collected as [`Diagnostic`]s
//! carrying the offending token. Runtime problems travel as [`RunError`]
//! through `RunResult` until the VM unwinds to a module boundary, where they
//! are turned into an [`Exception`] with a resolved source position and a
//! backtrace.

use std::fmt::{self, Write as _};

use strum::IntoStaticStr;

use crate::token::Token;

/// Result type alias for operations that can raise a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Category of an error, matching the user-visible diagnostic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ErrorKind {
    #[strum(serialize = "lex-error")]
    Lex,
    #[strum(serialize = "parse-error")]
    Parse,
    #[strum(serialize = "type-error")]
    Type,
    #[strum(serialize = "runtime-error")]
    Runtime,
    #[strum(serialize = "module-error")]
    Module,
    #[strum(serialize = "io-error")]
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(<&'static str>::from(self))
    }
}

impl ErrorKind {
    /// Process exit code for errors of this kind, per the driver contract.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Io => 74,
            _ => 65,
        }
    }
}

/// A positioned compile-time diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub token: Token,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>, token: Token) -> Self {
        Self {
            kind,
            message: message.into(),
            token,
        }
    }

    /// Renders the diagnostic in the canonical format:
    ///
    /// ```text
    /// <path>:<line>:<col>: <kind>: <message>
    ///   <source line>
    ///        ^~~~~
    /// ```
    pub fn render(&self, path: &str, source: &str) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{path}:{}:{}: {}: {}",
            self.token.line, self.token.col, self.kind, self.message
        );
        if let Some(line_text) = source_line(source, self.token.line) {
            let _ = write!(out, "\n  {line_text}\n  ");
            let col = self.token.col.max(1) as usize;
            for _ in 1..col {
                out.push(' ');
            }
            out.push('^');
            for _ in 1..self.token.len.max(1) {
                out.push('~');
            }
        }
        out
    }
}

/// Returns the 1-based `line` of `source`, without its trailing newline.
pub(crate) fn source_line(source: &str, line: u32) -> Option<&str> {
    if line == 0 {
        return None;
    }
    source.lines().nth(line as usize - 1)
}

/// A runtime error as raised inside the interpreter.
///
/// Carries no position; the VM records the faulting instruction's source
/// token when it unwinds, so raising sites stay terse.
#[derive(Debug, Clone)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: message.into(),
        }
    }

    pub fn module(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Module,
            message: message.into(),
        }
    }

    /// Arity mismatch helper used by every callable kind.
    pub fn arity(name: &str, expected: &str, got: u8) -> Self {
        Self::runtime(format!("{name}() takes {expected} arguments but {got} were given"))
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One frame of a runtime backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name, or `<module>` for top-level code.
    pub function: String,
    pub line: u32,
    pub col: u32,
}

/// A fully-resolved error surfaced to the embedding host or the driver.
///
/// Unlike [`RunError`], an `Exception` knows where it happened and how the
/// VM got there. Its `Display` output is the user-visible error report.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ErrorKind,
    pub message: String,
    pub path: String,
    pub line: u32,
    pub col: u32,
    /// Source line text plus caret span, when the position could be resolved.
    pub context: Option<(String, u32, u32)>,
    pub backtrace: Vec<TraceFrame>,
}

impl Exception {
    /// Builds an exception from a diagnostic plus the file it came from.
    pub fn from_diagnostic(diag: &Diagnostic, path: &str, source: &str) -> Self {
        let context = source_line(source, diag.token.line)
            .map(|text| (text.to_owned(), diag.token.col, diag.token.len.max(1)));
        Self {
            kind: diag.kind,
            message: diag.message.clone(),
            path: path.to_owned(),
            line: diag.token.line,
            col: diag.token.col,
            context,
            backtrace: Vec::new(),
        }
    }

    /// Builds an I/O exception with no source position.
    pub fn io(message: impl Into<String>, path: &str) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: message.into(),
            path: path.to_owned(),
            line: 0,
            col: 0,
            context: None,
            backtrace: Vec::new(),
        }
    }

    /// Process exit code for this exception.
    pub fn exit_code(&self) -> u8 {
        self.kind.exit_code()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(
                f,
                "{}:{}:{}: {}: {}",
                self.path, self.line, self.col, self.kind, self.message
            )?;
        } else {
            write!(f, "{}: {}: {}", self.path, self.kind, self.message)?;
        }
        if let Some((text, col, len)) = &self.context {
            write!(f, "\n  {text}\n  ")?;
            for _ in 1..(*col).max(1) {
                f.write_str(" ")?;
            }
            f.write_str("^")?;
            for _ in 1..(*len).max(1) {
                f.write_str("~")?;
            }
        }
        for frame in &self.backtrace {
            write!(f, "\n  at {} ({}:{}:{})", frame.function, self.path, frame.line, frame.col)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenKind;

    fn token_at(line: u32, col: u32, start: u32, len: u32) -> Token {
        Token {
            kind: TokenKind::Identifier,
            start,
            len,
            line,
            col,
        }
    }

    #[test]
    fn render_points_at_token() {
        let source = "let x = 1;\nlet y = oops;\n";
        let diag = Diagnostic::new(ErrorKind::Parse, "unexpected name", token_at(2, 9, 19, 4));
        let rendered = diag.render("main.ql", source);
        assert_eq!(
            rendered,
            "main.ql:2:9: parse-error: unexpected name\n  let y = oops;\n          ^~~~"
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ErrorKind::Runtime.exit_code(), 65);
        assert_eq!(ErrorKind::Io.exit_code(), 74);
    }
}
