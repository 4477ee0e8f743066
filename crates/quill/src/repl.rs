//! Interactive session support.
//!
//! A `ReplSession` keeps one VM session alive across lines: definitions land
//! in a persistent environment whose parent is the globals environment, and
//! the heap, interner, and loaded modules carry over. Each line compiles as
//! its own small program (so diagnostics can always resolve their source)
//! with the compiler's REPL mode on: a trailing expression becomes the
//! line's value instead of being popped.

use std::rc::Rc;

use crate::{
    compiler::compile,
    env::EnvId,
    error::Exception,
    heap::HeapStats,
    io::PrintWriter,
    lexer::lex,
    module::{ModuleState, Program},
    run::Object,
    token::{Token, TokenKind},
    value::Value,
    vm::{Session, Vm},
};

/// A persistent read-eval-print session.
pub struct ReplSession {
    session: Session,
    /// The environment shared by every line.
    env: EnvId,
    line_count: usize,
}

impl ReplSession {
    pub fn new() -> Self {
        let mut session = Session::new();
        let globals = session.globals;
        let env = session.heap.alloc_env(Some(globals));
        Self {
            session,
            env,
            line_count: 0,
        }
    }

    /// True when `source` is an unfinished fragment (unbalanced delimiters
    /// or an open triple-quoted string) and the driver should ask for a
    /// continuation line.
    pub fn is_incomplete(source: &str) -> bool {
        let (tokens, diagnostics) = lex(source);
        if diagnostics
            .iter()
            .any(|d| d.message == "unterminated string" && token_text(source, d.token).starts_with("\"\"\""))
        {
            return true;
        }
        let mut depth = 0i64;
        for token in &tokens {
            match token.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace | TokenKind::InterpStart => {
                    depth += 1;
                }
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace | TokenKind::InterpEnd => {
                    depth -= 1;
                }
                _ => {}
            }
        }
        depth > 0
    }

    /// Compiles and runs one line. Returns the line's value when it is a
    /// trailing expression (and not null), for echoing.
    pub fn eval(&mut self, source: &str, writer: &mut impl PrintWriter) -> Result<Option<Object>, Exception> {
        self.line_count += 1;
        let program = Rc::new(Program::new(source.to_owned(), format!("<repl:{}>", self.line_count)));
        program.state.set(ModuleState::Loading);

        let top_level = compile(
            &program,
            &mut self.session.interns,
            &mut self.session.funcs,
            &mut self.session.checker,
            true,
        )
        .map_err(|diagnostics| {
            let first = diagnostics.first().expect("failed compile has diagnostics");
            Exception::from_diagnostic(first, &program.path, &program.source)
        })?;
        // The REPL surfaces type problems as advisory output, never as
        // failures; drain them so they don't accumulate.
        let _ = self.session.checker.take_diagnostics();

        let env = self.env;
        let mut vm = Vm::new(&mut self.session, writer);
        let value = vm.run_function(top_level, env, Token::synthetic())?;
        // The line's functions each hold the program, so its source stays
        // resolvable for later diagnostics without extra bookkeeping.
        program.state.set(ModuleState::Loaded);

        Ok(match value {
            Value::Null => None,
            other => Some(self.to_object(other)),
        })
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.session.heap.stats()
    }

    fn to_object(&self, value: Value) -> Object {
        let heap = &self.session.heap;
        let interns = &self.session.interns;
        match value {
            Value::Null => Object::Null,
            Value::Bool(b) => Object::Bool(b),
            Value::Num(n) => Object::Num(n),
            other => match heap.str_content(interns, other) {
                Some(text) => Object::Str(text.to_owned()),
                None => Object::Other(crate::value::display_value(heap, interns, other)),
            },
        }
    }
}

impl Default for ReplSession {
    fn default() -> Self {
        Self::new()
    }
}

fn token_text(source: &str, token: Token) -> &str {
    let start = token.start as usize;
    source.get(start..start + token.len as usize).unwrap_or("")
}
