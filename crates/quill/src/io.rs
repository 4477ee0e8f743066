//! Output plumbing for the `print` native.

use std::io::{self, Write as _};

/// Trait for handling output from the `print()` native.
///
/// Implement this to capture or redirect program output. Each formatted
/// argument arrives through [`PrintWriter::stdout_write`]; separators and
/// the trailing newline arrive through [`PrintWriter::stdout_push`].
pub trait PrintWriter {
    fn stdout_write(&mut self, output: &str);
    fn stdout_push(&mut self, end: char);
}

/// Default writer: straight to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(output.as_bytes());
    }

    fn stdout_push(&mut self, end: char) {
        let mut stdout = io::stdout().lock();
        let mut buf = [0u8; 4];
        let _ = stdout.write_all(end.encode_utf8(&mut buf).as_bytes());
        if end == '\n' {
            let _ = stdout.flush();
        }
    }
}

/// Collects all output into a string. Used by tests and the REPL.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: &str) {
        self.0.push_str(output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) {}

    fn stdout_push(&mut self, _end: char) {}
}
