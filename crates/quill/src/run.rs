//! Public interface for compiling and running Quill code.

use std::{fmt, path::PathBuf, rc::Rc};

use crate::{
    compiler::compile,
    error::{Diagnostic, Exception},
    heap::HeapStats,
    io::{PrintWriter, StdPrint},
    module::{ModuleState, Program},
    value::Value,
    vm::{Session, Vm},
};

/// A runtime value surfaced to the embedding host.
///
/// Heap-backed values are rendered to text at the boundary; the collector
/// owns everything behind it.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    /// Display form of any other runtime value (array, map, instance, …).
    Other(String),
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Num(n) => f.write_str(&crate::value::format_num(*n)),
            Self::Str(s) | Self::Other(s) => f.write_str(s),
        }
    }
}

/// Primary interface for running Quill code.
///
/// Compiles once at construction; `run()` can then execute against any
/// writer. The session (heap, interner, loaded modules) persists across
/// runs, so a second `run()` reuses loaded modules.
///
/// # Example
/// ```
/// use quill::{CollectStringPrint, Runner};
///
/// let mut runner = Runner::new("print(1 + 2);".to_owned(), "example.ql").unwrap();
/// let mut out = CollectStringPrint::new();
/// runner.run(&mut out).unwrap();
/// assert_eq!(out.output(), "3\n");
/// ```
#[derive(Debug)]
pub struct Runner {
    session: Session,
    program: Rc<Program>,
    type_diagnostics: Vec<Diagnostic>,
}

impl Runner {
    /// Parses and compiles `source`, returning the ready-to-run engine.
    ///
    /// # Errors
    /// Returns the first lex or parse diagnostic as an [`Exception`]. Type
    /// errors do not fail construction; see [`Runner::type_diagnostics`].
    pub fn new(source: String, path: &str) -> Result<Self, Exception> {
        let mut session = Session::new();
        let program = Rc::new(Program::new(source, path.to_owned()));
        program.state.set(ModuleState::Loading);

        // Register the main program so imports that cycle back to it see the
        // partial export table, and so its exports are GC roots.
        let canonical = std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_owned());
        session.modules.insert(canonical, Rc::clone(&program));

        compile(
            &program,
            &mut session.interns,
            &mut session.funcs,
            &mut session.checker,
            false,
        )
        .map_err(|diagnostics| {
            let first = diagnostics.first().expect("failed compile has diagnostics");
            Exception::from_diagnostic(first, &program.path, &program.source)
        })?;
        let type_diagnostics = session.checker.take_diagnostics();

        Ok(Self {
            session,
            program,
            type_diagnostics,
        })
    }

    /// Adds a directory to the module search path (after importer-relative
    /// resolution).
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.session.modules.add_search_path(path);
    }

    /// Type diagnostics collected during compilation. Never fatal for
    /// execution; the `typecheck` driver maps them to its exit code.
    pub fn type_diagnostics(&self) -> &[Diagnostic] {
        &self.type_diagnostics
    }

    /// Renders each type diagnostic with source context.
    pub fn render_type_diagnostics(&self) -> Vec<String> {
        self.type_diagnostics
            .iter()
            .map(|d| d.render(&self.program.path, &self.program.source))
            .collect()
    }

    /// Executes the program, sending output to `writer`.
    pub fn run(&mut self, writer: &mut impl PrintWriter) -> Result<Object, Exception> {
        let top_level = self.program.top_level.get().expect("program compiled at construction");
        let mut vm = Vm::new(&mut self.session, writer);
        let value = vm.run_top_level(top_level)?;
        self.program.state.set(ModuleState::Loaded);
        Ok(self.to_object(value))
    }

    /// Executes the program, printing to stdout.
    pub fn run_to_stdout(&mut self) -> Result<Object, Exception> {
        let mut writer = StdPrint;
        self.run(&mut writer)
    }

    /// Current heap statistics, for tests and diagnostics.
    pub fn heap_stats(&self) -> HeapStats {
        self.session.heap.stats()
    }

    /// Checks the collector's structural invariants. Test hook.
    pub fn verify_heap(&self) -> Result<(), String> {
        self.session.heap.verify_invariants()
    }

    /// Disassembles every compiled function for `run --bytecode`.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (id, func) in self.session.funcs.iter() {
            let name = self.session.interns.get(func.name);
            out.push_str(&format!("== fn {} {name} ==\n", id.index()));
            out.push_str(&func.chunk.disassemble(&self.session.interns));
            out.push('\n');
        }
        out
    }

    fn to_object(&self, value: Value) -> Object {
        match value {
            Value::Null => Object::Null,
            Value::Bool(b) => Object::Bool(b),
            Value::Num(n) => Object::Num(n),
            other => {
                let heap = &self.session.heap;
                let interns = &self.session.interns;
                match heap.str_content(interns, other) {
                    Some(text) => Object::Str(text.to_owned()),
                    None => Object::Other(crate::value::display_value(heap, interns, other)),
                }
            }
        }
    }
}
