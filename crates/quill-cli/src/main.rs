//! The `quill` command-line driver.
//!
//! Modes: run a script (optionally dumping bytecode), an interactive REPL,
//! or typecheck-only. Exit codes follow the engine contract: 0 on success,
//! 65 for compile/type/runtime errors, 74 for I/O errors.

use std::{env, path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use quill::{ReplSession, Runner, StdPrint};
use rustyline::{DefaultEditor, error::ReadlineError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quill", version, about = "The Quill scripting language")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Script to run (shorthand for `quill run <file>`).
    file: Option<PathBuf>,

    /// Arguments passed through to the script.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script file.
    Run {
        /// Dump compiled bytecode before running.
        #[arg(long)]
        bytecode: bool,
        file: PathBuf,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Start an interactive session.
    Repl,
    /// Parse and typecheck a file without running it.
    Typecheck { file: PathBuf },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Run { bytecode, file, args }) => run_file(&file, bytecode, args),
        Some(Command::Repl) => repl(),
        Some(Command::Typecheck { file }) => typecheck(&file),
        None => match cli.file {
            Some(file) => run_file(&file, false, cli.args),
            None => repl(),
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QUILL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Directories searched for modules after importer-relative resolution:
/// `QUILL_PACKAGES` entries, then the per-user package cache.
fn package_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(packages) = env::var("QUILL_PACKAGES") {
        paths.extend(env::split_paths(&packages));
    }
    if let Some(home) = home::home_dir() {
        paths.push(home.join(".quill").join("packages"));
    }
    paths
}

fn make_runner(file: &PathBuf) -> Result<Runner, ExitCode> {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{}: io-error: {err}", file.display());
            return Err(ExitCode::from(74));
        }
    };
    match Runner::new(source, &file.to_string_lossy()) {
        Ok(mut runner) => {
            for path in package_paths() {
                runner.add_search_path(path);
            }
            Ok(runner)
        }
        Err(exception) => {
            eprintln!("{exception}");
            Err(ExitCode::from(exception.exit_code()))
        }
    }
}

fn run_file(file: &PathBuf, dump_bytecode: bool, args: Vec<String>) -> ExitCode {
    // Script arguments are accepted for forward compatibility; the engine
    // does not expose them yet.
    let _script_args = args;
    let mut runner = match make_runner(file) {
        Ok(runner) => runner,
        Err(code) => return code,
    };
    if dump_bytecode {
        print!("{}", runner.disassemble());
    }
    match runner.run_to_stdout() {
        Ok(_) => ExitCode::SUCCESS,
        Err(exception) => {
            eprintln!("{exception}");
            ExitCode::from(exception.exit_code())
        }
    }
}

fn typecheck(file: &PathBuf) -> ExitCode {
    let runner = match make_runner(file) {
        Ok(runner) => runner,
        Err(code) => return code,
    };
    let rendered = runner.render_type_diagnostics();
    for diagnostic in &rendered {
        eprintln!("{diagnostic}");
    }
    if rendered.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(65)
    }
}

fn history_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("QUILL_HISTORY") {
        return Some(PathBuf::from(path));
    }
    home::home_dir().map(|home| home.join(".quill_history"))
}

fn repl() -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("repl: {err}");
            return ExitCode::from(74);
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    let mut session = ReplSession::new();
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("repl: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.trim() == ":heap" {
            let stats = session.heap_stats();
            println!("{stats:#?}");
            continue;
        }

        // Gather continuation lines while delimiters stay open.
        let mut source = line;
        while ReplSession::is_incomplete(&source) {
            match editor.readline("… ") {
                Ok(more) => {
                    source.push('\n');
                    source.push_str(&more);
                }
                Err(_) => break,
            }
        }
        let _ = editor.add_history_entry(&source);

        let mut writer = StdPrint;
        match session.eval(&source, &mut writer) {
            Ok(Some(value)) => println!("{value}"),
            Ok(None) => {}
            Err(exception) => eprintln!("{exception}"),
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    ExitCode::SUCCESS
}
