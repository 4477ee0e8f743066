//! Quill: a bytecode-compiled scripting language with a generational
//! garbage collector.
//!
//! The engine is three tightly-coupled pieces:
//!
//! 1. a **single-pass compiler** — lexing, Pratt parsing, and bytecode
//!    emission fused into one linear pass, with constant folding over each
//!    finished chunk and an opt-in structural typechecker running in
//!    lockstep;
//! 2. a **stack VM** — inline caches for property and method dispatch,
//!    heap-allocated lexical environments, closures, classes, arrays, maps,
//!    enums, and modules with import/export semantics;
//! 3. a **generational collector** — young/old spaces, minor collections
//!    driven by a remembered set and write barrier, and incremental full
//!    sweeps under a batch budget, all running only at compiled-in safe
//!    points.
//!
//! The embedding surface is [`Runner`] (compile once, run against any
//! [`PrintWriter`]) and [`ReplSession`] (persistent interactive state).

mod bytecode;
mod compiler;
mod env;
mod error;
mod function;
mod heap;
mod intern;
mod io;
mod lexer;
mod module;
mod native;
mod object;
mod repl;
mod run;
mod token;
mod typecheck;
mod value;
mod vm;

pub use crate::{
    error::{Diagnostic, ErrorKind, Exception, TraceFrame},
    heap::{GC_PROMOTION_AGE, GC_SWEEP_BATCH, HeapStats},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    native::{LibraryHandle, NATIVE_API_VERSION, NativeCapabilities, NativeCtx, NativeFn, NativeRegistry},
    repl::ReplSession,
    run::{Object, Runner},
};
