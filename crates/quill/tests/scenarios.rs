//! End-to-end scenarios exercising the compiler, VM, and collector together.

use pretty_assertions::assert_eq;
use quill::{CollectStringPrint, Runner};

fn run(source: &str) -> String {
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    runner.verify_heap().unwrap();
    out.into_output()
}

fn run_err(source: &str) -> quill::Exception {
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap_err()
}

#[test]
fn fibonacci() {
    let out = run("fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } print(fib(10));");
    assert_eq!(out, "55\n");
}

#[test]
fn closures_capture_by_reference() {
    let out = run(
        "fun make() { let c = 0; fun inc() { c = c + 1; return c; } return inc; } \
         let f = make(); print(f()); print(f()); print(f());",
    );
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn interpolation_with_folding() {
    let source = r#"let x = 2; print("a${x+3}b");"#;
    let out = run(source);
    assert_eq!(out, "a5b\n");

    // The compiled chunk pushes "a" as one constant and concatenates the
    // interpolated segment at runtime; nothing precomputes "a5b".
    let runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let disassembly = runner.disassemble();
    assert!(disassembly.contains("\"a\""), "missing single constant for the head segment");
    assert!(disassembly.contains("STRINGIFY"), "interpolation must stringify at runtime");
    assert!(!disassembly.contains("a5b"), "interpolated result must not be folded");
}

#[test]
fn generational_write_barrier_soundness() {
    // Promote `keep` by surviving several minor collections, then store a
    // fresh young object into it and collect again: the remembered set must
    // keep the stored object alive.
    let source = "\
        let keep = [0];\n\
        let j = 0;\n\
        while (j < 20000) { let t = [j]; j = j + 1; }\n\
        keep[0] = [42];\n\
        let k = 0;\n\
        while (k < 20000) { let t = [k]; k = k + 1; }\n\
        print(keep[0][0]);\n";
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    assert_eq!(out.into_output(), "42\n");

    let stats = runner.heap_stats();
    assert!(stats.minor_collections >= 2, "expected minor collections, got {stats:?}");
    assert!(stats.promoted_objects >= 1, "expected promotions, got {stats:?}");
    runner.verify_heap().unwrap();
}

#[test]
fn type_error_does_not_block_execution() {
    let source = "let n : number = \"hello\"; print(n);";
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    assert_eq!(runner.type_diagnostics().len(), 1);
    let rendered = &runner.render_type_diagnostics()[0];
    assert!(rendered.contains("type-error"), "got: {rendered}");

    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    assert_eq!(out.into_output(), "hello\n");
}

#[test]
fn arity_boundaries() {
    let program = "fun f(a, b = 2, c = 3) { return a + b + c; }";
    assert_eq!(run(&format!("{program} print(f(1));")), "6\n");
    assert_eq!(run(&format!("{program} print(f(1, 10));")), "14\n");
    assert_eq!(run(&format!("{program} print(f(1, 10, 100));")), "111\n");

    let err = run_err(&format!("{program} f();"));
    assert!(err.message.contains("between 1 and 3"), "got: {}", err.message);
    let err = run_err(&format!("{program} f(1, 2, 3, 4);"));
    assert!(err.message.contains("between 1 and 3"), "got: {}", err.message);
}

#[test]
fn defaults_can_reference_earlier_parameters() {
    let out = run("fun f(a, b = a * 2) { return b; } print(f(5)); print(f(5, 1));");
    assert_eq!(out, "10\n1\n");
}

#[test]
fn optional_chain_short_circuits() {
    assert_eq!(run("let a = null; print(a?.b.c);"), "null\n");
    assert_eq!(run(r#"let a = {"b": {"c": 5}}; print(a?.b.c);"#), "5\n");
    // The unguarded form is a runtime error on null.
    let err = run_err("let a = null; print(a.b);");
    assert!(err.message.contains("has no property"), "got: {}", err.message);
}

#[test]
fn optional_call_discards_arguments_and_yields_null() {
    let out = run(
        "let called = 0;\n\
         fun touch() { called = called + 1; return 9; }\n\
         let obj = null;\n\
         print(obj?.method(touch()));\n\
         print(called);\n",
    );
    // The argument expression runs; the call itself does not.
    assert_eq!(out, "null\n1\n");
}

#[test]
fn switch_without_default_falls_through() {
    let out = run(
        "let x = 99;\n\
         switch (x) { case 1: print(\"one\"); case 2: print(\"two\"); }\n\
         print(\"after\");\n",
    );
    assert_eq!(out, "after\n");
}

#[test]
fn switch_matches_and_default() {
    let source = "\
        fun pick(x) {\n\
          switch (x) {\n\
            case 1: return \"one\";\n\
            case 2: return \"two\";\n\
            default: return \"many\";\n\
          }\n\
        }\n\
        print(pick(1)); print(pick(2)); print(pick(3));\n";
    assert_eq!(run(source), "one\ntwo\nmany\n");
}

#[test]
fn runtime_error_has_a_backtrace() {
    let err = run_err("fun inner() { return 1 / 0; }\nfun outer() { return inner(); }\nouter();\n");
    assert_eq!(err.message, "division by zero");
    assert_eq!(err.line, 1);
    let names: Vec<&str> = err.backtrace.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["inner", "outer", "<module>"]);
}

#[test]
fn exit_codes_by_kind() {
    let err = run_err("undefined_name;");
    assert_eq!(err.exit_code(), 65);
    let parse = Runner::new("let = ;".to_owned(), "test.ql").unwrap_err();
    assert_eq!(parse.exit_code(), 65);
}
