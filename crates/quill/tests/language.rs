//! Language-level coverage: declarations, control flow, classes, enums,
//! containers, and error behavior.

use pretty_assertions::assert_eq;
use quill::{CollectStringPrint, Runner};

fn run(source: &str) -> String {
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    runner.verify_heap().unwrap();
    out.into_output()
}

fn run_err_message(source: &str) -> String {
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap_err().message
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run("print(1 + 2 * 3 - 4 / 2);"), "5\n");
    assert_eq!(run("print((1 + 2) * 3);"), "9\n");
    assert_eq!(run("print(10 % 3);"), "1\n");
    assert_eq!(run("print(-3 + 1);"), "-2\n");
}

#[test]
fn comparison_and_logic() {
    assert_eq!(run("print(1 < 2 and 2 <= 2);"), "true\n");
    assert_eq!(run("print(1 > 2 or 2 >= 3 or 1 == 1);"), "true\n");
    assert_eq!(run("print(!(1 != 1));"), "true\n");
    // `and`/`or` yield an operand, not a coerced bool.
    assert_eq!(run("print(null or \"fallback\");"), "fallback\n");
    assert_eq!(run("print(false and explode());"), "false\n");
}

#[test]
fn string_operations() {
    assert_eq!(run(r#"print("foo" + "bar");"#), "foobar\n");
    assert_eq!(run(r#"print("quill"[1]);"#), "u\n");
    assert_eq!(run(r#"print(len("héllo"));"#), "5\n");
    assert_eq!(run("print(\"\"\"two\nlines\"\"\");"), "two\nlines\n");
    assert_eq!(run(r#"print("tab\there");"#), "tab\there\n");
}

#[test]
fn string_equality_is_by_content() {
    // One side interned at compile time, the other built at runtime.
    assert_eq!(run(r#"let s = "ab" + str(1); print(s == "ab1");"#), "true\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let out = run(
        "let i = 0;\n\
         while (true) {\n\
           i = i + 1;\n\
           if (i == 2) continue;\n\
           if (i > 4) break;\n\
           print(i);\n\
         }\n",
    );
    assert_eq!(out, "1\n3\n4\n");
}

#[test]
fn for_loop_desugars_with_increment_after_body() {
    assert_eq!(run("for (let i = 0; i < 3; i = i + 1) { print(i); }"), "0\n1\n2\n");
    // `continue` still runs the increment.
    let out = run("for (let i = 0; i < 5; i = i + 1) { if (i % 2 == 0) continue; print(i); }");
    assert_eq!(out, "1\n3\n");
}

#[test]
fn foreach_over_arrays_and_maps() {
    assert_eq!(run("foreach (x in [10, 20, 30]) { print(x); }"), "10\n20\n30\n");
    let out = run("foreach (i, x in [\"a\", \"b\"]) { print(i, x); }");
    assert_eq!(out, "0 a\n1 b\n");
    let out = run(r#"foreach (k in {"x": 1, "y": 2}) { print(k); }"#);
    assert_eq!(out, "x\ny\n");
    let out = run(r#"foreach (k, v in {"x": 1, "y": 2}) { print(k, v); }"#);
    assert_eq!(out, "x 1\ny 2\n");
}

#[test]
fn arrays_grow_and_index() {
    let out = run(
        "let a = [1, 2];\n\
         a[0] = 9;\n\
         print(a[0] + a[1]);\n\
         print(len(a));\n",
    );
    assert_eq!(out, "11\n2\n");
    assert!(run_err_message("let a = [1]; a[3];").contains("out of range"));
    assert!(run_err_message("let a = [1]; a[0.5];").contains("integer"));
}

#[test]
fn maps_store_and_read() {
    let out = run(
        r#"let m = {"a": 1};
m["b"] = 2;
m.c = 3;
print(m["a"], m.b, m["c"]);
print(m["missing"]);
print(len(m));"#,
    );
    assert_eq!(out, "1 2 3\nnull\n3\n");
}

#[test]
fn scopes_shadow_and_restore() {
    let out = run(
        "let x = 1;\n\
         { let x = 2; print(x); }\n\
         print(x);\n",
    );
    assert_eq!(out, "2\n1\n");
}

#[test]
fn const_bindings_are_write_once() {
    assert!(run_err_message("const k = 1; k = 2;").contains("constant"));
    assert!(run_err_message("const k = 1; const k = 2;").contains("constant"));
    assert!(run_err_message("x = 1;").contains("undefined variable"));
}

#[test]
fn classes_with_init_fields_and_methods() {
    let out = run(
        "class Counter {\n\
           fun init(start) { this.value = start; }\n\
           fun bump() { this.value = this.value + 1; return this.value; }\n\
           fun get() { return this.value; }\n\
         }\n\
         let c = Counter(10);\n\
         print(c.bump());\n\
         print(c.bump());\n\
         print(c.get());\n",
    );
    assert_eq!(out, "11\n12\n12\n");
}

#[test]
fn bound_methods_retain_their_receiver() {
    let out = run(
        "class Greeter {\n\
           fun init(name) { this.name = name; }\n\
           fun greet() { return \"hi \" + this.name; }\n\
         }\n\
         let g = Greeter(\"ada\");\n\
         let f = g.greet;\n\
         print(f());\n",
    );
    assert_eq!(out, "hi ada\n");
}

#[test]
fn fields_shadow_methods_on_invoke() {
    let out = run(
        "class Box {\n\
           fun init() { this.get = null; }\n\
           fun get() { return 1; }\n\
         }\n\
         let b = Box();\n\
         print(b?.get());\n",
    );
    // The field (null) shadows the method; the optional call yields null.
    assert_eq!(out, "null\n");
}

#[test]
fn inline_caches_do_not_change_semantics() {
    // The same call site dispatches against two different classes; the
    // cache must re-key on class identity.
    let out = run(
        "class A { fun tag() { return \"a\"; } }\n\
         class B { fun tag() { return \"b\"; } }\n\
         fun describe(x) { return x.tag(); }\n\
         let items = [A(), B(), A(), B()];\n\
         foreach (x in items) { print(describe(x)); }\n",
    );
    assert_eq!(out, "a\nb\na\nb\n");
}

#[test]
fn interfaces_check_structurally() {
    let source = "\
        interface Shape { area(): number; }\n\
        class Circle implements Shape {\n\
          fun init(r) { this.r = r; }\n\
          fun area() { return 3 * this.r * this.r; }\n\
        }\n\
        print(Circle(2).area());\n";
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    assert!(runner.type_diagnostics().is_empty());
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    assert_eq!(out.into_output(), "12\n");

    // A class missing the contract gets a diagnostic but still runs.
    let source = "interface Shape { area(): number; }\nclass Point implements Shape { }\nprint(1);";
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    assert_eq!(runner.type_diagnostics().len(), 1);
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    assert_eq!(out.into_output(), "1\n");
}

#[test]
fn enums_construct_and_match() {
    let out = run(
        "enum Color { Red, Green(level), Blue(a, b) }\n\
         let c = Color.Green(3);\n\
         print(c);\n\
         match (c) {\n\
           case Color.Red: print(\"red\");\n\
           case Color.Green(3): print(\"green3\");\n\
           default: print(\"other\");\n\
         }\n\
         match (Color.Red) {\n\
           case Color.Red: print(\"red\");\n\
           default: print(\"other\");\n\
         }\n",
    );
    assert_eq!(out, "Color.Green(3)\ngreen3\nred\n");
}

#[test]
fn enum_values_compare_structurally() {
    let out = run(
        "enum E { V(x) }\n\
         print(E.V(1) == E.V(1));\n\
         print(E.V(1) == E.V(2));\n",
    );
    assert_eq!(out, "true\nfalse\n");
}

#[test]
fn enum_constructor_arity_is_enforced() {
    assert!(run_err_message("enum E { V(x) } E.V();").contains("exactly 1"));
}

#[test]
fn nested_closures_share_one_environment() {
    let out = run(
        "fun pair() {\n\
           let n = 0;\n\
           fun up() { n = n + 1; return n; }\n\
           fun down() { n = n - 1; return n; }\n\
           return [up, down];\n\
         }\n\
         let fns = pair();\n\
         print(fns[0]());\n\
         print(fns[0]());\n\
         print(fns[1]());\n",
    );
    assert_eq!(out, "1\n2\n1\n");
}

#[test]
fn recursion_limit_is_a_runtime_error() {
    assert!(run_err_message("fun loop() { return loop(); } loop();").contains("overflow"));
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    assert_eq!(run_err_message("1 / 0;"), "division by zero");
    assert_eq!(run_err_message("let a = 5; a % 0;"), "division by zero");
}

#[test]
fn non_callable_call_is_a_runtime_error() {
    assert!(run_err_message("let x = 5; x();").contains("can only call"));
}

#[test]
fn repl_style_reuse_runs_twice() {
    let mut runner = Runner::new("print(1 + 1);".to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    runner.run(&mut out).unwrap();
    assert_eq!(out.into_output(), "2\n2\n");
}
