//! Module loading: imports, exports, re-exports, and cycles.

use std::fs;

use pretty_assertions::assert_eq;
use quill::{CollectStringPrint, Runner};
use tempfile::TempDir;

/// Writes the given modules into a temp dir and runs `main.ql`.
fn run_modules(files: &[(&str, &str)]) -> String {
    let dir = TempDir::new().unwrap();
    for (name, source) in files {
        fs::write(dir.path().join(name), source).unwrap();
    }
    let main_path = dir.path().join("main.ql");
    let source = fs::read_to_string(&main_path).unwrap();
    let mut runner = Runner::new(source, &main_path.to_string_lossy()).unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    runner.verify_heap().unwrap();
    out.into_output()
}

fn run_modules_err(files: &[(&str, &str)]) -> quill::Exception {
    let dir = TempDir::new().unwrap();
    for (name, source) in files {
        fs::write(dir.path().join(name), source).unwrap();
    }
    let main_path = dir.path().join("main.ql");
    let source = fs::read_to_string(&main_path).unwrap();
    let mut runner = Runner::new(source, &main_path.to_string_lossy()).unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap_err()
}

#[test]
fn import_returns_exports() {
    let out = run_modules(&[
        ("m.ql", "export let x = 7;\nexport fun double(n) { return n * 2; }\n"),
        ("main.ql", "import m;\nprint(m.x);\nprint(m.double(21));\n"),
    ]);
    assert_eq!(out, "7\n42\n");
}

#[test]
fn export_table_matches_in_module_view() {
    // The importer observes the same values a local reference inside the
    // module sees after its top level finishes.
    let out = run_modules(&[
        (
            "m.ql",
            "export let xs = [1, 2];\nfun touch() { xs[0] = 9; }\ntouch();\nexport let seen = xs[0];\n",
        ),
        ("main.ql", "import m;\nprint(m.xs[0]);\nprint(m.seen);\n"),
    ]);
    assert_eq!(out, "9\n9\n");
}

#[test]
fn import_with_alias_and_string_spec() {
    let out = run_modules(&[
        ("geometry.ql", "export fun area(w, h) { return w * h; }\n"),
        ("main.ql", "import \"geometry.ql\" as geo;\nprint(geo.area(3, 4));\n"),
    ]);
    assert_eq!(out, "12\n");
}

#[test]
fn from_import_binds_names_and_aliases() {
    let out = run_modules(&[
        ("m.ql", "export let a = 1;\nexport let b = 2;\n"),
        ("main.ql", "from m import a, b as bee;\nprint(a + bee);\n"),
    ]);
    assert_eq!(out, "3\n");
}

#[test]
fn export_default_and_value_forms() {
    let out = run_modules(&[
        (
            "m.ql",
            "export default 42;\nlet hidden = 7;\nexport { hidden as visible };\n",
        ),
        ("main.ql", "import m;\nprint(m.default);\nprint(m.visible);\n"),
    ]);
    assert_eq!(out, "42\n7\n");
}

#[test]
fn re_export_star_and_named() {
    let out = run_modules(&[
        ("base.ql", "export let one = 1;\nexport let two = 2;\n"),
        ("wide.ql", "export * from \"base.ql\";\n"),
        ("narrow.ql", "export { one as uno } from \"base.ql\";\n"),
        (
            "main.ql",
            "import wide;\nimport narrow;\nprint(wide.one + wide.two);\nprint(narrow.uno);\n",
        ),
    ]);
    assert_eq!(out, "3\n1\n");
}

#[test]
fn modules_load_once_and_share_state() {
    let out = run_modules(&[
        ("counter.ql", "export let hits = [0];\nhits[0] = hits[0] + 1;\n"),
        (
            "main.ql",
            "import counter;\nimport counter as again;\nprint(counter.hits[0]);\nprint(again.hits[0]);\n",
        ),
    ]);
    // The module body runs once; both bindings see the same table.
    assert_eq!(out, "1\n1\n");
}

#[test]
fn cyclic_imports_see_the_partial_export_table() {
    let out = run_modules(&[
        (
            "a.ql",
            "export let early = 1;\nimport b;\nexport let late = 2;\nexport let fromB = b.sawLate;\n",
        ),
        (
            "b.ql",
            "import a;\nexport let sawEarly = a.early;\nexport let sawLate = a.late;\n",
        ),
        (
            "main.ql",
            "import a;\nimport b;\nprint(b.sawEarly);\nprint(b.sawLate);\nprint(a.late);\n",
        ),
    ]);
    // b loads while a is mid-execution: `early` is bound, `late` is not yet.
    assert_eq!(out, "1\nnull\n2\n");
}

#[test]
fn missing_module_is_an_error_at_the_import_site() {
    let err = run_modules_err(&[("main.ql", "import nowhere;\n")]);
    assert!(err.message.contains("not found"), "got: {}", err.message);
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn missing_export_is_an_error() {
    let err = run_modules_err(&[
        ("m.ql", "export let x = 1;\n"),
        ("main.ql", "import m;\nprint(m.nope);\n"),
    ]);
    assert!(err.message.contains("has no export"), "got: {}", err.message);
}

#[test]
fn module_parse_errors_surface_with_module_position() {
    let err = run_modules_err(&[
        ("bad.ql", "let = 1;\n"),
        ("main.ql", "import bad;\n"),
    ]);
    assert!(err.path.ends_with("bad.ql"), "got path: {}", err.path);
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn module_runtime_errors_propagate() {
    let err = run_modules_err(&[
        ("boom.ql", "let x = 1 / 0;\n"),
        ("main.ql", "import boom;\n"),
    ]);
    assert_eq!(err.message, "division by zero");
    assert!(err.path.ends_with("boom.ql"));
}
