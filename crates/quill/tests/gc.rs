//! Collector behavior observed through whole programs.

use pretty_assertions::assert_eq;
use quill::{CollectStringPrint, Runner};

fn run_checked(source: &str) -> (String, quill::HeapStats) {
    let mut runner = Runner::new(source.to_owned(), "test.ql").unwrap();
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap();
    runner.verify_heap().unwrap();
    (out.into_output(), runner.heap_stats())
}

#[test]
fn allocation_churn_triggers_minor_collections() {
    let source = "\
        let i = 0;\n\
        while (i < 30000) { let t = [i, i + 1]; i = i + 1; }\n\
        print(i);\n";
    let (out, stats) = run_checked(source);
    assert_eq!(out, "30000\n");
    assert!(stats.minor_collections >= 1, "stats: {stats:?}");
    // The churn is garbage; the live set must stay far below the 30000
    // arrays allocated.
    assert!(stats.live_objects < 10000, "stats: {stats:?}");
}

#[test]
fn long_lived_data_promotes_and_survives() {
    let source = "\
        let keep = [1, 2, 3, 4, 5, 6, 7, 8];\n\
        let j = 0;\n\
        while (j < 30000) { let t = [j]; j = j + 1; }\n\
        print(keep[7]);\n";
    let (out, stats) = run_checked(source);
    assert_eq!(out, "8\n");
    assert!(stats.promoted_objects >= 1, "stats: {stats:?}");
    assert!(stats.old_objects >= 1, "stats: {stats:?}");
}

#[test]
fn environments_are_reclaimed_across_full_collections() {
    // Each call allocates an environment chain; most become garbage once the
    // call returns, so live environment count must stay bounded.
    let source = "\
        fun work(n) { let a = n; { let b = a + 1; } return a; }\n\
        let i = 0;\n\
        while (i < 30000) { work(i); i = i + 1; }\n\
        print(i);\n";
    let (out, stats) = run_checked(source);
    assert_eq!(out, "30000\n");
    assert!(stats.full_collections >= 1, "stats: {stats:?}");
    assert!(stats.live_envs < 40000, "environments leaked: {stats:?}");
}

#[test]
fn captured_environments_survive_collection() {
    let source = "\
        fun make(n) { fun get() { return n; } return get; }\n\
        let fns = [make(1), make(2), make(3)];\n\
        let j = 0;\n\
        while (j < 30000) { let t = [j]; j = j + 1; }\n\
        print(fns[0]() + fns[1]() + fns[2]());\n";
    let (out, _stats) = run_checked(source);
    assert_eq!(out, "6\n");
}

#[test]
fn cyclic_object_graphs_are_collected() {
    // instance ↔ instance cycles are unreachable garbage after each
    // iteration; only the tracing collector can reclaim them.
    let source = "\
        class Node { fun init() { this.next = null; } }\n\
        let i = 0;\n\
        while (i < 8000) {\n\
          let a = Node();\n\
          let b = Node();\n\
          a.next = b;\n\
          b.next = a;\n\
          i = i + 1;\n\
        }\n\
        print(i);\n";
    let (out, stats) = run_checked(source);
    assert_eq!(out, "8000\n");
    assert!(stats.live_objects < 10000, "cycles leaked: {stats:?}");
}
