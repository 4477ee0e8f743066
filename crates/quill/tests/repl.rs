//! Interactive session behavior.

use pretty_assertions::assert_eq;
use quill::{CollectStringPrint, Object, ReplSession};

fn eval(session: &mut ReplSession, line: &str) -> (Option<Object>, String) {
    let mut out = CollectStringPrint::new();
    let value = session.eval(line, &mut out).unwrap();
    (value, out.into_output())
}

#[test]
fn definitions_persist_across_lines() {
    let mut session = ReplSession::new();
    let (value, _) = eval(&mut session, "let x = 41;");
    assert_eq!(value, None);
    let (value, _) = eval(&mut session, "x + 1");
    assert_eq!(value, Some(Object::Num(42.0)));
}

#[test]
fn functions_defined_earlier_stay_callable() {
    let mut session = ReplSession::new();
    eval(&mut session, "fun double(n) { return n * 2; }");
    let (value, _) = eval(&mut session, "double(21)");
    assert_eq!(value, Some(Object::Num(42.0)));
}

#[test]
fn print_goes_to_the_writer() {
    let mut session = ReplSession::new();
    let (value, out) = eval(&mut session, "print(\"hi\");");
    assert_eq!(value, None);
    assert_eq!(out, "hi\n");
}

#[test]
fn errors_do_not_poison_the_session() {
    let mut session = ReplSession::new();
    let mut out = CollectStringPrint::new();
    assert!(session.eval("missing_name", &mut out).is_err());
    let (value, _) = eval(&mut session, "1 + 1");
    assert_eq!(value, Some(Object::Num(2.0)));
}

#[test]
fn incomplete_input_detection() {
    assert!(ReplSession::is_incomplete("fun f() {"));
    assert!(ReplSession::is_incomplete("let a = [1, 2,"));
    assert!(ReplSession::is_incomplete("print(\"\"\"multi"));
    assert!(!ReplSession::is_incomplete("let a = 1;"));
    assert!(!ReplSession::is_incomplete("fun f() { return 1; }"));
}

#[test]
fn string_results_echo_their_content() {
    let mut session = ReplSession::new();
    let (value, _) = eval(&mut session, "\"ab\" + \"cd\"");
    assert_eq!(value, Some(Object::Str("abcd".to_owned())));
}
