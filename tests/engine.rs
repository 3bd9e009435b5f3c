use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::rc::Rc;

use blisp::{CompileError, HostValue, RuntimeError, Script};

fn run_src(src: &str) -> String {
    let mut script = Script::open(src).unwrap();
    script.run().unwrap()
}

fn write_utf16(path: &Path, text: &str) {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    fs::write(path, bytes).unwrap();
}

// ── language semantics ───────────────────────────────────────────────────

#[test]
fn arithmetic_and_float_formatting() {
    assert_eq!(run_src("(+ 2 3)"), "5");
    assert_eq!(run_src("(+ 2 3.0)"), "5");
    assert_eq!(run_src("(/ 1 2.0)"), "0.5");
}

#[test]
fn if_family() {
    assert_eq!(run_src("(if (< 1 2) 10 20)"), "10");
    assert_eq!(run_src("(if (< 2 1) 10 20)"), "20");
    assert_eq!(run_src("(if (< 2 1) 10)"), "0");
}

#[test]
fn define_then_set() {
    assert_eq!(run_src("(define x 5) (set x (+ x 1)) x"), "6");
}

#[test]
fn factorial() {
    assert_eq!(
        run_src("(define f (lambda (n acc) (if (< n 1) acc (f (- n 1) (* acc n))))) (f 5 1)"),
        "120"
    );
}

#[test]
fn self_tail_recursion_stays_within_the_stack_bound() {
    assert_eq!(
        run_src("(define f (lambda (n acc) (if (< n 1) acc (f (- n 1) (+ acc n))))) (f 100000 0)"),
        "5000050000"
    );
}

#[test]
fn list_access_order() {
    assert_eq!(run_src("(car (cdr (list 1 2 3)))"), "2");
    assert_eq!(run_src("(car (list 1 2 3))"), "3");
}

#[test]
fn reruns_execute_from_the_top() {
    let mut script = Script::open("(define n 0) (set n (+ n 1))").unwrap();
    assert_eq!(script.run().unwrap(), "1");
    // the second run re-executes the define before the set
    assert_eq!(script.run().unwrap(), "1");
}

// ── error reporting ──────────────────────────────────────────────────────

#[test]
fn undefined_variable_reports_file_and_line() {
    let err = Script::open_named("(define x 5)\n(+ y 1)", "main.bl").unwrap_err();
    assert_eq!(err.file(), "main.bl");
    assert_eq!(err.line(), 2);
    assert!(matches!(err, CompileError::Parse { .. }));
}

#[test]
fn unterminated_string_is_a_lex_error() {
    let err = Script::open("(define s \"oops\n)").unwrap_err();
    assert!(matches!(err, CompileError::Lex { line: 1, .. }), "{err}");
}

#[test]
fn unmatched_close_paren_is_a_parse_error() {
    let err = Script::open("(+ 1 2))").unwrap_err();
    assert!(matches!(err, CompileError::Parse { .. }));
    assert!(err.to_string().contains("unexpected ')'"));
}

// ── native bridge ────────────────────────────────────────────────────────

#[test]
fn native_functions_are_callable_once_registered() {
    let mut script = Script::open(r#"(define dbl (native "double_it")) (dbl 21)"#).unwrap();
    script
        .register(
            "double_it",
            Box::new(|args| match args {
                [HostValue::Int(i)] => HostValue::Int(i * 2),
                _ => HostValue::Int(-1),
            }),
            "int (*)(int)",
        )
        .unwrap();
    assert_eq!(script.run().unwrap(), "42");
}

#[test]
fn native_arguments_coerce_between_int_and_float() {
    let mut script = Script::open(r#"((native "floor_ish") 2.9)"#).unwrap();
    script
        .register(
            "floor_ish",
            Box::new(|args| match args {
                [HostValue::Int(i)] => HostValue::Int(*i),
                _ => HostValue::Int(-1),
            }),
            "int (*)(int)",
        )
        .unwrap();
    assert_eq!(script.run().unwrap(), "2");
}

#[test]
fn native_arity_messages_are_distinct() {
    let register = |script: &mut Script| {
        script
            .register("pair", Box::new(|_| HostValue::Int(0)), "int (*)(int, int)")
            .unwrap();
    };
    let mut too_few = Script::open(r#"((native "pair") 1)"#).unwrap();
    register(&mut too_few);
    let few = too_few.run().unwrap_err();
    assert!(matches!(few, RuntimeError::TooFewArgs { .. }), "{few}");

    let mut too_many = Script::open(r#"((native "pair") 1 2 3)"#).unwrap();
    register(&mut too_many);
    let many = too_many.run().unwrap_err();
    assert!(matches!(many, RuntimeError::TooManyArgs { .. }), "{many}");
    assert_ne!(few.to_string(), many.to_string());
}

#[test]
fn void_natives_return_zero_and_see_their_arguments() {
    let seen = Rc::new(Cell::new(0i64));
    let inner = seen.clone();
    let mut script = Script::open(r#"((native "poke") 7)"#).unwrap();
    script
        .register(
            "poke",
            Box::new(move |args| {
                if let [HostValue::Int(i)] = args {
                    inner.set(*i);
                }
                HostValue::Void
            }),
            "void (*)(int)",
        )
        .unwrap();
    assert_eq!(script.run().unwrap(), "0");
    assert_eq!(seen.get(), 7);
}

#[test]
fn string_arguments_marshal_through() {
    let mut script = Script::open(r#"((native "len") "hello")"#).unwrap();
    script
        .register(
            "len",
            Box::new(|args| match args {
                [HostValue::Str(s)] => HostValue::Int(s.len() as i64),
                _ => HostValue::Int(-1),
            }),
            "int (*)(char*)",
        )
        .unwrap();
    assert_eq!(script.run().unwrap(), "5");
}

#[test]
fn unregistered_native_fails_at_invocation_not_before() {
    let mut script = Script::open(r#"(define p (native "ping")) (p)"#).unwrap();
    let err = script.run().unwrap_err();
    assert!(matches!(err, RuntimeError::UnboundNative(ref n) if n == "ping"), "{err}");

    // registering after the failed run must work
    script
        .register("ping", Box::new(|_| HostValue::Int(1)), "int (*)(void)")
        .unwrap();
    assert_eq!(script.run().unwrap(), "1");
}

#[test]
fn registering_an_unknown_stub_fails() {
    let mut script = Script::open("(+ 1 2)").unwrap();
    assert!(
        script
            .register("ghost", Box::new(|_| HostValue::Void), "void (*)()")
            .is_err()
    );
}

#[test]
fn argument_type_conflicts_are_runtime_errors() {
    let mut script = Script::open(r#"((native "len") 5)"#).unwrap();
    script
        .register("len", Box::new(|_| HostValue::Int(0)), "int (*)(char*)")
        .unwrap();
    assert!(matches!(script.run().unwrap_err(), RuntimeError::NativeArgType { .. }));
}

// ── serialization ────────────────────────────────────────────────────────

#[test]
fn write_then_load_preserves_behavior() {
    let src = "(define f (lambda (n acc) (if (< n 1) acc (f (- n 1) (* acc n))))) (f 5 1)";
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("factorial.blc");

    let mut original = Script::open(src).unwrap();
    original.write(&path).unwrap();
    let mut loaded = Script::load(&path).unwrap();

    assert_eq!(original.run().unwrap(), loaded.run().unwrap());
}

#[test]
fn loaded_scripts_rebind_natives() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("native.blc");
    Script::open(r#"((native "one") )"#)
        .unwrap()
        .write(&path)
        .unwrap();

    let mut loaded = Script::load(&path).unwrap();
    loaded
        .register("one", Box::new(|_| HostValue::Int(1)), "int (*)()")
        .unwrap();
    assert_eq!(loaded.run().unwrap(), "1");
}

#[test]
fn loading_garbage_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.blc");
    fs::write(&path, b"not a script").unwrap();
    assert!(Script::load(&path).is_err());
}

// ── includes ─────────────────────────────────────────────────────────────

#[test]
fn include_pulls_in_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.bl");
    write_utf16(&lib, "(define add2 (lambda (x) (+ x 2)))");
    let src = format!("#include \"{}\"\n(add2 40)", lib.display());
    assert_eq!(run_src(&src), "42");
}

#[test]
fn includes_nest() {
    let dir = tempfile::tempdir().unwrap();
    let inner = dir.path().join("inner.bl");
    let outer = dir.path().join("outer.bl");
    write_utf16(&inner, "(define base 40)");
    write_utf16(&outer, &format!("#include \"{}\"\n(define add2 (lambda (x) (+ x base)))", inner.display()));
    let src = format!("#include \"{}\"\n(add2 2)", outer.display());
    assert_eq!(run_src(&src), "42");
}

#[test]
fn include_cycles_hit_the_depth_cap() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("cycle.bl");
    write_utf16(&lib, &format!("#include \"{}\"", lib.display()));
    let err = Script::open(&format!("#include \"{}\"", lib.display())).unwrap_err();
    assert!(matches!(err, CompileError::Include { .. }), "{err}");
    assert!(err.to_string().contains("include depth"), "{err}");
}

#[test]
fn include_rejects_non_utf16_files() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.bl");
    fs::write(&lib, "(define x 1)").unwrap();
    let err = Script::open(&format!("#include \"{}\"", lib.display())).unwrap_err();
    assert!(matches!(err, CompileError::Include { .. }), "{err}");
    assert!(err.to_string().contains("UTF-16"));
}

#[test]
fn errors_in_included_files_name_the_include() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("broken.bl");
    write_utf16(&lib, "\n(oops)");
    let err = Script::open_named(&format!("#include \"{}\"", lib.display()), "main.bl").unwrap_err();
    assert!(err.file().ends_with("broken.bl"), "{err}");
    assert_eq!(err.line(), 2);
}

// ── command line ─────────────────────────────────────────────────────────

fn blisp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_blisp"))
}

#[test]
fn cli_runs_a_script() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("prog.bl");
    fs::write(&src, "(+ 2 3)").unwrap();
    let out = blisp().arg("run").arg(&src).output().unwrap();
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "5");
}

#[test]
fn cli_build_then_exec() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("prog.bl");
    let bin = dir.path().join("prog.blc");
    fs::write(&src, "(define f (lambda (n) (* n n))) (f 9)").unwrap();

    let out = blisp().arg("build").arg(&src).arg("-o").arg(&bin).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = blisp().arg("exec").arg(&bin).output().unwrap();
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "81");
}

#[test]
fn cli_reports_compile_errors_on_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("bad.bl");
    fs::write(&src, "(+ nope 1)").unwrap();
    let out = blisp().arg("run").arg(&src).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("undefined variable"));
}

#[test]
fn cli_dump_emits_json() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("prog.bl");
    fs::write(&src, "(+ 2 3)").unwrap();
    let out = blisp().arg("dump").arg(&src).output().unwrap();
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert!(json["code"].is_array());
}
