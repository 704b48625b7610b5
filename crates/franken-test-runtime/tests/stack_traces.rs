use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;

use franken_test_runtime::fs::identity_path_from_host;
use franken_test_runtime::{
    ConfigOverrides, DiskModuleFs, ExecutionContext, FailureReport, JsValue, MemoryModuleFs,
    PathStyle, Runtime, RuntimeConfig, RuntimeError,
};

fn fixture_context() -> ExecutionContext {
    let root = identity_path_from_host(
        &PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/test_root"),
    );
    let config = RuntimeConfig::new(root)
        .with_automock(false)
        .with_stack_path_style(PathStyle::Posix);
    Runtime::new(config, Arc::new(DiskModuleFs))
        .expect("runtime")
        .create_context("root.js", &ConfigOverrides::default())
        .expect("context")
}

fn memory_context(files: &[(&str, &str)], style: PathStyle) -> ExecutionContext {
    let mut fs = MemoryModuleFs::new();
    for (path, source) in files {
        fs.insert(path, *source);
    }
    let config = RuntimeConfig::new("/proj")
        .with_automock(false)
        .with_stack_path_style(style);
    Runtime::new(config, Arc::new(fs))
        .expect("runtime")
        .create_context("/proj/main.test.js", &ConfigOverrides::default())
        .expect("context")
}

#[test]
fn top_level_throw_is_attributed_to_the_module() {
    let mut ctx = fixture_context();
    let root = ctx.test_path().to_string();
    let err = ctx
        .require_module(&root, "./throwing")
        .expect_err("throwing.js throws");
    let stack = err.stack().expect("stack");
    let pattern = Regex::new(r"^Error: throwing\s+at Object.<anonymous>").expect("regex");
    assert!(pattern.is_match(stack), "{stack}");
    assert!(stack.contains("test_root/throwing.js:1:7"), "{stack}");
}

#[test]
fn thrown_function_frames_use_authored_positions() {
    let mut ctx = fixture_context();
    let root = ctx.test_path().to_string();
    let sum = ctx.require_module(&root, "./throwing-fn").expect("require");
    let err = ctx.call(&sum, Vec::new()).expect_err("sum throws");
    let stack = err.stack().expect("stack");
    let pattern =
        Regex::new(r"Error: throwing fn\s+at sum.+test_root/throwing-fn\.js:12:9").expect("regex");
    assert!(pattern.is_match(stack), "{stack}");
}

#[test]
fn loader_frames_are_elided_between_modules() {
    let mut ctx = fixture_context();
    let root = ctx.test_path().to_string();
    let nested = ctx
        .require_module(&root, "./nested/requires-throwing")
        .expect("require");
    let err = ctx
        .call_method(&nested, "run", Vec::new())
        .expect_err("run throws");
    let RuntimeError::Uncaught(exception) = &err else {
        panic!("expected uncaught exception, got {err:?}");
    };
    let names: Vec<&str> = exception
        .frames
        .iter()
        .map(|frame| frame.function_name.as_str())
        .collect();
    assert_eq!(names, vec!["sum", "Object.run"]);
    assert!(!exception.stack.contains("<loader>"), "{}", exception.stack);
    assert!(!exception.stack.contains("Runtime."), "{}", exception.stack);
    assert!(
        exception.frames[1].to_string().ends_with("requires-throwing.js:4:10)"),
        "{}",
        exception.frames[1]
    );
}

#[test]
fn windows_style_renders_backslashes() {
    let mut ctx = memory_context(
        &[(
            "/proj/lib/throwing-fn.js",
            "module.exports = function sum() {\n  throw new Error('throwing fn')\n}",
        )],
        PathStyle::Windows,
    );
    let sum = ctx
        .require_module("/proj/main.test.js", "./lib/throwing-fn")
        .expect("require");
    let err = ctx.call(&sum, Vec::new()).expect_err("throws");
    assert_eq!(
        err.stack(),
        Some("Error: throwing fn\n    at sum (\\proj\\lib\\throwing-fn.js:2:9)")
    );
}

#[test]
fn first_line_columns_skip_the_wrapper() {
    let mut ctx = memory_context(
        &[("/proj/one.js", "const x = 1; throw new RangeError('too far')")],
        PathStyle::Posix,
    );
    let err = ctx
        .require_module("/proj/main.test.js", "./one")
        .expect_err("throws");
    assert_eq!(
        err.stack(),
        Some("RangeError: too far\n    at Object.<anonymous> (/proj/one.js:1:20)")
    );
}

#[test]
fn thrown_primitives_get_a_synthetic_frame() {
    let mut ctx = memory_context(&[("/proj/prim.js", "\n\nthrow 'plain'")], PathStyle::Posix);
    let err = ctx
        .require_module("/proj/main.test.js", "./prim")
        .expect_err("throws");
    let RuntimeError::ModuleExecution(failure) = &err else {
        panic!("expected module execution error");
    };
    assert_eq!(failure.message, "plain");
    assert!(
        failure.stack.ends_with("at Object.<anonymous> (/proj/prim.js:3:1)"),
        "{}",
        failure.stack
    );
}

#[test]
fn caught_errors_keep_their_stack_property() {
    let mut ctx = memory_context(
        &[(
            "/proj/catchless.js",
            "function make() {\n  return new Error('kept')\n}\nexports.err = make()",
        )],
        PathStyle::Posix,
    );
    let exports = ctx
        .require_module("/proj/main.test.js", "./catchless")
        .expect("require");
    let error = ctx.get_property(&exports, "err").expect("err");
    let stack = ctx.get_property(&error, "stack").expect("stack");
    assert_eq!(
        stack,
        JsValue::str(
            "Error: kept\n    at make (/proj/catchless.js:2:10)\n    at Object.<anonymous> (/proj/catchless.js:4:15)"
        )
    );
}

#[test]
fn failure_reports_carry_the_normalized_stack() {
    let mut ctx = fixture_context();
    let root = ctx.test_path().to_string();
    let err = ctx.require_module(&root, "./throwing").expect_err("throws");
    let report = FailureReport::from_error("throwing.js", &err);
    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["title"], "throwing.js");
    let message = json["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("Error: throwing\n    at Object.<anonymous>"), "{json}");
}
