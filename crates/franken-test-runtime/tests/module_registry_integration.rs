use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use franken_test_runtime::fs::identity_path_from_host;
use franken_test_runtime::value::Heap;
use franken_test_runtime::{
    ConfigOverrides, JsValue, LoaderEvent, MemoryModuleFs, MockFactory,
    ModuleIdentity, OverridePolicy, PathStyle, Runtime, RuntimeConfig, RuntimeError,
};

fn write(dir: &Path, relative: &str, source: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create dirs");
    }
    fs::write(path, source).expect("write module");
}

fn disk_runtime(dir: &Path, automock: bool) -> Runtime {
    let config = RuntimeConfig::new(identity_path_from_host(dir))
        .with_automock(automock)
        .with_stack_path_style(PathStyle::Posix);
    Runtime::on_disk(config).expect("runtime")
}

#[test]
fn disk_modules_resolve_with_extensions_and_index_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "src/util/index.js", "exports.kind = 'index'");
    write(dir.path(), "src/util/format.js", "exports.kind = 'format'");
    write(dir.path(), "src/data.json", r#"{"answer": 42}"#);
    write(dir.path(), "app.test.js", "exports.ok = true");

    let runtime = disk_runtime(dir.path(), false);
    let mut ctx = runtime
        .create_context("app.test.js", &ConfigOverrides::default())
        .expect("context");
    let test_path = ctx.test_path().to_string();

    let index = ctx.require_module(&test_path, "./src/util").expect("index");
    assert_eq!(ctx.get_property(&index, "kind").expect("kind"), JsValue::str("index"));
    let format = ctx
        .require_module(&test_path, "./src/util/format")
        .expect("format");
    assert_eq!(ctx.get_property(&format, "kind").expect("kind"), JsValue::str("format"));
    let data = ctx.require_module(&test_path, "./src/data").expect("json");
    assert_eq!(ctx.to_json(&data), serde_json::json!({"answer": 42}));
}

#[test]
fn identity_is_shared_across_specifier_spellings() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "lib/shared.js", "exports.created = {}");
    write(dir.path(), "lib/a.js", "exports.shared = require('./shared')");
    write(dir.path(), "b/c.js", "exports.shared = require('../lib/shared.js')");
    write(dir.path(), "app.test.js", "");

    let runtime = disk_runtime(dir.path(), false);
    let mut ctx = runtime
        .create_context("app.test.js", &ConfigOverrides::default())
        .expect("context");
    let test_path = ctx.test_path().to_string();
    let a = ctx.require_module(&test_path, "./lib/a").expect("a");
    let c = ctx.require_module(&test_path, "./b/c").expect("c");
    let from_a = ctx.get_property(&a, "shared").expect("shared");
    let from_c = ctx.get_property(&c, "shared").expect("shared");
    assert!(from_a.strict_equals(&from_c));

    let root = identity_path_from_host(dir.path());
    let record = ctx
        .module_record(&ModuleIdentity::file(format!("{root}/lib/shared.js")))
        .expect("record");
    assert!(record.real.is_some());
    assert!(record.mock.is_none());
}

#[test]
fn edited_source_is_picked_up_after_registry_reset() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "value.js", "exports.v = 1");
    write(dir.path(), "app.test.js", "");
    let runtime = disk_runtime(dir.path(), false);
    let mut ctx = runtime
        .create_context("app.test.js", &ConfigOverrides::default())
        .expect("context");
    let test_path = ctx.test_path().to_string();

    let first = ctx.require_module(&test_path, "./value").expect("first");
    write(dir.path(), "value.js", "exports.v = 2");
    let cached = ctx.require_module(&test_path, "./value").expect("cached");
    assert!(first.strict_equals(&cached));
    assert_eq!(ctx.get_property(&cached, "v").expect("v"), JsValue::Number(1.0));

    ctx.reset_module_registry();
    let fresh = ctx.require_module(&test_path, "./value").expect("fresh");
    assert_eq!(ctx.get_property(&fresh, "v").expect("v"), JsValue::Number(2.0));
}

#[test]
fn unreadable_test_file_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = disk_runtime(dir.path(), false);
    let mut ctx = runtime
        .create_context("missing.test.js", &ConfigOverrides::default())
        .expect("context");
    let err = ctx.run_test_file().expect_err("missing test file");
    assert!(matches!(err, RuntimeError::SourceUnreadable { .. }), "{err:?}");
    assert_eq!(err.stable_code(), "FE-MODLOAD-0004");
}

#[test]
fn contexts_run_on_separate_threads_without_sharing_state() {
    let fs = MemoryModuleFs::new()
        .with_file("/w/state.js", "exports.hits = 0\nexports.hit = function hit() { exports.hits = exports.hits + 1\nreturn exports.hits }")
        .with_file("/w/a.test.js", "const state = require('./state')\nstate.hit()\nexports.hits = state.hit()")
        .with_file("/w/b.test.js", "const state = require('./state')\nexports.hits = state.hit()");
    let config = RuntimeConfig::new("/w")
        .with_automock(false)
        .with_stack_path_style(PathStyle::Posix);
    let runtime = Runtime::new(config, Arc::new(fs)).expect("runtime");

    let contexts = ["a.test.js", "b.test.js"].map(|test| {
        runtime
            .create_context(test, &ConfigOverrides::default())
            .expect("context")
    });
    let results: Vec<(String, serde_json::Value, Vec<LoaderEvent>)> = thread::scope(|scope| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|mut ctx| {
                let runtime = &runtime;
                scope.spawn(move || {
                    let exports = ctx.run_test_file().expect("run");
                    let json = ctx.to_json(&exports);
                    let path = ctx.test_path().to_string();
                    (path, json, runtime.teardown(ctx))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect()
    });

    assert_eq!(results[0].0, "/w/a.test.js");
    assert_eq!(results[0].1, serde_json::json!({"hits": 2}));
    assert_eq!(results[1].1, serde_json::json!({"hits": 1}));
    let first_trace = &results[0].2[0].trace_id;
    let second_trace = &results[1].2[0].trace_id;
    assert_ne!(first_trace, second_trace);
}

#[test]
fn native_factories_replace_modules_for_script_requires() {
    let fs = MemoryModuleFs::new()
        .with_file("/w/clock.js", "exports.now = function now() { return 1 }")
        .with_file("/w/uses-clock.js", "const clock = require('./clock')\nexports.read = function read() { return clock.now }");
    let config = RuntimeConfig::new("/w")
        .with_automock(false)
        .with_stack_path_style(PathStyle::Posix);
    let runtime = Runtime::new(config, Arc::new(fs)).expect("runtime");
    let mut ctx = runtime
        .create_context("/w/clock.test.js", &ConfigOverrides::default())
        .expect("context");

    let factory: franken_test_runtime::NativeFactory = Arc::new(|heap: &mut Heap| {
        JsValue::Object(heap.object_from_entries(vec![("now".to_string(), JsValue::Number(1700.0))]))
    });
    ctx.set_mock_factory("/w/clock.test.js", "./clock", MockFactory::Native(factory), false)
        .expect("factory");
    let user = ctx
        .require_module_or_mock("/w/clock.test.js", "./uses-clock")
        .expect("uses-clock");
    let read = ctx.get_property(&user, "read").expect("read");
    assert_eq!(ctx.call(&read, Vec::new()).expect("read"), JsValue::Number(1700.0));

    let actual = ctx.require_actual("/w/clock.test.js", "./clock").expect("actual");
    let now = ctx.get_property(&actual, "now").expect("now");
    assert_eq!(ctx.call(&now, Vec::new()).expect("now"), JsValue::Number(1.0));
}

#[test]
fn per_test_case_policy_resets_script_overrides() {
    let fs = MemoryModuleFs::new()
        .with_file("/w/dep.js", "exports.f = function f() { return 'real' }")
        .with_file("/w/t.test.js", "exports.mocks = mocks");
    let config = RuntimeConfig::new("/w")
        .with_automock(false)
        .with_override_policy(OverridePolicy::ResetPerTestCase)
        .with_stack_path_style(PathStyle::Posix);
    let runtime = Runtime::new(config, Arc::new(fs)).expect("runtime");
    let mut ctx = runtime
        .create_context("t.test.js", &ConfigOverrides::default())
        .expect("context");
    let test = ctx.run_test_file().expect("run");
    let mocks = ctx.get_property(&test, "mocks").expect("mocks");

    ctx.call_method(&mocks, "mock", vec![JsValue::str("./dep")])
        .expect("mock");
    let mocked = ctx.require_module_or_mock("/w/t.test.js", "./dep").expect("dep");
    let f = ctx.get_property(&mocked, "f").expect("f");
    assert!(ctx.is_mock_function(&f));

    ctx.begin_test_case();
    let real = ctx.require_module_or_mock("/w/t.test.js", "./dep").expect("dep");
    let f = ctx.get_property(&real, "f").expect("f");
    assert_eq!(ctx.call(&f, Vec::new()).expect("f"), JsValue::str("real"));
}

#[test]
fn config_loaded_from_json_drives_the_runtime() {
    let config = RuntimeConfig::from_json_str(
        r#"{
            "root_dir": "/j",
            "automock": false,
            "module_name_mapper": [{"pattern": "^@app/(.*)$", "replacement": "<rootDir>/src/$1"}],
            "stack_path_style": "posix"
        }"#,
    )
    .expect("config");
    let fs = MemoryModuleFs::new().with_file("/j/src/widget.js", "exports.name = 'widget'");
    let runtime = Runtime::new(config, Arc::new(fs)).expect("runtime");
    let mut ctx = runtime
        .create_context("w.test.js", &ConfigOverrides::default())
        .expect("context");
    let widget = ctx
        .require_module_or_mock("/j/deep/nested/w.test.js", "@app/widget")
        .expect("widget");
    assert_eq!(ctx.get_property(&widget, "name").expect("name"), JsValue::str("widget"));
    let resolution = ctx.resolve("/j/w.test.js", "@app/widget").expect("resolve");
    assert!(resolution.via_mapper());
}

#[test]
fn event_log_serializes_as_json_lines() {
    let fs = MemoryModuleFs::new()
        .with_file("/w/a.js", "exports.a = 1")
        .with_file("/w/e.test.js", "require('./a')\nrequire('./a')\nrequire('./missing')");
    let config = RuntimeConfig::new("/w")
        .with_automock(false)
        .with_stack_path_style(PathStyle::Posix);
    let runtime = Runtime::new(config, Arc::new(fs)).expect("runtime");
    let mut ctx = runtime
        .create_context("e.test.js", &ConfigOverrides::default())
        .expect("context");
    let err = ctx.run_test_file().expect_err("missing dependency");
    assert!(err.is_module_not_found());

    let lines = ctx.events().to_json_lines().expect("json lines");
    let parsed: Vec<serde_json::Value> = lines
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert!(parsed.iter().any(|event| event["event"] == "cache_hit"));
    let denied: Vec<&serde_json::Value> = parsed
        .iter()
        .filter(|event| event["outcome"] == "deny")
        .collect();
    assert_eq!(denied[0]["event"], "module_resolution");
    assert_eq!(denied[0]["error_code"], "FE-MODRES-0003");
    assert_eq!(denied[1]["event"], "module_execution");
    let seqs: Vec<u64> = parsed
        .iter()
        .map(|event| event["seq"].as_u64().expect("seq"))
        .collect();
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn fixture_tree_loads_from_disk() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/test_root");
    let runtime = disk_runtime(&root, false);
    let mut ctx = runtime
        .create_context("root.js", &ConfigOverrides::default())
        .expect("context");
    let test_path = ctx.test_path().to_string();
    let config = ctx.require_module(&test_path, "./config.json").expect("json");
    assert_eq!(
        ctx.to_json(&config),
        serde_json::json!({"retries": 3, "labels": ["unit", "integration"]})
    );
    assert_eq!(ctx.module_count(), 1);
}
