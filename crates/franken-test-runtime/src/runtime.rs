//! Entry point: one validated configuration, many isolated contexts.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ConfigOverrides, RuntimeConfig};
use crate::error::RuntimeResult;
use crate::events::LoaderEvent;
use crate::fs::{DiskModuleFs, ModuleFs, file_name, is_absolute_path, join_paths, normalize_absolute_path};
use crate::loader::ExecutionContext;

/// Shared, read-only state from which per-test-file contexts are created.
/// Contexts hold no references back into the runtime and can be moved to
/// worker threads independently.
pub struct Runtime {
    config: RuntimeConfig,
    fs: Arc<dyn ModuleFs>,
    contexts_created: AtomicU64,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("contexts_created", &self.contexts_created.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig, fs: Arc<dyn ModuleFs>) -> RuntimeResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            fs,
            contexts_created: AtomicU64::new(0),
        })
    }

    pub fn on_disk(config: RuntimeConfig) -> RuntimeResult<Self> {
        Self::new(config, Arc::new(DiskModuleFs))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::Relaxed)
    }

    /// Fresh registry, mock state and sandbox for `test_path`. Relative test
    /// paths are taken from the root directory.
    pub fn create_context(
        &self,
        test_path: &str,
        overrides: &ConfigOverrides,
    ) -> RuntimeResult<ExecutionContext> {
        let config = self.config.apply(overrides);
        config.validate()?;
        let test_path = if is_absolute_path(test_path) {
            normalize_absolute_path(test_path)
        } else {
            normalize_absolute_path(&join_paths(&config.root_dir, test_path))
        };
        let seq = self.contexts_created.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("ctx-{seq:04}-{}", file_name(&test_path));
        ExecutionContext::new(config, Arc::clone(&self.fs), test_path, trace_id)
    }

    /// Discard a context and hand back its event log.
    pub fn teardown(&self, context: ExecutionContext) -> Vec<LoaderEvent> {
        context.into_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigErrorCode;
    use crate::error::RuntimeError;
    use crate::fs::MemoryModuleFs;
    use crate::value::JsValue;

    fn runtime() -> Runtime {
        let fs = MemoryModuleFs::new()
            .with_file("/proj/counter.js", "let n = 0\nexports.next = function next() { n = n + 1\nreturn n }")
            .with_file("/proj/a.test.js", "exports.ok = true");
        Runtime::new(RuntimeConfig::new("/proj").with_automock(false), Arc::new(fs)).expect("runtime")
    }

    #[test]
    fn relative_root_dir_is_rejected() {
        let err = Runtime::new(RuntimeConfig::new("proj"), Arc::new(MemoryModuleFs::new()))
            .expect_err("relative root");
        let RuntimeError::Config(config) = err else {
            panic!("expected config error");
        };
        assert_eq!(config.code, ConfigErrorCode::RelativeRootDir);
    }

    #[test]
    fn contexts_do_not_share_module_state() {
        let runtime = runtime();
        let mut first = runtime
            .create_context("a.test.js", &ConfigOverrides::default())
            .expect("first");
        let mut second = runtime
            .create_context("/proj/a.test.js", &ConfigOverrides::default())
            .expect("second");
        assert_eq!(first.test_path(), "/proj/a.test.js");
        assert_ne!(first.trace_id(), second.trace_id());

        let counter = first.require_module("/proj/a.test.js", "./counter").expect("counter");
        let next = first.get_property(&counter, "next").expect("next");
        first.call(&next, Vec::new()).expect("call");
        assert_eq!(first.call(&next, Vec::new()).expect("call"), JsValue::Number(2.0));

        let counter = second.require_module("/proj/a.test.js", "./counter").expect("counter");
        let next = second.get_property(&counter, "next").expect("next");
        assert_eq!(second.call(&next, Vec::new()).expect("call"), JsValue::Number(1.0));
        assert_eq!(runtime.contexts_created(), 2);
    }

    #[test]
    fn overrides_apply_to_one_context_only() {
        let runtime = runtime();
        let mocked = runtime
            .create_context("a.test.js", &ConfigOverrides::default().automock(true))
            .expect("mocked");
        let plain = runtime
            .create_context("a.test.js", &ConfigOverrides::default())
            .expect("plain");
        assert!(mocked.automock());
        assert!(!plain.automock());
    }

    #[test]
    fn teardown_returns_the_event_log() {
        let runtime = runtime();
        let mut ctx = runtime
            .create_context("a.test.js", &ConfigOverrides::default())
            .expect("ctx");
        ctx.run_test_file().expect("run");
        let trace_id = ctx.trace_id().to_string();
        let events = runtime.teardown(ctx);
        assert_eq!(events.first().map(|e| e.event.as_str()), Some("context_created"));
        assert_eq!(events.last().map(|e| e.event.as_str()), Some("teardown"));
        assert!(events.iter().all(|event| event.trace_id == trace_id));
    }
}
