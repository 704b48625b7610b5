//! Module loading and the per-test-file execution context.
//!
//! An `ExecutionContext` owns everything a test file can observe: the
//! sandbox heap, the module registry with its real and mock caches, the
//! resolver memo and the mock/real override state. Nothing is shared between
//! contexts.
//!
//! Module bodies run inside a function wrapper so they receive `module`,
//! `exports`, `require`, `__dirname`, `__filename` and `mocks` as locals.
//! The wrapper is an object-literal method keyed `Object.<anonymous>`, which
//! gives top-level frames the same label V8 uses for CommonJS modules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ast::Position;
use crate::automock;
use crate::config::{OverridePolicy, RuntimeConfig};
use crate::error::{
    ManualMockMismatchError, ModuleExecutionError, RuntimeError, RuntimeResult, ScriptException,
};
use crate::events::{LoaderEvent, LoaderEventLog};
use crate::fs::{ModuleFs, is_absolute_path, parent_directory};
use crate::interpreter::{EvalResult, Host, HostCall, Interrupt, Sandbox};
use crate::mock_registry::{MockFactory, MockHints, MockRegistry};
use crate::parser::{ParseError, parse_program};
use crate::resolver::{IdentityKind, ModuleIdentity, ModuleResolver, Resolution, ResolutionError};
use crate::stack_trace::{StackFrame, WrapperLayout};
use crate::value::{ErrorKind, HostOp, JsValue, MockState, ObjectHandle};

/// Text placed before every module body.
pub const WRAPPER_PREFIX: &str =
    "({\"Object.<anonymous>\":function(module,exports,require,__dirname,__filename,mocks){";
/// Text placed after every module body.
pub const WRAPPER_SUFFIX: &str = "\n}});";

const WRAPPER_KEY: &str = "Object.<anonymous>";
/// Stack for evaluation threads; well above what the parser and sandbox
/// depth limits can consume.
const EVAL_STACK_BYTES: usize = 64 * 1024 * 1024;
const COMPONENT_LOADER: &str = "module_loader";
const COMPONENT_RESOLVER: &str = "module_resolver";
const COMPONENT_MOCKS: &str = "mock_registry";

/// Operations exposed on the module-local `mocks` object.
const MOCKS_OBJECT_OPS: [HostOp; 8] = [
    HostOp::Mock,
    HostOp::Unmock,
    HostOp::EnableAutomock,
    HostOp::DisableAutomock,
    HostOp::ResetModuleRegistry,
    HostOp::CreateMockFn,
    HostOp::GenMockFromModule,
    HostOp::RequireActual,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// Top-level code is still running; the exports may be partial.
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavour {
    Real,
    Mock,
}

impl Flavour {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Mock => "mock",
        }
    }
}

/// A module object (`{exports, id, filename, loaded}`) held by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedModule {
    pub module: ObjectHandle,
    pub state: LoadState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub identity: ModuleIdentity,
    /// SHA-256 (hex) of the real source, once it has been read.
    pub source_hash: Option<String>,
    pub compiled: bool,
    pub from_factory: bool,
    pub real: Option<CachedModule>,
    pub mock: Option<CachedModule>,
}

impl ModuleRecord {
    fn new(identity: ModuleIdentity) -> Self {
        Self {
            identity,
            source_hash: None,
            compiled: false,
            from_factory: false,
            real: None,
            mock: None,
        }
    }

    pub fn slot(&self, flavour: Flavour) -> Option<CachedModule> {
        match flavour {
            Flavour::Real => self.real,
            Flavour::Mock => self.mock,
        }
    }

    fn slot_mut(&mut self, flavour: Flavour) -> &mut Option<CachedModule> {
        match flavour {
            Flavour::Real => &mut self.real,
            Flavour::Mock => &mut self.mock,
        }
    }

    fn is_empty(&self) -> bool {
        self.real.is_none() && self.mock.is_none()
    }
}

fn source_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Convert a script-level throw that reached the embedder.
fn settle<T>(sandbox: &Sandbox, result: EvalResult<T>) -> RuntimeResult<T> {
    result.map_err(|interrupt| match interrupt {
        Interrupt::Host(error) => error,
        Interrupt::Throw { value, frames } => {
            let report = sandbox.describe_throw(&value, &frames, None);
            RuntimeError::Uncaught(Box::new(ScriptException {
                name: report.name,
                message: report.message,
                stack: report.stack,
                frames: report.frames,
            }))
        }
    })
}

/// A throw escaping `path`'s top-level code becomes that module's failure.
/// Failures of nested modules pass through unchanged.
fn execution_failure(sandbox: &Sandbox, path: &str, interrupt: Interrupt) -> Interrupt {
    match interrupt {
        Interrupt::Throw { value, frames } => {
            let report = sandbox.describe_throw(&value, &frames, Some(path));
            Interrupt::Host(RuntimeError::ModuleExecution(Box::new(ModuleExecutionError {
                identity: path.to_string(),
                name: report.name,
                message: report.message,
                stack: report.stack,
                frames: report.frames,
            })))
        }
        host => host,
    }
}

fn syntax_failure(
    sandbox: &Sandbox,
    path: &str,
    message: String,
    position: Option<Position>,
) -> Interrupt {
    let frames = vec![StackFrame {
        function_name: String::new(),
        file: sandbox.normalizer().style().render_path(path),
        position,
    }];
    let stack = sandbox.normalizer().render("SyntaxError", &message, &frames);
    Interrupt::Host(RuntimeError::ModuleExecution(Box::new(ModuleExecutionError {
        identity: path.to_string(),
        name: "SyntaxError".to_string(),
        message,
        stack,
        frames,
    })))
}

/// Automock slot reserved while the real module is still executing.
#[derive(Debug, Clone, Copy)]
struct PendingAutomock {
    module: ObjectHandle,
    reserved: ObjectHandle,
}

#[derive(Debug)]
struct ModuleLoader {
    config: RuntimeConfig,
    test_path: String,
    resolver: ModuleResolver,
    mocks: MockRegistry,
    registry: BTreeMap<ModuleIdentity, ModuleRecord>,
    events: LoaderEventLog,
    manual_mocks_in_progress: BTreeSet<ModuleIdentity>,
    pending_automocks: BTreeMap<ModuleIdentity, PendingAutomock>,
    layout: WrapperLayout,
}

impl ModuleLoader {
    fn requesting_dir(&self, from: &str) -> String {
        if is_absolute_path(from) {
            parent_directory(from)
        } else {
            self.resolver.root_dir().to_string()
        }
    }

    fn resolve(&mut self, from_dir: &str, specifier: &str) -> EvalResult<Resolution> {
        match self.resolver.resolve(from_dir, specifier) {
            Ok(resolution) => {
                self.events.allow(
                    COMPONENT_RESOLVER,
                    "module_resolution",
                    resolution.identity.as_str(),
                    format!(
                        "specifier={specifier} kind={} mapped={}",
                        resolution.identity.kind.as_str(),
                        resolution.via_mapper()
                    ),
                );
                Ok(resolution)
            }
            Err(error) => {
                self.events.deny(
                    COMPONENT_RESOLVER,
                    "module_resolution",
                    error.code.stable_code(),
                    "",
                    format!("specifier={specifier} from={from_dir}"),
                );
                Err(RuntimeError::from(error).into())
            }
        }
    }

    fn hints(&self, resolution: &Resolution) -> MockHints {
        MockHints {
            via_mapper: resolution.via_mapper(),
            node_module_manual_mock: self
                .resolver
                .package_manual_mock(&resolution.identity)
                .is_some(),
        }
    }

    fn cached(&self, identity: &ModuleIdentity, flavour: Flavour) -> Option<CachedModule> {
        self.registry
            .get(identity)
            .and_then(|record| record.slot(flavour))
    }

    fn store(&mut self, identity: &ModuleIdentity, flavour: Flavour, cached: CachedModule) {
        let record = self
            .registry
            .entry(identity.clone())
            .or_insert_with(|| ModuleRecord::new(identity.clone()));
        *record.slot_mut(flavour) = Some(cached);
    }

    /// Mark a slot loaded, unless the registry was reset in the meantime.
    fn finish(&mut self, identity: &ModuleIdentity, flavour: Flavour, module: ObjectHandle) {
        if let Some(record) = self.registry.get_mut(identity)
            && let Some(slot) = record.slot_mut(flavour)
            && slot.module == module
        {
            slot.state = LoadState::Loaded;
            record.compiled = true;
        }
    }

    fn evict(&mut self, identity: &ModuleIdentity, flavour: Flavour, module: ObjectHandle) {
        let Some(record) = self.registry.get_mut(identity) else {
            return;
        };
        let slot = record.slot_mut(flavour);
        if slot.is_some_and(|cached| cached.module == module) {
            *slot = None;
        }
        if record.is_empty() {
            self.registry.remove(identity);
        }
    }

    fn cache_hit(
        &mut self,
        sandbox: &Sandbox,
        identity: &ModuleIdentity,
        flavour: Flavour,
        cached: CachedModule,
    ) -> EvalResult<JsValue> {
        let state = match cached.state {
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
        };
        self.events.allow(
            COMPONENT_LOADER,
            "cache_hit",
            identity.as_str(),
            format!("flavour={} state={state}", flavour.as_str()),
        );
        Ok(sandbox.heap().get_property(cached.module, "exports")?)
    }

    fn new_module_object(sandbox: &mut Sandbox, path: &str, exports: JsValue) -> ObjectHandle {
        sandbox.heap_mut().object_from_entries(vec![
            ("exports".to_string(), exports),
            ("id".to_string(), JsValue::str(path)),
            ("filename".to_string(), JsValue::str(path)),
            ("loaded".to_string(), JsValue::Bool(false)),
        ])
    }

    fn read_source(&self, path: &str) -> RuntimeResult<String> {
        self.resolver
            .fs()
            .read_to_string(path)
            .map_err(|error| RuntimeError::SourceUnreadable {
                path: path.to_string(),
                message: error.to_string(),
            })
    }

    fn require_module_or_mock(
        &mut self,
        sandbox: &mut Sandbox,
        from_dir: &str,
        specifier: &str,
    ) -> EvalResult<JsValue> {
        let resolution = self.resolve(from_dir, specifier)?;
        let identity = resolution.identity.clone();
        if self.manual_mocks_in_progress.contains(&identity) {
            return self.require_real(sandbox, &identity);
        }
        let decision = self.mocks.decide(&identity, self.hints(&resolution));
        self.events.allow(
            COMPONENT_MOCKS,
            "mock_decision",
            identity.as_str(),
            format!("mock={} reason={}", decision.mock, decision.reason.as_str()),
        );
        if decision.mock {
            self.require_mock_resolved(sandbox, &identity)
        } else {
            self.require_real_checked(sandbox, &identity, specifier, from_dir)
        }
    }

    fn require_real_checked(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
        specifier: &str,
        from_dir: &str,
    ) -> EvalResult<JsValue> {
        let unavailable = match identity.kind {
            IdentityKind::Virtual => true,
            IdentityKind::MockOnly => self.mocks.is_explicitly_real(identity),
            IdentityKind::File => false,
        };
        if unavailable {
            let error = ResolutionError::module_not_found(specifier, from_dir, self.events.trace_id());
            return Err(RuntimeError::from(error).into());
        }
        self.require_real(sandbox, identity)
    }

    /// Execute (once) and return the real exports. A mock-only identity
    /// runs its manual mock file, since no real module exists.
    fn require_real(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
    ) -> EvalResult<JsValue> {
        if let Some(cached) = self.cached(identity, Flavour::Real) {
            return self.cache_hit(sandbox, identity, Flavour::Real, cached);
        }
        if identity.kind == IdentityKind::Virtual {
            return Err(RuntimeError::invalid_operation(format!(
                "virtual module '{identity}' has no real implementation"
            ))
            .into());
        }
        let source = self.read_source(&identity.path)?;
        let path = identity.path.clone();
        self.execute_source(sandbox, identity, &path, &source, Flavour::Real)
    }

    fn execute_source(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
        path: &str,
        source: &str,
        flavour: Flavour,
    ) -> EvalResult<JsValue> {
        let hash = source_hash(source);
        let exports = JsValue::Object(sandbox.heap_mut().alloc_plain());
        let module = Self::new_module_object(sandbox, path, exports);
        self.store(
            identity,
            flavour,
            CachedModule {
                module,
                state: LoadState::Loading,
            },
        );
        if flavour == Flavour::Real
            && let Some(record) = self.registry.get_mut(identity)
        {
            record.source_hash = Some(hash.clone());
        }

        let result = if path.ends_with(".json") {
            Self::evaluate_json(sandbox, module, path, source)
        } else {
            self.evaluate_script(sandbox, module, path, source)
        };
        let pending = match flavour {
            Flavour::Real => self.pending_automocks.remove(identity),
            Flavour::Mock => None,
        };
        match result {
            Ok(()) => {
                self.finish(identity, flavour, module);
                sandbox
                    .heap_mut()
                    .set_property(module, "loaded", JsValue::Bool(true))?;
                self.events.allow(
                    COMPONENT_LOADER,
                    "module_execution",
                    identity.as_str(),
                    format!("flavour={} path={path} sha256={hash}", flavour.as_str()),
                );
                let exports = sandbox.heap().get_property(module, "exports")?;
                if let Some(pending) = pending {
                    self.complete_automock(sandbox, identity, &exports, pending)?;
                }
                Ok(exports)
            }
            Err(interrupt) => {
                self.evict(identity, flavour, module);
                if let Some(pending) = pending {
                    self.evict(identity, Flavour::Mock, pending.module);
                }
                let code = match &interrupt {
                    Interrupt::Host(error) => error.stable_code(),
                    Interrupt::Throw { .. } => "FE-MODLOAD-0001",
                };
                self.events.deny(
                    COMPONENT_LOADER,
                    "module_execution",
                    code,
                    identity.as_str(),
                    format!("flavour={} path={path}", flavour.as_str()),
                );
                Err(interrupt)
            }
        }
    }

    fn evaluate_json(
        sandbox: &mut Sandbox,
        module: ObjectHandle,
        path: &str,
        source: &str,
    ) -> EvalResult<()> {
        let document: serde_json::Value = serde_json::from_str(source).map_err(|error| {
            let position = Position::new(error.line() as u32, error.column() as u32);
            syntax_failure(sandbox, path, format!("{path}: {error}"), Some(position))
        })?;
        let exports = sandbox.heap_mut().from_json(&document);
        sandbox.heap_mut().set_property(module, "exports", exports)?;
        Ok(())
    }

    fn evaluate_script(
        &mut self,
        sandbox: &mut Sandbox,
        module: ObjectHandle,
        path: &str,
        source: &str,
    ) -> EvalResult<()> {
        let script: Arc<str> = Arc::from(path);
        sandbox.register_script(script.clone(), self.layout.clone());
        let wrapped = format!("{WRAPPER_PREFIX}{source}{WRAPPER_SUFFIX}");
        let program = parse_program(&wrapped, path)
            .map_err(|error| self.parse_failure(sandbox, path, error))?;
        let wrapper_object = sandbox
            .evaluate_program(&program, script.clone(), self)
            .map_err(|interrupt| execution_failure(sandbox, path, interrupt))?;
        let wrapper = match wrapper_object.as_object() {
            Some(handle) => sandbox.heap().get_property(handle, WRAPPER_KEY)?,
            None => JsValue::Undefined,
        };

        let exports = sandbox.heap().get_property(module, "exports")?;
        let require = sandbox.alloc_host_function("require", HostOp::Require, script.clone());
        let mocks = Self::mocks_object(sandbox, &script);
        let args = vec![
            JsValue::Object(module),
            exports.clone(),
            JsValue::Object(require),
            JsValue::str(parent_directory(path)),
            JsValue::str(path),
            JsValue::Object(mocks),
        ];
        sandbox
            .call_function(&wrapper, exports, args, self)
            .map(|_| ())
            .map_err(|interrupt| execution_failure(sandbox, path, interrupt))
    }

    fn parse_failure(&self, sandbox: &Sandbox, path: &str, error: ParseError) -> Interrupt {
        let position = error
            .position
            .and_then(|position| self.layout.to_authored(position));
        syntax_failure(sandbox, path, error.message, position)
    }

    fn mocks_object(sandbox: &mut Sandbox, module_id: &Arc<str>) -> ObjectHandle {
        let entries = MOCKS_OBJECT_OPS
            .iter()
            .map(|op| {
                let function = sandbox.alloc_host_function(op.as_str(), *op, module_id.clone());
                (op.as_str().to_string(), JsValue::Object(function))
            })
            .collect();
        sandbox.heap_mut().object_from_entries(entries)
    }

    fn require_mock(
        &mut self,
        sandbox: &mut Sandbox,
        from_dir: &str,
        specifier: &str,
    ) -> EvalResult<JsValue> {
        let resolution = self.resolve(from_dir, specifier)?;
        self.require_mock_resolved(sandbox, &resolution.identity)
    }

    /// Factory, else manual mock, else automock of the real exports.
    fn require_mock_resolved(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
    ) -> EvalResult<JsValue> {
        if let Some(cached) = self.cached(identity, Flavour::Mock) {
            return self.cache_hit(sandbox, identity, Flavour::Mock, cached);
        }
        if let Some(factory) = self.mocks.factory(identity).cloned() {
            return self.materialize_factory(sandbox, identity, factory);
        }
        if let Some(mock_path) = self.resolver.manual_mock_for(identity) {
            return self.load_manual_mock(sandbox, identity, &mock_path);
        }
        if identity.kind == IdentityKind::Virtual {
            return Err(RuntimeError::invalid_operation(format!(
                "virtual module '{identity}' has no factory"
            ))
            .into());
        }

        // Requests made while the real module runs get the reserved object,
        // which synthesis later fills in place.
        let reserved = sandbox.heap_mut().alloc_plain();
        let module =
            Self::new_module_object(sandbox, identity.as_str(), JsValue::Object(reserved));
        self.store(
            identity,
            Flavour::Mock,
            CachedModule {
                module,
                state: LoadState::Loading,
            },
        );
        let pending = PendingAutomock { module, reserved };
        let real = match self.require_real(sandbox, identity) {
            Ok(real) => real,
            Err(interrupt) => {
                self.evict(identity, Flavour::Mock, module);
                return Err(interrupt);
            }
        };
        let real_loading = self
            .cached(identity, Flavour::Real)
            .is_some_and(|cached| cached.state == LoadState::Loading);
        if real_loading {
            self.pending_automocks.insert(identity.clone(), pending);
            self.events.allow(
                COMPONENT_MOCKS,
                "mock_synthesis_deferred",
                identity.as_str(),
                "",
            );
            return Ok(JsValue::Object(reserved));
        }
        self.complete_automock(sandbox, identity, &real, pending)
    }

    fn complete_automock(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
        real: &JsValue,
        pending: PendingAutomock,
    ) -> EvalResult<JsValue> {
        let (mock, stats) = automock::synthesize_into(sandbox.heap_mut(), real, pending.reserved)?;
        let heap = sandbox.heap_mut();
        heap.set_property(pending.module, "exports", mock.clone())?;
        heap.set_property(pending.module, "loaded", JsValue::Bool(true))?;
        self.finish(identity, Flavour::Mock, pending.module);
        self.events.allow(
            COMPONENT_MOCKS,
            "mock_synthesis",
            identity.as_str(),
            format!(
                "functions={} objects={} classes={}",
                stats.functions, stats.objects, stats.classes
            ),
        );
        Ok(mock)
    }

    fn load_manual_mock(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
        mock_path: &str,
    ) -> EvalResult<JsValue> {
        let mismatch = |reason: String| {
            Interrupt::Host(RuntimeError::ManualMockMismatch(Box::new(
                ManualMockMismatchError {
                    identity: identity.path.clone(),
                    mock_path: mock_path.to_string(),
                    reason,
                },
            )))
        };
        let source = self
            .read_source(mock_path)
            .map_err(|error| mismatch(error.to_string()))?;

        self.manual_mocks_in_progress.insert(identity.clone());
        let result = self.execute_source(sandbox, identity, mock_path, &source, Flavour::Mock);
        self.manual_mocks_in_progress.remove(identity);

        match result {
            Ok(exports) => {
                self.events.allow(
                    COMPONENT_MOCKS,
                    "manual_mock",
                    identity.as_str(),
                    format!("mock_path={mock_path}"),
                );
                Ok(exports)
            }
            Err(Interrupt::Host(RuntimeError::ModuleExecution(error)))
                if error.name == "SyntaxError" && error.identity == mock_path =>
            {
                Err(mismatch(error.to_string()))
            }
            Err(other) => Err(other),
        }
    }

    fn materialize_factory(
        &mut self,
        sandbox: &mut Sandbox,
        identity: &ModuleIdentity,
        factory: MockFactory,
    ) -> EvalResult<JsValue> {
        let placeholder = JsValue::Object(sandbox.heap_mut().alloc_plain());
        let module = Self::new_module_object(sandbox, identity.as_str(), placeholder);
        self.store(
            identity,
            Flavour::Mock,
            CachedModule {
                module,
                state: LoadState::Loading,
            },
        );
        let produced = match factory {
            MockFactory::Native(build) => Ok(build(sandbox.heap_mut())),
            MockFactory::Script(function) => sandbox
                .call_function(&function, JsValue::Undefined, Vec::new(), self)
                .map_err(|interrupt| execution_failure(sandbox, identity.as_str(), interrupt)),
        };
        let exports = match produced {
            Ok(exports) => exports,
            Err(interrupt) => {
                self.evict(identity, Flavour::Mock, module);
                return Err(interrupt);
            }
        };
        sandbox
            .heap_mut()
            .set_property(module, "exports", exports.clone())?;
        sandbox
            .heap_mut()
            .set_property(module, "loaded", JsValue::Bool(true))?;
        self.finish(identity, Flavour::Mock, module);
        if let Some(record) = self.registry.get_mut(identity) {
            record.from_factory = true;
        }
        self.events
            .allow(COMPONENT_MOCKS, "mock_factory", identity.as_str(), "");
        Ok(exports)
    }

    fn require_actual(
        &mut self,
        sandbox: &mut Sandbox,
        from_dir: &str,
        specifier: &str,
    ) -> EvalResult<JsValue> {
        let resolution = self.resolve(from_dir, specifier)?;
        self.require_real_checked(sandbox, &resolution.identity, specifier, from_dir)
    }

    /// A fresh automock of the real exports; never cached.
    fn generate_from_module(
        &mut self,
        sandbox: &mut Sandbox,
        from_dir: &str,
        specifier: &str,
    ) -> EvalResult<JsValue> {
        let resolution = self.resolve(from_dir, specifier)?;
        let real = self.require_real_checked(sandbox, &resolution.identity, specifier, from_dir)?;
        let (mock, stats) = automock::synthesize_with_stats(sandbox.heap_mut(), &real)?;
        self.events.allow(
            COMPONENT_MOCKS,
            "mock_synthesis",
            resolution.identity.as_str(),
            format!(
                "functions={} objects={} classes={} cached=false",
                stats.functions, stats.objects, stats.classes
            ),
        );
        Ok(mock)
    }

    fn set_mock_factory(
        &mut self,
        from_dir: &str,
        specifier: &str,
        factory: MockFactory,
        is_virtual: bool,
    ) -> EvalResult<ModuleIdentity> {
        let identity = if is_virtual {
            self.resolver.register_virtual(from_dir, specifier)
        } else {
            self.resolve(from_dir, specifier)?.identity
        };
        self.mocks.set_factory(&identity, factory);
        self.mocks.mark_always_mock(&identity);
        self.events.allow(
            COMPONENT_MOCKS,
            "override_change",
            identity.as_str(),
            format!("mock=true factory=true virtual={is_virtual}"),
        );
        Ok(identity)
    }

    fn mark(&mut self, from_dir: &str, specifier: &str, mock: bool) -> EvalResult<ModuleIdentity> {
        let identity = self.resolve(from_dir, specifier)?.identity;
        if mock {
            self.mocks.mark_always_mock(&identity);
        } else {
            self.mocks.mark_always_real(&identity);
        }
        self.events.allow(
            COMPONENT_MOCKS,
            "override_change",
            identity.as_str(),
            format!("mock={mock}"),
        );
        Ok(identity)
    }

    fn set_automock(&mut self, automock: bool) {
        self.mocks.set_automock_default(automock);
        self.events.allow(
            COMPONENT_MOCKS,
            "override_change",
            "",
            format!("automock={automock}"),
        );
    }

    fn reset_module_registry(&mut self) {
        let dropped = self.registry.len();
        self.registry.clear();
        self.pending_automocks.clear();
        self.events.allow(
            COMPONENT_LOADER,
            "registry_reset",
            "",
            format!("dropped={dropped}"),
        );
    }
}

fn specifier_arg(sandbox: &mut Sandbox, call: &HostCall<'_>) -> EvalResult<String> {
    match call.args.first() {
        Some(JsValue::Str(specifier)) => Ok(specifier.clone()),
        _ => Err(sandbox.throw_error(
            ErrorKind::TypeError,
            format!("{}() expects a module name string", call.op.as_str()),
        )),
    }
}

impl Host for ModuleLoader {
    fn host_call(&mut self, sandbox: &mut Sandbox, call: HostCall<'_>) -> EvalResult<JsValue> {
        let from_dir = self.requesting_dir(call.module_id);
        match call.op {
            HostOp::Require => {
                let specifier = specifier_arg(sandbox, &call)?;
                self.require_module_or_mock(sandbox, &from_dir, &specifier)
            }
            HostOp::RequireActual => {
                let specifier = specifier_arg(sandbox, &call)?;
                self.require_actual(sandbox, &from_dir, &specifier)
            }
            HostOp::GenMockFromModule => {
                let specifier = specifier_arg(sandbox, &call)?;
                self.generate_from_module(sandbox, &from_dir, &specifier)
            }
            HostOp::Mock => {
                let specifier = specifier_arg(sandbox, &call)?;
                let is_virtual = match call.args.get(2).and_then(JsValue::as_object) {
                    Some(options) => sandbox.heap().get_property(options, "virtual")?.truthy(),
                    None => false,
                };
                match call.args.get(1) {
                    None | Some(JsValue::Undefined) => {
                        self.mark(&from_dir, &specifier, true)?;
                    }
                    Some(factory) if sandbox.heap().is_callable(factory) => {
                        let factory = MockFactory::Script(factory.clone());
                        self.set_mock_factory(&from_dir, &specifier, factory, is_virtual)?;
                    }
                    Some(_) => {
                        return Err(sandbox.throw_error(
                            ErrorKind::TypeError,
                            "mock() factory must be a function",
                        ));
                    }
                }
                Ok(call.this)
            }
            HostOp::Unmock => {
                let specifier = specifier_arg(sandbox, &call)?;
                self.mark(&from_dir, &specifier, false)?;
                Ok(call.this)
            }
            HostOp::EnableAutomock => {
                self.set_automock(true);
                Ok(call.this)
            }
            HostOp::DisableAutomock => {
                self.set_automock(false);
                Ok(call.this)
            }
            HostOp::ResetModuleRegistry => {
                self.reset_module_registry();
                Ok(call.this)
            }
            HostOp::CreateMockFn => {
                let mock = sandbox.heap_mut().alloc_mock_function("mockConstructor");
                let implementation = call
                    .args
                    .first()
                    .filter(|value| sandbox.heap().is_callable(value))
                    .cloned();
                if let Some(state) = sandbox.heap_mut().mock_state_mut(mock)? {
                    state.implementation = implementation;
                }
                Ok(JsValue::Object(mock))
            }
        }
    }
}

/// Module registry, mock state and sandbox for a single test file.
#[derive(Debug)]
pub struct ExecutionContext {
    sandbox: Sandbox,
    loader: ModuleLoader,
}

impl ExecutionContext {
    pub(crate) fn new(
        config: RuntimeConfig,
        fs: Arc<dyn ModuleFs>,
        test_path: String,
        trace_id: String,
    ) -> RuntimeResult<Self> {
        let resolver = ModuleResolver::new(&config, fs, trace_id.clone())?;
        let mocks = MockRegistry::new(&config)?;
        let mut events = LoaderEventLog::new(trace_id);
        events.allow(
            COMPONENT_LOADER,
            "context_created",
            test_path.as_str(),
            format!("automock={}", config.automock),
        );
        Ok(Self {
            sandbox: Sandbox::new(config.path_style()),
            loader: ModuleLoader {
                config,
                test_path,
                resolver,
                mocks,
                registry: BTreeMap::new(),
                events,
                manual_mocks_in_progress: BTreeSet::new(),
                pending_automocks: BTreeMap::new(),
                layout: WrapperLayout::for_prefix(WRAPPER_PREFIX),
            },
        })
    }

    pub fn trace_id(&self) -> &str {
        self.loader.events.trace_id()
    }

    pub fn test_path(&self) -> &str {
        &self.loader.test_path
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.loader.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn events(&self) -> &LoaderEventLog {
        &self.loader.events
    }

    pub fn automock(&self) -> bool {
        self.loader.mocks.automock()
    }

    pub fn module_record(&self, identity: &ModuleIdentity) -> Option<&ModuleRecord> {
        self.loader.registry.get(identity)
    }

    pub fn module_count(&self) -> usize {
        self.loader.registry.len()
    }

    /// Run `op` on a thread with a stack sized for script evaluation, so
    /// deep scripts hit the sandbox limits instead of the caller's stack.
    fn evaluate<T: Send>(
        &mut self,
        op: impl FnOnce(&mut Sandbox, &mut ModuleLoader) -> EvalResult<T> + Send,
    ) -> RuntimeResult<T> {
        let name = format!("{}-eval", self.loader.events.trace_id());
        let sandbox = &mut self.sandbox;
        let loader = &mut self.loader;
        let result = std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name(name)
                .stack_size(EVAL_STACK_BYTES)
                .spawn_scoped(scope, move || op(sandbox, loader));
            match worker {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                Err(error) => Err(Interrupt::Host(RuntimeError::invalid_operation(format!(
                    "cannot start evaluation thread: {error}"
                )))),
            }
        });
        settle(&self.sandbox, result)
    }

    pub fn resolve(&mut self, from: &str, specifier: &str) -> RuntimeResult<Resolution> {
        let from_dir = self.loader.requesting_dir(from);
        settle(&self.sandbox, self.loader.resolve(&from_dir, specifier))
    }

    /// Real exports, bypassing mock decisions.
    pub fn require_module(&mut self, from: &str, specifier: &str) -> RuntimeResult<JsValue> {
        let from_dir = self.loader.requesting_dir(from);
        self.evaluate(move |sandbox, loader| loader.require_actual(sandbox, &from_dir, specifier))
    }

    pub fn require_mock(&mut self, from: &str, specifier: &str) -> RuntimeResult<JsValue> {
        let from_dir = self.loader.requesting_dir(from);
        self.evaluate(move |sandbox, loader| loader.require_mock(sandbox, &from_dir, specifier))
    }

    /// What a `require` call inside module code returns.
    pub fn require_module_or_mock(
        &mut self,
        from: &str,
        specifier: &str,
    ) -> RuntimeResult<JsValue> {
        let from_dir = self.loader.requesting_dir(from);
        self.evaluate(move |sandbox, loader| {
            loader.require_module_or_mock(sandbox, &from_dir, specifier)
        })
    }

    pub fn require_actual(&mut self, from: &str, specifier: &str) -> RuntimeResult<JsValue> {
        self.require_module(from, specifier)
    }

    /// Execute the test file itself (never mocked) and return its exports.
    pub fn run_test_file(&mut self) -> RuntimeResult<JsValue> {
        let identity = ModuleIdentity::file(self.loader.test_path.clone());
        self.evaluate(move |sandbox, loader| loader.require_real(sandbox, &identity))
    }

    pub fn call(&mut self, function: &JsValue, args: Vec<JsValue>) -> RuntimeResult<JsValue> {
        self.evaluate(move |sandbox, loader| {
            sandbox.call_function(function, JsValue::Undefined, args, loader)
        })
    }

    /// `target[name](...args)` with `target` as the receiver.
    pub fn call_method(
        &mut self,
        target: &JsValue,
        name: &str,
        args: Vec<JsValue>,
    ) -> RuntimeResult<JsValue> {
        let function = self.get_property(target, name)?;
        let receiver = target.clone();
        self.evaluate(move |sandbox, loader| {
            sandbox.call_method(&function, receiver, args, loader)
        })
    }

    /// `new constructor(...args)`.
    pub fn construct(&mut self, constructor: &JsValue, args: Vec<JsValue>) -> RuntimeResult<JsValue> {
        self.evaluate(move |sandbox, loader| sandbox.construct(constructor, args, loader))
    }

    pub fn get_property(&self, target: &JsValue, key: &str) -> RuntimeResult<JsValue> {
        match target {
            JsValue::Object(handle) => Ok(self.sandbox.heap().get_property(*handle, key)?),
            JsValue::Undefined | JsValue::Null => Err(RuntimeError::invalid_operation(format!(
                "cannot read property '{key}' of {target}"
            ))),
            _ => Ok(JsValue::Undefined),
        }
    }

    pub fn set_property(
        &mut self,
        target: &JsValue,
        key: &str,
        value: JsValue,
    ) -> RuntimeResult<()> {
        let Some(handle) = target.as_object() else {
            return Err(RuntimeError::invalid_operation(format!(
                "cannot set property '{key}' on primitive {target}"
            )));
        };
        Ok(self.sandbox.heap_mut().set_property(handle, key, value)?)
    }

    pub fn type_of(&self, value: &JsValue) -> &'static str {
        self.sandbox.heap().type_of(value)
    }

    pub fn is_mock_function(&self, value: &JsValue) -> bool {
        self.sandbox.heap().is_mock_function(value)
    }

    pub fn to_json(&self, value: &JsValue) -> serde_json::Value {
        self.sandbox.heap().to_json(value)
    }

    /// Allocate a plain object from host-side values.
    pub fn alloc_object(&mut self, entries: Vec<(String, JsValue)>) -> JsValue {
        JsValue::Object(self.sandbox.heap_mut().object_from_entries(entries))
    }

    /// Drop every cached real and mock export. Overrides and factories stay.
    pub fn reset_module_registry(&mut self) {
        self.loader.reset_module_registry();
    }

    pub fn set_mock_factory(
        &mut self,
        from: &str,
        specifier: &str,
        factory: MockFactory,
        is_virtual: bool,
    ) -> RuntimeResult<ModuleIdentity> {
        let from_dir = self.loader.requesting_dir(from);
        let result = self
            .loader
            .set_mock_factory(&from_dir, specifier, factory, is_virtual);
        settle(&self.sandbox, result)
    }

    pub fn generate_from_module(&mut self, from: &str, specifier: &str) -> RuntimeResult<JsValue> {
        let from_dir = self.loader.requesting_dir(from);
        self.evaluate(move |sandbox, loader| {
            loader.generate_from_module(sandbox, &from_dir, specifier)
        })
    }

    pub fn mark_always_mock(&mut self, from: &str, specifier: &str) -> RuntimeResult<ModuleIdentity> {
        let from_dir = self.loader.requesting_dir(from);
        let result = self.loader.mark(&from_dir, specifier, true);
        settle(&self.sandbox, result)
    }

    pub fn mark_always_real(&mut self, from: &str, specifier: &str) -> RuntimeResult<ModuleIdentity> {
        let from_dir = self.loader.requesting_dir(from);
        let result = self.loader.mark(&from_dir, specifier, false);
        settle(&self.sandbox, result)
    }

    pub fn clear_explicit_override(&mut self, from: &str, specifier: &str) -> RuntimeResult<()> {
        let resolution = self.resolve(from, specifier)?;
        self.loader
            .mocks
            .clear_explicit_override(&resolution.identity);
        self.loader.events.allow(
            COMPONENT_MOCKS,
            "override_change",
            resolution.identity.as_str(),
            "cleared",
        );
        Ok(())
    }

    pub fn set_automock(&mut self, automock: bool) {
        self.loader.set_automock(automock);
    }

    pub fn should_mock(&mut self, from: &str, specifier: &str) -> RuntimeResult<bool> {
        let resolution = self.resolve(from, specifier)?;
        let hints = self.loader.hints(&resolution);
        Ok(self.loader.mocks.decide(&resolution.identity, hints).mock)
    }

    /// Apply the configured override policy at a test-case boundary.
    pub fn begin_test_case(&mut self) {
        if self.loader.config.override_policy == OverridePolicy::ResetPerTestCase {
            self.loader.mocks.clear_all_overrides();
            self.loader.events.allow(
                COMPONENT_MOCKS,
                "override_reset",
                "",
                format!("automock={}", self.loader.mocks.automock()),
            );
        }
    }

    pub fn mock_calls(&self, mock: &JsValue) -> RuntimeResult<Vec<Vec<JsValue>>> {
        self.mock_state(mock).map(|state| state.calls.clone())
    }

    pub fn mock_instances(&self, mock: &JsValue) -> RuntimeResult<Vec<JsValue>> {
        self.mock_state(mock).map(|state| state.instances.clone())
    }

    pub fn mock_results(&self, mock: &JsValue) -> RuntimeResult<Vec<JsValue>> {
        self.mock_state(mock).map(|state| state.results.clone())
    }

    fn mock_state(&self, mock: &JsValue) -> RuntimeResult<&MockState> {
        let not_a_mock = || RuntimeError::invalid_operation("value is not a mock function");
        let handle = mock.as_object().ok_or_else(not_a_mock)?;
        self.sandbox
            .heap()
            .get(handle)?
            .mock_state()
            .ok_or_else(not_a_mock)
    }

    pub(crate) fn into_events(mut self) -> Vec<LoaderEvent> {
        let modules = self.loader.registry.len();
        let test_path = self.loader.test_path.clone();
        self.loader.events.allow(
            COMPONENT_LOADER,
            "teardown",
            test_path,
            format!("modules={modules}"),
        );
        self.loader.events.into_events()
    }
}
