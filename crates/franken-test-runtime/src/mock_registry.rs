//! Per-context mock/real decision state.
//!
//! Two disjoint explicit sets sit in front of the automock default. Toggling
//! the default never touches the explicit sets. Materialized mock exports are
//! cached by the loader, not here; this registry only answers "mock or real"
//! and holds explicit factories.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigErrorCode, RuntimeConfig};
use crate::resolver::ModuleIdentity;
use crate::value::{Heap, JsValue};

/// Builds mock exports without running script code.
pub type NativeFactory = Arc<dyn Fn(&mut Heap) -> JsValue + Send + Sync>;

/// Explicit replacement for a module's mock exports.
#[derive(Clone)]
pub enum MockFactory {
    /// A script function; its return value becomes the exports.
    Script(JsValue),
    Native(NativeFactory),
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(value) => f.debug_tuple("Script").field(value).finish(),
            Self::Native(_) => f.write_str("Native(..)"),
        }
    }
}

/// Why `decide` answered the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ExplicitMock,
    ExplicitReal,
    NodeModuleManualMock,
    MappedModule,
    UnmockedPathPattern,
    AutomockDefault,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExplicitMock => "explicit_mock",
            Self::ExplicitReal => "explicit_real",
            Self::NodeModuleManualMock => "node_module_manual_mock",
            Self::MappedModule => "mapped_module",
            Self::UnmockedPathPattern => "unmocked_path_pattern",
            Self::AutomockDefault => "automock_default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockDecision {
    pub mock: bool,
    pub reason: DecisionReason,
}

/// Facts about a resolution that influence the default answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MockHints {
    /// The specifier was rewritten by a name-mapper rule.
    pub via_mapper: bool,
    /// A package under a module directory has a root-level manual mock.
    pub node_module_manual_mock: bool,
}

#[derive(Debug, Clone)]
pub struct MockRegistry {
    automock: bool,
    initial_automock: bool,
    automock_mapped_modules: bool,
    explicitly_mocked: BTreeSet<ModuleIdentity>,
    explicitly_real: BTreeSet<ModuleIdentity>,
    unmocked_patterns: Vec<Regex>,
    factories: BTreeMap<ModuleIdentity, MockFactory>,
}

impl MockRegistry {
    pub fn new(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        let unmocked_patterns = config
            .unmocked_module_path_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|error| {
                    ConfigError::new(
                        ConfigErrorCode::InvalidPattern,
                        format!("unmocked path pattern '{pattern}' is invalid: {error}"),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            automock: config.automock,
            initial_automock: config.automock,
            automock_mapped_modules: config.automock_mapped_modules,
            explicitly_mocked: BTreeSet::new(),
            explicitly_real: BTreeSet::new(),
            unmocked_patterns,
            factories: BTreeMap::new(),
        })
    }

    pub fn automock(&self) -> bool {
        self.automock
    }

    pub fn set_automock_default(&mut self, automock: bool) {
        self.automock = automock;
    }

    pub fn mark_always_mock(&mut self, identity: &ModuleIdentity) {
        self.explicitly_real.remove(identity);
        self.explicitly_mocked.insert(identity.clone());
    }

    pub fn mark_always_real(&mut self, identity: &ModuleIdentity) {
        self.explicitly_mocked.remove(identity);
        self.explicitly_real.insert(identity.clone());
    }

    pub fn clear_explicit_override(&mut self, identity: &ModuleIdentity) {
        self.explicitly_mocked.remove(identity);
        self.explicitly_real.remove(identity);
    }

    /// Drop every explicit override and restore the configured default.
    /// Factories survive.
    pub fn clear_all_overrides(&mut self) {
        self.explicitly_mocked.clear();
        self.explicitly_real.clear();
        self.automock = self.initial_automock;
    }

    pub fn is_explicitly_mocked(&self, identity: &ModuleIdentity) -> bool {
        self.explicitly_mocked.contains(identity)
    }

    pub fn is_explicitly_real(&self, identity: &ModuleIdentity) -> bool {
        self.explicitly_real.contains(identity)
    }

    pub fn set_factory(&mut self, identity: &ModuleIdentity, factory: MockFactory) {
        self.factories.insert(identity.clone(), factory);
    }

    pub fn factory(&self, identity: &ModuleIdentity) -> Option<&MockFactory> {
        self.factories.get(identity)
    }

    pub fn should_mock(&self, identity: &ModuleIdentity) -> bool {
        self.decide(identity, MockHints::default()).mock
    }

    pub fn decide(&self, identity: &ModuleIdentity, hints: MockHints) -> MockDecision {
        let (mock, reason) = if self.explicitly_mocked.contains(identity) {
            (true, DecisionReason::ExplicitMock)
        } else if self.explicitly_real.contains(identity) {
            (false, DecisionReason::ExplicitReal)
        } else if hints.node_module_manual_mock {
            (true, DecisionReason::NodeModuleManualMock)
        } else if !self.automock {
            (false, DecisionReason::AutomockDefault)
        } else if hints.via_mapper && !self.automock_mapped_modules {
            (false, DecisionReason::MappedModule)
        } else if self
            .unmocked_patterns
            .iter()
            .any(|pattern| pattern.is_match(identity.as_str()))
        {
            (false, DecisionReason::UnmockedPathPattern)
        } else {
            (true, DecisionReason::AutomockDefault)
        };
        MockDecision { mock, reason }
    }

    pub fn explicit_overrides(&self) -> usize {
        self.explicitly_mocked.len() + self.explicitly_real.len()
    }
}
