//! Runtime configuration consumed by every execution context.
//!
//! The config loader that discovers and merges project settings lives outside
//! this crate; it hands over a `RuntimeConfig` (or JSON text for one) and the
//! value is treated as immutable for the lifetime of each context.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stack_trace::PathStyle;

/// Token expanded to `RuntimeConfig::root_dir` inside mapper replacements.
pub const ROOT_DIR_TOKEN: &str = "<rootDir>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMapperRule {
    pub pattern: String,
    pub replacement: String,
}

impl NameMapperRule {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

/// Lifetime of explicit `mock`/`unmock` overrides within one test file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    #[default]
    PersistForFile,
    ResetPerTestCase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub root_dir: String,
    /// Extra lookup roots for bare specifiers; empty means `[root_dir]`.
    pub roots: Vec<String>,
    pub automock: bool,
    pub module_name_mapper: Vec<NameMapperRule>,
    pub mocks_dir_name: String,
    pub module_file_extensions: Vec<String>,
    pub module_directories: Vec<String>,
    pub unmocked_module_path_patterns: Vec<String>,
    pub automock_mapped_modules: bool,
    pub override_policy: OverridePolicy,
    /// `None` picks the host convention.
    pub stack_path_style: Option<PathStyle>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: "/".to_string(),
            roots: Vec::new(),
            automock: true,
            module_name_mapper: Vec::new(),
            mocks_dir_name: "__mocks__".to_string(),
            module_file_extensions: vec!["js".to_string(), "json".to_string()],
            module_directories: vec!["node_modules".to_string()],
            unmocked_module_path_patterns: Vec::new(),
            automock_mapped_modules: false,
            override_policy: OverridePolicy::PersistForFile,
            stack_path_style: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new(root_dir: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_automock(mut self, automock: bool) -> Self {
        self.automock = automock;
        self
    }

    pub fn with_name_mapping(
        mut self,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        self.module_name_mapper
            .push(NameMapperRule::new(pattern, replacement));
        self
    }

    pub fn with_unmocked_path_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.unmocked_module_path_patterns.push(pattern.into());
        self
    }

    pub fn with_override_policy(mut self, policy: OverridePolicy) -> Self {
        self.override_policy = policy;
        self
    }

    pub fn with_stack_path_style(mut self, style: PathStyle) -> Self {
        self.stack_path_style = Some(style);
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|error| {
            ConfigError::new(
                ConfigErrorCode::MalformedJson,
                format!("runtime config is not valid JSON: {error}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crate::fs::is_absolute_path(&self.root_dir) {
            return Err(ConfigError::new(
                ConfigErrorCode::RelativeRootDir,
                format!("root_dir must be absolute, got '{}'", self.root_dir),
            ));
        }
        if self.mocks_dir_name.trim().is_empty() || self.mocks_dir_name.contains('/') {
            return Err(ConfigError::new(
                ConfigErrorCode::InvalidMocksDir,
                format!(
                    "mocks_dir_name must be a single path segment, got '{}'",
                    self.mocks_dir_name
                ),
            ));
        }
        for pattern in self
            .module_name_mapper
            .iter()
            .map(|rule| rule.pattern.as_str())
            .chain(self.unmocked_module_path_patterns.iter().map(String::as_str))
        {
            if let Err(error) = regex::Regex::new(pattern) {
                return Err(ConfigError::new(
                    ConfigErrorCode::InvalidPattern,
                    format!("pattern '{pattern}' does not compile: {error}"),
                ));
            }
        }
        Ok(())
    }

    /// Lookup roots for bare specifiers, normalized.
    pub fn lookup_roots(&self) -> Vec<String> {
        let raw = if self.roots.is_empty() {
            vec![self.root_dir.clone()]
        } else {
            self.roots
                .iter()
                .map(|root| root.replace(ROOT_DIR_TOKEN, &self.root_dir))
                .collect()
        };
        raw.iter()
            .map(|root| crate::fs::normalize_absolute_path(root))
            .collect()
    }

    pub fn path_style(&self) -> PathStyle {
        self.stack_path_style.unwrap_or_else(PathStyle::host)
    }

    pub fn apply(&self, overrides: &ConfigOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(automock) = overrides.automock {
            merged.automock = automock;
        }
        if let Some(rules) = &overrides.module_name_mapper {
            merged.module_name_mapper = rules.clone();
        }
        if let Some(policy) = overrides.override_policy {
            merged.override_policy = policy;
        }
        if let Some(style) = overrides.stack_path_style {
            merged.stack_path_style = Some(style);
        }
        merged
    }
}

/// Per-test-file adjustments supplied by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigOverrides {
    pub automock: Option<bool>,
    pub module_name_mapper: Option<Vec<NameMapperRule>>,
    pub override_policy: Option<OverridePolicy>,
    pub stack_path_style: Option<PathStyle>,
}

impl ConfigOverrides {
    pub fn automock(mut self, automock: bool) -> Self {
        self.automock = Some(automock);
        self
    }

    pub fn name_mapper(mut self, rules: Vec<NameMapperRule>) -> Self {
        self.module_name_mapper = Some(rules);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigErrorCode {
    MalformedJson,
    RelativeRootDir,
    InvalidMocksDir,
    InvalidPattern,
}

impl ConfigErrorCode {
    pub fn stable_code(self) -> &'static str {
        match self {
            Self::MalformedJson => "FE-CFG-0001",
            Self::RelativeRootDir => "FE-CFG-0002",
            Self::InvalidMocksDir => "FE-CFG-0003",
            Self::InvalidPattern => "FE-CFG-0004",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigError {
    pub code: ConfigErrorCode,
    pub message: String,
}

impl ConfigError {
    pub(crate) fn new(code: ConfigErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.stable_code(), self.message)
    }
}

impl std::error::Error for ConfigError {}
