//! Specifier resolution for one execution context.
//!
//! `require(specifier)` is resolved against the requiring module's directory
//! after the name mapper has had a chance to rewrite it. Relative and
//! absolute specifiers probe the filesystem directly; bare names try
//! registered virtual modules, then `module_directories` walking up from the
//! requester, then each lookup root. Results are memoized per
//! `(requesting_dir, specifier)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, RuntimeConfig};
use crate::fs::{
    ModuleFs, ancestors, file_name, is_absolute_path, join_paths, normalize_absolute_path,
    parent_directory,
};
use crate::name_mapper::ModuleNameMapper;

pub type ResolutionResult<T> = Result<T, ResolutionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    File,
    /// Registered through a mock factory with no backing file.
    Virtual,
    /// A root-level manual mock with no real module behind it.
    MockOnly,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Virtual => "virtual",
            Self::MockOnly => "mock_only",
        }
    }
}

/// Canonical key for a module within a context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleIdentity {
    pub kind: IdentityKind,
    /// Forward-slash absolute path, or the bare name of a virtual module.
    pub path: String,
}

impl ModuleIdentity {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::File,
            path: path.into(),
        }
    }

    pub fn virtual_module(key: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Virtual,
            path: key.into(),
        }
    }

    pub fn mock_only(path: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::MockOnly,
            path: path.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn is_json(&self) -> bool {
        self.kind != IdentityKind::Virtual && self.path.ends_with(".json")
    }

    /// Directory that relative requires from this module resolve against.
    pub fn directory(&self, fallback: &str) -> String {
        if is_absolute_path(&self.path) {
            parent_directory(&self.path)
        } else {
            fallback.to_string()
        }
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// A resolved specifier plus how it was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub identity: ModuleIdentity,
    /// Index of the name-mapper rule that rewrote the specifier, if any.
    pub mapper_rule: Option<usize>,
}

impl Resolution {
    pub fn via_mapper(&self) -> bool {
        self.mapper_rule.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionErrorCode {
    EmptySpecifier,
    InvalidReferrer,
    ModuleNotFound,
    MappedModuleNotFound,
}

impl ResolutionErrorCode {
    pub fn stable_code(self) -> &'static str {
        match self {
            Self::EmptySpecifier => "FE-MODRES-0001",
            Self::InvalidReferrer => "FE-MODRES-0002",
            Self::ModuleNotFound => "FE-MODRES-0003",
            Self::MappedModuleNotFound => "FE-MODRES-0004",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionError {
    pub code: ResolutionErrorCode,
    pub message: String,
    pub specifier: String,
    pub requesting_dir: String,
    pub trace_id: String,
}

impl ResolutionError {
    fn new(
        code: ResolutionErrorCode,
        message: impl Into<String>,
        specifier: &str,
        requesting_dir: &str,
        trace_id: &str,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            specifier: specifier.to_string(),
            requesting_dir: requesting_dir.to_string(),
            trace_id: trace_id.to_string(),
        }
    }
}

impl ResolutionError {
    /// Not-found for an identity that resolved but has no real module.
    pub(crate) fn module_not_found(specifier: &str, requesting_dir: &str, trace_id: &str) -> Self {
        Self::new(
            ResolutionErrorCode::ModuleNotFound,
            format!("cannot find module '{specifier}'"),
            specifier,
            requesting_dir,
            trace_id,
        )
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (specifier={}, from={}, trace_id={})",
            self.code.stable_code(),
            self.message,
            self.specifier,
            self.requesting_dir,
            self.trace_id
        )
    }
}

impl std::error::Error for ResolutionError {}

pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

pub struct ModuleResolver {
    fs: Arc<dyn ModuleFs>,
    mapper: ModuleNameMapper,
    root_dir: String,
    roots: Vec<String>,
    extensions: Vec<String>,
    module_directories: Vec<String>,
    mocks_dir_name: String,
    virtual_modules: BTreeSet<String>,
    memo: BTreeMap<(String, String), Resolution>,
    trace_id: String,
}

impl fmt::Debug for ModuleResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleResolver")
            .field("root_dir", &self.root_dir)
            .field("roots", &self.roots)
            .field("mapper_rules", &self.mapper.len())
            .field("virtual_modules", &self.virtual_modules)
            .field("memoized", &self.memo.len())
            .finish()
    }
}

impl ModuleResolver {
    pub fn new(
        config: &RuntimeConfig,
        fs: Arc<dyn ModuleFs>,
        trace_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let root_dir = normalize_absolute_path(&config.root_dir);
        Ok(Self {
            fs,
            mapper: ModuleNameMapper::new(&config.module_name_mapper, &root_dir)?,
            roots: config.lookup_roots(),
            root_dir,
            extensions: config.module_file_extensions.clone(),
            module_directories: config.module_directories.clone(),
            mocks_dir_name: config.mocks_dir_name.clone(),
            virtual_modules: BTreeSet::new(),
            memo: BTreeMap::new(),
            trace_id: trace_id.into(),
        })
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    pub fn fs(&self) -> &Arc<dyn ModuleFs> {
        &self.fs
    }

    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    pub fn clear_memo(&mut self) {
        self.memo.clear();
    }

    /// Key a virtual module registered from `requesting_dir` would use.
    pub fn virtual_key(&self, requesting_dir: &str, specifier: &str) -> String {
        if is_relative_specifier(specifier) || is_absolute_path(specifier) {
            normalize_absolute_path(&join_paths(requesting_dir, specifier))
        } else {
            specifier.to_string()
        }
    }

    /// Make `specifier` resolvable without a backing file.
    pub fn register_virtual(&mut self, requesting_dir: &str, specifier: &str) -> ModuleIdentity {
        let key = self.virtual_key(requesting_dir, specifier);
        if self.virtual_modules.insert(key.clone()) {
            self.memo.clear();
        }
        ModuleIdentity::virtual_module(key)
    }

    pub fn resolve(
        &mut self,
        requesting_dir: &str,
        specifier: &str,
    ) -> ResolutionResult<Resolution> {
        let memo_key = (requesting_dir.to_string(), specifier.to_string());
        if let Some(hit) = self.memo.get(&memo_key) {
            return Ok(hit.clone());
        }
        let resolution = self.resolve_uncached(requesting_dir, specifier)?;
        self.memo.insert(memo_key, resolution.clone());
        Ok(resolution)
    }

    fn resolve_uncached(
        &self,
        requesting_dir: &str,
        specifier: &str,
    ) -> ResolutionResult<Resolution> {
        if specifier.trim().is_empty() {
            return Err(self.error(
                ResolutionErrorCode::EmptySpecifier,
                "module specifier must not be empty",
                specifier,
                requesting_dir,
            ));
        }
        if !is_absolute_path(requesting_dir) {
            return Err(self.error(
                ResolutionErrorCode::InvalidReferrer,
                format!("requesting directory '{requesting_dir}' is not absolute"),
                specifier,
                requesting_dir,
            ));
        }

        if let Some(mapped) = self.mapper.try_map(specifier) {
            return match self.locate(requesting_dir, &mapped.specifier) {
                Some(identity) => Ok(Resolution {
                    identity,
                    mapper_rule: Some(mapped.rule_index),
                }),
                None => Err(self.error(
                    ResolutionErrorCode::MappedModuleNotFound,
                    format!(
                        "could not locate module '{specifier}' mapped as '{}'",
                        mapped.specifier
                    ),
                    specifier,
                    requesting_dir,
                )),
            };
        }

        if let Some(identity) = self.locate(requesting_dir, specifier) {
            return Ok(Resolution {
                identity,
                mapper_rule: None,
            });
        }
        if !is_relative_specifier(specifier)
            && !is_absolute_path(specifier)
            && let Some(mock) = self.root_manual_mock(specifier)
        {
            return Ok(Resolution {
                identity: ModuleIdentity::mock_only(mock),
                mapper_rule: None,
            });
        }
        Err(self.error(
            ResolutionErrorCode::ModuleNotFound,
            format!("cannot find module '{specifier}'"),
            specifier,
            requesting_dir,
        ))
    }

    fn locate(&self, requesting_dir: &str, specifier: &str) -> Option<ModuleIdentity> {
        if is_relative_specifier(specifier) || is_absolute_path(specifier) {
            let base = normalize_absolute_path(&join_paths(requesting_dir, specifier));
            if self.virtual_modules.contains(&base) {
                return Some(ModuleIdentity::virtual_module(base));
            }
            return self.probe(&base).map(ModuleIdentity::file);
        }

        if self.virtual_modules.contains(specifier) {
            return Some(ModuleIdentity::virtual_module(specifier));
        }
        for dir in ancestors(requesting_dir) {
            for module_dir in &self.module_directories {
                let base = join_paths(&join_paths(&dir, module_dir), specifier);
                if let Some(found) = self.probe(&normalize_absolute_path(&base)) {
                    return Some(ModuleIdentity::file(found));
                }
            }
        }
        self.roots.iter().find_map(|root| {
            let base = normalize_absolute_path(&join_paths(root, specifier));
            self.probe(&base).map(ModuleIdentity::file)
        })
    }

    /// Exact file, file plus extension, `package.json` main, then index.
    fn probe(&self, base: &str) -> Option<String> {
        if let Some(found) = self.probe_file(base) {
            return Some(found);
        }
        if !self.fs.is_dir(base) {
            return None;
        }
        if let Some(main) = self.package_main(base) {
            let target = normalize_absolute_path(&join_paths(base, &main));
            if let Some(found) = self
                .probe_file(&target)
                .or_else(|| self.probe_index(&target))
            {
                return Some(found);
            }
        }
        self.probe_index(base)
    }

    fn probe_file(&self, base: &str) -> Option<String> {
        if self.fs.is_file(base) {
            return Some(base.to_string());
        }
        self.extensions
            .iter()
            .map(|ext| format!("{base}.{ext}"))
            .find(|candidate| self.fs.is_file(candidate))
    }

    fn probe_index(&self, dir: &str) -> Option<String> {
        let index = join_paths(dir, "index");
        self.extensions
            .iter()
            .map(|ext| format!("{index}.{ext}"))
            .find(|candidate| self.fs.is_file(candidate))
    }

    fn package_main(&self, dir: &str) -> Option<String> {
        let manifest = join_paths(dir, "package.json");
        if !self.fs.is_file(&manifest) {
            return None;
        }
        let text = self.fs.read_to_string(&manifest).ok()?;
        let parsed: serde_json::Value = serde_json::from_str(&text).ok()?;
        parsed
            .get("main")
            .and_then(serde_json::Value::as_str)
            .filter(|main| !main.trim().is_empty())
            .map(str::to_string)
    }

    fn root_manual_mock(&self, name: &str) -> Option<String> {
        let mocks_root = join_paths(&self.root_dir, &self.mocks_dir_name);
        let base = normalize_absolute_path(&join_paths(&mocks_root, name));
        self.probe_file(&base).or_else(|| self.probe_index(&base))
    }

    /// Manual mock for a resolved module. Files inside a module directory
    /// look in `<root>/__mocks__` under their package name; every file also
    /// checks the sibling `__mocks__` directory for a file of the same name.
    /// Only the identity is consulted, so every spelling that resolves to
    /// the same file gets the same mock.
    pub fn manual_mock_for(&self, identity: &ModuleIdentity) -> Option<String> {
        match identity.kind {
            IdentityKind::MockOnly => return Some(identity.path.clone()),
            IdentityKind::Virtual => return None,
            IdentityKind::File => {}
        }
        if let Some(found) = self.package_manual_mock(identity) {
            return Some(found);
        }
        let dir = parent_directory(&identity.path);
        if file_name(&dir) == self.mocks_dir_name {
            return None;
        }
        let sibling = join_paths(
            &join_paths(&dir, &self.mocks_dir_name),
            file_name(&identity.path),
        );
        self.fs.is_file(&sibling).then_some(sibling)
    }

    /// Root manual mock for a file inside a module directory: the package
    /// name when the file is the package entry point, else the package
    /// subpath without its extension.
    pub fn package_manual_mock(&self, identity: &ModuleIdentity) -> Option<String> {
        if identity.kind != IdentityKind::File {
            return None;
        }
        let path = identity.path.as_str();
        let start = self
            .module_directories
            .iter()
            .filter_map(|dir| {
                let marker = format!("/{dir}/");
                path.rfind(&marker).map(|at| at + marker.len())
            })
            .max()?;
        let rest = &path[start..];
        let mut segments = rest.split('/');
        let first = segments.next().filter(|segment| !segment.is_empty())?;
        let name = match segments.next() {
            Some(scoped) if first.starts_with('@') => format!("{first}/{scoped}"),
            _ => first.to_string(),
        };
        let package_dir = format!("{}{name}", &path[..start]);
        if self.probe(&package_dir).as_deref() == Some(path)
            && let Some(found) = self.root_manual_mock(&name)
        {
            return Some(found);
        }
        let subpath = self
            .extensions
            .iter()
            .find_map(|ext| rest.strip_suffix(&format!(".{ext}")))
            .unwrap_or(rest);
        self.root_manual_mock(subpath)
    }

    fn error(
        &self,
        code: ResolutionErrorCode,
        message: impl Into<String>,
        specifier: &str,
        requesting_dir: &str,
    ) -> ResolutionError {
        ResolutionError::new(code, message, specifier, requesting_dir, &self.trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryModuleFs;

    fn tree() -> MemoryModuleFs {
        MemoryModuleFs::new()
            .with_file("/root/RegularModule.js", "exports.a = 1")
            .with_file("/root/lib/helper.js", "")
            .with_file("/root/lib/data.json", "{}")
            .with_file("/root/MyDirectoryModule/index.js", "")
            .with_file("/root/pkg/package.json", r#"{"main": "./dist/main"}"#)
            .with_file("/root/pkg/dist/main.js", "")
            .with_file("/root/node_modules/left-pad/index.js", "")
            .with_file("/root/lib/node_modules/left-pad/index.js", "")
            .with_file("/root/node_modules/@scope/ui/lib/button.js", "")
            .with_file("/root/__mocks__/fs-extra.js", "")
            .with_file("/root/__mocks__/left-pad.js", "")
            .with_file("/root/__mocks__/@scope/ui/lib/button.js", "")
            .with_file("/root/__mocks__/RegularModule.js", "")
            .with_file("/root/lib/__mocks__/helper.js", "")
            .with_file("/root/mapped_module_foo.js", "")
    }

    fn resolver(config: RuntimeConfig) -> ModuleResolver {
        ModuleResolver::new(&config, Arc::new(tree()), "trace-resolver").expect("resolver")
    }

    fn default_resolver() -> ModuleResolver {
        resolver(RuntimeConfig::new("/root"))
    }

    fn path_of(resolver: &mut ModuleResolver, from: &str, specifier: &str) -> String {
        resolver
            .resolve(from, specifier)
            .expect("resolve")
            .identity
            .path
    }

    #[test]
    fn relative_specifiers_probe_extensions_and_index() {
        let mut r = default_resolver();
        assert_eq!(path_of(&mut r, "/root", "./RegularModule"), "/root/RegularModule.js");
        assert_eq!(path_of(&mut r, "/root/lib", "../RegularModule.js"), "/root/RegularModule.js");
        assert_eq!(path_of(&mut r, "/root/lib", "./data"), "/root/lib/data.json");
        assert_eq!(
            path_of(&mut r, "/root", "./MyDirectoryModule"),
            "/root/MyDirectoryModule/index.js"
        );
    }

    #[test]
    fn package_main_wins_over_index() {
        let mut r = default_resolver();
        assert_eq!(path_of(&mut r, "/root", "./pkg"), "/root/pkg/dist/main.js");
    }

    #[test]
    fn bare_names_walk_module_directories_innermost_first() {
        let mut r = default_resolver();
        assert_eq!(
            path_of(&mut r, "/root/lib", "left-pad"),
            "/root/lib/node_modules/left-pad/index.js"
        );
        assert_eq!(
            path_of(&mut r, "/root", "left-pad"),
            "/root/node_modules/left-pad/index.js"
        );
        assert_eq!(path_of(&mut r, "/root/lib", "RegularModule"), "/root/RegularModule.js");
    }

    #[test]
    fn missing_module_reports_specifier_and_requester() {
        let mut r = default_resolver();
        let err = r.resolve("/root/lib", "./nope").expect_err("missing");
        assert_eq!(err.code, ResolutionErrorCode::ModuleNotFound);
        assert_eq!(err.specifier, "./nope");
        assert_eq!(err.requesting_dir, "/root/lib");
        assert!(err.to_string().starts_with("FE-MODRES-0003: cannot find module './nope'"));
    }

    #[test]
    fn empty_specifier_and_relative_requester_are_rejected() {
        let mut r = default_resolver();
        assert_eq!(
            r.resolve("/root", "  ").expect_err("empty").code,
            ResolutionErrorCode::EmptySpecifier
        );
        assert_eq!(
            r.resolve("root", "./x").expect_err("relative").code,
            ResolutionErrorCode::InvalidReferrer
        );
    }

    #[test]
    fn mapper_rules_apply_before_lookup() {
        let config = RuntimeConfig::new("/root")
            .with_name_mapping("module/name/(.*)", "<rootDir>/mapped_module_$1.js")
            .with_name_mapping("^missing$", "<rootDir>/not-there.js");
        let mut r = resolver(config);
        let resolution = r.resolve("/root/lib", "module/name/foo").expect("mapped");
        assert_eq!(resolution.identity.path, "/root/mapped_module_foo.js");
        assert_eq!(resolution.mapper_rule, Some(0));
        assert!(resolution.via_mapper());

        let err = r.resolve("/root", "missing").expect_err("mapped missing");
        assert_eq!(err.code, ResolutionErrorCode::MappedModuleNotFound);
    }

    #[test]
    fn resolutions_are_memoized_per_requester() {
        let mut r = default_resolver();
        r.resolve("/root", "./RegularModule").expect("first");
        r.resolve("/root", "./RegularModule").expect("second");
        assert_eq!(r.memoized(), 1);
        r.resolve("/root/lib", "../RegularModule").expect("other requester");
        assert_eq!(r.memoized(), 2);
    }

    #[test]
    fn virtual_modules_resolve_without_files() {
        let mut r = default_resolver();
        assert!(r.resolve("/root", "virtual-thing").is_err());
        let identity = r.register_virtual("/root", "virtual-thing");
        assert_eq!(identity.kind, IdentityKind::Virtual);
        let resolution = r.resolve("/root", "virtual-thing").expect("virtual");
        assert_eq!(resolution.identity, identity);

        let relative = r.register_virtual("/root/lib", "./ghost");
        assert_eq!(relative.path, "/root/lib/ghost");
        assert_eq!(
            r.resolve("/root/lib", "./ghost").expect("relative virtual").identity,
            relative
        );
    }

    #[test]
    fn root_manual_mock_without_real_module_is_mock_only() {
        let mut r = default_resolver();
        let resolution = r.resolve("/root/lib", "fs-extra").expect("mock only");
        assert_eq!(resolution.identity.kind, IdentityKind::MockOnly);
        assert_eq!(resolution.identity.path, "/root/__mocks__/fs-extra.js");
    }

    #[test]
    fn manual_mocks_are_found_for_bare_and_sibling_lookups() {
        let mut r = default_resolver();
        let regular = r.resolve("/root", "RegularModule").expect("regular").identity;
        assert_eq!(
            r.manual_mock_for(&regular).as_deref(),
            Some("/root/__mocks__/RegularModule.js")
        );
        let helper = r.resolve("/root", "./lib/helper").expect("helper").identity;
        assert_eq!(
            r.manual_mock_for(&helper).as_deref(),
            Some("/root/lib/__mocks__/helper.js")
        );
        let data = r.resolve("/root/lib", "./data").expect("data").identity;
        assert_eq!(r.manual_mock_for(&data), None);
    }

    #[test]
    fn package_manual_mocks_do_not_depend_on_spelling() {
        let mut r = default_resolver();
        for specifier in [
            "left-pad",
            "./node_modules/left-pad",
            "/root/node_modules/left-pad/index.js",
        ] {
            let identity = r.resolve("/root", specifier).expect("left-pad").identity;
            assert_eq!(identity.path, "/root/node_modules/left-pad/index.js");
            assert_eq!(
                r.manual_mock_for(&identity).as_deref(),
                Some("/root/__mocks__/left-pad.js"),
                "{specifier}"
            );
        }

        let nested = r.resolve("/root/lib", "left-pad").expect("nested").identity;
        assert_eq!(nested.path, "/root/lib/node_modules/left-pad/index.js");
        assert_eq!(
            r.package_manual_mock(&nested).as_deref(),
            Some("/root/__mocks__/left-pad.js")
        );

        let button = r
            .resolve("/root", "@scope/ui/lib/button")
            .expect("scoped")
            .identity;
        assert_eq!(
            r.manual_mock_for(&button).as_deref(),
            Some("/root/__mocks__/@scope/ui/lib/button.js")
        );
        let regular = regular_identity(&mut r);
        assert_eq!(r.package_manual_mock(&regular), None);
    }

    fn regular_identity(r: &mut ModuleResolver) -> ModuleIdentity {
        r.resolve("/root", "./RegularModule").expect("regular").identity
    }
}
