//! Ordered specifier rewriting (`module_name_mapper`).
//!
//! Rules are compiled once per context. Mapping is a pure function of the raw
//! specifier: first matching rule wins, `$N` in the replacement is replaced by
//! capture group `N` of the match against the original specifier, and then
//! `<rootDir>` is expanded.

use regex::Regex;

use crate::config::{ConfigError, ConfigErrorCode, NameMapperRule, ROOT_DIR_TOKEN};

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    replacement: String,
}

/// Result of a successful mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedSpecifier {
    pub specifier: String,
    pub rule_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleNameMapper {
    rules: Vec<CompiledRule>,
    root_dir: String,
}

impl ModuleNameMapper {
    pub fn new(rules: &[NameMapperRule], root_dir: &str) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = Regex::new(&rule.pattern).map_err(|error| {
                ConfigError::new(
                    ConfigErrorCode::InvalidPattern,
                    format!("name mapper pattern '{}' is invalid: {error}", rule.pattern),
                )
            })?;
            compiled.push(CompiledRule {
                regex,
                replacement: rule.replacement.clone(),
            });
        }
        Ok(Self {
            rules: compiled,
            root_dir: root_dir.trim_end_matches('/').to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `Some` when a rule matched, `None` when the specifier passes through.
    pub fn try_map(&self, raw: &str) -> Option<MappedSpecifier> {
        self.rules.iter().enumerate().find_map(|(index, rule)| {
            let captures = rule.regex.captures(raw)?;
            let substituted = substitute_captures(&rule.replacement, &captures);
            Some(MappedSpecifier {
                specifier: substituted.replace(ROOT_DIR_TOKEN, &self.root_dir),
                rule_index: index,
            })
        })
    }

    pub fn map(&self, raw: &str) -> String {
        self.try_map(raw)
            .map(|mapped| mapped.specifier)
            .unwrap_or_else(|| raw.to_string())
    }
}

/// Replace `$N` references; unmatched or out-of-range groups become empty.
fn substitute_captures(template: &str, captures: &regex::Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'$' {
            let digits_start = index + 1;
            let mut digits_end = digits_start;
            while digits_end < bytes.len() && bytes[digits_end].is_ascii_digit() {
                digits_end += 1;
            }
            if digits_end > digits_start {
                if let Ok(group) = template[digits_start..digits_end].parse::<usize>()
                    && let Some(matched) = captures.get(group)
                {
                    out.push_str(matched.as_str());
                }
                index = digits_end;
                continue;
            }
        }
        let ch = template[index..].chars().next().unwrap_or('$');
        out.push(ch);
        index += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> ModuleNameMapper {
        ModuleNameMapper::new(
            &[
                NameMapperRule::new("^image![a-zA-Z0-9$_-]+$", "GlobalImageStub"),
                NameMapperRule::new(r"^[./a-zA-Z0-9$_-]+\.png$", "RelativeImageStub"),
                NameMapperRule::new("mappedToPath", "<rootDir>/GlobalImageStub.js"),
                NameMapperRule::new("module/name/(.*)", "<rootDir>/mapped_module_$1.js"),
            ],
            "/project/",
        )
        .expect("rules compile")
    }

    #[test]
    fn capture_groups_and_root_dir_are_substituted() {
        assert_eq!(
            mapper().map("module/name/test"),
            "/project/mapped_module_test.js"
        );
    }

    #[test]
    fn exact_pattern_maps_to_bare_name() {
        let mapped = mapper()
            .try_map("image!not-really-a-module")
            .expect("should match");
        assert_eq!(mapped.specifier, "GlobalImageStub");
        assert_eq!(mapped.rule_index, 0);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mapper = ModuleNameMapper::new(
            &[
                NameMapperRule::new("^dup$", "first"),
                NameMapperRule::new("^d", "second"),
            ],
            "/",
        )
        .expect("rules compile");
        assert_eq!(mapper.map("dup"), "first");
        assert_eq!(mapper.map("door"), "second");
    }

    #[test]
    fn unmatched_specifier_passes_through() {
        assert_eq!(mapper().map("./RegularModule"), "./RegularModule");
        assert!(mapper().try_map("lodash").is_none());
    }

    #[test]
    fn mapping_is_independent_of_history() {
        let mapper = mapper();
        let first = mapper.map("../photos/dog.png");
        mapper.map("module/name/other");
        assert_eq!(mapper.map("../photos/dog.png"), first);
        assert_eq!(first, "RelativeImageStub");
    }

    #[test]
    fn missing_group_is_empty_and_literal_dollar_survives() {
        let mapper = ModuleNameMapper::new(
            &[NameMapperRule::new("^a(b)?$", "x$2y$1z$")],
            "/",
        )
        .expect("rules compile");
        assert_eq!(mapper.map("ab"), "xybz$");
        assert_eq!(mapper.map("a"), "xyz$");
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = ModuleNameMapper::new(&[NameMapperRule::new("[", "x")], "/")
            .expect_err("invalid regex");
        assert_eq!(err.code, ConfigErrorCode::InvalidPattern);
    }
}
