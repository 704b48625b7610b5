//! Stack capture and normalization.
//!
//! The sandbox records `RawFrame`s in wrapped-source coordinates, labelled
//! with the script they ran in. Normalization drops frames from scripts that
//! were never registered as user modules (loader glue), undoes the wrapper
//! preamble offset and renders paths with the configured separator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::Position;

/// Label used for frames belonging to loader machinery.
pub const LOADER_SCRIPT_LABEL: &str = "<loader>";

/// Path separator convention used when rendering frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStyle {
    Posix,
    Windows,
}

impl PathStyle {
    /// Convention of the platform this binary was built for.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }

    /// Render a forward-slash identity path in this convention.
    pub fn render_path(self, path: &str) -> String {
        match self {
            Self::Posix => path.to_string(),
            Self::Windows => path.replace('/', "\\"),
        }
    }
}

/// A frame as captured by the sandbox, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub function_name: String,
    pub script: Arc<str>,
    pub position: Position,
}

/// Offset introduced by wrapping a module body in a function preamble.
///
/// The preamble shares the first line with the authored source, so only
/// columns on the first line shift; `extra_lines` covers preambles that end
/// in a newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WrapperLayout {
    pub extra_lines: u32,
    pub first_line_columns: u32,
}

impl WrapperLayout {
    pub fn for_prefix(prefix: &str) -> Self {
        let extra_lines = prefix.matches('\n').count() as u32;
        let tail = prefix.rsplit('\n').next().unwrap_or(prefix);
        Self {
            extra_lines,
            first_line_columns: tail.chars().count() as u32,
        }
    }

    /// Map a wrapped-source position back to authored coordinates. `None`
    /// for positions inside the preamble itself.
    pub fn to_authored(&self, position: Position) -> Option<Position> {
        if position.line <= self.extra_lines {
            return None;
        }
        let line = position.line - self.extra_lines;
        if line == 1 {
            if position.column <= self.first_line_columns {
                return None;
            }
            return Some(Position::new(1, position.column - self.first_line_columns));
        }
        Some(Position::new(line, position.column))
    }
}

/// One normalized frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function_name: String,
    pub file: String,
    pub position: Option<Position>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match self.position {
            Some(pos) => format!("{}:{}:{}", self.file, pos.line, pos.column),
            None => self.file.clone(),
        };
        if self.function_name.is_empty() {
            write!(f, "    at {location}")
        } else {
            write!(f, "    at {} ({location})", self.function_name)
        }
    }
}

/// Registered user scripts plus the rendering convention.
#[derive(Debug, Clone)]
pub struct StackNormalizer {
    style: PathStyle,
    scripts: BTreeMap<Arc<str>, WrapperLayout>,
}

impl StackNormalizer {
    pub fn new(style: PathStyle) -> Self {
        Self {
            style,
            scripts: BTreeMap::new(),
        }
    }

    pub fn style(&self) -> PathStyle {
        self.style
    }

    pub fn register_script(&mut self, script: Arc<str>, layout: WrapperLayout) {
        self.scripts.insert(script, layout);
    }

    pub fn is_user_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }

    /// Rewrite `raw` (innermost first). Frames from unregistered scripts
    /// are elided. When nothing survives and the executing module is known,
    /// a position-less frame for that module is emitted instead.
    pub fn normalize(&self, raw: &[RawFrame], executing: Option<&str>) -> Vec<StackFrame> {
        let mut frames: Vec<StackFrame> = raw
            .iter()
            .filter_map(|frame| {
                let layout = self.scripts.get(frame.script.as_ref())?;
                Some(StackFrame {
                    function_name: frame.function_name.clone(),
                    file: self.style.render_path(&frame.script),
                    position: layout.to_authored(frame.position),
                })
            })
            .collect();
        if frames.is_empty()
            && let Some(module) = executing
        {
            frames.push(StackFrame {
                function_name: "Object.<anonymous>".to_string(),
                file: self.style.render_path(module),
                position: None,
            });
        }
        frames
    }

    /// `Name: message` followed by one `    at` line per frame.
    pub fn render(&self, name: &str, message: &str, frames: &[StackFrame]) -> String {
        let mut out = if message.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {message}")
        };
        for frame in frames {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "(function(module){";

    fn frame(name: &str, script: &str, line: u32, column: u32) -> RawFrame {
        RawFrame {
            function_name: name.to_string(),
            script: Arc::from(script),
            position: Position::new(line, column),
        }
    }

    fn normalizer(style: PathStyle) -> StackNormalizer {
        let mut normalizer = StackNormalizer::new(style);
        normalizer.register_script(Arc::from("/root/a.js"), WrapperLayout::for_prefix(PREFIX));
        normalizer
    }

    #[test]
    fn first_line_columns_shift_by_preamble_width() {
        let layout = WrapperLayout::for_prefix(PREFIX);
        assert_eq!(
            layout.to_authored(Position::new(1, 19)),
            Some(Position::new(1, 1))
        );
        assert_eq!(
            layout.to_authored(Position::new(12, 9)),
            Some(Position::new(12, 9))
        );
        assert_eq!(layout.to_authored(Position::new(1, 3)), None);
    }

    #[test]
    fn raw_frames_serialize_with_shared_script_labels() {
        let raw = frame("sum", "/root/a.js", 12, 9);
        let json = serde_json::to_value(&raw).expect("serialize");
        assert_eq!(json["script"], "/root/a.js");
        let back: RawFrame = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, raw);
    }

    #[test]
    fn multi_line_preamble_shifts_lines() {
        let layout = WrapperLayout::for_prefix("(function(){\n");
        assert_eq!(
            layout.to_authored(Position::new(2, 4)),
            Some(Position::new(1, 4))
        );
        assert_eq!(layout.to_authored(Position::new(1, 4)), None);
    }

    #[test]
    fn loader_frames_are_elided() {
        let raw = vec![
            frame("sum", "/root/a.js", 12, 9),
            frame("requireModule", LOADER_SCRIPT_LABEL, 1, 1),
            frame("Object.<anonymous>", "/root/a.js", 1, 20),
        ];
        let frames = normalizer(PathStyle::Posix).normalize(&raw, None);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].to_string(), "    at sum (/root/a.js:12:9)");
        assert_eq!(
            frames[1].to_string(),
            "    at Object.<anonymous> (/root/a.js:1:2)"
        );
    }

    #[test]
    fn windows_style_uses_backslashes() {
        let raw = vec![frame("sum", "/root/a.js", 12, 9)];
        let normalizer = normalizer(PathStyle::Windows);
        let frames = normalizer.normalize(&raw, None);
        assert_eq!(
            normalizer.render("Error", "throwing fn", &frames),
            "Error: throwing fn\n    at sum (\\root\\a.js:12:9)"
        );
    }

    #[test]
    fn executing_module_fills_an_empty_stack() {
        let raw = vec![frame("glue", LOADER_SCRIPT_LABEL, 1, 1)];
        let frames = normalizer(PathStyle::Posix).normalize(&raw, Some("/root/b.js"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_string(), "    at Object.<anonymous> (/root/b.js)");
    }

    #[test]
    fn anonymous_frames_render_location_only() {
        let raw = vec![frame("", "/root/a.js", 3, 4)];
        let frames = normalizer(PathStyle::Posix).normalize(&raw, None);
        assert_eq!(frames[0].to_string(), "    at /root/a.js:3:4");
    }
}
