//! Filesystem seam used by the resolver and loader.
//!
//! Module identities are forward-slash absolute paths regardless of host
//! platform; `DiskModuleFs` converts at the boundary. `MemoryModuleFs` backs
//! most tests and embedders that ship module sources without a real tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Read-only view of a module tree.
pub trait ModuleFs: Send + Sync {
    fn is_file(&self, path: &str) -> bool;
    fn is_dir(&self, path: &str) -> bool;
    fn read_to_string(&self, path: &str) -> io::Result<String>;
}

/// In-memory module tree. Directories are implied by registered files.
#[derive(Debug, Clone, Default)]
pub struct MemoryModuleFs {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
}

impl MemoryModuleFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert(&mut self, path: &str, source: impl Into<String>) {
        let normalized = normalize_absolute_path(path);
        let mut dir = parent_directory(&normalized);
        loop {
            let fresh = self.dirs.insert(dir.clone());
            if !fresh || is_root(&dir) {
                break;
            }
            dir = parent_directory(&dir);
        }
        self.files.insert(normalized, source.into());
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ModuleFs for MemoryModuleFs {
    fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such module file: {path}"))
        })
    }
}

/// Host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskModuleFs;

impl DiskModuleFs {
    fn host_path(path: &str) -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(path.replace('/', "\\"))
        } else {
            PathBuf::from(path)
        }
    }
}

impl ModuleFs for DiskModuleFs {
    fn is_file(&self, path: &str) -> bool {
        Self::host_path(path).is_file()
    }

    fn is_dir(&self, path: &str) -> bool {
        Self::host_path(path).is_dir()
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(Self::host_path(path))
    }
}

/// Convert a host path into the forward-slash form used for identities.
pub fn identity_path_from_host(path: &std::path::Path) -> String {
    normalize_absolute_path(&path.to_string_lossy().replace('\\', "/"))
}

/// Split an optional `C:` drive prefix off an identity path.
fn split_drive(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return path.split_at(2);
    }
    ("", path)
}

fn is_root(path: &str) -> bool {
    split_drive(path).1 == "/"
}

pub fn normalize_absolute_path(path: &str) -> String {
    let (drive, rest) = split_drive(path);
    let mut stack: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            value => stack.push(value),
        }
    }

    if stack.is_empty() {
        return format!("{drive}/");
    }

    format!("{drive}/{}", stack.join("/"))
}

pub fn is_absolute_path(path: &str) -> bool {
    path.starts_with('/') || !split_drive(path).0.is_empty()
}

pub fn join_paths(base: &str, child: &str) -> String {
    if is_absolute_path(child) {
        return child.to_string();
    }

    if base.ends_with('/') {
        format!("{base}{child}")
    } else {
        format!("{base}/{child}")
    }
}

pub fn parent_directory(path: &str) -> String {
    let normalized = normalize_absolute_path(path);
    if is_root(&normalized) {
        return normalized;
    }

    let (drive, rest) = split_drive(&normalized);
    match rest.rfind('/') {
        Some(0) | None => format!("{drive}/"),
        Some(index) => format!("{drive}{}", &rest[..index]),
    }
}

/// Final path segment, e.g. `RegularModule.js`.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every ancestor directory of `dir`, innermost first, including `dir`.
pub fn ancestors(dir: &str) -> Vec<String> {
    let mut out = vec![normalize_absolute_path(dir)];
    loop {
        let Some(last) = out.last() else {
            break;
        };
        if is_root(last) {
            break;
        }
        let parent = parent_directory(last);
        out.push(parent);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(normalize_absolute_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_absolute_path("/../.."), "/");
        assert_eq!(normalize_absolute_path("C:/x/../y"), "C:/y");
    }

    #[test]
    fn parent_directory_stops_at_root() {
        assert_eq!(parent_directory("/a/b.js"), "/a");
        assert_eq!(parent_directory("/b.js"), "/");
        assert_eq!(parent_directory("/"), "/");
        assert_eq!(parent_directory("C:/b.js"), "C:/");
    }

    #[test]
    fn ancestors_walk_up_to_root() {
        assert_eq!(ancestors("/a/b"), vec!["/a/b", "/a", "/"]);
    }

    #[test]
    fn memory_fs_implies_parent_directories() {
        let fs = MemoryModuleFs::new().with_file("/root/pkg/lib/index.js", "x");
        assert!(fs.is_file("/root/pkg/lib/index.js"));
        assert!(fs.is_dir("/root/pkg/lib"));
        assert!(fs.is_dir("/root/pkg"));
        assert!(fs.is_dir("/"));
        assert!(!fs.is_file("/root/pkg/lib"));
    }

    #[test]
    fn memory_fs_read_missing_is_not_found() {
        let fs = MemoryModuleFs::new();
        let err = fs.read_to_string("/nope.js").expect_err("missing file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn disk_fs_reads_real_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("mod.js");
        std::fs::write(&file, "exports.a = 1;").expect("write");
        let identity = identity_path_from_host(&file);
        let fs = DiskModuleFs;
        assert!(fs.is_file(&identity));
        assert!(fs.is_dir(&parent_directory(&identity)));
        assert_eq!(fs.read_to_string(&identity).expect("read"), "exports.a = 1;");
    }
}
