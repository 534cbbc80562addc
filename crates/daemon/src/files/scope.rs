//! Root-confined path resolution.
//!
//! Clients address files with virtual paths where `/` is the served root.
//! Every path is normalized and has its symlinks resolved before the bounds
//! check, so no input can name a location outside the root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A path that cannot be served.
#[derive(Debug, Error)]
pub enum AccessScopeError {
    /// The path climbs above the root with `..`.
    #[error("path escapes the served root: {0}")]
    Escape(String),

    /// A symlink along the path points outside the root.
    #[error("symlink points outside the served root: {0}")]
    SymlinkOutsideRoot(String),

    /// A symlink along the path has no target, so its destination cannot be checked.
    #[error("dangling symlink: {0}")]
    DanglingSymlink(String),

    /// The path lies in a directory the daemon keeps for itself.
    #[error("path is reserved: {0}")]
    Reserved(String),

    /// The operation would act on the root directory itself.
    #[error("operation not allowed on the served root")]
    RootEntry,

    /// The path contains a NUL byte.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// The filesystem could not be queried while resolving.
    #[error("I/O error resolving {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Confines file access to one directory.
#[derive(Debug, Clone)]
pub struct FilesystemScope {
    root: PathBuf,
    reserved: Vec<PathBuf>,
}

impl FilesystemScope {
    /// Creates a scope rooted at the canonical form of `root`.
    pub fn new(root: &Path) -> Result<Self, AccessScopeError> {
        let root = fs::canonicalize(root).map_err(|source| AccessScopeError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root,
            reserved: Vec::new(),
        })
    }

    /// Withholds the directory `name` directly below the root.
    ///
    /// Reserved paths never resolve and are left out of listings.
    pub fn with_reserved(mut self, name: &str) -> Self {
        self.reserved.push(self.root.join(name));
        self
    }

    /// Whether a host path lies at or below a reserved directory.
    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.iter().any(|reserved| path.starts_with(reserved))
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a virtual path to an absolute host path below the root.
    ///
    /// Symlinks are followed, including in the final component. Components
    /// that do not exist yet are appended to the deepest existing ancestor,
    /// so paths for new files resolve too.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, AccessScopeError> {
        let parts = normalize(requested)?;
        let path = self.resolve_parts(requested, &parts)?;
        self.unreserved(requested, path)
    }

    /// Resolves a virtual path without following a symlink in its final component.
    ///
    /// Used for operations on directory entries themselves: lstat, readlink,
    /// remove, rename and symlink creation.
    pub fn resolve_entry(&self, requested: &str) -> Result<PathBuf, AccessScopeError> {
        let mut parts = normalize(requested)?;
        let Some(name) = parts.pop() else {
            return Ok(self.root.clone());
        };
        let parent = self.resolve_parts(requested, &parts)?;
        self.unreserved(requested, parent.join(name))
    }

    /// Like [`resolve_entry`](Self::resolve_entry) but refuses the root itself.
    pub fn resolve_child(&self, requested: &str) -> Result<PathBuf, AccessScopeError> {
        let path = self.resolve_entry(requested)?;
        if path == self.root {
            return Err(AccessScopeError::RootEntry);
        }
        Ok(path)
    }

    /// Converts a host path below the root back to its virtual form.
    pub fn to_virtual(&self, path: &Path) -> Result<String, AccessScopeError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| AccessScopeError::Escape(path.display().to_string()))?;

        let mut virtual_path = String::from("/");
        let names: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        virtual_path.push_str(&names.join("/"));
        Ok(virtual_path)
    }

    fn unreserved(&self, requested: &str, path: PathBuf) -> Result<PathBuf, AccessScopeError> {
        if self.is_reserved(&path) {
            return Err(AccessScopeError::Reserved(requested.to_string()));
        }
        Ok(path)
    }

    fn resolve_parts(&self, requested: &str, parts: &[String]) -> Result<PathBuf, AccessScopeError> {
        // Walk down to the deepest component that exists on disk.
        let mut existing = self.root.clone();
        let mut missing = parts.len();
        for (i, part) in parts.iter().enumerate() {
            let next = existing.join(part);
            match fs::symlink_metadata(&next) {
                Ok(_) => existing = next,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    missing = i;
                    break;
                }
                Err(source) => {
                    return Err(AccessScopeError::Io {
                        path: requested.to_string(),
                        source,
                    })
                }
            }
        }

        let canonical = fs::canonicalize(&existing).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                AccessScopeError::DanglingSymlink(requested.to_string())
            } else {
                AccessScopeError::Io {
                    path: requested.to_string(),
                    source,
                }
            }
        })?;

        if !canonical.starts_with(&self.root) {
            return Err(AccessScopeError::SymlinkOutsideRoot(requested.to_string()));
        }

        let mut resolved = canonical;
        for part in &parts[missing..] {
            resolved.push(part);
        }
        Ok(resolved)
    }
}

/// Splits a virtual path into plain names, applying `.` and `..` lexically.
///
/// Relative paths are taken relative to the root.
fn normalize(requested: &str) -> Result<Vec<String>, AccessScopeError> {
    if requested.contains('\0') {
        return Err(AccessScopeError::InvalidPath(requested.to_string()));
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(requested).components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(AccessScopeError::Escape(requested.to_string()));
                }
            }
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn scope() -> (TempDir, FilesystemScope) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("docs/nested")).unwrap();
        fs::write(root.join("docs/readme.txt"), b"hello").unwrap();
        let scope = FilesystemScope::new(&root).unwrap();
        (temp_dir, scope)
    }

    #[test]
    fn test_root_is_canonical() {
        let (temp_dir, scope) = scope();
        assert_eq!(
            scope.root(),
            fs::canonicalize(temp_dir.path().join("root")).unwrap()
        );
    }

    #[test]
    fn test_resolve_existing_file() {
        let (_temp_dir, scope) = scope();

        let absolute = scope.resolve("/docs/readme.txt").unwrap();
        let relative = scope.resolve("docs/./readme.txt").unwrap();

        assert_eq!(absolute, scope.root().join("docs/readme.txt"));
        assert_eq!(absolute, relative);
    }

    #[test]
    fn test_resolve_root_forms() {
        let (_temp_dir, scope) = scope();
        for path in ["", "/", ".", "/./", "docs/.."] {
            assert_eq!(scope.resolve(path).unwrap(), scope.root(), "input {path:?}");
        }
    }

    #[test]
    fn test_resolve_new_file() {
        let (_temp_dir, scope) = scope();

        let path = scope.resolve("/docs/new/deeper/file.bin").unwrap();
        assert_eq!(path, scope.root().join("docs/new/deeper/file.bin"));
    }

    #[test]
    fn test_parent_dir_inside_root() {
        let (_temp_dir, scope) = scope();

        let path = scope.resolve("/docs/nested/../readme.txt").unwrap();
        assert_eq!(path, scope.root().join("docs/readme.txt"));
    }

    #[test]
    fn test_traversal_rejected() {
        let (_temp_dir, scope) = scope();
        let attempts = [
            "../../etc/passwd",
            "/../etc/passwd",
            "..",
            "docs/../../outside",
            "/docs/nested/../../../..",
        ];

        for attempt in attempts {
            assert!(
                matches!(scope.resolve(attempt), Err(AccessScopeError::Escape(_))),
                "accepted {attempt:?}"
            );
        }
    }

    #[test]
    fn test_absolute_host_path_stays_inside() {
        let (_temp_dir, scope) = scope();

        let path = scope.resolve("/etc/passwd").unwrap();
        assert_eq!(path, scope.root().join("etc/passwd"));
    }

    #[test]
    fn test_no_input_leaves_root() {
        let (temp_dir, scope) = scope();
        let outside = temp_dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        symlink(&outside, scope.root().join("jump")).unwrap();
        symlink("../../..", scope.root().join("docs/up")).unwrap();

        let inputs = [
            "/", "a", "../a", "/docs/../..", "jump", "jump/x", "docs/up", "docs/up/etc",
            "//docs//readme.txt", "docs/nested/../../docs", "/./../", "x/../../y",
            "docs/readme.txt/..", "\u{0}",
        ];

        for input in inputs {
            if let Ok(path) = scope.resolve(input) {
                assert!(path.starts_with(scope.root()), "{input:?} -> {path:?}");
            }
            if let Ok(path) = scope.resolve_entry(input) {
                assert!(path.starts_with(scope.root()), "{input:?} -> {path:?}");
            }
        }
    }

    #[test]
    fn test_symlink_inside_root_followed() {
        let (_temp_dir, scope) = scope();
        symlink(scope.root().join("docs"), scope.root().join("alias")).unwrap();

        let path = scope.resolve("/alias/readme.txt").unwrap();
        assert_eq!(path, scope.root().join("docs/readme.txt"));
    }

    #[test]
    fn test_symlink_outside_root_rejected() {
        let (temp_dir, scope) = scope();
        let outside = temp_dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret"), b"x").unwrap();
        symlink(&outside, scope.root().join("escape")).unwrap();

        assert!(matches!(
            scope.resolve("/escape/secret"),
            Err(AccessScopeError::SymlinkOutsideRoot(_))
        ));
        assert!(matches!(
            scope.resolve("/escape/new-file"),
            Err(AccessScopeError::SymlinkOutsideRoot(_))
        ));
    }

    #[test]
    fn test_dangling_symlink_rejected() {
        let (temp_dir, scope) = scope();
        symlink(temp_dir.path().join("nowhere"), scope.root().join("dangling")).unwrap();

        assert!(matches!(
            scope.resolve("/dangling"),
            Err(AccessScopeError::DanglingSymlink(_))
        ));
    }

    #[test]
    fn test_resolve_entry_does_not_follow_last_link() {
        let (temp_dir, scope) = scope();
        symlink(temp_dir.path(), scope.root().join("link")).unwrap();

        let entry = scope.resolve_entry("/link").unwrap();
        assert_eq!(entry, scope.root().join("link"));
        assert!(scope.resolve("/link").is_err());
    }

    #[test]
    fn test_resolve_child_refuses_root() {
        let (_temp_dir, scope) = scope();

        assert!(matches!(scope.resolve_child("/"), Err(AccessScopeError::RootEntry)));
        assert!(matches!(scope.resolve_child("docs/.."), Err(AccessScopeError::RootEntry)));
        assert!(scope.resolve_child("/docs").is_ok());
    }

    #[test]
    fn test_reserved_directory_never_resolves() {
        let (temp_dir, scope) = scope();
        let root = temp_dir.path().join("root");
        fs::create_dir(root.join("private")).unwrap();
        fs::write(root.join("private/key"), b"k").unwrap();
        symlink(root.join("private/key"), root.join("docs/key-link")).unwrap();
        let scope = scope.with_reserved("private");

        for path in ["/private", "private/key", "/docs/../private/key", "/private/new", "/docs/key-link"] {
            assert!(
                matches!(scope.resolve(path), Err(AccessScopeError::Reserved(_))),
                "{path} resolved"
            );
        }
        assert!(matches!(
            scope.resolve_child("/private"),
            Err(AccessScopeError::Reserved(_))
        ));

        // Names that merely share the prefix are unaffected.
        assert!(scope.resolve("/private-notes").is_ok());
        assert!(scope.resolve("/docs/readme.txt").is_ok());
        assert!(scope.is_reserved(&scope.root().join("private/key")));
        assert!(!scope.is_reserved(&scope.root().join("docs")));
    }

    #[test]
    fn test_nul_byte_rejected() {
        let (_temp_dir, scope) = scope();
        assert!(matches!(
            scope.resolve("docs\0/readme.txt"),
            Err(AccessScopeError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_to_virtual() {
        let (temp_dir, scope) = scope();

        assert_eq!(scope.to_virtual(scope.root()).unwrap(), "/");
        assert_eq!(
            scope.to_virtual(&scope.root().join("docs/readme.txt")).unwrap(),
            "/docs/readme.txt"
        );
        assert!(scope.to_virtual(temp_dir.path()).is_err());
    }

    #[test]
    fn test_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let result = FilesystemScope::new(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(AccessScopeError::Io { .. })));
    }
}
