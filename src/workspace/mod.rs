//! The sandboxed workspace directory.
//!
//! [`Workspace`] owns the canonical root and is the only place that turns a
//! client-supplied path into a filesystem path. Anything that fails to
//! resolve is rejected with [`BrokerError::PathEscape`]; callers must never
//! touch the filesystem with an unresolved path.

pub mod tree;

use std::path::{Component, Path, PathBuf};

use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating it if needed) the workspace root and canonicalize it.
    pub fn open(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(std::io::Error::other(format!(
                "workspace root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path to an absolute path inside the root.
    ///
    /// `.` segments are dropped and `..` pops one segment; a `..` that would
    /// climb above the root is an escape, not something to clamp. A leading
    /// `/` addresses the workspace root, not the host root. The longest
    /// existing prefix of the result is canonicalized so a symlink cannot
    /// carry the path outside the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, BrokerError> {
        let escape = || BrokerError::PathEscape(raw.to_string());

        if raw.contains('\0') {
            return Err(escape());
        }

        let mut segments = Vec::new();
        for component in Path::new(raw).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Prefix(_) => return Err(escape()),
                Component::ParentDir => {
                    if segments.pop().is_none() {
                        return Err(escape());
                    }
                }
                Component::Normal(segment) => segments.push(segment),
            }
        }

        let mut resolved = self.root.clone();
        resolved.extend(segments);

        if !self.contains(&resolved) {
            return Err(escape());
        }
        if !self.existing_prefix_confined(&resolved) {
            return Err(escape());
        }
        Ok(resolved)
    }

    /// Map an absolute path back to its `/`-separated workspace-relative form.
    ///
    /// Returns `None` for paths outside the root; the root itself maps to "".
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Canonicalize the deepest ancestor that exists (the path itself
    /// included) and check it is still under the root. An entry that exists
    /// but cannot be canonicalized, such as a dangling symlink, fails.
    fn existing_prefix_confined(&self, path: &Path) -> bool {
        for ancestor in path.ancestors() {
            if std::fs::symlink_metadata(ancestor).is_err() {
                continue;
            }
            return match ancestor.canonicalize() {
                Ok(real) => self.contains(&real),
                Err(_) => false,
            };
        }
        false
    }
}

/// Replace the whole content of an already resolved file, creating missing
/// parent directories. `display` is the client's name for the path.
pub async fn write_file(path: &Path, display: &str, content: &str) -> Result<(), BrokerError> {
    let failure = |source| BrokerError::WriteFailure {
        path: display.to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(failure)?;
    }
    tokio::fs::write(path, content).await.map_err(failure)
}

/// Read an already resolved file as text. Invalid UTF-8 is replaced.
pub async fn read_file(path: &Path, display: &str) -> Result<String, BrokerError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BrokerError::NotFound(display.to_string()))
        }
        Err(source) => Err(BrokerError::ReadFailure {
            path: display.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn open_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("user");
        let ws = Workspace::open(&root).unwrap();
        assert!(ws.root().is_dir());
        assert!(ws.root().is_absolute());
    }

    #[test]
    fn open_rejects_file_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        assert!(Workspace::open(&file).is_err());
    }

    #[test]
    fn resolves_plain_relative_path() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("src/main.rs").unwrap();
        assert_eq!(resolved, ws.root().join("src").join("main.rs"));
    }

    #[test]
    fn empty_and_dot_resolve_to_root() {
        let (_dir, ws) = workspace();
        assert_eq!(ws.resolve("").unwrap(), ws.root());
        assert_eq!(ws.resolve(".").unwrap(), ws.root());
        assert_eq!(ws.resolve("./").unwrap(), ws.root());
    }

    #[test]
    fn leading_slash_is_workspace_relative() {
        let (_dir, ws) = workspace();
        assert_eq!(
            ws.resolve("/etc/passwd").unwrap(),
            ws.root().join("etc").join("passwd")
        );
    }

    #[test]
    fn parent_segments_inside_root_collapse() {
        let (_dir, ws) = workspace();
        assert_eq!(ws.resolve("a/../b.txt").unwrap(), ws.root().join("b.txt"));
        assert_eq!(ws.resolve("a/./b/../c").unwrap(), ws.root().join("a").join("c"));
    }

    #[test]
    fn traversal_out_of_root_is_rejected() {
        let (_dir, ws) = workspace();
        for raw in ["../../etc/passwd", "..", "a/../../x", "/../secret", "a/b/../../../c"] {
            match ws.resolve(raw) {
                Err(BrokerError::PathEscape(p)) => assert_eq!(p, raw),
                other => panic!("expected PathEscape for {raw:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn nul_byte_is_rejected() {
        let (_dir, ws) = workspace();
        assert!(matches!(
            ws.resolve("a\0b"),
            Err(BrokerError::PathEscape(_))
        ));
    }

    #[test]
    fn resolved_paths_stay_under_root() {
        let (_dir, ws) = workspace();
        for raw in ["a", "a/b/c.txt", "./x", "x/../y", "deep/./er/file"] {
            let resolved = ws.resolve(raw).unwrap();
            assert!(resolved.starts_with(ws.root()), "{raw} -> {}", resolved.display());
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_is_rejected() {
        let (_dir, ws) = workspace();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.root().join("link")).unwrap();

        assert!(matches!(
            ws.resolve("link/secret.txt"),
            Err(BrokerError::PathEscape(_))
        ));
        assert!(matches!(ws.resolve("link"), Err(BrokerError::PathEscape(_))));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_rejected() {
        let (_dir, ws) = workspace();
        std::os::unix::fs::symlink("/nonexistent/target", ws.root().join("dangling")).unwrap();
        assert!(matches!(
            ws.resolve("dangling"),
            Err(BrokerError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_is_allowed() {
        let (_dir, ws) = workspace();
        std::fs::create_dir(ws.root().join("real")).unwrap();
        std::os::unix::fs::symlink(ws.root().join("real"), ws.root().join("alias")).unwrap();
        assert!(ws.resolve("alias/file.txt").is_ok());
    }

    #[test]
    fn relative_inverts_resolve() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("a/b/c.txt").unwrap();
        assert_eq!(ws.relative(&resolved).as_deref(), Some("a/b/c.txt"));
        assert_eq!(ws.relative(ws.root()).as_deref(), Some(""));
        assert_eq!(ws.relative(Path::new("/definitely/elsewhere")), None);
    }

    #[tokio::test]
    async fn write_creates_parents_and_read_returns_content() {
        let (_dir, ws) = workspace();
        let path = ws.resolve("src/nested/main.rs").unwrap();
        write_file(&path, "src/nested/main.rs", "fn main() {}\n").await.unwrap();
        let content = read_file(&path, "src/nested/main.rs").await.unwrap();
        assert_eq!(content, "fn main() {}\n");
    }

    #[tokio::test]
    async fn write_replaces_existing_content() {
        let (_dir, ws) = workspace();
        let path = ws.resolve("a.txt").unwrap();
        write_file(&path, "a.txt", "a much longer first version").await.unwrap();
        write_file(&path, "a.txt", "short").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short");
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (_dir, ws) = workspace();
        let path = ws.resolve("nope.txt").unwrap();
        match read_file(&path, "nope.txt").await {
            Err(BrokerError::NotFound(p)) => assert_eq!(p, "nope.txt"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_directory_is_a_read_failure() {
        let (_dir, ws) = workspace();
        std::fs::create_dir(ws.root().join("dir")).unwrap();
        let path = ws.resolve("dir").unwrap();
        assert!(matches!(
            read_file(&path, "dir").await,
            Err(BrokerError::ReadFailure { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (_dir, ws) = workspace();
        let path = ws.resolve("bin").unwrap();
        std::fs::write(&path, [b'o', b'k', 0xff]).unwrap();
        assert_eq!(read_file(&path, "bin").await.unwrap(), "ok\u{fffd}");
    }
}
