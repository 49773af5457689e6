use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Directories nested deeper than this are reported as empty.
pub const MAX_DEPTH: usize = 64;

/// A point-in-time view of one workspace entry.
///
/// Serializes the way clients expect the tree: a file is `null`, a directory
/// is an object mapping child names to nodes, ordered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    File,
    Directory(BTreeMap<String, TreeNode>),
}

impl TreeNode {
    pub fn children(&self) -> Option<&BTreeMap<String, TreeNode>> {
        match self {
            TreeNode::File => None,
            TreeNode::Directory(children) => Some(children),
        }
    }

    /// Look up a `/`-separated path below this node.
    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.children()?.get(segment))
    }
}

/// Recursively list `root`.
///
/// Only a failure to list `root` itself is an error. Entries that vanish
/// between listing and stat are skipped, and unreadable subdirectories show
/// up empty. Symlinks are reported as files and never followed.
pub fn snapshot(root: &Path) -> std::io::Result<TreeNode> {
    let entries = fs::read_dir(root)?;
    Ok(TreeNode::Directory(collect(entries, 1)))
}

fn build_dir(dir: &Path, depth: usize) -> BTreeMap<String, TreeNode> {
    if depth > MAX_DEPTH {
        tracing::debug!(path = %dir.display(), "tree depth limit reached");
        return BTreeMap::new();
    }
    match fs::read_dir(dir) {
        Ok(entries) => collect(entries, depth),
        Err(e) => {
            tracing::debug!(path = %dir.display(), error = %e, "skipping unreadable directory");
            BTreeMap::new()
        }
    }
}

fn collect(entries: fs::ReadDir, depth: usize) -> BTreeMap<String, TreeNode> {
    let mut children = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        // Gone since the listing: skip it.
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let node = if metadata.is_dir() {
            TreeNode::Directory(build_dir(&path, depth + 1))
        } else {
            TreeNode::File
        };
        children.insert(name, node);
    }
    children
}
