use serde::{Deserialize, Serialize};

use crate::path::{file_name, join_path, parent_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

/// A file or directory in an explorer tree.
///
/// `children` of a directory are only meaningful once `is_loaded` is set; an unloaded
/// directory is a placeholder the prefetcher still has to visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryNode {
    pub kind: NodeKind,
    pub name: String,
    pub path: String,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(default)]
    pub children: Vec<DirectoryNode>,
    #[serde(default)]
    pub is_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time in milliseconds since the unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
}

impl DirectoryNode {
    /// An unloaded directory node.
    pub fn dir(path: impl Into<String>, depth: u32) -> Self {
        let path = path.into();
        Self {
            kind: NodeKind::Dir,
            name: file_name(&path).to_string(),
            parent_path: parent_path(&path).map(str::to_string),
            path,
            depth,
            children: Vec::new(),
            is_loaded: false,
            size: None,
            last_modified: None,
        }
    }

    pub fn file(path: impl Into<String>, depth: u32, size: Option<u64>) -> Self {
        let path = path.into();
        Self {
            kind: NodeKind::File,
            name: file_name(&path).to_string(),
            parent_path: parent_path(&path).map(str::to_string),
            path,
            depth,
            children: Vec::new(),
            is_loaded: true,
            size,
            last_modified: None,
        }
    }

    /// Marks the directory as loaded with the given children.
    pub fn with_children(mut self, children: Vec<DirectoryNode>) -> Self {
        self.children = children;
        self.is_loaded = true;
        self
    }

    pub fn with_last_modified(mut self, mtime: u64) -> Self {
        self.last_modified = Some(mtime);
        self
    }

    /// Builds a child directory placeholder one level below `self`.
    pub fn child_dir(&self, name: &str) -> DirectoryNode {
        DirectoryNode::dir(join_path(&self.path, name), self.depth + 1)
    }

    pub fn child_file(&self, name: &str, size: Option<u64>) -> DirectoryNode {
        DirectoryNode::file(join_path(&self.path, name), self.depth + 1, size)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Finds a node by path anywhere in this subtree.
    pub fn find(&self, path: &str) -> Option<&DirectoryNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }

    /// Counts the files contained in this subtree (loaded parts only).
    pub fn file_count(&self) -> u64 {
        match self.kind {
            NodeKind::File => 1,
            NodeKind::Dir => self.children.iter().map(DirectoryNode::file_count).sum(),
        }
    }

    /// Returns a copy of this node whose child directories are unloaded placeholders.
    pub fn shallow(&self) -> DirectoryNode {
        let mut node = self.clone();
        for child in &mut node.children {
            if child.is_dir() {
                child.children.clear();
                child.is_loaded = false;
            }
        }
        node
    }

    /// Names of the immediate children, in stored order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|child| child.name.as_str())
    }
}
