use arbor_core::{is_descendant, DirectoryNode, NodeKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Schema version of persisted tree cache records.
pub const TREE_CACHE_SCHEMA_VERSION: u32 = 1;

/// Shallow reference to a child stored inside a [`CachedDirectoryEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedChildEntry {
    pub kind: NodeKind,
    pub name: String,
    pub path: String,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    #[serde(default)]
    pub is_loaded: bool,
}

impl CachedChildEntry {
    pub fn from_node(node: &DirectoryNode) -> Self {
        Self {
            kind: node.kind,
            name: node.name.clone(),
            path: node.path.clone(),
            depth: node.depth,
            parent_path: node.parent_path.clone(),
            size: node.size,
            last_modified: node.last_modified,
            is_loaded: node.is_loaded,
        }
    }

    /// The child as a tree node. Directories come back as unloaded placeholders; their
    /// contents live in their own entries.
    pub fn to_node(&self) -> DirectoryNode {
        DirectoryNode {
            kind: self.kind,
            name: self.name.clone(),
            path: self.path.clone(),
            depth: self.depth,
            parent_path: self.parent_path.clone(),
            children: Vec::new(),
            is_loaded: self.kind == NodeKind::File,
            size: self.size,
            last_modified: self.last_modified,
        }
    }

    /// Whether the summary fields differ from `node`.
    pub fn differs_from(&self, node: &DirectoryNode) -> bool {
        self.kind != node.kind
            || self.name != node.name
            || self.size != node.size
            || self.last_modified != node.last_modified
    }
}

/// Persisted form of one loaded directory level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDirectoryEntry {
    pub path: String,
    pub name: String,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    pub children: Vec<CachedChildEntry>,
    pub child_count: usize,
    /// Write (or last access) time in milliseconds; drives LRU eviction and TTL cleanup.
    pub cached_at: u64,
    /// Filesystem mtime captured with the listing; drives staleness checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("entry has an empty path or name")]
    MissingIdentity,

    #[error("child count {recorded} does not match {actual} stored children")]
    ChildCount { recorded: usize, actual: usize },

    #[error("child {child} does not belong to this directory")]
    ForeignChild { child: String },

    #[error("child {child} has depth {found}, expected {expected}")]
    ChildDepth {
        child: String,
        expected: u32,
        found: u32,
    },

    #[error("directory depth {depth} leaves no room for children")]
    DepthOverflow { depth: u32 },

    #[error("children checksum mismatch")]
    Checksum,

    #[error("entry is stored under {key_path} but describes {path}")]
    KeyMismatch { key_path: String, path: String },
}

impl CachedDirectoryEntry {
    pub fn from_node(node: &DirectoryNode, cached_at: u64) -> Self {
        let children: Vec<CachedChildEntry> =
            node.children.iter().map(CachedChildEntry::from_node).collect();
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            depth: node.depth,
            parent_path: node.parent_path.clone(),
            child_count: children.len(),
            checksum: Some(children_checksum(&children)),
            children,
            cached_at,
            last_modified: node.last_modified,
            version: TREE_CACHE_SCHEMA_VERSION,
        }
    }

    /// The directory as a loaded node whose child directories are placeholders.
    pub fn to_node(&self) -> DirectoryNode {
        DirectoryNode {
            kind: NodeKind::Dir,
            name: self.name.clone(),
            path: self.path.clone(),
            depth: self.depth,
            parent_path: self.parent_path.clone(),
            children: self.children.iter().map(CachedChildEntry::to_node).collect(),
            is_loaded: true,
            size: None,
            last_modified: self.last_modified,
        }
    }

    pub fn validate(&self) -> Result<(), IntegrityViolation> {
        if self.path.is_empty() || self.name.is_empty() {
            return Err(IntegrityViolation::MissingIdentity);
        }
        if self.child_count != self.children.len() {
            return Err(IntegrityViolation::ChildCount {
                recorded: self.child_count,
                actual: self.children.len(),
            });
        }
        for child in &self.children {
            if child.parent_path.as_deref() != Some(self.path.as_str())
                || !is_descendant(&child.path, &self.path)
            {
                return Err(IntegrityViolation::ForeignChild {
                    child: child.path.clone(),
                });
            }
            let Some(expected) = self.depth.checked_add(1) else {
                return Err(IntegrityViolation::DepthOverflow { depth: self.depth });
            };
            if child.depth != expected {
                return Err(IntegrityViolation::ChildDepth {
                    child: child.path.clone(),
                    expected,
                    found: child.depth,
                });
            }
        }
        if let Some(checksum) = &self.checksum {
            if *checksum != children_checksum(&self.children) {
                return Err(IntegrityViolation::Checksum);
            }
        }
        Ok(())
    }
}

/// SHA-256 (hex) over the child paths in stored order.
pub fn children_checksum(children: &[CachedChildEntry]) -> String {
    let mut hasher = Sha256::new();
    for child in children {
        hasher.update(child.path.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Marker record for a cached tree, stored under the root key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTreeRoot {
    pub path: String,
    pub cached_at: u64,
    pub directory_count: u64,
    pub file_count: u64,
    pub version: u32,
}

/// Resume point for paging through a large directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyContinuation {
    pub path: String,
    pub offset: usize,
    pub total: usize,
    pub created_at: u64,
}
