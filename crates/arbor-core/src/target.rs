use serde::{Deserialize, Serialize};

use crate::node::{DirectoryNode, NodeKind};

/// A directory the prefetcher still has to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchTarget {
    pub path: String,
    pub name: String,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
}

impl PrefetchTarget {
    pub fn from_node(node: &DirectoryNode) -> Self {
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            depth: node.depth,
            parent_path: node.parent_path.clone(),
        }
    }

    /// A placeholder node for this target.
    pub fn to_node(&self) -> DirectoryNode {
        let mut node = DirectoryNode::dir(self.path.clone(), self.depth);
        node.name = self.name.clone();
        node.parent_path = self.parent_path.clone();
        node
    }
}

/// A path entry handed to the search index alongside a loaded directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathIndexEntry {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
}

/// Result of loading a single directory level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryLoadResult {
    pub node: DirectoryNode,
    pub pending_targets: Vec<PrefetchTarget>,
    pub file_count: u64,
    pub files_to_index: Vec<String>,
    pub path_index_entries: Vec<PathIndexEntry>,
}

impl DirectoryLoadResult {
    /// Derives the bookkeeping fields from a loaded node.
    ///
    /// Unloaded child directories become pending targets; files are counted and listed for
    /// indexing.
    pub fn from_node(node: DirectoryNode) -> Self {
        let mut pending_targets = Vec::new();
        let mut files_to_index = Vec::new();
        let mut path_index_entries = Vec::with_capacity(node.children.len());
        for child in &node.children {
            path_index_entries.push(PathIndexEntry {
                path: child.path.clone(),
                name: child.name.clone(),
                kind: child.kind,
            });
            match child.kind {
                NodeKind::File => files_to_index.push(child.path.clone()),
                NodeKind::Dir if !child.is_loaded => {
                    pending_targets.push(PrefetchTarget::from_node(child))
                }
                NodeKind::Dir => {}
            }
        }
        Self {
            file_count: files_to_index.len() as u64,
            node,
            pending_targets,
            files_to_index,
            path_index_entries,
        }
    }
}

/// Work discovered in an already-materialized tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingTargets {
    pub targets: Vec<PrefetchTarget>,
    pub loaded_paths: Vec<String>,
    pub total_file_count: u64,
}

/// Walks `tree` and splits its directories into loaded paths and pending targets.
///
/// Unloaded directories deeper than `max_depth` are not reported.
pub fn extract_pending_targets(tree: &DirectoryNode, max_depth: Option<u32>) -> PendingTargets {
    let mut out = PendingTargets::default();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        match node.kind {
            NodeKind::File => out.total_file_count += 1,
            NodeKind::Dir if node.is_loaded => {
                out.loaded_paths.push(node.path.clone());
                // Reverse so siblings come out in stored order.
                stack.extend(node.children.iter().rev());
            }
            NodeKind::Dir => {
                if max_depth.map_or(true, |max| node.depth <= max) {
                    out.targets.push(PrefetchTarget::from_node(node));
                }
            }
        }
    }
    out
}
