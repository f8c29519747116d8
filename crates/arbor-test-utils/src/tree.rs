use std::collections::BTreeMap;

use arbor_core::{path_segments, DirectoryNode};

/// Builds a fully loaded tree under `root`.
///
/// Entries are paths relative to the root; a trailing `/` marks a directory. Intermediate
/// directories are created as needed. File sizes are the length of the file name.
///
/// ```
/// let tree = arbor_test_utils::build_tree("/p", &["src/lib.rs", "docs/"]);
/// assert!(tree.find("/p/src/lib.rs").is_some());
/// ```
pub fn build_tree(root: &str, entries: &[&str]) -> DirectoryNode {
    let mut tree = DirectoryNode::dir(root, 0).with_children(Vec::new());
    for entry in entries {
        let segments: Vec<&str> = path_segments(entry).collect();
        insert(&mut tree, &segments, entry.ends_with('/'));
    }
    tree
}

fn insert(node: &mut DirectoryNode, segments: &[&str], leaf_is_dir: bool) {
    let Some((name, rest)) = segments.split_first() else {
        return;
    };
    let is_leaf = rest.is_empty();
    let index = match node.children.iter().position(|child| child.name == *name) {
        Some(index) => index,
        None => {
            let child = if is_leaf && !leaf_is_dir {
                node.child_file(name, Some(name.len() as u64))
            } else {
                node.child_dir(name).with_children(Vec::new())
            };
            node.children.push(child);
            node.children.len() - 1
        }
    };
    if !is_leaf {
        insert(&mut node.children[index], rest, leaf_is_dir);
    }
}

/// Directory listings keyed by path, as a loader would see them on disk.
#[derive(Debug, Clone, Default)]
pub struct FakeTree {
    listings: BTreeMap<String, DirectoryNode>,
}

impl FakeTree {
    /// Indexes every loaded directory of `root`.
    pub fn from_root(root: &DirectoryNode) -> Self {
        let mut tree = Self::default();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if !node.is_dir() || !node.is_loaded {
                continue;
            }
            tree.listings.insert(node.path.clone(), node.shallow());
            stack.extend(node.children.iter().filter(|child| child.is_dir()));
        }
        tree
    }

    /// One level of `path`, with child directories as unloaded placeholders.
    pub fn listing(&self, path: &str) -> Option<DirectoryNode> {
        self.listings.get(path).cloned()
    }

    pub fn dir_count(&self) -> usize {
        self.listings.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.listings.keys().map(String::as_str)
    }

    pub fn add_file(&mut self, dir: &str, name: &str, size: u64) {
        if let Some(listing) = self.listings.get_mut(dir) {
            let file = listing.child_file(name, Some(size));
            listing.children.push(file);
        }
    }

    /// Adds an empty child directory.
    pub fn add_dir(&mut self, dir: &str, name: &str) {
        let Some(listing) = self.listings.get_mut(dir) else {
            return;
        };
        let child = listing.child_dir(name);
        let path = child.path.clone();
        listing.children.push(child.clone());
        self.listings.insert(path, child.with_children(Vec::new()));
    }

    /// Removes a child and, for directories, everything below it.
    pub fn remove(&mut self, path: &str) {
        let parent = arbor_core::parent_path(path).map(str::to_string);
        if let Some(listing) = parent.and_then(|parent| self.listings.get_mut(&parent)) {
            listing.children.retain(|child| child.path != path);
        }
        self.listings
            .retain(|listed, _| listed != path && !arbor_core::is_descendant(listed, path));
    }

    pub fn set_last_modified(&mut self, dir: &str, mtime: u64) {
        if let Some(listing) = self.listings.get_mut(dir) {
            listing.last_modified = Some(mtime);
        }
    }
}
