use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use arbor_core::{
    is_descendant, normalize_path, path_segments, DirectoryLoadResult, PrefetchTarget,
};
use arbor_scheduler::DirectoryLoader;
use tokio::fs;

/// [`DirectoryLoader`] over the local filesystem.
///
/// Explorer paths below `explorer_root` map onto `fs_root`. Symlinks are listed as files and
/// never followed.
#[derive(Debug, Clone)]
pub struct LocalDirectoryLoader {
    fs_root: PathBuf,
    explorer_root: String,
}

fn millis(time: SystemTime) -> Option<u64> {
    let elapsed = time.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(elapsed.as_millis()).ok()
}

impl LocalDirectoryLoader {
    pub fn new(fs_root: impl Into<PathBuf>, explorer_root: impl Into<String>) -> Self {
        Self {
            fs_root: fs_root.into(),
            explorer_root: explorer_root.into(),
        }
    }

    pub fn fs_root(&self) -> &Path {
        &self.fs_root
    }

    /// Filesystem location of an explorer path.
    pub fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let normalized = normalize_path(path);
        let path = normalized.as_str();
        let relative = if path == self.explorer_root {
            ""
        } else if is_descendant(path, &self.explorer_root) {
            &path[self.explorer_root.trim_end_matches('/').len()..]
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is outside of {}", self.explorer_root),
            ));
        };
        let mut resolved = self.fs_root.clone();
        for segment in path_segments(relative) {
            match Path::new(segment).components().next() {
                Some(Component::Normal(_)) => resolved.push(segment),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid path segment {segment:?} in {path}"),
                    ))
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait::async_trait]
impl DirectoryLoader for LocalDirectoryLoader {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> anyhow::Result<Option<DirectoryLoadResult>> {
        let dir = self.resolve(&target.path)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()))
            }
        };

        let node = target.to_node();
        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to list {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::debug!(
                        target = "arbor.explorer",
                        dir = %dir.display(),
                        name = %name,
                        error = %err,
                        "skipping unreadable entry"
                    );
                    continue;
                }
            };
            let mut child = if meta.is_dir() {
                node.child_dir(&name)
            } else {
                node.child_file(&name, Some(meta.len()))
            };
            child.last_modified = meta.modified().ok().and_then(millis);
            children.push(child);
        }
        // Directories first, then by name.
        children.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));

        let mut node = node.with_children(children);
        node.last_modified = match fs::metadata(&dir).await {
            Ok(meta) => meta.modified().ok().and_then(millis),
            Err(_) => None,
        };
        Ok(Some(DirectoryLoadResult::from_node(node)))
    }
}
