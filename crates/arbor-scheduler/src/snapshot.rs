use std::collections::BTreeMap;

use arbor_core::DirectoryNode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Average files per directory above which a snapshot is considered garbage.
pub const MAX_AVERAGE_FILES_PER_DIR: u64 = 50_000;

/// Persisted progress of a prefetch session, so a reload can skip directories it already
/// indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchSnapshot {
    pub loaded_dir_file_counts: BTreeMap<String, u64>,
    pub indexed_file_count: u64,
    /// [`shape_fingerprint`] of the root the snapshot was taken for.
    pub shape_fingerprint: String,
    pub saved_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotRejection {
    #[error("snapshot was taken for a differently shaped root")]
    ShapeMismatch,

    #[error("snapshot lists no loaded directories")]
    Empty,

    #[error("snapshot lists {dirs} directories, above the budget of {budget}")]
    OverBudget { dirs: usize, budget: usize },

    #[error("per-directory file counts add up to {sum}, above the indexed total {indexed}")]
    CountMismatch { sum: u64, indexed: u64 },

    #[error("snapshot averages {average} files per directory")]
    ImplausibleAverage { average: u64 },
}

impl PrefetchSnapshot {
    /// Checks the snapshot against the live root and the directory budget.
    pub fn check(&self, root: &DirectoryNode, budget: usize) -> Result<(), SnapshotRejection> {
        if self.shape_fingerprint != shape_fingerprint(root) {
            return Err(SnapshotRejection::ShapeMismatch);
        }
        let dirs = self.loaded_dir_file_counts.len();
        if dirs == 0 {
            return Err(SnapshotRejection::Empty);
        }
        if dirs > budget {
            return Err(SnapshotRejection::OverBudget { dirs, budget });
        }
        let sum = self
            .loaded_dir_file_counts
            .values()
            .fold(0u64, |acc, count| acc.saturating_add(*count));
        if sum > self.indexed_file_count {
            return Err(SnapshotRejection::CountMismatch {
                sum,
                indexed: self.indexed_file_count,
            });
        }
        let average = self.indexed_file_count / dirs as u64;
        if average > MAX_AVERAGE_FILES_PER_DIR {
            return Err(SnapshotRejection::ImplausibleAverage { average });
        }
        Ok(())
    }
}

/// SHA-256 (hex) over the sorted names of the root's immediate children.
pub fn shape_fingerprint(root: &DirectoryNode) -> String {
    let mut names: Vec<&str> = root.child_names().collect();
    names.sort_unstable();
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
