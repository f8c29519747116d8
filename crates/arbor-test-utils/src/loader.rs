use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{DirectoryLoadResult, PrefetchTarget};
use arbor_scheduler::DirectoryLoader;
use parking_lot::Mutex;

use crate::tree::FakeTree;

/// [`DirectoryLoader`] over a [`FakeTree`].
///
/// Records every call, tracks peak concurrency and can delay or fail specific paths.
#[derive(Debug, Default)]
pub struct FakeLoader {
    tree: Mutex<FakeTree>,
    delay: Mutex<Duration>,
    path_delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLoader {
    pub fn new(tree: FakeTree) -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(tree),
            ..Self::default()
        })
    }

    /// Delay applied to every load without a per-path delay.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn delay_path(&self, path: &str, delay: Duration) {
        self.path_delays.lock().insert(path.to_string(), delay);
    }

    pub fn fail_path(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    /// Mutates the backing tree, as a filesystem change would.
    pub fn update_tree(&self, update: impl FnOnce(&mut FakeTree)) {
        update(&mut self.tree.lock());
    }

    /// Paths loaded so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|call| *call == path).count()
    }

    /// Highest number of loads observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DirectoryLoader for FakeLoader {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> anyhow::Result<Option<DirectoryLoadResult>> {
        self.calls.lock().push(target.path.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let delay = self
            .path_delays
            .lock()
            .get(&target.path)
            .copied()
            .unwrap_or_else(|| *self.delay.lock());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().contains(&target.path) {
            anyhow::bail!("permission denied: {}", target.path);
        }
        let listing = self.tree.lock().listing(&target.path);
        Ok(listing.map(DirectoryLoadResult::from_node))
    }
}
