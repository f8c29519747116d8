//! Utilities shared by Arbor tests.
//!
//! - [`build_tree`]: compact construction of fully loaded directory trees
//! - [`FakeTree`] / [`FakeLoader`]: an in-memory "filesystem" behind the
//!   [`arbor_scheduler::DirectoryLoader`] trait, with per-path delays, injected failures and a
//!   call log
//! - [`RecordingCallbacks`]: prefetch callbacks that record every event in order
//! - [`FailingBackend`]: a storage backend whose reads and writes can be switched to fail

mod backend;
mod callbacks;
mod loader;
mod tree;

pub use backend::FailingBackend;
pub use callbacks::{PrefetchEvent, RecordingCallbacks};
pub use loader::FakeLoader;
pub use tree::{build_tree, FakeTree};

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; output goes through the test harness writer so it only shows for
/// failing tests.
pub fn init_test_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
