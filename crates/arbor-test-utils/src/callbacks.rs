use std::sync::Arc;

use arbor_core::DirectoryLoadResult;
use arbor_scheduler::{Milestone, PrefetchCallbacks, PrefetchError, PrefetchStatus};
use parking_lot::Mutex;

/// One observed prefetch callback.
#[derive(Debug, Clone)]
pub enum PrefetchEvent {
    Loaded(DirectoryLoadResult),
    Deferred(String),
    Status(PrefetchStatus),
    Error(PrefetchError),
}

/// Records every prefetch callback in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RecordingCallbacks {
    events: Arc<Mutex<Vec<PrefetchEvent>>>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks feeding this recorder, with every optional hook installed.
    pub fn callbacks(&self) -> PrefetchCallbacks {
        let loaded = self.events.clone();
        let status = self.events.clone();
        let deferred = self.events.clone();
        let error = self.events.clone();
        PrefetchCallbacks::new(
            move |result| loaded.lock().push(PrefetchEvent::Loaded(result.clone())),
            move |update| status.lock().push(PrefetchEvent::Status(update.clone())),
        )
        .with_deferred_metadata(move |result| {
            deferred
                .lock()
                .push(PrefetchEvent::Deferred(result.node.path.clone()))
        })
        .with_error(move |err| error.lock().push(PrefetchEvent::Error(err.clone())))
    }

    pub fn events(&self) -> Vec<PrefetchEvent> {
        self.events.lock().clone()
    }

    pub fn loaded_paths(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PrefetchEvent::Loaded(result) => Some(result.node.path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deferred_paths(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PrefetchEvent::Deferred(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<PrefetchStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PrefetchEvent::Status(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn milestones(&self) -> Vec<Milestone> {
        self.statuses()
            .into_iter()
            .filter_map(|status| status.milestone)
            .collect()
    }

    pub fn errors(&self) -> Vec<PrefetchError> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PrefetchEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    /// Index of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&PrefetchEvent) -> bool) -> Option<usize> {
        self.events.lock().iter().position(predicate)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
