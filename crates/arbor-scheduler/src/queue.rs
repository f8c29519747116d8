use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use arbor_core::{
    extract_pending_targets, now_millis, DirectoryLoadResult, DirectoryNode, NodeKind,
    PrefetchTarget,
};
use arbor_storage::StorageBackend;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::PrefetchConfig;
use crate::error::{Result, SchedulerError};
use crate::loader::DirectoryLoader;
use crate::snapshot::{shape_fingerprint, PrefetchSnapshot};
use crate::state::{Deliveries, JobClass, JobOutcome, QueueState, Step};
use crate::status::{Milestone, PrefetchCallbacks, PrefetchStatus};

struct Shared {
    config: PrefetchConfig,
    loader: Arc<dyn DirectoryLoader>,
    callbacks: PrefetchCallbacks,
    state: Mutex<QueueState>,
    /// Signalled whenever queued or in-flight work changes.
    work: Notify,
    /// Signalled whenever a run ends.
    idle: Notify,
    /// Held while loaded results go out, so listings of one path arrive in order.
    delivery: Mutex<()>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

/// Background prefetcher walking a directory tree with a bounded pool of async workers.
///
/// Targets go to one of two deduplicating, insertion-ordered queues. Deferred targets (paths
/// containing a configured segment such as `node_modules`) are only taken once the primary
/// queue is empty, no primary job is in flight and the buffered primary results have been
/// delivered.
///
/// Every run belongs to a session. [`PrefetchQueue::reset_for_source`] and
/// [`PrefetchQueue::stop`] start a new session and cancel the old one; workers of a stale
/// session exit at their next suspension point without touching shared state.
///
/// A run that drained on its own starts again when new targets arrive. A run that was
/// stopped stays stopped until the next [`PrefetchQueue::start`].
#[derive(Clone)]
pub struct PrefetchQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for PrefetchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchQueue")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`PrefetchQueue`], for callbacks that feed work back into it.
#[derive(Debug, Clone)]
pub struct WeakPrefetchQueue {
    shared: Weak<Shared>,
}

impl WeakPrefetchQueue {
    pub fn upgrade(&self) -> Option<PrefetchQueue> {
        self.shared.upgrade().map(|shared| PrefetchQueue { shared })
    }
}

impl PrefetchQueue {
    pub fn new(
        config: PrefetchConfig,
        loader: Arc<dyn DirectoryLoader>,
        callbacks: PrefetchCallbacks,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                loader,
                callbacks,
                state: Mutex::new(QueueState::new(0)),
                work: Notify::new(),
                idle: Notify::new(),
                delivery: Mutex::new(()),
                drain: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.shared.config
    }

    pub fn downgrade(&self) -> WeakPrefetchQueue {
        WeakPrefetchQueue {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current session id; changes on every stop or reset.
    pub fn session(&self) -> u64 {
        self.shared.state.lock().session
    }

    /// Records the loaded directories of `tree` and queues its unloaded ones.
    ///
    /// Returns the number of targets queued.
    pub fn seed_from_tree(&self, tree: &DirectoryNode) -> usize {
        let config = &self.shared.config;
        let pending = extract_pending_targets(tree, Some(config.max_depth));
        let file_counts = loaded_file_counts(tree);
        let queued = {
            let mut state = self.shared.state.lock();
            for (path, count) in file_counts {
                if !state.loaded_file_counts.contains_key(&path) {
                    state.mark_loaded(&path, count);
                }
            }
            state.check_budget(config);
            pending
                .targets
                .into_iter()
                .filter(|target| state.enqueue(config, target.clone()))
                .count()
        };
        self.shared.work.notify_waiters();
        tracing::debug!(
            target = "arbor.scheduler",
            root = %tree.path,
            loaded = pending.loaded_paths.len(),
            queued,
            "seeded prefetch queue"
        );
        if queued > 0 {
            self.resume();
        }
        queued
    }

    /// Queues targets; returns how many were accepted.
    pub fn enqueue<I>(&self, targets: I) -> usize
    where
        I: IntoIterator<Item = PrefetchTarget>,
    {
        let config = &self.shared.config;
        let accepted = {
            let mut state = self.shared.state.lock();
            targets
                .into_iter()
                .filter(|target| state.enqueue(config, target.clone()))
                .count()
        };
        if accepted > 0 {
            self.shared.work.notify_waiters();
            self.resume();
        }
        accepted
    }

    /// Delivers a newer listing of a directory obtained outside the queue, such as a
    /// revalidated cache entry, and queues the directories it reveals.
    ///
    /// If an older listing of the same path is still in flight or buffered for the primary
    /// phase, the newer one takes its place; the last listing delivered for a path is never
    /// older than one delivered before it. Not to be called from the queue's own callbacks.
    pub fn deliver_refreshed(&self, result: DirectoryLoadResult) {
        let delivery = self.shared.delivery.lock();
        let (accepted, now) = self
            .shared
            .state
            .lock()
            .refresh(&self.shared.config, result);
        if let Some(result) = &now {
            self.shared.callbacks.loaded(result);
        }
        drop(delivery);
        if accepted > 0 {
            self.shared.work.notify_waiters();
            self.resume();
        }
    }

    /// Starts draining the queues in the background. Returns `false` if a run is already in
    /// progress.
    pub fn start(&self) -> Result<bool> {
        self.launch(false)
    }

    /// Starts a new run for work that arrived after the previous run drained.
    fn resume(&self) {
        match self.launch(true) {
            Ok(true) => tracing::debug!(
                target = "arbor.scheduler",
                "restarting drained prefetch queue for new work"
            ),
            Ok(false) => {}
            Err(err) => tracing::debug!(
                target = "arbor.scheduler",
                error = %err,
                "cannot restart prefetch queue"
            ),
        }
    }

    fn launch(&self, resume: bool) -> Result<bool> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let (session, token) = {
            let mut state = self.shared.state.lock();
            if state.running || (resume && state.last_milestone != Some(Milestone::Drained)) {
                return Ok(false);
            }
            state.running = true;
            state.last_milestone = None;
            state.stall = Default::default();
            (state.session, state.token.clone())
        };
        tracing::debug!(target = "arbor.scheduler", session, "starting prefetch run");
        let task = handle.spawn(drain(Arc::clone(&self.shared), session, token));
        *self.shared.drain.lock() = Some(task);
        Ok(true)
    }

    /// Resolves once no run is in progress.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.shared.state.lock().running {
                return;
            }
            notified.await;
        }
    }

    /// Cancels the current run and forgets everything: queues, loaded set, counters.
    pub async fn reset_for_source(&self) {
        let task = {
            let mut state = self.shared.state.lock();
            let session = state.bump_session();
            *state = QueueState::new(session);
            self.shared.drain.lock().take()
        };
        await_drain(task).await;
        self.shared.work.notify_waiters();
        self.shared.idle.notify_waiters();
        tracing::debug!(target = "arbor.scheduler", "prefetch queue reset");
    }

    /// Cancels the current run. Interrupted jobs go back into their queues, so a later
    /// [`PrefetchQueue::start`] resumes where this run left off.
    pub async fn stop(&self) {
        let (task, status) = {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.halt();
            state.last_milestone = Some(Milestone::Stopped);
            (
                self.shared.drain.lock().take(),
                state.status(Some(Milestone::Stopped)),
            )
        };
        await_drain(task).await;
        self.shared.idle.notify_waiters();
        self.shared.callbacks.status(&status);
        tracing::debug!(target = "arbor.scheduler", "prefetch run stopped");
    }

    pub fn status(&self) -> PrefetchStatus {
        let state = self.shared.state.lock();
        state.status(state.last_milestone)
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.shared.state.lock().loaded.contains(path)
    }

    pub fn loaded_count(&self) -> usize {
        self.shared.state.lock().loaded.len()
    }

    pub fn snapshot(&self, root: &DirectoryNode) -> PrefetchSnapshot {
        let state = self.shared.state.lock();
        PrefetchSnapshot {
            loaded_dir_file_counts: state
                .loaded_file_counts
                .iter()
                .map(|(path, count)| (path.clone(), *count))
                .collect(),
            indexed_file_count: state.indexed_file_count,
            shape_fingerprint: shape_fingerprint(root),
            saved_at: now_millis(),
        }
    }

    pub fn persist_snapshot(&self, root: &DirectoryNode, store: &dyn StorageBackend) -> Result<()> {
        let snapshot = self.snapshot(root);
        let dirs = snapshot.loaded_dir_file_counts.len();
        store.set(
            &self.shared.config.snapshot_key(),
            serde_json::to_value(&snapshot)?,
        )?;
        tracing::debug!(target = "arbor.scheduler", dirs, "persisted prefetch snapshot");
        Ok(())
    }

    /// Applies a persisted snapshot taken for the same root shape. Invalid snapshots are
    /// removed from `store`. Returns whether a snapshot was applied.
    pub fn restore_snapshot(&self, root: &DirectoryNode, store: &dyn StorageBackend) -> Result<bool> {
        let key = self.shared.config.snapshot_key();
        let Some(value) = store.get(&key)? else {
            return Ok(false);
        };
        let snapshot: PrefetchSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::debug!(
                    target = "arbor.scheduler",
                    error = %err,
                    "discarding unreadable prefetch snapshot"
                );
                store.remove(&key)?;
                return Ok(false);
            }
        };
        if let Err(rejection) = snapshot.check(root, self.shared.config.max_prefetched_dirs) {
            tracing::debug!(
                target = "arbor.scheduler",
                reason = %rejection,
                "discarding prefetch snapshot"
            );
            store.remove(&key)?;
            return Ok(false);
        }

        let restored = snapshot.loaded_dir_file_counts.len();
        {
            let mut state = self.shared.state.lock();
            for (path, count) in snapshot.loaded_dir_file_counts {
                state.primary.shift_remove(&path);
                state.deferred.shift_remove(&path);
                state.mark_loaded(&path, count);
            }
            state.indexed_file_count = state.indexed_file_count.max(snapshot.indexed_file_count);
        }
        tracing::info!(
            target = "arbor.scheduler",
            dirs = restored,
            "restored prefetch snapshot"
        );
        Ok(true)
    }
}

/// Immediate file count of every loaded directory in `tree`.
fn loaded_file_counts(tree: &DirectoryNode) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        if node.kind != NodeKind::Dir || !node.is_loaded {
            continue;
        }
        let files = node.children.iter().filter(|child| child.is_file()).count() as u64;
        out.push((node.path.clone(), files));
        stack.extend(node.children.iter().filter(|child| child.is_dir()));
    }
    out
}

async fn await_drain(task: Option<JoinHandle<()>>) {
    let Some(task) = task else {
        return;
    };
    if let Err(err) = task.await {
        tracing::debug!(
            target = "arbor.scheduler",
            error = %err,
            "prefetch drain task ended abnormally"
        );
    }
}

enum RunEnd {
    Restart,
    Finished(Milestone),
}

async fn drain(shared: Arc<Shared>, session: u64, token: CancellationToken) {
    loop {
        let mut workers = JoinSet::new();
        for worker_id in 0..shared.config.workers() {
            workers.spawn(worker(
                Arc::clone(&shared),
                session,
                token.clone(),
                worker_id,
            ));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    tracing::error!(
                        target = "arbor.scheduler",
                        error = %err,
                        "prefetch worker panicked"
                    );
                }
            }
        }
        if token.is_cancelled() {
            return;
        }

        let end = {
            let mut state = shared.state.lock();
            if state.session != session {
                return;
            }
            if state.has_queued_work() && !state.budget_exhausted {
                let processed = state.processed;
                if state
                    .stall
                    .observe(processed, shared.config.max_stall_restarts)
                {
                    RunEnd::Finished(Milestone::Stalled)
                } else {
                    RunEnd::Restart
                }
            } else if state.budget_exhausted {
                RunEnd::Finished(Milestone::BudgetExhausted)
            } else {
                RunEnd::Finished(Milestone::Drained)
            }
        };

        match end {
            RunEnd::Restart => {
                tracing::debug!(target = "arbor.scheduler", session, "restarting prefetch workers");
            }
            RunEnd::Finished(milestone) => {
                if finish_run(&shared, session, milestone) {
                    return;
                }
                tracing::debug!(
                    target = "arbor.scheduler",
                    session,
                    "work arrived while the run was finishing"
                );
            }
        }
    }
}

/// Reports the terminal status, then marks the run idle. The status callback has run by the
/// time [`PrefetchQueue::wait_idle`] resolves.
///
/// Returns `false` when targets were queued after a drained run decided to end; the run then
/// stays active and the caller continues it.
fn finish_run(shared: &Shared, session: u64, milestone: Milestone) -> bool {
    let status = {
        let state = shared.state.lock();
        if state.session != session {
            return true;
        }
        PrefetchStatus {
            running: false,
            ..state.status(Some(milestone))
        }
    };
    if milestone == Milestone::Stalled {
        tracing::warn!(
            target = "arbor.scheduler",
            session,
            pending = status.pending,
            deferred = status.deferred,
            "prefetch queue stalled; halting"
        );
    } else {
        tracing::debug!(
            target = "arbor.scheduler",
            session,
            processed = status.processed_count,
            ?milestone,
            "prefetch run finished"
        );
    }
    shared.callbacks.status(&status);

    {
        let mut state = shared.state.lock();
        if state.session == session {
            if milestone == Milestone::Drained && state.has_queued_work() {
                return false;
            }
            state.running = false;
            state.last_milestone = Some(milestone);
        }
    }
    shared.idle.notify_waiters();
    true
}

async fn worker(shared: Arc<Shared>, session: u64, token: CancellationToken, worker_id: usize) {
    let config = &shared.config;
    let mut completed = 0usize;
    loop {
        if token.is_cancelled() {
            return;
        }
        let notified = shared.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = {
            let mut state = shared.state.lock();
            if state.session != session {
                return;
            }
            state.next_step()
        };

        match step {
            Step::Run(target, class) => {
                if !run_job(&shared, session, &token, target, class).await {
                    return;
                }
                completed += 1;
                if config.batch_size > 0
                    && completed % config.batch_size == 0
                    && !config.batch_delay.is_zero()
                {
                    tokio::select! {
                        _ = tokio::time::sleep(config.batch_delay) => {}
                        _ = token.cancelled() => return,
                    }
                }
            }
            Step::Flush => {
                if !flush_primary_phase(&shared, session, &token) {
                    return;
                }
            }
            Step::Wait => {
                tokio::select! {
                    _ = notified => {}
                    _ = token.cancelled() => return,
                }
            }
            Step::Done => {
                tracing::trace!(target = "arbor.scheduler", worker_id, completed, "worker done");
                return;
            }
        }
    }
}

/// Runs one load. Returns `false` when the worker must exit because its session ended.
async fn run_job(
    shared: &Arc<Shared>,
    session: u64,
    token: &CancellationToken,
    target: PrefetchTarget,
    class: JobClass,
) -> bool {
    let started = Instant::now();
    let loader = Arc::clone(&shared.loader);
    let job_target = target.clone();
    // Separate task so a panicking loader surfaces as a join error.
    let mut job = tokio::spawn(async move { loader.load_directory(&job_target).await });
    let joined = tokio::select! {
        joined = &mut job => joined,
        _ = token.cancelled() => {
            job.abort();
            return false;
        }
    };
    if token.is_cancelled() {
        return false;
    }

    let outcome = match joined {
        Ok(Ok(result)) => JobOutcome::Loaded(result),
        Ok(Err(err)) => JobOutcome::Failed(format!("{err:#}")),
        Err(err) => JobOutcome::Failed(format!("directory loader panicked: {err}")),
    };
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let delivery = shared.delivery.lock();
    let deliveries = {
        let mut state = shared.state.lock();
        if state.session != session {
            return false;
        }
        state.complete_job(&shared.config, &target, class, outcome, elapsed_ms)
    };
    shared.work.notify_waiters();
    if let Some(result) = &deliveries.loaded {
        shared.callbacks.loaded(result);
        if deliveries.deferred {
            shared.callbacks.deferred(result);
        }
    }
    drop(delivery);
    dispatch(&shared.callbacks, deliveries);
    true
}

/// Error and status callbacks owed after a job; loaded results went out already.
fn dispatch(callbacks: &PrefetchCallbacks, deliveries: Deliveries) {
    if let Some(error) = &deliveries.error {
        callbacks.error(error);
    }
    if let Some(status) = &deliveries.status {
        callbacks.status(status);
    }
}

/// A primary flush in progress. Results not yet delivered go back to the queue state if
/// the flush does not finish, so a later run delivers them.
struct PendingFlush<'a> {
    shared: &'a Shared,
    session: u64,
    remaining: VecDeque<DirectoryLoadResult>,
    finished: bool,
}

impl Drop for PendingFlush<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let remaining = Vec::from(std::mem::take(&mut self.remaining));
        self.shared
            .state
            .lock()
            .restore_flush(self.session, remaining);
        self.shared.work.notify_waiters();
    }
}

/// Delivers buffered primary results, announces the phase boundary, then opens the deferred
/// queue.
fn flush_primary_phase(shared: &Shared, session: u64, token: &CancellationToken) -> bool {
    let _delivery = shared.delivery.lock();
    let buffer = {
        let mut state = shared.state.lock();
        if state.session != session || token.is_cancelled() {
            return false;
        }
        std::mem::take(&mut state.primary_buffer)
    };
    let delivered = buffer.len();
    let mut pending = PendingFlush {
        shared,
        session,
        remaining: buffer.into(),
        finished: false,
    };
    while let Some(result) = pending.remaining.pop_front() {
        shared.callbacks.loaded(&result);
    }

    let status = {
        let state = shared.state.lock();
        if state.session != session {
            return false;
        }
        state.status(Some(Milestone::PrimaryComplete))
    };
    shared.callbacks.status(&status);

    {
        let mut state = shared.state.lock();
        if state.session != session {
            return false;
        }
        state.deferred_open = true;
    }
    pending.finished = true;
    shared.work.notify_waiters();
    tracing::debug!(
        target = "arbor.scheduler",
        session,
        delivered,
        "primary prefetch phase complete"
    );
    true
}
