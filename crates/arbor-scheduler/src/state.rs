use std::collections::{HashMap, HashSet};

use arbor_core::{DirectoryLoadResult, PrefetchTarget};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::config::PrefetchConfig;
use crate::status::{Milestone, PrefetchError, PrefetchStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobClass {
    Primary,
    Deferred,
}

/// What a worker should do next.
pub(crate) enum Step {
    Run(PrefetchTarget, JobClass),
    /// Deliver the buffered primary results; the primary phase just ended.
    Flush,
    /// Nothing to take right now, but in-flight work may still produce some.
    Wait,
    Done,
}

pub(crate) enum JobOutcome {
    Loaded(Option<DirectoryLoadResult>),
    Failed(String),
}

/// Callbacks owed after a job completed, invoked once the lock is released.
#[derive(Default)]
pub(crate) struct Deliveries {
    pub(crate) loaded: Option<DirectoryLoadResult>,
    pub(crate) deferred: bool,
    pub(crate) error: Option<PrefetchError>,
    pub(crate) status: Option<PrefetchStatus>,
}

/// Counts restarts that made no progress.
#[derive(Debug, Default)]
pub(crate) struct StallDetector {
    last_processed: Option<u64>,
    strikes: u32,
}

impl StallDetector {
    /// Records a restart at `processed` completed jobs; `true` once `limit` consecutive
    /// restarts saw no progress.
    pub(crate) fn observe(&mut self, processed: u64, limit: u32) -> bool {
        if self.last_processed == Some(processed) {
            self.strikes += 1;
        } else {
            self.last_processed = Some(processed);
            self.strikes = 0;
        }
        self.strikes >= limit
    }
}

/// Everything the prefetch queue mutates, behind one lock.
pub(crate) struct QueueState {
    pub(crate) session: u64,
    /// Session this state was created for; a reset replaces the whole state.
    pub(crate) origin: u64,
    pub(crate) token: CancellationToken,
    pub(crate) running: bool,
    pub(crate) primary: IndexMap<String, PrefetchTarget>,
    pub(crate) deferred: IndexMap<String, PrefetchTarget>,
    pub(crate) in_flight: HashMap<String, (PrefetchTarget, JobClass)>,
    pub(crate) loaded: HashSet<String>,
    pub(crate) loaded_file_counts: HashMap<String, u64>,
    pub(crate) indexed_file_count: u64,
    pub(crate) prefetched: usize,
    pub(crate) processed: u64,
    pub(crate) last_duration_ms: u64,
    pub(crate) total_duration_ms: u64,
    pub(crate) primary_phase_complete: bool,
    pub(crate) deferred_open: bool,
    pub(crate) primary_buffer: Vec<DirectoryLoadResult>,
    /// Revalidated listings of in-flight jobs; they replace the job's own result.
    pub(crate) refreshed: HashMap<String, DirectoryLoadResult>,
    pub(crate) budget_exhausted: bool,
    pub(crate) stall: StallDetector,
    pub(crate) last_milestone: Option<Milestone>,
}

impl QueueState {
    pub(crate) fn new(session: u64) -> Self {
        Self {
            session,
            origin: session,
            token: CancellationToken::new(),
            running: false,
            primary: IndexMap::new(),
            deferred: IndexMap::new(),
            in_flight: HashMap::new(),
            loaded: HashSet::new(),
            loaded_file_counts: HashMap::new(),
            indexed_file_count: 0,
            prefetched: 0,
            processed: 0,
            last_duration_ms: 0,
            total_duration_ms: 0,
            primary_phase_complete: false,
            deferred_open: false,
            primary_buffer: Vec::new(),
            refreshed: HashMap::new(),
            budget_exhausted: false,
            stall: StallDetector::default(),
            last_milestone: None,
        }
    }

    /// Cancels outstanding work and starts a new session id. Returns the new id.
    pub(crate) fn bump_session(&mut self) -> u64 {
        self.session += 1;
        self.token.cancel();
        self.token = CancellationToken::new();
        self.running = false;
        self.session
    }

    fn in_flight_count(&self, class: JobClass) -> usize {
        self.in_flight
            .values()
            .filter(|(_, job_class)| *job_class == class)
            .count()
    }

    /// Queued targets, or buffered primary results still owed to the callbacks.
    pub(crate) fn has_queued_work(&self) -> bool {
        !self.primary.is_empty() || !self.deferred.is_empty() || !self.primary_buffer.is_empty()
    }

    /// Queues `target` unless it is known, too deep, or the budget is spent.
    pub(crate) fn enqueue(&mut self, config: &PrefetchConfig, target: PrefetchTarget) -> bool {
        if self.budget_exhausted
            || target.depth > config.max_depth
            || self.loaded.contains(&target.path)
            || self.primary.contains_key(&target.path)
            || self.deferred.contains_key(&target.path)
            || self.in_flight.contains_key(&target.path)
        {
            return false;
        }
        let queue = if config.is_deferred(&target.path) {
            &mut self.deferred
        } else {
            &mut self.primary
        };
        queue.insert(target.path.clone(), target);
        true
    }

    /// Records a loaded directory with `file_count` immediate files.
    pub(crate) fn mark_loaded(&mut self, path: &str, file_count: u64) {
        self.loaded.insert(path.to_string());
        let previous = self.loaded_file_counts.insert(path.to_string(), file_count);
        self.indexed_file_count = self
            .indexed_file_count
            .saturating_sub(previous.unwrap_or(0))
            .saturating_add(file_count);
    }

    /// Stops accepting work once either budget counter reaches the limit.
    pub(crate) fn check_budget(&mut self, config: &PrefetchConfig) -> bool {
        let limit = config.max_prefetched_dirs;
        if !self.budget_exhausted && (self.prefetched >= limit || self.loaded.len() >= limit) {
            self.budget_exhausted = true;
            let dropped = self.primary.len() + self.deferred.len();
            self.primary.clear();
            self.deferred.clear();
            tracing::info!(
                target = "arbor.scheduler",
                prefetched = self.prefetched,
                loaded = self.loaded.len(),
                dropped,
                "prefetch budget exhausted"
            );
        }
        self.budget_exhausted
    }

    pub(crate) fn next_step(&mut self) -> Step {
        if let Some((path, target)) = self.primary.shift_remove_index(0) {
            self.in_flight
                .insert(path, (target.clone(), JobClass::Primary));
            return Step::Run(target, JobClass::Primary);
        }
        if self.in_flight_count(JobClass::Primary) > 0 {
            return Step::Wait;
        }
        if !self.primary_phase_complete {
            self.primary_phase_complete = true;
            return Step::Flush;
        }
        if !self.deferred_open {
            return Step::Wait;
        }
        if let Some((path, target)) = self.deferred.shift_remove_index(0) {
            self.in_flight
                .insert(path, (target.clone(), JobClass::Deferred));
            return Step::Run(target, JobClass::Deferred);
        }
        if !self.in_flight.is_empty() {
            return Step::Wait;
        }
        Step::Done
    }

    pub(crate) fn complete_job(
        &mut self,
        config: &PrefetchConfig,
        target: &PrefetchTarget,
        class: JobClass,
        outcome: JobOutcome,
        elapsed_ms: u64,
    ) -> Deliveries {
        self.in_flight.remove(&target.path);
        let outcome = match (self.refreshed.remove(&target.path), outcome) {
            (Some(fresh), JobOutcome::Loaded(Some(_))) => JobOutcome::Loaded(Some(fresh)),
            (_, outcome) => outcome,
        };
        self.processed += 1;
        self.last_duration_ms = elapsed_ms;
        self.total_duration_ms = self.total_duration_ms.saturating_add(elapsed_ms);

        let mut out = Deliveries::default();
        match outcome {
            JobOutcome::Loaded(Some(result)) => {
                self.mark_loaded(&target.path, result.file_count);
                self.prefetched += 1;
                for pending in &result.pending_targets {
                    self.enqueue(config, pending.clone());
                }
                if class == JobClass::Primary && !self.primary_phase_complete {
                    self.primary_buffer.push(result);
                } else {
                    out.deferred = class == JobClass::Deferred;
                    out.loaded = Some(result);
                }
                self.check_budget(config);
            }
            JobOutcome::Loaded(None) => {
                tracing::debug!(
                    target = "arbor.scheduler",
                    path = %target.path,
                    "directory disappeared before it was loaded"
                );
            }
            JobOutcome::Failed(message) => {
                out.error = Some(PrefetchError {
                    message,
                    path: target.path.clone(),
                });
            }
        }

        if config.status_interval > 0 && self.processed % config.status_interval == 0 {
            out.status = Some(self.status(None));
        }
        out
    }

    /// Takes a newer listing of a directory that may already be on its way to the callbacks.
    ///
    /// An in-flight job will deliver it in place of its own result and a buffered primary
    /// result is replaced. Otherwise the listing is returned for immediate delivery. Its
    /// pending targets are queued; returns how many were accepted.
    pub(crate) fn refresh(
        &mut self,
        config: &PrefetchConfig,
        result: DirectoryLoadResult,
    ) -> (usize, Option<DirectoryLoadResult>) {
        let accepted = result
            .pending_targets
            .iter()
            .filter(|target| self.enqueue(config, (*target).clone()))
            .count();
        let path = result.node.path.clone();
        if self.in_flight.contains_key(&path) {
            self.refreshed.insert(path, result);
            return (accepted, None);
        }
        if self.loaded.contains(&path) {
            self.mark_loaded(&path, result.file_count);
        }
        match self
            .primary_buffer
            .iter_mut()
            .find(|buffered| buffered.node.path == path)
        {
            Some(slot) => {
                *slot = result;
                (accepted, None)
            }
            None => (accepted, Some(result)),
        }
    }

    /// Cancels the session for a stop. Interrupted jobs are requeued and a primary flush that
    /// had not finished will run again.
    pub(crate) fn halt(&mut self) {
        self.bump_session();
        self.requeue_in_flight();
        if self.primary_phase_complete && !self.deferred_open {
            self.primary_phase_complete = false;
        }
    }

    /// Returns a flush that could not be delivered by a worker of `session`. Ignored when the
    /// state was reset since.
    pub(crate) fn restore_flush(&mut self, session: u64, mut buffer: Vec<DirectoryLoadResult>) {
        if session < self.origin || self.deferred_open {
            return;
        }
        buffer.append(&mut self.primary_buffer);
        self.primary_buffer = buffer;
        self.primary_phase_complete = false;
    }

    /// Puts interrupted jobs back at the end of their queues.
    pub(crate) fn requeue_in_flight(&mut self) {
        for (path, (target, class)) in self.in_flight.drain() {
            match class {
                JobClass::Primary => self.primary.insert(path, target),
                JobClass::Deferred => self.deferred.insert(path, target),
            };
        }
    }

    pub(crate) fn status(&self, milestone: Option<Milestone>) -> PrefetchStatus {
        let average_duration_ms = if self.processed == 0 {
            0
        } else {
            self.total_duration_ms / self.processed
        };
        PrefetchStatus {
            running: self.running,
            pending: self.primary.len(),
            deferred: self.deferred.len(),
            indexed_file_count: self.indexed_file_count,
            processed_count: self.processed,
            last_duration_ms: self.last_duration_ms,
            average_duration_ms,
            milestone,
        }
    }
}
