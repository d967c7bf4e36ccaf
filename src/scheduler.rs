//! Admission control for image lifecycles.
//!
//! Pending work is ordered by priority (then submission order), running work
//! is bounded by `max_parallel_tasks`, and requests for a resource that is
//! already pending or running wait for that fetch instead of starting their
//! own. Admission and lifecycles run on one dedicated rayon pool; requests
//! with a delay wait on a timer thread instead of holding a worker.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::config::Configuration;
use crate::decoder::{DecodedImage, ImageInformation};
use crate::error::{LoadError, LoadResult};
use crate::lifecycle::{LoaderTask, TaskOutcome};

/// Scheduler counters and queue sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub memory_cache_hits: u64,
    /// Requests that waited on an identical in-flight fetch.
    pub coalesced: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Admissions still waiting out their request delay.
    pub delayed: usize,
    pub pending: usize,
    pub running: usize,
    pub waiting: usize,
    pub max_running_observed: usize,
    pub max_parallel_tasks: usize,
}

/// Pending order: higher priority first, then FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueSlot {
    priority: Reverse<i32>,
    sequence: u64,
}

impl QueueSlot {
    fn of(task: &LoaderTask) -> Self {
        Self {
            priority: Reverse(task.priority()),
            sequence: task.sequence(),
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    pending: BTreeMap<QueueSlot, Arc<LoaderTask>>,
    pending_by_raw: HashMap<String, QueueSlot>,
    running: HashMap<String, Arc<LoaderTask>>,
    running_preload: usize,
    /// Every submitted task that has not settled yet.
    live: HashMap<u64, Arc<LoaderTask>>,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn owner_of(&self, raw: &str) -> Option<Arc<LoaderTask>> {
        self.running.get(raw).cloned().or_else(|| {
            self.pending_by_raw
                .get(raw)
                .and_then(|slot| self.pending.get(slot))
                .cloned()
        })
    }

    fn insert_pending(&mut self, task: Arc<LoaderTask>) {
        let slot = QueueSlot::of(&task);
        self.pending_by_raw.insert(task.raw_key(), slot);
        self.pending.insert(slot, task);
    }

    fn remove_pending(&mut self, raw: &str, id: u64) -> Option<Arc<LoaderTask>> {
        let slot = *self.pending_by_raw.get(raw)?;
        if self.pending.get(&slot).map(|t| t.id()) != Some(id) {
            return None;
        }
        self.pending_by_raw.remove(raw);
        self.pending.remove(&slot)
    }

    /// Raise `owner` to `priority`, re-ordering it if still pending.
    fn promote(&mut self, owner: &Arc<LoaderTask>, priority: i32) {
        let raw = owner.raw_key();
        match self.remove_pending(&raw, owner.id()) {
            Some(task) => {
                task.set_priority(priority);
                self.insert_pending(task);
            }
            None => owner.set_priority(priority),
        }
    }
}

/// Admissions waiting out their request delay, earliest deadline first.
#[derive(Default)]
struct DelayQueue {
    entries: Mutex<DelayEntries>,
    wake: Condvar,
}

#[derive(Default)]
struct DelayEntries {
    due: BTreeMap<(Instant, u64), Arc<LoaderTask>>,
    shutdown: bool,
}

impl DelayQueue {
    fn push(&self, deadline: Instant, task: Arc<LoaderTask>) {
        let mut entries = self.entries.lock();
        let earliest = !entries
            .due
            .keys()
            .next()
            .is_some_and(|(first, _)| *first <= deadline);
        entries.due.insert((deadline, task.id()), task);
        if earliest {
            self.wake.notify_one();
        }
    }

    fn remove(&self, id: u64) -> Option<Arc<LoaderTask>> {
        let mut entries = self.entries.lock();
        let key = entries
            .due
            .iter()
            .find(|(_, task)| task.id() == id)
            .map(|(key, _)| *key)?;
        entries.due.remove(&key)
    }

    fn len(&self) -> usize {
        self.entries.lock().due.len()
    }

    fn shutdown(&self) {
        self.entries.lock().shutdown = true;
        self.wake.notify_all();
    }

    /// Block until at least one deadline passes and return every expired
    /// entry. `None` once shut down.
    fn next_due(&self) -> Option<Vec<Arc<LoaderTask>>> {
        let mut entries = self.entries.lock();
        loop {
            if entries.shutdown {
                return None;
            }
            let now = Instant::now();
            match entries.due.keys().next().copied() {
                None => {
                    self.wake.wait(&mut entries);
                }
                Some((deadline, _)) if deadline > now => {
                    self.wake.wait_until(&mut entries, deadline);
                }
                Some(_) => {
                    let later = entries.due.split_off(&(now, u64::MAX));
                    let expired = std::mem::replace(&mut entries.due, later);
                    return Some(expired.into_values().collect());
                }
            }
        }
    }
}

fn run_delay_timer(queue: Arc<DelayQueue>, scheduler: Weak<WorkScheduler>) {
    while let Some(expired) = queue.next_due() {
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        for task in expired {
            scheduler.spawn_admission(task);
        }
    }
}

enum Admission {
    Cancelled,
    CacheHit((DecodedImage, ImageInformation)),
    Queued,
    Waiting,
}

/// Priority queue + bounded running set + waiters.
pub struct WorkScheduler {
    pool: rayon::ThreadPool,
    max_parallel: usize,
    preload_limit: usize,
    /// Lock order: `state` before `waiters`.
    state: Mutex<SchedulerState>,
    waiters: Mutex<Vec<Arc<LoaderTask>>>,
    delayed: Arc<DelayQueue>,
    exit_tasks_early: AtomicBool,
    pause_work: AtomicBool,
    next_sequence: AtomicU64,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl WorkScheduler {
    /// Build the scheduler, its worker pool
    /// (`max_parallel_tasks + admission_threads` threads) and the delay timer.
    pub(crate) fn new(config: &Configuration) -> LoadResult<Arc<Self>> {
        let max_parallel = config.effective_max_parallel_tasks();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_parallel + config.admission_threads.max(1))
            .thread_name(|idx| format!("fastload-worker-{idx}"))
            .build()
            .map_err(|e| LoadError::Config(format!("failed to create worker pool: {e}")))?;

        let state = SchedulerState {
            stats: SchedulerStats {
                max_parallel_tasks: max_parallel,
                ..Default::default()
            },
            ..Default::default()
        };

        let scheduler = Arc::new(Self {
            pool,
            max_parallel,
            preload_limit: config.preload_slot_limit(),
            state: Mutex::new(state),
            waiters: Mutex::new(Vec::new()),
            delayed: Arc::new(DelayQueue::default()),
            exit_tasks_early: AtomicBool::new(false),
            pause_work: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });

        let queue = Arc::clone(&scheduler.delayed);
        let weak = Arc::downgrade(&scheduler);
        std::thread::Builder::new()
            .name("fastload-delay".to_string())
            .spawn(move || run_delay_timer(queue, weak))
            .map_err(|e| LoadError::Config(format!("failed to spawn delay timer: {e}")))?;

        Ok(scheduler)
    }

    pub fn max_parallel_tasks(&self) -> usize {
        self.max_parallel
    }

    /// Admit a new lifecycle. Never fails; problems surface through the
    /// request's callbacks.
    pub(crate) fn submit(self: &Arc<Self>, task: Arc<LoaderTask>) {
        *self.outstanding.lock() += 1;
        task.set_sequence(self.next_sequence.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.state.lock();
            state.stats.submitted += 1;
            state.live.insert(task.id(), Arc::clone(&task));
        }

        if self.exit_tasks_early.load(Ordering::Acquire) {
            debug!(task = task.id(), "Exit-early set, disposing request");
            task.finalize(TaskOutcome::Cancelled, false);
            return;
        }

        if let Some(error) = task.take_key_error() {
            task.reject(error);
            return;
        }

        let delay = task.admission_delay();
        if !delay.is_zero() {
            self.delay_admission(task, delay);
            return;
        }
        if !task.needs_init() && task.try_load_from_memory_cache() {
            self.record_memory_hit();
            return;
        }
        self.spawn_admission(task);
    }

    /// Park `task` on the delay timer; it reaches the pool once `delay`
    /// has passed.
    fn delay_admission(&self, task: Arc<LoaderTask>, delay: Duration) {
        debug!(task = task.id(), delay_ms = delay.as_millis() as u64, "Delaying admission");
        self.delayed.push(Instant::now() + delay, Arc::clone(&task));
        // A cancel racing the push found nothing to remove.
        if task.token().is_cancelled() {
            if let Some(task) = self.delayed.remove(task.id()) {
                task.finalize(TaskOutcome::Cancelled, true);
            }
        }
    }

    fn spawn_admission(self: &Arc<Self>, task: Arc<LoaderTask>) {
        let scheduler = Arc::clone(self);
        self.pool.spawn(move || {
            let admitted = catch_unwind(AssertUnwindSafe(|| scheduler.admit(&task)));
            if admitted.is_err() {
                error!(task = task.id(), "Admission panicked");
                task.finalize(TaskOutcome::Failed, true);
            }
        });
    }

    /// Stream init, memory check and loading placeholder, then queue.
    fn admit(self: &Arc<Self>, task: &Arc<LoaderTask>) {
        if task.token().is_cancelled() {
            task.finalize(TaskOutcome::Cancelled, true);
            return;
        }
        if let Err(e) = task.init() {
            task.complete_with_error(e);
            return;
        }
        if task.try_load_from_memory_cache() {
            self.record_memory_hit();
            return;
        }
        if let Err(e) = task.show_loading_placeholder() {
            if e.is_cancelled() {
                task.finalize(TaskOutcome::Cancelled, true);
                return;
            }
            debug!(task = task.id(), error = %e, "Loading placeholder failed");
        }
        self.enqueue(Arc::clone(task));
    }

    fn enqueue(self: &Arc<Self>, task: Arc<LoaderTask>) {
        let admission = {
            let mut state = self.state.lock();
            if task.token().is_cancelled() || self.exit_tasks_early.load(Ordering::Acquire) {
                Admission::Cancelled
            } else if let Some(owner) = state.owner_of(&task.raw_key()) {
                if task.priority() > owner.priority() {
                    state.promote(&owner, task.priority());
                }
                if let Some(progress) = task.request().download_progress_callback() {
                    owner.add_progress_listener(progress);
                }
                task.mark_queued();
                self.waiters.lock().push(Arc::clone(&task));
                state.stats.coalesced += 1;
                Admission::Waiting
            } else if let Some(hit) = task.lookup_memory_cache() {
                // A fetch for this key finished since the last lookup.
                Admission::CacheHit(hit)
            } else {
                task.mark_queued();
                state.insert_pending(Arc::clone(&task));
                Admission::Queued
            }
        };

        match admission {
            Admission::Cancelled => task.finalize(TaskOutcome::Cancelled, true),
            Admission::CacheHit(hit) => {
                task.complete_from_cache(hit);
                self.record_memory_hit();
            }
            Admission::Waiting => {
                debug!(task = task.id(), key = %task.raw_key(), "Waiting on in-flight fetch");
            }
            Admission::Queued => {
                debug!(task = task.id(), priority = task.priority(), "Queued");
            }
        }
        self.drain();
    }

    /// Move pending work into free running slots.
    fn drain(self: &Arc<Self>) {
        if self.pause_work.load(Ordering::Acquire) {
            return;
        }

        let mut launch = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            while state.running.len() < self.max_parallel {
                let preload_full = state.running_preload >= self.preload_limit;
                let next = state
                    .pending
                    .iter()
                    .find(|(_, task)| {
                        !(preload_full && task.request().is_preload())
                            && !state.running.contains_key(&task.raw_key())
                    })
                    .map(|(slot, _)| *slot);
                let Some(slot) = next else {
                    break;
                };
                let Some(task) = state.pending.remove(&slot) else {
                    break;
                };

                let raw = task.raw_key();
                state.pending_by_raw.remove(&raw);
                if task.request().is_preload() {
                    state.running_preload += 1;
                }
                task.mark_dispatched();
                state.running.insert(raw, Arc::clone(&task));
                state.stats.dispatched += 1;
                state.stats.max_running_observed =
                    state.stats.max_running_observed.max(state.running.len());
                launch.push(task);
            }
        }

        for task in launch {
            debug!(task = task.id(), priority = task.priority(), "Dispatching");
            let scheduler = Arc::clone(self);
            self.pool.spawn(move || scheduler.execute(task));
        }
    }

    fn execute(self: &Arc<Self>, task: Arc<LoaderTask>) {
        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!(task = task.id(), "Lifecycle panicked");
            task.finalize(TaskOutcome::Failed, true);
        }
        self.on_task_finished(&task);
    }

    /// Release the slot, re-admit waiters, refill, then settle.
    fn on_task_finished(self: &Arc<Self>, task: &Arc<LoaderTask>) {
        let raw = task.raw_key();
        let waiting = {
            let mut state = self.state.lock();
            if state.running.get(&raw).is_some_and(|t| t.id() == task.id()) {
                state.running.remove(&raw);
                if task.request().is_preload() {
                    state.running_preload = state.running_preload.saturating_sub(1);
                }
            }
            let mut waiters = self.waiters.lock();
            let (matching, rest): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|w| w.raw_key() == raw);
            *waiters = rest;
            matching
        };

        for waiter in waiting {
            self.readmit(waiter);
        }
        self.drain();
        self.task_settled(task.id(), task.outcome().unwrap_or(TaskOutcome::Failed));
    }

    fn readmit(self: &Arc<Self>, task: Arc<LoaderTask>) {
        if task.token().is_cancelled() {
            task.finalize(TaskOutcome::Cancelled, true);
        } else if task.try_load_from_memory_cache() {
            self.record_memory_hit();
        } else {
            self.enqueue(task);
        }
    }

    fn record_memory_hit(&self) {
        self.state.lock().stats.memory_cache_hits += 1;
    }

    /// Called once per task when it no longer occupies any scheduler
    /// structure.
    pub(crate) fn task_settled(&self, id: u64, outcome: TaskOutcome) {
        {
            let mut state = self.state.lock();
            state.live.remove(&id);
            match outcome {
                TaskOutcome::Success => state.stats.succeeded += 1,
                TaskOutcome::Failed => state.stats.failed += 1,
                TaskOutcome::Cancelled => state.stats.cancelled += 1,
            }
        }
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Remove a cancelled task from pending or waiters and finish it. Running
    /// tasks observe their token instead.
    pub(crate) fn remove_pending(self: &Arc<Self>, task: &LoaderTask) {
        if let Some(delayed) = self.delayed.remove(task.id()) {
            debug!(task = delayed.id(), "Removed from delay queue");
            delayed.finalize(TaskOutcome::Cancelled, true);
            return;
        }

        let raw = task.raw_key();
        let (removed, orphans) = {
            let mut state = self.state.lock();
            let mut waiters = self.waiters.lock();
            match state.remove_pending(&raw, task.id()) {
                Some(owner) => {
                    // Waiters on a withdrawn fetch need a new owner.
                    let (orphans, rest): (Vec<_>, Vec<_>) =
                        waiters.drain(..).partition(|w| w.raw_key() == raw);
                    *waiters = rest;
                    (Some(owner), orphans)
                }
                None => {
                    let removed = waiters
                        .iter()
                        .position(|w| w.id() == task.id())
                        .map(|pos| waiters.remove(pos));
                    (removed, Vec::new())
                }
            }
        };

        if let Some(removed) = removed {
            debug!(task = removed.id(), "Removed from queue");
            removed.finalize(TaskOutcome::Cancelled, true);
        }
        for orphan in orphans {
            self.readmit(orphan);
        }
    }

    /// Cancel every unsettled task matching `predicate`. Returns the number
    /// of tasks signalled.
    pub(crate) fn cancel_where(&self, predicate: impl Fn(&LoaderTask) -> bool) -> usize {
        let matching: Vec<Arc<LoaderTask>> = self
            .state
            .lock()
            .live
            .values()
            .filter(|task| predicate(task))
            .cloned()
            .collect();
        for task in &matching {
            task.cancel();
        }
        matching.len()
    }

    /// When set, queued and waiting work is cancelled without error
    /// callbacks and new submissions are dropped. Running work completes.
    pub(crate) fn set_exit_tasks_early(self: &Arc<Self>, exit: bool) {
        self.exit_tasks_early.store(exit, Ordering::Release);
        if !exit {
            return;
        }
        debug!("Exit-early set, cancelling queued work");
        self.pause_work.store(false, Ordering::Release);
        let cancelled = self.cancel_where(|task| !task.is_dispatched());
        debug!(cancelled, "Queued work cancelled");
        self.drain();
    }

    pub(crate) fn set_pause_work(self: &Arc<Self>, pause: bool) {
        let was_paused = self.pause_work.swap(pause, Ordering::AcqRel);
        debug!(pause, "Pause work");
        if was_paused && !pause {
            self.drain();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_work.load(Ordering::Acquire)
    }

    pub fn is_exiting_early(&self) -> bool {
        self.exit_tasks_early.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let waiting = self.waiters.lock().len();
        SchedulerStats {
            delayed: self.delayed.len(),
            pending: state.pending.len(),
            running: state.running.len(),
            waiting,
            ..state.stats.clone()
        }
    }

    /// Block until every submitted task has settled. Returns false on
    /// timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            if self.idle.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }
}

impl Drop for WorkScheduler {
    fn drop(&mut self) {
        self.delayed.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ImageRequest;
    use crate::test_utils::{test_context, FakeResolver};

    fn delayed_task(id: u64) -> Arc<LoaderTask> {
        let ctx = test_context(FakeResolver::new() as _);
        let request = ImageRequest::from_url(format!("https://x/{id}.jpg")).build();
        Arc::new(LoaderTask::new(id, request, None, ctx, Weak::new()))
    }

    fn task_with(priority: i32, sequence: u64) -> QueueSlot {
        QueueSlot {
            priority: Reverse(priority),
            sequence,
        }
    }

    #[test]
    fn test_queue_slot_orders_priority_then_fifo() {
        let mut slots = vec![
            task_with(0, 2),
            task_with(10, 3),
            task_with(0, 1),
            task_with(-5, 0),
        ];
        slots.sort();
        assert_eq!(
            slots,
            vec![
                task_with(10, 3),
                task_with(0, 1),
                task_with(0, 2),
                task_with(-5, 0),
            ]
        );
    }

    #[test]
    fn test_new_sizes_pool_from_config() {
        let config = Configuration {
            max_parallel_tasks: Some(3),
            admission_threads: 2,
            ..Default::default()
        };
        let scheduler = WorkScheduler::new(&config).unwrap();
        assert_eq!(scheduler.max_parallel_tasks(), 3);
        assert_eq!(scheduler.pool.current_num_threads(), 5);
        assert_eq!(scheduler.stats().max_parallel_tasks, 3);
        assert!(scheduler.wait_for_idle(Duration::from_millis(1)));
    }

    #[test]
    fn test_delay_queue_releases_by_deadline() {
        let queue = DelayQueue::default();
        let start = Instant::now();
        queue.push(start + Duration::from_secs(2), delayed_task(1));
        queue.push(start + Duration::from_millis(10), delayed_task(2));
        assert_eq!(queue.len(), 2);

        let expired = queue.next_due().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(expired.iter().map(|t| t.id()).collect::<Vec<_>>(), vec![2]);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.remove(1).map(|t| t.id()), Some(1));
        assert!(queue.remove(1).is_none());
        queue.shutdown();
        assert!(queue.next_due().is_none());
    }
}
