use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Edge-triggered wait/notify with coalesced wake-ups: any number of
/// notifications before a wait collapse into one.
#[derive(Default)]
pub struct WaitNotify {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl WaitNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until notified or the timeout elapses, then consume the flag.
    pub fn wait_for(&self, timeout: Duration) {
        let mut notified = self.notified.lock();
        if !*notified {
            self.cv.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }

    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        drop(notified);
        self.cv.notify_one();
    }

    /// Wake every waiter without setting the flag; used on shutdown so
    /// loops observe the stop flag promptly.
    pub fn interrupt(&self) {
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct MergeQueueState {
    pending: HashSet<String>,
    active: HashSet<String>,
}

/// Tables awaiting a merge pass. A table is handed to at most one worker at
/// a time; a re-trigger while it is active stays pending until the worker
/// finishes. `wait_idle` lets a flush act as a barrier for the merges it
/// triggered.
#[derive(Default)]
pub struct MergeQueue {
    state: Mutex<MergeQueueState>,
    idle_cv: Condvar,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, table_id: &str) {
        self.state.lock().pending.insert(table_id.to_string());
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Move pending tables into the active phase, skipping any table a
    /// worker is still merging.
    pub fn take_all(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let ready: Vec<String> = state
            .pending
            .iter()
            .filter(|table| !state.active.contains(*table))
            .cloned()
            .collect();
        for table in &ready {
            state.pending.remove(table);
            state.active.insert(table.clone());
        }
        ready
    }

    /// A merge pass finished for one table.
    pub fn done(&self, table_id: &str) {
        let mut state = self.state.lock();
        state.active.remove(table_id);
        if state.active.is_empty() && state.pending.is_empty() {
            self.idle_cv.notify_all();
        }
    }

    /// Block until no merge work is pending or running, bounded by
    /// `timeout`. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.active.is_empty() || !state.pending.is_empty() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.idle_cv.wait_for(&mut state, deadline - now);
        }
        true
    }
}

/// Per-table flush/merge/compact exclusion. The lock guards catalog state
/// transitions only and is never held across segment I/O.
#[derive(Default)]
pub struct TableLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(table_id.to_string())
            .or_default()
            .clone()
    }
}

const MAX_BUILD_FAILURES: u32 = 3;

/// Per-file consecutive build failure counter. A file that keeps failing is
/// blacklisted from further attempts for the process lifetime.
#[derive(Default)]
pub struct IndexFailedChecker {
    failures: Mutex<HashMap<i64, u32>>,
}

impl IndexFailedChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, file_id: i64) -> u32 {
        let mut failures = self.failures.lock();
        let count = failures.entry(file_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&self, file_id: i64) {
        self.failures.lock().remove(&file_id);
    }

    pub fn is_blacklisted(&self, file_id: i64) -> bool {
        self.failures
            .lock()
            .get(&file_id)
            .map(|count| *count >= MAX_BUILD_FAILURES)
            .unwrap_or(false)
    }
}

/// Tracks files with an in-flight index build so the loop never submits the
/// same file twice.
#[derive(Default)]
pub struct BuildGuard {
    building: Mutex<HashSet<i64>>,
}

impl BuildGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, file_id: i64) -> bool {
        self.building.lock().insert(file_id)
    }

    pub fn release(&self, file_id: i64) {
        self.building.lock().remove(&file_id);
    }
}

pub fn worker_pool(name: &'static str, threads: usize) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |idx| format!("{name}-{idx}"))
        .build()
        .expect("build worker pool")
}
