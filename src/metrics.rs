//! Scheduling counters.
//!
//! The runtime calls these trampolines at a few well-defined points: parallel
//! loop entry and exit, a task being shared to a specific worker's mailbox, a
//! task being stolen, and task creation/retirement. They are single relaxed
//! atomic increments so they stay cheap enough for the hot paths that call
//! them.

use std::sync::atomic::{AtomicU64, Ordering};

static PAR_FORS_STARTED: AtomicU64 = AtomicU64::new(0);
static PAR_FORS_ENDED: AtomicU64 = AtomicU64::new(0);
static TASKS_CREATED: AtomicU64 = AtomicU64::new(0);
static TASKS_EXECUTED: AtomicU64 = AtomicU64::new(0);
static TASKS_SHARED: AtomicU64 = AtomicU64::new(0);
static TASKS_STOLEN: AtomicU64 = AtomicU64::new(0);
static TASKS_UNDIVIDED: AtomicU64 = AtomicU64::new(0);

/// Totals of all counters since process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Top-level parallel loops entered.
    pub par_fors_started: u64,
    /// Top-level parallel loops that ran to completion.
    pub par_fors_ended: u64,
    /// Tasks materialized for scheduling (the inline-executed root of each
    /// loop is not a scheduled task and is not counted).
    pub tasks_created: u64,
    /// Tasks taken off a queue (or executed inline after a full queue) and run.
    pub tasks_executed: u64,
    /// Tasks delivered to a specific worker's mailbox during an initial split.
    pub tasks_shared: u64,
    /// Tasks obtained by stealing from another worker.
    pub tasks_stolen: u64,
    /// Tasks that retired their whole range without ever splitting.
    pub tasks_undivided: u64,
}

/// Read all counters. Counters are process-wide; callers interested in one
/// region should subtract two snapshots.
pub fn snapshot() -> Snapshot {
    Snapshot {
        par_fors_started: PAR_FORS_STARTED.load(Ordering::Relaxed),
        par_fors_ended: PAR_FORS_ENDED.load(Ordering::Relaxed),
        tasks_created: TASKS_CREATED.load(Ordering::Relaxed),
        tasks_executed: TASKS_EXECUTED.load(Ordering::Relaxed),
        tasks_shared: TASKS_SHARED.load(Ordering::Relaxed),
        tasks_stolen: TASKS_STOLEN.load(Ordering::Relaxed),
        tasks_undivided: TASKS_UNDIVIDED.load(Ordering::Relaxed),
    }
}

#[inline]
pub(crate) fn par_for_started() {
    PAR_FORS_STARTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn par_for_ended() {
    PAR_FORS_ENDED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn task_created() {
    TASKS_CREATED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn task_executed() {
    TASKS_EXECUTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn task_shared() {
    TASKS_SHARED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn task_stolen() {
    TASKS_STOLEN.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn task_undivided() {
    TASKS_UNDIVIDED.fetch_add(1, Ordering::Relaxed);
}

impl std::ops::Sub for Snapshot {
    type Output = Snapshot;

    fn sub(self, rhs: Snapshot) -> Snapshot {
        Snapshot {
            par_fors_started: self.par_fors_started - rhs.par_fors_started,
            par_fors_ended: self.par_fors_ended - rhs.par_fors_ended,
            tasks_created: self.tasks_created - rhs.tasks_created,
            tasks_executed: self.tasks_executed - rhs.tasks_executed,
            tasks_shared: self.tasks_shared - rhs.tasks_shared,
            tasks_stolen: self.tasks_stolen - rhs.tasks_stolen,
            tasks_undivided: self.tasks_undivided - rhs.tasks_undivided,
        }
    }
}
