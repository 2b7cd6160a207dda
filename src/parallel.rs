//! The parallel-for facade: policy selection, the top-level entry points, and
//! the process-wide pool.
//!
//! A call builds a root lifetime node, runs the initial task inline on the
//! caller, and then *drains*: instead of blocking, the caller keeps executing
//! other pool work until the root's reference count returns to 1, which
//! happens exactly when every task descended from this call has retired.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::config;
use crate::metrics;
use crate::partition::{
    Policy, RangeTask, ShareThenSteal, ShareThenStealDelayed, ShareThenStealDelayedAutoGrain,
    Span, StealDelayed, StealDelayedAutoGrain, StealOnly,
};
use crate::platform;
use crate::pool::{PoolState, ThreadPool};
use crate::sync::spin_barrier::SpinBarrier;
use crate::task::{FnTask, RawTask, TaskNode, TaskRun};

/// How a parallel loop schedules its work.
///
/// | mode                   | initial sharing | balancing | grain |
/// |------------------------|-----------------|-----------|-------|
/// | `Stealing`             | no              | static    | fixed |
/// | `Sharing`              | yes             | static    | fixed |
/// | `StealingGrain`        | no              | timespan  | fixed |
/// | `SharingStealing`      | yes             | timespan  | fixed |
/// | `StealingGrainAuto`    | no              | timespan  | auto  |
/// | `SharingStealingAuto`  | yes             | timespan  | auto  |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Stealing,
    Sharing,
    StealingGrain,
    SharingStealing,
    StealingGrainAuto,
    SharingStealingAuto,
}

static DEFAULT_MODE: AtomicU8 = AtomicU8::new(Mode::SharingStealingAuto as u8);

/// Set the mode used by calls that don't pick one explicitly.
pub fn set_default_mode(mode: Mode) {
    DEFAULT_MODE.store(mode as u8, Ordering::Relaxed);
}

fn default_mode() -> Mode {
    match DEFAULT_MODE.load(Ordering::Relaxed) {
        x if x == Mode::Stealing as u8 => Mode::Stealing,
        x if x == Mode::Sharing as u8 => Mode::Sharing,
        x if x == Mode::StealingGrain as u8 => Mode::StealingGrain,
        x if x == Mode::SharingStealing as u8 => Mode::SharingStealing,
        x if x == Mode::StealingGrainAuto as u8 => Mode::StealingGrainAuto,
        _ => Mode::SharingStealingAuto,
    }
}

/// Drains the pool until the root node is the loop's only live reference.
/// Running in a drop guard keeps the wait (and therefore the soundness of the
/// borrowed user closure) intact even when an iteration panics on the caller.
struct DrainGuard<'a> {
    state: &'a PoolState,
    root: &'a Arc<TaskNode>,
}

impl DrainGuard<'_> {
    /// A task panicked somewhere in the pool; some of this loop's iterations
    /// may be gone and queued tasks may be stranded, so draining can no longer
    /// be relied on to finish. Stop the pool, wait for the surviving workers
    /// to exit (nothing may touch the user closure after this frame unwinds),
    /// and surface the failure.
    fn abort_poisoned(&self) {
        self.state.cancel();
        while self.state.spawned_workers_alive() > 0 {
            platform::cpu_relax();
        }
        if !std::thread::panicking() {
            panic!("a worker thread panicked while running parallel tasks");
        }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        loop {
            // poison is checked first: a panicking task raises it before
            // releasing its node, so a loop that lost iterations cannot be
            // mistaken for one that completed
            if self.state.is_poisoned() {
                self.abort_poisoned();
                return;
            }
            if Arc::strong_count(self.root) == 1 {
                break;
            }
            if !self.state.try_execute_one() {
                platform::cpu_relax();
            }
        }
        self.state.park_caller_runnext();
    }
}

fn run_parallel_for<P: Policy, F: Fn(usize) + Sync>(
    state: &PoolState,
    from: usize,
    to: usize,
    grain: usize,
    f: &F,
) {
    if from >= to {
        return;
    }

    let root = TaskNode::root();
    let task = RangeTask::<F, P>::initial(
        state,
        TaskNode::child(&root),
        Span::new(from, to),
        f,
        Span::new(0, state.num_workers()),
        grain,
    );
    metrics::par_for_started();

    let guard = DrainGuard { state, root: &root };
    task.run();
    drop(guard);
    metrics::par_for_ended();
}

fn dispatch<F: Fn(usize) + Sync>(
    state: &PoolState,
    mode: Mode,
    from: usize,
    to: usize,
    grain: usize,
    f: &F,
) {
    match mode {
        Mode::Stealing => run_parallel_for::<StealOnly, F>(state, from, to, grain, f),
        Mode::Sharing => run_parallel_for::<ShareThenSteal, F>(state, from, to, grain, f),
        Mode::StealingGrain => run_parallel_for::<StealDelayed, F>(state, from, to, grain, f),
        Mode::SharingStealing => {
            run_parallel_for::<ShareThenStealDelayed, F>(state, from, to, grain, f)
        }
        Mode::StealingGrainAuto => {
            run_parallel_for::<StealDelayedAutoGrain, F>(state, from, to, grain, f)
        }
        Mode::SharingStealingAuto => {
            run_parallel_for::<ShareThenStealDelayedAutoGrain, F>(state, from, to, grain, f)
        }
    }
}

impl ThreadPool {
    /// Run `f(i)` for every `i` in `[from, to)` across the pool. Returns once
    /// every iteration has executed. May be called from any thread, including
    /// recursively from inside another parallel loop on this pool.
    pub fn parallel_for<F: Fn(usize) + Sync>(&self, from: usize, to: usize, f: F) {
        dispatch(self.state(), default_mode(), from, to, 1, &f);
    }

    /// [`parallel_for`](Self::parallel_for) with a minimum split granularity:
    /// no spawned task covers fewer than `grain` iterations.
    pub fn parallel_for_with_grain<F: Fn(usize) + Sync>(
        &self,
        grain: usize,
        from: usize,
        to: usize,
        f: F,
    ) {
        dispatch(self.state(), default_mode(), from, to, grain, &f);
    }

    /// [`parallel_for`](Self::parallel_for) with an explicit scheduling mode.
    pub fn parallel_for_with<F: Fn(usize) + Sync>(
        &self,
        mode: Mode,
        grain: usize,
        from: usize,
        to: usize,
        f: F,
    ) {
        dispatch(self.state(), mode, from, to, grain, &f);
    }

    /// Run `f1` somewhere on the pool and `f2` on the calling thread, then
    /// wait (by draining other pool work) until both have finished.
    pub fn parallel_do<F1, F2>(&self, f1: F1, f2: F2)
    where
        F1: FnOnce() + Send,
        F2: FnOnce(),
    {
        let state = self.state();
        let root = TaskNode::root();
        let node = TaskNode::child(&root);

        let guard = DrainGuard {
            state,
            root: &root,
        };
        // SAFETY: the guard drains before this frame (and f1's borrows) end.
        state.schedule(unsafe { RawTask::new(FnTask::new(node, f1)) });
        f2();
        drop(guard);
    }
}

static GLOBAL: OnceCell<ThreadPool> = OnceCell::new();

fn build_global(num_threads: usize) -> ThreadPool {
    let pool = ThreadPool::new(num_threads);
    warm_up(&pool);
    pool
}

/// Every worker runs one spin-barrier iteration, which forces each of them
/// through the whole dispatch path (mailbox delivery included) before any
/// timing-sensitive caller shows up.
fn warm_up(pool: &ThreadPool) {
    let barrier = SpinBarrier::new(pool.num_threads());
    pool.parallel_for_with(Mode::Sharing, 1, 0, pool.num_threads(), |_| {
        barrier.notify();
        barrier.wait();
    });
}

fn global() -> &'static ThreadPool {
    GLOBAL.get_or_init(|| build_global(config::num_threads()))
}

/// Build the process-wide pool with `num_threads` workers and warm it up.
/// Idempotent: the first call wins, later calls (and worker counts) are
/// ignored. The calling thread becomes the pool's worker slot 0.
pub fn init_parallel(num_threads: usize) {
    let _ = GLOBAL.get_or_init(|| build_global(num_threads));
}

/// The process-wide pool's worker count; before the pool exists this reports
/// what it would be built with (`BENCH_NUM_THREADS`, capped by
/// `BENCH_MAX_THREADS`, else `OMP_NUM_THREADS`, else the hardware
/// concurrency).
pub fn num_threads() -> usize {
    GLOBAL
        .get()
        .map(ThreadPool::num_threads)
        .unwrap_or_else(config::num_threads)
}

/// Run `f(i)` for every `i` in `[from, to)` on the process-wide pool.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let sum = AtomicUsize::new(0);
/// parfor::parallel_for(0, 100, |i| {
///     sum.fetch_add(i, Ordering::Relaxed);
/// });
/// assert_eq!(sum.load(Ordering::Relaxed), 4950);
/// ```
pub fn parallel_for<F: Fn(usize) + Sync>(from: usize, to: usize, f: F) {
    global().parallel_for(from, to, f);
}

/// [`parallel_for`] with a minimum split granularity.
pub fn parallel_for_with_grain<F: Fn(usize) + Sync>(grain: usize, from: usize, to: usize, f: F) {
    global().parallel_for_with_grain(grain, from, to, f);
}

/// [`ThreadPool::parallel_do`] on the process-wide pool.
pub fn parallel_do<F1, F2>(f1: F1, f2: F2)
where
    F1: FnOnce() + Send,
    F2: FnOnce(),
{
    global().parallel_do(f1, f2);
}

/// The calling thread's worker slot in its pool, or -1 when called from a
/// thread no pool owns.
pub fn thread_index() -> isize {
    crate::pool::current_thread_index()
}

/// Cancel the process-wide pool: workers stop dequeuing and queued tasks are
/// discarded at shutdown. No-op if the pool was never built.
pub fn cancel() {
    if let Some(pool) = GLOBAL.get() {
        pool.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    // the process-wide pool is exercised in tests/; these stay on local pools

    #[test]
    fn empty_range_is_a_noop() {
        let pool = ThreadPool::new(2);
        let hits = AtomicUsize::new(0);
        pool.parallel_for(5, 5, |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        pool.parallel_for(7, 3, |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_iteration_runs_on_the_caller() {
        let pool = ThreadPool::new(2);
        let hits = AtomicUsize::new(0);
        pool.parallel_for(41, 42, |i| {
            assert_eq!(i, 41);
            assert_eq!(thread_index(), 0);
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_mode_covers_the_range() {
        let pool = ThreadPool::new(3);
        for mode in [
            Mode::Stealing,
            Mode::Sharing,
            Mode::StealingGrain,
            Mode::SharingStealing,
            Mode::StealingGrainAuto,
            Mode::SharingStealingAuto,
        ] {
            let sum = AtomicUsize::new(0);
            pool.parallel_for_with(mode, 1, 0, 1000, |i| {
                sum.fetch_add(i, Ordering::Relaxed);
            });
            assert_eq!(sum.load(Ordering::Relaxed), 1000 * 999 / 2, "{mode:?}");
        }
    }

    #[test]
    fn large_grain_never_splits() {
        let pool = ThreadPool::new(2);
        let hits = AtomicUsize::new(0);
        pool.parallel_for_with(Mode::Stealing, 100, 0, 10, |_| {
            // grain >= len: everything stays on the caller
            assert_eq!(thread_index(), 0);
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn parallel_do_runs_both() {
        let pool = ThreadPool::new(2);
        let hits = AtomicUsize::new(0);
        pool.parallel_do(
            || {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            || {
                hits.fetch_add(10, Ordering::SeqCst);
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn default_mode_round_trips() {
        let original = default_mode();
        for mode in [
            Mode::Stealing,
            Mode::Sharing,
            Mode::StealingGrain,
            Mode::SharingStealing,
            Mode::StealingGrainAuto,
            Mode::SharingStealingAuto,
        ] {
            set_default_mode(mode);
            assert_eq!(default_mode(), mode);
        }
        set_default_mode(original);
    }
}
