//! The range partitioner: how one `[from, to)` loop becomes a tree of tasks.
//!
//! A range task executes in up to three phases:
//!
//! 1. **Initial eager split** (sharing-enabled tasks only): keep an even share
//!    of the range for this thread, then carve the rest plus the remaining
//!    thread window into at most [`SPLIT_FANOUT`] pieces and mail each piece
//!    to the first worker of its sub-window. Every worker finds its first task
//!    in its own mailbox instead of paying the cold-start cost of stealing.
//! 2. **Timespan loop** (timespan-balancing tasks only): run iterations for a
//!    fixed wall-clock budget before paying for any split. Short loops retire
//!    entirely in this phase; for long loops the adaptively grown grain keeps
//!    short tails from being over-split later.
//! 3. **Midpoint self-split**: while the remainder is divisible and the stack
//!    has room, push the right half onto the local deque (where thieves can
//!    balance it away) and continue with the left half. Finally drain whatever
//!    is left serially.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::metrics;
use crate::platform;
use crate::pool::PoolState;
use crate::task::{RawTask, TaskNode, TaskRun};

/// Maximum number of sub-tasks one initial split produces. Each sub-task
/// splits again on its target worker, so placement fans out as a tree.
pub(crate) const SPLIT_FANOUT: usize = 2;

/// Compile-time scheduling policy; the task loop is monomorphized per policy
/// so the per-iteration paths stay branch-free.
pub(crate) trait Policy: 'static {
    /// Run the initial eager split across the task's thread window.
    const SHARING: bool;
    /// Execute for a time budget before creating balancing tasks.
    const TIMESPAN: bool;
    /// Grow the grain while the time budget is unspent.
    const AUTO_GRAIN: bool;
}

/// Pure work stealing: midpoint splits only.
pub(crate) struct StealOnly;

impl Policy for StealOnly {
    const SHARING: bool = false;
    const TIMESPAN: bool = false;
    const AUTO_GRAIN: bool = false;
}

/// Eager initial sharing, then midpoint splits.
pub(crate) struct ShareThenSteal;

impl Policy for ShareThenSteal {
    const SHARING: bool = true;
    const TIMESPAN: bool = false;
    const AUTO_GRAIN: bool = false;
}

/// Work stealing delayed by the timespan loop.
pub(crate) struct StealDelayed;

impl Policy for StealDelayed {
    const SHARING: bool = false;
    const TIMESPAN: bool = true;
    const AUTO_GRAIN: bool = false;
}

/// Sharing plus the timespan loop.
pub(crate) struct ShareThenStealDelayed;

impl Policy for ShareThenStealDelayed {
    const SHARING: bool = true;
    const TIMESPAN: bool = true;
    const AUTO_GRAIN: bool = false;
}

/// [`StealDelayed`] with adaptive grain growth.
pub(crate) struct StealDelayedAutoGrain;

impl Policy for StealDelayedAutoGrain {
    const SHARING: bool = false;
    const TIMESPAN: bool = true;
    const AUTO_GRAIN: bool = true;
}

/// [`ShareThenStealDelayed`] with adaptive grain growth.
pub(crate) struct ShareThenStealDelayedAutoGrain;

impl Policy for ShareThenStealDelayedAutoGrain {
    const SHARING: bool = true;
    const TIMESPAN: bool = true;
    const AUTO_GRAIN: bool = true;
}

/// A half-open index interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Span {
    pub from: usize,
    pub to: usize,
}

impl Span {
    pub(crate) fn new(from: usize, to: usize) -> Self {
        Span { from, to }
    }

    pub(crate) fn len(&self) -> usize {
        self.to - self.from
    }
}

/// How one initial split divides the remaining thread window and range into
/// `parts` (window, range) pairs that exactly tile their inputs.
///
/// Remainder distribution is a small fairness knob: extra threads go to the
/// *last* sub-windows; extra range units go to the *first* sub-ranges when the
/// window divides evenly and to the last ones otherwise.
pub(crate) fn split_plan(threads: Span, data: Span, fanout: usize) -> Vec<(Span, Span)> {
    let parts = fanout.min(threads.len()).min(data.len());
    debug_assert!(parts >= 1);

    let thread_step = threads.len() / parts;
    let thread_rem = threads.len() % parts;
    let data_step = data.len() / parts;
    let data_rem = data.len() % parts;

    let mut plan = Vec::with_capacity(parts);
    let mut thread_from = threads.from;
    let mut data_from = data.from;
    for i in 0..parts {
        let extra_thread = usize::from(i >= parts - thread_rem);
        let extra_data = if thread_rem == 0 {
            usize::from(i < data_rem)
        } else {
            usize::from(i >= parts - data_rem)
        };
        let thread_to = (thread_from + thread_step + extra_thread).min(threads.to);
        let data_to = (data_from + data_step + extra_data).min(data.to);
        debug_assert!(thread_from < thread_to);
        debug_assert!(data_from < data_to);
        plan.push((Span::new(thread_from, thread_to), Span::new(data_from, data_to)));
        thread_from = thread_to;
        data_from = data_to;
    }
    debug_assert_eq!(thread_from, threads.to);
    debug_assert_eq!(data_from, data.to);
    plan
}

/// A divisible slice of a parallel loop.
///
/// The function reference and pool reference are `'static` from this type's
/// point of view; the facade guarantees both outlive every task of the loop
/// (it drains until the root node's count returns to 1 before returning).
pub(crate) struct RangeTask<'a, F: Fn(usize) + Sync, P: Policy> {
    pool: &'a PoolState,
    node: Arc<TaskNode>,
    current: usize,
    end: usize,
    func: &'a F,
    /// Worker window used only by the initial split.
    threads: Span,
    grain: usize,
    initial: bool,
    _policy: PhantomData<fn() -> P>,
}

impl<'a, F: Fn(usize) + Sync, P: Policy> RangeTask<'a, F, P> {
    pub(crate) fn initial(
        pool: &'a PoolState,
        node: Arc<TaskNode>,
        range: Span,
        func: &'a F,
        threads: Span,
        grain: usize,
    ) -> Self {
        RangeTask {
            pool,
            node,
            current: range.from,
            end: range.to,
            func,
            threads,
            grain: grain.max(1),
            initial: true,
            _policy: PhantomData,
        }
    }

    fn is_divisible(&self) -> bool {
        self.current + self.grain < self.end
    }

    #[inline(always)]
    fn run_one(&mut self) {
        (self.func)(self.current);
        self.current += 1;
    }

    /// Phase A. Keep `ceil(len / window)` iterations, hand the rest out.
    fn distribute(&mut self) {
        if self.threads.len() <= 1 || !self.is_divisible() {
            return;
        }
        let mine = (self.end - self.current).div_ceil(self.threads.len());
        let rest = Span::new(self.current + mine, self.end);
        if rest.from >= rest.to {
            return;
        }
        self.end = rest.from;
        let rest_threads = Span::new(self.threads.from + 1, self.threads.to);

        for (window, range) in split_plan(rest_threads, rest, SPLIT_FANOUT) {
            let node = TaskNode::child(&self.node);
            let child = RangeTask::<'a, F, P> {
                pool: self.pool,
                node,
                current: range.from,
                end: range.to,
                func: self.func,
                threads: window,
                grain: self.grain,
                initial: true,
                _policy: PhantomData,
            };
            metrics::task_shared();
            // SAFETY: the loop's facade drains every descendant task before
            // the borrows inside `func` can expire.
            self.pool.schedule_on(unsafe { RawTask::new(child) }, window.from);
        }
    }

    /// Phase C helper: queue `[from, to)` as a plain stealing task.
    fn spawn_balancing(&mut self, range: Span) {
        let node = TaskNode::child(&self.node);
        let child = RangeTask::<'a, F, StealOnly> {
            pool: self.pool,
            node,
            current: range.from,
            end: range.to,
            func: self.func,
            threads: Span::new(0, 0),
            grain: self.grain,
            initial: false,
            _policy: PhantomData,
        };
        // SAFETY: as in `distribute`.
        self.pool.schedule(unsafe { RawTask::new(child) });
    }

    fn execute(mut self) {
        // Declared before any user code runs: locals drop before `self`, so on
        // unwind the pool is poisoned *before* this task's node is released.
        // Waiters then see the flag no later than the refcount change and
        // cannot mistake a panicked loop for a completed one.
        let _poison = PoisonOnUnwind { pool: self.pool };

        if P::SHARING && self.initial {
            self.distribute();
        }

        if P::TIMESPAN {
            // absorb the first scheduling-latency's worth of work without
            // creating any balancing task
            self.grain = 1;
            let start = platform::now();
            let budget = platform::init_time();
            while self.current < self.end {
                self.run_one();
                if platform::now().wrapping_sub(start) > budget {
                    break;
                }
                if P::AUTO_GRAIN {
                    self.grain += 1;
                }
            }
        }

        let mut split_any = false;
        while self.current < self.end {
            if self.is_divisible() && !platform::is_stack_half_full() {
                let mid = self.current + (self.end - self.current) / 2;
                self.spawn_balancing(Span::new(mid, self.end));
                self.end = mid;
                split_any = true;
            } else {
                self.run_one();
            }
        }
        if !split_any {
            metrics::task_undivided();
        }
        // dropping self releases the node reference; on unwind out of
        // `run_one` the same drop runs, so the lifetime graph stays exact
    }
}

impl<F: Fn(usize) + Sync, P: Policy> TaskRun for RangeTask<'_, F, P> {
    fn run(self) {
        self.execute();
    }
}

struct PoisonOnUnwind<'a> {
    pool: &'a PoolState,
}

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.pool.poison();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(threads: Span, data: Span, plan: &[(Span, Span)]) {
        let mut thread_cursor = threads.from;
        let mut data_cursor = data.from;
        for (window, range) in plan {
            assert_eq!(window.from, thread_cursor);
            assert_eq!(range.from, data_cursor);
            assert!(window.len() >= 1);
            assert!(range.len() >= 1);
            thread_cursor = window.to;
            data_cursor = range.to;
        }
        assert_eq!(thread_cursor, threads.to);
        assert_eq!(data_cursor, data.to);
    }

    #[test]
    fn split_plan_tiles_exactly() {
        for threads in 1..=9usize {
            for data in 1..=40usize {
                let t = Span::new(1, 1 + threads);
                let d = Span::new(10, 10 + data);
                let plan = split_plan(t, d, SPLIT_FANOUT);
                assert_tiles(t, d, &plan);
                assert!(plan.len() <= SPLIT_FANOUT);
            }
        }
    }

    #[test]
    fn split_plan_remainders() {
        // window divides evenly: the extra range unit goes to the first part
        let plan = split_plan(Span::new(0, 4), Span::new(0, 9), 2);
        assert_eq!(
            plan,
            vec![
                (Span::new(0, 2), Span::new(0, 5)),
                (Span::new(2, 4), Span::new(5, 9)),
            ]
        );

        // odd window: the extra thread and the extra range unit go to the last part
        let plan = split_plan(Span::new(0, 5), Span::new(0, 9), 2);
        assert_eq!(
            plan,
            vec![
                (Span::new(0, 2), Span::new(0, 4)),
                (Span::new(2, 5), Span::new(4, 9)),
            ]
        );
    }

    #[test]
    fn split_plan_degenerate_sizes() {
        // a single thread or a single iteration cannot fan out
        let plan = split_plan(Span::new(3, 4), Span::new(0, 100), 2);
        assert_eq!(plan, vec![(Span::new(3, 4), Span::new(0, 100))]);

        let plan = split_plan(Span::new(0, 8), Span::new(7, 8), 2);
        assert_eq!(plan, vec![(Span::new(0, 8), Span::new(7, 8))]);
    }

    #[test]
    fn span_len() {
        assert_eq!(Span::new(3, 10).len(), 7);
        assert_eq!(Span::new(5, 5).len(), 0);
    }
}
