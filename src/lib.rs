//! A work-stealing parallel-for runtime for short, data-parallel loops.
//!
//! Thread pools built for long-running jobs spend tens of microseconds just
//! getting a task onto another core, which is the entire time budget of a
//! short data-parallel loop. This runtime is built around three ideas that
//! keep scheduling overhead near the cost of a few atomic operations:
//!
//! * **Eager sharing.** A loop's initial task recursively mails disjoint
//!   sub-ranges to a window of specific workers, so every worker finds its
//!   first piece of work in its own mailbox instead of discovering it by
//!   stealing. See [`Mode`] for the policies that enable this.
//! * **Timespan-delayed splitting.** A task first executes iterations for a
//!   fixed wall-clock budget (calibrated against the tail of the pool's
//!   scheduling latency). Short loops finish inside the budget and never pay
//!   for balancing; long loops split at their midpoint afterwards, with a
//!   grain that grew while the budget was unspent.
//! * **Non-blocking everywhere.** Workers never sleep while a loop runs, and a
//!   caller waiting for its loop *drains*: it executes other pool work until
//!   the loop's task tree has retired. That makes `parallel_for` safely
//!   re-entrant from inside another `parallel_for`.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use parfor::ThreadPool;
//!
//! // the constructing thread becomes worker slot 0 of the pool
//! let pool = ThreadPool::new(2);
//!
//! let sum = AtomicUsize::new(0);
//! pool.parallel_for(0, 100, |i| {
//!     sum.fetch_add(i, Ordering::Relaxed);
//! });
//! assert_eq!(sum.load(Ordering::Relaxed), 4950);
//!
//! // loops may nest: a task can run its own parallel loop on the same pool
//! let nested = AtomicUsize::new(0);
//! pool.parallel_for(0, 4, |_| {
//!     pool.parallel_for(0, 4, |_| {
//!         nested.fetch_add(1, Ordering::Relaxed);
//!     });
//! });
//! assert_eq!(nested.load(Ordering::Relaxed), 16);
//! ```
//!
//! Most programs use the process-wide pool instead of owning one: call
//! [`init_parallel`] once (or let the first [`parallel_for`] build it from the
//! `BENCH_NUM_THREADS` / `OMP_NUM_THREADS` environment, falling back to the
//! hardware concurrency), then call [`parallel_for`] from anywhere.
//!
//! Unsafe code is confined to the task cell and the pool internals; the
//! partitioner and facade are written against their safe interfaces.

#![deny(unsafe_op_in_unsafe_fn)]

mod config;
pub mod metrics;
mod parallel;
mod partition;
mod platform;
mod pool;
mod sync;
mod task;

pub use parallel::{
    cancel, init_parallel, num_threads, parallel_do, parallel_for, parallel_for_with_grain,
    set_default_mode, thread_index, Mode,
};
pub use pool::{PoolConfig, ThreadPool};
pub use sync::spin_barrier::SpinBarrier;
