//! The worker pool.
//!
//! A pool owns `N` worker slots: slot 0 belongs to the thread that constructed
//! the pool, slots `1..N` to spawned threads. Each slot carries three queues —
//! a single-word `runnext` fast path, a bounded owner-biased deque for locally
//! pushed work, and a bounded MPMC mailbox for work pushed by other threads —
//! plus a steal-partition word. Idle workers walk pseudo-random permutations
//! of victim slots (a random start plus a random coprime stride visits every
//! slot exactly once) and drain mailboxes first, falling back to victims'
//! deques only after a full empty sweep.
//!
//! Nothing in the pool ever blocks: workers that find no work spin with a
//! cpu-relax hint, and every push that would overflow a queue degenerates to
//! executing the task directly on the pushing thread.

mod run_queue;

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::ArrayQueue;

use crate::metrics;
use crate::platform;
use crate::sync::spin_barrier::SpinBarrier;
use crate::task::RawTask;

use run_queue::RunQueue;

const MAILBOX_CAPACITY: usize = 1024;

/// Steal partitions pack a `[start, limit)` worker window into one atomic
/// word, 16 bits per bound.
const PARTITION_BITS: u32 = 16;

/// Upper bound on the worker count implied by the partition encoding.
pub(crate) const MAX_WORKERS: usize = 1 << PARTITION_BITS;

fn encode_partition(start: usize, limit: usize) -> u32 {
    debug_assert!(start < limit && limit < MAX_WORKERS);
    ((start as u32) << PARTITION_BITS) | limit as u32
}

fn decode_partition(val: u32) -> (usize, usize) {
    (
        (val >> PARTITION_BITS) as usize,
        (val & (MAX_WORKERS as u32 - 1)) as usize,
    )
}

/// The runnext sentinel an external drain loop leaves behind: while present,
/// local pushes bypass runnext so new work stays visible to thieves.
#[inline]
fn idle_sentinel() -> *mut () {
    1usize as *mut ()
}

struct PerThread {
    /// The pool this thread belongs to, if any. Compared by address only.
    pool: RefCell<Weak<PoolState>>,
    /// Worker slot in that pool, or -1.
    thread_id: Cell<isize>,
    /// Per-thread PRNG state for victim selection and random placement.
    rand: Cell<u64>,
}

std::thread_local! {
    static PER_THREAD: PerThread = PerThread {
        pool: RefCell::new(Weak::new()),
        thread_id: Cell::new(-1),
        rand: Cell::new(thread_id_hash()),
    };
}

fn thread_id_hash() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

/// PCG-XSH-RS step over the thread-local state.
fn next_rand() -> u32 {
    PER_THREAD.with(|pt| {
        let state = pt.rand.get();
        pt.rand.set(
            state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(0xda3e39cb94b95bdb),
        );
        ((state ^ (state >> 22)) >> (22 + (state >> 61))) as u32
    })
}

fn register_current_thread(state: &Arc<PoolState>, index: usize) {
    PER_THREAD.with(|pt| {
        *pt.pool.borrow_mut() = Arc::downgrade(state);
        pt.thread_id.set(index as isize);
    });
}

/// The worker slot of the calling thread, or -1 for threads outside any pool.
pub(crate) fn current_thread_index() -> isize {
    PER_THREAD.with(|pt| pt.thread_id.get())
}

/// One worker slot's scheduling state.
struct WorkerData {
    queue: RunQueue,
    mailbox: ArrayQueue<RawTask>,
    runnext: AtomicPtr<()>,
    steal_partition: AtomicU32,
}

impl WorkerData {
    fn new() -> Self {
        Self {
            queue: RunQueue::new(),
            mailbox: ArrayQueue::new(MAILBOX_CAPACITY),
            runnext: AtomicPtr::new(std::ptr::null_mut()),
            steal_partition: AtomicU32::new(0),
        }
    }

    /// Enqueue for this worker. `local` means the calling thread *is* this
    /// worker; local pushes try the runnext word first and fall back to the
    /// deque, foreign pushes go through the mailbox. Fails when full.
    fn push_task(&self, task: RawTask, local: bool) -> Result<(), RawTask> {
        if local {
            match self.push_runnext(task) {
                Ok(()) => Ok(()),
                Err(task) => self.queue.push_front(task),
            }
        } else {
            self.mailbox.push(task)
        }
    }

    fn push_runnext(&self, task: RawTask) -> Result<(), RawTask> {
        // occupied or IDLE: fall through to the deque
        if !self.runnext.load(Ordering::Relaxed).is_null() {
            return Err(task);
        }
        let ptr = task.into_raw();
        match self.runnext.compare_exchange(
            std::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            // SAFETY: `ptr` was produced by into_raw above and not published.
            Err(_) => Err(unsafe { RawTask::from_raw(ptr) }),
        }
    }

    fn pop_runnext(&self) -> Option<RawTask> {
        let ptr = self.runnext.load(Ordering::Relaxed);
        if ptr.is_null() || ptr == idle_sentinel() {
            return None;
        }
        match self
            .runnext
            .compare_exchange(ptr, std::ptr::null_mut(), Ordering::Acquire, Ordering::Relaxed)
        {
            // SAFETY: the exchange transferred ownership of the published
            // pointer to us.
            Ok(ptr) => Some(unsafe { RawTask::from_raw(ptr) }),
            Err(_) => None,
        }
    }

    /// Mark this worker idle (external drain loops call this before leaving).
    /// Returns false if a task arrived in runnext concurrently.
    fn set_idle(&self) -> bool {
        let current = self.runnext.load(Ordering::Relaxed);
        if current.is_null() {
            return self
                .runnext
                .compare_exchange(current, idle_sentinel(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok();
        }
        current == idle_sentinel()
    }

    fn reset_idle(&self) {
        let current = self.runnext.load(Ordering::Relaxed);
        if current == idle_sentinel() {
            let _ = self.runnext.compare_exchange(
                current,
                std::ptr::null_mut(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    /// Owner-side pop: runnext, then the deque front, then the mailbox.
    fn pop_front(&self) -> Option<RawTask> {
        self.pop_runnext()
            .or_else(|| self.queue.pop_front())
            .or_else(|| self.mailbox.pop())
    }

    /// Thief-side pop: the mailbox, and only under `force` (the thief saw a
    /// fully empty sweep) the victim's own deque and runnext word. Taking
    /// runnext keeps the pool live when a worker parks a task there and then
    /// blocks inside an iteration.
    fn pop_back(&self, force: bool) -> Option<RawTask> {
        self.mailbox.pop().or_else(|| {
            if force {
                self.queue.pop_back().or_else(|| self.pop_runnext())
            } else {
                None
            }
        })
    }

    /// Drop all queued work. Only sound once no other thread touches the slot.
    fn flush(&self) {
        while self.mailbox.pop().is_some() {}
        self.queue.flush();
        if let Some(task) = self.pop_runnext() {
            drop(task);
        }
    }
}

pub(crate) struct PoolState {
    workers: Box<[WorkerData]>,
    /// `coprimes[s - 1]` lists the coprimes of `s`; stepping a victim index by
    /// any of them modulo `s` visits every slot in `[0, s)` exactly once.
    coprimes: Box<[Box<[u32]>]>,
    global_steal_partition: u32,
    done: AtomicBool,
    cancelled: AtomicBool,
    poisoned: AtomicBool,
    /// Spawned workers currently running their loop.
    alive: AtomicUsize,
}

impl PoolState {
    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Relaxed);
    }

    pub(crate) fn spawned_workers_alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.done.store(true, Ordering::Relaxed);
    }

    /// The calling thread's slot in *this* pool, or -1.
    fn current_worker_id(&self) -> isize {
        PER_THREAD.with(|pt| {
            if std::ptr::eq(pt.pool.borrow().as_ptr(), self) {
                pt.thread_id.get()
            } else {
                -1
            }
        })
    }

    /// Enqueue somewhere reasonable: workers push to their own slot, foreign
    /// threads push to a uniformly random mailbox. A full queue means the
    /// caller runs the task itself.
    pub(crate) fn schedule(&self, task: RawTask) {
        let id = self.current_worker_id();
        let result = if id >= 0 {
            self.workers[id as usize].push_task(task, true)
        } else {
            let target = next_rand() as usize % self.workers.len();
            self.workers[target].push_task(task, false)
        };
        if let Err(task) = result {
            task.run();
        }
    }

    /// Enqueue on a specific worker's slot (used by the initial eager split).
    /// A full mailbox means the caller runs the task itself.
    pub(crate) fn schedule_on(&self, task: RawTask, hint: usize) {
        let hint = hint % self.workers.len();
        let local = self.current_worker_id() == hint as isize;
        if let Err(task) = self.workers[hint].push_task(task, local) {
            task.run();
        }
    }

    /// Run at most one task from the pool on the calling thread. Returns
    /// whether anything was executed; always false for non-worker threads.
    pub(crate) fn try_execute_one(&self) -> bool {
        if self.current_worker_id() < 0 {
            return false;
        }
        self.worker_loop(true, true)
    }

    /// The dispatch loop. Standing workers run it with `external = false`
    /// until the pool shuts down. External callers (a thread draining its own
    /// parallel loop) run it with `external = true`: they leave as soon as no
    /// work is found, marking their runnext word IDLE on the way out, and they
    /// stop stealing when their stack is too deep to safely take on more.
    fn worker_loop(&self, external: bool, once: bool) -> bool {
        let thread_id = self.current_worker_id();
        debug_assert!(thread_id >= 0);
        let me = &self.workers[thread_id as usize];

        let can_steal = !platform::is_stack_half_full();

        me.reset_idle();
        let mut processed_anything = false;
        // after one full sweep finds nothing, steals may dig into victims'
        // deques rather than just their mailboxes
        let mut all_empty = false;
        while !self.cancelled.load(Ordering::Relaxed) {
            let mut task = me.pop_front();
            if task.is_none() && (!external || can_steal) {
                task = self.local_steal(thread_id as usize, all_empty);
                if task.is_some() {
                    metrics::task_stolen();
                }
            }
            if task.is_none() && (!external || can_steal) {
                task = self.global_steal(all_empty);
                if task.is_some() {
                    metrics::task_stolen();
                }
            }
            if task.is_none() && external && me.set_idle() {
                return processed_anything;
            }
            match task {
                Some(task) => {
                    task.run();
                    processed_anything = true;
                    all_empty = false;
                }
                None => {
                    if self.done.load(Ordering::Relaxed) {
                        return processed_anything;
                    }
                    all_empty = true;
                    platform::cpu_relax();
                }
            }
            if once {
                break;
            }
        }
        processed_anything
    }

    /// Best-effort steal from workers in `[start, limit)`: a random starting
    /// victim plus a random coprime stride yields a cheap uniform permutation.
    fn steal(&self, start: usize, limit: usize, force: bool) -> Option<RawTask> {
        let size = limit - start;
        let r = next_rand() as u64;
        let coprimes = &self.coprimes[size - 1];
        // Lemire's multiply-shift reduction of r into [0, size)
        let mut victim = ((r * size as u64) >> 32) as usize;
        let index = ((coprimes.len() as u64 * r) >> 32) as usize;
        let inc = coprimes[index] as usize;

        for _ in 0..size {
            debug_assert!(start + victim < limit);
            if let Some(task) = self.workers[start + victim].pop_back(force) {
                return Some(task);
            }
            victim += inc;
            if victim >= size {
                victim -= size;
            }
        }
        None
    }

    /// Steal within the calling worker's partition. Skipped when the
    /// partition covers the whole pool: the global steal would repeat it.
    fn local_steal(&self, thread_id: usize, force: bool) -> Option<RawTask> {
        let partition = self.workers[thread_id].steal_partition.load(Ordering::Relaxed);
        if partition == self.global_steal_partition {
            return None;
        }
        let (start, limit) = decode_partition(partition);
        self.steal(start, limit, force)
    }

    fn global_steal(&self, force: bool) -> Option<RawTask> {
        self.steal(0, self.workers.len(), force)
    }

    /// A task parked in the caller's runnext word is invisible to thieves.
    /// External drain loops call this before leaving so any leftover ends up
    /// in the (stealable) deque instead.
    pub(crate) fn park_caller_runnext(&self) {
        let id = self.current_worker_id();
        if id < 0 {
            return;
        }
        let me = &self.workers[id as usize];
        if let Some(task) = me.pop_runnext() {
            if let Err(task) = me.queue.push_front(task) {
                task.run();
            }
        }
    }
}

/// Decrements the live-worker count when a worker thread exits, and poisons
/// the pool if the exit is a panic unwinding through the worker loop.
struct WorkerExitGuard<'a> {
    state: &'a PoolState,
}

impl Drop for WorkerExitGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.state.poisoned.store(true, Ordering::Relaxed);
        }
        self.state.alive.fetch_sub(1, Ordering::Release);
    }
}

fn worker_main(state: Arc<PoolState>, index: usize, pin: bool, barrier: Option<Arc<SpinBarrier>>) {
    platform::register_stack(platform::WORKER_STACK_SIZE);
    register_current_thread(&state, index);
    if pin {
        platform::pin_to_slot(index);
    }
    if let Some(barrier) = &barrier {
        barrier.notify();
        // no user work anywhere in the pool until every worker finished pinning
        barrier.wait();
    }

    let _exit_guard = WorkerExitGuard { state: &state };
    state.worker_loop(false, false);
}

/// Pool construction options.
pub struct PoolConfig {
    /// Pin each worker to the CPU whose index matches its slot (counting CPUs
    /// the process is allowed to run on). Pinning is synchronized across all
    /// workers, so no task runs before every worker is in place.
    pub pin_workers: bool,
    /// Name given to the spawned worker threads.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pin_workers: false,
            thread_name: "parfor-worker".to_string(),
        }
    }
}

/// A fixed-size pool of worker threads.
///
/// The constructing thread becomes worker slot 0: it never runs a standing
/// dispatch loop, but participates whenever it waits for one of its own
/// parallel loops to finish. Dropping the pool shuts it down and joins the
/// spawned workers.
pub struct ThreadPool {
    state: Arc<PoolState>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// A pool with `num_threads` workers, no pinning.
    pub fn new(num_threads: usize) -> Self {
        Self::with_config(num_threads, PoolConfig::default())
    }

    pub fn with_config(num_threads: usize, config: PoolConfig) -> Self {
        assert!(num_threads >= 1, "a pool needs at least one worker");
        assert!(num_threads < MAX_WORKERS, "worker count exceeds partition encoding");

        let workers: Box<[WorkerData]> = (0..num_threads).map(|_| WorkerData::new()).collect();
        let coprimes = (1..=num_threads)
            .map(|n| coprimes_of(n).into_boxed_slice())
            .collect();
        let global_steal_partition = encode_partition(0, num_threads);
        for worker in workers.iter() {
            worker
                .steal_partition
                .store(global_steal_partition, Ordering::Relaxed);
        }

        let state = Arc::new(PoolState {
            workers,
            coprimes,
            global_steal_partition,
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
        });

        log::debug!(
            "starting pool: {num_threads} workers, pinning {}",
            if config.pin_workers { "on" } else { "off" }
        );

        // the constructing thread is worker slot 0; its stack base is captured
        // lazily on the first probe since we didn't size that stack ourselves
        register_current_thread(&state, 0);

        let barrier = config
            .pin_workers
            .then(|| Arc::new(SpinBarrier::new(num_threads)));

        let mut handles = Vec::with_capacity(num_threads - 1);
        for i in 1..num_threads {
            let state_clone = Arc::clone(&state);
            let barrier_clone = barrier.clone();
            let pin = config.pin_workers;
            state.alive.fetch_add(1, Ordering::Release);
            let handle = std::thread::Builder::new()
                .name(config.thread_name.clone())
                .stack_size(platform::WORKER_STACK_SIZE)
                .spawn(move || worker_main(state_clone, i, pin, barrier_clone))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        if let Some(barrier) = &barrier {
            platform::pin_to_slot(0);
            barrier.notify();
            barrier.wait();
        }

        ThreadPool { state, handles }
    }

    pub fn num_threads(&self) -> usize {
        self.state.num_workers()
    }

    /// Stop accepting work and discard whatever is still queued. In-flight
    /// tasks finish; queued tasks are flushed when the pool is dropped.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Restrict each worker's preferred steal range. Workers still fall back
    /// to a global steal when their partition is dry.
    pub fn set_steal_partitions(&self, partitions: &[(usize, usize)]) {
        assert_eq!(partitions.len(), self.num_threads());
        for (worker, &(start, limit)) in self.state.workers.iter().zip(partitions) {
            assert!(start < limit && limit <= self.num_threads());
            worker
                .steal_partition
                .store(encode_partition(start, limit), Ordering::Relaxed);
        }
    }

    pub(crate) fn state(&self) -> &PoolState {
        &self.state
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.state.done.store(true, Ordering::Relaxed);

        // only propagate join errors if no worker panicked earlier; the panic
        // was already surfaced to a caller through the poisoned flag
        let check_for_errors = !self.state.is_poisoned();
        for handle in self.handles.drain(..) {
            let result = handle.join();
            if check_for_errors {
                result.expect("a worker thread panicked while stopping");
            }
        }

        // no worker threads remain, so flushing is race-free; this also frees
        // anything abandoned by a cancel()
        for worker in self.state.workers.iter() {
            worker.flush();
        }

        log::debug!("pool stopped: {:?}", metrics::snapshot());
    }
}

fn coprimes_of(n: usize) -> Vec<u32> {
    (1..=n as u32).filter(|&i| gcd(i, n as u32) == 1).collect()
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let tmp = a;
        a = b;
        b = tmp % b;
    }
    a
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::task::{FnTask, TaskNode};

    #[test]
    fn coprime_tables() {
        assert_eq!(coprimes_of(1), vec![1]);
        assert_eq!(coprimes_of(6), vec![1, 5]);
        assert_eq!(coprimes_of(7), vec![1, 2, 3, 4, 5, 6]);
        for n in 1..=64u32 {
            for &c in &coprimes_of(n as usize) {
                assert_eq!(gcd(c, n), 1);
            }
        }
    }

    #[test]
    fn coprime_walk_is_a_permutation() {
        for size in 1..=16usize {
            for &inc in &coprimes_of(size) {
                let mut seen = vec![false; size];
                let mut victim = size / 2 % size;
                for _ in 0..size {
                    assert!(!seen[victim]);
                    seen[victim] = true;
                    victim += inc as usize;
                    if victim >= size {
                        victim -= size;
                    }
                }
                assert!(seen.iter().all(|&s| s));
            }
        }
    }

    #[test]
    fn partition_encoding_round_trips() {
        for &(start, limit) in &[(0, 1), (0, 16), (3, 9), (100, 65535)] {
            assert_eq!(decode_partition(encode_partition(start, limit)), (start, limit));
        }
    }

    #[test]
    fn construct_and_drop_without_work() {
        let pool = ThreadPool::new(4);
        assert_eq!(pool.num_threads(), 4);
    }

    #[test]
    fn single_worker_pool() {
        let _pool = ThreadPool::new(1);
    }

    #[test]
    fn cancel_then_drop_does_not_hang() {
        let pool = ThreadPool::new(3);
        pool.cancel();
    }

    #[test]
    fn scheduled_tasks_all_run() {
        let pool = ThreadPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let root = TaskNode::root();

        let total = 500;
        for _ in 0..total {
            let node = TaskNode::child(&root);
            let counter = Arc::clone(&counter);
            // SAFETY: the task owns its captures ('static)
            let task = unsafe {
                RawTask::new(FnTask::new(node, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
            };
            pool.state().schedule(task);
        }

        while Arc::strong_count(&root) > 1 {
            if !pool.state().try_execute_one() {
                platform::cpu_relax();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), total);
    }

    #[test]
    fn schedule_on_targets_mailboxes() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let root = TaskNode::root();

        for hint in 0..100 {
            let node = TaskNode::child(&root);
            let counter = Arc::clone(&counter);
            // SAFETY: the task owns its captures ('static)
            let task = unsafe {
                RawTask::new(FnTask::new(node, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
            };
            pool.state().schedule_on(task, hint);
        }

        while Arc::strong_count(&root) > 1 {
            if !pool.state().try_execute_one() {
                platform::cpu_relax();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn runnext_idle_blocks_local_pushes() {
        let worker = WorkerData::new();
        assert!(worker.set_idle());
        // a local push must not land in the IDLE runnext word
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let node = TaskNode::root();
        // SAFETY: run below
        let task = unsafe {
            RawTask::new(FnTask::new(node, move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }))
        };
        worker.push_task(task, true).unwrap();
        assert!(worker.pop_runnext().is_none());
        // the deque received it instead
        worker.queue.pop_front().unwrap().run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        worker.reset_idle();
        assert!(worker.runnext.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn runnext_fast_path_round_trip() {
        let worker = WorkerData::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        // SAFETY: run below
        let task = unsafe {
            RawTask::new(FnTask::new(TaskNode::root(), move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }))
        };
        worker.push_task(task, true).unwrap();
        // it went to runnext, not the deque
        assert!(worker.queue.is_empty());
        worker.pop_front().unwrap().run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_local_queues_degenerate_to_inline_execution() {
        let pool = ThreadPool::new(3);
        let root = TaskNode::root();

        // park both spawned workers inside a blocking task so nothing drains
        // or steals while the caller's queues fill up
        let released = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(AtomicUsize::new(0));
        for hint in 1..=2 {
            let released = Arc::clone(&released);
            let parked = Arc::clone(&parked);
            let node = TaskNode::child(&root);
            // SAFETY: the task owns its captures ('static)
            let task = unsafe {
                RawTask::new(FnTask::new(node, move || {
                    parked.fetch_add(1, Ordering::SeqCst);
                    while !released.load(Ordering::Relaxed) {
                        std::hint::spin_loop();
                    }
                }))
            };
            pool.state().schedule_on(task, hint);
        }
        while parked.load(Ordering::SeqCst) != 2 {
            platform::cpu_relax();
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let fill_task = |runs: &Arc<AtomicUsize>| {
            let node = TaskNode::child(&root);
            let runs = Arc::clone(runs);
            // SAFETY: the task owns its captures ('static)
            unsafe {
                RawTask::new(FnTask::new(node, move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                }))
            }
        };

        // fill the caller's runnext word and its entire deque; with the
        // workers parked, none of these can be popped or stolen yet
        let queued = 1 + RunQueue::DEFAULT_CAPACITY;
        for _ in 0..queued {
            pool.state().schedule(fill_task(&runs));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // every local queue is full: the next push must fail and the task
        // must execute synchronously on this thread instead
        pool.state().schedule(fill_task(&runs));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        released.store(true, Ordering::Relaxed);
        while Arc::strong_count(&root) > 1 {
            if !pool.state().try_execute_one() {
                platform::cpu_relax();
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), queued + 1);
    }

    #[test]
    fn non_worker_schedule_lands_in_some_mailbox() {
        let pool = Arc::new(ThreadPool::new(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let root = TaskNode::root();

        // schedule from a thread that is not part of the pool; the standing
        // workers will pick the tasks up on their own
        {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            let root = Arc::clone(&root);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let node = TaskNode::child(&root);
                    let counter = Arc::clone(&counter);
                    // SAFETY: the task owns its captures ('static)
                    let task = unsafe {
                        RawTask::new(FnTask::new(node, move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }))
                    };
                    pool.state().schedule(task);
                }
            })
            .join()
            .unwrap();
        }

        while Arc::strong_count(&root) > 1 {
            platform::cpu_relax();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
