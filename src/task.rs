//! Type-erased tasks and the lifetime graph that ties a parallel loop's tasks
//! together.
//!
//! Queues and the per-worker runnext word all traffic in [`RawTask`]: a single
//! thin pointer to a heap cell whose header carries the invoke and release
//! entry points. This keeps every queue slot one machine word wide and lets
//! the runnext fast path live in a plain `AtomicPtr`.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::metrics;

/// Something the pool can run. Consumes itself; a task executes exactly once.
pub(crate) trait TaskRun: Send {
    fn run(self);
}

#[repr(C)]
struct Header {
    /// Reconstructs the concrete cell, frees it, and runs the body.
    invoke: unsafe fn(NonNull<Header>),
    /// Reconstructs the concrete cell and frees it without running the body.
    release: unsafe fn(NonNull<Header>),
}

/// `Header` must be the first field so a `*mut Header` and a `*mut Cell<T>`
/// are interchangeable.
#[repr(C)]
struct Cell<T: TaskRun> {
    header: Header,
    body: ManuallyDrop<T>,
}

unsafe fn invoke<T: TaskRun>(ptr: NonNull<Header>) {
    // SAFETY (caller): `ptr` came from `RawTask::new::<T>` and ownership was
    // transferred to us, so it points at a live `Cell<T>`.
    let mut cell: Box<Cell<T>> = unsafe { Box::from_raw(ptr.cast().as_ptr()) };
    // SAFETY: the body is initialized and taken exactly once.
    let body = unsafe { ManuallyDrop::take(&mut cell.body) };
    // free the cell before running: the body may recurse arbitrarily deep and
    // there is no reason to keep the allocation pinned under it
    drop(cell);
    body.run();
}

unsafe fn release<T: TaskRun>(ptr: NonNull<Header>) {
    // SAFETY: as in `invoke`.
    let mut cell: Box<Cell<T>> = unsafe { Box::from_raw(ptr.cast().as_ptr()) };
    // SAFETY: the body is initialized and dropped exactly once.
    unsafe { ManuallyDrop::drop(&mut cell.body) };
    drop(cell);
}

/// An owned, type-erased, queue-ready task. Dropping a `RawTask` releases the
/// body without running it (this is what queue flushes rely on).
#[derive(Debug)]
pub(crate) struct RawTask(NonNull<Header>);

// SAFETY: the cell is owned by whoever holds the RawTask, the body is bounded
// by `TaskRun: Send`, and the header fields are plain fn pointers.
unsafe impl Send for RawTask {}

impl RawTask {
    /// Box `body` behind a thin pointer.
    ///
    /// # Safety
    ///
    /// The lifetimes captured by `body` are erased. The caller must guarantee
    /// that the task is run or dropped before any borrow inside `body`
    /// expires; the facade's drain loop provides exactly that guarantee.
    pub(crate) unsafe fn new<T: TaskRun>(body: T) -> Self {
        metrics::task_created();
        let cell = Box::new(Cell {
            header: Header {
                invoke: invoke::<T>,
                release: release::<T>,
            },
            body: ManuallyDrop::new(body),
        });
        RawTask(NonNull::from(Box::leak(cell)).cast())
    }

    /// Execute and destroy the task.
    pub(crate) fn run(self) {
        metrics::task_executed();
        let ptr = self.0;
        std::mem::forget(self);
        // SAFETY: we own the cell and relinquish it to `invoke`.
        unsafe { (ptr.as_ref().invoke)(ptr) }
    }

    /// Surrender ownership as a bare pointer (for the runnext word).
    pub(crate) fn into_raw(self) -> *mut () {
        let ptr = self.0.as_ptr().cast();
        std::mem::forget(self);
        ptr
    }

    /// Reclaim ownership of a pointer produced by [`RawTask::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `into_raw` and must not be reclaimed twice.
    pub(crate) unsafe fn from_raw(ptr: *mut ()) -> Self {
        debug_assert!(!ptr.is_null());
        // SAFETY: per contract, `ptr` is a live cell pointer.
        RawTask(unsafe { NonNull::new_unchecked(ptr.cast()) })
    }
}

impl Drop for RawTask {
    fn drop(&mut self) {
        // SAFETY: we own the cell; release reclaims and frees it.
        unsafe { (self.0.as_ref().release)(self.0) }
    }
}

/// A node in a parallel loop's lifetime graph. Every scheduled task holds one;
/// each node keeps its parent alive up to the loop's root. The facade holds an
/// extra reference to the root, so `Arc::strong_count(&root)` falls back to 1
/// exactly when every descendant task has retired.
pub(crate) struct TaskNode {
    _parent: Option<Arc<TaskNode>>,
}

impl TaskNode {
    pub(crate) fn root() -> Arc<TaskNode> {
        Arc::new(TaskNode { _parent: None })
    }

    pub(crate) fn child(parent: &Arc<TaskNode>) -> Arc<TaskNode> {
        Arc::new(TaskNode {
            _parent: Some(Arc::clone(parent)),
        })
    }
}

/// A one-shot closure task carrying its lifetime node. Used by `parallel_do`
/// and the warm-up path; range tasks have their own richer type.
pub(crate) struct FnTask<F: FnOnce() + Send> {
    node: Arc<TaskNode>,
    f: F,
}

impl<F: FnOnce() + Send> FnTask<F> {
    pub(crate) fn new(node: Arc<TaskNode>, f: F) -> Self {
        Self { node, f }
    }
}

impl<F: FnOnce() + Send> TaskRun for FnTask<F> {
    fn run(self) {
        let FnTask { node, f } = self;
        f();
        drop(node);
    }
}
