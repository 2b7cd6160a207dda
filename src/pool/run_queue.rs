//! The per-worker run queue: a bounded, owner-biased double-ended queue.
//!
//! The owning worker pushes and pops at the front; stealing threads pop at the
//! back. Every slot carries a one-byte state machine (EMPTY → BUSY → READY →
//! BUSY → EMPTY) that serializes access to the slot itself, so the owner can
//! use relaxed index loads, and a thief that loses any race simply reports an
//! empty queue instead of spinning. Capacity is a power of two; a full queue
//! rejects the push and the caller executes the task directly.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crossbeam::utils::CachePadded;

use crate::task::RawTask;

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

struct Slot {
    state: AtomicU8,
    task: UnsafeCell<Option<RawTask>>,
}

pub(crate) struct RunQueue {
    /// Next free front position; only the owner stores to this.
    front: CachePadded<AtomicU32>,
    /// Oldest live position; only successful thieves store to this.
    back: CachePadded<AtomicU32>,
    /// Thieves serialize on this word; `pop_back` gives up on contention.
    steal_lock: AtomicBool,
    mask: u32,
    slots: Box<[Slot]>,
}

// SAFETY: slot contents are only touched by the thread that moved the slot's
// state word to BUSY via compare-exchange, which establishes exclusivity; the
// READY/EMPTY stores are releases matched by the acquire on that exchange.
unsafe impl Sync for RunQueue {}

impl RunQueue {
    pub(crate) const DEFAULT_CAPACITY: usize = 1024;

    pub(crate) fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        assert!(capacity <= u32::MAX as usize / 2);
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(EMPTY),
                task: UnsafeCell::new(None),
            })
            .collect();
        Self {
            front: CachePadded::new(AtomicU32::new(0)),
            back: CachePadded::new(AtomicU32::new(0)),
            steal_lock: AtomicBool::new(false),
            mask: capacity as u32 - 1,
            slots,
        }
    }

    /// Push at the front. Owner only. Fails when the queue is full (or the
    /// target slot is still being vacated by a thief).
    pub(crate) fn push_front(&self, task: RawTask) -> Result<(), RawTask> {
        let front = self.front.load(Ordering::Relaxed);
        let slot = &self.slots[(front & self.mask) as usize];
        if slot
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(task);
        }
        // SAFETY: the BUSY exchange above gives us exclusive slot access.
        unsafe { *slot.task.get() = Some(task) };
        self.front.store(front.wrapping_add(1), Ordering::Relaxed);
        slot.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Pop the most recently pushed task. Owner only.
    pub(crate) fn pop_front(&self) -> Option<RawTask> {
        let front = self.front.load(Ordering::Relaxed);
        let slot = &self.slots[(front.wrapping_sub(1) & self.mask) as usize];
        if slot
            .state
            .compare_exchange(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // SAFETY: the BUSY exchange above gives us exclusive slot access.
        let task = unsafe { (*slot.task.get()).take() };
        debug_assert!(task.is_some());
        self.front.store(front.wrapping_sub(1), Ordering::Relaxed);
        slot.state.store(EMPTY, Ordering::Release);
        task
    }

    /// Pop the oldest task. Any thread. Returns `None` when empty or when
    /// another thief (or the owner, racing at the same slot) is in the way.
    pub(crate) fn pop_back(&self) -> Option<RawTask> {
        if self.steal_lock.load(Ordering::Relaxed)
            || self.steal_lock.swap(true, Ordering::Acquire)
        {
            return None;
        }

        let back = self.back.load(Ordering::Relaxed);
        let slot = &self.slots[(back & self.mask) as usize];
        let task = if slot
            .state
            .compare_exchange(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: the BUSY exchange above gives us exclusive slot access.
            let task = unsafe { (*slot.task.get()).take() };
            debug_assert!(task.is_some());
            self.back.store(back.wrapping_add(1), Ordering::Relaxed);
            slot.state.store(EMPTY, Ordering::Release);
            task
        } else {
            None
        };

        self.steal_lock.store(false, Ordering::Release);
        task
    }

    /// Approximate; may race with concurrent pushes and pops.
    pub(crate) fn is_empty(&self) -> bool {
        self.front.load(Ordering::Relaxed) == self.back.load(Ordering::Relaxed)
    }

    /// Drain every queued task, dropping each without running it. Only called
    /// once the queue's worker has stopped.
    pub(crate) fn flush(&self) -> usize {
        let mut flushed = 0;
        while self.pop_front().is_some() {
            flushed += 1;
        }
        flushed
    }
}
