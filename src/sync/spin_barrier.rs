//! A counting down-latch that spins instead of sleeping.
//!
//! Used for warm-up and pinning synchronization, where every participant is
//! already running on its own core and the wait is expected to be short.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::platform::cpu_relax;

#[derive(Debug)]
pub struct SpinBarrier {
    remaining: AtomicUsize,
}

impl SpinBarrier {
    /// A barrier that opens after `count` notifications.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Count down by one.
    pub fn notify(&self) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    /// Spin until the count reaches zero. Opens immediately if it already has.
    pub fn wait(&self) {
        while self.remaining.load(Ordering::Acquire) != 0 {
            cpu_relax();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn opens_at_zero() {
        let barrier = SpinBarrier::new(1);
        barrier.notify();
        barrier.wait();
    }

    #[test]
    fn already_open() {
        SpinBarrier::new(0).wait();
    }

    #[test]
    fn releases_all_threads() {
        let threads = 4;
        let barrier = Arc::new(SpinBarrier::new(threads));
        let arrived = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let arrived = Arc::clone(&arrived);
                std::thread::spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    barrier.notify();
                    barrier.wait();
                    // nobody gets past the barrier until everyone arrived
                    assert_eq!(arrived.load(Ordering::SeqCst), threads);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
