//! Platform primitives: hardware timestamps, spin hints, the stack probe used
//! to bound recursive splitting, and CPU pinning for worker threads.

use std::cell::Cell;

use once_cell::sync::Lazy;

/// Stack size the pool requests for its spawned workers.
pub(crate) const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Assumed stack size for threads we didn't spawn (the platform default).
const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// A monotonic hardware timestamp. Units are cycles on x86-64 and generic
/// counter ticks on aarch64; callers must only compare differences against
/// [`init_time`], which is expressed in the same unit.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub(crate) fn now() -> u64 {
    // SAFETY: rdtsc has no preconditions.
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub(crate) fn now() -> u64 {
    let val: u64;
    // SAFETY: reading the virtual counter register has no side effects.
    unsafe { std::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
    val
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub(crate) fn now() -> u64 {
    static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
    START.elapsed().as_nanos() as u64
}

/// The timespan budget: how long a task executes iterations before it starts
/// spawning balancing tasks. Calibrated against the tail of the pool's
/// scheduling latency, so on x86-64 it scales with the worker count.
pub(crate) fn init_time() -> u64 {
    static INIT_TIME: Lazy<u64> = Lazy::new(|| {
        if cfg!(target_arch = "x86_64") {
            530 * crate::config::num_threads() as u64
        } else if cfg!(target_arch = "aarch64") {
            1800
        } else {
            // the fallback clock ticks in nanoseconds
            100_000
        }
    });
    *INIT_TIME
}

#[inline(always)]
pub(crate) fn cpu_relax() {
    std::hint::spin_loop();
}

std::thread_local! {
    /// Highest stack address observed for this thread, captured on first probe
    /// (or at worker startup, which probes from the outermost frame).
    static STACK_BASE: Cell<usize> = const { Cell::new(0) };
    static STACK_SIZE: Cell<usize> = const { Cell::new(DEFAULT_STACK_SIZE) };
}

/// Record the current frame as the stack base for this thread. Workers call
/// this from their outermost frame so the probe measures true depth.
pub(crate) fn register_stack(stack_size: usize) {
    let probe = 0u8;
    STACK_BASE.with(|base| base.set(std::ptr::addr_of!(probe) as usize));
    STACK_SIZE.with(|size| size.set(stack_size));
}

/// Whether the current frame is past the midpoint of this thread's stack.
/// Splitting must stop once this returns true: a parallel-for can be invoked
/// recursively from inside a task, and every split adds frames.
pub(crate) fn is_stack_half_full() -> bool {
    let probe = 0u8;
    let here = std::ptr::addr_of!(probe) as usize;
    let base = STACK_BASE.with(|base| {
        if base.get() == 0 {
            base.set(here);
        }
        base.get()
    });
    // stacks grow downward on every supported platform
    let depth = base.saturating_sub(here);
    depth > STACK_SIZE.with(|size| size.get()) / 2
}

/// Pin the calling thread to the `slot`-th CPU it is currently allowed to run
/// on. Counting set bits of the inherited mask (rather than using the raw CPU
/// number) keeps pinning correct under an external cpuset or taskset.
///
/// Failures are logged and otherwise ignored; pinning is a performance hint.
pub(crate) fn pin_to_slot(slot: usize) {
    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let this = Pid::from_raw(0);
    let allowed = match sched_getaffinity(this) {
        Ok(mask) => mask,
        Err(errno) => {
            log::warn!("sched_getaffinity failed, not pinning worker {slot}: {errno}");
            return;
        }
    };

    let mut seen = 0;
    for cpu in 0..CpuSet::count() {
        if allowed.is_set(cpu).unwrap_or(false) {
            if seen == slot {
                let mut only = CpuSet::new();
                // cannot fail: `cpu` is within CpuSet::count()
                only.set(cpu).expect("cpu index out of range");
                if let Err(errno) = sched_setaffinity(this, &only) {
                    log::warn!("failed to pin worker {slot} to cpu {cpu}: {errno}");
                }
                return;
            }
            seen += 1;
        }
    }
    log::warn!("fewer allowed cpus than worker slots, not pinning worker {slot}");
}
