//! Worker-count resolution.
//!
//! `BENCH_NUM_THREADS` wins, `BENCH_MAX_THREADS` caps the result, and
//! `OMP_NUM_THREADS` is honored as a fallback so existing OpenMP run scripts
//! keep working. Without any of those the hardware concurrency is used.

use once_cell::sync::Lazy;

/// The number of workers the process-wide pool will be built with. Resolved
/// once from the environment and cached.
pub fn num_threads() -> usize {
    static THREADS: Lazy<usize> = Lazy::new(|| {
        resolve(
            parse_env("BENCH_NUM_THREADS"),
            parse_env("BENCH_MAX_THREADS"),
            parse_env("OMP_NUM_THREADS"),
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    });
    *THREADS
}

fn parse_env(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("ignoring unparsable {name}={value}");
            None
        }
    }
}

fn resolve(
    requested: Option<usize>,
    cap: Option<usize>,
    omp: Option<usize>,
    hardware: usize,
) -> usize {
    let mut threads = requested.or(omp).unwrap_or(hardware);
    if let Some(cap) = cap {
        threads = threads.min(cap);
    }
    threads.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_request_wins() {
        assert_eq!(resolve(Some(3), None, Some(7), 16), 3);
    }

    #[test]
    fn omp_fallback() {
        assert_eq!(resolve(None, None, Some(7), 16), 7);
    }

    #[test]
    fn hardware_default() {
        assert_eq!(resolve(None, None, None, 16), 16);
    }

    #[test]
    fn cap_applies_to_any_source() {
        assert_eq!(resolve(Some(12), Some(4), None, 16), 4);
        assert_eq!(resolve(None, Some(4), Some(12), 16), 4);
        assert_eq!(resolve(None, Some(4), None, 16), 4);
    }

    #[test]
    fn never_below_one() {
        assert_eq!(resolve(Some(0), None, None, 16), 1);
        assert_eq!(resolve(None, Some(0), None, 16), 1);
    }
}
