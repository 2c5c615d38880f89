use std::sync::OnceLock;

use nix::sys::time::TimeValLike;
use nix::time::ClockId;

static EPOCH: OnceLock<i64> = OnceLock::new();

fn monotonic_micros() -> i64 {
    let timespec = nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC)
        .expect("clock_gettime(CLOCK_MONOTONIC) failed");

    timespec.num_microseconds()
}

/// Milliseconds since process start, from the monotonic clock. Never
/// decreases and is unaffected by wall clock adjustments.
pub fn now() -> f64 {
    let epoch = *EPOCH.get_or_init(monotonic_micros);
    let micros = monotonic_micros() - epoch;
    micros as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::now;

    #[test]
    fn non_decreasing() {
        let mut prev = now();
        for _ in 0..1000 {
            let t = now();
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn sub_millisecond_granularity() {
        let start = now();
        std::thread::sleep(std::time::Duration::from_micros(1500));
        let elapsed = now() - start;
        assert!(elapsed >= 1.0, "elapsed = {elapsed}");
        assert!(elapsed < 1000.0, "elapsed = {elapsed}");
    }
}
