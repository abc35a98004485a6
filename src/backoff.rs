use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

/// Base wait between connection verification attempts.
pub const VERIFY_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Exponential schedule starting at `base`, growing by `factor` and capped at
/// `cap`, with `retries` waits in total. No jitter.
pub fn exponential(
    base: Duration,
    factor: u32,
    cap: Duration,
    retries: usize,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(base.min(cap))
        .with_factor(factor.max(1) as f32)
        .with_max_delay(cap)
        .with_max_times(retries)
}

/// Schedule for re-verifying a transport: `max_attempts` attempts in total,
/// so one fewer wait, doubling from one second.
pub fn verify_backoff(max_attempts: u32, cap: Duration) -> ExponentialBuilder {
    let retries = max_attempts.max(1).saturating_sub(1) as usize;
    exponential(VERIFY_BASE_DELAY, 2, cap, retries)
}

/// The `n`th wait (starting at 1) of an exponential schedule.
pub fn nth_delay(base: Duration, factor: u32, cap: Duration, n: u32) -> Duration {
    exponential(base, factor, cap, n.max(1) as usize)
        .build()
        .last()
        .unwrap_or(Duration::ZERO)
}
