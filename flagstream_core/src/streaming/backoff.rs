//! Reconnect pacing: exponential backoff halved and topped up with random
//! jitter, reset after a sufficiently long healthy run.
use std::time::{Duration, Instant};

use rand::Rng;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const RESET_INTERVAL: Duration = Duration::from_secs(60);
const JITTER_RATIO: f64 = 0.5;

/// Produces the delay before each reconnect attempt:
/// `backoff/2 + backoff * jitter_ratio * U[0,1)` with
/// `backoff = min(max_delay, first_delay * 2^retries)`. A connection that
/// stayed up longer than the reset interval starts the schedule over.
pub struct BackoffJitterStrategy {
    first_retry_delay: Duration,
    max_retry_delay: Duration,
    reset_interval: Duration,
    retry_count: u32,
    last_good_run: Instant,
}

impl BackoffJitterStrategy {
    pub fn new(first_retry_delay: Duration) -> BackoffJitterStrategy {
        BackoffJitterStrategy::with_intervals(first_retry_delay, MAX_RETRY_DELAY, RESET_INTERVAL)
    }

    pub(crate) fn with_intervals(
        first_retry_delay: Duration,
        max_retry_delay: Duration,
        reset_interval: Duration,
    ) -> BackoffJitterStrategy {
        BackoffJitterStrategy {
            first_retry_delay,
            max_retry_delay,
            reset_interval,
            retry_count: 0,
            last_good_run: Instant::now(),
        }
    }

    /// Mark the connection healthy as of now.
    pub fn set_good_run_at_now(&mut self) {
        self.last_good_run = Instant::now();
    }

    /// Attempts since the last healthy run.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn backoff_secs(&self) -> f64 {
        let delay = self.first_retry_delay.as_secs_f64() * 2f64.powi(self.retry_count as i32);
        delay.min(self.max_retry_delay.as_secs_f64())
    }

    /// The delay to sleep before the next attempt. Advances the retry
    /// counter.
    pub fn next_delay(&mut self) -> Duration {
        if self.last_good_run.elapsed() > self.reset_interval {
            self.retry_count = 0;
        }
        let backoff = self.backoff_secs();
        let jitter = backoff * JITTER_RATIO * rand::thread_rng().gen_range(0.0..1.0);
        self.retry_count += 1;
        let delay = Duration::from_secs_f64(jitter + backoff / 2.0);
        log::debug!(target: "flagstream",
            "backoff {backoff:.3}s, next reconnect delay {delay:?}");
        delay
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn delays_grow_and_stay_bounded() {
        let mut strategy = BackoffJitterStrategy::with_intervals(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        let mut previous_floor = Duration::ZERO;
        for _ in 0..10 {
            let backoff = Duration::from_secs_f64(strategy.backoff_secs());
            let delay = strategy.next_delay();
            // Lower bound: half the deterministic backoff. Upper bound:
            // backoff * (1/2 + jitter ratio).
            assert!(delay >= backoff / 2);
            assert!(delay <= backoff + backoff / 2);
            assert!(backoff / 2 >= previous_floor);
            previous_floor = backoff / 2;
        }
        // The cap holds no matter how many retries accumulated.
        assert!(strategy.next_delay() <= Duration::from_secs(90));
    }

    #[test]
    fn good_run_resets_the_schedule() {
        let mut strategy = BackoffJitterStrategy::with_intervals(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        for _ in 0..6 {
            let _ = strategy.next_delay();
        }
        // With a zero reset interval every healthy instant resets the
        // counter, so the next delay is drawn from the initial window.
        std::thread::sleep(Duration::from_millis(5));
        let delay = strategy.next_delay();
        assert!(delay <= Duration::from_secs_f64(1.5));
    }

    proptest! {
        #[test]
        fn delay_is_always_within_the_documented_bound(retries in 0u32..20) {
            let mut strategy = BackoffJitterStrategy::with_intervals(
                Duration::from_millis(100),
                Duration::from_secs(60),
                Duration::from_secs(3600),
            );
            for _ in 0..retries {
                let _ = strategy.next_delay();
            }
            let delay = strategy.next_delay();
            prop_assert!(delay <= Duration::from_secs(90));
        }
    }
}
