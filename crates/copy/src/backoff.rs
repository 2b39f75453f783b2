//! Adaptive wait between copy status polls.

use std::time::Duration;

use datamover_transfer::CopyPollOptions;

/// Factor applied to the wait after a run of polls far from completion.
const GROWTH: u32 = 10;

/// Wait between two status polls of a server-side copy.
///
/// Starts at the minimum interval. Once the copy is within the
/// near-completion distance the wait drops back to the minimum; otherwise
/// every `polls_before_backoff` consecutive polls multiply it by ten, up to
/// the maximum interval.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    near_completion: u64,
    polls_before_backoff: u32,
    wait: Duration,
    slow_polls: u32,
}

impl PollBackoff {
    pub fn new(options: &CopyPollOptions) -> Self {
        let min = options.min_interval();
        Self {
            min,
            max: options.max_interval().max(min),
            near_completion: options.near_completion_bytes,
            polls_before_backoff: options.polls_before_backoff.max(1),
            wait: min,
            slow_polls: 0,
        }
    }

    /// Wait that applies right now.
    pub fn current(&self) -> Duration {
        self.wait
    }

    /// Records one poll that left `remaining` bytes to copy and returns the
    /// wait before the next one.
    pub fn next_wait(&mut self, remaining: u64) -> Duration {
        if remaining <= self.near_completion {
            self.wait = self.min;
            self.slow_polls = 0;
            return self.wait;
        }
        self.slow_polls += 1;
        if self.slow_polls >= self.polls_before_backoff {
            self.wait = self.wait.saturating_mul(GROWTH).min(self.max);
            self.slow_polls = 0;
        }
        self.wait
    }

    pub fn reset(&mut self) {
        self.wait = self.min;
        self.slow_polls = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn backoff() -> PollBackoff {
        PollBackoff::new(&CopyPollOptions::default())
    }

    #[test]
    fn starts_at_the_minimum() {
        assert_eq!(backoff().current(), Duration::from_millis(100));
    }

    #[test]
    fn grows_tenfold_after_a_run_of_slow_polls() {
        let mut b = backoff();
        let far = 10_000 * MIB;
        let waits: Vec<u64> = (0..8).map(|_| b.next_wait(far).as_millis() as u64).collect();
        assert_eq!(
            waits,
            vec![100, 1_000, 1_000, 10_000, 10_000, 100_000, 100_000, 300_000]
        );
        assert_eq!(b.next_wait(far), Duration::from_secs(300));
    }

    #[test]
    fn near_completion_resets_to_the_minimum() {
        let mut b = backoff();
        for _ in 0..4 {
            b.next_wait(1_000 * MIB);
        }
        assert_eq!(b.current(), Duration::from_secs(10));
        assert_eq!(b.next_wait(100 * MIB), Duration::from_millis(100));
        // The slow-poll run starts over after a reset.
        assert_eq!(b.next_wait(1_000 * MIB), Duration::from_millis(100));
        assert_eq!(b.next_wait(1_000 * MIB), Duration::from_secs(1));
    }

    #[test]
    fn stays_at_the_minimum_while_close() {
        let mut b = backoff();
        for _ in 0..10 {
            assert_eq!(b.next_wait(MIB), Duration::from_millis(100));
        }
    }

    #[test]
    fn custom_bounds() {
        let mut b = PollBackoff::new(&CopyPollOptions {
            min_interval_ms: 5,
            max_interval_ms: 200,
            near_completion_bytes: 0,
            polls_before_backoff: 1,
        });
        assert_eq!(b.next_wait(1), Duration::from_millis(50));
        assert_eq!(b.next_wait(1), Duration::from_millis(200));
        b.reset();
        assert_eq!(b.current(), Duration::from_millis(5));
        assert_eq!(b.next_wait(0), Duration::from_millis(5));
    }
}
