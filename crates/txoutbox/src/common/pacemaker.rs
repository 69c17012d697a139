//! Adaptive polling pace
//!
//! Each worker owns one pace maker. Productive polls keep the lane at the
//! minimum interval; empty polls grow the interval multiplicatively with
//! jitter so idle lanes stop hammering the database in lockstep. Errors
//! run a separate exponential backoff.

use crate::common::config::RelayConfig;
use rand::Rng;
use std::time::Duration;

const GROWTH_FACTOR: f64 = 1.5;
const JITTER_FRACTION: f64 = 0.2;

/// Poll and backoff pacing for a single lane.
#[derive(Debug)]
pub struct PaceMaker {
    poll_interval: Duration,
    error_backoff: Duration,
    consecutive_empty_polls: u32,
    min_poll_interval: Duration,
    max_poll_interval: Duration,
    min_error_backoff: Duration,
    max_error_backoff: Duration,
}

impl PaceMaker {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            poll_interval: config.min_poll_interval,
            error_backoff: config.min_error_backoff,
            consecutive_empty_polls: 0,
            min_poll_interval: config.min_poll_interval,
            max_poll_interval: config.max_poll_interval,
            min_error_backoff: config.min_error_backoff,
            max_error_backoff: config.max_error_backoff,
        }
    }

    /// Record a completed cycle. A productive cycle snaps the interval back
    /// to the floor; an empty one grows it. Either way the error backoff
    /// resets.
    pub fn on_success(&mut self, had_rows: bool) {
        self.error_backoff = self.min_error_backoff;
        if had_rows {
            self.consecutive_empty_polls = 0;
            self.poll_interval = self.min_poll_interval;
        } else {
            self.consecutive_empty_polls = self.consecutive_empty_polls.saturating_add(1);
            let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
            let grown = self.poll_interval.mul_f64(GROWTH_FACTOR + jitter);
            self.poll_interval = grown.clamp(self.min_poll_interval, self.max_poll_interval);
        }
    }

    /// Record an error and return how long to back off before the next
    /// attempt. Repeated errors double the wait up to the ceiling.
    pub fn on_error(&mut self) -> Duration {
        let backoff = self.error_backoff;
        self.error_backoff = self
            .error_backoff
            .saturating_mul(2)
            .clamp(self.min_error_backoff, self.max_error_backoff);
        backoff
    }

    /// Delay before the next poll.
    pub fn poll_delay(&self) -> Duration {
        self.poll_interval
    }

    /// Empty polls since the last productive cycle. Diagnostic only; the
    /// pacing itself works off the current interval.
    pub fn consecutive_empty_polls(&self) -> u32 {
        self.consecutive_empty_polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pace() -> PaceMaker {
        let config = RelayConfig::default()
            .with_poll_interval(Duration::from_millis(5), Duration::from_secs(1))
            .with_error_backoff(Duration::from_millis(100), Duration::from_secs(30));
        PaceMaker::new(&config)
    }

    #[test]
    fn test_starts_at_minimum() {
        let pace = pace();
        assert_eq!(pace.poll_delay(), Duration::from_millis(5));
        assert_eq!(pace.consecutive_empty_polls(), 0);
    }

    #[test]
    fn test_empty_polls_grow_interval_to_ceiling() {
        let mut pace = pace();
        let mut previous = pace.poll_delay();
        for _ in 0..32 {
            pace.on_success(false);
            let current = pace.poll_delay();
            assert!(current >= previous);
            assert!(current <= Duration::from_secs(1));
            previous = current;
        }
        // 1.5x growth from 5ms crosses 1s well within 32 empty polls
        assert_eq!(pace.poll_delay(), Duration::from_secs(1));
        assert_eq!(pace.consecutive_empty_polls(), 32);
    }

    #[test]
    fn test_growth_includes_jitter_within_bounds() {
        let mut pace = pace();
        pace.on_success(false);
        let grown = pace.poll_delay();
        let min = Duration::from_millis(5).mul_f64(GROWTH_FACTOR);
        let max = Duration::from_millis(5).mul_f64(GROWTH_FACTOR + JITTER_FRACTION);
        assert!(grown >= min, "{:?} below {:?}", grown, min);
        assert!(grown <= max, "{:?} above {:?}", grown, max);
    }

    #[test]
    fn test_rows_reset_interval() {
        let mut pace = pace();
        for _ in 0..10 {
            pace.on_success(false);
        }
        assert!(pace.poll_delay() > Duration::from_millis(5));

        pace.on_success(true);
        assert_eq!(pace.poll_delay(), Duration::from_millis(5));
        assert_eq!(pace.consecutive_empty_polls(), 0);
    }

    #[test]
    fn test_error_backoff_doubles_to_ceiling() {
        let mut pace = pace();
        assert_eq!(pace.on_error(), Duration::from_millis(100));
        assert_eq!(pace.on_error(), Duration::from_millis(200));
        assert_eq!(pace.on_error(), Duration::from_millis(400));
        for _ in 0..16 {
            pace.on_error();
        }
        assert_eq!(pace.on_error(), Duration::from_secs(30));
    }

    #[test]
    fn test_success_resets_error_backoff() {
        let mut pace = pace();
        pace.on_error();
        pace.on_error();
        assert!(pace.on_error() > Duration::from_millis(100));

        pace.on_success(true);
        assert_eq!(pace.on_error(), Duration::from_millis(100));
    }
}
