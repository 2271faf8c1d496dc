use std::time::Duration;

use crate::config::BackoffConfig;

/// Doubling delay sequence capped at `max`, optionally bounded by a total wait budget.
///
/// Delays never decrease and never exceed the cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    budget: Option<Duration>,
    waited: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        // A zero initial delay would never grow.
        let initial = config.initial.max(Duration::from_millis(1)).min(config.max);
        Self {
            current: initial,
            max: config.max,
            budget: config.max_total_wait,
            waited: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Next delay, or `None` once waiting it would exceed the total budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.current.min(self.max);
        if let Some(budget) = self.budget
            && self.waited + delay > budget
        {
            return None;
        }
        self.waited += delay;
        self.attempts += 1;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        Some(delay)
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn total_wait(&self) -> Duration {
        self.waited
    }
}
