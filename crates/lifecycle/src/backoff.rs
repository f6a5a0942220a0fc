use std::time::Duration;

/// Reconnection backoff: step-function delays with an attempt ceiling.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Monotonically increasing delay steps; the last entry is the cap.
    pub steps: Vec<Duration>,
    /// Minimum interval between attempts regardless of backoff, to stop
    /// tight-loop reconnection storms from rapid close/open events.
    pub min_interval: Duration,
    /// After this many consecutive failures, pause for `cooldown` and
    /// reset the counter. The agent never gives up permanently.
    pub max_attempts: u32,
    /// Extended pause after the attempt ceiling.
    pub cooldown: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
            min_interval: Duration::from_secs(1),
            max_attempts: 20,
            cooldown: Duration::from_secs(300),
        }
    }
}

impl BackoffConfig {
    /// Delay for a given attempt number (1-based). Steps past the table
    /// end stay at the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.steps.len().saturating_sub(1));
        self.steps
            .get(idx)
            .copied()
            .unwrap_or(Duration::from_secs(1))
            .max(self.min_interval)
    }
}

/// What the session loop should do before its next dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDelay {
    /// Ordinary backoff step.
    Step(Duration),
    /// Attempt ceiling reached: wait out the cooldown, counter resets.
    Cooldown(Duration),
}

impl ReconnectDelay {
    pub fn duration(&self) -> Duration {
        match *self {
            ReconnectDelay::Step(d) | ReconnectDelay::Cooldown(d) => d,
        }
    }
}

/// Mutable attempt counter over a [`BackoffConfig`].
///
/// `next_delay` is called once per failed attempt; `confirm` resets the
/// counter when a connection is confirmed (not merely opened).
#[derive(Debug)]
pub struct ReconnectSchedule {
    config: BackoffConfig,
    attempt: u32,
}

impl ReconnectSchedule {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Registers a failure and returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> ReconnectDelay {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.config.max_attempts {
            self.attempt = 0;
            return ReconnectDelay::Cooldown(self.config.cooldown);
        }
        ReconnectDelay::Step(self.config.delay_for_attempt(self.attempt))
    }

    /// Resets the counter after a confirmed connection.
    pub fn confirm(&mut self) {
        self.attempt = 0;
    }

    /// Current consecutive-failure count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_follow_step_table_and_cap() {
        let config = BackoffConfig::default();
        let expected = [1u64, 2, 5, 10, 30, 60, 60, 60];
        for (i, &secs) in expected.iter().enumerate() {
            assert_eq!(
                config.delay_for_attempt((i + 1) as u32),
                Duration::from_secs(secs),
                "attempt {}",
                i + 1
            );
        }
    }

    #[test]
    fn delays_are_monotonically_non_decreasing() {
        let config = BackoffConfig::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..=30 {
            let d = config.delay_for_attempt(attempt);
            assert!(d >= prev, "attempt {attempt} went backwards");
            prev = d;
        }
    }

    #[test]
    fn min_interval_floors_every_delay() {
        let config = BackoffConfig {
            steps: vec![Duration::from_millis(50), Duration::from_secs(2)],
            min_interval: Duration::from_secs(1),
            ..BackoffConfig::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
    }

    #[test]
    fn ceiling_triggers_cooldown_and_resets() {
        let config = BackoffConfig {
            max_attempts: 3,
            cooldown: Duration::from_secs(120),
            ..BackoffConfig::default()
        };
        let mut schedule = ReconnectSchedule::new(config);
        assert_eq!(
            schedule.next_delay(),
            ReconnectDelay::Step(Duration::from_secs(1))
        );
        assert_eq!(
            schedule.next_delay(),
            ReconnectDelay::Step(Duration::from_secs(2))
        );
        assert_eq!(
            schedule.next_delay(),
            ReconnectDelay::Cooldown(Duration::from_secs(120))
        );
        // Counter reset: the cycle restarts, it never gives up.
        assert_eq!(schedule.attempt(), 0);
        assert_eq!(
            schedule.next_delay(),
            ReconnectDelay::Step(Duration::from_secs(1))
        );
    }

    #[test]
    fn confirm_resets_counter() {
        let mut schedule = ReconnectSchedule::new(BackoffConfig::default());
        schedule.next_delay();
        schedule.next_delay();
        assert_eq!(schedule.attempt(), 2);
        schedule.confirm();
        assert_eq!(schedule.attempt(), 0);
        assert_eq!(
            schedule.next_delay(),
            ReconnectDelay::Step(Duration::from_secs(1))
        );
    }
}
