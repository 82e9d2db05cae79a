use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff for client-side reconnects to the terminal relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn start(&self) -> ReconnectState {
        ReconnectState {
            policy: *self,
            attempt: 0,
            delay: self.initial_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempt: u32,
    delay: Duration,
}

impl ReconnectState {
    /// Returns the next attempt number and the delay to wait before it, or `None` once the
    /// policy is exhausted.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        let delay = self.delay;
        self.delay = next_backoff(self.delay, self.policy.max_delay);
        Some((self.attempt, delay))
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Called after a session reached `ready`.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.policy.initial_delay;
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap_then_gives_up() {
        let mut state = ReconnectPolicy::default().start();
        let delays: Vec<_> = std::iter::from_fn(|| state.next_attempt()).collect();
        assert_eq!(
            delays,
            vec![
                (1, Duration::from_secs(1)),
                (2, Duration::from_secs(2)),
                (3, Duration::from_secs(4)),
                (4, Duration::from_secs(8)),
                (5, Duration::from_secs(10)),
            ]
        );
        assert!(state.next_attempt().is_none());
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut state = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        }
        .start();
        state.next_attempt();
        state.next_attempt();
        assert!(state.next_attempt().is_none());
        state.reset();
        assert_eq!(state.next_attempt(), Some((1, Duration::from_secs(1))));
    }
}
