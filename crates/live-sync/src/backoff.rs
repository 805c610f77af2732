use std::time::Duration;

/// Capped exponential delay: `min(cap, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Observable retry bookkeeping. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackoffState {
    pub attempt: u32,
    pub next_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    state: BackoffState,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: BackoffState {
                attempt: 0,
                next_delay: policy.delay_for(0),
            },
        }
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.state.attempt);
        self.state.attempt = self.state.attempt.saturating_add(1);
        self.state.next_delay = self.policy.delay_for(self.state.attempt);
        delay
    }

    pub fn reset(&mut self) {
        self.state = BackoffState {
            attempt: 0,
            next_delay: self.policy.delay_for(0),
        };
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}
