use std::time::Duration;

/// Wait applied after the first failure.
pub const INITIAL_WAIT: Duration = Duration::from_secs(5);
/// Upper bound of a single wait.
pub const MAX_WAIT: Duration = Duration::from_secs(240);

/// Exponential backoff between two connection attempts.
///
/// After `n` consecutive failures the next wait is `min(5s · 2ⁿ, 240s)`.
/// No jitter is applied here, the transport adds its own for the
/// reconnections inside a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    /// Creates a [`Backoff`] with no recorded failures.
    #[must_use]
    pub const fn new() -> Self {
        Self { failures: 0 }
    }

    /// Returns the number of consecutive failures.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the wait which would follow the next failure.
    #[must_use]
    pub fn next_wait(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures).unwrap_or(u32::MAX);
        INITIAL_WAIT.saturating_mul(factor).min(MAX_WAIT)
    }

    /// Records a failure and returns the wait before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        let wait = self.next_wait();
        self.failures = self.failures.saturating_add(1);
        wait
    }

    /// Forgets all recorded failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
