use std::time::Duration;

/// Bounded exponential backoff for rebuilding a lost connection
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    attempts: u32,
    max_attempts: u32,
}

impl ReconnectSupervisor {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Claim the next attempt and return how long to wait before it:
    /// 1 s, 2 s, 4 s, ... `None` once the cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        let delay = Duration::from_secs(1u64 << self.attempts.min(16));
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
