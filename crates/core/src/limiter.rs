//! Cooldown gate for expensive actions.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};

/// Runs an action at most once per cooldown window.
pub struct RateLimiter {
    cooldown_micros: u64,
    last_run: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(cooldown: Duration) -> Self {
        Self::with_clock(cooldown, Arc::new(SystemClock::new()))
    }

    /// Create a limiter with a cooldown in milliseconds.
    pub fn from_millis(cooldown_ms: u64) -> Self {
        Self::new(Duration::from_millis(cooldown_ms))
    }

    /// Create a limiter on a specific clock.
    pub fn with_clock(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown_micros: u64::try_from(cooldown.as_micros()).unwrap_or(u64::MAX),
            last_run: None,
            clock,
        }
    }

    /// Whether `run` would invoke its action right now.
    pub fn ready(&self) -> bool {
        match self.last_run {
            None => true,
            Some(last) => self.clock.now_micros().saturating_sub(last) >= self.cooldown_micros,
        }
    }

    /// Invoke `task` unless the previous invocation is still inside the cooldown.
    ///
    /// Returns whether `task` ran.
    pub fn run<F: FnOnce()>(&mut self, task: F) -> bool {
        if !self.try_acquire() {
            return false;
        }
        task();
        true
    }

    /// Claim the current window without running anything.
    ///
    /// For actions that cannot be expressed as a synchronous closure.
    pub fn try_acquire(&mut self) -> bool {
        if !self.ready() {
            return false;
        }
        self.last_run = Some(self.clock.now_micros());
        true
    }

    /// Forget the last invocation.
    pub fn reset(&mut self) {
        self.last_run = None;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("cooldown_micros", &self.cooldown_micros)
            .field("last_run", &self.last_run)
            .finish()
    }
}
