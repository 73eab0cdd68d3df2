//! Monotonic race clock
//!
//! Built on `tokio::time::Instant`, which never follows wall-clock
//! adjustments (and can be paused in tests).

use std::time::Duration;
use tokio::time::Instant;

/// Reference instant for "time zero" of the current race
#[derive(Debug, Clone, Copy, Default)]
pub struct RaceClock {
    zero: Option<Instant>,
}

impl RaceClock {
    pub fn new() -> Self {
        Self { zero: None }
    }

    /// Reset the reference instant to now
    pub fn zero(&mut self) {
        self.zero_at(Instant::now());
    }

    /// Reset the reference instant to a captured instant
    pub fn zero_at(&mut self, at: Instant) {
        self.zero = Some(at);
    }

    /// Forget the reference instant
    pub fn clear(&mut self) {
        self.zero = None;
    }

    pub fn is_zeroed(&self) -> bool {
        self.zero.is_some()
    }

    /// Time since last `zero()`; zero if never zeroed
    pub fn elapsed(&self) -> Duration {
        self.since_zero(Instant::now())
    }

    /// Offset of `at` from time zero, saturating for instants before it
    pub fn since_zero(&self, at: Instant) -> Duration {
        match self.zero {
            Some(zero) => at.saturating_duration_since(zero),
            None => Duration::ZERO,
        }
    }

    /// Absolute instant for an offset from time zero
    pub fn deadline(&self, offset: Duration) -> Option<Instant> {
        self.zero.map(|zero| zero + offset)
    }
}
