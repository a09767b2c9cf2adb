//! Time Source
//!
//! All routing state that depends on elapsed time (circuit cooldowns,
//! telemetry windows, optimizer observation windows) reads time through
//! the [`Clock`] trait so control loops can be driven by an injected clock
//! in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    /// Milliseconds since the clock's origin.
    ///
    /// Never returns 0 so that 0 can be used as a "never happened" sentinel.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug)]
pub struct SystemClock {
    startup_time: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            startup_time: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.startup_time.elapsed().as_millis() as u64 + 1
    }
}

/// Manually advanced clock
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start_ms` (clamped to at least 1)
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms.max(1)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    /// Jump to an absolute time (never backwards)
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
