//! Device timeline clocks.
//!
//! The playback scheduler never reads wall time directly; it asks a
//! [`DeviceClock`] where the output device currently is on its timeline.
//! The cpal sink derives this from rendered samples, tests drive a
//! [`ManualClock`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Current position of an audio device's timeline.
pub trait DeviceClock: Send + Sync {
    /// Time elapsed on the device timeline. Must never go backwards.
    fn now(&self) -> Duration;
}

/// Hand-driven clock for exercising scheduling without audio hardware.
///
/// Clones share the same timeline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock positioned at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock positioned at `at`.
    pub fn starting_at(at: Duration) -> Self {
        let clock = Self::new();
        clock.set(at);
        clock
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.nanos
            .fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Jump to `at`. Ignored if `at` is earlier than the current position.
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(at.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl DeviceClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}
