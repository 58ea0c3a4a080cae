//! Wall-clock time sources
//!
//! Every clock and the frame timer read time through a shared
//! [`TimeSource`], so playback can be driven by the system clock or stepped
//! explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source, in seconds
pub trait TimeSource: Send + Sync {
    /// Current time in seconds since an arbitrary fixed origin
    fn now(&self) -> f64;
}

/// System time source backed by [`Instant`]
pub struct SystemTimeSource {
    start_time: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Time source that only moves when told to
///
/// Used for deterministic playback tests and offline rendering, where the
/// host steps time by one display tick at a time.
#[derive(Default)]
pub struct ManualTimeSource {
    micros: AtomicU64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, delta: Duration) {
        self.micros
            .fetch_add(delta.as_micros() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, time: Duration) {
        self.micros.store(time.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}
