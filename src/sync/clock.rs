//! Drift-corrected presentation clocks
//!
//! A [`Clock`] remembers the last presentation timestamp it was given and the
//! wall-clock time at which that happened, and extrapolates from there. Each
//! clock is tied to the serial of the stream it follows: once a seek bumps the
//! stream's serial the clock reads NaN until it is set again.

use super::time::TimeSource;
use super::NOSYNC_THRESHOLD;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Reserved serial carried by flush markers
pub const FLUSH_SERIAL: i32 = i32::MAX;

/// Reserved serial carried by end-of-stream markers
pub const END_OF_STREAM_SERIAL: i32 = i32::MIN;

/// Per-stream generation counter, bumped on every seek
///
/// Cloning shares the counter.
#[derive(Clone, Default)]
pub struct SerialCounter(Arc<AtomicI32>);

impl SerialCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current serial
    pub fn current(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to the next serial and return it, never yielding a reserved value
    pub fn bump(&self) -> i32 {
        let next = |s: i32| {
            let n = s.wrapping_add(1);
            if n == FLUSH_SERIAL || n == END_OF_STREAM_SERIAL || n < 0 {
                0
            } else {
                n
            }
        };
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(next(s)))
        {
            Ok(previous) | Err(previous) => next(previous),
        }
    }

    /// Whether an item stamped with `serial` belongs to the current generation
    pub fn is_current(&self, serial: i32) -> bool {
        serial == self.current()
    }
}

impl fmt::Debug for SerialCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SerialCounter").field(&self.current()).finish()
    }
}

struct ClockState {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    serial: i32,
    paused: bool,
}

/// Presentation clock
pub struct Clock {
    time: Arc<dyn TimeSource>,
    owner: Option<SerialCounter>,
    nosync_threshold: f64,
    state: Mutex<ClockState>,
}

impl Clock {
    /// Create an unset clock
    ///
    /// With an `owner`, [`Clock::get`] returns NaN whenever the owner's serial
    /// differs from the serial the clock was last set with. Without one the
    /// clock is never considered stale.
    pub fn new(time: Arc<dyn TimeSource>, owner: Option<SerialCounter>) -> Self {
        Self {
            time,
            owner,
            nosync_threshold: NOSYNC_THRESHOLD,
            state: Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: 0.0,
                serial: -1,
                paused: false,
            }),
        }
    }

    /// Override the difference above which [`Clock::sync_to`] snaps to the other clock
    pub fn with_nosync_threshold(mut self, threshold: f64) -> Self {
        self.nosync_threshold = threshold;
        self
    }

    /// Current estimated presentation time, NaN when unset or stale
    pub fn get(&self) -> f64 {
        let state = self.state.lock();
        if let Some(owner) = &self.owner {
            if owner.current() != state.serial {
                return f64::NAN;
            }
        }

        if state.paused {
            state.pts
        } else {
            state.pts_drift + self.time.now()
        }
    }

    /// Record `pts` as valid for `serial`, as of now
    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, self.time.now());
    }

    /// Record `pts` as valid for `serial`, as of wall-clock `time`
    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        let mut state = self.state.lock();
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = serial;
    }

    /// Pull this clock to `other` when it is unset or too far away
    ///
    /// Differences below the no-sync threshold are left alone to avoid jitter.
    pub fn sync_to(&self, other: &Clock) {
        let clock = self.get();
        let other_clock = other.get();
        if !other_clock.is_nan()
            && (clock.is_nan() || (clock - other_clock).abs() > self.nosync_threshold)
        {
            self.set(other_clock, other.serial());
        }
    }

    /// Re-stamp the clock at its own current value
    pub fn refresh(&self) {
        let value = self.get();
        let serial = self.serial();
        self.set(value, serial);
    }

    /// Freeze or unfreeze the clock
    ///
    /// Pausing stamps the clock at its running value first, so a paused clock
    /// reads the position it was paused at rather than the last `set`.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        if paused && !state.paused {
            let now = self.time.now();
            state.pts = state.pts_drift + now;
            state.last_updated = now;
        }
        state.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Serial the clock was last set with
    pub fn serial(&self) -> i32 {
        self.state.lock().serial
    }

    /// Wall-clock time of the last `set`
    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Clock")
            .field("pts", &state.pts)
            .field("serial", &state.serial)
            .field("paused", &state.paused)
            .finish()
    }
}
