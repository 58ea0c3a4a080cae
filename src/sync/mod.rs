//! Audio/video synchronization for nitro-media
//!
//! This module holds the clocks playback is paced against and the pure
//! functions that turn clock differences into presentation delays:
//! - [`Clock`] and [`SerialCounter`] for serial-aware presentation time
//! - [`TimeSource`] for injectable wall-clock time
//! - [`compute_target_delay`] for the three-zone drift correction

pub mod clock;
pub mod time;

pub use clock::{Clock, SerialCounter, END_OF_STREAM_SERIAL, FLUSH_SERIAL};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};

use crate::utils::config::SyncConfig;

/// No correction is applied below this drift (seconds)
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;

/// Correction threshold ceiling, also the frame timer reset limit (seconds)
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;

/// Frames longer than this are extended instead of duplicated (seconds)
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// Clocks further apart than this are treated as unrelated (seconds)
pub const NOSYNC_THRESHOLD: f64 = 10.0;

/// Longest plausible gap between two consecutive frames (seconds)
pub const MAX_FRAME_DURATION: f64 = 3600.0;

/// Display duration of `prev` given the timestamp of the frame after it
///
/// Frames from different serials are 0 apart. When the timestamp gap is
/// unusable (NaN, non-positive or implausibly large) the previous frame's own
/// duration is used.
pub fn frame_duration(
    prev: (i32, f64, f64),
    next: (i32, f64),
    max_frame_duration: f64,
) -> f64 {
    let (prev_serial, prev_pts, prev_duration) = prev;
    let (next_serial, next_pts) = next;
    if prev_serial != next_serial {
        return 0.0;
    }

    let duration = next_pts - prev_pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        prev_duration
    } else {
        duration
    }
}

/// Adjust the nominal frame `delay` for the video clock's drift `diff`
///
/// `diff` is the video clock minus the master clock. Lagging video shortens
/// the delay (never below zero), leading video lengthens it: short frames are
/// shown twice, long frames are extended by the drift.
pub fn compute_target_delay(delay: f64, diff: f64, sync: &SyncConfig) -> f64 {
    if diff.is_nan() || diff.abs() >= sync.max_frame_duration {
        return delay;
    }

    let threshold = delay.clamp(sync.min_threshold, sync.max_threshold);
    if diff <= -threshold {
        (delay + diff).max(0.0)
    } else if diff >= threshold && delay > sync.framedup_threshold {
        delay + diff
    } else if diff >= threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// Whether a frame at `timestamp` is the one to show for `target`
pub fn is_closest_to(timestamp: f64, target: f64, duration: f64) -> bool {
    (timestamp - target).abs() < duration
}
