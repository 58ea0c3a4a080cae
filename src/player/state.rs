//! Shared playback state for nitro-media
//!
//! This module holds the state the presentation side and the pipeline
//! tasks share: the pending seek slot, loop options, counters and the
//! event channel.

use crate::utils::error::{MediaError, Result};
use crossbeam_channel::Sender;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Portion of the timeline replayed while looping, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopRegion {
    pub start: f64,
    pub end: f64,
}

impl LoopRegion {
    /// Create a validated region
    pub fn new(start: f64, end: f64) -> Result<Self> {
        let region = Self { start, end };
        region.validate()?;
        Ok(region)
    }

    /// Reject empty, inverted or negative regions
    pub fn validate(&self) -> Result<()> {
        if !self.start.is_finite() || !self.end.is_finite() || self.start < 0.0 {
            return Err(MediaError::InvalidInput(format!(
                "Loop region start {} is not a valid position",
                self.start
            )));
        }
        if self.end <= self.start {
            return Err(MediaError::InvalidInput(format!(
                "Loop region end {} must be after its start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A seek waiting for the demux task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// Target position in seconds
    pub target: f64,

    /// Discard audio already handed to the sink.
    ///
    /// User seeks flush; loop seeks let queued audio play out so the wrap
    /// stays gapless.
    pub flush: bool,
}

impl SeekRequest {
    pub fn user(target: f64) -> Self {
        Self {
            target,
            flush: true,
        }
    }

    pub fn looping(target: f64) -> Self {
        Self {
            target,
            flush: false,
        }
    }
}

/// Single-slot mailbox for seek requests
///
/// A newer request replaces an unserviced one. A request counts as pending
/// until the demux task has bumped every serial, so "no seek pending"
/// implies the new generation is already visible. The lock is never held
/// while the demuxer seeks.
#[derive(Default)]
pub(crate) struct SeekController {
    slot: Mutex<SeekSlot>,
    notify: Notify,
}

#[derive(Default)]
struct SeekSlot {
    queued: Option<SeekRequest>,
    servicing: bool,
}

impl SeekSlot {
    fn is_pending(&self) -> bool {
        self.queued.is_some() || self.servicing
    }
}

impl SeekController {
    /// Post `request`, replacing any queued one
    pub fn request(&self, request: SeekRequest) {
        self.slot.lock().queued = Some(request);
        self.notify.notify_one();
    }

    /// Post `request` unless a seek is already pending
    pub fn request_if_idle(&self, request: SeekRequest) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_pending() {
            return false;
        }
        slot.queued = Some(request);
        drop(slot);
        self.notify.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_pending()
    }

    /// Run `service` on the queued request, keeping it visible as pending
    /// until `service` returns
    ///
    /// A request posted meanwhile stays queued for the next call.
    pub fn service<R>(&self, service: impl FnOnce(SeekRequest) -> R) -> Option<R> {
        let request = {
            let mut slot = self.slot.lock();
            let request = slot.queued.take()?;
            slot.servicing = true;
            request
        };

        let result = service(request);
        self.slot.lock().servicing = false;
        Some(result)
    }

    /// Resolve after the next request, or at once if one was posted unobserved
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Loop options changed by the host while playing
pub(crate) struct PlaybackOptions {
    looping: AtomicBool,
    region: Mutex<Option<LoopRegion>>,
}

impl PlaybackOptions {
    pub fn new(looping: bool, region: Option<LoopRegion>) -> Self {
        Self {
            looping: AtomicBool::new(looping),
            region: Mutex::new(region),
        }
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    pub fn region(&self) -> Option<LoopRegion> {
        *self.region.lock()
    }

    pub fn set_region(&self, region: Option<LoopRegion>) {
        *self.region.lock() = region;
    }

    /// Region to wrap at, only while looping is on
    pub fn active_region(&self) -> Option<LoopRegion> {
        if self.is_looping() {
            self.region()
        } else {
            None
        }
    }

    /// Where playback restarts after a wrap
    pub fn loop_start(&self) -> f64 {
        self.region().map_or(0.0, |region| region.start)
    }
}

/// Notification delivered to the host
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Pipeline tasks are running
    Started,

    Paused,

    Resumed,

    /// A user seek has been applied to every stream
    SeekCompleted { target: f64 },

    /// Playback wrapped around to `to`
    Looped { to: f64 },

    /// The last frame has been presented and looping is off
    Ended,

    /// A pipeline task stopped with an error
    Failed(String),
}

/// Snapshot of playback counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStats {
    /// Frames handed to the host
    pub frames_displayed: u64,

    /// Frames skipped because presentation fell behind
    pub frames_dropped_late: u64,

    /// Buffered frames discarded after a seek or loop
    pub frames_discarded_stale: u64,

    /// Packets and decoded frames discarded after a seek or loop
    pub items_discarded_stale: u64,

    /// Frames waiting in the ring buffer
    pub buffered_video_frames: usize,

    /// PCM bytes waiting for the sink
    pub queued_audio_bytes: usize,

    /// Current playback position in seconds
    pub position: f64,
}

/// Counters bumped by the pipeline tasks
#[derive(Default)]
pub(crate) struct TaskCounters {
    pub stale_items: AtomicU64,
}

impl TaskCounters {
    pub fn stale_item(&self) {
        self.stale_items.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fan-out point for [`MediaEvent`]s
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<MediaEvent>,
}

impl EventSender {
    pub fn new(tx: Sender<MediaEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: MediaEvent) {
        debug!("Media event: {:?}", event);
        // The stream keeps a receiver alive, so this only fails during teardown
        let _ = self.tx.send(event);
    }
}
