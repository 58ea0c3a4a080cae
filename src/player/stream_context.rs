//! Per-stream pipeline state
//!
//! A [`StreamContext`] ties one selected stream to its decoder, its packet
//! and frame queues and its serial. The queues and decoder are parked in
//! the context until the pipeline tasks claim them at start.

use crate::decoder::{bounded, Decoder, Frame, MediaKind, Packet, QueueReceiver, QueueSender, StreamInfo};
use crate::sync::{is_closest_to, SerialCounter};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};

/// Seek a stream's decoder still has to reach
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingSeek {
    pub target: f64,

    /// Generation created by the seek
    pub serial: i32,
}

/// Decoder and queue ends handed to the pipeline tasks
pub(crate) struct StreamPipeline {
    pub decoder: Box<dyn Decoder>,
    pub packets: QueueReceiver<Packet>,
    pub frames_tx: QueueSender<Frame>,
    pub frames_rx: QueueReceiver<Frame>,
}

/// Pipeline state of one selected stream
pub struct StreamContext {
    info: StreamInfo,
    serial: SerialCounter,
    pending_seek: Mutex<Option<PendingSeek>>,
    packets: QueueSender<Packet>,

    /// Serials of end-of-stream markers in flight, oldest first
    eos_in_flight: Mutex<VecDeque<i32>>,

    /// Serial whose end-of-stream marker reached the output stage
    finished_serial: AtomicI32,

    pipeline: Mutex<Option<StreamPipeline>>,
}

impl StreamContext {
    /// Create the context and its queues
    pub(crate) fn new(
        info: StreamInfo,
        decoder: Box<dyn Decoder>,
        packet_capacity: usize,
        frame_capacity: usize,
    ) -> Self {
        let (packets, packets_rx) = bounded(packet_capacity);
        let (frames_tx, frames_rx) = bounded(frame_capacity);

        Self {
            info,
            serial: SerialCounter::new(),
            pending_seek: Mutex::new(None),
            packets,
            eos_in_flight: Mutex::new(VecDeque::new()),
            finished_serial: AtomicI32::new(-1),
            pipeline: Mutex::new(Some(StreamPipeline {
                decoder,
                packets: packets_rx,
                frames_tx,
                frames_rx,
            })),
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Container index of the stream
    pub fn index(&self) -> usize {
        self.info.index
    }

    pub fn kind(&self) -> MediaKind {
        self.info.kind
    }

    pub fn serial(&self) -> &SerialCounter {
        &self.serial
    }

    pub(crate) fn packets(&self) -> &QueueSender<Packet> {
        &self.packets
    }

    pub(crate) fn take_pipeline(&self) -> Option<StreamPipeline> {
        self.pipeline.lock().take()
    }

    /// Start a new generation that must skip forward to `target`
    pub fn begin_seek(&self, target: f64) -> i32 {
        let serial = self.serial.bump();
        *self.pending_seek.lock() = Some(PendingSeek { target, serial });
        debug!(
            "{:?} stream {} seeking to {:.3}s as serial {}",
            self.info.kind, self.info.index, target, serial
        );
        serial
    }

    pub fn pending_seek(&self) -> Option<PendingSeek> {
        *self.pending_seek.lock()
    }

    /// Whether a decoded frame of `serial` may pass the seek skip
    ///
    /// Within the generation of a pending seek, frames are dropped until one
    /// lies within its own duration of the target or at or past it. That
    /// frame clears the pending seek.
    pub fn accept_after_seek(&self, serial: i32, pts: f64, duration: f64) -> bool {
        let mut pending = self.pending_seek.lock();
        match *pending {
            Some(seek) if seek.serial == serial => {
                if is_closest_to(pts, seek.target, duration) || pts >= seek.target {
                    *pending = None;
                    true
                } else {
                    false
                }
            }
            _ => true,
        }
    }

    /// Record that an end-of-stream marker for the current serial was queued
    pub(crate) fn end_of_stream_sent(&self) {
        self.eos_in_flight.lock().push_back(self.serial.current());
    }

    /// Record that the oldest end-of-stream marker reached the output stage
    pub(crate) fn end_of_stream_reached(&self) {
        if let Some(serial) = self.eos_in_flight.lock().pop_front() {
            self.finished_serial.store(serial, Ordering::Release);
        }
    }

    /// Whether the current generation has been fully decoded and handed on
    pub fn is_finished(&self) -> bool {
        self.finished_serial.load(Ordering::Acquire) == self.serial.current()
    }
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("index", &self.info.index)
            .field("kind", &self.info.kind)
            .field("serial", &self.serial)
            .field("pending_seek", &self.pending_seek())
            .finish()
    }
}
