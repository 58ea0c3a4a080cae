//! PCM byte pipe between the audio task and the audio sink
//!
//! The pipe is a fixed-size byte ring plus a timeline describing which
//! presentation time and serial each written span belongs to. The reading
//! side uses the timeline to keep the audio clock pointed at the sample the
//! sink is about to play, and to drop spans invalidated by a flushing seek.

use super::AudioParameters;
use crate::sync::Clock;
use crate::utils::error::{MediaError, Result};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// End of one written span
#[derive(Debug, Clone, Copy)]
struct Marker {
    /// Absolute byte offset one past the span
    end: u64,

    /// Presentation time of the byte at `end`
    end_pts: f64,

    serial: i32,
}

#[derive(Default)]
struct Timeline {
    markers: VecDeque<Marker>,

    /// Total bytes accepted by the writer
    written: u64,

    /// Total bytes consumed by the reader, including skipped ones
    read: u64,
}

struct Shared {
    params: AudioParameters,
    timeline: Mutex<Timeline>,

    /// Signalled whenever the reader frees space
    space: Notify,

    /// Spans with a serial below this are discarded unplayed
    floor: AtomicI32,

    queued: AtomicUsize,
    closed: AtomicBool,
}

/// Create a PCM pipe holding up to `capacity` bytes
///
/// Reading from the pipe updates `clock` to the presentation time of the
/// first byte handed out.
pub fn pcm_pipe(
    params: AudioParameters,
    capacity: usize,
    clock: Arc<Clock>,
) -> (PcmWriter, PcmReader) {
    let block = params.block_align();
    let capacity = (capacity.max(block) / block) * block;
    let (producer, consumer) = HeapRb::<u8>::new(capacity).split();

    let shared = Arc::new(Shared {
        params,
        timeline: Mutex::new(Timeline::default()),
        space: Notify::new(),
        floor: AtomicI32::new(i32::MIN + 1),
        queued: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });

    let writer = PcmWriter {
        producer,
        shared: shared.clone(),
    };
    let reader = PcmReader {
        consumer,
        shared,
        clock,
    };

    (writer, reader)
}

/// Writing half of the PCM pipe
pub struct PcmWriter {
    producer: HeapProd<u8>,
    shared: Arc<Shared>,
}

impl PcmWriter {
    /// Append `bytes` whose last sample ends at `end_pts`
    ///
    /// Waits for the reader while the pipe is full. Spans whose serial has
    /// already been flushed are dropped without being queued.
    pub async fn write(&mut self, bytes: &[u8], end_pts: f64, serial: i32) -> Result<()> {
        if bytes.is_empty() || serial < self.shared.floor.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let mut timeline = self.shared.timeline.lock();
            timeline.written += bytes.len() as u64;
            let end = timeline.written;
            timeline.markers.push_back(Marker {
                end,
                end_pts,
                serial,
            });
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.closed.load(Ordering::Acquire) {
                return Err(MediaError::Audio("PCM pipe closed by the sink".to_string()));
            }

            // `queued` only changes under the timeline lock
            let pushed = {
                let _timeline = self.shared.timeline.lock();
                let pushed = self.producer.push_slice(rest);
                self.shared.queued.fetch_add(pushed, Ordering::AcqRel);
                pushed
            };
            if pushed > 0 {
                rest = &rest[pushed..];
            } else {
                notified.await;
            }
        }

        Ok(())
    }

    pub fn status(&self) -> PcmStatus {
        PcmStatus {
            shared: self.shared.clone(),
        }
    }
}

/// Reading half of the PCM pipe, owned by the audio sink
pub struct PcmReader {
    consumer: HeapCons<u8>,
    shared: Arc<Shared>,
    clock: Arc<Clock>,
}

impl PcmReader {
    /// Output format of the bytes in the pipe
    pub fn parameters(&self) -> AudioParameters {
        self.shared.params
    }

    /// Fill `out` with the next bytes, padding with silence on underrun
    ///
    /// Only whole sample frames are handed out. Returns the number of
    /// non-silent bytes.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let block = self.shared.params.block_align();
        let bytes_per_second = self.shared.params.bytes_per_second() as f64;
        let floor = self.shared.floor.load(Ordering::Acquire);
        let mut filled = 0;
        let mut freed = 0;
        let mut first = true;

        {
            let mut timeline = self.shared.timeline.lock();
            while let Some(marker) = timeline.markers.front().copied() {
                let remaining = (marker.end - timeline.read) as usize;

                if marker.serial < floor {
                    let skipped = self.consumer.skip(remaining);
                    timeline.read += skipped as u64;
                    freed += skipped;
                    if skipped < remaining {
                        break;
                    }
                    timeline.markers.pop_front();
                    continue;
                }

                let available = remaining.min(self.consumer.occupied_len());
                let take = (available.min(out.len() - filled) / block) * block;
                if take == 0 {
                    break;
                }

                if first {
                    let pts = marker.end_pts - remaining as f64 / bytes_per_second;
                    self.clock.set(pts, marker.serial);
                    first = false;
                }

                let popped = self.consumer.pop_slice(&mut out[filled..filled + take]);
                timeline.read += popped as u64;
                filled += popped;
                freed += popped;
                if popped == remaining {
                    timeline.markers.pop_front();
                }
                if filled == out.len() {
                    break;
                }
            }
            self.shared.queued.fetch_sub(freed, Ordering::AcqRel);
        }

        out[filled..].fill(0);
        if freed > 0 {
            self.shared.space.notify_waiters();
        }

        filled
    }

    pub fn status(&self) -> PcmStatus {
        PcmStatus {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for PcmReader {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.space.notify_waiters();
    }
}

/// Shared view of the pipe's fill level and flush floor
#[derive(Clone)]
pub struct PcmStatus {
    shared: Arc<Shared>,
}

impl PcmStatus {
    /// Bytes written but not yet read or skipped
    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.queued_bytes() == 0
    }

    /// Seconds of audio waiting in the pipe
    pub fn queued_duration(&self) -> f64 {
        self.queued_bytes() as f64 / self.shared.params.bytes_per_second() as f64
    }

    /// Discard every queued and future span with a serial below `serial`
    pub fn raise_floor(&self, serial: i32) {
        self.shared.floor.fetch_max(serial, Ordering::AcqRel);
    }

    /// Whether the reading side has gone away
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
