//! Ring buffer of decoded YCbCr frames awaiting presentation
//!
//! The video task writes decoded pictures into fixed staging slots; the
//! presentation side peeks the oldest one and uploads it to the GPU only if
//! it decides to show it. One slot is always kept free, so a ring of
//! capacity N holds at most N - 1 frames.

use super::texture::YCbCrTextures;
use crate::decoder::{plane_dimensions, VideoFrame};
use crate::utils::error::{MediaError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Metadata of a buffered frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFrameInfo {
    /// Serial of the stream generation the frame was decoded for
    pub serial: i32,

    /// Presentation time in seconds
    pub timestamp: f64,

    /// Display duration in seconds
    pub duration: f64,
}

/// Staging memory for one frame, tightly packed
#[derive(Debug, Default)]
pub struct PlaneSet {
    pub width: u32,
    pub height: u32,

    /// Luma, Cb and Cr planes, each `pitch(i) * rows(i)` bytes
    pub planes: [Vec<u8>; 3],
}

impl PlaneSet {
    /// Bytes per row of plane `index`
    pub fn pitch(&self, index: usize) -> usize {
        plane_dimensions(self.width, self.height, index).0
    }

    /// Rows of plane `index`
    pub fn rows(&self, index: usize) -> usize {
        plane_dimensions(self.width, self.height, index).1
    }

    /// Copy `frame` in, honouring the source row stride
    fn copy_from(&mut self, frame: &VideoFrame) -> Result<()> {
        self.width = frame.width;
        self.height = frame.height;

        for (index, (dst, src)) in self.planes.iter_mut().zip(frame.planes.iter()).enumerate() {
            let (width, rows) = frame.plane_size(index);
            if rows > 0 && (src.stride < width || src.data.len() < (rows - 1) * src.stride + width)
            {
                return Err(MediaError::Video(format!(
                    "Plane {} too small for a {}x{} frame",
                    index, frame.width, frame.height
                )));
            }

            dst.resize(width * rows, 0);
            for row in 0..rows {
                let from = row * src.stride;
                dst[row * width..(row + 1) * width].copy_from_slice(&src.data[from..from + width]);
            }
        }

        Ok(())
    }
}

/// Ring indices, advanced only by the single writer (`tail`) and the single
/// reader (`head`)
///
/// Both sit under one short-lived lock because `clear` resets them together
/// with the generation. Pixel copies run under the per-slot lock instead, so
/// peeking never waits for a frame being written.
struct RingState {
    head: usize,
    tail: usize,

    /// Bumped by every clear; frames peeked before a clear become inert
    generation: u64,
    infos: Vec<Option<VideoFrameInfo>>,
}

/// Fixed-capacity ring of staged video frames
pub struct YCbCrBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    slots: Box<[Mutex<PlaneSet>]>,
    slot_freed: Notify,
}

impl YCbCrBuffer {
    /// Create a ring with `capacity` slots (at least 2)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let slots = (0..capacity)
            .map(|_| Mutex::new(PlaneSet::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            capacity,
            state: Mutex::new(RingState {
                head: 0,
                tail: 0,
                generation: 0,
                infos: vec![None; capacity],
            }),
            slots,
            slot_freed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently buffered
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        (state.tail + self.capacity - state.head) % self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        (state.tail + 1) % self.capacity == state.head
    }

    /// Write `frame` if a slot is free, returning whether it was accepted
    pub fn try_write(&self, frame: &VideoFrame, serial: i32) -> Result<bool> {
        let (index, generation) = {
            let state = self.state.lock();
            if (state.tail + 1) % self.capacity == state.head {
                return Ok(false);
            }
            (state.tail, state.generation)
        };

        self.slots[index].lock().copy_from(frame)?;

        let mut state = self.state.lock();
        if state.generation == generation {
            state.infos[index] = Some(VideoFrameInfo {
                serial,
                timestamp: frame.pts,
                duration: frame.duration,
            });
            state.tail = (index + 1) % self.capacity;
        }

        Ok(true)
    }

    /// Write `frame`, waiting for the reader while the ring is full
    pub async fn write_frame(&self, frame: &VideoFrame, serial: i32) -> Result<()> {
        loop {
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.try_write(frame, serial)? {
                return Ok(());
            }
            freed.await;
        }
    }

    /// Oldest unread frame, left in place until the handle is dropped
    pub fn peek(self: &Arc<Self>) -> Option<BufferedFrame> {
        let state = self.state.lock();
        if state.head == state.tail {
            return None;
        }

        let info = state.infos[state.head]?;
        Some(BufferedFrame {
            buffer: self.clone(),
            index: state.head,
            generation: state.generation,
            info,
            consume: true,
        })
    }

    /// Metadata of the frame `offset` places behind the oldest one
    pub fn peek_info(&self, offset: usize) -> Option<VideoFrameInfo> {
        let state = self.state.lock();
        let buffered = (state.tail + self.capacity - state.head) % self.capacity;
        if offset >= buffered {
            return None;
        }
        state.infos[(state.head + offset) % self.capacity]
    }

    /// Release the slot at `index` if it is still the oldest of `generation`
    fn take(&self, index: usize, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.head != index || state.head == state.tail
            {
                return;
            }
            state.infos[index] = None;
            state.head = (index + 1) % self.capacity;
        }
        self.slot_freed.notify_waiters();
    }

    /// Drop every buffered frame
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.head = 0;
            state.tail = 0;
            state.generation += 1;
            state.infos.iter_mut().for_each(|info| *info = None);
        }
        self.slot_freed.notify_waiters();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }
}

/// Handle to the oldest buffered frame
///
/// Dropping the handle removes the frame from the ring and wakes a waiting
/// writer.
pub struct BufferedFrame {
    buffer: Arc<YCbCrBuffer>,
    index: usize,
    generation: u64,
    info: VideoFrameInfo,
    consume: bool,
}

impl BufferedFrame {
    pub fn info(&self) -> VideoFrameInfo {
        self.info
    }

    pub fn timestamp(&self) -> f64 {
        self.info.timestamp
    }

    /// Copy the staged planes into `textures`
    ///
    /// Returns `false` without touching the textures when the ring was cleared
    /// after this frame was peeked.
    pub fn upload(&self, queue: &wgpu::Queue, textures: &YCbCrTextures) -> Result<bool> {
        if !self.buffer.is_current(self.generation) {
            return Ok(false);
        }

        let planes = self.buffer.slots[self.index].lock();
        textures.upload(queue, &planes)?;
        Ok(true)
    }

    /// Run `f` over the staged planes, `None` if the ring was cleared
    pub fn with_planes<R>(&self, f: impl FnOnce(&PlaneSet) -> R) -> Option<R> {
        if !self.buffer.is_current(self.generation) {
            return None;
        }
        let planes = self.buffer.slots[self.index].lock();
        Some(f(&planes))
    }

    /// Release the frame
    pub fn dispose(self) {}

    /// Give the handle up while leaving the frame at the head of the ring
    pub(crate) fn retain(mut self) {
        self.consume = false;
    }
}

impl Drop for BufferedFrame {
    fn drop(&mut self) {
        if self.consume {
            self.buffer.take(self.index, self.generation);
        }
    }
}

impl std::fmt::Debug for BufferedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFrame")
            .field("slot", &self.index)
            .field("info", &self.info)
            .finish()
    }
}
