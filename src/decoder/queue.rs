//! Bounded packet and frame queues
//!
//! Every item carries the serial of the stream generation it was produced
//! for. Flush and end-of-stream markers travel in-band and carry the reserved
//! serials, so they can never be mistaken for current data.

use crate::sync::{SerialCounter, END_OF_STREAM_SERIAL, FLUSH_SERIAL};
use crate::utils::error::{MediaError, Result};
use tokio::sync::mpsc;

/// Item travelling through a packet or frame queue
#[derive(Debug)]
pub enum QueueItem<T> {
    /// Data produced for stream generation `serial`
    Data { serial: i32, item: T },

    /// Everything before this marker belongs to an abandoned generation
    Flush,

    /// No more data follows for the current generation
    EndOfStream,
}

impl<T> QueueItem<T> {
    pub fn data(serial: i32, item: T) -> Self {
        QueueItem::Data { serial, item }
    }

    /// Serial of the item, reserved values for markers
    pub fn serial(&self) -> i32 {
        match self {
            QueueItem::Data { serial, .. } => *serial,
            QueueItem::Flush => FLUSH_SERIAL,
            QueueItem::EndOfStream => END_OF_STREAM_SERIAL,
        }
    }

    /// Whether the item is data of the stream's current generation
    pub fn is_current(&self, serial: &SerialCounter) -> bool {
        serial.is_current(self.serial())
    }
}

/// Producing end of a bounded queue
pub struct QueueSender<T> {
    inner: mpsc::Sender<QueueItem<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue `item`, waiting while the queue is full
    pub async fn send(&self, item: QueueItem<T>) -> Result<()> {
        self.inner
            .send(item)
            .await
            .map_err(|_| MediaError::Internal("Queue consumer has stopped".to_string()))
    }

    /// Wait for free space without committing an item yet.
    ///
    /// Dropping the returned future before it resolves loses nothing, so the
    /// wait can race other events in `tokio::select!`.
    pub async fn reserve(&self) -> Result<QueueSlot<'_, T>> {
        self.inner
            .reserve()
            .await
            .map(|permit| QueueSlot { permit })
            .map_err(|_| MediaError::Internal("Queue consumer has stopped".to_string()))
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.inner.max_capacity() - self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Space reserved in a queue by [`QueueSender::reserve`]
pub struct QueueSlot<'a, T> {
    permit: mpsc::Permit<'a, QueueItem<T>>,
}

impl<T> QueueSlot<'_, T> {
    /// Enqueue `item` into the reserved space
    pub fn send(self, item: QueueItem<T>) {
        self.permit.send(item);
    }
}

/// Consuming end of a bounded queue
pub struct QueueReceiver<T> {
    inner: mpsc::Receiver<QueueItem<T>>,
}

impl<T> QueueReceiver<T> {
    /// Next item, `None` once every sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<QueueItem<T>> {
        self.inner.recv().await
    }

    /// Discard everything queued right now, returning the number of items dropped
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.inner.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Create a FIFO queue holding at most `capacity` items
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { inner: tx }, QueueReceiver { inner: rx })
}
