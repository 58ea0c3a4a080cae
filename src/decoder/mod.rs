//! Demuxer/decoder boundary for nitro-media
//!
//! The playback engine never talks to a codec library directly. Containers
//! are read through a [`Demuxer`], packets are decoded by a [`Decoder`]
//! created from a [`DecoderRegistry`], and everything that crosses the
//! boundary is an owned value ([`Packet`], [`AudioFrame`], [`VideoFrame`]).

pub mod queue;

#[cfg(feature = "ffmpeg")]
mod ffmpeg_decoder;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_decoder::{register_ffmpeg_decoders, FfmpegDecoder, FfmpegDemuxer};
pub use queue::{bounded, QueueItem, QueueReceiver, QueueSender, QueueSlot};

use crate::audio::resampler::SourceFormat;
use crate::audio::SampleFormat;
use crate::utils::error::{MediaError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kind of elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Codec parameters of a stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamParams {
    /// Decoded audio format
    Audio {
        sample_rate: u32,
        channels: usize,
        format: SampleFormat,
        planar: bool,
    },

    /// Picture geometry and nominal rate
    Video {
        width: u32,
        height: u32,
        frame_rate: f64,
    },
}

/// Backend-specific codec parameters carried alongside a stream
///
/// Decoder factories downcast this to whatever their backend needs to open
/// the codec.
#[derive(Clone)]
pub struct CodecExtra(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for CodecExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodecExtra(..)")
    }
}

/// Description of one demuxed stream
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Index of the stream inside the container
    pub index: usize,

    /// Audio or video
    pub kind: MediaKind,

    /// Codec name used to look up a decoder factory
    pub codec: String,

    /// Stream duration in seconds, 0 when unknown
    pub duration: f64,

    /// Codec parameters
    pub params: StreamParams,

    /// Backend-specific parameters
    pub extra: Option<CodecExtra>,
}

impl StreamInfo {
    /// Picture size, for video streams
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.params {
            StreamParams::Video { width, height, .. } => Some((width, height)),
            StreamParams::Audio { .. } => None,
        }
    }
}

/// Compressed data for one stream
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,

    /// Presentation time in seconds
    pub pts: f64,

    /// Duration in seconds, 0 when unknown
    pub duration: f64,

    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Decoded audio samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Presentation time of the first sample in seconds
    pub pts: f64,
    pub sample_rate: u32,
    pub channels: usize,
    pub format: SampleFormat,

    /// One plane per channel when set, otherwise a single interleaved plane
    pub planar: bool,

    /// Sample frames per channel
    pub samples: usize,
    pub planes: Vec<Vec<u8>>,
}

impl AudioFrame {
    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.samples as f64 / self.sample_rate as f64
        }
    }

    /// Presentation time just past the last sample
    pub fn end_pts(&self) -> f64 {
        self.pts + self.duration()
    }

    pub fn source_format(&self) -> SourceFormat {
        SourceFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            format: self.format,
            planar: self.planar,
        }
    }
}

/// One plane of a planar picture
#[derive(Debug, Clone, Default)]
pub struct Plane {
    pub data: Vec<u8>,

    /// Bytes between the starts of two rows
    pub stride: usize,
}

/// Decoded planar YCbCr 4:2:0 picture
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation time in seconds
    pub pts: f64,

    /// Display duration in seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,

    /// Luma, blue-difference and red-difference planes
    pub planes: [Plane; 3],
}

impl VideoFrame {
    /// Create a frame with tightly packed planes filled with constant values
    pub fn filled(pts: f64, duration: f64, width: u32, height: u32, values: [u8; 3]) -> Self {
        let planes = [0, 1, 2].map(|index| {
            let (w, h) = plane_dimensions(width, height, index);
            Plane {
                data: vec![values[index]; w * h],
                stride: w,
            }
        });

        Self {
            pts,
            duration,
            width,
            height,
            planes,
        }
    }

    /// Visible size of plane `index` in bytes per row and rows
    pub fn plane_size(&self, index: usize) -> (usize, usize) {
        plane_dimensions(self.width, self.height, index)
    }
}

/// Visible size of plane `index` of a 4:2:0 picture
pub fn plane_dimensions(width: u32, height: u32, index: usize) -> (usize, usize) {
    let (w, h) = (width as usize, height as usize);
    if index == 0 {
        (w, h)
    } else {
        ((w + 1) / 2, (h + 1) / 2)
    }
}

/// Decoded unit of either kind
#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    pub fn pts(&self) -> f64 {
        match self {
            Frame::Audio(frame) => frame.pts,
            Frame::Video(frame) => frame.pts,
        }
    }

    pub fn duration(&self) -> f64 {
        match self {
            Frame::Audio(frame) => frame.duration(),
            Frame::Video(frame) => frame.duration,
        }
    }
}

/// Outcome of asking a decoder for output
#[derive(Debug)]
pub enum DecodeStatus {
    /// A decoded frame
    Frame(Frame),

    /// The decoder needs another packet
    NeedsInput,

    /// The decoder has been drained after `send_eof`
    EndOfStream,
}

/// Container reader
pub trait Demuxer: Send {
    /// Streams the engine may play
    fn streams(&self) -> &[StreamInfo];

    /// Container duration in seconds, 0 when unknown
    fn duration(&self) -> f64;

    /// Read the next packet, `None` at end of stream
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Reposition so the next packets start at or before `target` seconds
    fn seek(&mut self, target: f64) -> Result<()>;
}

/// Codec instance for one stream
pub trait Decoder: Send {
    /// Feed one compressed packet
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Signal that no more packets follow
    fn send_eof(&mut self) -> Result<()>;

    /// Pull the next decoded frame
    fn receive_frame(&mut self) -> Result<DecodeStatus>;

    /// Drop all internal state, used after a seek
    fn flush(&mut self);
}

/// Creates decoders for a codec
pub trait DecoderFactory: Send + Sync {
    fn create(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>>;
}

impl<F> DecoderFactory for F
where
    F: Fn(&StreamInfo) -> Result<Box<dyn Decoder>> + Send + Sync,
{
    fn create(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
        self(stream)
    }
}

/// Codec name to decoder factory lookup
///
/// Built explicitly by the host and shared by every stream opened through the
/// same player.
#[derive(Default, Clone)]
pub struct DecoderRegistry {
    factories: HashMap<String, Arc<dyn DecoderFactory>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `codec`, replacing any previous one
    pub fn register<F>(&mut self, codec: impl Into<String>, factory: F)
    where
        F: DecoderFactory + 'static,
    {
        self.factories.insert(codec.into(), Arc::new(factory));
    }

    pub fn contains(&self, codec: &str) -> bool {
        self.factories.contains_key(codec)
    }

    /// Registered codec names
    pub fn codecs(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Open a decoder for `stream`
    pub fn create(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
        let factory = self.factories.get(&stream.codec).ok_or_else(|| {
            MediaError::UnsupportedFormat(format!("No decoder for codec '{}'", stream.codec))
        })?;
        factory.create(stream)
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
