//! Audio path for nitro-media
//!
//! Decoded audio frames are converted to the fixed output format by the
//! [`Resampler`] and pushed into a PCM pipe. The reading end of the pipe is
//! handed to an [`AudioSink`], which pulls bytes at the device's pace and
//! keeps the audio clock up to date.

pub mod pipe;
pub mod resampler;

#[cfg(feature = "cpal")]
mod cpal_output;

#[cfg(feature = "cpal")]
pub use cpal_output::CpalAudioSink;
pub use pipe::{pcm_pipe, PcmReader, PcmStatus, PcmWriter};
pub use resampler::{BufferRequirements, Resampler};

use crate::utils::error::Result;
use serde::{Deserialize, Serialize};

/// Output channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    /// Single channel
    Mono,

    /// Left and right
    Stereo,
}

impl ChannelLayout {
    /// Number of channels in the layout
    pub fn channels(self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// Output audio parameters
///
/// The output sample format is always interleaved signed 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParameters {
    /// Output channel layout
    pub channel_layout: ChannelLayout,

    /// Output sample rate in Hz
    pub sample_rate: u32,
}

impl Default for AudioParameters {
    fn default() -> Self {
        Self {
            channel_layout: ChannelLayout::Stereo,
            sample_rate: 44100,
        }
    }
}

impl AudioParameters {
    /// Bytes per output sample
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn channels(&self) -> usize {
        self.channel_layout.channels()
    }

    /// Bytes per sample frame (one sample for every channel)
    pub fn block_align(&self) -> usize {
        self.channels() * Self::BYTES_PER_SAMPLE
    }

    /// Bytes per second of output audio
    pub fn bytes_per_second(&self) -> usize {
        self.block_align() * self.sample_rate as usize
    }
}

/// Decoded sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 8-bit unsigned integer
    U8,

    /// 16-bit signed integer
    I16,

    /// 32-bit signed integer
    I32,

    /// 32-bit floating point
    F32,

    /// 64-bit floating point
    F64,
}

impl SampleFormat {
    /// Size of one sample in bytes
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Audio output device consuming the PCM pipe
///
/// The sink owns the reading end of the pipe once started and pulls bytes
/// from it at its own pace; reading is what advances the audio clock.
pub trait AudioSink: Send {
    /// Begin playback from the given reader
    fn start(&mut self, reader: PcmReader) -> Result<()>;

    /// Suspend pulling bytes
    fn pause(&mut self) -> Result<()>;

    /// Continue pulling bytes
    fn resume(&mut self) -> Result<()>;

    /// Stop playback and release the device
    fn stop(&mut self) -> Result<()>;

    /// Whether the sink is currently consuming audio
    fn is_playing(&self) -> bool;
}
