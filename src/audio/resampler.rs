//! Sample rate, channel layout and sample format conversion
//!
//! Decoded frames arrive in whatever format the codec produces. The
//! [`Resampler`] remixes them to the output layout, resamples them to the
//! output rate with rubato and packs them as interleaved signed 16-bit PCM.

use super::{AudioParameters, SampleFormat};
use crate::decoder::AudioFrame;
use crate::utils::error::{MediaError, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

/// Input frames fed to the rate converter per call
const CHUNK_FRAMES: usize = 1024;

/// Native format of a decoded audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub format: SampleFormat,
    pub planar: bool,
}

/// Output space needed to convert one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRequirements {
    /// Upper bound of output sample frames
    pub samples: usize,

    /// Upper bound of output bytes
    pub bytes: usize,
}

/// Audio format converter
pub struct Resampler {
    source: SourceFormat,
    output: AudioParameters,
    sampler: Option<FastFixedIn<f32>>,

    /// Remixed input not yet consumed by the rate converter, per output channel
    pending: Vec<Vec<f32>>,

    /// Scratch output of one converter call, per output channel
    chunk_out: Vec<Vec<f32>>,

    /// Interleaved output of the current conversion
    interleaved: Vec<i16>,
}

impl Resampler {
    /// Create a converter from `source` to `output`
    pub fn new(source: SourceFormat, output: AudioParameters) -> Result<Self> {
        if source.channels == 0 || source.sample_rate == 0 {
            return Err(MediaError::UnsupportedFormat(format!(
                "{} channels at {} Hz",
                source.channels, source.sample_rate
            )));
        }

        let channels = output.channels();
        let sampler = if source.sample_rate != output.sample_rate {
            Some(FastFixedIn::new(
                output.sample_rate as f64 / source.sample_rate as f64,
                2.0,
                PolynomialDegree::Cubic,
                CHUNK_FRAMES,
                channels,
            )?)
        } else {
            None
        };

        let chunk_out = match &sampler {
            Some(sampler) => vec![vec![0.0; sampler.output_frames_max()]; channels],
            None => Vec::new(),
        };

        log::debug!(
            "Resampler {:?} -> {} Hz {:?}",
            source,
            output.sample_rate,
            output.channel_layout
        );

        Ok(Self {
            source,
            output,
            sampler,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); channels],
            chunk_out,
            interleaved: Vec::new(),
        })
    }

    /// Native format this converter accepts
    pub fn source(&self) -> SourceFormat {
        self.source
    }

    pub fn output(&self) -> AudioParameters {
        self.output
    }

    /// Output space needed to convert `frame`, including input buffered by
    /// previous calls
    pub fn buffer_requirements(&self, frame: &AudioFrame) -> BufferRequirements {
        let samples = match &self.sampler {
            None => frame.samples,
            Some(sampler) => {
                let chunks = (self.pending_frames() + frame.samples) / CHUNK_FRAMES;
                chunks * sampler.output_frames_max()
            }
        };

        BufferRequirements {
            samples,
            bytes: samples * self.output.block_align(),
        }
    }

    /// Convert `frame` into `destination`, returning the bytes written
    ///
    /// The result may be smaller than `requirements.bytes`; only the
    /// returned count is valid output.
    pub fn convert(
        &mut self,
        frame: &AudioFrame,
        requirements: BufferRequirements,
        destination: &mut [u8],
    ) -> Result<usize> {
        if frame.source_format() != self.source {
            return Err(MediaError::Audio(format!(
                "Frame format {:?} does not match resampler input {:?}",
                frame.source_format(),
                self.source
            )));
        }
        if destination.len() < requirements.bytes {
            return Err(MediaError::InvalidInput(format!(
                "Destination holds {} bytes, {} required",
                destination.len(),
                requirements.bytes
            )));
        }

        self.remix(frame)?;
        self.interleaved.clear();

        match &mut self.sampler {
            None => {
                let frames = self.pending[0].len();
                interleave(&self.pending, frames, &mut self.interleaved);
                for channel in &mut self.pending {
                    channel.clear();
                }
            }
            Some(sampler) => {
                let mut consumed = 0;
                while self.pending[0].len() - consumed >= sampler.input_frames_next() {
                    let needed = sampler.input_frames_next();
                    let input: Vec<&[f32]> = self
                        .pending
                        .iter()
                        .map(|c| &c[consumed..consumed + needed])
                        .collect();
                    let (read, written) =
                        sampler.process_into_buffer(&input[..], &mut self.chunk_out[..], None)?;
                    interleave(&self.chunk_out, written, &mut self.interleaved);
                    consumed += read;
                }
                for channel in &mut self.pending {
                    channel.drain(..consumed);
                }
            }
        }

        let bytes: &[u8] = bytemuck::cast_slice(&self.interleaved);
        let len = bytes.len().min(requirements.bytes);
        destination[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }

    /// Bytes occupied by `duration` seconds of output audio
    pub fn buffer_size(&self, duration: f64) -> usize {
        if duration.is_nan() || duration <= 0.0 {
            return 0;
        }
        let samples = (duration * self.output.sample_rate as f64).round() as usize;
        samples * self.output.block_align()
    }

    /// Seconds between the end of the input fed so far and the end of the
    /// output produced from it
    ///
    /// Counts input held back for the next chunk plus the converter's own
    /// filter delay.
    pub fn latency(&self) -> f64 {
        let held = self.pending_frames() as f64 / self.source.sample_rate as f64;
        let filter = self.sampler.as_ref().map_or(0.0, |sampler| {
            sampler.output_delay() as f64 / self.output.sample_rate as f64
        });
        held + filter
    }

    /// Drop buffered input and converter history, used after a flush
    pub fn reset(&mut self) {
        for channel in &mut self.pending {
            channel.clear();
        }
        if let Some(sampler) = &mut self.sampler {
            sampler.reset();
        }
    }

    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }

    /// Decode `frame` to float and append it to `pending` in the output layout
    fn remix(&mut self, frame: &AudioFrame) -> Result<()> {
        let in_channels = self.source.channels;
        let out_channels = self.output.channels();

        for out in 0..out_channels {
            self.pending[out].reserve(frame.samples);
            for i in 0..frame.samples {
                let value = match (out_channels, in_channels) {
                    (1, 1) | (2, 1) => read_sample(frame, 0, i)?,
                    (1, _) => (read_sample(frame, 0, i)? + read_sample(frame, 1, i)?) * 0.5,
                    _ => read_sample(frame, out, i)?,
                };
                self.pending[out].push(value);
            }
        }

        Ok(())
    }
}

fn read_sample(frame: &AudioFrame, channel: usize, index: usize) -> Result<f32> {
    let size = frame.format.bytes();
    let (plane, offset) = if frame.planar {
        (frame.planes.get(channel), index * size)
    } else {
        (frame.planes.first(), (index * frame.channels + channel) * size)
    };

    let bytes = plane
        .and_then(|p| p.get(offset..offset + size))
        .ok_or_else(|| MediaError::Audio("Truncated audio frame".to_string()))?;

    let value = match frame.format {
        SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleFormat::I16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleFormat::I32 => {
            i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleFormat::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            f64::from_ne_bytes(raw) as f32
        }
    };

    Ok(value)
}

fn interleave(channels: &[Vec<f32>], frames: usize, out: &mut Vec<i16>) {
    out.reserve(frames * channels.len());
    for i in 0..frames {
        for channel in channels {
            out.push((channel[i].clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
        }
    }
}
