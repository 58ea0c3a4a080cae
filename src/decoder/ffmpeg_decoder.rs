//! FFmpeg-based demuxer and decoders for nitro-media
//!
//! Provides container reading and audio/video decoding through the
//! ffmpeg-next crate. Video is delivered as planar YUV 4:2:0, converting with
//! swscale when the codec produces anything else; audio is delivered in the
//! codec's native sample format and left to the engine's resampler.

use crate::audio::SampleFormat;
use crate::decoder::{
    AudioFrame, CodecExtra, DecodeStatus, Decoder, DecoderRegistry, Demuxer, Frame, MediaKind,
    Packet, Plane, StreamInfo, StreamParams, VideoFrame,
};
use crate::utils::error::{MediaError, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, software};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Microseconds per second, the container-level time base
const AV_TIME_BASE: f64 = 1_000_000.0;

/// Decoder opened while probing, waiting to be claimed by a factory
enum Opened {
    Video(codec::decoder::Video),
    Audio(codec::decoder::Audio),
}

struct PendingDecoder {
    decoder: Mutex<Option<Opened>>,
    time_base: ffmpeg::Rational,
    frame_rate: f64,
}

/// FFmpeg container reader
pub struct FfmpegDemuxer {
    /// Input format context
    input: format::context::Input,

    /// Best audio and video streams
    streams: Vec<StreamInfo>,

    /// Container duration in seconds
    duration: f64,
}

impl FfmpegDemuxer {
    /// Initialize FFmpeg library
    fn init_ffmpeg() -> Result<()> {
        ffmpeg::init()?;
        ffmpeg::log::set_level(ffmpeg::log::Level::Warning);
        Ok(())
    }

    /// Open a media file or URL
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init_ffmpeg()?;

        let path = path.as_ref();
        let input = format::input(&path)?;
        let duration = if input.duration() > 0 {
            input.duration() as f64 / AV_TIME_BASE
        } else {
            0.0
        };

        let mut streams = Vec::new();
        for kind in [media::Type::Video, media::Type::Audio] {
            if let Some(stream) = input.streams().best(kind) {
                streams.push(Self::probe_stream(&stream, duration)?);
            }
        }

        if streams.is_empty() {
            return Err(MediaError::NotFound(format!(
                "No audio or video stream in {}",
                path.display()
            )));
        }

        log::info!(
            "Opened {} ({:.3}s, {} streams)",
            path.display(),
            duration,
            streams.len()
        );

        Ok(Self {
            input,
            streams,
            duration,
        })
    }

    fn probe_stream(stream: &format::stream::Stream, container_duration: f64) -> Result<StreamInfo> {
        let time_base = stream.time_base();
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let codec_name = codec::decoder::find(context.id())
            .map(|c| c.name().to_string())
            .ok_or_else(|| MediaError::UnsupportedFormat(format!("{:?}", context.id())))?;

        let duration = if stream.duration() > 0 {
            stream.duration() as f64 * f64::from(time_base)
        } else {
            container_duration
        };

        let frame_rate = f64::from(stream.avg_frame_rate());
        let (kind, params, opened) = match context.medium() {
            media::Type::Video => {
                let decoder = context.decoder().video()?;
                let params = StreamParams::Video {
                    width: decoder.width(),
                    height: decoder.height(),
                    frame_rate,
                };
                (MediaKind::Video, params, Opened::Video(decoder))
            }
            media::Type::Audio => {
                let decoder = context.decoder().audio()?;
                let (format, planar) = map_sample_format(decoder.format())?;
                let params = StreamParams::Audio {
                    sample_rate: decoder.rate(),
                    channels: decoder.channels() as usize,
                    format,
                    planar,
                };
                (MediaKind::Audio, params, Opened::Audio(decoder))
            }
            other => {
                return Err(MediaError::UnsupportedFormat(format!(
                    "Stream type {:?}",
                    other
                )))
            }
        };

        let pending = PendingDecoder {
            decoder: Mutex::new(Some(opened)),
            time_base,
            frame_rate,
        };

        Ok(StreamInfo {
            index: stream.index(),
            kind,
            codec: codec_name,
            duration,
            params,
            extra: Some(CodecExtra(Arc::new(pending))),
        })
    }

    fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(err) => return Err(err.into()),
            }

            // Packets of streams the engine does not play are skipped
            let index = packet.stream();
            if self.stream(index).is_none() {
                continue;
            }

            let time_base = f64::from(self.input.stream(index).map_or(
                ffmpeg::Rational::new(1, AV_TIME_BASE as i32),
                |s| s.time_base(),
            ));

            return Ok(Some(Packet {
                stream_index: index,
                pts: packet.pts().map_or(f64::NAN, |pts| pts as f64 * time_base),
                duration: packet.duration() as f64 * time_base,
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                keyframe: packet.is_key(),
            }));
        }
    }

    fn seek(&mut self, target: f64) -> Result<()> {
        let timestamp = (target.max(0.0) * AV_TIME_BASE) as i64;
        self.input.seek(timestamp, ..timestamp)?;
        log::debug!("Container seek to {:.3}s", target);
        Ok(())
    }
}

/// swscale context owned by a single decoder
struct Scaler(software::scaling::Context);

// The context is only ever touched by the decode task that owns the decoder.
unsafe impl Send for Scaler {}

enum Inner {
    Video {
        decoder: codec::decoder::Video,
        scaler: Option<Scaler>,
        frame_rate: f64,
    },
    Audio {
        decoder: codec::decoder::Audio,
    },
}

/// FFmpeg decoder for one stream
pub struct FfmpegDecoder {
    inner: Inner,
    time_base: f64,

    /// Timestamp predicted for the next frame when the codec reports none
    next_pts: f64,
}

impl FfmpegDecoder {
    /// Claim the decoder opened for `stream` by [`FfmpegDemuxer`]
    pub fn from_stream(stream: &StreamInfo) -> Result<Self> {
        let pending = stream
            .extra
            .as_ref()
            .and_then(|extra| extra.0.downcast_ref::<PendingDecoder>())
            .ok_or_else(|| {
                MediaError::InvalidInput(format!(
                    "Stream {} was not opened by the FFmpeg demuxer",
                    stream.index
                ))
            })?;

        let opened = pending.decoder.lock().take().ok_or_else(|| {
            MediaError::InvalidInput(format!("Decoder for stream {} already claimed", stream.index))
        })?;

        let inner = match opened {
            Opened::Video(decoder) => Inner::Video {
                decoder,
                scaler: None,
                frame_rate: pending.frame_rate,
            },
            Opened::Audio(decoder) => Inner::Audio { decoder },
        };

        Ok(Self {
            inner,
            time_base: f64::from(pending.time_base),
            next_pts: 0.0,
        })
    }

    fn to_timestamp(&self, seconds: f64) -> Option<i64> {
        if seconds.is_finite() && self.time_base > 0.0 {
            Some((seconds / self.time_base).round() as i64)
        } else {
            None
        }
    }

    fn frame_pts(&mut self, timestamp: Option<i64>, duration: f64) -> f64 {
        let pts = timestamp.map_or(self.next_pts, |ts| ts as f64 * self.time_base);
        self.next_pts = pts + duration;
        pts
    }

    fn receive_video(&mut self) -> Result<DecodeStatus> {
        let Inner::Video {
            decoder,
            scaler,
            frame_rate,
        } = &mut self.inner
        else {
            return Err(MediaError::Internal("Not a video decoder".to_string()));
        };

        let mut frame = ffmpeg::frame::Video::empty();
        if let Some(status) = map_receive(decoder.receive_frame(&mut frame))? {
            return Ok(status);
        }

        let packet_duration = frame.packet().duration as f64 * self.time_base;
        let duration = if packet_duration > 0.0 {
            packet_duration
        } else if *frame_rate > 0.0 {
            1.0 / *frame_rate
        } else {
            0.0
        };

        let target = format::Pixel::YUV420P;
        let converted = if frame.format() != target {
            let stale = scaler.as_ref().map_or(true, |s| {
                s.0.input().width != frame.width()
                    || s.0.input().height != frame.height()
                    || s.0.input().format != frame.format()
            });
            if stale {
                *scaler = Some(Scaler(software::scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    target,
                    frame.width(),
                    frame.height(),
                    software::scaling::Flags::BILINEAR,
                )?));
            }

            let mut converted = ffmpeg::frame::Video::empty();
            if let Some(scaler) = scaler.as_mut() {
                scaler.0.run(&frame, &mut converted)?;
            }
            converted
        } else {
            frame
        };

        let (width, height) = (converted.width(), converted.height());
        let planes = [0, 1, 2].map(|index| Plane {
            data: converted.data(index).to_vec(),
            stride: converted.stride(index),
        });
        let timestamp = converted.timestamp();
        let pts = self.frame_pts(timestamp, duration);

        Ok(DecodeStatus::Frame(Frame::Video(VideoFrame {
            pts,
            duration,
            width,
            height,
            planes,
        })))
    }

    fn receive_audio(&mut self) -> Result<DecodeStatus> {
        let Inner::Audio { decoder } = &mut self.inner else {
            return Err(MediaError::Internal("Not an audio decoder".to_string()));
        };

        let mut frame = ffmpeg::frame::Audio::empty();
        if let Some(status) = map_receive(decoder.receive_frame(&mut frame))? {
            return Ok(status);
        }

        let (format, planar) = map_sample_format(frame.format())?;
        let channels = frame.channels() as usize;
        let samples = frame.samples();
        let plane_len = if planar {
            samples * format.bytes()
        } else {
            samples * channels * format.bytes()
        };

        let mut planes = Vec::with_capacity(frame.planes());
        for index in 0..frame.planes() {
            let data = frame
                .data(index)
                .get(..plane_len)
                .ok_or_else(|| MediaError::decode(-1, "Short audio plane"))?;
            planes.push(data.to_vec());
        }

        let audio = AudioFrame {
            pts: 0.0,
            sample_rate: frame.rate(),
            channels,
            format,
            planar,
            samples,
            planes,
        };
        let timestamp = frame.timestamp();
        let pts = self.frame_pts(timestamp, audio.duration());

        Ok(DecodeStatus::Frame(Frame::Audio(AudioFrame { pts, ..audio })))
    }
}

impl Decoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut raw = ffmpeg::Packet::copy(&packet.data);
        raw.set_pts(self.to_timestamp(packet.pts));
        raw.set_duration(self.to_timestamp(packet.duration).unwrap_or(0));
        if packet.keyframe {
            raw.set_flags(codec::packet::Flags::KEY);
        }

        match &mut self.inner {
            Inner::Video { decoder, .. } => decoder.send_packet(&raw)?,
            Inner::Audio { decoder } => decoder.send_packet(&raw)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        match &mut self.inner {
            Inner::Video { decoder, .. } => decoder.send_eof()?,
            Inner::Audio { decoder } => decoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus> {
        match self.inner {
            Inner::Video { .. } => self.receive_video(),
            Inner::Audio { .. } => self.receive_audio(),
        }
    }

    fn flush(&mut self) {
        match &mut self.inner {
            Inner::Video { decoder, .. } => decoder.flush(),
            Inner::Audio { decoder } => decoder.flush(),
        }
    }
}

/// Register the FFmpeg decoder for every codec used by `streams`
///
/// Codecs that already have a factory keep it.
pub fn register_ffmpeg_decoders(registry: &mut DecoderRegistry, streams: &[StreamInfo]) {
    for stream in streams {
        if !registry.contains(&stream.codec) {
            registry.register(
                stream.codec.clone(),
                |stream: &StreamInfo| -> Result<Box<dyn Decoder>> {
                    Ok(Box::new(FfmpegDecoder::from_stream(stream)?))
                },
            );
        }
    }
}

/// Split an FFmpeg receive result into a frame, a control status or an error
fn map_receive(
    result: std::result::Result<(), ffmpeg::Error>,
) -> Result<Option<DecodeStatus>> {
    match result {
        Ok(()) => Ok(None),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
            Ok(Some(DecodeStatus::NeedsInput))
        }
        Err(ffmpeg::Error::Eof) => Ok(Some(DecodeStatus::EndOfStream)),
        Err(err) => Err(err.into()),
    }
}

fn map_sample_format(format: format::Sample) -> Result<(SampleFormat, bool)> {
    use format::sample::Type;

    let (sample, kind) = match format {
        format::Sample::U8(kind) => (SampleFormat::U8, kind),
        format::Sample::I16(kind) => (SampleFormat::I16, kind),
        format::Sample::I32(kind) => (SampleFormat::I32, kind),
        format::Sample::F32(kind) => (SampleFormat::F32, kind),
        format::Sample::F64(kind) => (SampleFormat::F64, kind),
        other => {
            return Err(MediaError::UnsupportedFormat(format!(
                "Sample format {:?}",
                other
            )))
        }
    };

    Ok((sample, kind == Type::Planar))
}
