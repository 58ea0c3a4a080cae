//! Entry point for opening media
//!
//! A [`MediaPlayer`] bundles what every opened stream shares: the decoder
//! registry, the configuration, the time source and the tokio runtime the
//! pipeline tasks run on.

use super::media_stream::{MediaStream, StreamSetup};
use super::stream_context::StreamContext;
use crate::audio::AudioSink;
use crate::decoder::{Demuxer, DecoderRegistry, MediaKind, StreamInfo};
use crate::sync::{SystemTimeSource, TimeSource};
use crate::utils::config::Config;
use crate::utils::error::{MediaError, Result};
use crate::utils::format_timestamp;
use log::{info, warn};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Media player builder for customized configuration
pub struct MediaPlayerBuilder {
    config: Config,
    registry: DecoderRegistry,
    time: Option<Arc<dyn TimeSource>>,
    runtime: Option<Handle>,
}

impl MediaPlayerBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            registry: DecoderRegistry::new(),
            time: None,
            runtime: None,
        }
    }

    /// Set engine configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the decoders streams are matched against
    pub fn with_registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Pace playback against `time` instead of the system clock
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    /// Run pipeline tasks on `runtime` instead of the current one
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the media player
    pub fn build(self) -> Result<MediaPlayer> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                MediaError::Config("No tokio runtime available for pipeline tasks".to_string())
            })?,
        };

        Ok(MediaPlayer {
            registry: Arc::new(self.registry),
            config: self.config,
            time: self
                .time
                .unwrap_or_else(|| Arc::new(SystemTimeSource::new())),
            runtime,
        })
    }
}

impl Default for MediaPlayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens media into [`MediaStream`]s
pub struct MediaPlayer {
    registry: Arc<DecoderRegistry>,
    config: Config,
    time: Arc<dyn TimeSource>,
    runtime: Handle,
}

impl MediaPlayer {
    pub fn builder() -> MediaPlayerBuilder {
        MediaPlayerBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    /// Open the media behind `demuxer`
    ///
    /// The first video stream and, when a `sink` is given, the first audio
    /// stream are selected. Without a sink the audio stream is ignored and
    /// video is paced against the external clock.
    pub fn open(
        &self,
        demuxer: Box<dyn Demuxer>,
        sink: Option<Box<dyn AudioSink>>,
    ) -> Result<MediaStream> {
        self.open_with(&self.registry, demuxer, sink)
    }

    /// Open a media file through FFmpeg
    ///
    /// Codecs found in the file are added to a copy of the registry unless
    /// a factory for them is already registered.
    #[cfg(feature = "ffmpeg")]
    pub fn open_file<P: AsRef<std::path::Path>>(
        &self,
        path: P,
        sink: Option<Box<dyn AudioSink>>,
    ) -> Result<MediaStream> {
        let demuxer = crate::decoder::FfmpegDemuxer::open(path)?;
        let mut registry = (*self.registry).clone();
        crate::decoder::register_ffmpeg_decoders(&mut registry, demuxer.streams());
        self.open_with(&registry, Box::new(demuxer), sink)
    }

    fn open_with(
        &self,
        registry: &DecoderRegistry,
        demuxer: Box<dyn Demuxer>,
        sink: Option<Box<dyn AudioSink>>,
    ) -> Result<MediaStream> {
        let streams = demuxer.streams();
        let video_info = first_of(streams, MediaKind::Video);
        let audio_info = match &sink {
            Some(_) => first_of(streams, MediaKind::Audio),
            None => {
                if first_of(streams, MediaKind::Audio).is_some() {
                    warn!("No audio sink given, ignoring the audio stream");
                }
                None
            }
        };

        if video_info.is_none() && audio_info.is_none() {
            return Err(MediaError::NotFound(
                "Media has no playable audio or video stream".to_string(),
            ));
        }

        let queues = &self.config.queues;
        let video = video_info
            .map(|info| -> Result<StreamContext> {
                let decoder = registry.create(&info)?;
                Ok(StreamContext::new(info, decoder, queues.video_packets, queues.video_frames))
            })
            .transpose()?;
        let audio = audio_info
            .map(|info| -> Result<StreamContext> {
                let decoder = registry.create(&info)?;
                Ok(StreamContext::new(info, decoder, queues.audio_packets, queues.audio_frames))
            })
            .transpose()?;

        let duration = match demuxer.duration() {
            d if d > 0.0 => d,
            _ => video
                .iter()
                .chain(audio.iter())
                .map(|ctx| ctx.info().duration)
                .fold(0.0, f64::max),
        };

        info!(
            "Opened media: duration {}, video {}, audio {}",
            format_timestamp(duration),
            video
                .as_ref()
                .map_or_else(|| "none".to_string(), |ctx| describe(ctx.info())),
            audio
                .as_ref()
                .map_or_else(|| "none".to_string(), |ctx| describe(ctx.info())),
        );

        Ok(MediaStream::new(StreamSetup {
            config: self.config.clone(),
            time: self.time.clone(),
            runtime: self.runtime.clone(),
            demuxer,
            duration,
            video,
            audio,
            sink,
        }))
    }
}

fn first_of(streams: &[StreamInfo], kind: MediaKind) -> Option<StreamInfo> {
    streams.iter().find(|stream| stream.kind == kind).cloned()
}

fn describe(info: &StreamInfo) -> String {
    match info.dimensions() {
        Some((width, height)) => format!("#{} {} {}x{}", info.index, info.codec, width, height),
        None => format!("#{} {}", info.index, info.codec),
    }
}
