//! Integration test utilities for nitro-media
//!
//! This crate provides what the playback tests drive the engine with:
//! - A synthetic test pattern demuxer and matching decoders
//! - An audio sink the test pulls bytes from by hand
//! - A harness stepping a manual clock one display tick at a time

use anyhow::Result;
use nitro_media::audio::{AudioSink, PcmReader, SampleFormat};
use nitro_media::decoder::{
    AudioFrame, DecodeStatus, Decoder, DecoderRegistry, Demuxer, Frame, MediaKind, Packet,
    StreamInfo, StreamParams, VideoFrame,
};
use nitro_media::sync::ManualTimeSource;
use nitro_media::{Config, MediaError, MediaEvent, MediaPlayer, MediaStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const VIDEO_CODEC: &str = "test-pattern-video";
pub const AUDIO_CODEC: &str = "test-pattern-audio";

/// Codec whose decoder fails hard on the first packet
pub const BROKEN_CODEC: &str = "test-pattern-broken";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Description of a synthetic medium
///
/// Video frame `i` is a flat picture whose luma encodes `i`; audio is a
/// ramp rising from 0.05 at the start to 0.95 at the end on every channel,
/// so the position of any sample can be recovered from its value.
#[derive(Debug, Clone, Copy)]
pub struct TestPattern {
    pub duration: f64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,

    /// Frames between keyframes
    pub keyframe_interval: usize,

    pub video: bool,
    pub audio: bool,
    pub sample_rate: u32,
    pub channels: usize,

    /// Sample frames per audio packet
    pub packet_samples: usize,

    /// Every n-th video packet fails to decode
    pub corrupt_every: Option<usize>,

    /// Decode video with a decoder that fails hard
    pub broken_video: bool,
}

impl TestPattern {
    /// Audio and video test pattern of `duration` seconds
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            frame_rate: 30.0,
            width: 64,
            height: 36,
            keyframe_interval: 15,
            video: true,
            audio: true,
            sample_rate: 44100,
            channels: 2,
            packet_samples: 1024,
            corrupt_every: None,
            broken_video: false,
        }
    }

    pub fn video_only(mut self) -> Self {
        self.audio = false;
        self
    }

    pub fn audio_only(mut self) -> Self {
        self.video = false;
        self
    }

    pub fn frame_duration(&self) -> f64 {
        1.0 / self.frame_rate
    }

    pub fn video_frames(&self) -> usize {
        (self.duration * self.frame_rate).round() as usize
    }

    pub fn total_samples(&self) -> usize {
        (self.duration * self.sample_rate as f64).round() as usize
    }

    pub fn audio_packets(&self) -> usize {
        self.total_samples().div_ceil(self.packet_samples)
    }

    /// Luma value of video frame `index`
    pub fn luma(index: usize) -> u8 {
        (16 + index % 200) as u8
    }

    /// Sample value at `pts` seconds
    pub fn ramp(&self, pts: f64) -> f32 {
        (0.05 + 0.9 * pts / self.duration) as f32
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        if self.video {
            streams.push(StreamInfo {
                index: 0,
                kind: MediaKind::Video,
                codec: if self.broken_video {
                    BROKEN_CODEC
                } else {
                    VIDEO_CODEC
                }
                .to_string(),
                duration: self.duration,
                params: StreamParams::Video {
                    width: self.width,
                    height: self.height,
                    frame_rate: self.frame_rate,
                },
                extra: None,
            });
        }
        if self.audio {
            streams.push(StreamInfo {
                index: 1,
                kind: MediaKind::Audio,
                codec: AUDIO_CODEC.to_string(),
                duration: self.duration,
                params: StreamParams::Audio {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    format: SampleFormat::F32,
                    planar: false,
                },
                extra: None,
            });
        }
        streams
    }

    pub fn demuxer(&self) -> TestPatternDemuxer {
        TestPatternDemuxer {
            pattern: *self,
            streams: self.streams(),
            next_video: 0,
            next_audio: 0,
        }
    }

    /// Registry holding decoders for every test pattern codec
    pub fn registry(&self) -> DecoderRegistry {
        let mut registry = DecoderRegistry::new();
        let pattern = *self;
        registry.register(
            VIDEO_CODEC,
            move |_: &StreamInfo| -> nitro_media::Result<Box<dyn Decoder>> {
                Ok(Box::new(TestPatternDecoder::new(pattern, MediaKind::Video)))
            },
        );
        registry.register(
            AUDIO_CODEC,
            move |_: &StreamInfo| -> nitro_media::Result<Box<dyn Decoder>> {
                Ok(Box::new(TestPatternDecoder::new(pattern, MediaKind::Audio)))
            },
        );
        registry.register(
            BROKEN_CODEC,
            |_: &StreamInfo| -> nitro_media::Result<Box<dyn Decoder>> { Ok(Box::new(BrokenDecoder)) },
        );
        registry
    }
}

/// Demuxer producing the packets of a [`TestPattern`] in timestamp order
pub struct TestPatternDemuxer {
    pattern: TestPattern,
    streams: Vec<StreamInfo>,
    next_video: usize,
    next_audio: usize,
}

impl TestPatternDemuxer {
    fn video_pts(&self) -> Option<f64> {
        let p = &self.pattern;
        (p.video && self.next_video < p.video_frames())
            .then(|| self.next_video as f64 / p.frame_rate)
    }

    fn audio_pts(&self) -> Option<f64> {
        let p = &self.pattern;
        (p.audio && self.next_audio < p.audio_packets())
            .then(|| (self.next_audio * p.packet_samples) as f64 / p.sample_rate as f64)
    }

    fn video_packet(&mut self, pts: f64) -> Packet {
        let p = &self.pattern;
        let index = self.next_video;
        self.next_video += 1;
        Packet {
            stream_index: 0,
            pts,
            duration: p.frame_duration(),
            data: (index as u64).to_le_bytes().to_vec(),
            keyframe: index % p.keyframe_interval == 0,
        }
    }

    fn audio_packet(&mut self, pts: f64) -> Packet {
        let p = &self.pattern;
        let first = self.next_audio * p.packet_samples;
        let count = p.packet_samples.min(p.total_samples() - first);
        self.next_audio += 1;

        let mut data = (first as u64).to_le_bytes().to_vec();
        data.extend_from_slice(&(count as u64).to_le_bytes());
        Packet {
            stream_index: 1,
            pts,
            duration: count as f64 / p.sample_rate as f64,
            data,
            keyframe: true,
        }
    }
}

impl Demuxer for TestPatternDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> f64 {
        self.pattern.duration
    }

    fn read_packet(&mut self) -> nitro_media::Result<Option<Packet>> {
        let packet = match (self.video_pts(), self.audio_pts()) {
            (Some(video), Some(audio)) if audio < video => self.audio_packet(audio),
            (Some(video), _) => self.video_packet(video),
            (None, Some(audio)) => self.audio_packet(audio),
            (None, None) => return Ok(None),
        };
        Ok(Some(packet))
    }

    fn seek(&mut self, target: f64) -> nitro_media::Result<()> {
        let p = &self.pattern;
        let target = target.max(0.0);

        let frame = ((target * p.frame_rate + 1e-9).floor() as usize).min(p.video_frames());
        self.next_video = frame - frame % p.keyframe_interval;
        self.next_audio = ((target * p.sample_rate as f64 / p.packet_samples as f64 + 1e-9)
            .floor() as usize)
            .min(p.audio_packets());
        Ok(())
    }
}

fn read_u64(data: &[u8], offset: usize) -> nitro_media::Result<usize> {
    data.get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(|bytes| u64::from_le_bytes(bytes) as usize)
        .ok_or_else(|| MediaError::Decode {
            code: -1,
            message: "Truncated test pattern packet".to_string(),
        })
}

/// Decoder for the test pattern codecs
pub struct TestPatternDecoder {
    pattern: TestPattern,
    kind: MediaKind,
    ready: VecDeque<Frame>,
    draining: bool,
}

impl TestPatternDecoder {
    pub fn new(pattern: TestPattern, kind: MediaKind) -> Self {
        Self {
            pattern,
            kind,
            ready: VecDeque::new(),
            draining: false,
        }
    }

    fn decode_video(&self, index: usize, pts: f64) -> nitro_media::Result<Frame> {
        let p = &self.pattern;
        if matches!(p.corrupt_every, Some(n) if n > 0 && index % n == n - 1) {
            return Err(MediaError::CorruptData(format!(
                "Corrupt test pattern frame {}",
                index
            )));
        }
        Ok(Frame::Video(VideoFrame::filled(
            pts,
            p.frame_duration(),
            p.width,
            p.height,
            [TestPattern::luma(index), 128, 128],
        )))
    }

    fn decode_audio(&self, first: usize, count: usize, pts: f64) -> Frame {
        let p = &self.pattern;
        let mut data = Vec::with_capacity(count * p.channels * 4);
        for i in 0..count {
            let value = p.ramp((first + i) as f64 / p.sample_rate as f64);
            for _ in 0..p.channels {
                data.extend_from_slice(&value.to_ne_bytes());
            }
        }

        Frame::Audio(AudioFrame {
            pts,
            sample_rate: p.sample_rate,
            channels: p.channels,
            format: SampleFormat::F32,
            planar: false,
            samples: count,
            planes: vec![data],
        })
    }
}

impl Decoder for TestPatternDecoder {
    fn send_packet(&mut self, packet: &Packet) -> nitro_media::Result<()> {
        let frame = match self.kind {
            MediaKind::Video => self.decode_video(read_u64(&packet.data, 0)?, packet.pts)?,
            MediaKind::Audio => self.decode_audio(
                read_u64(&packet.data, 0)?,
                read_u64(&packet.data, 8)?,
                packet.pts,
            ),
        };
        self.ready.push_back(frame);
        Ok(())
    }

    fn send_eof(&mut self) -> nitro_media::Result<()> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> nitro_media::Result<DecodeStatus> {
        Ok(match self.ready.pop_front() {
            Some(frame) => DecodeStatus::Frame(frame),
            None if self.draining => DecodeStatus::EndOfStream,
            None => DecodeStatus::NeedsInput,
        })
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
    }
}

/// Decoder failing with a non-recoverable error
struct BrokenDecoder;

impl Decoder for BrokenDecoder {
    fn send_packet(&mut self, _packet: &Packet) -> nitro_media::Result<()> {
        Err(MediaError::Video("Decoder lost its device".to_string()))
    }

    fn send_eof(&mut self) -> nitro_media::Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> nitro_media::Result<DecodeStatus> {
        Ok(DecodeStatus::NeedsInput)
    }

    fn flush(&mut self) {}
}

#[derive(Default)]
struct ManualAudioState {
    reader: Option<PcmReader>,
    playing: bool,
}

/// Test-side handle of a [`ManualAudioSink`]
///
/// Bytes only leave the pipe when the test pulls them, which keeps the audio
/// clock in step with the manual time source.
#[derive(Clone, Default)]
pub struct ManualAudio {
    state: Arc<Mutex<ManualAudioState>>,
}

impl ManualAudio {
    pub fn sink(&self) -> Box<dyn AudioSink> {
        Box::new(ManualAudioSink {
            state: self.state.clone(),
        })
    }

    /// Read `bytes` from the pipe, `None` while the sink is not playing
    pub fn pull(&self, bytes: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if !state.playing {
            return None;
        }
        let reader = state.reader.as_mut()?;
        let mut out = vec![0u8; bytes];
        reader.read(&mut out);
        Some(out)
    }

    /// Bytes waiting in the pipe
    pub fn queued(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .reader
            .as_ref()
            .map_or(0, |reader| reader.status().queued_bytes())
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }
}

/// Audio sink driven by the test instead of a device
pub struct ManualAudioSink {
    state: Arc<Mutex<ManualAudioState>>,
}

impl AudioSink for ManualAudioSink {
    fn start(&mut self, reader: PcmReader) -> nitro_media::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reader = Some(reader);
        state.playing = true;
        Ok(())
    }

    fn pause(&mut self) -> nitro_media::Result<()> {
        self.state.lock().unwrap().playing = false;
        Ok(())
    }

    fn resume(&mut self) -> nitro_media::Result<()> {
        self.state.lock().unwrap().playing = true;
        Ok(())
    }

    fn stop(&mut self) -> nitro_media::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.playing = false;
        state.reader = None;
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }
}

/// A frame handed out by `get_next_frame`
#[derive(Debug, Clone, Copy)]
pub struct ShownFrame {
    /// Tick the frame was shown on
    pub tick: usize,

    /// Manual time at that tick
    pub at: f64,
    pub timestamp: f64,
    pub serial: i32,
    pub luma: u8,
}

/// Deterministic playback driver
///
/// Every [`Harness::step`] waits for the pipeline to catch up in real time,
/// then advances the manual clock by one display tick, feeds the sink the
/// audio due for that tick and asks for the next frame.
pub struct Harness {
    pub stream: MediaStream,
    pub time: Arc<ManualTimeSource>,
    pub audio: Option<ManualAudio>,
    pub tick: Duration,
    pub ticks: usize,
    pub shown: Vec<ShownFrame>,

    /// Everything the sink has read
    pub pcm: Vec<u8>,

    block_align: usize,
    sample_rate: u32,
    pulled_frames: usize,
    wait_limit: Duration,
}

impl Harness {
    /// Open `pattern` with a 30 Hz display tick
    pub fn open(pattern: &TestPattern, config: Config) -> Result<Self> {
        let time = Arc::new(ManualTimeSource::new());
        let player = MediaPlayer::builder()
            .with_config(config.clone())
            .with_registry(pattern.registry())
            .with_time_source(time.clone())
            .build()?;

        let audio = pattern.audio.then(ManualAudio::default);
        let sink = audio.as_ref().map(ManualAudio::sink);
        let stream = player.open(Box::new(pattern.demuxer()), sink)?;

        Ok(Self {
            stream,
            time,
            audio,
            // Just over 1/30 s so frames fall due on the tick, not a hair after
            tick: Duration::from_micros(33_334),
            ticks: 0,
            shown: Vec::new(),
            pcm: Vec::new(),
            block_align: config.audio.parameters().block_align(),
            sample_rate: config.audio.sample_rate,
            pulled_frames: 0,
            wait_limit: Duration::from_millis(250),
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.stream.start()?;
        Ok(())
    }

    /// Manual time in seconds
    pub fn now(&self) -> f64 {
        self.time.elapsed().as_secs_f64()
    }

    fn audio_due(&self) -> usize {
        let frames = (self.time.elapsed() + self.tick).as_secs_f64() * self.sample_rate as f64;
        (frames as usize).saturating_sub(self.pulled_frames)
    }

    /// Give the pipeline tasks real time to fill the buffers for the next tick
    pub async fn wait_ready(&self) {
        let deadline = Instant::now() + self.wait_limit;
        loop {
            if self.stream.is_paused() || self.stream.is_ended() {
                return;
            }

            let stats = self.stream.stats();
            let video_ready = !self.stream.has_video() || stats.buffered_video_frames >= 2;
            let audio_ready = self
                .audio
                .as_ref()
                .map_or(true, |audio| audio.queued() >= self.audio_due() * self.block_align);
            if (video_ready && audio_ready) || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Advance one display tick, returning the frame shown on it
    pub async fn step(&mut self) -> Option<ShownFrame> {
        self.wait_ready().await;

        let due = self.audio_due();
        self.time.advance(self.tick);
        self.ticks += 1;

        // Audio due while the sink is paused is never played
        self.pulled_frames += due;
        if let Some(audio) = &self.audio {
            if let Some(bytes) = audio.pull(due * self.block_align) {
                self.pcm.extend_from_slice(&bytes);
            }
        }

        let frame = self.stream.get_next_frame()?;
        let info = frame.info();
        let shown = ShownFrame {
            tick: self.ticks,
            at: self.now(),
            timestamp: info.timestamp,
            serial: info.serial,
            luma: frame.with_planes(|planes| planes.planes[0][0]).unwrap_or(0),
        };
        drop(frame);

        self.shown.push(shown);
        Some(shown)
    }

    /// Step `ticks` times, returning the frames shown meanwhile
    pub async fn run(&mut self, ticks: usize) -> Vec<ShownFrame> {
        let mut shown = Vec::new();
        for _ in 0..ticks {
            if let Some(frame) = self.step().await {
                shown.push(frame);
            }
        }
        shown
    }

    /// Step until playback ends, at most `ticks` times
    pub async fn run_to_end(&mut self, ticks: usize) -> bool {
        for _ in 0..ticks {
            if self.stream.is_ended() {
                return true;
            }
            self.step().await;
        }
        self.stream.is_ended()
    }

    /// Events emitted so far
    pub fn drain_events(&self) -> Vec<MediaEvent> {
        self.stream.events().try_iter().collect()
    }

    /// Left channel of every sample frame the sink has read
    pub fn left_samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(self.block_align)
            .map(|frame| i16::from_ne_bytes([frame[0], frame[1]]))
            .collect()
    }
}

/// Indices where the left channel ramp falls back, i.e. playback wrapped
///
/// Silence is skipped, so each index is the first audible sample of a pass.
pub fn ramp_wraps(samples: &[i16]) -> Vec<usize> {
    let mut wraps = Vec::new();
    let mut previous: Option<i16> = None;
    for (index, &sample) in samples.iter().enumerate() {
        if sample == 0 {
            continue;
        }
        if matches!(previous, Some(p) if (sample as i32) < p as i32 - 1000) {
            wraps.push(index);
        }
        previous = Some(sample);
    }
    wraps
}
