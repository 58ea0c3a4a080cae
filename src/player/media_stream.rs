//! An opened medium and its presentation logic
//!
//! [`MediaStream`] owns the pipeline of one opened medium. The host calls
//! [`MediaStream::get_next_frame`] once per render tick; it answers with the
//! frame due for display according to the master clock, or `None` when the
//! previous frame should stay on screen.

use super::state::{
    EventSender, LoopRegion, MediaEvent, PlaybackOptions, PlaybackStats, SeekRequest,
};
use super::stream_context::StreamContext;
use super::tasks::{self, SharedParts, SharedState};
use crate::audio::{pcm_pipe, AudioSink, PcmReader, PcmWriter};
use crate::decoder::Demuxer;
use crate::sync::{compute_target_delay, frame_duration, Clock, TimeSource};
use crate::utils::config::Config;
use crate::utils::error::{MediaError, Result};
use crate::utils::format_timestamp;
use crate::video::{BufferedFrame, VideoFrameInfo, YCbCrBuffer};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Frames whose span reaches this close to the loop end trigger the wrap
const LOOP_END_EPSILON: f64 = 1e-6;

/// Everything [`MediaStream`] needs from the player that opened it
pub(crate) struct StreamSetup {
    pub config: Config,
    pub time: Arc<dyn TimeSource>,
    pub runtime: Handle,
    pub demuxer: Box<dyn Demuxer>,
    pub duration: f64,
    pub video: Option<StreamContext>,
    pub audio: Option<StreamContext>,
    pub sink: Option<Box<dyn AudioSink>>,
}

/// Parts claimed by the tasks at start
struct Unstarted {
    demuxer: Box<dyn Demuxer>,
    writer: Option<PcmWriter>,
    reader: Option<PcmReader>,
}

/// Playback of one opened medium
pub struct MediaStream {
    shared: Arc<SharedState>,
    runtime: Handle,
    sink: Option<Box<dyn AudioSink>>,
    unstarted: Option<Unstarted>,
    tasks: Vec<JoinHandle<()>>,
    paused_tx: watch::Sender<bool>,
    events: Receiver<MediaEvent>,

    started: bool,
    paused: bool,
    closed: bool,

    /// Time the pause began, in time source seconds
    paused_at: f64,

    /// Time the last shown frame was due
    frame_timer: f64,

    last_shown: Option<VideoFrameInfo>,

    frames_displayed: u64,
    frames_dropped_late: u64,
    frames_discarded_stale: u64,
}

impl MediaStream {
    pub(crate) fn new(setup: StreamSetup) -> Self {
        let StreamSetup {
            config,
            time,
            runtime,
            demuxer,
            duration,
            video,
            audio,
            sink,
        } = setup;

        let nosync = config.sync.nosync_threshold;
        let video = video.map(Arc::new);
        let audio = audio.map(Arc::new);

        let vidclk = Clock::new(
            time.clone(),
            Some(video.as_ref().map(|ctx| ctx.serial().clone()).unwrap_or_default()),
        )
        .with_nosync_threshold(nosync);
        let extclk = Clock::new(time.clone(), None).with_nosync_threshold(nosync);

        let ring = video
            .as_ref()
            .map(|_| Arc::new(YCbCrBuffer::new(config.queues.ring_capacity)));

        let (audclk, writer, reader) = match &audio {
            Some(ctx) => {
                let clock = Arc::new(
                    Clock::new(time.clone(), Some(ctx.serial().clone()))
                        .with_nosync_threshold(nosync),
                );
                let (writer, reader) = pcm_pipe(
                    config.audio.parameters(),
                    config.audio.pipe_capacity_bytes(),
                    clock.clone(),
                );
                (Some(clock), Some(writer), Some(reader))
            }
            None => (None, None, None),
        };
        let pcm = writer.as_ref().map(PcmWriter::status);

        let (events_tx, events) = crossbeam_channel::unbounded();
        let options = PlaybackOptions::new(config.playback.looping, config.playback.loop_region);
        let (paused_tx, _) = watch::channel(false);

        let shared = Arc::new(SharedState::new(SharedParts {
            config,
            time,
            duration,
            video,
            audio,
            vidclk,
            audclk,
            extclk,
            ring,
            pcm,
            options,
            events: EventSender::new(events_tx),
        }));

        Self {
            shared,
            runtime,
            sink,
            unstarted: Some(Unstarted {
                demuxer,
                writer,
                reader,
            }),
            tasks: Vec::new(),
            paused_tx,
            events,
            started: false,
            paused: false,
            closed: false,
            paused_at: 0.0,
            frame_timer: 0.0,
            last_shown: None,
            frames_displayed: 0,
            frames_dropped_late: 0,
            frames_discarded_stale: 0,
        }
    }

    /// Spawn the pipeline tasks and start the audio sink
    ///
    /// Calling it again is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(MediaError::InvalidInput("Stream is closed".to_string()));
        }
        if self.started {
            return Ok(());
        }
        let Some(unstarted) = self.unstarted.take() else {
            return Err(MediaError::Internal("Pipeline parts already claimed".to_string()));
        };
        let Unstarted {
            demuxer,
            writer,
            reader,
        } = unstarted;

        let shared = self.shared.clone();
        let control = shared.control(self.paused_tx.subscribe());
        let runtime = self.runtime.clone();

        self.tasks.push(tasks::spawn_task(
            &runtime,
            "Demux",
            shared.clone(),
            tasks::demux_task(demuxer, shared.clone(), control.clone()),
        ));

        if let (Some(ctx), Some(ring)) = (&shared.video, &shared.ring) {
            let pipeline = ctx
                .take_pipeline()
                .ok_or_else(|| MediaError::Internal("Video pipeline already claimed".to_string()))?;
            self.tasks.push(tasks::spawn_task(
                &runtime,
                "Video decode",
                shared.clone(),
                tasks::decode_task(
                    ctx.clone(),
                    pipeline.decoder,
                    pipeline.packets,
                    pipeline.frames_tx,
                    shared.clone(),
                    control.clone(),
                ),
            ));
            self.tasks.push(tasks::spawn_task(
                &runtime,
                "Video output",
                shared.clone(),
                tasks::video_task(
                    ctx.clone(),
                    pipeline.frames_rx,
                    ring.clone(),
                    shared.clone(),
                    control.clone(),
                ),
            ));
        }

        if let (Some(ctx), Some(writer)) = (&shared.audio, writer) {
            let pipeline = ctx
                .take_pipeline()
                .ok_or_else(|| MediaError::Internal("Audio pipeline already claimed".to_string()))?;
            self.tasks.push(tasks::spawn_task(
                &runtime,
                "Audio decode",
                shared.clone(),
                tasks::decode_task(
                    ctx.clone(),
                    pipeline.decoder,
                    pipeline.packets,
                    pipeline.frames_tx,
                    shared.clone(),
                    control.clone(),
                ),
            ));
            self.tasks.push(tasks::spawn_task(
                &runtime,
                "Audio output",
                shared.clone(),
                tasks::audio_task(
                    ctx.clone(),
                    pipeline.frames_rx,
                    writer,
                    shared.clone(),
                    control,
                ),
            ));
        }

        if let (Some(sink), Some(reader)) = (self.sink.as_mut(), reader) {
            sink.start(reader)?;
        }

        self.started = true;
        info!(
            "Playback started ({} tasks, video: {}, audio: {})",
            self.tasks.len(),
            self.has_video(),
            self.has_audio()
        );
        shared.events.emit(MediaEvent::Started);
        Ok(())
    }

    /// The frame due for display now, if any
    ///
    /// Frames of abandoned generations are discarded, frames that are already
    /// too late are skipped while a newer one is buffered. The returned frame
    /// leaves the ring buffer when it is dropped.
    pub fn get_next_frame(&mut self) -> Option<BufferedFrame> {
        let shared = self.shared.clone();
        let (video, ring) = (shared.video.as_ref()?, shared.ring.as_ref()?);
        if !self.started || self.paused || self.closed || shared.seeks.is_pending() {
            return None;
        }
        let sync = &shared.config.sync;

        loop {
            let Some(info) = ring.peek_info(0) else {
                if video.is_finished() && !shared.options.is_looping() {
                    shared.mark_ended();
                }
                return None;
            };

            if !video.serial().is_current(info.serial) {
                if let Some(frame) = ring.peek() {
                    frame.dispose();
                }
                self.frames_discarded_stale += 1;
                continue;
            }

            let now = shared.time.now();
            let last_duration = match self.last_shown {
                Some(last) if last.serial == info.serial => frame_duration(
                    (last.serial, last.timestamp, last.duration),
                    (info.serial, info.timestamp),
                    sync.max_frame_duration,
                ),
                _ => {
                    self.frame_timer = now;
                    0.0
                }
            };

            let diff = shared.vidclk.get() - self.master_clock();
            let delay = compute_target_delay(last_duration, diff, sync);
            if now < self.frame_timer + delay {
                return None;
            }

            self.frame_timer += delay;
            if delay > 0.0 && now - self.frame_timer > sync.max_threshold {
                self.frame_timer = now;
            }

            shared.vidclk.set(info.timestamp, info.serial);
            shared.extclk.sync_to(&shared.vidclk);
            self.last_shown = Some(info);

            if let Some(next) = ring.peek_info(1) {
                let duration = frame_duration(
                    (info.serial, info.timestamp, info.duration),
                    (next.serial, next.timestamp),
                    sync.max_frame_duration,
                );
                if now > self.frame_timer + duration {
                    debug!("Dropping late frame at {:.3}s", info.timestamp);
                    if let Some(frame) = ring.peek() {
                        frame.dispose();
                    }
                    self.frames_dropped_late += 1;
                    continue;
                }
            }

            let frame = ring.peek()?;
            if frame.info() != info {
                // The ring was flushed and refilled since the frame was inspected
                frame.retain();
                continue;
            }

            self.frames_displayed += 1;
            self.after_present(info, last_duration);
            return Some(frame);
        }
    }

    /// End and loop-region checks for a frame being handed out
    fn after_present(&self, info: VideoFrameInfo, last_duration: f64) {
        let shared = &self.shared;
        let span = if info.duration > 0.0 {
            info.duration
        } else {
            last_duration
        };

        if !shared.options.is_looping()
            && shared.duration > 0.0
            && shared.duration - info.timestamp <= span + LOOP_END_EPSILON
        {
            shared.mark_ended();
        }

        // With audio present the audio task decides when to wrap
        if shared.audio.is_some() {
            return;
        }
        if let Some(region) = shared.options.active_region() {
            if info.timestamp + span >= region.end - LOOP_END_EPSILON
                && shared
                    .seeks
                    .request_if_idle(SeekRequest::looping(region.start))
            {
                debug!(
                    "Video reached loop end {}, wrapping to {}",
                    format_timestamp(region.end),
                    format_timestamp(region.start)
                );
            }
        }
    }

    /// Clock video is paced against: audio while it is audible, otherwise
    /// the external clock
    fn master_clock(&self) -> f64 {
        let shared = &self.shared;
        if let (Some(audclk), Some(pcm), Some(sink)) = (&shared.audclk, &shared.pcm, &self.sink) {
            if sink.is_playing() && !pcm.is_empty() {
                return audclk.get();
            }
        }
        shared.extclk.get()
    }

    /// Suspend presentation, the pipeline tasks and the sink
    pub fn pause(&mut self) -> Result<()> {
        if !self.started || self.paused || self.closed {
            return Ok(());
        }

        let shared = &self.shared;
        self.paused_at = shared.time.now();
        shared.vidclk.set_paused(true);
        shared.extclk.set_paused(true);
        if let Some(audclk) = &shared.audclk {
            audclk.set_paused(true);
        }
        self.paused_tx.send_replace(true);
        if let Some(sink) = self.sink.as_mut() {
            sink.pause()?;
        }

        self.paused = true;
        info!("Paused at {}", format_timestamp(self.position()));
        self.shared.events.emit(MediaEvent::Paused);
        Ok(())
    }

    /// Continue after [`MediaStream::pause`]
    ///
    /// The frame timer is pushed forward by the time spent paused, so the
    /// frame on screen keeps the rest of its display time.
    pub fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Ok(());
        }

        let shared = &self.shared;
        self.frame_timer += shared.time.now() - self.paused_at;
        shared.vidclk.refresh();
        shared.extclk.refresh();
        shared.vidclk.set_paused(false);
        shared.extclk.set_paused(false);
        if let Some(audclk) = &shared.audclk {
            // The sink restamps it on its next read; until then it must not jump
            audclk.refresh();
            audclk.set_paused(false);
        }

        self.paused_tx.send_replace(false);
        if let Some(sink) = self.sink.as_mut() {
            sink.resume()?;
        }

        self.paused = false;
        info!("Resumed at {}", format_timestamp(self.position()));
        self.shared.events.emit(MediaEvent::Resumed);
        Ok(())
    }

    /// Jump to `target` seconds
    ///
    /// Audio already queued for the sink is discarded and presentation holds
    /// until every stream has moved to the new position.
    pub fn seek(&mut self, target: f64) -> Result<()> {
        if !target.is_finite() {
            return Err(MediaError::InvalidInput(format!(
                "Invalid seek target {}",
                target
            )));
        }
        let duration = self.shared.duration;
        let target = if duration > 0.0 {
            target.clamp(0.0, duration)
        } else {
            target.max(0.0)
        };

        debug!("Seek requested to {}", format_timestamp(target));
        self.shared.clear_ended();
        self.shared.seeks.request(SeekRequest::user(target));
        Ok(())
    }

    pub fn set_looping(&mut self, looping: bool) {
        info!("Looping {}", if looping { "enabled" } else { "disabled" });
        self.shared.options.set_looping(looping);
        if looping {
            self.shared.clear_ended();
        }
    }

    /// Replace the loop region, `None` loops the whole medium
    pub fn set_loop_region(&mut self, region: Option<LoopRegion>) -> Result<()> {
        if let Some(region) = &region {
            region.validate()?;
            let duration = self.shared.duration;
            if duration > 0.0 && region.start >= duration {
                return Err(MediaError::InvalidInput(format!(
                    "Loop region starts at {} but the medium ends at {}",
                    format_timestamp(region.start),
                    format_timestamp(duration)
                )));
            }
            if duration > 0.0 && region.end > duration {
                warn!(
                    "Loop region end {} is past the end of the medium",
                    format_timestamp(region.end)
                );
            }
        }
        self.shared.options.set_region(region);
        Ok(())
    }

    pub fn is_looping(&self) -> bool {
        self.shared.options.is_looping()
    }

    pub fn loop_region(&self) -> Option<LoopRegion> {
        self.shared.options.region()
    }

    /// Current playback position in seconds
    pub fn position(&self) -> f64 {
        let master = self.master_clock();
        if !master.is_nan() {
            return master;
        }
        let video = self.shared.vidclk.get();
        if !video.is_nan() {
            return video;
        }
        self.last_shown.map_or(0.0, |info| info.timestamp)
    }

    /// Duration of the medium in seconds, 0 when unknown
    pub fn duration(&self) -> f64 {
        self.shared.duration
    }

    pub fn has_audio(&self) -> bool {
        self.shared.audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.shared.video.is_some()
    }

    /// Picture size of the video stream
    pub fn video_dimensions(&self) -> Option<(u32, u32)> {
        self.shared.video.as_ref()?.info().dimensions()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the last frame has been presented with looping off
    pub fn is_ended(&self) -> bool {
        self.shared.is_ended()
    }

    pub fn stats(&self) -> PlaybackStats {
        let shared = &self.shared;
        PlaybackStats {
            frames_displayed: self.frames_displayed,
            frames_dropped_late: self.frames_dropped_late,
            frames_discarded_stale: self.frames_discarded_stale,
            items_discarded_stale: shared
                .counters
                .stale_items
                .load(std::sync::atomic::Ordering::Relaxed),
            buffered_video_frames: shared.ring.as_ref().map_or(0, |ring| ring.len()),
            queued_audio_bytes: shared.pcm.as_ref().map_or(0, |pcm| pcm.queued_bytes()),
            position: self.position(),
        }
    }

    /// Receiver of playback notifications
    pub fn events(&self) -> Receiver<MediaEvent> {
        self.events.clone()
    }

    /// Stop every task, release the sink and report the first task failure
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.cancel();
        if let Some(ring) = &self.shared.ring {
            ring.clear();
        }

        let mut result = Ok(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Pipeline task ended abnormally: {}", e);
                if result.is_ok() {
                    result = Err(MediaError::Internal(format!("Pipeline task panicked: {}", e)));
                }
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.stop() {
                warn!("Failed to stop audio sink: {}", e);
            }
        }
        self.unstarted = None;
        info!("Stream closed");

        match self.shared.take_failure() {
            Some(failure) => Err(failure),
            None => result,
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.shared.cancel();
        if let Some(ring) = &self.shared.ring {
            ring.clear();
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.stop() {
                warn!("Failed to stop audio sink: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("video", &self.shared.video)
            .field("audio", &self.shared.audio)
            .field("started", &self.started)
            .field("paused", &self.paused)
            .field("closed", &self.closed)
            .finish()
    }
}
