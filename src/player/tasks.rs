//! Pipeline tasks for nitro-media
//!
//! One demux task feeds a decode task per stream, which feeds the audio
//! output task (resample into the PCM pipe) and the video output task
//! (stage into the ring buffer). Every task waits at the pause gate before
//! each unit of work and stops when the stream is cancelled.

use super::state::{
    EventSender, MediaEvent, PlaybackOptions, SeekController, SeekRequest, TaskCounters,
};
use super::stream_context::StreamContext;
use crate::audio::{PcmStatus, PcmWriter, Resampler};
use crate::decoder::{
    DecodeStatus, Decoder, Demuxer, Frame, Packet, QueueItem, QueueReceiver, QueueSender,
    QueueSlot,
};
use crate::sync::{Clock, TimeSource};
use crate::utils::config::Config;
use crate::utils::error::{MediaError, Result};
use crate::utils::format_timestamp;
use crate::video::YCbCrBuffer;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// State shared by the presentation side and every pipeline task
pub(crate) struct SharedState {
    pub config: Config,
    pub time: Arc<dyn TimeSource>,

    /// Media duration in seconds, 0 when unknown
    pub duration: f64,

    pub video: Option<Arc<StreamContext>>,
    pub audio: Option<Arc<StreamContext>>,

    pub vidclk: Clock,
    pub audclk: Option<Arc<Clock>>,
    pub extclk: Clock,

    pub ring: Option<Arc<YCbCrBuffer>>,
    pub pcm: Option<PcmStatus>,

    pub seeks: SeekController,
    pub options: PlaybackOptions,
    pub counters: TaskCounters,
    pub events: EventSender,

    ended: AtomicBool,
    failure: Mutex<Option<MediaError>>,
    cancel: watch::Sender<bool>,
}

/// Fields of [`SharedState`] known before the tasks exist
pub(crate) struct SharedParts {
    pub config: Config,
    pub time: Arc<dyn TimeSource>,
    pub duration: f64,
    pub video: Option<Arc<StreamContext>>,
    pub audio: Option<Arc<StreamContext>>,
    pub vidclk: Clock,
    pub audclk: Option<Arc<Clock>>,
    pub extclk: Clock,
    pub ring: Option<Arc<YCbCrBuffer>>,
    pub pcm: Option<PcmStatus>,
    pub options: PlaybackOptions,
    pub events: EventSender,
}

impl SharedState {
    pub fn new(parts: SharedParts) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            config: parts.config,
            time: parts.time,
            duration: parts.duration,
            video: parts.video,
            audio: parts.audio,
            vidclk: parts.vidclk,
            audclk: parts.audclk,
            extclk: parts.extclk,
            ring: parts.ring,
            pcm: parts.pcm,
            seeks: SeekController::default(),
            options: parts.options,
            counters: TaskCounters::default(),
            events: parts.events,
            ended: AtomicBool::new(false),
            failure: Mutex::new(None),
            cancel,
        }
    }

    /// Selected streams, video first
    pub fn streams(&self) -> impl Iterator<Item = &Arc<StreamContext>> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Set the ended flag, announcing it the first time
    pub fn mark_ended(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            info!("Playback reached the end");
            self.events.emit(MediaEvent::Ended);
        }
    }

    pub fn clear_ended(&self) {
        self.ended.store(false, Ordering::Release);
    }

    /// Whether every stream's current generation has been decoded and consumed
    pub fn outputs_drained(&self) -> bool {
        let video = self.video.as_ref().map_or(true, |ctx| {
            ctx.is_finished() && self.ring.as_ref().map_or(true, |ring| ring.is_empty())
        });
        let audio = self.audio.as_ref().map_or(true, |ctx| {
            ctx.is_finished() && self.pcm.as_ref().map_or(true, |pcm| pcm.is_empty())
        });
        video && audio
    }

    /// Record a task failure and stop the pipeline
    pub fn fail(&self, error: MediaError) {
        self.events.emit(MediaEvent::Failed(error.to_string()));
        self.failure.lock().get_or_insert(error);
        self.cancel();
    }

    /// First recorded task failure
    pub fn take_failure(&self) -> Option<MediaError> {
        self.failure.lock().take()
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn control(&self, paused: watch::Receiver<bool>) -> TaskControl {
        TaskControl {
            paused,
            cancel: self.cancel.subscribe(),
        }
    }
}

/// Pause gate and cancellation signal handed to each task
#[derive(Clone)]
pub(crate) struct TaskControl {
    paused: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
}

impl TaskControl {
    /// Wait while paused; `false` once the pipeline is cancelled
    pub async fn checkpoint(&mut self) -> bool {
        loop {
            if *self.cancel.borrow() {
                return false;
            }
            if !*self.paused.borrow_and_update() {
                return true;
            }

            let mut cancel = self.cancel.clone();
            tokio::select! {
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = cancel.wait_for(|cancelled| *cancelled) => return false,
            }
        }
    }

    /// Resolve once the pipeline is cancelled
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        // An error means the stream is gone, which also counts as cancelled
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `future` unless the pipeline is cancelled first
    pub async fn guard<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = future => Some(output),
        }
    }
}

/// Spawn a pipeline task, recording its failure
pub(crate) fn spawn_task<F>(
    runtime: &Handle,
    name: &'static str,
    shared: Arc<SharedState>,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    runtime.spawn(async move {
        debug!("{} task started", name);
        match task.await {
            Ok(()) => debug!("{} task stopped", name),
            Err(e) => {
                error!("{} task failed: {}", name, e);
                shared.fail(e);
            }
        }
    })
}

async fn forward<T>(queue: &QueueSender<T>, item: QueueItem<T>, control: &TaskControl) -> Result<bool> {
    match control.guard(queue.send(item)).await {
        Some(sent) => sent.map(|()| true),
        None => Ok(false),
    }
}

enum Reservation<'q> {
    Ready(QueueSlot<'q, Packet>),

    /// A seek arrived while waiting for space
    Interrupted,

    Cancelled,
}

/// Wait for packet queue space, giving way to seeks and cancellation
async fn reserve<'q>(
    queue: &'q QueueSender<Packet>,
    shared: &SharedState,
    control: &TaskControl,
) -> Result<Reservation<'q>> {
    loop {
        tokio::select! {
            biased;
            _ = control.cancelled() => return Ok(Reservation::Cancelled),
            slot = queue.reserve() => return Ok(Reservation::Ready(slot?)),
            _ = shared.seeks.wait() => {
                if shared.seeks.is_pending() {
                    return Ok(Reservation::Interrupted);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Interrupted,
    Cancelled,
}

/// Per-stream bookkeeping of the demux task
struct DemuxOutput {
    ctx: Arc<StreamContext>,

    /// A flush marker must precede anything else sent to this stream
    owes_flush: bool,

    /// An end-of-stream marker still has to be sent
    owes_eos: bool,
}

impl DemuxOutput {
    /// Send owed markers, then `item`
    async fn deliver(
        &mut self,
        item: Option<QueueItem<Packet>>,
        shared: &SharedState,
        control: &TaskControl,
    ) -> Result<Delivery> {
        let ctx = self.ctx.clone();
        let queue = ctx.packets();

        if self.owes_flush {
            match reserve(queue, shared, control).await? {
                Reservation::Ready(slot) => slot.send(QueueItem::Flush),
                Reservation::Interrupted => return Ok(Delivery::Interrupted),
                Reservation::Cancelled => return Ok(Delivery::Cancelled),
            }
            self.owes_flush = false;
        }

        if self.owes_eos {
            match reserve(queue, shared, control).await? {
                Reservation::Ready(slot) => {
                    ctx.end_of_stream_sent();
                    slot.send(QueueItem::EndOfStream);
                }
                Reservation::Interrupted => return Ok(Delivery::Interrupted),
                Reservation::Cancelled => return Ok(Delivery::Cancelled),
            }
            self.owes_eos = false;
        }

        if let Some(item) = item {
            match reserve(queue, shared, control).await? {
                Reservation::Ready(slot) => slot.send(item),
                Reservation::Interrupted => return Ok(Delivery::Interrupted),
                Reservation::Cancelled => return Ok(Delivery::Cancelled),
            }
        }

        Ok(Delivery::Sent)
    }
}

/// Reposition the input and start a new generation on every stream.
///
/// Runs while the seek is still visible as pending.
fn apply_seek(demuxer: &mut dyn Demuxer, shared: &SharedState, request: SeekRequest) -> bool {
    if let Err(e) = demuxer.seek(request.target) {
        warn!("Seek to {} failed: {}", format_timestamp(request.target), e);
        return false;
    }

    for ctx in shared.streams() {
        ctx.begin_seek(request.target);
    }
    shared.extclk.set(request.target, shared.extclk.serial());

    if request.flush {
        if let (Some(pcm), Some(audio)) = (&shared.pcm, &shared.audio) {
            pcm.raise_floor(audio.serial().current());
        }
    }
    shared.clear_ended();

    if request.flush {
        info!("Seeked to {}", format_timestamp(request.target));
        shared.events.emit(MediaEvent::SeekCompleted {
            target: request.target,
        });
    } else {
        info!("Looped to {}", format_timestamp(request.target));
        shared.events.emit(MediaEvent::Looped { to: request.target });
    }
    true
}

/// Read packets and route them to the stream queues
pub(crate) async fn demux_task(
    mut demuxer: Box<dyn Demuxer>,
    shared: Arc<SharedState>,
    mut control: TaskControl,
) -> Result<()> {
    let poll = Duration::from_millis(shared.config.sync.eof_poll_ms.max(1));
    let mut outputs: Vec<DemuxOutput> = shared
        .streams()
        .map(|ctx| DemuxOutput {
            ctx: ctx.clone(),
            owes_flush: false,
            owes_eos: false,
        })
        .collect();
    let mut at_eof = false;

    loop {
        if !control.checkpoint().await {
            return Ok(());
        }

        let serviced = shared
            .seeks
            .service(|request| apply_seek(demuxer.as_mut(), &shared, request));
        if let Some(applied) = serviced {
            if applied {
                for output in &mut outputs {
                    output.owes_flush = true;
                    output.owes_eos = false;
                }
                at_eof = false;
            }
            continue;
        }

        let mut delivery = Delivery::Sent;
        for output in &mut outputs {
            delivery = output.deliver(None, &shared, &control).await?;
            if delivery != Delivery::Sent {
                break;
            }
        }
        match delivery {
            Delivery::Cancelled => return Ok(()),
            Delivery::Interrupted => continue,
            Delivery::Sent => {}
        }

        if at_eof {
            if shared.options.is_looping() {
                if shared.outputs_drained() {
                    let to = shared.options.loop_start();
                    if shared.seeks.request_if_idle(SeekRequest::looping(to)) {
                        debug!("Outputs drained, looping to {}", format_timestamp(to));
                    }
                    continue;
                }
            } else if shared.outputs_drained() {
                shared.mark_ended();
            }

            tokio::select! {
                biased;
                _ = control.cancelled() => return Ok(()),
                _ = shared.seeks.wait() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            continue;
        }

        let Some(packet) = demuxer.read_packet()? else {
            info!("End of input reached");
            at_eof = true;
            for output in &mut outputs {
                output.owes_eos = true;
            }
            continue;
        };

        let Some(output) = outputs
            .iter_mut()
            .find(|output| output.ctx.index() == packet.stream_index)
        else {
            trace!("Skipping packet of unselected stream {}", packet.stream_index);
            continue;
        };

        let item = QueueItem::data(output.ctx.serial().current(), packet);
        // An interrupted packet predates the pending seek and is dropped
        if output.deliver(Some(item), &shared, &control).await? == Delivery::Cancelled {
            return Ok(());
        }
    }
}

/// Run of consecutive corrupt packets on one stream
///
/// Corrupt packets are skipped until `limit` of them arrive in a row, then
/// decoding fails. Any decoded frame ends the run.
#[derive(Debug)]
struct CorruptRun {
    stream: usize,
    limit: u32,
    run: u32,
}

impl CorruptRun {
    fn new(stream: usize, limit: u32) -> Self {
        Self { stream, limit, run: 0 }
    }

    /// Skip `err` if it is a tolerable corrupt packet, otherwise hand it back
    fn absorb(&mut self, err: MediaError) -> Result<()> {
        if !err.is_corrupt_data() {
            return Err(err);
        }
        self.run += 1;
        if self.run > self.limit {
            return Err(MediaError::decode(
                -1,
                format!(
                    "{} consecutive corrupt packets in stream {}, last: {}",
                    self.run, self.stream, err
                ),
            ));
        }
        warn!("Skipping corrupt packet in stream {}: {}", self.stream, err);
        Ok(())
    }

    fn reset(&mut self) {
        self.run = 0;
    }
}

/// Pull every frame the decoder has ready and forward it
async fn drain_decoder(
    ctx: &StreamContext,
    decoder: &mut dyn Decoder,
    serial: i32,
    frames: &QueueSender<Frame>,
    corrupt: &mut CorruptRun,
    control: &TaskControl,
) -> Result<bool> {
    loop {
        let frame = match decoder.receive_frame() {
            Ok(DecodeStatus::Frame(frame)) => frame,
            Ok(DecodeStatus::NeedsInput) | Ok(DecodeStatus::EndOfStream) => return Ok(true),
            Err(e) => {
                corrupt.absorb(e)?;
                return Ok(true);
            }
        };
        corrupt.reset();

        if !ctx.accept_after_seek(serial, frame.pts(), frame.duration()) {
            trace!("Skipping frame at {:.3}s before seek target", frame.pts());
            continue;
        }
        if !forward(frames, QueueItem::data(serial, frame), control).await? {
            return Ok(false);
        }
    }
}

/// Decode one stream's packets into frames
///
/// Codec failures other than a short run of corrupt packets end the task
/// with an error, which fails the whole stream.
pub(crate) async fn decode_task(
    ctx: Arc<StreamContext>,
    mut decoder: Box<dyn Decoder>,
    mut packets: QueueReceiver<Packet>,
    frames: QueueSender<Frame>,
    shared: Arc<SharedState>,
    mut control: TaskControl,
) -> Result<()> {
    let mut serial = ctx.serial().current();
    let mut corrupt = CorruptRun::new(ctx.index(), shared.config.playback.max_corrupt_packets);

    loop {
        if !control.checkpoint().await {
            return Ok(());
        }
        let Some(Some(item)) = control.guard(packets.recv()).await else {
            return Ok(());
        };

        let running = match item {
            QueueItem::Flush => {
                decoder.flush();
                corrupt.reset();
                forward(&frames, QueueItem::Flush, &control).await?
            }
            QueueItem::EndOfStream => {
                decoder.send_eof()?;
                let drained =
                    drain_decoder(&ctx, decoder.as_mut(), serial, &frames, &mut corrupt, &control)
                        .await?;
                if !drained {
                    return Ok(());
                }
                // Leaves the decoder ready for packets after a loop seek
                decoder.flush();
                forward(&frames, QueueItem::EndOfStream, &control).await?
            }
            QueueItem::Data { serial: stale, .. } if !ctx.serial().is_current(stale) => {
                shared.counters.stale_item();
                true
            }
            QueueItem::Data { serial: current, item } => {
                serial = current;
                match decoder.send_packet(&item) {
                    Ok(()) => {
                        drain_decoder(&ctx, decoder.as_mut(), serial, &frames, &mut corrupt, &control)
                            .await?
                    }
                    Err(e) => {
                        corrupt.absorb(e)?;
                        true
                    }
                }
            }
        };

        if !running {
            return Ok(());
        }
    }
}

/// Resample decoded audio into the PCM pipe
pub(crate) async fn audio_task(
    ctx: Arc<StreamContext>,
    mut frames: QueueReceiver<Frame>,
    mut writer: PcmWriter,
    shared: Arc<SharedState>,
    mut control: TaskControl,
) -> Result<()> {
    let output = shared.config.audio.parameters();
    let bytes_per_second = output.bytes_per_second() as f64;
    let mut resampler: Option<Resampler> = None;
    let mut buffer: Vec<u8> = Vec::new();
    // Generation cut short at the loop end, later frames of it are dropped
    let mut wrapped_serial = None;

    loop {
        if !control.checkpoint().await {
            return Ok(());
        }
        let Some(Some(item)) = control.guard(frames.recv()).await else {
            return Ok(());
        };

        let (serial, frame) = match item {
            QueueItem::Flush => {
                if let Some(resampler) = resampler.as_mut() {
                    resampler.reset();
                }
                continue;
            }
            QueueItem::EndOfStream => {
                ctx.end_of_stream_reached();
                continue;
            }
            QueueItem::Data { serial, .. }
                if !ctx.serial().is_current(serial) || wrapped_serial == Some(serial) =>
            {
                shared.counters.stale_item();
                continue;
            }
            QueueItem::Data {
                serial,
                item: Frame::Audio(frame),
            } => (serial, frame),
            QueueItem::Data { .. } => {
                warn!("Audio stream produced a non-audio frame");
                continue;
            }
        };

        let source = frame.source_format();
        if resampler.as_ref().map_or(true, |r| r.source() != source) {
            info!(
                "Audio input {} Hz, {} channels, {:?}",
                source.sample_rate, source.channels, source.format
            );
            resampler = Some(Resampler::new(source, output)?);
        }
        let Some(converter) = resampler.as_mut() else {
            continue;
        };

        let requirements = converter.buffer_requirements(&frame);
        buffer.resize(requirements.bytes, 0);
        let mut len = converter.convert(&frame, requirements, &mut buffer)?;
        let mut end_pts = frame.end_pts() - converter.latency();

        if let Some(region) = shared.options.active_region() {
            if frame.end_pts() > region.end {
                let start_pts = end_pts - len as f64 / bytes_per_second;
                len = len.min(converter.buffer_size((region.end - start_pts).max(0.0)));
                end_pts = start_pts + len as f64 / bytes_per_second;
                wrapped_serial = Some(serial);
                if shared.seeks.request_if_idle(SeekRequest::looping(region.start)) {
                    debug!(
                        "Audio reached loop end {}, wrapping to {}",
                        format_timestamp(region.end),
                        format_timestamp(region.start)
                    );
                }
            }
        }

        if len == 0 {
            continue;
        }
        match control.guard(writer.write(&buffer[..len], end_pts, serial)).await {
            Some(written) => written?,
            None => return Ok(()),
        }
    }
}

/// Stage decoded pictures in the ring buffer
pub(crate) async fn video_task(
    ctx: Arc<StreamContext>,
    mut frames: QueueReceiver<Frame>,
    ring: Arc<YCbCrBuffer>,
    shared: Arc<SharedState>,
    mut control: TaskControl,
) -> Result<()> {
    loop {
        if !control.checkpoint().await {
            return Ok(());
        }
        let Some(Some(item)) = control.guard(frames.recv()).await else {
            return Ok(());
        };

        match item {
            QueueItem::Flush => ring.clear(),
            QueueItem::EndOfStream => ctx.end_of_stream_reached(),
            QueueItem::Data { serial, .. } if !ctx.serial().is_current(serial) => {
                shared.counters.stale_item();
            }
            QueueItem::Data {
                serial,
                item: Frame::Video(frame),
            } => {
                if control.guard(ring.write_frame(&frame, serial)).await.transpose()?.is_none() {
                    return Ok(());
                }
            }
            QueueItem::Data { .. } => warn!("Video stream produced a non-video frame"),
        }
    }
}
