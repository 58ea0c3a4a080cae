//! CPAL audio output for nitro-media
//!
//! [`CpalAudioSink`] plays the PCM pipe on an output device. The cpal
//! stream lives on a dedicated thread, since streams are not `Send` on every
//! platform; the sink talks to it through a command channel.

use super::{AudioSink, PcmReader};
use crate::utils::error::{IntoMediaError, MediaError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

enum Command {
    Pause,
    Resume,
    Stop,
}

/// Audio sink backed by a cpal output stream
pub struct CpalAudioSink {
    /// Output device name, `None` for the host default
    device_name: Option<String>,

    commands: Option<Sender<Command>>,
    thread: Option<thread::JoinHandle<()>>,
    playing: Arc<AtomicBool>,
}

impl CpalAudioSink {
    /// Sink playing on the default output device
    pub fn new() -> Self {
        Self {
            device_name: None,
            commands: None,
            thread: None,
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sink playing on the output device called `name`
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
            ..Self::new()
        }
    }

    /// Names of the host's output devices
    pub fn device_names() -> Result<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .output_devices()
            .audio_err("Failed to enumerate output devices")?
            .filter_map(|device| device.name().ok())
            .collect())
    }

    fn send(&self, command: Command) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| MediaError::Audio("Audio output is not running".to_string()))?;
        commands
            .send(command)
            .map_err(|_| MediaError::Audio("Audio output thread has exited".to_string()))
    }
}

impl Default for CpalAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalAudioSink {
    fn start(&mut self, reader: PcmReader) -> Result<()> {
        if self.thread.is_some() {
            return Err(MediaError::Audio("Audio output already started".to_string()));
        }

        let (commands, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let playing = self.playing.clone();
        let device_name = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("nitro-media-audio".to_string())
            .spawn(move || run_output(reader, device_name, command_rx, ready_tx, playing))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.commands = Some(commands);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(MediaError::Audio(
                    "Audio output thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn pause(&mut self) -> Result<()> {
        self.send(Command::Pause)
    }

    fn resume(&mut self) -> Result<()> {
        self.send(Command::Resume)
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Stop);
        }
        self.playing.store(false, Ordering::Release);

        thread
            .join()
            .map_err(|_| MediaError::Audio("Audio output thread panicked".to_string()))
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop audio output: {}", e);
        }
    }
}

/// Body of the audio output thread
fn run_output(
    reader: PcmReader,
    device_name: Option<String>,
    commands: Receiver<Command>,
    ready: Sender<Result<()>>,
    playing: Arc<AtomicBool>,
) {
    let stream = match open_stream(reader, device_name.as_deref()) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play().audio_err("Failed to start audio stream") {
        let _ = ready.send(Err(e));
        return;
    }
    playing.store(true, Ordering::Release);
    let _ = ready.send(Ok(()));

    // Ends on Stop or when the sink is dropped
    for command in commands.iter() {
        match command {
            Command::Pause => match stream.pause() {
                Ok(()) => playing.store(false, Ordering::Release),
                Err(e) => warn!("Failed to pause audio stream: {}", e),
            },
            Command::Resume => match stream.play() {
                Ok(()) => playing.store(true, Ordering::Release),
                Err(e) => warn!("Failed to resume audio stream: {}", e),
            },
            Command::Stop => break,
        }
    }

    playing.store(false, Ordering::Release);
    drop(stream);
    debug!("Audio output thread stopped");
}

fn open_stream(mut reader: PcmReader, device_name: Option<&str>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .audio_err("Failed to enumerate output devices")?
            .find(|device| device.name().map_or(false, |n| n == name))
            .ok_or_else(|| MediaError::NotFound(format!("Audio device '{}'", name)))?,
        None => host
            .default_output_device()
            .ok_or_else(|| MediaError::Audio("No default output device found".to_string()))?,
    };

    let params = reader.parameters();
    let config = StreamConfig {
        channels: params.channels() as u16,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let device_format = device
        .default_output_config()
        .audio_err("Failed to query output configuration")?
        .sample_format();

    let on_error = |err: cpal::StreamError| error!("Audio stream error: {}", err);
    let stream = match device_format {
        cpal::SampleFormat::F32 => {
            let mut scratch: Vec<i16> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0);
                    reader.read(bytemuck::cast_slice_mut(&mut scratch));
                    for (out, sample) in data.iter_mut().zip(&scratch) {
                        *out = *sample as f32 / 32768.0;
                    }
                },
                on_error,
                None,
            )
        }
        _ => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                reader.read(bytemuck::cast_slice_mut(data));
            },
            on_error,
            None,
        ),
    }
    .audio_err("Failed to create audio stream")?;

    info!(
        "Audio output on '{}': {} Hz, {} channels, device format {:?}",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        params.sample_rate,
        params.channels(),
        device_format
    );
    Ok(stream)
}
