//! Configuration management for nitro-media
//!
//! This module handles loading and managing engine configuration
//! from config files and environment variables.

use crate::audio::{AudioParameters, ChannelLayout};
use crate::player::LoopRegion;
use crate::utils::error::{MediaError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Audio output configuration
    pub audio: AudioConfig,

    /// Queue and ring buffer capacities
    pub queues: QueueConfig,

    /// A/V synchronization thresholds
    pub sync: SyncConfig,

    /// Initial playback options
    pub playback: PlaybackConfig,
}

/// Audio output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output channel layout
    pub channel_layout: ChannelLayout,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Capacity of the PCM pipe between the audio task and the sink
    pub pipe_capacity_ms: u32,
}

/// Queue capacities, per stream kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Compressed audio packets awaiting decode
    pub audio_packets: usize,

    /// Decoded audio frames awaiting resampling
    pub audio_frames: usize,

    /// Compressed video packets awaiting decode
    pub video_packets: usize,

    /// Decoded video frames awaiting upload to the ring buffer
    pub video_frames: usize,

    /// Slots in the presentation ring buffer
    pub ring_capacity: usize,
}

/// A/V synchronization thresholds, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Below this drift no correction is applied
    pub min_threshold: f64,

    /// Above this drift the frame timer is reset instead of caught up
    pub max_threshold: f64,

    /// Frames longer than this are extended rather than duplicated
    pub framedup_threshold: f64,

    /// Clocks further apart than this are considered unrelated
    pub nosync_threshold: f64,

    /// Longest plausible gap between two consecutive frames
    pub max_frame_duration: f64,

    /// Poll interval used while waiting for outputs to drain at end of stream
    pub eof_poll_ms: u64,
}

/// Initial playback options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Restart playback when the end (or the loop region end) is reached
    pub looping: bool,

    /// Optional loop region
    pub loop_region: Option<LoopRegion>,

    /// Consecutive corrupt packets skipped before decoding fails
    pub max_corrupt_packets: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            looping: false,
            loop_region: None,
            max_corrupt_packets: 16,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            channel_layout: ChannelLayout::Stereo,
            sample_rate: 44100,
            pipe_capacity_ms: 500,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            audio_packets: 3000,
            audio_frames: 3000,
            video_packets: 256,
            video_frames: 48,
            ring_capacity: 48,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_threshold: 0.04,
            max_threshold: 0.1,
            framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            max_frame_duration: 3600.0,
            eof_poll_ms: 10,
        }
    }
}

impl AudioConfig {
    /// Output parameters handed to the resampler and the sink
    pub fn parameters(&self) -> AudioParameters {
        AudioParameters {
            channel_layout: self.channel_layout,
            sample_rate: self.sample_rate,
        }
    }

    /// Capacity of the PCM pipe in bytes, rounded to whole sample frames
    pub fn pipe_capacity_bytes(&self) -> usize {
        let params = self.parameters();
        let frames = (self.sample_rate as u64 * self.pipe_capacity_ms as u64 / 1000) as usize;
        frames.max(1) * params.block_align()
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/nitro-media/config.toml on Linux)
    /// 3. User config file (~/.config/nitro-media/config.toml on Linux)
    /// 4. Environment variables (NITRO_MEDIA_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config = Self::read_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config = Self::read_file(&user_path)?;
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Load and validate a single configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the given path, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MediaError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml = toml::to_string_pretty(self)
            .map_err(|e| MediaError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml)
            .map_err(|e| MediaError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| MediaError::Config("Cannot determine user config path".to_string()))?;
        self.save_to(&path)
    }

    /// Parse a TOML file; sections and keys missing from the file keep their defaults
    fn read_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MediaError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| MediaError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply NITRO_MEDIA_* overrides through the given variable lookup
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(rate) = lookup("NITRO_MEDIA_SAMPLE_RATE") {
            self.audio.sample_rate = rate
                .parse()
                .map_err(|_| MediaError::Config("Invalid NITRO_MEDIA_SAMPLE_RATE".to_string()))?;
        }

        if let Some(layout) = lookup("NITRO_MEDIA_CHANNEL_LAYOUT") {
            self.audio.channel_layout = match layout.to_ascii_lowercase().as_str() {
                "mono" => ChannelLayout::Mono,
                "stereo" => ChannelLayout::Stereo,
                _ => {
                    return Err(MediaError::Config(
                        "Invalid NITRO_MEDIA_CHANNEL_LAYOUT, expected mono or stereo".to_string(),
                    ))
                }
            };
        }

        if let Some(looping) = lookup("NITRO_MEDIA_LOOPING") {
            self.playback.looping = looping
                .parse()
                .map_err(|_| MediaError::Config("Invalid NITRO_MEDIA_LOOPING".to_string()))?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(MediaError::Config("Sample rate must be non-zero".to_string()));
        }

        if self.audio.pipe_capacity_ms == 0 {
            return Err(MediaError::Config("PCM pipe capacity must be non-zero".to_string()));
        }

        let queues = &self.queues;
        let capacities = [
            ("audio_packets", queues.audio_packets),
            ("audio_frames", queues.audio_frames),
            ("video_packets", queues.video_packets),
            ("video_frames", queues.video_frames),
            ("ring_capacity", queues.ring_capacity),
        ];
        for (name, capacity) in capacities {
            if capacity < 2 {
                return Err(MediaError::Config(format!(
                    "Queue capacity '{}' must be at least 2",
                    name
                )));
            }
        }

        let sync = &self.sync;
        if sync.min_threshold <= 0.0 || sync.max_threshold <= 0.0 || sync.framedup_threshold <= 0.0 {
            return Err(MediaError::Config("Sync thresholds must be positive".to_string()));
        }
        if sync.min_threshold > sync.max_threshold {
            return Err(MediaError::Config(
                "min_threshold must not exceed max_threshold".to_string(),
            ));
        }
        if sync.nosync_threshold <= sync.max_threshold || sync.max_frame_duration <= 0.0 {
            return Err(MediaError::Config(
                "nosync_threshold and max_frame_duration must exceed the sync thresholds"
                    .to_string(),
            ));
        }

        if let Some(region) = &self.playback.loop_region {
            region.validate()?;
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/nitro-media/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("NitroMedia").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/NitroMedia/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return dirs::config_dir().map(|p| p.join("nitro-media").join("config.toml"));

        #[cfg(not(target_os = "linux"))]
        return dirs::config_dir().map(|p| p.join("NitroMedia").join("config.toml"));
    }
}
