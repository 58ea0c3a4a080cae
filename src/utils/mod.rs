//! Utility module for nitro-media
//!
//! This module provides common utilities used throughout the engine:
//! - Error handling with custom error types
//! - Configuration management
//! - Timestamp formatting for log output

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{AudioConfig, Config, PlaybackConfig, QueueConfig, SyncConfig};
pub use error::{IntoMediaError, MediaError, Result};

/// Initialize the engine configuration
///
/// Loads configuration from:
/// 1. Default values
/// 2. System configuration file
/// 3. User configuration file
/// 4. Environment variables
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Format a presentation timestamp in seconds for display
///
/// Produces "MM:SS.mmm", or "HH:MM:SS.mmm" past the hour. NaN (unknown
/// clock) formats as "--:--".
pub fn format_timestamp(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "--:--".to_string();
    }

    let sign = if seconds < 0.0 { "-" } else { "" };
    let total_ms = (seconds.abs() * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    if hours > 0 {
        format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, secs, millis)
    } else {
        format!("{}{:02}:{:02}.{:03}", sign, minutes, secs, millis)
    }
}
