//! Error types for nitro-media
//!
//! This module defines the error type shared by every stage of the playback
//! pipeline. Natural end-of-stream, stale data and backpressure are not errors
//! and never surface here.

use thiserror::Error;

/// Main error type for nitro-media
#[derive(Error, Debug)]
pub enum MediaError {
    /// Failure reported by the codec or container library
    #[error("Decode error ({code}): {message}")]
    Decode {
        /// Numeric code returned by the library
        code: i32,

        /// Textual description returned by the library
        message: String,
    },

    /// Demuxer errors that carry no library code
    #[error("Demux error: {0}")]
    Demux(String),

    /// A single packet holds invalid bitstream data
    ///
    /// The decoder stays usable, so a bounded run of these is skipped.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Audio conversion or output errors
    #[error("Audio error: {0}")]
    Audio(String),

    /// Video buffering errors
    #[error("Video error: {0}")]
    Video(String),

    /// GPU upload errors
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Unsupported codec or sample format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for MediaError {
    fn from(err: ffmpeg_next::Error) -> Self {
        match err {
            ffmpeg_next::Error::InvalidData => MediaError::CorruptData(err.to_string()),
            _ => MediaError::Decode {
                code: i32::from(err),
                message: err.to_string(),
            },
        }
    }
}

impl From<rubato::ResampleError> for MediaError {
    fn from(err: rubato::ResampleError) -> Self {
        MediaError::Audio(format!("Resampling failed: {}", err))
    }
}

impl From<rubato::ResamplerConstructionError> for MediaError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        MediaError::Audio(format!("Cannot create resampler: {}", err))
    }
}

impl MediaError {
    /// Create a decode error from a library code and message
    pub fn decode<S: Into<String>>(code: i32, message: S) -> Self {
        MediaError::Decode {
            code,
            message: message.into(),
        }
    }

    /// Whether only the current packet is lost and decoding may go on
    pub fn is_corrupt_data(&self) -> bool {
        matches!(self, MediaError::CorruptData(_))
    }
}

/// Convenience type alias for Results in nitro-media
pub type Result<T> = std::result::Result<T, MediaError>;

/// Extension trait for converting other errors to MediaError
pub trait IntoMediaError<T> {
    /// Convert this error into a MediaError with the given context
    fn decode_err(self, context: &str) -> Result<T>;
    fn audio_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
    fn gpu_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoMediaError<T> for std::result::Result<T, E> {
    fn decode_err(self, context: &str) -> Result<T> {
        self.map_err(|e| MediaError::Decode {
            code: -1,
            message: format!("{}: {}", context, e),
        })
    }

    fn audio_err(self, context: &str) -> Result<T> {
        self.map_err(|e| MediaError::Audio(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| MediaError::Config(format!("{}: {}", context, e)))
    }

    fn gpu_err(self, context: &str) -> Result<T> {
        self.map_err(|e| MediaError::Gpu(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::MediaError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::MediaError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
