//! Player module for nitro-media
//!
//! This module ties demuxing, decoding, audio output and frame presentation
//! together. A [`MediaPlayer`] opens media into [`MediaStream`]s; each
//! stream runs its pipeline on tokio tasks and paces video against the
//! audio or external clock.

mod media_player;
mod media_stream;
mod state;
mod stream_context;
mod tasks;

pub use media_player::{MediaPlayer, MediaPlayerBuilder};
pub use media_stream::MediaStream;
pub use state::{LoopRegion, MediaEvent, PlaybackStats, SeekRequest};
pub use stream_context::{PendingSeek, StreamContext};
