//! nitro-media - audio/video playback engine
//!
//! The engine demuxes and decodes media on tokio tasks, converts audio into
//! a PCM pipe read by an [`audio::AudioSink`], and stages video frames in a
//! ring buffer from which the host pulls the frame due for display:
//!
//! ```no_run
//! # async fn play(demuxer: Box<dyn nitro_media::Demuxer>) -> nitro_media::Result<()> {
//! use nitro_media::MediaPlayer;
//!
//! let player = MediaPlayer::builder().build()?;
//! let mut stream = player.open(demuxer, None)?;
//! stream.start()?;
//!
//! // Once per render tick
//! if let Some(frame) = stream.get_next_frame() {
//!     frame.with_planes(|planes| planes.width);
//! }
//!
//! stream.close().await
//! # }
//! ```

pub mod audio;
pub mod decoder;
pub mod player;
pub mod sync;
pub mod utils;
pub mod video;

pub use audio::{AudioParameters, AudioSink, ChannelLayout};
pub use decoder::{Decoder, DecoderRegistry, Demuxer, StreamInfo};
pub use player::{
    LoopRegion, MediaEvent, MediaPlayer, MediaPlayerBuilder, MediaStream, PlaybackStats,
};
pub use utils::config::Config;
pub use utils::error::{MediaError, Result};
pub use video::{BufferedFrame, YCbCrTextures};
