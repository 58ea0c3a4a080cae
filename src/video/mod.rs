//! Video path for nitro-media
//!
//! Decoded pictures are staged in a [`YCbCrBuffer`] until the presentation
//! side decides to show them, then copied into [`YCbCrTextures`].

pub mod texture;
pub mod ycbcr_buffer;

pub use texture::YCbCrTextures;
pub use ycbcr_buffer::{BufferedFrame, PlaneSet, VideoFrameInfo, YCbCrBuffer};
