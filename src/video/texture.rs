//! Sampled textures for planar YCbCr frames
//!
//! A frame is displayed from three single-channel textures: full-size luma
//! and two half-size chroma planes. Conversion to RGB is left to the host's
//! shader.

use super::ycbcr_buffer::PlaneSet;
use crate::decoder::plane_dimensions;
use crate::utils::error::{MediaError, Result};

const PLANE_LABELS: [&str; 3] = ["Y Plane Texture", "Cb Plane Texture", "Cr Plane Texture"];

/// Destination textures for one video stream
pub struct YCbCrTextures {
    width: u32,
    height: u32,
    textures: [wgpu::Texture; 3],
    views: [wgpu::TextureView; 3],
}

impl YCbCrTextures {
    /// Create textures for `width` x `height` frames
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MediaError::Gpu(format!(
                "Invalid texture size {}x{}",
                width, height
            )));
        }

        let textures = [0, 1, 2].map(|index| {
            let (w, h) = plane_dimensions(width, height, index);
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(PLANE_LABELS[index]),
                size: wgpu::Extent3d {
                    width: w as u32,
                    height: h as u32,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        });
        let views = [0, 1, 2]
            .map(|index| textures[index].create_view(&wgpu::TextureViewDescriptor::default()));

        Ok(Self {
            width,
            height,
            textures,
            views,
        })
    }

    /// Frame size the textures were created for
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Luma, Cb and Cr views for binding
    pub fn views(&self) -> &[wgpu::TextureView; 3] {
        &self.views
    }

    pub fn textures(&self) -> &[wgpu::Texture; 3] {
        &self.textures
    }

    /// Queue a copy of `planes` into the textures
    pub(crate) fn upload(&self, queue: &wgpu::Queue, planes: &PlaneSet) -> Result<()> {
        if (planes.width, planes.height) != (self.width, self.height) {
            return Err(MediaError::Gpu(format!(
                "Frame is {}x{} but textures are {}x{}",
                planes.width, planes.height, self.width, self.height
            )));
        }

        for (index, texture) in self.textures.iter().enumerate() {
            let (pitch, rows) = (planes.pitch(index), planes.rows(index));
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &planes.planes[index],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(pitch as u32),
                    rows_per_image: Some(rows as u32),
                },
                wgpu::Extent3d {
                    width: pitch as u32,
                    height: rows as u32,
                    depth_or_array_layers: 1,
                },
            );
        }

        Ok(())
    }
}
