//! Offscreen output with CPU readback.

use crate::render::GpuContext;
use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Row pitch required by buffer copies.
const ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// An RGBA8 texture the visualizer can render into and read back.
pub struct OffscreenOutput {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl OffscreenOutput {
    pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

    pub fn new(gpu: &GpuContext, width: u32, height: u32) -> Self {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Output"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Copies the texture to the CPU as tightly packed RGBA rows, top row first.
    pub fn read_pixels(&self, gpu: &GpuContext) -> Result<Vec<u8>> {
        let unpadded_bytes_per_row = self.width * 4;
        let aligned_bytes_per_row = unpadded_bytes_per_row.next_multiple_of(ROW_ALIGNMENT);

        let staging_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: u64::from(aligned_bytes_per_row) * u64::from(self.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        let submission_index = gpu.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        gpu.device.poll(wgpu::PollType::Wait {
            submission_index: Some(submission_index),
            timeout: None,
        })?;
        receiver.recv()??;

        let data = buffer_slice.get_mapped_range();
        let pixels = strip_row_padding(&data, unpadded_bytes_per_row, aligned_bytes_per_row, self.height);
        drop(data);
        staging_buffer.unmap();
        Ok(pixels)
    }

    /// Reads the texture back and writes it as a PNG.
    pub fn save_png(&self, gpu: &GpuContext, path: &Path) -> Result<()> {
        let pixels = self.read_pixels(gpu)?;
        let image = image::RgbaImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| anyhow!("readback size does not match {}x{}", self.width, self.height))?;
        image
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn strip_row_padding(data: &[u8], row_bytes: u32, padded_row_bytes: u32, rows: u32) -> Vec<u8> {
    let mut result = Vec::with_capacity((row_bytes * rows) as usize);
    for y in 0..rows {
        let start = (y * padded_row_bytes) as usize;
        let end = start + row_bytes as usize;
        result.extend_from_slice(&data[start..end]);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_row_padding() {
        let mut padded = vec![0u8; 512];
        padded[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        padded[256..264].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        let pixels = strip_row_padding(&padded, 8, 256, 2);
        assert_eq!(pixels, (1..=16).collect::<Vec<u8>>());
    }
}
