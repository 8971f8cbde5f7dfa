//! Ping-pong render targets.

use super::GpuContext;

/// Format of every intermediate target.
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// An offscreen texture that layers draw into and sample from.
pub struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl RenderTarget {
    pub fn new(gpu: &GpuContext, width: u32, height: u32, label: &str) -> Self {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }

    pub fn width(&self) -> u32 {
        self.texture.width()
    }

    pub fn height(&self) -> u32 {
        self.texture.height()
    }
}

/// The two targets shared by a whole tree.
pub struct RenderTargets {
    targets: [RenderTarget; 2],
}

impl RenderTargets {
    pub fn new(gpu: &GpuContext, width: u32, height: u32) -> Self {
        Self {
            targets: [
                RenderTarget::new(gpu, width, height, "Ping-Pong Target 0"),
                RenderTarget::new(gpu, width, height, "Ping-Pong Target 1"),
            ],
        }
    }

    pub fn get(&self, index: usize) -> &RenderTarget {
        &self.targets[index]
    }

    pub fn size(&self) -> (u32, u32) {
        (self.targets[0].width(), self.targets[0].height())
    }
}

/// Which of the two targets is written next.
///
/// Threaded through a frame's traversal; each shader layer writes
/// [`PingPong::current`], samples [`PingPong::previous`] and then flips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingPong {
    current: usize,
}

impl PingPong {
    pub fn current(self) -> usize {
        self.current
    }

    pub fn previous(self) -> usize {
        1 - self.current
    }

    pub fn flip(&mut self) {
        self.current = self.previous();
    }
}
