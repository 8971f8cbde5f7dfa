//! Window output backend using winit and wgpu.

use super::OutputBackend;
use crate::render::GpuContext;
use crate::Visualizer;
use anyhow::Result;
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::window::Window;

/// A configured window surface.
pub struct WindowSurface {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    config: wgpu::SurfaceConfiguration,
    window: Arc<Window>,
}

impl WindowSurface {
    /// Configures `surface` for `window` on the context's device.
    pub fn new(gpu: &GpuContext, surface: wgpu::Surface<'static>, window: Arc<Window>) -> Self {
        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&gpu.adapter);
        // Layers work in linear 8-bit values; a non-sRGB surface shows them unchanged.
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or(surface_caps.formats.first())
            .copied()
            .unwrap_or(wgpu::TextureFormat::Bgra8Unorm);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&gpu.device, &config);

        Self {
            surface,
            device: gpu.device.clone(),
            config,
            window,
        }
    }

    /// Resizes the surface.
    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    /// Returns a reference to the window.
    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl OutputBackend for WindowSurface {
    fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    fn write_frame(&mut self, visualizer: &mut Visualizer) -> Result<()> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        visualizer.render(&view)?;
        self.window.pre_present_notify();
        output.present();
        Ok(())
    }
}
