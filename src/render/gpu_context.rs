//! Shared GPU context for wgpu resources.

use crate::error::VisualizerError;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use winit::window::Window;

/// Shared GPU resources used by the visualizer, loaders and outputs.
///
/// All members are reference counted handles, so cloning is cheap.
#[derive(Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Initialize a context for offscreen rendering.
    pub fn headless() -> Result<Self, VisualizerError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self::with_surface(instance, None)
    }

    /// Initialize a context compatible with the given window, returning the
    /// window's surface alongside it.
    pub fn for_window(window: Arc<Window>) -> Result<(Self, wgpu::Surface<'static>)> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(window)?;
        let gpu = Self::with_surface(instance, Some(&surface))?;
        Ok((gpu, surface))
    }

    fn with_surface(
        instance: wgpu::Instance,
        surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<Self, VisualizerError> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        }))?;

        let required_limits = if surface.is_some() {
            wgpu::Limits::default()
        } else {
            wgpu::Limits::downlevel_defaults()
        }
        .using_resolution(adapter.limits());

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Layerstack Device"),
            required_features: wgpu::Features::empty(),
            required_limits,
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;

        let adapter_info = adapter.get_info();
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            headless = surface.is_none(),
            "created GPU context"
        );

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
        })
    }

    /// A context on wgpu's noop backend. Validation runs as usual but nothing
    /// executes, so tests can exercise compilation without a GPU.
    #[cfg(test)]
    pub(crate) fn noop() -> Result<Self, VisualizerError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::NOOP,
            backend_options: wgpu::BackendOptions {
                noop: wgpu::NoopBackendOptions { enable: true },
                ..Default::default()
            },
            ..Default::default()
        });
        Self::with_surface(instance, None)
    }

    /// Largest texture edge the device accepts.
    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }
}
