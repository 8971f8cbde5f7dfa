//! Output backends the visualizer draws frames into.

pub mod offscreen;
pub mod window_output;

pub use offscreen::OffscreenOutput;
pub use window_output::WindowSurface;

use crate::Visualizer;
use anyhow::Result;

/// Trait for frame output backends.
pub trait OutputBackend {
    /// Format the visualizer's copy pass must target.
    fn format(&self) -> wgpu::TextureFormat;

    /// Render one frame of `visualizer` into the output.
    fn write_frame(&mut self, visualizer: &mut Visualizer) -> Result<()>;
}

impl OutputBackend for OffscreenOutput {
    fn format(&self) -> wgpu::TextureFormat {
        Self::FORMAT
    }

    fn write_frame(&mut self, visualizer: &mut Visualizer) -> Result<()> {
        visualizer.render(self.view())?;
        Ok(())
    }
}
