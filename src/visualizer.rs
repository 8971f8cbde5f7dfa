//! The visualizer facade: compile once, render many.

use crate::compile::{compile_group, CompiledGroup};
use crate::error::{RenderError, VisualizerError};
use crate::input::{InputSample, InputSource, NoInput};
use crate::render::{FrameInputs, FrameRenderer, FullscreenQuad, GpuContext, RenderTargets};
use crate::texture::TextureLoader;
use crate::tree::AuthoredGroup;
use std::time::Instant;
use tracing::{debug, info};

/// Output size and format of a [`Visualizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualizerConfig {
    pub width: u32,
    pub height: u32,
    /// Format of the views passed to [`Visualizer::render`].
    pub output_format: wgpu::TextureFormat,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            output_format: wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

fn validate_size(width: u32, height: u32, limit: u32) -> Result<(), VisualizerError> {
    if width == 0 || height == 0 {
        return Err(VisualizerError::EmptyOutput { width, height });
    }
    if width > limit || height > limit {
        return Err(VisualizerError::ExceedsLimit { width, height, limit });
    }
    Ok(())
}

/// Owns the GPU resources shared by every layer and draws compiled trees.
pub struct Visualizer {
    gpu: GpuContext,
    config: VisualizerConfig,
    quad: FullscreenQuad,
    targets: RenderTargets,
    renderer: FrameRenderer,
    loader: Box<dyn TextureLoader>,
    input: Box<dyn InputSource>,
    compiled: Option<CompiledGroup>,
    started: Instant,
    pinned_time: Option<f64>,
}

impl Visualizer {
    pub fn new(
        gpu: GpuContext,
        config: VisualizerConfig,
        loader: impl TextureLoader + 'static,
    ) -> Result<Self, VisualizerError> {
        validate_size(config.width, config.height, gpu.max_texture_dimension())?;

        let quad = FullscreenQuad::new(&gpu);
        let targets = RenderTargets::new(&gpu, config.width, config.height);
        let renderer = FrameRenderer::new(&gpu, config.output_format);
        info!(
            width = config.width,
            height = config.height,
            format = ?config.output_format,
            "created visualizer"
        );

        Ok(Self {
            gpu,
            config,
            quad,
            targets,
            renderer,
            loader: Box::new(loader),
            input: Box::new(NoInput),
            compiled: None,
            started: Instant::now(),
            pinned_time: None,
        })
    }

    /// Replaces the input source handed to the preprocessing stage.
    pub fn with_input(mut self, input: impl InputSource + 'static) -> Self {
        self.input = Box::new(input);
        self
    }

    /// Compiles `tree`, replacing any previously compiled tree.
    pub fn compile(&mut self, tree: &AuthoredGroup) {
        self.compiled = Some(compile_group(&self.gpu, &self.quad, tree));
    }

    /// The most recently compiled tree.
    pub fn compiled(&self) -> Option<&CompiledGroup> {
        self.compiled.as_ref()
    }

    /// Draws one frame into `output`. Does nothing before the first compile.
    pub fn render(&mut self, output: &wgpu::TextureView) -> Result<(), RenderError> {
        let Some(tree) = &self.compiled else {
            return Ok(());
        };
        let inputs = FrameInputs {
            gpu: &self.gpu,
            quad: &self.quad,
            targets: &self.targets,
            loader: self.loader.as_ref(),
            time: self.elapsed() as f32,
        };

        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Encoder"),
        });
        self.renderer.encode(&inputs, tree, &mut encoder, output)?;
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Recreates both render targets at a new size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), VisualizerError> {
        validate_size(width, height, self.gpu.max_texture_dimension())?;
        if (width, height) != (self.config.width, self.config.height) {
            debug!(width, height, "resizing render targets");
            self.targets = RenderTargets::new(&self.gpu, width, height);
            self.config.width = width;
            self.config.height = height;
        }
        Ok(())
    }

    /// Pins the time seen by layers, or resumes the wall clock with `None`.
    pub fn set_time(&mut self, seconds: Option<f64>) {
        self.pinned_time = seconds;
    }

    /// Seconds since construction, unless pinned.
    pub fn elapsed(&self) -> f64 {
        self.pinned_time
            .unwrap_or_else(|| self.started.elapsed().as_secs_f64())
    }

    /// Updates an authored value on the compiled layer whose id (or name,
    /// when it has no id) is `layer`. Returns false when no layer matches.
    pub fn set_value(&mut self, layer: &str, name: &str, value: impl Into<serde_yaml::Value>) -> bool {
        let Some(tree) = self.compiled.as_mut() else {
            return false;
        };
        let found = tree.find_layer_mut(&|compiled| match &compiled.meta.id {
            Some(id) => id == layer,
            None => compiled.meta.name == layer,
        });
        match found {
            Some(compiled) => {
                compiled.values.insert(name.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn sample_button(&self, device: u32, input_id: u32) -> InputSample {
        self.input.sample_button(device, input_id)
    }

    pub fn sample_axis(&self, device: u32, input_id: u32) -> InputSample {
        self.input.sample_axis(device, input_id)
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn config(&self) -> VisualizerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OffscreenOutput;
    use crate::texture::TextureHandle;
    use crate::tree::{Group, Node, ShaderLayer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const RED: &str = "vec4 render() { return vec4(1.0, 0.0, 0.0, 1.0); }";
    const IDENTITY: &str = "vec4 render() { return texture(gPreviousLayer, gUV); }";
    const INVERT: &str = "\
vec4 render() {
    vec4 color = texture(gPreviousLayer, gUV);
    return vec4(1.0 - color.rgb, color.a);
}
";

    #[derive(Clone, Default)]
    struct CountingLoader(Arc<AtomicUsize>);

    impl TextureLoader for CountingLoader {
        fn load(&self, _url: &str, _texture: TextureHandle, _gpu: &GpuContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn headless() -> Option<GpuContext> {
        match GpuContext::headless() {
            Ok(gpu) => Some(gpu),
            Err(err) => {
                eprintln!("skipping GPU test: {err}");
                None
            }
        }
    }

    fn tree(layers: &[(&str, &str)]) -> AuthoredGroup {
        Group::new(
            layers
                .iter()
                .map(|(name, source)| Node::Layer(ShaderLayer::new(*name, *source)))
                .collect(),
        )
    }

    fn setup(gpu: &GpuContext, loader: CountingLoader) -> (Visualizer, OffscreenOutput) {
        let config = VisualizerConfig {
            width: 4,
            height: 4,
            output_format: OffscreenOutput::FORMAT,
        };
        let visualizer = Visualizer::new(gpu.clone(), config, loader).unwrap();
        (visualizer, OffscreenOutput::new(gpu, 4, 4))
    }

    fn noop_setup(loader: CountingLoader) -> (Visualizer, OffscreenOutput) {
        let gpu = GpuContext::noop().expect("noop backend is always available");
        setup(&gpu, loader)
    }

    /// Clears ping-pong target `index` to `color`, as if a layer had drawn it.
    fn fill_target(visualizer: &Visualizer, index: usize, color: wgpu::Color) {
        let gpu = &visualizer.gpu;
        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Fill Target Encoder"),
        });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Fill Target Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &visualizer.targets.get(index).view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(color),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    fn render_pixel(visualizer: &mut Visualizer, output: &OffscreenOutput) -> [u8; 4] {
        visualizer.render(output.view()).unwrap();
        let pixels = output.read_pixels(visualizer.gpu()).unwrap();
        [pixels[0], pixels[1], pixels[2], pixels[3]]
    }

    #[test]
    fn test_validate_size() {
        assert!(validate_size(640, 480, 2048).is_ok());
        assert!(matches!(
            validate_size(0, 480, 2048),
            Err(VisualizerError::EmptyOutput { width: 0, height: 480 })
        ));
        assert!(matches!(
            validate_size(4096, 16, 2048),
            Err(VisualizerError::ExceedsLimit { limit: 2048, .. })
        ));
    }

    #[test]
    fn test_identity_passes_red_through() {
        let Some(gpu) = headless() else { return };
        let (mut visualizer, output) = setup(&gpu, CountingLoader::default());
        visualizer.compile(&tree(&[("Identity", IDENTITY)]));
        // The first layer samples target 1.
        fill_target(&visualizer, 1, wgpu::Color::RED);
        assert_eq!(render_pixel(&mut visualizer, &output), [255, 0, 0, 255]);
    }

    #[test]
    fn test_invert_then_identity_inverts_input() {
        let Some(gpu) = headless() else { return };
        let (mut visualizer, output) = setup(&gpu, CountingLoader::default());
        visualizer.compile(&tree(&[("Invert", INVERT), ("Identity", IDENTITY)]));
        fill_target(&visualizer, 1, wgpu::Color::RED);
        assert_eq!(render_pixel(&mut visualizer, &output), [0, 255, 255, 255]);
    }

    #[test]
    fn test_red_layer_feeds_the_layer_above() {
        let Some(gpu) = headless() else { return };
        let (mut visualizer, output) = setup(&gpu, CountingLoader::default());
        visualizer.compile(&tree(&[("Invert", INVERT), ("Identity", IDENTITY), ("Red", RED)]));
        assert_eq!(render_pixel(&mut visualizer, &output), [0, 255, 255, 255]);
    }

    #[test]
    fn test_mixed_tree_renders_without_a_gpu() {
        let (mut visualizer, output) = noop_setup(CountingLoader::default());
        let nested = Group::new(vec![
            Node::Layer(ShaderLayer::new("Broken", "vec4 render() { return nope; }")),
            Node::Layer(ShaderLayer::new(
                "Tinted",
                "uniform vec3 tint;\nuniform highp float amount; // default: 0.5\n\
                 vec4 render() { return vec4(tint, 1.0) * amount + vec4(gResolution, gTime, 0.0); }",
            )),
        ]);
        let layers = Group::new(vec![
            Node::Layer(ShaderLayer::new("Invert", INVERT)),
            Node::Group(nested),
            Node::Layer(ShaderLayer::new("Red", RED)),
        ]);
        visualizer.compile(&layers);
        assert_eq!(visualizer.compiled().unwrap().layer_count(), 4);
        assert!(visualizer.render(output.view()).is_ok());
        assert!(visualizer.render(output.view()).is_ok());
    }

    #[test]
    fn test_compile_is_idempotent() {
        let Some(gpu) = headless() else { return };
        let layers = tree(&[("Invert", INVERT), ("Red", RED)]);

        let (mut once, output) = setup(&gpu, CountingLoader::default());
        once.compile(&layers);
        let expected = render_pixel(&mut once, &output);

        let (mut twice, output) = setup(&gpu, CountingLoader::default());
        twice.compile(&layers);
        twice.compile(&layers);
        assert_eq!(render_pixel(&mut twice, &output), expected);
        assert_eq!(twice.compiled().unwrap().layer_count(), 2);
    }

    #[test]
    fn test_layer_without_globals_has_no_locations() {
        let Some(gpu) = headless() else { return };
        let (mut visualizer, output) = setup(&gpu, CountingLoader::default());
        visualizer.compile(&tree(&[("Red", RED)]));
        let Some(Node::Layer(layer)) = visualizer.compiled().unwrap().children.first() else {
            panic!("expected a compiled layer");
        };
        assert!(layer.is_linked());
        assert_eq!(layer.globals.resolution, None);
        assert_eq!(layer.globals.time, None);
        assert_eq!(layer.globals.previous_layer, None);
        assert_eq!(render_pixel(&mut visualizer, &output), [255, 0, 0, 255]);
    }

    #[test]
    fn test_failed_layer_draws_sentinel() {
        let Some(gpu) = headless() else { return };
        let (mut visualizer, output) = setup(&gpu, CountingLoader::default());
        visualizer.compile(&tree(&[("Broken", "vec4 render() { return nope; }")]));
        let Some(Node::Layer(layer)) = visualizer.compiled().unwrap().children.first() else {
            panic!("expected a compiled layer");
        };
        assert!(!layer.is_linked());
        assert!(layer.uniforms.is_empty());
        assert!(layer.globals.is_empty());
        assert_eq!(render_pixel(&mut visualizer, &output), [255, 0, 255, 255]);
    }

    #[test]
    fn test_uniform_values_are_clamped_and_editable() {
        let Some(gpu) = headless() else { return };
        let (mut visualizer, output) = setup(&gpu, CountingLoader::default());
        let source = "uniform float level; // default: 0.25, max: 1\n\
                      vec4 render() { return vec4(level, 0.0, 0.0, 1.0); }";
        let layer = ShaderLayer::new("Level", source).with_value("level", 3.0);
        visualizer.compile(&Group::new(vec![Node::Layer(layer)]));
        assert_eq!(render_pixel(&mut visualizer, &output), [255, 0, 0, 255]);

        assert!(visualizer.set_value("Level", "level", 0.0));
        assert_eq!(render_pixel(&mut visualizer, &output), [0, 0, 0, 255]);
        assert!(!visualizer.set_value("Missing", "level", 0.0));
    }

    #[test]
    fn test_texture_loads_once_per_uniform() {
        let loader = CountingLoader::default();
        let (mut visualizer, output) = noop_setup(loader.clone());
        let source = "\
uniform sampler2D pattern; // default: \"pattern.png\"
uniform sampler2D blank;
vec4 render() { return texture(pattern, gUV) + texture(blank, gUV); }
";
        visualizer.compile(&tree(&[("Textured", source)]));
        visualizer.render(output.view()).unwrap();
        visualizer.render(output.view()).unwrap();
        assert_eq!(loader.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_render_before_compile_is_a_no_op() {
        let (mut visualizer, output) = noop_setup(CountingLoader::default());
        assert!(visualizer.render(output.view()).is_ok());
        assert!(visualizer.compiled().is_none());
    }

    #[test]
    fn test_resize_rejects_empty_size() {
        let (mut visualizer, _) = noop_setup(CountingLoader::default());
        assert!(visualizer.resize(8, 8).is_ok());
        assert_eq!(visualizer.config().width, 8);
        assert!(visualizer.resize(0, 8).is_err());
    }
}
