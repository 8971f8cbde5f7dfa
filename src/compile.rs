//! Layer and group compilation.

use crate::render::{FullscreenQuad, GpuContext};
use crate::shader::program::GLOBALS_SIZE;
use crate::shader::{assemble, lower, reflect_uniforms, GlobalLocations, LayerProgram, UniformDescriptor};
use crate::tree::{AuthoredGroup, Group, LayerMeta, Node, ShaderLayer, UniformValues};
use tracing::{debug, info};

/// A shader layer ready to draw.
pub struct CompiledShaderLayer {
    pub meta: LayerMeta,
    /// Authored values, read at every draw.
    pub values: UniformValues,
    /// Final source text: header, fragment and footer.
    pub source: String,
    pub program: LayerProgram,
    pub uniforms: Vec<UniformDescriptor>,
    pub globals: GlobalLocations,
    pub(crate) globals_buffer: wgpu::Buffer,
    pub(crate) params_buffer: wgpu::Buffer,
}

impl CompiledShaderLayer {
    /// False when the layer draws the fallback program.
    pub fn is_linked(&self) -> bool {
        self.program.linked
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformDescriptor> {
        self.uniforms.iter().find(|uniform| uniform.name == name)
    }
}

pub type CompiledNode = Node<CompiledShaderLayer>;
pub type CompiledGroup = Group<CompiledShaderLayer>;

fn layer_label(meta: &LayerMeta) -> String {
    match (&meta.id, meta.name.is_empty()) {
        (Some(id), _) => id.clone(),
        (None, false) => meta.name.clone(),
        (None, true) => "layer".to_string(),
    }
}

fn uniform_buffer(gpu: &GpuContext, size: u64, label: String) -> wgpu::Buffer {
    gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(&label),
        size,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Compiles one layer. Never fails: a layer that does not compile gets the
/// fallback program and no uniforms.
pub fn compile_layer(gpu: &GpuContext, quad: &FullscreenQuad, layer: &ShaderLayer) -> CompiledShaderLayer {
    let label = layer_label(&layer.meta);
    let lowered = lower(&layer.source);
    let program = LayerProgram::link(gpu, quad, &lowered, &label);

    let source = assemble(&layer.source);
    let uniforms = reflect_uniforms(&source, &program.reflection);
    let globals = program.reflection.globals;
    debug!(
        layer = %label,
        linked = program.linked,
        uniforms = uniforms.len(),
        ?globals,
        "compiled layer"
    );

    CompiledShaderLayer {
        meta: layer.meta.clone(),
        values: layer.values.clone(),
        globals_buffer: uniform_buffer(gpu, GLOBALS_SIZE, format!("{label} Globals")),
        params_buffer: uniform_buffer(gpu, program.reflection.params_size, format!("{label} Params")),
        source,
        program,
        uniforms,
        globals,
    }
}

/// Compiles a whole tree, preserving its shape.
pub fn compile_group(gpu: &GpuContext, quad: &FullscreenQuad, group: &AuthoredGroup) -> CompiledGroup {
    let compiled = group.map_layers(&mut |layer| compile_layer(gpu, quad, layer));
    info!(layers = compiled.layer_count(), "compiled layer tree");
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::UniformValue;
    use crate::texture::TextureHandle;

    fn noop_device() -> (GpuContext, FullscreenQuad) {
        let gpu = GpuContext::noop().expect("noop backend is always available");
        let quad = FullscreenQuad::new(&gpu);
        (gpu, quad)
    }

    #[test]
    fn test_plain_layer_links() {
        let (gpu, quad) = noop_device();
        let layer = ShaderLayer::new(
            "tinted",
            "uniform vec3 tint;\nuniform highp float amount; // default: 0.5\n\
             vec4 render() { return vec4(tint, 1.0) + texture(gPreviousLayer, gUV) * amount; }",
        );
        let compiled = compile_layer(&gpu, &quad, &layer);
        assert!(compiled.is_linked());
        assert_eq!(compiled.uniforms.len(), 1);
        let amount = compiled.uniform("amount").unwrap();
        assert_eq!(amount.default, UniformValue::Float(0.5));
        assert!(compiled.uniform("tint").is_none());
        assert_eq!(compiled.globals.previous_layer, Some(0));
    }

    #[test]
    fn test_layer_needing_device_features_falls_back() {
        let (gpu, quad) = noop_device();
        let layer = ShaderLayer::new(
            "f64",
            "uniform float amount;\n\
             vec4 render() { double d = double(gTime) * double(amount); return vec4(float(d)); }",
        );
        let compiled = compile_layer(&gpu, &quad, &layer);
        assert!(!compiled.is_linked());
        assert!(compiled.uniforms.is_empty());
        assert!(compiled.globals.is_empty());
    }

    #[test]
    fn test_layer_over_texture_limit_falls_back() {
        let (gpu, quad) = noop_device();
        let count = gpu.device.limits().max_sampled_textures_per_shader_stage;
        let mut source = String::new();
        for unit in 0..count {
            source.push_str(&format!("uniform sampler2D t{unit};\n"));
        }
        source.push_str("vec4 render() {\n    vec4 sum = vec4(0.0);\n");
        for unit in 0..count {
            source.push_str(&format!("    sum += texture(t{unit}, gUV);\n"));
        }
        source.push_str("    return sum;\n}\n");

        let compiled = compile_layer(&gpu, &quad, &ShaderLayer::new("many", source));
        assert!(!compiled.is_linked());
        assert_eq!(compiled.program.reflection.texture_units, 1);

        // A broken layer does not stop its siblings from compiling.
        let tree = Group::new(vec![
            Node::Layer(ShaderLayer::new("ok", "vec4 render() { return vec4(1.0); }")),
            Node::Layer(ShaderLayer::new("broken", "vec4 render() { return nope; }")),
        ]);
        let compiled = compile_group(&gpu, &quad, &tree);
        let linked: Vec<_> = compiled
            .children
            .iter()
            .map(|child| matches!(child, Node::Layer(layer) if layer.is_linked()))
            .collect();
        assert_eq!(linked, [true, false]);
    }

    #[test]
    fn test_sampler_texture_is_created_once() {
        let (gpu, quad) = noop_device();
        let layer = ShaderLayer::new("sampled", "uniform sampler2D noise;\nvec4 render() { return texture(noise, gUV); }");
        let compiled = compile_layer(&gpu, &quad, &layer);
        let noise = compiled.uniform("noise").unwrap();
        assert!(noise.cached_texture().is_none());

        let mut created = 0;
        for _ in 0..2 {
            noise.texture_or_init(|| {
                created += 1;
                TextureHandle::placeholder(&gpu)
            });
        }
        assert_eq!(created, 1);
        assert_eq!(noise.cached_texture().map(TextureHandle::size), Some((1, 1)));
    }

    #[test]
    fn test_layer_label_prefers_id() {
        let mut meta = LayerMeta::default();
        assert_eq!(layer_label(&meta), "layer");
        meta.name = "Grain".into();
        assert_eq!(layer_label(&meta), "Grain");
        meta.id = Some("grain-1".into());
        assert_eq!(layer_label(&meta), "grain-1");
    }
}
