//! The shared full-screen quad and the vertex stages that draw it.

use super::GpuContext;
use std::borrow::Cow;
use wgpu::util::DeviceExt;

/// Vertex stage shared by every layer program.
///
/// Clip-space Y is flipped so that render targets keep their first row at
/// `gUV.y == 0`, matching how layers sample the previous layer.
const LAYER_VERTEX_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position.x, -position.y, 0.0, 1.0);
    out.position = position;
    out.uv = position * 0.5 + vec2<f32>(0.5, 0.5);
    return out;
}
"#;

/// A single vertex of the quad: clip-space position only.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
}

impl QuadVertex {
    /// Triangle-strip order covering clip space.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0] },
        QuadVertex { position: [1.0, -1.0] },
        QuadVertex { position: [-1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0] },
    ];

    /// Returns the vertex buffer layout for slot 0.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x2,
            }],
        }
    }
}

/// Vertex buffer plus the layer vertex module, created once per visualizer.
pub struct FullscreenQuad {
    pub vertex_buffer: wgpu::Buffer,
    pub vertex_module: wgpu::ShaderModule,
}

impl FullscreenQuad {
    pub const VERTEX_COUNT: u32 = 4;

    pub fn new(gpu: &GpuContext) -> Self {
        let vertex_buffer = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let vertex_module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Layer Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(LAYER_VERTEX_SHADER)),
        });
        Self {
            vertex_buffer,
            vertex_module,
        }
    }

    /// Primitive state for drawing [`QuadVertex::VERTICES`].
    pub fn primitive() -> wgpu::PrimitiveState {
        wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleStrip,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        }
    }

    /// Binds the vertex buffer and draws the strip.
    pub fn draw(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        pass.draw(0..Self::VERTEX_COUNT, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_vertex_shader_is_valid_wgsl() {
        let module = naga::front::wgsl::parse_str(LAYER_VERTEX_SHADER).unwrap();
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).unwrap();
        assert_eq!(module.entry_points[0].name, "vs_main");
    }

    #[test]
    fn test_quad_covers_clip_space() {
        assert_eq!(QuadVertex::VERTICES.len() as u32, FullscreenQuad::VERTEX_COUNT);
        assert_eq!(QuadVertex::layout().array_stride, 8);
        let corners: Vec<_> = QuadVertex::VERTICES.iter().map(|v| v.position).collect();
        for corner in [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]] {
            assert!(corners.contains(&corner));
        }
    }
}
