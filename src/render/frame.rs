//! Per-frame traversal: one pass per shader layer through the ping-pong
//! targets, then the copy to the output.

use super::{CopyPass, FullscreenQuad, GpuContext, PingPong, RenderTargets};
use crate::compile::{CompiledGroup, CompiledShaderLayer};
use crate::error::RenderError;
use crate::shader::{ScalarType, UniformDescriptor, UniformLocation, UniformValue};
use crate::texture::{TextureHandle, TextureLoader};
use crate::tree::{Group, Node};

/// Clear color of every layer pass, and the color of failed layers.
pub const SENTINEL_COLOR: wgpu::Color = wgpu::Color {
    r: 1.0,
    g: 0.0,
    b: 1.0,
    a: 1.0,
};

/// One draw in traversal order.
#[derive(Debug)]
pub struct DrawStep<'a, L> {
    pub layer: &'a L,
    /// Target sampled as the previous layer.
    pub source: usize,
    /// Target written by this draw.
    pub destination: usize,
}

/// Orders the draws of a tree: depth first, children in reverse at every
/// level, with nested groups sharing one ping-pong state.
///
/// The returned state is the one after the last draw, so its
/// [`PingPong::previous`] names the last written target.
pub fn schedule<L>(group: &Group<L>) -> (Vec<DrawStep<'_, L>>, PingPong) {
    let mut steps = Vec::with_capacity(group.layer_count());
    let mut state = PingPong::default();
    visit(group, &mut state, &mut steps);
    (steps, state)
}

fn visit<'a, L>(group: &'a Group<L>, state: &mut PingPong, steps: &mut Vec<DrawStep<'a, L>>) {
    for child in group.children.iter().rev() {
        match child {
            Node::Layer(layer) => {
                steps.push(DrawStep {
                    layer,
                    source: state.previous(),
                    destination: state.current(),
                });
                state.flip();
            }
            Node::Group(inner) => visit(inner, state, steps),
        }
    }
}

/// Borrowed state needed to record one frame.
pub struct FrameInputs<'a> {
    pub gpu: &'a GpuContext,
    pub quad: &'a FullscreenQuad,
    pub targets: &'a RenderTargets,
    pub loader: &'a dyn TextureLoader,
    pub time: f32,
}

/// Samplers, placeholder texture and copy program reused across frames.
pub struct FrameRenderer {
    copy: CopyPass,
    previous_sampler: wgpu::Sampler,
    texture_sampler: wgpu::Sampler,
    placeholder: TextureHandle,
}

impl FrameRenderer {
    pub fn new(gpu: &GpuContext, output_format: wgpu::TextureFormat) -> Self {
        let previous_sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Previous Layer Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let texture_sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Uniform Texture Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            copy: CopyPass::new(gpu, output_format),
            previous_sampler,
            texture_sampler,
            placeholder: TextureHandle::placeholder(gpu),
        }
    }

    /// Records every layer draw of `tree` followed by the copy into `output`.
    pub fn encode(
        &self,
        inputs: &FrameInputs<'_>,
        tree: &CompiledGroup,
        encoder: &mut wgpu::CommandEncoder,
        output: &wgpu::TextureView,
    ) -> Result<(), RenderError> {
        let (steps, state) = schedule(tree);
        for step in &steps {
            self.draw_layer(inputs, step, encoder)?;
        }
        let last = inputs.targets.get(state.previous());
        self.copy.encode(inputs.gpu, inputs.quad, encoder, last, output);
        Ok(())
    }

    fn draw_layer(
        &self,
        inputs: &FrameInputs<'_>,
        step: &DrawStep<'_, CompiledShaderLayer>,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<(), RenderError> {
        let layer = step.layer;
        let device = &inputs.gpu.device;
        let queue = &inputs.gpu.queue;

        write_globals(inputs, layer);

        let units = layer.program.reflection.texture_units as usize;
        let mut views: Vec<wgpu::TextureView> = (0..units).map(|_| self.placeholder.view()).collect();
        views[0] = inputs.targets.get(step.source).view.clone();

        let mut params = vec![0u8; layer.program.reflection.params_size as usize];
        let mut has_params = false;
        for uniform in &layer.uniforms {
            let value = uniform.resolve(layer.values.get(&uniform.name));
            match (uniform.location, value) {
                (UniformLocation::Scalar { offset, ty: ScalarType::Int }, UniformValue::Int(v)) => {
                    write_scalar(&mut params, offset, bytemuck::bytes_of(&v), uniform)?;
                    has_params = true;
                }
                (UniformLocation::Scalar { offset, ty: ScalarType::Float }, UniformValue::Float(v)) => {
                    write_scalar(&mut params, offset, bytemuck::bytes_of(&v), uniform)?;
                    has_params = true;
                }
                (UniformLocation::Texture { unit }, UniformValue::Texture(source)) if unit > 0 => {
                    let slot = views.get_mut(unit as usize).ok_or_else(|| mismatch(uniform))?;
                    let texture = uniform.texture_or_init(|| {
                        let texture = TextureHandle::placeholder(inputs.gpu);
                        if !source.url.is_empty() {
                            inputs.loader.load(&source.url, texture.clone(), inputs.gpu);
                        }
                        texture
                    });
                    *slot = texture.view();
                }
                _ => return Err(mismatch(uniform)),
            }
        }
        if has_params {
            queue.write_buffer(&layer.params_buffer, 0, &params);
        }

        let uniform_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Layer Uniform Bind Group"),
            layout: &layer.program.uniform_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: layer.globals_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: layer.params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut entries = Vec::with_capacity(units * 2);
        for (unit, view) in views.iter().enumerate() {
            let sampler = if unit == 0 {
                &self.previous_sampler
            } else {
                &self.texture_sampler
            };
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2,
                resource: wgpu::BindingResource::TextureView(view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2 + 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        let texture_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Layer Texture Bind Group"),
            layout: &layer.program.texture_layout,
            entries: &entries,
        });

        let destination = inputs.targets.get(step.destination);
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Layer Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &destination.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(SENTINEL_COLOR),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        render_pass.set_pipeline(&layer.program.pipeline);
        render_pass.set_bind_group(0, &uniform_group, &[]);
        render_pass.set_bind_group(1, &texture_group, &[]);
        inputs.quad.draw(&mut render_pass);
        Ok(())
    }
}

/// Uploads resolution and time where the layer reads them.
fn write_globals(inputs: &FrameInputs<'_>, layer: &CompiledShaderLayer) {
    let queue = &inputs.gpu.queue;
    if let Some(offset) = layer.globals.resolution {
        let (width, height) = inputs.targets.size();
        let resolution = [width as f32, height as f32];
        queue.write_buffer(&layer.globals_buffer, u64::from(offset), bytemuck::cast_slice(&resolution));
    }
    if let Some(offset) = layer.globals.time {
        queue.write_buffer(&layer.globals_buffer, u64::from(offset), bytemuck::bytes_of(&inputs.time));
    }
}

fn write_scalar(params: &mut [u8], offset: u32, bytes: &[u8], uniform: &UniformDescriptor) -> Result<(), RenderError> {
    let start = offset as usize;
    let slot = params
        .get_mut(start..start + bytes.len())
        .ok_or_else(|| mismatch(uniform))?;
    slot.copy_from_slice(bytes);
    Ok(())
}

fn mismatch(uniform: &UniformDescriptor) -> RenderError {
    RenderError::LocationMismatch {
        name: uniform.name.clone(),
        kind: uniform.kind,
        location: uniform.location,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> Node<String> {
        Node::Layer(name.to_string())
    }

    fn order<L: Clone>(steps: &[DrawStep<'_, L>]) -> Vec<L> {
        steps.iter().map(|step| step.layer.clone()).collect()
    }

    #[test]
    fn test_children_draw_in_reverse() {
        let tree = Group::new(vec![layer("A"), layer("B"), layer("C")]);
        let (steps, state) = schedule(&tree);
        assert_eq!(order(&steps), ["C", "B", "A"]);

        // B reads what C just wrote.
        assert_eq!(steps[1].source, steps[0].destination);
        assert_eq!(steps[2].source, steps[1].destination);
        assert_eq!(state.previous(), steps[2].destination);
    }

    #[test]
    fn test_nested_groups_share_targets() {
        let inner = Group::new(vec![layer("B1"), layer("B2")]);
        let tree = Group::new(vec![layer("A"), Node::Group(inner), layer("C")]);
        let (steps, _) = schedule(&tree);
        assert_eq!(order(&steps), ["C", "B2", "B1", "A"]);
        let destinations: Vec<_> = steps.iter().map(|step| step.destination).collect();
        assert_eq!(destinations, [0, 1, 0, 1]);
        for pair in steps.windows(2) {
            assert_eq!(pair[1].source, pair[0].destination);
        }
    }

    #[test]
    fn test_empty_tree_schedules_nothing() {
        let tree: Group<String> = Group::new(vec![Node::Group(Group::default())]);
        let (steps, state) = schedule(&tree);
        assert!(steps.is_empty());
        assert_eq!(state, PingPong::default());
    }
}
