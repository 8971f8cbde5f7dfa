//! Linking layer programs: GLSL to WGSL through naga, reflection of the
//! translated module, and the wgpu pipeline built from it.

use super::reflect::{LocationResolver, ScalarType, UniformLocation};
use super::source::{
    texture_global, LoweredSource, GLOBALS_BLOCK, PARAMS_BLOCK, PREVIOUS_LAYER_UNIFORM,
    RESOLUTION_UNIFORM, TIME_UNIFORM,
};
use crate::render::{FullscreenQuad, GpuContext, QuadVertex, TARGET_FORMAT};
use anyhow::{anyhow, bail, Result};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::{Expression, GlobalVariable, Handle, Module, ScalarKind, ShaderStage, SourceLocation, TypeInner};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt::{self, Write};
use tracing::{debug, error};

/// Size of the `GlobalUniforms` block under std140.
pub const GLOBALS_SIZE: u64 = 16;

/// Drawn by layers whose source failed to compile.
const FALLBACK_FRAGMENT_SHADER: &str = r#"
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 1.0, 1.0);
}
"#;

/// Locations of the implicit globals. Each is `None` when the layer never
/// reads it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalLocations {
    /// Byte offset of `gResolution` in the globals block.
    pub resolution: Option<u32>,
    /// Byte offset of `gTime` in the globals block.
    pub time: Option<u32>,
    /// Texture unit of `gPreviousLayer`.
    pub previous_layer: Option<u32>,
}

impl GlobalLocations {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a linked program exposes, read from the naga module.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramReflection {
    scalars: HashMap<String, UniformLocation>,
    textures: HashMap<String, u32>,
    pub globals: GlobalLocations,
    /// Byte size of the parameter buffer, a non-zero multiple of 16.
    pub params_size: u64,
    /// Texture units bound in group 1, including unit 0.
    pub texture_units: u32,
}

impl Default for ProgramReflection {
    fn default() -> Self {
        Self {
            scalars: HashMap::new(),
            textures: HashMap::new(),
            globals: GlobalLocations::default(),
            params_size: 16,
            texture_units: 1,
        }
    }
}

impl LocationResolver for ProgramReflection {
    fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
        self.scalars
            .get(name)
            .copied()
            .or_else(|| self.textures.get(name).map(|&unit| UniformLocation::Texture { unit }))
    }
}

/// A fragment translated to WGSL, with its reflection.
#[derive(Debug, Clone)]
pub struct Translation {
    pub wgsl: String,
    pub reflection: ProgramReflection,
}

/// naga capabilities matching what the device accepts in a fragment shader.
pub fn device_capabilities(gpu: &GpuContext) -> Capabilities {
    let features = gpu.device.features();
    let downlevel = gpu.adapter.get_downlevel_capabilities().flags;
    let mut capabilities = Capabilities::empty();
    capabilities.set(Capabilities::FLOAT64, features.contains(wgpu::Features::SHADER_F64));
    capabilities.set(Capabilities::SHADER_FLOAT16, features.contains(wgpu::Features::SHADER_F16));
    capabilities.set(
        Capabilities::SHADER_FLOAT16_IN_FLOAT32,
        downlevel.contains(wgpu::DownlevelFlags::SHADER_F16_IN_F32),
    );
    capabilities.set(Capabilities::SHADER_INT64, features.contains(wgpu::Features::SHADER_INT64));
    capabilities.set(
        Capabilities::PRIMITIVE_INDEX,
        features.contains(wgpu::Features::SHADER_PRIMITIVE_INDEX),
    );
    capabilities.set(
        Capabilities::EARLY_DEPTH_TEST,
        features.contains(wgpu::Features::SHADER_EARLY_DEPTH_TEST),
    );
    capabilities.set(
        Capabilities::DUAL_SOURCE_BLENDING,
        features.contains(wgpu::Features::DUAL_SOURCE_BLENDING),
    );
    capabilities.set(Capabilities::MULTIVIEW, features.contains(wgpu::Features::MULTIVIEW));
    capabilities.set(
        Capabilities::CUBE_ARRAY_TEXTURES,
        downlevel.contains(wgpu::DownlevelFlags::CUBE_ARRAY_TEXTURES),
    );
    capabilities.set(
        Capabilities::MULTISAMPLED_SHADING,
        downlevel.contains(wgpu::DownlevelFlags::MULTISAMPLED_SHADING),
    );
    capabilities
}

/// An error message with its source chain.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let _ = write!(message, ": {inner}");
        source = inner.source();
    }
    message
}

/// Prefixes `message` with the authored line and column `location` points
/// at. Locations inside the generated prelude are left out.
fn at_authored_line(message: impl fmt::Display, location: Option<SourceLocation>, lowered: &LoweredSource) -> String {
    let authored = location.and_then(|location| {
        let line = (location.line_number as usize).checked_sub(lowered.prelude_lines)?;
        (line > 0).then_some((line, location.line_position))
    });
    match authored {
        Some((line, column)) => format!("line {line}:{column}: {message}"),
        None => message.to_string(),
    }
}

/// Parses and validates lowered GLSL against `capabilities`, then writes it
/// out as WGSL. Error messages use the author's line numbers.
pub fn translate(lowered: &LoweredSource, capabilities: Capabilities) -> Result<Translation> {
    let mut frontend = Frontend::default();
    let options = Options::from(ShaderStage::Fragment);
    let module = frontend.parse(&options, &lowered.glsl).map_err(|e| {
        let errors: Vec<_> = e
            .errors
            .iter()
            .map(|err| {
                let location = err.meta.is_defined().then(|| err.meta.location(&lowered.glsl));
                at_authored_line(&err.kind, location, lowered)
            })
            .collect();
        anyhow!("GLSL parse error: {}", errors.join("; "))
    })?;

    let mut validator = Validator::new(ValidationFlags::all(), capabilities);
    let info = validator.validate(&module).map_err(|e| {
        let message = error_chain(e.as_inner());
        anyhow!("shader validation error: {}", at_authored_line(message, e.location(&lowered.glsl), lowered))
    })?;
    if module.entry_points.is_empty() {
        return Err(anyhow!("shader has no entry point"));
    }

    let reflection = reflect_module(&module, &info, lowered);
    let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| anyhow!("WGSL generation error: {:?}", e))?;
    Ok(Translation { wgsl, reflection })
}

fn find_block(module: &Module, type_name: &str) -> Option<Handle<GlobalVariable>> {
    module
        .global_variables
        .iter()
        .find(|(_, var)| module.types[var.ty].name.as_deref() == Some(type_name))
        .map(|(handle, _)| handle)
}

fn find_global(module: &Module, name: &str) -> Option<Handle<GlobalVariable>> {
    module
        .global_variables
        .iter()
        .find(|(_, var)| var.name.as_deref() == Some(name))
        .map(|(handle, _)| handle)
}

/// Member indices of `block` that any function reads.
fn accessed_members(module: &Module, block: Handle<GlobalVariable>) -> HashSet<u32> {
    let functions = module
        .functions
        .iter()
        .map(|(_, function)| function)
        .chain(module.entry_points.iter().map(|entry| &entry.function));

    let mut members = HashSet::new();
    for function in functions {
        for (_, expression) in function.expressions.iter() {
            if let Expression::AccessIndex { base, index } = *expression {
                if matches!(function.expressions[base], Expression::GlobalVariable(global) if global == block) {
                    members.insert(index);
                }
            }
        }
    }
    members
}

/// Active members of a uniform block as `(name, offset, scalar type)`, plus
/// the block's byte span.
fn active_members(
    module: &Module,
    info: &ModuleInfo,
    type_name: &str,
) -> (Vec<(String, u32, Option<ScalarType>)>, u32) {
    let Some(block) = find_block(module, type_name) else {
        return (Vec::new(), 0);
    };
    let TypeInner::Struct { ref members, span } = module.types[module.global_variables[block].ty].inner else {
        return (Vec::new(), 0);
    };
    if info.get_entry_point(0)[block].is_empty() {
        return (Vec::new(), span);
    }

    let accessed = accessed_members(module, block);
    let active = members
        .iter()
        .enumerate()
        .filter(|(index, _)| accessed.contains(&(*index as u32)))
        .filter_map(|(_, member)| {
            let name = member.name.clone()?;
            let ty = match module.types[member.ty].inner {
                TypeInner::Scalar(scalar) => match scalar.kind {
                    ScalarKind::Sint => Some(ScalarType::Int),
                    ScalarKind::Float => Some(ScalarType::Float),
                    _ => None,
                },
                _ => None,
            };
            Some((name, member.offset, ty))
        })
        .collect();
    (active, span)
}

fn texture_is_active(module: &Module, info: &ModuleInfo, name: &str) -> bool {
    find_global(module, &texture_global(name)).is_some_and(|texture| !info.get_entry_point(0)[texture].is_empty())
}

/// Reads locations, block layout and texture usage out of a validated module.
pub fn reflect_module(module: &Module, info: &ModuleInfo, lowered: &LoweredSource) -> ProgramReflection {
    let mut reflection = ProgramReflection {
        texture_units: lowered.texture_units(),
        ..ProgramReflection::default()
    };

    let (globals, _) = active_members(module, info, GLOBALS_BLOCK);
    for (name, offset, _) in globals {
        match name.as_str() {
            RESOLUTION_UNIFORM => reflection.globals.resolution = Some(offset),
            TIME_UNIFORM => reflection.globals.time = Some(offset),
            _ => {}
        }
    }
    if texture_is_active(module, info, PREVIOUS_LAYER_UNIFORM) {
        reflection.globals.previous_layer = Some(0);
    }

    let (params, span) = active_members(module, info, PARAMS_BLOCK);
    reflection.params_size = u64::from(span).max(1).next_multiple_of(16);
    for (name, offset, ty) in params {
        if let Some(ty) = ty {
            reflection.scalars.insert(name, UniformLocation::Scalar { offset, ty });
        }
    }

    for (name, unit) in &lowered.samplers {
        if texture_is_active(module, info, name) {
            reflection.textures.insert(name.clone(), *unit);
        }
    }
    reflection
}

/// Rejects programs that bind more textures than one shader stage may use.
fn check_limits(reflection: &ProgramReflection, limits: &wgpu::Limits) -> Result<()> {
    let units = reflection.texture_units;
    let allowed = limits
        .max_sampled_textures_per_shader_stage
        .min(limits.max_samplers_per_shader_stage);
    if units > allowed {
        bail!("layer binds {units} textures, the device allows {allowed} per shader stage");
    }
    Ok(())
}

fn buffer_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn unit_entries(unit: u32) -> [wgpu::BindGroupLayoutEntry; 2] {
    [
        wgpu::BindGroupLayoutEntry {
            binding: unit * 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: unit * 2 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ]
}

/// A linked layer program: pipeline plus the layouts its bind groups use.
///
/// Group 0 holds the globals (binding 0) and parameter (binding 1) buffers.
/// Group 1 holds one texture/sampler pair per unit.
pub struct LayerProgram {
    pub pipeline: wgpu::RenderPipeline,
    pub uniform_layout: wgpu::BindGroupLayout,
    pub texture_layout: wgpu::BindGroupLayout,
    pub reflection: ProgramReflection,
    /// False when this is the fallback for a failed compile.
    pub linked: bool,
}

impl LayerProgram {
    /// Links a lowered fragment. Failures are logged and yield the fallback
    /// program instead.
    pub fn link(gpu: &GpuContext, quad: &FullscreenQuad, lowered: &LoweredSource, label: &str) -> Self {
        let translated = translate(lowered, device_capabilities(gpu)).and_then(|translation| {
            check_limits(&translation.reflection, &gpu.device.limits())?;
            Ok(translation)
        });
        let translation = match translated {
            Ok(translation) => translation,
            Err(err) => {
                error!(layer = label, "failed to compile layer: {err:#}");
                return Self::fallback(gpu, quad, label);
            }
        };
        debug!(
            layer = label,
            texture_units = translation.reflection.texture_units,
            params_size = translation.reflection.params_size,
            "linked layer program"
        );

        // Whatever naga accepted the device may still reject.
        let scope = gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let program = Self::build(gpu, quad, Cow::Owned(translation.wgsl), "main", translation.reflection, label, true);
        match pollster::block_on(scope.pop()) {
            None => program,
            Some(err) => {
                error!(layer = label, "device rejected layer program: {err}");
                Self::fallback(gpu, quad, label)
            }
        }
    }

    /// A program that fills its target with the sentinel color.
    pub fn fallback(gpu: &GpuContext, quad: &FullscreenQuad, label: &str) -> Self {
        Self::build(
            gpu,
            quad,
            Cow::Borrowed(FALLBACK_FRAGMENT_SHADER),
            "fs_main",
            ProgramReflection::default(),
            label,
            false,
        )
    }

    fn build(
        gpu: &GpuContext,
        quad: &FullscreenQuad,
        fragment_wgsl: Cow<'static, str>,
        entry_point: &str,
        reflection: ProgramReflection,
        label: &str,
        linked: bool,
    ) -> Self {
        let device = &gpu.device;
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{label} Fragment Shader")),
            source: wgpu::ShaderSource::Wgsl(fragment_wgsl),
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label} Uniform Layout")),
            entries: &[buffer_entry(0), buffer_entry(1)],
        });
        let texture_entries: Vec<_> = (0..reflection.texture_units).flat_map(unit_entries).collect();
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label} Texture Layout")),
            entries: &texture_entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label} Pipeline Layout")),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("{label} Pipeline")),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &quad.vertex_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(entry_point),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: FullscreenQuad::primitive(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        Self {
            pipeline,
            uniform_layout,
            texture_layout,
            reflection,
            linked,
        }
    }
}
