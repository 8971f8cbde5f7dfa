//! Shader layer compilation: source assembly, linking and uniform reflection.

pub mod metadata;
pub mod program;
pub mod reflect;
pub mod source;

pub use metadata::{TextureSource, UniformHints};
pub use program::{device_capabilities, GlobalLocations, LayerProgram, ProgramReflection};
pub use reflect::{
    reflect_uniforms, scan_declarations, scan_uniform_lines, LocationResolver, ScalarType, UniformDeclaration,
    UniformDescriptor, UniformKind, UniformLine, UniformLocation, UniformValue,
};
pub use source::{assemble, lower, LoweredSource};
