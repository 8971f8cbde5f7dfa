//! Layerstack: compiles trees of GLSL shader layers and renders them through
//! a pair of ping-pong render targets.
//!
//! A tree is compiled once with [`Visualizer::compile`]; every later
//! [`Visualizer::render`] draws each shader layer into one target while
//! sampling the other, then copies the last written target to the output.

pub mod compile;
pub mod error;
pub mod input;
pub mod output;
pub mod render;
pub mod shader;
pub mod texture;
pub mod tree;
pub mod tree_watch;
pub mod visualizer;

pub use compile::{CompiledGroup, CompiledNode, CompiledShaderLayer};
pub use error::{RenderError, TreeError, VisualizerError};
pub use input::{InputSample, InputSource, NoInput};
pub use render::GpuContext;
pub use texture::{ImageTextureLoader, TextureHandle, TextureLoader};
pub use tree::{load_tree, parse_tree, AuthoredGroup, AuthoredNode, Group, LayerMeta, Node, ShaderLayer};
pub use visualizer::{Visualizer, VisualizerConfig};
