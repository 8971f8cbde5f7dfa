//! GPU side of rendering: context, quad, targets and the frame traversal.

mod copy;
mod frame;
mod gpu_context;
mod quad;
mod target;

pub use copy::CopyPass;
pub use frame::{schedule, DrawStep, FrameInputs, FrameRenderer, SENTINEL_COLOR};
pub use gpu_context::GpuContext;
pub use quad::{FullscreenQuad, QuadVertex};
pub use target::{PingPong, RenderTarget, RenderTargets, TARGET_FORMAT};
