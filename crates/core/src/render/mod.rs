//! Orb rendering: the shader path, the gradient fallback and the values both
//! derive from the UI level.

pub mod fallback;
pub mod params;
pub mod pattern;
pub mod shader;

pub use fallback::{FallbackRenderer, FallbackStyle};
pub use params::RenderFrameParams;
pub use shader::{GraphicsResources, ShaderRenderer};
