//! Core library for the voice orb.
//!
//! Microphone loudness flows through two smoothing stages into an animated
//! orb. [`LevelExtractor`] turns frequency data into a level in `[0, 1]`,
//! [`RenderLoopController`] smooths it again at display rate, and either the
//! [`ShaderRenderer`] or the [`FallbackRenderer`] draws it.
//! [`LifecycleCoordinator`] owns all of them and pairs every acquired
//! resource with its release.
//!
//! Platform services (microphone, audio graph, GPU context, frame callbacks)
//! are reached through the traits in [`host`]. The [`headless`] module
//! provides in-memory implementations of each.

pub mod analysis;
pub mod config;
pub mod controller;
pub mod error;
pub mod headless;
pub mod host;
pub mod level;
pub mod lifecycle;
pub mod render;
pub mod smoothing;

pub use analysis::{PcmGraph, SampleTap, SpectrumAnalyser, TapAnalyser, TappedStream};
pub use config::{FallbackConfig, LevelConfig, OrbConfig, RenderConfig};
pub use controller::RenderLoopController;
pub use error::{GpuInitError, OrbError, Result, ShaderStage};
pub use host::{
    AnalyserSettings, AudioGraph, AudioHost, FrameLoop, FrameScheduler, FrameToken,
    FrequencyAnalyser, GraphicsContext, GraphicsHost, MediaStream, ShaderDialect, SurfaceSize,
};
pub use level::{LevelExtractor, LevelReader};
pub use lifecycle::{LifecycleCoordinator, Mode, OrbFrame, OrbStatus};
pub use render::{FallbackRenderer, FallbackStyle, RenderFrameParams, ShaderRenderer};
pub use smoothing::ExponentialSmoother;
