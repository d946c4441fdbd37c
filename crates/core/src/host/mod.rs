//! Capabilities the orb pipeline needs from the environment that embeds it.
//!
//! The core never talks to an audio API, a GPU API or an event loop
//! directly. Hosts implement these traits; [`crate::headless`] provides
//! in-memory implementations used by tests and by the command line host.

use crate::{error::ShaderStage, Result};

/// A live microphone stream made of one or more tracks.
pub trait MediaStream {
    /// Number of tracks that are still delivering audio.
    fn live_tracks(&self) -> usize;

    /// Stops every track. Calling it again is a no-op.
    fn stop_tracks(&mut self);
}

/// Parameters for a frequency-analysis node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyserSettings {
    pub fft_size: usize,
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

/// A node that reports per-bin frequency magnitudes for the most recent
/// analysis window.
pub trait FrequencyAnalyser {
    fn frequency_bin_count(&self) -> usize;

    /// Fills `out` with byte magnitudes (0..=255). Extra slots are left
    /// untouched when `out` is longer than the bin count.
    fn byte_frequency_data(&mut self, out: &mut [u8]);

    fn disconnect(&mut self);
}

/// An audio processing context that can route a stream into an analyser.
pub trait AudioGraph {
    type Stream: MediaStream;
    type Analyser: FrequencyAnalyser;

    fn connect_analyser(
        &mut self,
        stream: &Self::Stream,
        settings: &AnalyserSettings,
    ) -> Result<Self::Analyser>;

    /// Closes the context. Calling it again is a no-op.
    fn close(&mut self);
}

/// Entry point to the host's audio stack.
pub trait AudioHost {
    type Stream: MediaStream;
    type Graph: AudioGraph<Stream = Self::Stream>;

    /// Asks for microphone access. Denial surfaces as
    /// [`crate::OrbError::Permission`], a missing device as
    /// [`crate::OrbError::Device`].
    fn request_microphone(&mut self) -> Result<Self::Stream>;

    fn open_graph(&mut self) -> Result<Self::Graph>;
}

/// CSS-pixel size of the host surface plus its device pixel ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceSize {
    pub width: f32,
    pub height: f32,
    pub device_pixel_ratio: f32,
}

impl SurfaceSize {
    pub fn new(width: f32, height: f32, device_pixel_ratio: f32) -> Self {
        Self {
            width,
            height,
            device_pixel_ratio,
        }
    }

    /// Drawing buffer dimensions in physical pixels, never zero.
    pub fn buffer_dimensions(&self) -> (u32, u32) {
        let ratio = if self.device_pixel_ratio.is_finite() && self.device_pixel_ratio > 0.0 {
            self.device_pixel_ratio
        } else {
            1.0
        };
        let scale = |css: f32| (css.max(0.0) * ratio).round().max(1.0) as u32;
        (scale(self.width), scale(self.height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Source language a [`GraphicsContext`] compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShaderDialect {
    /// GLSL ES 1.0 with named attributes and uniforms.
    #[default]
    Glsl,
    /// WGSL with `vs_main`/`fs_main` entry points and one uniform block.
    Wgsl,
}

/// A GL-style drawing context bound to the host surface.
///
/// Fallible calls report the driver's message as a plain string; the
/// renderer decides which pipeline stage it belongs to.
pub trait GraphicsContext {
    fn shader_dialect(&self) -> ShaderDialect {
        ShaderDialect::Glsl
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
    ) -> std::result::Result<ShaderId, String>;
    fn delete_shader(&mut self, shader: ShaderId);

    fn link_program(
        &mut self,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> std::result::Result<ProgramId, String>;
    fn delete_program(&mut self, program: ProgramId);

    fn attribute_location(&self, program: ProgramId, name: &str) -> Option<u32>;
    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation>;

    /// Uploads `data` once into a buffer that is never rewritten.
    fn create_static_buffer(&mut self, data: &[f32]) -> std::result::Result<BufferId, String>;
    fn delete_buffer(&mut self, buffer: BufferId);

    /// Resizes the drawing buffer and the viewport.
    fn resize(&mut self, width: u32, height: u32);

    fn use_program(&mut self, program: ProgramId);
    fn set_uniform_f32(&mut self, location: UniformLocation, value: f32);
    fn set_uniform_vec2(&mut self, location: UniformLocation, value: [f32; 2]);
    fn set_uniform_vec3(&mut self, location: UniformLocation, value: [f32; 3]);
    fn bind_attribute(
        &mut self,
        buffer: BufferId,
        location: u32,
        components: u32,
        stride: u32,
        offset: u32,
    );
    fn draw_triangles(&mut self, vertex_count: u32) -> std::result::Result<(), String>;

    fn is_context_lost(&self) -> bool;

    /// Releases GPU memory immediately when the context supports an explicit
    /// loss request. Returns `false` when it does not.
    fn lose_context(&mut self) -> bool;
}

/// The host surface that the orb draws into.
pub trait GraphicsHost {
    type Context: GraphicsContext;

    fn surface_size(&self) -> SurfaceSize;

    /// Creates a drawing context with a buffer of the given physical size, or
    /// `None` when the platform cannot provide one.
    fn create_context(&mut self, width: u32, height: u32) -> Option<Self::Context>;

    /// Starts delivering resize notifications. The host forwards them to
    /// [`crate::LifecycleCoordinator::on_resize`].
    fn add_resize_listener(&mut self) -> Result<ListenerId>;
    fn remove_resize_listener(&mut self, listener: ListenerId);
}

/// Which periodic loop a frame callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLoop {
    Sampling,
    Render,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken(pub u64);

/// "Run once before the next repaint" scheduling.
///
/// A requested frame fires once; loops re-request from inside their own
/// callback. The host reports a fired token through
/// [`crate::LifecycleCoordinator::on_animation_frame`].
pub trait FrameScheduler {
    fn request_frame(&mut self, frame_loop: FrameLoop) -> FrameToken;
    fn cancel_frame(&mut self, token: FrameToken);
}
