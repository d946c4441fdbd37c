use std::fmt;

use crate::{
    config::RenderConfig,
    error::{GpuInitError, ShaderStage},
    host::{
        BufferId, GraphicsContext, GraphicsHost, ProgramId, ShaderDialect, ShaderId, SurfaceSize,
        UniformLocation,
    },
    render::RenderFrameParams,
    OrbError, Result,
};

pub const VERTEX_SHADER: &str = include_str!("shaders/orb.vert");
pub const FRAGMENT_SHADER: &str = include_str!("shaders/orb.frag");
pub const WGSL_VERTEX_SHADER: &str = include_str!("shaders/orb.vert.wgsl");
pub const WGSL_FRAGMENT_SHADER: &str = include_str!("shaders/orb.frag.wgsl");

/// Vertex inputs of the WGSL program by attribute name.
pub const WGSL_ATTRIBUTE_LOCATIONS: [(&str, u32); 2] = [(ATTR_POSITION, 0), (ATTR_UV, 1)];

/// Byte offsets of the GLSL uniform names inside the WGSL `OrbUniforms`
/// block at `@group(0) @binding(0)`.
pub const WGSL_UNIFORM_OFFSETS: [(&str, u32); 5] = [
    ("uColor", 0),
    ("uTime", 12),
    ("uResolution", 16),
    ("uAmplitude", 24),
    ("uSpeed", 28),
];
pub const WGSL_UNIFORM_BLOCK_SIZE: u32 = 32;

const ATTR_POSITION: &str = "position";
const ATTR_UV: &str = "uv";

/// One triangle that overhangs the viewport, interleaved as `x, y, u, v`.
/// The visible square lands on uv [0, 1]².
const FULLSCREEN_TRIANGLE: [f32; 12] = [
    -1.0, -1.0, 0.0, 0.0, //
    3.0, -1.0, 2.0, 0.0, //
    -1.0, 3.0, 0.0, 2.0,
];
pub const VERTEX_STRIDE: u32 = 4 * 4;
pub const UV_OFFSET: u32 = 2 * 4;

/// Vertex and fragment sources for `dialect`.
pub fn shader_sources(dialect: ShaderDialect) -> (&'static str, &'static str) {
    match dialect {
        ShaderDialect::Glsl => (VERTEX_SHADER, FRAGMENT_SHADER),
        ShaderDialect::Wgsl => (WGSL_VERTEX_SHADER, WGSL_FRAGMENT_SHADER),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLocations {
    pub position: u32,
    pub uv: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocations {
    pub time: UniformLocation,
    pub color: UniformLocation,
    pub resolution: UniformLocation,
    pub amplitude: UniformLocation,
    pub speed: UniformLocation,
}

/// GPU objects owned by one activation of the shader renderer.
pub struct GraphicsResources<C: GraphicsContext> {
    pub context: C,
    pub program: ProgramId,
    pub vertex_buffer: BufferId,
    pub attributes: AttributeLocations,
    pub uniforms: UniformLocations,
}

/// Draws the orb through the host's GPU context.
///
/// Initialisation either completes every step or releases whatever it
/// created and reports the failing stage; there is no half-initialised
/// renderer.
pub struct ShaderRenderer<C: GraphicsContext> {
    resources: Option<GraphicsResources<C>>,
    config: RenderConfig,
    time: f32,
    buffer_size: (u32, u32),
    frames_drawn: u64,
}

impl<C: GraphicsContext> ShaderRenderer<C> {
    pub fn init<H>(host: &mut H, config: RenderConfig) -> std::result::Result<Self, GpuInitError>
    where
        H: GraphicsHost<Context = C>,
    {
        let buffer_size = host.surface_size().buffer_dimensions();
        let mut context = host
            .create_context(buffer_size.0, buffer_size.1)
            .ok_or(GpuInitError::ContextUnavailable)?;

        let resources = match build_pipeline(&mut context) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                context.lose_context();
                return Err(err);
            }
        };
        let (program, vertex_buffer, attributes, uniforms) = resources;
        context.resize(buffer_size.0, buffer_size.1);

        tracing::debug!(width = buffer_size.0, height = buffer_size.1, "shader renderer ready");
        Ok(Self {
            resources: Some(GraphicsResources {
                context,
                program,
                vertex_buffer,
                attributes,
                uniforms,
            }),
            config,
            time: 0.0,
            buffer_size,
            frames_drawn: 0,
        })
    }

    /// Advances the shader clock, pushes the uniforms for `level` and issues
    /// the single draw call. Any error means the GPU path is no longer usable.
    pub fn render_frame(&mut self, level: f32) -> Result<RenderFrameParams> {
        let resources = self
            .resources
            .as_mut()
            .ok_or_else(|| OrbError::Draw("renderer has been torn down".to_string()))?;
        let context = &mut resources.context;
        if context.is_context_lost() {
            return Err(OrbError::Draw("GPU context lost".to_string()));
        }

        // Fixed step per frame; no wall-clock correction.
        self.time += self.config.time_step;
        let params = RenderFrameParams::from_level(level, &self.config);
        let uniforms = resources.uniforms;
        let attributes = resources.attributes;

        context.use_program(resources.program);
        context.set_uniform_f32(uniforms.time, self.time);
        context.set_uniform_vec3(uniforms.color, self.config.base_color);
        context.set_uniform_vec2(
            uniforms.resolution,
            [self.buffer_size.0 as f32, self.buffer_size.1 as f32],
        );
        context.set_uniform_f32(uniforms.amplitude, params.amplitude);
        context.set_uniform_f32(uniforms.speed, params.speed);
        context.bind_attribute(resources.vertex_buffer, attributes.position, 2, VERTEX_STRIDE, 0);
        context.bind_attribute(resources.vertex_buffer, attributes.uv, 2, VERTEX_STRIDE, UV_OFFSET);
        context.draw_triangles(3).map_err(OrbError::Draw)?;

        self.frames_drawn += 1;
        tracing::trace!(
            time = self.time,
            amplitude = params.amplitude,
            speed = params.speed,
            "drew orb frame"
        );
        Ok(params)
    }

    /// Matches the drawing buffer to a resized surface. The program is left
    /// linked.
    pub fn resize(&mut self, size: SurfaceSize) {
        let dimensions = size.buffer_dimensions();
        if dimensions == self.buffer_size {
            return;
        }
        if let Some(resources) = self.resources.as_mut() {
            resources.context.resize(dimensions.0, dimensions.1);
            self.buffer_size = dimensions;
            tracing::debug!(width = dimensions.0, height = dimensions.1, "resized drawing buffer");
        }
    }

    /// Deletes the GPU objects and asks the context to release its memory
    /// right away. Later calls do nothing.
    pub fn teardown(&mut self) {
        let Some(mut resources) = self.resources.take() else {
            return;
        };
        let context = &mut resources.context;
        context.delete_buffer(resources.vertex_buffer);
        context.delete_program(resources.program);
        let released = context.lose_context();
        tracing::debug!(released, frames = self.frames_drawn, "shader renderer torn down");
    }

    pub fn is_active(&self) -> bool {
        self.resources.is_some()
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn buffer_size(&self) -> (u32, u32) {
        self.buffer_size
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn resources(&self) -> Option<&GraphicsResources<C>> {
        self.resources.as_ref()
    }
}

impl<C: GraphicsContext> Drop for ShaderRenderer<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<C: GraphicsContext> fmt::Debug for ShaderRenderer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderRenderer")
            .field("active", &self.is_active())
            .field("time", &self.time)
            .field("buffer_size", &self.buffer_size)
            .field("frames_drawn", &self.frames_drawn)
            .finish()
    }
}

type Pipeline = (ProgramId, BufferId, AttributeLocations, UniformLocations);
type InitResult<T> = std::result::Result<T, GpuInitError>;

fn build_pipeline<C: GraphicsContext>(context: &mut C) -> InitResult<Pipeline> {
    let (vertex_source, fragment_source) = shader_sources(context.shader_dialect());
    let mut guard = InitGuard::new(context);

    let vertex = guard.compile(ShaderStage::Vertex, vertex_source)?;
    let fragment = guard.compile(ShaderStage::Fragment, fragment_source)?;
    let program = guard.link(vertex, fragment)?;
    guard.release_shaders();

    let attributes = AttributeLocations {
        position: guard.attribute(program, ATTR_POSITION)?,
        uv: guard.attribute(program, ATTR_UV)?,
    };
    let uniforms = UniformLocations {
        time: guard.uniform(program, "uTime")?,
        color: guard.uniform(program, "uColor")?,
        resolution: guard.uniform(program, "uResolution")?,
        amplitude: guard.uniform(program, "uAmplitude")?,
        speed: guard.uniform(program, "uSpeed")?,
    };
    let vertex_buffer = guard.buffer(&FULLSCREEN_TRIANGLE)?;

    guard.commit();
    Ok((program, vertex_buffer, attributes, uniforms))
}

/// Deletes every object created during initialisation unless committed.
struct InitGuard<'a, C: GraphicsContext> {
    context: &'a mut C,
    shaders: Vec<ShaderId>,
    program: Option<ProgramId>,
    buffer: Option<BufferId>,
    committed: bool,
}

impl<'a, C: GraphicsContext> InitGuard<'a, C> {
    fn new(context: &'a mut C) -> Self {
        Self {
            context,
            shaders: Vec::with_capacity(2),
            program: None,
            buffer: None,
            committed: false,
        }
    }

    fn compile(&mut self, stage: ShaderStage, source: &str) -> InitResult<ShaderId> {
        let shader = self
            .context
            .compile_shader(stage, source)
            .map_err(|log| GpuInitError::ShaderCompile { stage, log })?;
        self.shaders.push(shader);
        Ok(shader)
    }

    fn link(&mut self, vertex: ShaderId, fragment: ShaderId) -> InitResult<ProgramId> {
        let program = self
            .context
            .link_program(vertex, fragment)
            .map_err(GpuInitError::ProgramLink)?;
        self.program = Some(program);
        Ok(program)
    }

    fn release_shaders(&mut self) {
        for shader in self.shaders.drain(..) {
            self.context.delete_shader(shader);
        }
    }

    fn attribute(&self, program: ProgramId, name: &str) -> InitResult<u32> {
        self.context
            .attribute_location(program, name)
            .ok_or_else(|| GpuInitError::MissingAttribute(name.to_string()))
    }

    fn uniform(&self, program: ProgramId, name: &str) -> InitResult<UniformLocation> {
        self.context
            .uniform_location(program, name)
            .ok_or_else(|| GpuInitError::MissingUniform(name.to_string()))
    }

    fn buffer(&mut self, data: &[f32]) -> InitResult<BufferId> {
        let buffer = self
            .context
            .create_static_buffer(data)
            .map_err(GpuInitError::Buffer)?;
        self.buffer = Some(buffer);
        Ok(buffer)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<C: GraphicsContext> Drop for InitGuard<'_, C> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.release_shaders();
        if let Some(program) = self.program.take() {
            self.context.delete_program(program);
        }
        if let Some(buffer) = self.buffer.take() {
            self.context.delete_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{GpuFailure, HeadlessGraphicsHost};

    fn host() -> HeadlessGraphicsHost {
        HeadlessGraphicsHost::new(SurfaceSize::new(200.0, 100.0, 2.0))
    }

    #[test]
    fn initialises_with_pixel_ratio_scaled_buffer() {
        let mut host = host();
        let renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();
        assert!(renderer.is_active());
        assert_eq!(renderer.buffer_size(), (400, 200));
        let stats = host.stats();
        assert_eq!(stats.viewport, Some((400, 200)));
        assert_eq!(stats.live_shaders, 0);
        assert_eq!(stats.live_programs, 1);
        assert_eq!(stats.live_buffers, 1);
    }

    #[test]
    fn each_failed_stage_leaves_nothing_behind() {
        let cases = [
            (GpuFailure::Context, "context"),
            (GpuFailure::VertexCompile, "vertex shader"),
            (GpuFailure::FragmentCompile, "fragment shader"),
            (GpuFailure::Link, "link"),
            (GpuFailure::Attribute, "attribute"),
            (GpuFailure::Uniform, "uniform"),
            (GpuFailure::Buffer, "buffer"),
        ];
        for (failure, needle) in cases {
            let mut host = host().with_failure(failure);
            let err = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap_err();
            assert!(err.to_string().contains(needle), "{failure:?}: {err}");

            let stats = host.stats();
            assert_eq!(stats.live_shaders, 0, "{failure:?}");
            assert_eq!(stats.live_programs, 0, "{failure:?}");
            assert_eq!(stats.live_buffers, 0, "{failure:?}");
            assert_eq!(stats.draw_calls, 0, "{failure:?}");
        }
    }

    #[test]
    fn frame_pushes_level_driven_uniforms() {
        let mut host = host();
        let mut renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();

        let quiet = renderer.render_frame(0.0).unwrap();
        let loud = renderer.render_frame(1.0).unwrap();
        assert!((quiet.amplitude - 0.18).abs() < 1e-6);
        assert!((loud.amplitude - 1.88).abs() < 1e-6);

        let stats = host.stats();
        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.last_vertex_count, Some(3));
        assert!((stats.uniform("uTime").unwrap()[0] - 0.032).abs() < 1e-6);
        assert!((stats.uniform("uSpeed").unwrap()[0] - 1.25).abs() < 1e-6);
        assert_eq!(stats.uniform("uResolution").unwrap(), vec![400.0, 200.0]);
        assert!(stats.last_center.is_some());
    }

    #[test]
    fn resize_keeps_program_linked() {
        let mut host = host();
        let mut renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();
        let links = host.stats().links;

        renderer.resize(SurfaceSize::new(300.0, 300.0, 1.0));
        renderer.render_frame(0.5).unwrap();

        let stats = host.stats();
        assert_eq!(stats.links, links);
        assert_eq!(stats.viewport, Some((300, 300)));
        assert_eq!(stats.uniform("uResolution").unwrap(), vec![300.0, 300.0]);
    }

    #[test]
    fn draw_failure_is_reported() {
        let mut host = host().with_draw_failure_at(2);
        let mut renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();
        renderer.render_frame(0.2).unwrap();
        let err = renderer.render_frame(0.2).unwrap_err();
        assert!(matches!(err, OrbError::Draw(_)));
    }

    #[test]
    fn lost_context_fails_the_next_frame() {
        let mut host = host();
        let mut renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();
        host.simulate_context_loss();
        assert!(renderer.render_frame(0.2).is_err());
        assert_eq!(host.stats().draw_calls, 0);
    }

    #[test]
    fn teardown_is_idempotent_and_releases_memory() {
        let mut host = host();
        let mut renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();
        renderer.teardown();
        renderer.teardown();
        drop(renderer);

        let stats = host.stats();
        assert_eq!(stats.context_loss_requests, 1);
        assert_eq!(stats.live_programs, 0);
        assert_eq!(stats.live_buffers, 0);
    }

    #[test]
    fn teardown_without_context_loss_support_deletes_objects() {
        let mut host = host().without_context_loss_support();
        let mut renderer = ShaderRenderer::init(&mut host, RenderConfig::default()).unwrap();
        renderer.render_frame(0.4).unwrap();

        renderer.teardown();
        assert!(!renderer.is_active());
        renderer.teardown();
        drop(renderer);

        let stats = host.stats();
        assert_eq!(stats.context_loss_requests, 0);
        assert_eq!(stats.live_shaders, 0);
        assert_eq!(stats.live_programs, 0);
        assert_eq!(stats.live_buffers, 0);

        let mut context = host.create_context(10, 10).unwrap();
        assert!(!context.lose_context());
        assert!(!context.is_context_lost());
    }

    #[test]
    fn wgsl_sources_match_the_uniform_table() {
        let (vertex, fragment) = shader_sources(ShaderDialect::Wgsl);
        assert!(vertex.contains("fn vs_main"));
        assert!(vertex.contains("@location(1) uv"));
        assert!(fragment.contains("fn fs_main"));
        assert!(fragment.contains("@group(0) @binding(0)"));
        for field in ["color: vec3<f32>", "time: f32", "resolution: vec2<f32>", "speed: f32"] {
            assert!(fragment.contains(field), "missing {field}");
        }

        let offsets: Vec<u32> = WGSL_UNIFORM_OFFSETS.iter().map(|&(_, at)| at).collect();
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(offsets.iter().all(|at| at % 4 == 0 && *at < WGSL_UNIFORM_BLOCK_SIZE));
        assert_eq!(shader_sources(ShaderDialect::default()).0, VERTEX_SHADER);
    }
}
