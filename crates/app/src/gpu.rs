//! Offscreen shader rendering with wgpu.
//!
//! The CLI has no window, so frames are drawn into a texture the size of the
//! drawing buffer. The orb's GL-style calls map onto one render pipeline per
//! linked program: attribute and uniform names resolve through the WGSL
//! layout tables, uniform writes collect in a staging block that is uploaded
//! right before each draw.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use voice_orb_core::{
    host::{BufferId, ListenerId, ProgramId, ShaderId, UniformLocation},
    render::shader::{
        UV_OFFSET, VERTEX_STRIDE, WGSL_ATTRIBUTE_LOCATIONS, WGSL_UNIFORM_BLOCK_SIZE,
        WGSL_UNIFORM_OFFSETS,
    },
    GraphicsContext, GraphicsHost, Result, ShaderDialect, ShaderStage, SurfaceSize,
};
use wgpu::util::DeviceExt;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const UNIFORM_WORDS: usize = WGSL_UNIFORM_BLOCK_SIZE as usize / 4;

/// Graphics host backed by the first adapter wgpu can find.
pub struct WgpuGraphicsHost {
    instance: wgpu::Instance,
    size: SurfaceSize,
    next_listener: u64,
}

impl WgpuGraphicsHost {
    pub fn new(size: SurfaceSize) -> Self {
        Self {
            instance: wgpu::Instance::new(&wgpu::InstanceDescriptor::default()),
            size,
            next_listener: 0,
        }
    }
}

impl GraphicsHost for WgpuGraphicsHost {
    type Context = WgpuContext;

    fn surface_size(&self) -> SurfaceSize {
        self.size
    }

    fn create_context(&mut self, width: u32, height: u32) -> Option<WgpuContext> {
        let adapter = match pollster::block_on(self.instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        )) {
            Ok(adapter) => adapter,
            Err(err) => {
                tracing::warn!(%err, "no GPU adapter available");
                return None;
            }
        };
        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "using GPU adapter");

        let (device, queue) = match pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("voice orb device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::default(),
            },
        )) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "failed to create GPU device");
                return None;
            }
        };

        Some(WgpuContext::new(device, queue, width, height))
    }

    fn add_resize_listener(&mut self) -> Result<ListenerId> {
        // Offscreen targets are only resized by the coordinator.
        self.next_listener += 1;
        Ok(ListenerId(self.next_listener))
    }

    fn remove_resize_listener(&mut self, listener: ListenerId) {
        tracing::trace!(?listener, "resize listener removed");
    }
}

struct Program {
    pipeline: wgpu::RenderPipeline,
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

struct RenderTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl RenderTarget {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("orb target"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

/// A wgpu device plus the objects the renderer created on it.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    target: RenderTarget,
    next_id: u32,
    shaders: HashMap<ShaderId, (ShaderStage, wgpu::ShaderModule)>,
    programs: HashMap<ProgramId, Program>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    current: Option<ProgramId>,
    vertex_buffer: Option<BufferId>,
    layout_error: Option<String>,
    staging: [f32; UNIFORM_WORDS],
    lost: Arc<AtomicBool>,
}

impl WgpuContext {
    fn new(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            flag.store(true, Ordering::Release);
            if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
                tracing::debug!("GPU device released");
            } else {
                tracing::warn!(?reason, %message, "GPU device lost");
            }
        });
        let target = RenderTarget::new(&device, width, height);

        Self {
            device,
            queue,
            target,
            next_id: 1,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            current: None,
            vertex_buffer: None,
            layout_error: None,
            staging: [0.0; UNIFORM_WORDS],
            lost,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Runs `create` inside a validation error scope.
    fn validated<T>(
        &self,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> std::result::Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    fn module(
        &self,
        shader: ShaderId,
        stage: ShaderStage,
    ) -> std::result::Result<&wgpu::ShaderModule, String> {
        match self.shaders.get(&shader) {
            Some((compiled, module)) if *compiled == stage => Ok(module),
            Some((compiled, _)) => Err(format!("{shader:?} is a {compiled} shader, not {stage}")),
            None => Err(format!("{shader:?} does not exist")),
        }
    }

    fn write_uniform(&mut self, location: UniformLocation, values: &[f32]) {
        let start = location.0 as usize;
        match self.staging.get_mut(start..start + values.len()) {
            Some(slot) => slot.copy_from_slice(values),
            None => tracing::warn!(?location, "uniform write outside the uniform block"),
        }
    }

    fn encode_draw(&self, program: &Program, vertices: &wgpu::Buffer, vertex_count: u32) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("orb frame"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("orb pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &program.bind_group, &[]);
            pass.set_vertex_buffer(0, vertices.slice(..));
            pass.draw(0..vertex_count, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl GraphicsContext for WgpuContext {
    fn shader_dialect(&self) -> ShaderDialect {
        ShaderDialect::Wgsl
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
    ) -> std::result::Result<ShaderId, String> {
        let module = self.validated(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("orb shader"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_string())),
            })
        })?;
        let id = ShaderId(self.next_id());
        self.shaders.insert(id, (stage, module));
        Ok(id)
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.shaders.remove(&shader);
    }

    fn link_program(
        &mut self,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> std::result::Result<ProgramId, String> {
        let vertex = self.module(vertex, ShaderStage::Vertex)?;
        let fragment = self.module(fragment, ShaderStage::Fragment)?;

        let attributes = WGSL_ATTRIBUTE_LOCATIONS.map(|(_, location)| wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: u64::from(attribute_offset(location)),
            shader_location: location,
        });

        let program = self.validated(|device| {
            let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("orb uniforms layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("orb pipeline layout"),
                bind_group_layouts: &[&uniform_layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("orb pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: vertex,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: u64::from(VERTEX_STRIDE),
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: fragment,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache: None,
            });
            let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("orb uniforms"),
                size: u64::from(WGSL_UNIFORM_BLOCK_SIZE),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("orb uniforms"),
                layout: &uniform_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                }],
            });
            Program {
                pipeline,
                uniforms,
                bind_group,
            }
        })?;

        let id = ProgramId(self.next_id());
        self.programs.insert(id, program);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if let Some(program) = self.programs.remove(&program) {
            program.uniforms.destroy();
        }
        if self.current == Some(program) {
            self.current = None;
        }
    }

    fn attribute_location(&self, program: ProgramId, name: &str) -> Option<u32> {
        if !self.programs.contains_key(&program) {
            return None;
        }
        attribute_slot(name)
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        if !self.programs.contains_key(&program) {
            return None;
        }
        uniform_slot(name)
    }

    fn create_static_buffer(&mut self, data: &[f32]) -> std::result::Result<BufferId, String> {
        let buffer = self.validated(|device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("orb vertices"),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::VERTEX,
            })
        })?;
        let id = BufferId(self.next_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(removed) = self.buffers.remove(&buffer) {
            removed.destroy();
        }
        if self.vertex_buffer == Some(buffer) {
            self.vertex_buffer = None;
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        let current = self.target.texture.size();
        if (current.width, current.height) == (width.max(1), height.max(1)) {
            return;
        }
        self.target.texture.destroy();
        self.target = RenderTarget::new(&self.device, width, height);
    }

    fn use_program(&mut self, program: ProgramId) {
        self.current = Some(program);
    }

    fn set_uniform_f32(&mut self, location: UniformLocation, value: f32) {
        self.write_uniform(location, &[value]);
    }

    fn set_uniform_vec2(&mut self, location: UniformLocation, value: [f32; 2]) {
        self.write_uniform(location, &value);
    }

    fn set_uniform_vec3(&mut self, location: UniformLocation, value: [f32; 3]) {
        self.write_uniform(location, &value);
    }

    fn bind_attribute(
        &mut self,
        buffer: BufferId,
        location: u32,
        components: u32,
        stride: u32,
        offset: u32,
    ) {
        // The vertex layout is baked into the pipeline at link time.
        let expected = attribute_offset(location);
        if components != 2 || stride != VERTEX_STRIDE || offset != expected {
            self.layout_error = Some(format!(
                "attribute {location} bound as {components} floats at {offset}/{stride}, \
                 pipeline expects 2 at {expected}/{VERTEX_STRIDE}"
            ));
        }
        self.vertex_buffer = Some(buffer);
    }

    fn draw_triangles(&mut self, vertex_count: u32) -> std::result::Result<(), String> {
        if self.is_context_lost() {
            return Err("GPU device lost".to_string());
        }
        if let Some(err) = self.layout_error.take() {
            return Err(err);
        }
        let program = self
            .current
            .and_then(|id| self.programs.get(&id))
            .ok_or_else(|| "no program in use".to_string())?;
        let vertices = self
            .vertex_buffer
            .and_then(|id| self.buffers.get(&id))
            .ok_or_else(|| "no vertex buffer bound".to_string())?;

        self.queue
            .write_buffer(&program.uniforms, 0, bytemuck::cast_slice(&self.staging));
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.encode_draw(program, vertices, vertex_count);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(()),
        }
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn lose_context(&mut self) -> bool {
        self.device.destroy();
        self.lost.store(true, Ordering::Release);
        true
    }
}

fn attribute_slot(name: &str) -> Option<u32> {
    WGSL_ATTRIBUTE_LOCATIONS
        .iter()
        .find(|(attribute, _)| *attribute == name)
        .map(|&(_, location)| location)
}

/// Byte offset of an attribute inside one interleaved vertex.
fn attribute_offset(location: u32) -> u32 {
    if attribute_slot("uv") == Some(location) {
        UV_OFFSET
    } else {
        0
    }
}

/// Uniform locations are word indices into the staging block.
fn uniform_slot(name: &str) -> Option<UniformLocation> {
    WGSL_UNIFORM_OFFSETS
        .iter()
        .find(|(uniform, _)| *uniform == name)
        .map(|&(_, offset)| UniformLocation(offset / 4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_orb_core::{GpuInitError, RenderConfig, ShaderRenderer};

    #[test]
    fn uniform_slots_fit_the_staging_block() {
        assert_eq!(uniform_slot("uColor"), Some(UniformLocation(0)));
        assert_eq!(uniform_slot("uTime"), Some(UniformLocation(3)));
        assert_eq!(uniform_slot("uResolution"), Some(UniformLocation(4)));
        assert_eq!(uniform_slot("uSpeed"), Some(UniformLocation(7)));
        assert_eq!(uniform_slot("uGlow"), None);
        assert_eq!(attribute_slot("uv"), Some(1));
        assert_eq!(attribute_slot("normal"), None);
        assert_eq!(attribute_offset(1), UV_OFFSET);
        assert_eq!(attribute_offset(0), 0);
    }

    #[test]
    fn draws_offscreen_when_an_adapter_exists() {
        let mut host = WgpuGraphicsHost::new(SurfaceSize::new(64.0, 48.0, 1.0));
        let mut renderer = match ShaderRenderer::init(&mut host, RenderConfig::default()) {
            Ok(renderer) => renderer,
            // Machines without any adapter, software ones included.
            Err(GpuInitError::ContextUnavailable) => return,
            Err(err) => panic!("pipeline failed on a real device: {err}"),
        };

        for level in [0.0, 0.5, 1.0] {
            renderer.render_frame(level).unwrap();
        }
        renderer.resize(SurfaceSize::new(32.0, 32.0, 1.0));
        renderer.render_frame(0.3).unwrap();
        assert_eq!(renderer.frames_drawn(), 4);

        renderer.teardown();
        assert!(!renderer.is_active());
    }
}
