//! In-memory hosts with no GPU, microphone or display.
//!
//! They record what the pipeline does to them so tests can check resource
//! pairing, and they can be told to fail at any stage. The command line host
//! uses them for dry runs.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    mem,
    rc::Rc,
};

use crate::{
    analysis::{SampleTap, TapAnalyser},
    config::LevelConfig,
    error::ShaderStage,
    host::{
        AnalyserSettings, AudioGraph, AudioHost, BufferId, FrameLoop, FrameScheduler,
        FrameToken, FrequencyAnalyser, GraphicsContext, GraphicsHost, ListenerId, MediaStream,
        ProgramId, ShaderId, SurfaceSize, UniformLocation,
    },
    render::pattern::{self, PatternUniforms},
    OrbError, Result,
};

/// Counters describing what an audio host handed out and got back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub microphone_requests: usize,
    pub graphs_opened: usize,
    pub graphs_closed: usize,
    pub analysers_connected: usize,
    pub analysers_disconnected: usize,
}

impl AudioStats {
    pub fn active_graphs(&self) -> usize {
        self.graphs_opened - self.graphs_closed
    }

    pub fn active_analysers(&self) -> usize {
        self.analysers_connected - self.analysers_disconnected
    }
}

/// Shared view of [`AudioStats`] that stays readable after the host moved.
#[derive(Debug, Clone, Default)]
pub struct AudioStatsHandle(Rc<RefCell<AudioStats>>);

impl AudioStatsHandle {
    pub fn snapshot(&self) -> AudioStats {
        self.0.borrow().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut AudioStats)) {
        apply(&mut self.0.borrow_mut());
    }
}

/// What a headless stream "hears".
///
/// Clones share state, so a test can keep one and change the loudness while
/// the pipeline runs.
#[derive(Debug, Clone)]
pub enum HeadlessSignal {
    /// Every frequency bin reports the same byte magnitude.
    Magnitude(Rc<Cell<u8>>),
    /// Raw samples analysed by the spectrum analyser.
    Pcm(SampleTap),
}

impl HeadlessSignal {
    pub fn magnitude(byte: u8) -> Self {
        Self::Magnitude(Rc::new(Cell::new(byte)))
    }

    /// A magnitude that normalises to `level` under the default level
    /// configuration.
    pub fn normalized(level: f32) -> Self {
        Self::magnitude(byte_for_level(level))
    }

    pub fn silence() -> Self {
        Self::magnitude(0)
    }

    pub fn pcm(tap: SampleTap) -> Self {
        Self::Pcm(tap)
    }

    /// Changes the loudness of a magnitude signal. PCM signals are driven
    /// through their tap instead.
    pub fn set_normalized(&self, level: f32) {
        if let Self::Magnitude(cell) = self {
            cell.set(byte_for_level(level));
        }
    }
}

fn byte_for_level(level: f32) -> u8 {
    let config = LevelConfig::default();
    let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
    (config.noise_floor + level * config.dynamic_range)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Observes a stream's tracks after the stream itself has been handed over.
#[derive(Debug, Clone)]
pub struct TrackMonitor(Rc<Cell<usize>>);

impl TrackMonitor {
    pub fn live_tracks(&self) -> usize {
        self.0.get()
    }
}

#[derive(Debug)]
pub struct HeadlessStream {
    signal: HeadlessSignal,
    live: Rc<Cell<usize>>,
}

impl HeadlessStream {
    pub fn new(signal: HeadlessSignal) -> Self {
        Self::with_tracks(signal, 1)
    }

    pub fn with_tracks(signal: HeadlessSignal, tracks: usize) -> Self {
        Self {
            signal,
            live: Rc::new(Cell::new(tracks)),
        }
    }

    pub fn track_monitor(&self) -> TrackMonitor {
        TrackMonitor(Rc::clone(&self.live))
    }

    pub fn signal(&self) -> &HeadlessSignal {
        &self.signal
    }
}

impl MediaStream for HeadlessStream {
    fn live_tracks(&self) -> usize {
        self.live.get()
    }

    fn stop_tracks(&mut self) {
        self.live.set(0);
    }
}

/// Audio host whose microphone is a [`HeadlessSignal`], or a refusal.
#[derive(Debug)]
pub struct HeadlessAudioHost {
    signal: HeadlessSignal,
    denial: Option<String>,
    stats: AudioStatsHandle,
    granted: Vec<TrackMonitor>,
}

impl HeadlessAudioHost {
    pub fn new(signal: HeadlessSignal) -> Self {
        Self {
            signal,
            denial: None,
            stats: AudioStatsHandle::default(),
            granted: Vec::new(),
        }
    }

    /// A host that refuses microphone access with `message`.
    pub fn denied(message: impl Into<String>) -> Self {
        let mut host = Self::new(HeadlessSignal::silence());
        host.denial = Some(message.into());
        host
    }

    /// Lets later microphone requests succeed with `signal`.
    pub fn grant(&mut self, signal: HeadlessSignal) {
        self.signal = signal;
        self.denial = None;
    }

    pub fn deny(&mut self, message: impl Into<String>) {
        self.denial = Some(message.into());
    }

    pub fn stats_handle(&self) -> AudioStatsHandle {
        self.stats.clone()
    }

    pub fn stats(&self) -> AudioStats {
        self.stats.snapshot()
    }

    /// Track monitors for every stream this host granted.
    pub fn granted_streams(&self) -> &[TrackMonitor] {
        &self.granted
    }
}

impl AudioHost for HeadlessAudioHost {
    type Stream = HeadlessStream;
    type Graph = HeadlessGraph;

    fn request_microphone(&mut self) -> Result<HeadlessStream> {
        self.stats.update(|stats| stats.microphone_requests += 1);
        if let Some(message) = &self.denial {
            return Err(OrbError::Permission(message.clone()));
        }
        let stream = HeadlessStream::new(self.signal.clone());
        self.granted.push(stream.track_monitor());
        Ok(stream)
    }

    fn open_graph(&mut self) -> Result<HeadlessGraph> {
        self.stats.update(|stats| stats.graphs_opened += 1);
        Ok(HeadlessGraph {
            stats: self.stats.clone(),
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct HeadlessGraph {
    stats: AudioStatsHandle,
    closed: bool,
}

impl AudioGraph for HeadlessGraph {
    type Stream = HeadlessStream;
    type Analyser = HeadlessAnalyser;

    fn connect_analyser(
        &mut self,
        stream: &HeadlessStream,
        settings: &AnalyserSettings,
    ) -> Result<HeadlessAnalyser> {
        if self.closed {
            return Err(OrbError::msg("audio graph is closed"));
        }
        let source = match stream.signal() {
            HeadlessSignal::Magnitude(cell) => AnalyserSource::Fixed {
                magnitude: Rc::clone(cell),
                bins: settings.fft_size / 2,
            },
            HeadlessSignal::Pcm(tap) => {
                AnalyserSource::Spectrum(TapAnalyser::new(tap.clone(), *settings))
            }
        };
        self.stats.update(|stats| stats.analysers_connected += 1);
        Ok(HeadlessAnalyser {
            source,
            stats: self.stats.clone(),
            connected: true,
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.update(|stats| stats.graphs_closed += 1);
        }
    }
}

#[derive(Debug)]
enum AnalyserSource {
    Fixed { magnitude: Rc<Cell<u8>>, bins: usize },
    Spectrum(TapAnalyser),
}

#[derive(Debug)]
pub struct HeadlessAnalyser {
    source: AnalyserSource,
    stats: AudioStatsHandle,
    connected: bool,
}

impl FrequencyAnalyser for HeadlessAnalyser {
    fn frequency_bin_count(&self) -> usize {
        match &self.source {
            AnalyserSource::Fixed { bins, .. } => *bins,
            AnalyserSource::Spectrum(analyser) => analyser.frequency_bin_count(),
        }
    }

    fn byte_frequency_data(&mut self, out: &mut [u8]) {
        if !self.connected {
            out.fill(0);
            return;
        }
        match &mut self.source {
            AnalyserSource::Fixed { magnitude, .. } => out.fill(magnitude.get()),
            AnalyserSource::Spectrum(analyser) => analyser.byte_frequency_data(out),
        }
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let AnalyserSource::Spectrum(analyser) = &mut self.source {
            analyser.disconnect();
        }
        self.stats.update(|stats| stats.analysers_disconnected += 1);
    }
}

/// GPU initialisation stage a [`HeadlessGraphicsHost`] should fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuFailure {
    Context,
    VertexCompile,
    FragmentCompile,
    Link,
    Attribute,
    Uniform,
    Buffer,
}

/// Everything a headless graphics host has observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphicsStats {
    pub contexts_created: usize,
    pub compiles: usize,
    pub links: usize,
    pub live_shaders: usize,
    pub live_programs: usize,
    pub live_buffers: usize,
    pub draw_calls: u64,
    pub last_vertex_count: Option<u32>,
    pub viewport: Option<(u32, u32)>,
    pub context_loss_requests: usize,
    pub resize_listeners: usize,
    pub uniforms: HashMap<String, Vec<f32>>,
    /// Colour at the surface centre for the last successful draw.
    pub last_center: Option<[f32; 3]>,
}

impl GraphicsStats {
    pub fn uniform(&self, name: &str) -> Option<Vec<f32>> {
        self.uniforms.get(name).cloned()
    }

    fn pattern_uniforms(&self) -> Option<PatternUniforms> {
        let scalar = |name: &str| self.uniforms.get(name).and_then(|v| v.first().copied());
        let resolution = self.uniforms.get("uResolution")?;
        let color = self.uniforms.get("uColor")?;
        Some(PatternUniforms {
            time: scalar("uTime")?,
            speed: scalar("uSpeed")?,
            amplitude: scalar("uAmplitude")?,
            resolution: [*resolution.first()?, *resolution.get(1)?],
            base_color: [*color.first()?, *color.get(1)?, *color.get(2)?],
        })
    }
}

/// Graphics host backed by bookkeeping instead of a GPU.
#[derive(Debug)]
pub struct HeadlessGraphicsHost {
    size: SurfaceSize,
    failure: Option<GpuFailure>,
    fail_draw_at: Option<u64>,
    fail_resize_listener: bool,
    supports_context_loss: bool,
    stats: Rc<RefCell<GraphicsStats>>,
    lost: Rc<Cell<bool>>,
    next_listener: u64,
    listeners: Vec<ListenerId>,
}

impl HeadlessGraphicsHost {
    pub fn new(size: SurfaceSize) -> Self {
        Self {
            size,
            failure: None,
            fail_draw_at: None,
            fail_resize_listener: false,
            supports_context_loss: true,
            stats: Rc::default(),
            lost: Rc::default(),
            next_listener: 0,
            listeners: Vec::new(),
        }
    }

    pub fn with_failure(mut self, failure: GpuFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Fails the `draw`-th draw call (1-based) and loses the context.
    pub fn with_draw_failure_at(mut self, draw: u64) -> Self {
        self.fail_draw_at = Some(draw);
        self
    }

    pub fn with_resize_listener_failure(mut self) -> Self {
        self.fail_resize_listener = true;
        self
    }

    pub fn without_context_loss_support(mut self) -> Self {
        self.supports_context_loss = false;
        self
    }

    pub fn set_surface_size(&mut self, size: SurfaceSize) {
        self.size = size;
    }

    /// Marks the current context as lost, as a driver reset would.
    pub fn simulate_context_loss(&self) {
        self.lost.set(true);
    }

    pub fn stats(&self) -> GraphicsStats {
        self.stats.borrow().clone()
    }
}

impl GraphicsHost for HeadlessGraphicsHost {
    type Context = HeadlessContext;

    fn surface_size(&self) -> SurfaceSize {
        self.size
    }

    fn create_context(&mut self, width: u32, height: u32) -> Option<HeadlessContext> {
        if self.failure == Some(GpuFailure::Context) {
            return None;
        }
        self.lost = Rc::default();
        let mut stats = self.stats.borrow_mut();
        stats.contexts_created += 1;
        stats.viewport = Some((width, height));
        Some(HeadlessContext {
            stats: Rc::clone(&self.stats),
            lost: Rc::clone(&self.lost),
            failure: self.failure,
            fail_draw_at: self.fail_draw_at,
            supports_context_loss: self.supports_context_loss,
            next_id: 1,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            buffers: Vec::new(),
        })
    }

    fn add_resize_listener(&mut self) -> Result<ListenerId> {
        if self.fail_resize_listener {
            return Err(OrbError::msg("resize notifications unavailable"));
        }
        self.next_listener += 1;
        let listener = ListenerId(self.next_listener);
        self.listeners.push(listener);
        self.stats.borrow_mut().resize_listeners = self.listeners.len();
        Ok(listener)
    }

    fn remove_resize_listener(&mut self, listener: ListenerId) {
        self.listeners.retain(|&id| id != listener);
        self.stats.borrow_mut().resize_listeners = self.listeners.len();
    }
}

#[derive(Debug)]
struct ProgramInfo {
    attributes: Vec<String>,
    uniforms: Vec<String>,
}

/// Uniform locations encode the program and the uniform's index.
const UNIFORMS_PER_PROGRAM: u32 = 64;

#[derive(Debug)]
pub struct HeadlessContext {
    stats: Rc<RefCell<GraphicsStats>>,
    lost: Rc<Cell<bool>>,
    failure: Option<GpuFailure>,
    fail_draw_at: Option<u64>,
    supports_context_loss: bool,
    next_id: u32,
    shaders: HashMap<ShaderId, (ShaderStage, String)>,
    programs: HashMap<ProgramId, ProgramInfo>,
    buffers: Vec<BufferId>,
}

impl HeadlessContext {
    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn fails_at(&self, failure: GpuFailure) -> bool {
        self.failure == Some(failure)
    }

    fn uniform_name(&self, location: UniformLocation) -> Option<String> {
        let program = ProgramId(location.0 / UNIFORMS_PER_PROGRAM);
        let index = (location.0 % UNIFORMS_PER_PROGRAM) as usize;
        self.programs.get(&program)?.uniforms.get(index).cloned()
    }

    fn record_uniform(&mut self, location: UniformLocation, values: Vec<f32>) {
        if let Some(name) = self.uniform_name(location) {
            self.stats.borrow_mut().uniforms.insert(name, values);
        }
    }
}

/// Names declared with `qualifier` (`attribute` or `uniform`) in GLSL source.
fn declared_names(source: &str, qualifier: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next()? != qualifier {
                return None;
            }
            let name = tokens.nth(1)?.trim_end_matches(';');
            Some(name.to_string())
        })
        .collect()
}

impl GraphicsContext for HeadlessContext {
    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
    ) -> std::result::Result<ShaderId, String> {
        self.stats.borrow_mut().compiles += 1;
        let failing = match stage {
            ShaderStage::Vertex => GpuFailure::VertexCompile,
            ShaderStage::Fragment => GpuFailure::FragmentCompile,
        };
        if self.fails_at(failing) {
            return Err("ERROR: 0:1: syntax error".to_string());
        }
        let shader = ShaderId(self.allocate_id());
        self.shaders.insert(shader, (stage, source.to_string()));
        self.stats.borrow_mut().live_shaders += 1;
        Ok(shader)
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        if self.shaders.remove(&shader).is_some() {
            self.stats.borrow_mut().live_shaders -= 1;
        }
    }

    fn link_program(
        &mut self,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> std::result::Result<ProgramId, String> {
        self.stats.borrow_mut().links += 1;
        if self.fails_at(GpuFailure::Link) {
            return Err("varyings do not match".to_string());
        }
        let (Some((ShaderStage::Vertex, vertex_src)), Some((ShaderStage::Fragment, fragment_src))) =
            (self.shaders.get(&vertex), self.shaders.get(&fragment))
        else {
            return Err("program needs one vertex and one fragment shader".to_string());
        };

        let mut uniforms = declared_names(vertex_src, "uniform");
        uniforms.extend(declared_names(fragment_src, "uniform"));
        let info = ProgramInfo {
            attributes: declared_names(vertex_src, "attribute"),
            uniforms,
        };
        let program = ProgramId(self.allocate_id());
        self.programs.insert(program, info);
        self.stats.borrow_mut().live_programs += 1;
        Ok(program)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.stats.borrow_mut().live_programs -= 1;
        }
    }

    fn attribute_location(&self, program: ProgramId, name: &str) -> Option<u32> {
        if self.fails_at(GpuFailure::Attribute) {
            return None;
        }
        let info = self.programs.get(&program)?;
        info.attributes
            .iter()
            .position(|attribute| attribute == name)
            .map(|index| index as u32)
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        if self.fails_at(GpuFailure::Uniform) {
            return None;
        }
        let info = self.programs.get(&program)?;
        let index = info.uniforms.iter().position(|uniform| uniform == name)? as u32;
        Some(UniformLocation(program.0 * UNIFORMS_PER_PROGRAM + index))
    }

    fn create_static_buffer(&mut self, data: &[f32]) -> std::result::Result<BufferId, String> {
        if self.fails_at(GpuFailure::Buffer) || data.is_empty() {
            return Err("out of memory".to_string());
        }
        let buffer = BufferId(self.allocate_id());
        self.buffers.push(buffer);
        self.stats.borrow_mut().live_buffers += 1;
        Ok(buffer)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        let before = self.buffers.len();
        self.buffers.retain(|&id| id != buffer);
        if self.buffers.len() < before {
            self.stats.borrow_mut().live_buffers -= 1;
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.stats.borrow_mut().viewport = Some((width, height));
    }

    fn use_program(&mut self, _program: ProgramId) {}

    fn set_uniform_f32(&mut self, location: UniformLocation, value: f32) {
        self.record_uniform(location, vec![value]);
    }

    fn set_uniform_vec2(&mut self, location: UniformLocation, value: [f32; 2]) {
        self.record_uniform(location, value.to_vec());
    }

    fn set_uniform_vec3(&mut self, location: UniformLocation, value: [f32; 3]) {
        self.record_uniform(location, value.to_vec());
    }

    fn bind_attribute(
        &mut self,
        _buffer: BufferId,
        _location: u32,
        _components: u32,
        _stride: u32,
        _offset: u32,
    ) {
    }

    fn draw_triangles(&mut self, vertex_count: u32) -> std::result::Result<(), String> {
        if self.lost.get() {
            return Err("CONTEXT_LOST_WEBGL".to_string());
        }
        let mut stats = self.stats.borrow_mut();
        stats.draw_calls += 1;
        if self.fail_draw_at == Some(stats.draw_calls) {
            self.lost.set(true);
            return Err("INVALID_OPERATION: drawArrays".to_string());
        }
        stats.last_vertex_count = Some(vertex_count);
        let center = stats
            .pattern_uniforms()
            .map(|uniforms| pattern::shade([0.5, 0.5], &uniforms));
        stats.last_center = center;
        Ok(())
    }

    fn is_context_lost(&self) -> bool {
        self.lost.get()
    }

    fn lose_context(&mut self) -> bool {
        if !self.supports_context_loss {
            return false;
        }
        self.stats.borrow_mut().context_loss_requests += 1;
        self.lost.set(true);
        true
    }
}

/// Frame scheduler driven by hand: each [`ManualScheduler::take_due`] call
/// stands for one display refresh.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    next_token: u64,
    pending: Vec<(FrameToken, FrameLoop)>,
    requested: u64,
    cancelled: u64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every callback due at the next refresh, in
    /// request order.
    pub fn take_due(&mut self) -> Vec<(FrameToken, FrameLoop)> {
        mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &[(FrameToken, FrameLoop)] {
        &self.pending
    }

    pub fn is_scheduled(&self, frame_loop: FrameLoop) -> bool {
        self.pending.iter().any(|&(_, pending)| pending == frame_loop)
    }

    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }
}

impl FrameScheduler for ManualScheduler {
    fn request_frame(&mut self, frame_loop: FrameLoop) -> FrameToken {
        self.next_token += 1;
        self.requested += 1;
        let token = FrameToken(self.next_token);
        self.pending.push((token, frame_loop));
        token
    }

    fn cancel_frame(&mut self, token: FrameToken) {
        let before = self.pending.len();
        self.pending.retain(|&(pending, _)| pending != token);
        if self.pending.len() < before {
            self.cancelled += 1;
        }
    }
}
