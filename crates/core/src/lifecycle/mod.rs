use std::fmt;

use serde::Serialize;

use crate::{
    config::OrbConfig,
    controller::RenderLoopController,
    headless::ManualScheduler,
    host::{
        AudioHost, FrameLoop, FrameScheduler, FrameToken, GraphicsHost, ListenerId, MediaStream,
    },
    level::LevelExtractor,
    render::{FallbackRenderer, FallbackStyle, RenderFrameParams, ShaderRenderer},
    OrbError, Result,
};

/// Where the pipeline is in its activation cycle.
///
/// `GpuActive -> FallbackActive` is one-way; only a full restart through
/// `Stopped -> Uninitialized` brings the GPU path back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Uninitialized,
    Requesting,
    GpuActive,
    FallbackActive,
    Stopped,
}

impl Mode {
    pub fn is_running(self) -> bool {
        matches!(self, Self::GpuActive | Self::FallbackActive)
    }
}

/// Status a host can show next to the orb, such as an "enable microphone"
/// prompt. GPU degradation is deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrbStatus {
    pub mode: Mode,
    pub ready: bool,
    pub error: Option<String>,
}

/// What the last render tick produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OrbFrame {
    Gpu(RenderFrameParams),
    Fallback(FallbackStyle),
}

/// Sequences start and stop across the extractor, the controller and the two
/// renderers, pairing every acquisition with a release whichever stage
/// fails.
pub struct LifecycleCoordinator<A, G, S>
where
    A: AudioHost,
    G: GraphicsHost,
    S: FrameScheduler,
{
    config: OrbConfig,
    mode: Mode,
    extractor: LevelExtractor<A>,
    controller: RenderLoopController,
    graphics: G,
    scheduler: S,
    renderer: Option<ShaderRenderer<G::Context>>,
    fallback: FallbackRenderer,
    sampling_frame: Option<FrameToken>,
    render_frame: Option<FrameToken>,
    resize_listener: Option<ListenerId>,
    last_frame: Option<OrbFrame>,
    gpu_failure: Option<String>,
}

impl<A, G, S> LifecycleCoordinator<A, G, S>
where
    A: AudioHost,
    G: GraphicsHost,
    S: FrameScheduler,
{
    pub fn new(audio: A, graphics: G, scheduler: S, config: OrbConfig) -> Self {
        let extractor = LevelExtractor::new(audio, config.level.clone());
        let controller = RenderLoopController::new(extractor.reader(), config.render.smoothing);
        let fallback = FallbackRenderer::new(config.fallback.clone());
        Self {
            config,
            mode: Mode::Uninitialized,
            extractor,
            controller,
            graphics,
            scheduler,
            renderer: None,
            fallback,
            sampling_frame: None,
            render_frame: None,
            resize_listener: None,
            last_frame: None,
            gpu_failure: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> OrbStatus {
        OrbStatus {
            mode: self.mode,
            ready: self.mode.is_running() && self.extractor.is_active(),
            error: self.extractor.error().map(ToString::to_string),
        }
    }

    pub fn last_frame(&self) -> Option<&OrbFrame> {
        self.last_frame.as_ref()
    }

    /// The render-domain level.
    pub fn ui_level(&self) -> f32 {
        self.controller.level()
    }

    /// The audio-domain level.
    pub fn extractor_level(&self) -> f32 {
        self.extractor.level()
    }

    /// Hands over the microphone failure behind `status().error`, keeping its
    /// variant. The status stops reporting it afterwards.
    pub fn take_audio_error(&mut self) -> Option<OrbError> {
        self.extractor.take_error()
    }

    /// Why the GPU path was abandoned in this activation, for diagnostics.
    pub fn gpu_failure(&self) -> Option<&str> {
        self.gpu_failure.as_deref()
    }

    pub fn renderer(&self) -> Option<&ShaderRenderer<G::Context>> {
        self.renderer.as_ref()
    }

    pub fn audio_host(&self) -> &A {
        self.extractor.host()
    }

    pub fn audio_host_mut(&mut self) -> &mut A {
        self.extractor.host_mut()
    }

    pub fn graphics(&self) -> &G {
        &self.graphics
    }

    pub fn graphics_mut(&mut self) -> &mut G {
        &mut self.graphics
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Applies the host's activation flag. `stream` is only used when the
    /// flag turns the pipeline on; without one the microphone is requested.
    pub fn set_active(&mut self, active: bool, stream: Option<A::Stream>) {
        if active {
            self.activate(stream);
        } else {
            self.deactivate();
        }
    }

    /// Starts the pipeline. A stream handed to an orb that is already active
    /// is not used; its tracks are stopped.
    pub fn activate(&mut self, stream: Option<A::Stream>) {
        match self.mode {
            Mode::Requesting | Mode::GpuActive | Mode::FallbackActive => {
                tracing::debug!(mode = ?self.mode, "already active");
                if let Some(mut rejected) = stream {
                    rejected.stop_tracks();
                }
                return;
            }
            Mode::Stopped => self.transition(Mode::Uninitialized),
            Mode::Uninitialized => {}
        }
        self.transition(Mode::Requesting);

        if self.extractor.start(stream).is_ok() {
            self.sampling_frame = Some(self.scheduler.request_frame(FrameLoop::Sampling));
        }

        match ShaderRenderer::init(&mut self.graphics, self.config.render.clone()) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.transition(Mode::GpuActive);
            }
            Err(err) => {
                tracing::warn!(%err, "GPU initialisation failed, using fallback renderer");
                self.gpu_failure = Some(err.to_string());
                self.transition(Mode::FallbackActive);
            }
        }

        match self.graphics.add_resize_listener() {
            Ok(listener) => self.resize_listener = Some(listener),
            Err(err) => tracing::warn!(%err, "resize notifications unavailable"),
        }

        self.controller.reset();
        self.render_frame = Some(self.scheduler.request_frame(FrameLoop::Render));
    }

    /// Turns the pipeline off. Pending callbacks are cancelled before any
    /// resource they could touch is released.
    pub fn deactivate(&mut self) {
        if self.mode == Mode::Stopped {
            return;
        }
        self.cancel_loops();

        if let Some(listener) = self.resize_listener.take() {
            self.graphics.remove_resize_listener(listener);
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.teardown();
        }
        self.extractor.stop();
        self.controller.reset();
        self.last_frame = None;
        self.gpu_failure = None;
        self.transition(Mode::Stopped);
    }

    /// The hosting view is going away.
    pub fn unmount(&mut self) {
        self.deactivate();
    }

    /// Asks for microphone access again after a failure.
    pub fn retry_microphone(&mut self) -> Result<()> {
        if !self.mode.is_running() {
            return Err(OrbError::msg("the orb is not active"));
        }
        if let Some(token) = self.sampling_frame.take() {
            self.scheduler.cancel_frame(token);
        }
        self.extractor.start(None)?;
        self.sampling_frame = Some(self.scheduler.request_frame(FrameLoop::Sampling));
        Ok(())
    }

    /// Host callback for a fired frame. Tokens that were cancelled or belong
    /// to an earlier activation are ignored.
    pub fn on_animation_frame(&mut self, token: FrameToken) {
        if self.sampling_frame == Some(token) {
            self.sampling_frame = None;
            if self.extractor.is_active() {
                self.extractor.tick();
                self.sampling_frame = Some(self.scheduler.request_frame(FrameLoop::Sampling));
            }
        } else if self.render_frame == Some(token) {
            self.render_frame = None;
            if self.mode.is_running() {
                self.render_tick();
                self.render_frame = Some(self.scheduler.request_frame(FrameLoop::Render));
            }
        } else {
            tracing::trace!(?token, "ignoring stale frame callback");
        }
    }

    /// Host callback for a surface resize. Failures only cost sharpness.
    pub fn on_resize(&mut self) {
        let size = self.graphics.surface_size();
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.resize(size);
        }
    }

    fn render_tick(&mut self) {
        let level = self.controller.tick();

        if self.mode == Mode::GpuActive {
            let outcome = match self.renderer.as_mut() {
                Some(renderer) => renderer.render_frame(level),
                None => Err(OrbError::Draw("renderer missing".to_string())),
            };
            match outcome {
                Ok(params) => {
                    self.last_frame = Some(OrbFrame::Gpu(params));
                    return;
                }
                Err(err) => self.degrade(err),
            }
        }

        let style = self.fallback.render(level).clone();
        self.last_frame = Some(OrbFrame::Fallback(style));
    }

    fn degrade(&mut self, err: OrbError) {
        tracing::warn!(%err, "GPU rendering failed mid-session, switching to fallback");
        if let Some(mut renderer) = self.renderer.take() {
            renderer.teardown();
        }
        self.gpu_failure = Some(err.to_string());
        self.transition(Mode::FallbackActive);
    }

    fn cancel_loops(&mut self) {
        for token in [self.sampling_frame.take(), self.render_frame.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel_frame(token);
        }
    }

    fn transition(&mut self, next: Mode) {
        if self.mode != next {
            tracing::info!(from = ?self.mode, to = ?next, "orb mode changed");
            self.mode = next;
        }
    }
}

impl<A: AudioHost, G: GraphicsHost> LifecycleCoordinator<A, G, ManualScheduler> {
    /// Runs every callback due at one display refresh and returns how many
    /// ran.
    pub fn pump(&mut self) -> usize {
        let due = self.scheduler.take_due();
        let count = due.len();
        for (token, _) in due {
            self.on_animation_frame(token);
        }
        count
    }
}

impl<A, G, S> Drop for LifecycleCoordinator<A, G, S>
where
    A: AudioHost,
    G: GraphicsHost,
    S: FrameScheduler,
{
    fn drop(&mut self) {
        self.unmount();
    }
}

impl<A, G, S> fmt::Debug for LifecycleCoordinator<A, G, S>
where
    A: AudioHost,
    G: GraphicsHost,
    S: FrameScheduler,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("mode", &self.mode)
            .field("extractor", &self.extractor)
            .field("ui_level", &self.controller.level())
            .field("renderer", &self.renderer)
            .field("sampling_frame", &self.sampling_frame)
            .field("render_frame", &self.render_frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{
        GpuFailure, HeadlessAudioHost, HeadlessGraphicsHost, HeadlessSignal, HeadlessStream,
    };
    use crate::host::SurfaceSize;

    type Orb = LifecycleCoordinator<HeadlessAudioHost, HeadlessGraphicsHost, ManualScheduler>;

    fn surface() -> SurfaceSize {
        SurfaceSize::new(320.0, 320.0, 2.0)
    }

    fn orb_with(audio: HeadlessAudioHost, graphics: HeadlessGraphicsHost) -> Orb {
        LifecycleCoordinator::new(audio, graphics, ManualScheduler::new(), OrbConfig::default())
    }

    fn orb(signal: HeadlessSignal) -> Orb {
        orb_with(HeadlessAudioHost::new(signal), HeadlessGraphicsHost::new(surface()))
    }

    fn run(orb: &mut Orb, frames: usize) {
        for _ in 0..frames {
            orb.pump();
        }
    }

    #[test]
    fn activation_reaches_gpu_mode_with_both_loops_scheduled() {
        let mut orb = orb(HeadlessSignal::normalized(0.5));
        assert_eq!(orb.mode(), Mode::Uninitialized);

        orb.set_active(true, None);

        assert_eq!(orb.mode(), Mode::GpuActive);
        assert!(orb.scheduler().is_scheduled(FrameLoop::Sampling));
        assert!(orb.scheduler().is_scheduled(FrameLoop::Render));
        assert_eq!(
            orb.status(),
            OrbStatus {
                mode: Mode::GpuActive,
                ready: true,
                error: None
            }
        );
        assert_eq!(orb.graphics().stats().resize_listeners, 1);
    }

    #[test]
    fn missing_gpu_context_renders_fallback_without_draw_calls() {
        let graphics = HeadlessGraphicsHost::new(surface()).with_failure(GpuFailure::Context);
        let mut orb = orb_with(HeadlessAudioHost::new(HeadlessSignal::normalized(0.7)), graphics);

        orb.set_active(true, None);
        assert_eq!(orb.mode(), Mode::FallbackActive);
        run(&mut orb, 30);

        assert!(matches!(orb.last_frame(), Some(OrbFrame::Fallback(_))));
        assert_eq!(orb.graphics().stats().draw_calls, 0);
        assert!(orb.status().ready);
        assert!(orb.status().error.is_none());
        assert!(orb.gpu_failure().unwrap().contains("context"));
    }

    #[test]
    fn every_init_failure_degrades_to_fallback() {
        for failure in [
            GpuFailure::VertexCompile,
            GpuFailure::FragmentCompile,
            GpuFailure::Link,
            GpuFailure::Attribute,
            GpuFailure::Uniform,
            GpuFailure::Buffer,
        ] {
            let graphics = HeadlessGraphicsHost::new(surface()).with_failure(failure);
            let audio = HeadlessAudioHost::new(HeadlessSignal::normalized(0.3));
            let mut orb = orb_with(audio, graphics);
            orb.activate(None);
            run(&mut orb, 3);

            assert_eq!(orb.mode(), Mode::FallbackActive, "{failure:?}");
            assert!(orb.renderer().is_none());
            let stats = orb.graphics().stats();
            assert_eq!(stats.draw_calls, 0, "{failure:?}");
            assert_eq!(stats.live_programs, 0, "{failure:?}");
            assert_eq!(stats.context_loss_requests, 1, "{failure:?}");
        }
    }

    #[test]
    fn draw_failure_switches_to_fallback_for_good() {
        let graphics = HeadlessGraphicsHost::new(surface()).with_draw_failure_at(5);
        let mut orb = orb_with(HeadlessAudioHost::new(HeadlessSignal::normalized(0.6)), graphics);
        orb.activate(None);

        run(&mut orb, 4);
        assert_eq!(orb.mode(), Mode::GpuActive);
        assert!(matches!(orb.last_frame(), Some(OrbFrame::Gpu(_))));

        run(&mut orb, 1);
        assert_eq!(orb.mode(), Mode::FallbackActive);
        assert!(matches!(orb.last_frame(), Some(OrbFrame::Fallback(_))));

        run(&mut orb, 20);
        let stats = orb.graphics().stats();
        assert_eq!(stats.draw_calls, 5);
        assert_eq!(orb.mode(), Mode::FallbackActive);
        assert!(orb.renderer().is_none());
        assert!(orb.status().error.is_none());
    }

    #[test]
    fn context_loss_mid_session_degrades() {
        let mut orb = orb(HeadlessSignal::normalized(0.6));
        orb.activate(None);
        run(&mut orb, 3);

        orb.graphics().simulate_context_loss();
        run(&mut orb, 1);

        assert_eq!(orb.mode(), Mode::FallbackActive);
        assert_eq!(orb.graphics().stats().draw_calls, 3);
    }

    #[test]
    fn loud_constant_input_settles_quickly() {
        let mut orb = orb(HeadlessSignal::normalized(0.9));
        orb.activate(None);

        let mut peak_amplitude: f32 = 0.0;
        let mut settled_at = None;
        for frame in 1..=120 {
            orb.pump();
            if let Some(OrbFrame::Gpu(params)) = orb.last_frame() {
                peak_amplitude = peak_amplitude.max(params.amplitude);
            }
            if settled_at.is_none() && (orb.ui_level() - 0.9).abs() < 0.05 {
                settled_at = Some(frame);
            }
        }

        let settled_at = settled_at.expect("ui level never approached the input");
        assert!(settled_at <= 40, "settled after {settled_at} frames");
        assert!(peak_amplitude > 1.5);
        assert!((orb.ui_level() - 0.9).abs() < 1e-3);
        assert!(orb.ui_level() <= 0.9 + 1e-6);
    }

    #[test]
    fn deactivation_cancels_callbacks_and_stops_tracks() {
        let mut orb = orb(HeadlessSignal::normalized(0.8));
        orb.activate(None);
        run(&mut orb, 10);
        let tracks = orb.audio_host().granted_streams()[0].clone();
        assert_eq!(tracks.live_tracks(), 1);

        orb.set_active(false, None);

        assert_eq!(orb.mode(), Mode::Stopped);
        assert!(orb.scheduler().pending().is_empty());
        assert_eq!(orb.scheduler().cancelled(), 2);
        assert_eq!(tracks.live_tracks(), 0);
        assert_eq!(orb.extractor_level(), 0.0);
        assert_eq!(orb.ui_level(), 0.0);

        let graphics = orb.graphics().stats();
        assert_eq!(graphics.resize_listeners, 0);
        assert_eq!(graphics.context_loss_requests, 1);
        assert_eq!(graphics.live_programs, 0);
        assert_eq!(orb.audio_host().stats().active_graphs(), 0);
        assert_eq!(orb.pump(), 0);
    }

    #[test]
    fn stale_tokens_after_stop_are_ignored() {
        let mut orb = orb(HeadlessSignal::normalized(0.8));
        orb.activate(None);
        let stale: Vec<_> = orb.scheduler().pending().to_vec();
        orb.deactivate();

        for (token, _) in stale {
            orb.on_animation_frame(token);
        }
        assert_eq!(orb.graphics().stats().draw_calls, 0);
        assert!(orb.scheduler().pending().is_empty());
    }

    #[test]
    fn reactivation_starts_from_scratch() {
        let mut orb = orb(HeadlessSignal::normalized(0.8));
        orb.activate(None);
        run(&mut orb, 10);
        orb.deactivate();

        orb.activate(None);
        assert_eq!(orb.mode(), Mode::GpuActive);
        assert_eq!(orb.graphics().stats().contexts_created, 2);
        assert_eq!(orb.renderer().unwrap().time(), 0.0);
        assert_eq!(orb.audio_host().stats().microphone_requests, 2);
        assert_eq!(orb.audio_host().stats().active_graphs(), 1);
    }

    #[test]
    fn degraded_activation_recovers_gpu_only_after_restart() {
        let graphics = HeadlessGraphicsHost::new(surface()).with_draw_failure_at(1);
        let mut orb = orb_with(HeadlessAudioHost::new(HeadlessSignal::normalized(0.5)), graphics);
        orb.activate(None);
        run(&mut orb, 2);
        assert_eq!(orb.mode(), Mode::FallbackActive);

        orb.deactivate();
        orb.activate(None);
        run(&mut orb, 2);
        assert_eq!(orb.mode(), Mode::GpuActive);
        assert!(matches!(orb.last_frame(), Some(OrbFrame::Gpu(_))));
    }

    #[test]
    fn denied_microphone_renders_silence_and_can_retry() {
        let audio = HeadlessAudioHost::denied("NotAllowedError: Permission denied");
        let mut orb = orb_with(audio, HeadlessGraphicsHost::new(surface()));
        orb.activate(None);
        run(&mut orb, 5);

        assert_eq!(orb.mode(), Mode::GpuActive);
        let status = orb.status();
        assert!(!status.ready);
        assert!(status.error.unwrap().contains("Permission denied"));
        assert!(!orb.scheduler().is_scheduled(FrameLoop::Sampling));
        match orb.last_frame() {
            Some(OrbFrame::Gpu(params)) => assert_eq!(params.level, 0.0),
            other => panic!("unexpected frame {other:?}"),
        }

        orb.audio_host_mut().grant(HeadlessSignal::normalized(0.9));
        orb.retry_microphone().unwrap();
        run(&mut orb, 5);
        assert!(orb.status().ready);
        assert!(orb.status().error.is_none());
        assert!(orb.ui_level() > 0.0);
    }

    #[test]
    fn retry_requires_an_active_orb() {
        let mut orb = orb(HeadlessSignal::silence());
        assert!(orb.retry_microphone().is_err());
    }

    #[test]
    fn supplied_stream_skips_the_microphone_request() {
        let mut orb = orb(HeadlessSignal::silence());
        let stream = HeadlessStream::new(HeadlessSignal::normalized(0.9));
        let tracks = stream.track_monitor();

        orb.set_active(true, Some(stream));
        run(&mut orb, 10);
        assert_eq!(orb.audio_host().stats().microphone_requests, 0);
        assert!(orb.extractor_level() > 0.5);

        orb.unmount();
        assert_eq!(tracks.live_tracks(), 0);
    }

    #[test]
    fn stream_offered_while_active_is_stopped() {
        let mut orb = orb(HeadlessSignal::normalized(0.4));
        orb.activate(None);

        let late = HeadlessStream::new(HeadlessSignal::normalized(0.9));
        let tracks = late.track_monitor();
        orb.set_active(true, Some(late));
        assert_eq!(tracks.live_tracks(), 0);
        assert_eq!(orb.audio_host().stats().active_graphs(), 1);

        orb.deactivate();
        assert_eq!(tracks.live_tracks(), 0);
    }

    #[test]
    fn denied_microphone_error_keeps_its_kind() {
        let audio = HeadlessAudioHost::denied("NotAllowedError");
        let mut orb = orb_with(audio, HeadlessGraphicsHost::new(surface()));
        orb.activate(None);

        assert!(matches!(orb.take_audio_error(), Some(OrbError::Permission(_))));
        assert!(orb.status().error.is_none());
        assert!(orb.take_audio_error().is_none());
    }

    #[test]
    fn teardown_without_context_loss_support_still_releases() {
        let graphics = HeadlessGraphicsHost::new(surface()).without_context_loss_support();
        let audio = HeadlessAudioHost::new(HeadlessSignal::normalized(0.5));
        let mut orb = orb_with(audio, graphics);
        orb.activate(None);
        run(&mut orb, 3);
        assert_eq!(orb.graphics().stats().live_programs, 1);

        orb.deactivate();
        let stats = orb.graphics().stats();
        assert_eq!(stats.context_loss_requests, 0);
        assert_eq!(stats.live_programs, 0);
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(orb.mode(), Mode::Stopped);
    }

    #[test]
    fn repeated_activation_does_not_double_acquire() {
        let mut orb = orb(HeadlessSignal::normalized(0.4));
        orb.activate(None);
        orb.activate(None);
        assert_eq!(orb.audio_host().stats().active_graphs(), 1);
        assert_eq!(orb.graphics().stats().contexts_created, 1);
        assert_eq!(orb.scheduler().pending().len(), 2);
    }

    #[test]
    fn deactivate_before_activation_is_harmless() {
        let mut orb = orb(HeadlessSignal::silence());
        orb.deactivate();
        orb.deactivate();
        assert_eq!(orb.mode(), Mode::Stopped);
        assert_eq!(orb.extractor_level(), 0.0);
    }

    #[test]
    fn resize_updates_buffer_without_relinking() {
        let mut orb = orb(HeadlessSignal::normalized(0.4));
        orb.activate(None);
        let links = orb.graphics().stats().links;

        orb.graphics_mut()
            .set_surface_size(SurfaceSize::new(500.0, 250.0, 1.0));
        orb.on_resize();
        run(&mut orb, 1);

        let stats = orb.graphics().stats();
        assert_eq!(stats.viewport, Some((500, 250)));
        assert_eq!(stats.links, links);
        assert_eq!(orb.mode(), Mode::GpuActive);
    }

    #[test]
    fn missing_resize_notifications_do_not_stop_rendering() {
        let graphics = HeadlessGraphicsHost::new(surface()).with_resize_listener_failure();
        let mut orb = orb_with(HeadlessAudioHost::new(HeadlessSignal::normalized(0.4)), graphics);
        orb.activate(None);
        run(&mut orb, 3);
        assert_eq!(orb.mode(), Mode::GpuActive);
        assert_eq!(orb.graphics().stats().draw_calls, 3);
    }
}
