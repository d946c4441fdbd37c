use crate::{level::LevelReader, smoothing::ExponentialSmoother};

/// Second smoothing stage, run at render cadence.
///
/// It polls the extractor's level once per render tick and filters it with a
/// faster constant than the audio stage, so the orb reacts promptly while the
/// audio measurement itself stays steady. The two stages must stay separate:
/// the sampling and render loops tick independently.
#[derive(Debug, Clone)]
pub struct RenderLoopController {
    source: LevelReader,
    smoother: ExponentialSmoother,
}

impl RenderLoopController {
    pub fn new(source: LevelReader, alpha: f32) -> Self {
        Self {
            source,
            smoother: ExponentialSmoother::new(alpha),
        }
    }

    /// Reads the latest extractor level and returns the re-smoothed UI level.
    pub fn tick(&mut self) -> f32 {
        self.smoother.step(self.source.get())
    }

    pub fn level(&self) -> f32 {
        self.smoother.value()
    }

    pub fn reset(&mut self) {
        self.smoother.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevelConfig;
    use crate::headless::{HeadlessAudioHost, HeadlessSignal};
    use crate::level::LevelExtractor;

    fn started(signal: HeadlessSignal) -> LevelExtractor<HeadlessAudioHost> {
        let host = HeadlessAudioHost::new(signal);
        let mut extractor = LevelExtractor::new(host, LevelConfig::default());
        extractor.start(None).unwrap();
        extractor
    }

    #[test]
    fn follows_extractor_with_its_own_constant() {
        let mut extractor = started(HeadlessSignal::normalized(1.0));
        let mut controller = RenderLoopController::new(extractor.reader(), 0.25);

        extractor.tick();
        let ui = controller.tick();
        assert!((ui - 0.15 * 0.25).abs() < 1e-5);
    }

    #[test]
    fn repeated_render_ticks_settle_on_a_stale_level() {
        let mut extractor = started(HeadlessSignal::normalized(1.0));
        let mut controller = RenderLoopController::new(extractor.reader(), 0.25);
        for _ in 0..5 {
            extractor.tick();
        }
        let held = extractor.level();

        // The render loop may run several times between sampling ticks.
        for _ in 0..80 {
            controller.tick();
        }
        assert!((controller.level() - held).abs() < 1e-4);
        assert!(controller.level() <= held + f32::EPSILON);
    }

    #[test]
    fn two_stages_lag_a_single_audio_stage() {
        let mut extractor = started(HeadlessSignal::normalized(0.9));
        let mut controller = RenderLoopController::new(extractor.reader(), 0.25);
        for _ in 0..10 {
            extractor.tick();
            controller.tick();
        }
        assert!(controller.level() < extractor.level());
        assert!(controller.level() > 0.0);
    }

    #[test]
    fn reset_clears_ui_level_only() {
        let mut extractor = started(HeadlessSignal::normalized(0.6));
        let mut controller = RenderLoopController::new(extractor.reader(), 0.25);
        extractor.tick();
        controller.tick();

        controller.reset();
        assert_eq!(controller.level(), 0.0);
        assert!(extractor.level() > 0.0);
    }
}
