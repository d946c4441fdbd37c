use serde::Serialize;

use crate::{config::RenderConfig, smoothing::sanitize};

/// Per-frame render values derived from the UI level. Each one is a
/// non-decreasing function of the level that saturates at `level = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderFrameParams {
    pub level: f32,
    pub amplitude: f32,
    pub speed: f32,
    pub scale: f32,
    pub glow_opacity: f32,
}

impl RenderFrameParams {
    pub fn from_level(level: f32, config: &RenderConfig) -> Self {
        let level = sanitize(level);
        Self {
            level,
            amplitude: amplitude(level, config),
            speed: speed(level, config),
            scale: 1.0 + level * config.scale_gain,
            glow_opacity: (config.glow_base + level * config.glow_gain).clamp(0.0, 1.0),
        }
    }
}

/// Warp strength pushed to the shader; 0.18 at silence, 1.88 at full level
/// with the default configuration.
pub fn amplitude(level: f32, config: &RenderConfig) -> f32 {
    config.amplitude_base + sanitize(level) * config.amplitude_gain
}

/// Time multiplier pushed to the shader; 0.75 at silence, 1.25 at full level
/// with the default configuration.
pub fn speed(level: f32, config: &RenderConfig) -> f32 {
    config.speed_base + sanitize(level) * config.speed_gain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_match_the_uniform_contract() {
        let config = RenderConfig::default();
        assert!((amplitude(0.0, &config) - 0.18).abs() < 1e-6);
        assert!((amplitude(1.0, &config) - 1.88).abs() < 1e-6);
        assert!((speed(0.0, &config) - 0.75).abs() < 1e-6);
        assert!((speed(1.0, &config) - 1.25).abs() < 1e-6);
    }

    #[test]
    fn every_param_is_monotonic_in_level() {
        let config = RenderConfig::default();
        let mut previous = RenderFrameParams::from_level(0.0, &config);
        for step in 1..=100 {
            let params = RenderFrameParams::from_level(step as f32 / 100.0, &config);
            assert!(params.amplitude >= previous.amplitude);
            assert!(params.speed >= previous.speed);
            assert!(params.scale >= previous.scale);
            assert!(params.glow_opacity >= previous.glow_opacity);
            assert!(params.glow_opacity <= 1.0);
            previous = params;
        }
    }

    #[test]
    fn saturates_outside_unit_range() {
        let config = RenderConfig::default();
        let over = RenderFrameParams::from_level(3.0, &config);
        let full = RenderFrameParams::from_level(1.0, &config);
        assert_eq!(over, full);
        let nan = RenderFrameParams::from_level(f32::NAN, &config);
        assert_eq!(nan, RenderFrameParams::from_level(0.0, &config));
    }
}
