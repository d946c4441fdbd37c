use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{OrbError, Result};

/// Top-level configuration structure for the orb pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbConfig {
    pub level: LevelConfig,
    pub render: RenderConfig,
    pub fallback: FallbackConfig,
}

impl OrbConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Rejects values that would break the level invariants (a level outside
    /// [0, 1] or a filter that never converges).
    pub fn validate(&self) -> Result<()> {
        let level = &self.level;
        if !level.fft_size.is_power_of_two() || !(32..=32_768).contains(&level.fft_size) {
            return Err(OrbError::msg(format!(
                "fft_size must be a power of two between 32 and 32768, got {}",
                level.fft_size
            )));
        }
        if !(0.0..1.0).contains(&level.analyser_smoothing) {
            return Err(OrbError::msg("analyser_smoothing must be in [0, 1)"));
        }
        if level.max_decibels <= level.min_decibels {
            return Err(OrbError::msg("max_decibels must exceed min_decibels"));
        }
        if level.dynamic_range <= 0.0 {
            return Err(OrbError::msg("dynamic_range must be positive"));
        }
        check_alpha("level.smoothing", level.smoothing)?;
        check_alpha("render.smoothing", self.render.smoothing)?;
        if self.render.time_step <= 0.0 {
            return Err(OrbError::msg("render.time_step must be positive"));
        }
        let render = &self.render;
        check_gain("render.amplitude_gain", render.amplitude_gain)?;
        check_gain("render.speed_gain", render.speed_gain)?;
        check_gain("render.scale_gain", render.scale_gain)?;
        check_gain("render.glow_gain", render.glow_gain)?;

        let fallback = &self.fallback;
        check_gain("fallback.scale_gain", fallback.scale_gain)?;
        if !(0.0..=1.0).contains(&fallback.opacity_floor) {
            return Err(OrbError::msg(format!(
                "fallback.opacity_floor must be in [0, 1], got {}",
                fallback.opacity_floor
            )));
        }
        if !(fallback.opacity_exponent > 0.0 && fallback.opacity_exponent <= 1.0) {
            return Err(OrbError::msg(format!(
                "fallback.opacity_exponent must be in (0, 1], got {}",
                fallback.opacity_exponent
            )));
        }
        Ok(())
    }
}

fn check_gain(name: &str, gain: f32) -> Result<()> {
    if gain >= 0.0 && gain.is_finite() {
        Ok(())
    } else {
        Err(OrbError::msg(format!("{name} must be a non-negative number, got {gain}")))
    }
}

fn check_alpha(name: &str, alpha: f32) -> Result<()> {
    if alpha > 0.0 && alpha <= 1.0 {
        Ok(())
    } else {
        Err(OrbError::msg(format!("{name} must be in (0, 1], got {alpha}")))
    }
}

/// Settings for microphone analysis and the audio-domain smoothing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Analysis window in samples.
    pub fft_size: usize,
    /// Temporal smoothing applied by the analyser to bin magnitudes.
    pub analyser_smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// Mean byte magnitude treated as silence.
    pub noise_floor: f32,
    /// Byte magnitude span above the floor that maps onto a full level.
    pub dynamic_range: f32,
    /// First-stage exponential smoothing constant.
    pub smoothing: f32,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            fft_size: 1024,
            analyser_smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            noise_floor: 16.0,
            dynamic_range: 90.0,
            smoothing: 0.15,
        }
    }
}

/// Settings for the render loop and the shader uniforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Second-stage exponential smoothing constant.
    pub smoothing: f32,
    /// Shader time added per rendered frame.
    pub time_step: f32,
    pub base_color: [f32; 3],
    pub amplitude_base: f32,
    pub amplitude_gain: f32,
    pub speed_base: f32,
    pub speed_gain: f32,
    pub scale_gain: f32,
    pub glow_base: f32,
    pub glow_gain: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.25,
            time_step: 0.016,
            base_color: [0.42, 0.55, 1.0],
            amplitude_base: 0.18,
            amplitude_gain: 1.7,
            speed_base: 0.75,
            speed_gain: 0.5,
            scale_gain: 0.35,
            glow_base: 0.45,
            glow_gain: 0.8,
        }
    }
}

/// Settings for the non-GPU gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub scale_gain: f32,
    /// Opacity at silence.
    pub opacity_floor: f32,
    /// Exponent below one makes opacity rise faster than linear.
    pub opacity_exponent: f32,
    pub inner_color: String,
    pub outer_color: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            scale_gain: 0.35,
            opacity_floor: 0.35,
            opacity_exponent: 0.6,
            inner_color: "rgba(120, 150, 255, 0.95)".to_string(),
            outer_color: "rgba(40, 60, 160, 0)".to_string(),
        }
    }
}
