use serde::Serialize;

use crate::{config::FallbackConfig, smoothing::sanitize};

/// Declarative style for the gradient orb: a radial gradient scaled and faded
/// by the level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStyle {
    pub level: f32,
    pub scale: f32,
    pub opacity: f32,
    pub background: String,
}

impl FallbackStyle {
    /// Inline CSS for a host that renders into a styled element.
    pub fn to_css(&self) -> String {
        format!(
            "transform: scale({:.4}); opacity: {:.4}; background: {};",
            self.scale, self.opacity, self.background
        )
    }
}

/// Non-GPU renderer used whenever the shader path is unavailable.
///
/// Louder input gives a bigger, brighter gradient, following the same
/// monotonic mapping as the shader path.
#[derive(Debug, Clone)]
pub struct FallbackRenderer {
    config: FallbackConfig,
    background: String,
    last: Option<FallbackStyle>,
}

impl FallbackRenderer {
    pub fn new(config: FallbackConfig) -> Self {
        let background = format!(
            "radial-gradient(circle at 50% 50%, {} 0%, {} 70%)",
            config.inner_color, config.outer_color
        );
        Self {
            config,
            background,
            last: None,
        }
    }

    /// Style for `level`. The style is only rebuilt when the level changes.
    pub fn render(&mut self, level: f32) -> &FallbackStyle {
        let level = sanitize(level);
        let style = match self.last.take() {
            Some(style) if style.level == level => style,
            _ => FallbackStyle {
                level,
                scale: 1.0 + level * self.config.scale_gain,
                opacity: self.opacity(level),
                background: self.background.clone(),
            },
        };
        self.last.insert(style)
    }

    pub fn last(&self) -> Option<&FallbackStyle> {
        self.last.as_ref()
    }

    fn opacity(&self, level: f32) -> f32 {
        let floor = self.config.opacity_floor.clamp(0.0, 1.0);
        let rise = level.powf(self.config.opacity_exponent);
        (floor + (1.0 - floor) * rise).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_follows_level() {
        let mut renderer = FallbackRenderer::new(FallbackConfig::default());
        assert!((renderer.render(0.0).scale - 1.0).abs() < 1e-6);
        assert!((renderer.render(1.0).scale - 1.35).abs() < 1e-6);
    }

    #[test]
    fn opacity_rises_faster_than_linear_and_caps() {
        let mut renderer = FallbackRenderer::new(FallbackConfig {
            opacity_floor: 0.0,
            ..FallbackConfig::default()
        });
        assert!(renderer.render(0.25).opacity > 0.25);
        assert!(renderer.render(0.5).opacity > 0.5);
        assert!((renderer.render(1.0).opacity - 1.0).abs() < 1e-6);
        assert!(renderer.render(7.0).opacity <= 1.0);
    }

    #[test]
    fn monotonic_like_the_shader_path() {
        let mut renderer = FallbackRenderer::new(FallbackConfig::default());
        let mut previous = renderer.render(0.0).clone();
        for step in 1..=50 {
            let style = renderer.render(step as f32 / 50.0).clone();
            assert!(style.scale >= previous.scale);
            assert!(style.opacity >= previous.opacity);
            previous = style;
        }
    }

    #[test]
    fn css_carries_scale_and_gradient() {
        let mut renderer = FallbackRenderer::new(FallbackConfig::default());
        let css = renderer.render(1.0).to_css();
        assert!(css.contains("scale(1.3500)"));
        assert!(css.contains("radial-gradient"));
    }
}
