/// First-order exponential smoother over a level in [0, 1].
///
/// Each step moves the value a fixed fraction `alpha` of the way toward the
/// target, so a constant target is approached geometrically and never
/// overshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialSmoother {
    value: f32,
    alpha: f32,
}

impl ExponentialSmoother {
    pub fn new(alpha: f32) -> Self {
        Self {
            value: 0.0,
            alpha: alpha.clamp(f32::EPSILON, 1.0),
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Advances one step toward `target` and returns the new value. Targets
    /// outside [0, 1] are clamped and NaN counts as silence.
    pub fn step(&mut self, target: f32) -> f32 {
        let target = sanitize(target);
        self.value = sanitize(self.value + (target - self.value) * self.alpha);
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

pub(crate) fn sanitize(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_alpha() {
        let mut smoother = ExponentialSmoother::new(0.15);
        assert!((smoother.step(1.0) - 0.15).abs() < 1e-6);
    }

    #[test]
    fn converges_monotonically_without_leaving_range() {
        for target in [0.0_f32, 0.1, 0.5, 0.9, 1.0] {
            let mut smoother = ExponentialSmoother::new(0.15);
            let mut previous_gap = (target - smoother.value()).abs();
            for _ in 0..200 {
                let value = smoother.step(target);
                assert!((0.0..=1.0).contains(&value));
                let gap = (target - value).abs();
                assert!(gap <= previous_gap);
                previous_gap = gap;
            }
            assert!(previous_gap < 1e-4, "target {target} gap {previous_gap}");
        }
    }

    #[test]
    fn clamps_out_of_range_and_nan_targets() {
        let mut smoother = ExponentialSmoother::new(1.0);
        assert_eq!(smoother.step(4.0), 1.0);
        assert_eq!(smoother.step(-2.0), 0.0);
        smoother.step(0.5);
        assert_eq!(smoother.step(f32::NAN), 0.0);
    }

    #[test]
    fn reset_returns_to_silence() {
        let mut smoother = ExponentialSmoother::new(0.25);
        smoother.step(1.0);
        smoother.reset();
        assert_eq!(smoother.value(), 0.0);
    }
}
