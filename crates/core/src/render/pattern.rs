//! CPU evaluation of the orb fragment shader (`shaders/orb.frag`).
//!
//! Keep the two in step: the headless graphics context shades with this
//! function so that tests see what the GPU would draw.

/// Warp iterations per pixel.
pub const WARP_ITERATIONS: u32 = 8;

/// Uniform values the pattern reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternUniforms {
    pub time: f32,
    pub speed: f32,
    pub amplitude: f32,
    pub resolution: [f32; 2],
    pub base_color: [f32; 3],
}

/// Shades one pixel at `uv` in [0, 1]² and returns an RGB colour.
pub fn shade(uv: [f32; 2], uniforms: &PatternUniforms) -> [f32; 3] {
    let [width, height] = uniforms.resolution;
    let min_side = width.min(height).max(1.0);
    let px = (uv[0] * 2.0 - 1.0) * width.max(1.0) / min_side;
    let py = (uv[1] * 2.0 - 1.0) * height.max(1.0) / min_side;

    let t = -uniforms.time * 0.5 * uniforms.speed;
    let mut a = 0.0_f32;
    let mut d = t;
    for i in 0..WARP_ITERATIONS {
        let i = i as f32;
        a += (i - d - a * px).cos();
        d += (py * i + a).sin() * uniforms.amplitude;
    }
    d += t;

    let first = [
        (px * d).cos() * 0.6 + 0.4,
        (py * a).cos() * 0.6 + 0.4,
        (a + d).cos() * 0.5 + 0.5,
    ];
    let mix = [d.cos(), a.cos(), 2.5_f32.cos()];

    let mut color = [0.0; 3];
    for channel in 0..3 {
        let warped = (first[channel] * mix[channel] * 0.5 + 0.5).cos();
        color[channel] = warped * uniforms.base_color[channel];
    }
    color
}
