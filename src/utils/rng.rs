//! Seed resolution and seeded gaussian noise.
//!
//! Noise comes from a PCG32 stream with a Box–Muller transform, so a given seed yields the same
//! latents on every platform and device.

use candle_core::{Device, Result, Shape, Tensor};
use rand::Rng;

/// Upper bound of the per-job seed drawn when the configuration leaves the seed unset.
pub const JOB_SEED_MAX: i64 = 100_000;

/// Maps a requested seed to the one actually used: negative values draw a fresh seed.
pub fn resolve_seed(seed: i64) -> u64 {
    if seed >= 0 {
        seed as u64
    } else {
        rand::thread_rng().gen_range(0..=i64::MAX as u64)
    }
}

/// Seed for one job of a run: the configured seed, or a fresh draw in `[0, JOB_SEED_MAX]`.
pub fn job_seed(configured: Option<i64>) -> i64 {
    configured.unwrap_or_else(|| rand::thread_rng().gen_range(0..=JOB_SEED_MAX))
}

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const NOISE_STREAM: u64 = 0x4875_4d6f;

/// PCG32 (XSH-RR) generator producing standard normal samples.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    state: u64,
    inc: u64,
    spare: Option<f64>,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (NOISE_STREAM << 1) | 1,
            spare: None,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(PCG_MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// Uniform sample in `(0, 1]` with 53 bits of precision.
    fn next_open_unit(&mut self) -> f64 {
        let hi = u64::from(self.next_u32()) << 21;
        let lo = u64::from(self.next_u32()) >> 11;
        ((hi | lo) as f64 + 1.0) / (1u64 << 53) as f64
    }

    pub fn next_gaussian(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        let u1 = self.next_open_unit();
        let u2 = self.next_open_unit();
        let mag = (-2.0 * u1.ln()).sqrt();
        let theta = std::f64::consts::TAU * u2;
        self.spare = Some(mag * theta.sin());
        mag * theta.cos()
    }

    /// `f32` tensor of standard normal samples.
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.next_gaussian() as f32)
            .collect();
        Tensor::from_vec(data, shape, device)
    }
}
