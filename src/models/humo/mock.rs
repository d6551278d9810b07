//! Lightweight stand-ins for the heavy models.
//!
//! They keep every shape contract of the real collaborators, so the full pipeline (scheduling,
//! guidance, residency, persistence) runs without weights. Used by `humo --mock` and the tests.

use std::cell::Cell;
use std::rc::Rc;

use candle_core::{Device, Result, Tensor, bail};

use super::conditioning::ConditioningBundle;
use super::offload::Offload;
use super::pipeline::{DiffusionTransformer, DitOutput, TextEncoder, VideoVae};

/// Prompt-dependent constant context.
#[derive(Debug, Clone)]
pub struct MockTextEncoder {
    pub tokens: usize,
    pub dim: usize,
    device: Device,
}

impl MockTextEncoder {
    pub fn new(tokens: usize, dim: usize) -> Self {
        Self {
            tokens,
            dim,
            device: Device::Cpu,
        }
    }
}

impl Default for MockTextEncoder {
    fn default() -> Self {
        Self::new(16, 64)
    }
}

impl Offload for MockTextEncoder {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode(&mut self, prompts: &[String], device: &Device) -> Result<Vec<Tensor>> {
        prompts
            .iter()
            .map(|p| {
                let h = p.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                let value = (h % 997) as f32 / 997.0;
                Tensor::full(value, (self.tokens, self.dim), device)
            })
            .collect()
    }
}

/// Frame-subsampling, average-pooling "VAE" with the real strides.
#[derive(Debug, Clone)]
pub struct MockVae {
    z_dim: usize,
    temporal: usize,
    spatial: usize,
    device: Device,
}

impl MockVae {
    pub fn new(z_dim: usize) -> Self {
        Self {
            z_dim,
            temporal: 4,
            spatial: 8,
            device: Device::Cpu,
        }
    }
}

impl Default for MockVae {
    fn default() -> Self {
        Self::new(16)
    }
}

impl Offload for MockVae {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl VideoVae for MockVae {
    fn z_dim(&self) -> usize {
        self.z_dim
    }

    fn encode(&self, videos: &[Tensor]) -> Result<Vec<Tensor>> {
        videos
            .iter()
            .map(|v| {
                let (c, f, _, _) = v.dims4()?;
                let keep: Vec<u32> = (0..f).step_by(self.temporal).map(|i| i as u32).collect();
                let keep = Tensor::new(keep, v.device())?;
                let pooled = v
                    .index_select(&keep, 1)?
                    .permute((1, 0, 2, 3))?
                    .contiguous()?
                    .avg_pool2d(self.spatial)?
                    .permute((1, 0, 2, 3))?;
                let reps = self.z_dim.div_ceil(c);
                pooled
                    .repeat((reps, 1, 1, 1))?
                    .narrow(0, 0, self.z_dim)?
                    .contiguous()
            })
            .collect()
    }

    fn decode(&self, latents: &[Tensor]) -> Result<Vec<Tensor>> {
        latents
            .iter()
            .map(|z| {
                let (_, t, h, w) = z.dims4()?;
                if t == 0 {
                    bail!("cannot decode an empty latent");
                }
                let expand: Vec<u32> = std::iter::once(0)
                    .chain((1..t as u32).flat_map(|i| std::iter::repeat_n(i, self.temporal)))
                    .collect();
                let expand = Tensor::new(expand, z.device())?;
                z.narrow(0, 0, 3)?
                    .permute((1, 0, 2, 3))?
                    .contiguous()?
                    .upsample_nearest2d(h * self.spatial, w * self.spatial)?
                    .index_select(&expand, 0)?
                    .permute((1, 0, 2, 3))?
                    .tanh()?
                    .contiguous()
            })
            .collect()
    }
}

/// Velocity predictor that mixes every conditioning input into its output.
#[derive(Debug, Clone)]
pub struct MockTransformer {
    calls: Rc<Cell<usize>>,
    fail_after: Option<usize>,
    device: Device,
}

impl MockTransformer {
    pub fn new() -> Self {
        Self {
            calls: Rc::new(Cell::new(0)),
            fail_after: None,
            device: Device::Cpu,
        }
    }

    /// Fails every forward pass after the first `n`.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new()
        }
    }

    /// Shared forward-pass counter.
    pub fn calls(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.calls)
    }
}

impl Default for MockTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Offload for MockTransformer {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl DiffusionTransformer for MockTransformer {
    fn forward(
        &mut self,
        latents: &Tensor,
        timestep: &Tensor,
        conditioning: &ConditioningBundle,
    ) -> Result<DitOutput> {
        let n = self.calls.get();
        if self.fail_after.is_some_and(|limit| n >= limit) {
            bail!("mock transformer failure at pass {n}");
        }
        self.calls.set(n + 1);

        let z_dim = latents.dim(0)?;
        let cond = conditioning.y.narrow(0, 4, z_dim)?;
        let bias = ((conditioning.audio.mean_all()? + conditioning.context.mean_all()?)? * 0.01)?;
        let t = (timestep.mean_all()? * 1e-4)?;
        let prediction = ((latents * 0.1)? + (cond * 0.05)?)?
            .broadcast_add(&bias)?
            .broadcast_add(&t)?;
        Ok(DitOutput {
            prediction,
            auxiliary: None,
        })
    }
}
