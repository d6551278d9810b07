//! Conditioning bundles and the guidance arithmetic that combines their predictions.
//!
//! Every denoising step runs exactly three transformer passes. Which three depends on the mode
//! and, for `TIA`, on whether the timestep is above `step_change`.

use candle_core::{DType, Device, Tensor};
use tracing::trace;

use super::offload::DeviceScope;
use super::pipeline::DiffusionTransformer;
use crate::config::{GenerationConfig, Mode};
use crate::error::{PipelineError, Result};

/// Inputs of one transformer pass besides the latents and the timestep.
#[derive(Debug, Clone)]
pub struct ConditioningBundle {
    pub seq_len: usize,
    /// `(T, 8, bands, dim)`
    pub audio: Tensor,
    /// `(4 + z_dim, T, h, w)` frame mask stacked over the conditioning latents.
    pub y: Tensor,
    /// `(L, D)` text context.
    pub context: Tensor,
}

/// Tensors shared by the bundles of one inference call.
#[derive(Debug, Clone)]
pub struct ConditioningInputs {
    pub seq_len: usize,
    pub audio: Tensor,
    pub audio_neg: Tensor,
    pub y_c: Tensor,
    pub y_null: Tensor,
    pub context: Tensor,
    pub context_null: Tensor,
}

impl ConditioningInputs {
    fn bundle(&self, audio: &Tensor, y: &Tensor, context: &Tensor) -> ConditioningBundle {
        ConditioningBundle {
            seq_len: self.seq_len,
            audio: audio.clone(),
            y: y.clone(),
            context: context.clone(),
        }
    }
}

/// `(4, T, h, w)` mask: ones on the trailing `ref_len` reference frames, zeros elsewhere.
///
/// The transformer was trained with this polarity (reference = 1); do not invert it.
pub fn frame_mask(
    latent_frames: usize,
    ref_len: usize,
    latent_size: (usize, usize),
    device: &Device,
) -> Result<Tensor> {
    if ref_len > latent_frames {
        return Err(PipelineError::shape(format!(
            "{ref_len} reference frames do not fit in {latent_frames} latent frames"
        )));
    }
    let (h, w) = latent_size;
    let generated = Tensor::zeros((4, latent_frames - ref_len, h, w), DType::F32, device)?;
    let reference = Tensor::ones((4, ref_len, h, w), DType::F32, device)?;
    Ok(Tensor::cat(&[generated, reference], 1)?)
}

/// `y_c`: mask over the zero-latent prefix followed by the reference latents.
pub fn conditioned_latents(mask: &Tensor, zero_prefix: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let latents = Tensor::cat(&[zero_prefix, reference], 1)?;
    Ok(Tensor::cat(&[mask, &latents], 0)?)
}

/// `y_null`: mask over the zero latent for the full length.
pub fn null_latents(mask: &Tensor, zero_latent: &Tensor) -> Result<Tensor> {
    Ok(Tensor::cat(&[mask, zero_latent], 0)?)
}

/// Guidance weights, read from the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceScales {
    pub scale_a: f64,
    pub scale_t: f64,
    pub step_change: i64,
}

impl GuidanceScales {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            scale_a: config.scale_a,
            scale_t: config.scale_t,
            step_change: config.step_change,
        }
    }
}

/// `scale_a·(full − partial) + text_weight·(partial − neg) + neg`.
///
/// Evaluated as `scale_a·full + (text_weight − scale_a)·partial + (1 − text_weight)·neg` so that
/// `scale_a = 0, text_weight = 1` returns `partial` bit for bit.
pub fn compose_guidance(
    scale_a: f64,
    text_weight: f64,
    full: &Tensor,
    partial: &Tensor,
    neg: &Tensor,
) -> Result<Tensor> {
    let full = full.affine(scale_a, 0.0)?;
    let partial = partial.affine(text_weight - scale_a, 0.0)?;
    let neg = neg.affine(1.0 - text_weight, 0.0)?;
    Ok(((full + partial)? + neg)?)
}

/// Bundles built for the run's mode; unused combinations are never materialised.
#[derive(Debug, Clone)]
pub enum ConditionSet {
    Tia {
        tia: ConditioningBundle,
        ti: ConditioningBundle,
        i: ConditioningBundle,
        null: ConditioningBundle,
    },
    Ta {
        ta: ConditioningBundle,
        t: ConditioningBundle,
        null: ConditioningBundle,
    },
}

impl ConditionSet {
    pub fn build(mode: Mode, inputs: &ConditioningInputs) -> Self {
        let c = inputs;
        match mode {
            Mode::Tia => ConditionSet::Tia {
                tia: c.bundle(&c.audio, &c.y_c, &c.context),
                ti: c.bundle(&c.audio_neg, &c.y_c, &c.context),
                i: c.bundle(&c.audio_neg, &c.y_c, &c.context_null),
                null: c.bundle(&c.audio_neg, &c.y_null, &c.context_null),
            },
            Mode::Ta => ConditionSet::Ta {
                ta: c.bundle(&c.audio, &c.y_null, &c.context),
                t: c.bundle(&c.audio_neg, &c.y_null, &c.context),
                null: c.bundle(&c.audio_neg, &c.y_null, &c.context_null),
            },
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            ConditionSet::Tia { .. } => Mode::Tia,
            ConditionSet::Ta { .. } => Mode::Ta,
        }
    }

    /// The three bundles evaluated at timestep `t` and the text weight applied to them.
    pub fn passes(
        &self,
        t: i64,
        scales: &GuidanceScales,
    ) -> ([&ConditioningBundle; 3], f64) {
        match self {
            ConditionSet::Tia { tia, ti, i, null } => {
                if t > scales.step_change {
                    ([tia, ti, i], scales.scale_t)
                } else {
                    ([tia, ti, null], scales.scale_t - 2.0)
                }
            }
            ConditionSet::Ta { ta, t: text, null } => ([ta, text, null], scales.scale_t),
        }
    }

    /// Guided velocity prediction for one step.
    pub fn predict(
        &self,
        dit: &mut dyn DiffusionTransformer,
        scope: &DeviceScope,
        latents: &Tensor,
        t: i64,
        scales: &GuidanceScales,
    ) -> Result<Tensor> {
        let timestep = Tensor::new(&[t as f32], latents.device())?;
        let ([full, partial, neg], text_weight) = self.passes(t, scales);
        trace!(t, text_weight, mode = %self.mode(), "guided prediction");

        let full = forward_pass(dit, scope, latents, &timestep, full)?;
        let partial = forward_pass(dit, scope, latents, &timestep, partial)?;
        let neg = forward_pass(dit, scope, latents, &timestep, neg)?;
        compose_guidance(scales.scale_a, text_weight, &full, &partial, &neg)
    }
}

/// One transformer pass; transient device memory is released when it returns.
fn forward_pass(
    dit: &mut dyn DiffusionTransformer,
    scope: &DeviceScope,
    latents: &Tensor,
    timestep: &Tensor,
    bundle: &ConditioningBundle,
) -> Result<Tensor> {
    let _release = scope.transient();
    let out = dit.forward(latents, timestep, bundle)?;
    drop(out.auxiliary);
    if out.prediction.dims() != latents.dims() {
        return Err(PipelineError::shape(format!(
            "transformer returned {:?} for latents {:?}",
            out.prediction.dims(),
            latents.dims()
        )));
    }
    Ok(out.prediction)
}
