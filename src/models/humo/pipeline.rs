//! Collaborator traits and the HuMo inference pipeline.
//!
//! [`HumoPipeline::inference`] prepares the conditioning (reference latents, audio windows, text
//! context), runs the guided denoising loop and decodes the result. Heavy models are only ever
//! touched through the [`MemoryOrchestrator`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Result as CandleResult, Tensor};
use tracing::{debug, info};

use super::audio::{
    AudioFeatureExtractor, audio_emb_window, pad_reference_region, silent_audio_embedding,
};
use super::conditioning::{
    ConditionSet, ConditioningBundle, ConditioningInputs, GuidanceScales, conditioned_latents,
    frame_mask, null_latents,
};
use super::offload::{DeviceScope, MemoryOrchestrator, Offload};
use super::reference::{ZeroLatentTemplate, empty_reference_latent, encode_reference_latents};
use super::scheduler::{FlowUniPCMultistepScheduler, FlowUniPCSchedulerConfig};
use crate::config::{ConfigError, FrameCount, GenerationConfig};
use crate::error::{PipelineError, Result};
use crate::utils::rng::{NoiseGenerator, resolve_seed};

pub trait Scheduler {
    fn order(&self) -> usize;

    /// Stores the inference schedule and returns its (decreasing) integer timesteps.
    fn set_timesteps(
        &mut self,
        num_inference_steps: usize,
        shift: f64,
        device: &Device,
    ) -> CandleResult<Vec<i64>>;

    /// x_t -> x_{t-1}
    fn step(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor)
    -> CandleResult<Tensor>;
}

pub trait TextEncoder: Offload {
    /// One `(L, D)` context per prompt.
    fn encode(&mut self, prompts: &[String], device: &Device) -> CandleResult<Vec<Tensor>>;
}

pub trait VideoVae: Offload {
    fn z_dim(&self) -> usize;

    /// `(3, F, H, W)` in `[-1, 1]` -> `(z_dim, (F - 1) / 4 + 1, H / 8, W / 8)`
    fn encode(&self, videos: &[Tensor]) -> CandleResult<Vec<Tensor>>;

    /// Inverse of [`VideoVae::encode`].
    fn decode(&self, latents: &[Tensor]) -> CandleResult<Vec<Tensor>>;
}

/// Output of one transformer pass. Only the prediction is used.
#[derive(Debug)]
pub struct DitOutput {
    pub prediction: Tensor,
    pub auxiliary: Option<Tensor>,
}

pub trait DiffusionTransformer: Offload {
    fn forward(
        &mut self,
        latents: &Tensor,
        timestep: &Tensor,
        conditioning: &ConditioningBundle,
    ) -> CandleResult<DitOutput>;
}

/// One video to generate.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub prompt: String,
    /// Falls back to the configured negative prompt when empty.
    pub negative_prompt: String,
    pub ref_images: Vec<PathBuf>,
    pub audio: Option<PathBuf>,
    /// Negative values draw a fresh seed.
    pub seed: i64,
}

#[derive(Debug)]
pub struct GeneratedVideo {
    /// `(3, F, H, W)` in `[-1, 1]`.
    pub frames: Tensor,
    pub seed: u64,
    /// Generated latent frames, reference frames excluded.
    pub latent_frames: usize,
}

/// Latent-space geometry of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentLayout {
    pub frame_num: usize,
    pub ref_len: usize,
    /// Total latent frames, reference frames included.
    pub frames: usize,
    pub height: usize,
    pub width: usize,
    pub seq_len: usize,
}

impl LatentLayout {
    pub fn new(config: &GenerationConfig, frame_num: usize, ref_len: usize) -> Self {
        let (st, _, _) = config.vae_stride;
        let (_, ph, pw) = config.patch_size;
        let (height, width) = config.latent_size();
        let frames = (frame_num - 1) / st + 1 + ref_len;
        // sequence-parallel multiple is 1, so no rounding beyond the ceiling
        let seq_len = (height * width * frames).div_ceil(ph * pw);
        Self {
            frame_num,
            ref_len,
            frames,
            height,
            width,
            seq_len,
        }
    }

    pub fn target_shape(&self, z_dim: usize) -> (usize, usize, usize, usize) {
        (z_dim, self.frames, self.height, self.width)
    }
}

pub struct HumoPipeline<'a> {
    config: Arc<GenerationConfig>,
    models: MemoryOrchestrator<'a>,
    zero_latent: ZeroLatentTemplate,
}

impl<'a> HumoPipeline<'a> {
    /// Fails when the VAE or the zero-latent template disagree with `config.z_dim`.
    pub fn new(
        config: Arc<GenerationConfig>,
        models: MemoryOrchestrator<'a>,
        zero_latent: ZeroLatentTemplate,
    ) -> Result<Self> {
        let expected = config.z_dim;
        for (what, found) in [
            ("VAE", models.vae_z_dim()),
            ("zero latent", zero_latent.channels()),
        ] {
            if found != expected {
                return Err(ConfigError::LatentChannels {
                    what,
                    found,
                    expected,
                }
                .into());
            }
        }
        Ok(Self {
            config,
            models,
            zero_latent,
        })
    }

    /// Loads the zero-latent template that matches the configured height.
    pub fn load_zero_latent(config: &GenerationConfig, device: &Device) -> Result<ZeroLatentTemplate> {
        let path = config.zero_latent_path()?;
        info!(path = %path.display(), height = config.height, "loading zero latent");
        ZeroLatentTemplate::load(path, device)
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn models(&self) -> &MemoryOrchestrator<'a> {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut MemoryOrchestrator<'a> {
        &mut self.models
    }

    fn audio_features(
        &mut self,
        audio: Option<&Path>,
        device: &Device,
    ) -> Result<(Tensor, usize)> {
        let frames = self.config.frames;
        match (audio, frames) {
            (Some(path), frames) => {
                let (emb, len) = self
                    .models
                    .with_audio_encoder(|enc, _| enc.preprocess(path, device))?;
                let frame_num = match frames {
                    FrameCount::Fixed(n) => n,
                    FrameCount::FromAudio => len,
                };
                Ok((emb, frame_num))
            }
            (None, FrameCount::Fixed(n)) => Ok((silent_audio_embedding(n, device)?, n)),
            (None, FrameCount::FromAudio) => Err(ConfigError::FramesFromAudioWithoutAudio.into()),
        }
    }

    fn encode_prompts(&mut self, prompt: &str, negative: &str) -> Result<(Tensor, Tensor)> {
        let prompts = [prompt.to_string(), negative.to_string()];
        let mut contexts = self
            .models
            .with_text_encoder(|te, scope| Ok(te.encode(&prompts, scope.compute())?))?;
        if contexts.len() != 2 {
            return Err(PipelineError::shape(format!(
                "text encoder returned {} contexts for 2 prompts",
                contexts.len()
            )));
        }
        let context_null = contexts.remove(1);
        let context = contexts.remove(0);
        Ok((context, context_null))
    }

    /// Generates one video.
    pub fn inference(&mut self, request: &InferenceRequest) -> Result<GeneratedVideo> {
        let config = Arc::clone(&self.config);
        let device = self.models.scope().compute().clone();
        let z_dim = config.z_dim;
        let (width, height) = (config.width, config.height);

        let (audio_emb, frame_num) = self.audio_features(request.audio.as_deref(), &device)?;
        let frame_num = config.effective_frame_count(frame_num);
        if frame_num == 0 {
            return Err(ConfigError::InvalidFrameCount(0).into());
        }

        let latents_ref = if request.ref_images.is_empty() {
            empty_reference_latent(z_dim, config.latent_size(), &device)?
        } else {
            let images = &request.ref_images;
            self.models.with_vae(|vae, scope| {
                encode_reference_latents(&*vae, images.as_slice(), width, height, scope.compute())
            })?
        };
        let ref_len = latents_ref.dim(1)?;

        let windows = audio_emb_window(&audio_emb, frame_num, 0)?;
        drop(audio_emb);
        let audio = pad_reference_region(&windows.windows, ref_len)?;
        let audio_neg = audio.zeros_like()?;

        let layout = LatentLayout::new(&config, frame_num, ref_len);
        if audio.dim(0)? != layout.frames {
            return Err(PipelineError::shape(format!(
                "{} audio groups for {} latent frames",
                audio.dim(0)?,
                layout.frames
            )));
        }

        let negative = if request.negative_prompt.is_empty() {
            config.sample_neg_prompt.as_str()
        } else {
            request.negative_prompt.as_str()
        };
        let seed = resolve_seed(request.seed);
        info!(
            seed,
            frame_num,
            ref_len,
            latent_frames = layout.frames,
            seq_len = layout.seq_len,
            mode = %config.mode,
            "HuMo generate start"
        );

        let mut latents =
            NoiseGenerator::new(seed).randn(layout.target_shape(z_dim), &device)?;
        let (context, context_null) = self.encode_prompts(&request.prompt, negative)?;

        let mask = frame_mask(
            layout.frames,
            ref_len,
            (layout.height, layout.width),
            &device,
        )?;
        let zero_vae = self.zero_latent.prefix(layout.frames, &device)?;
        let y_c = conditioned_latents(
            &mask,
            &zero_vae.narrow(1, 0, layout.frames - ref_len)?,
            &latents_ref,
        )?;
        let y_null = null_latents(&mask, &zero_vae)?;
        drop((mask, zero_vae, latents_ref));

        let inputs = ConditioningInputs {
            seq_len: layout.seq_len,
            audio,
            audio_neg,
            y_c,
            y_null,
            context,
            context_null,
        };
        let conditions = ConditionSet::build(config.mode, &inputs);
        drop(inputs);
        let scales = GuidanceScales::from_config(&config);

        let mut scheduler = FlowUniPCMultistepScheduler::new(FlowUniPCSchedulerConfig::default())?;
        let timesteps = scheduler.set_timesteps(
            config.sampling.steps,
            config.sampling.shift,
            &device,
        )?;

        latents = self.models.with_dit(|dit, scope| {
            denoise(dit, scope, &mut scheduler, &conditions, &scales, &timesteps, latents)
        })?;
        drop(conditions);

        let generated = layout.frames - ref_len;
        let latents = latents.narrow(1, 0, generated)?;
        debug!(shape = ?latents.dims(), "decoding latents");
        let mut videos = self
            .models
            .with_vae(|vae, _| Ok(vae.decode(&[latents])?))?;
        let frames = videos
            .pop()
            .ok_or_else(|| PipelineError::shape("VAE decoded no video"))?;
        info!(frames = ?frames.dims(), seed, "HuMo generate done");

        Ok(GeneratedVideo {
            frames,
            seed,
            latent_frames: generated,
        })
    }
}

/// Runs the guided denoising loop over `timesteps`.
pub fn denoise(
    dit: &mut dyn DiffusionTransformer,
    scope: &DeviceScope,
    scheduler: &mut dyn Scheduler,
    conditions: &ConditionSet,
    scales: &GuidanceScales,
    timesteps: &[i64],
    mut latents: Tensor,
) -> Result<Tensor> {
    let total = timesteps.len();
    for (i, &t) in timesteps.iter().enumerate() {
        let noise_pred = conditions.predict(dit, scope, &latents, t, scales)?;
        latents = scheduler.step(&noise_pred, t, &latents)?;
        info!(step = i + 1, total, t, "denoising step");
    }
    Ok(latents)
}
