//! End-to-end tests of the HuMo pipeline with stand-in models
//!
//! - Forward-pass count per step and output geometry
//! - Seed determinism
//! - Frame count derived from audio
//! - Latent channel and dtype agreement with the VAE
//! - Residency order and error propagation

use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_humo::config::ConfigError;
use candle_humo::mock::{MockTextEncoder, MockTransformer, MockVae};
use candle_humo::offload::Transition;
use candle_humo::pipeline::LatentLayout;
use candle_humo::{
    DeviceScope, GenerationConfig, HumoPipeline, InferenceRequest, MemoryOrchestrator, Offload,
    PipelineError, PrecomputedAudioFeatures, Residency, VideoVae, ZeroLatentTemplate,
};
use image::{Rgb, RgbImage};

// ============================================================================
// Generation Tests
// ============================================================================

#[test]
fn test_ta_run_three_passes_per_step() {
    let config = small_config("TA", 9, 4);
    let (mut pipeline, calls) = build_pipeline(&config, MockTransformer::new());

    let video = pipeline.inference(&request("a person talking", 42)).unwrap();

    assert_eq!(calls.get(), 4 * 3);
    // 9 frames -> 3 latent frames; the single reference frame is stripped
    assert_eq!(video.latent_frames, 3);
    assert_eq!(video.frames.dims(), &[3, 9, 32, 64]);
    assert_eq!(video.seed, 42);
}

#[test]
fn test_tia_run_with_reference_image() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("face.png");
    RgbImage::from_pixel(48, 48, Rgb([200, 120, 90])).save(&img).unwrap();

    let config = small_config("TIA", 5, 3);
    let (mut pipeline, calls) = build_pipeline(&config, MockTransformer::new());
    let mut req = request("a singer", 7);
    req.ref_images = vec![img];

    let video = pipeline.inference(&req).unwrap();
    assert_eq!(calls.get(), 9);
    assert_eq!(video.latent_frames, 2);
    assert_eq!(video.frames.dims(), &[3, 5, 32, 64]);
}

#[test]
fn test_ta_run_default_frame_count() {
    // 76 frames at 50 steps: the frame count the default configuration ships with
    let config = small_config("TA", 76, 50);
    let (mut pipeline, calls) = build_pipeline(&config, MockTransformer::new());

    let video = pipeline.inference(&request("a person talking", 42)).unwrap();

    assert_eq!(calls.get(), 50 * 3);
    // 76 -> 73 frames -> 19 generated latent frames
    assert_eq!(video.latent_frames, 19);
    assert_eq!(video.frames.dims(), &[3, 73, 32, 64]);
}

#[test]
fn test_tia_run_with_bf16_vae() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("face.png");
    RgbImage::from_pixel(48, 48, Rgb([200, 120, 90])).save(&img).unwrap();

    let config = small_config("TIA", 5, 2);
    let (mut pipeline, calls) = build_pipeline_with_vae(
        &config,
        Box::new(Bf16Vae(MockVae::new(config.z_dim))),
        MockTransformer::new(),
    );
    let mut req = request("a singer", 7);
    req.ref_images = vec![img];

    let video = pipeline.inference(&req).unwrap();
    assert_eq!(calls.get(), 6);
    assert_eq!(video.latent_frames, 2);
    assert_eq!(video.frames.dims(), &[3, 5, 32, 64]);
}

#[test]
fn test_frame_count_is_rounded_down() {
    let config = small_config("TA", 12, 1);
    let (mut pipeline, _) = build_pipeline(&config, MockTransformer::new());
    let video = pipeline.inference(&request("x", 1)).unwrap();
    // 12 -> 9 frames
    assert_eq!(video.frames.dims()[1], 9);
}

#[test]
fn test_same_seed_same_video() {
    let config = small_config("TA", 5, 3);
    let (mut a, _) = build_pipeline(&config, MockTransformer::new());
    let (mut b, _) = build_pipeline(&config, MockTransformer::new());

    let va = a.inference(&request("same prompt", 42)).unwrap();
    let vb = b.inference(&request("same prompt", 42)).unwrap();
    assert_eq!(values(&va.frames), values(&vb.frames));

    let vc = b.inference(&request("same prompt", 43)).unwrap();
    assert_ne!(values(&va.frames), values(&vc.frames));
}

#[test]
fn test_negative_seed_is_resolved() {
    let config = small_config("TA", 1, 1);
    let (mut pipeline, _) = build_pipeline(&config, MockTransformer::new());
    let video = pipeline.inference(&request("x", -1)).unwrap();
    assert!(video.seed <= i64::MAX as u64);
    assert_eq!(video.frames.dims(), &[3, 1, 32, 64]);
}

#[test]
fn test_frames_follow_audio_length() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("voice.wav");
    write_features(&wav, 14);

    let config = small_config("TA", -1, 2);
    let (mut pipeline, _) = build_pipeline(&config, MockTransformer::new());
    let mut req = request("x", 3);
    req.audio = Some(wav);

    let video = pipeline.inference(&req).unwrap();
    // 14 audio frames -> 13 video frames
    assert_eq!(video.frames.dims()[1], 13);
    assert_eq!(video.latent_frames, 4);
}

#[test]
fn test_frames_from_audio_without_audio_is_rejected() {
    let config = small_config("TA", -1, 2);
    let (mut pipeline, calls) = build_pipeline(&config, MockTransformer::new());
    let err = pipeline.inference(&request("x", 3)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::FramesFromAudioWithoutAudio)
    ));
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_frames_from_audio_is_checked_before_reference_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("face.png");
    RgbImage::from_pixel(48, 48, Rgb([10, 20, 30])).save(&img).unwrap();

    let config = small_config("TIA", -1, 2);
    let (mut pipeline, calls) = build_pipeline(&config, MockTransformer::new());
    let mut req = request("x", 3);
    req.ref_images = vec![img];

    let err = pipeline.inference(&req).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::FramesFromAudioWithoutAudio)
    ));
    assert_eq!(calls.get(), 0);
    // the VAE was never loaded
    assert!(pipeline.models_mut().take_transitions().is_empty());
}

#[test]
fn test_vae_latent_channels_must_match_config() {
    let config = small_config("TA", 5, 2);
    let device = Device::Cpu;
    let models = MemoryOrchestrator::new(
        DeviceScope::new(device.clone()),
        Box::new(MockTextEncoder::default()),
        Box::new(MockVae::new(8)),
        Box::new(MockTransformer::new()),
        Box::new(PrecomputedAudioFeatures::new(config.audio_encoding)),
    );
    let zero = ZeroLatentTemplate::zeros(config.z_dim, 8, config.latent_size(), &device).unwrap();

    let err = HumoPipeline::new(Arc::clone(&config), models, zero).err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::LatentChannels {
            what: "VAE",
            found: 8,
            expected: 16,
        })
    ));
}

#[test]
fn test_zero_latent_channels_must_match_config() {
    let config = small_config("TA", 5, 2);
    let device = Device::Cpu;
    let models = MemoryOrchestrator::new(
        DeviceScope::new(device.clone()),
        Box::new(MockTextEncoder::default()),
        Box::new(MockVae::new(config.z_dim)),
        Box::new(MockTransformer::new()),
        Box::new(PrecomputedAudioFeatures::new(config.audio_encoding)),
    );
    let zero = ZeroLatentTemplate::zeros(4, 8, config.latent_size(), &device).unwrap();

    let err = HumoPipeline::new(Arc::clone(&config), models, zero).err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::LatentChannels { what: "zero latent", .. })
    ));
}

#[test]
fn test_latent_layout() {
    let config = GenerationConfig::from_json_str("{}").unwrap();
    let layout = LatentLayout::new(&config, 97, 1);
    assert_eq!(layout.frames, 26);
    assert_eq!((layout.height, layout.width), (60, 104));
    assert_eq!(layout.seq_len, 60 * 104 * 26 / 4);
    assert_eq!(layout.target_shape(16), (16, 26, 60, 104));
}

// ============================================================================
// Residency Tests
// ============================================================================

#[test]
fn test_models_are_loaded_one_at_a_time() {
    let config = small_config("TA", 5, 2);
    let (mut pipeline, _) = build_pipeline(&config, MockTransformer::new());
    pipeline.inference(&request("x", 5)).unwrap();

    let transitions = pipeline.models_mut().take_transitions();
    let order: Vec<(&str, Residency)> = transitions.iter().map(|t| (t.model, t.to)).collect();
    assert_eq!(
        order,
        vec![
            ("text_encoder", Residency::Resident),
            ("text_encoder", Residency::Offloaded),
            ("dit", Residency::Resident),
            ("dit", Residency::Offloaded),
            ("vae", Residency::Resident),
            ("vae", Residency::Offloaded),
        ]
    );
    assert_exclusive(&transitions);
    assert!(
        pipeline
            .models()
            .residency()
            .iter()
            .all(|(_, r)| *r == Residency::Offloaded)
    );
}

#[test]
fn test_transformer_failure_offloads_and_propagates() {
    let config = small_config("TA", 5, 3);
    let (mut pipeline, calls) = build_pipeline(&config, MockTransformer::failing_after(4));

    let err = pipeline.inference(&request("x", 5)).unwrap_err();
    assert!(matches!(err, PipelineError::Candle(_)));
    assert_eq!(calls.get(), 4);
    assert!(
        pipeline
            .models()
            .residency()
            .iter()
            .all(|(_, r)| *r == Residency::Offloaded)
    );
}

// ============================================================================
// Helper functions
// ============================================================================

fn small_config(mode: &str, frames: i64, steps: usize) -> Arc<GenerationConfig> {
    let json = serde_json::json!({
        "mode": mode,
        "width": 64,
        "height": 32,
        "frames": frames,
        "audio_encoding": "wav2vec",
        "sample_neg_prompt": "blurry, static",
        "sampling": { "steps": steps, "shift": 5.0 },
    });
    Arc::new(GenerationConfig::from_json_str(&json.to_string()).unwrap())
}

fn build_pipeline(
    config: &Arc<GenerationConfig>,
    dit: MockTransformer,
) -> (HumoPipeline<'static>, Rc<Cell<usize>>) {
    build_pipeline_with_vae(config, Box::new(MockVae::new(config.z_dim)), dit)
}

fn build_pipeline_with_vae(
    config: &Arc<GenerationConfig>,
    vae: Box<dyn VideoVae>,
    dit: MockTransformer,
) -> (HumoPipeline<'static>, Rc<Cell<usize>>) {
    let device = Device::Cpu;
    let calls = dit.calls();
    let models = MemoryOrchestrator::new(
        DeviceScope::new(device.clone()),
        Box::new(MockTextEncoder::default()),
        vae,
        Box::new(dit),
        Box::new(PrecomputedAudioFeatures::new(config.audio_encoding)),
    );
    let zero = ZeroLatentTemplate::zeros(config.z_dim, 32, config.latent_size(), &device).unwrap();
    (HumoPipeline::new(Arc::clone(config), models, zero).unwrap(), calls)
}

/// Encodes to bf16, as half-precision VAE weights do.
struct Bf16Vae(MockVae);

impl Offload for Bf16Vae {
    fn move_to(&mut self, device: &Device) -> candle_core::Result<()> {
        self.0.move_to(device)
    }
}

impl VideoVae for Bf16Vae {
    fn z_dim(&self) -> usize {
        self.0.z_dim()
    }

    fn encode(&self, videos: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        self.0
            .encode(videos)?
            .iter()
            .map(|z| z.to_dtype(DType::BF16))
            .collect()
    }

    fn decode(&self, latents: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        self.0.decode(latents)
    }
}

fn request(prompt: &str, seed: i64) -> InferenceRequest {
    InferenceRequest {
        prompt: prompt.to_string(),
        seed,
        ..Default::default()
    }
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn write_features(wav: &Path, frames: usize) {
    let emb = Tensor::rand(0f32, 1f32, (frames, 5, 8), &Device::Cpu).unwrap();
    let mut tensors = HashMap::new();
    tensors.insert(PrecomputedAudioFeatures::TENSOR_NAME.to_string(), emb);
    candle_core::safetensors::save(&tensors, PrecomputedAudioFeatures::feature_path(wav)).unwrap();
}

fn assert_exclusive(transitions: &[Transition]) {
    let mut resident: Option<&str> = None;
    for t in transitions {
        match t.to {
            Residency::Resident => {
                assert!(resident.is_none(), "{} loaded while {resident:?} resident", t.model);
                resident = Some(t.model);
            }
            Residency::Offloaded => {
                assert_eq!(resident, Some(t.model));
                resident = None;
            }
        }
    }
}
