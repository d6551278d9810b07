//! HuMo batch generation.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin humo -- \
//!     --config humo.json \
//!     --prompts jobs.json \
//!     --output-dir output \
//!     --mock
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use tracing::{info, warn};

use candle_humo::config::GenerationConfigFile;
use candle_humo::mock::{MockTextEncoder, MockTransformer, MockVae};
use candle_humo::{
    DeviceScope, HumoPipeline, MemoryOrchestrator, PrecomputedAudioFeatures, ZeroLatentTemplate,
    inference_loop, load_jobs,
};

/// Latent frames of the blank template used in mock runs.
const MOCK_TEMPLATE_FRAMES: usize = 64;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate videos from text, reference images and audio with HuMo"
)]
struct Args {
    /// Generation configuration (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Job dataset (JSON), overrides `positive_prompt` from the configuration
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Output directory, overrides `output_dir` from the configuration
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Seed for every job; negative draws a fresh one
    #[arg(long, allow_hyphen_values = true)]
    seed: Option<i64>,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Run with stand-in models (no weights needed)
    #[arg(long)]
    mock: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_humo=info".parse()?)
                .add_directive("humo=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut file = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<GenerationConfigFile>(&json)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => GenerationConfigFile::default(),
    };
    if let Some(prompts) = &args.prompts {
        file.positive_prompt = Some(prompts.clone());
    }
    if let Some(dir) = &args.output_dir {
        file.output_dir = dir.clone();
    }
    if args.seed.is_some() {
        file.seed = args.seed;
    }
    let config = Arc::new(file.validate().context("invalid generation configuration")?);

    let prompts = config
        .positive_prompt
        .clone()
        .context("no job dataset: pass --prompts or set positive_prompt")?;
    let jobs = load_jobs(&prompts).with_context(|| format!("loading {}", prompts.display()))?;

    info!("HuMo video generator");
    info!(
        mode = %config.mode,
        width = config.width,
        height = config.height,
        steps = config.sampling.steps,
        jobs = jobs.len(),
        "configuration"
    );

    let device = if args.cpu {
        info!("Using CPU");
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };

    if !args.mock {
        anyhow::bail!(
            "this binary ships no weight-backed models; embed HumoPipeline with your own \
             TextEncoder/VideoVae/DiffusionTransformer implementations, or pass --mock for a dry run"
        );
    }

    info!("Running in mock mode (no model loading)");
    let zero_latent = match HumoPipeline::load_zero_latent(&config, &device) {
        Ok(template) => template,
        Err(e) => {
            warn!("zero latent unavailable ({e}), using a blank template");
            ZeroLatentTemplate::zeros(
                config.z_dim,
                MOCK_TEMPLATE_FRAMES,
                config.latent_size(),
                &device,
            )?
        }
    };
    let models = MemoryOrchestrator::new(
        DeviceScope::new(device),
        Box::new(MockTextEncoder::default()),
        Box::new(MockVae::new(config.z_dim)),
        Box::new(MockTransformer::new()),
        Box::new(PrecomputedAudioFeatures::new(config.audio_encoding)),
    );
    let mut pipeline = HumoPipeline::new(Arc::clone(&config), models, zero_latent)?;

    let summary = inference_loop(&mut pipeline, jobs)?;
    for job in &summary.finished {
        println!(
            "{}: seed {} -> {}",
            job.item_name,
            job.seed,
            job.path.display()
        );
    }
    info!(finished = summary.finished.len(), "Generation complete!");
    Ok(())
}
