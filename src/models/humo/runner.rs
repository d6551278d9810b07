//! Batch runs over a job dataset.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use super::pipeline::{HumoPipeline, InferenceRequest};
use crate::config::ConfigError;
use crate::error::{PipelineError, Result};
use crate::utils::rng::job_seed;
use crate::utils::video_io::save_sample;

/// One entry of the dataset, consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    pub item_name: String,
    pub text: String,
    pub audio: Option<PathBuf>,
    pub ref_images: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImagePaths {
    Many(Vec<String>),
    One(String),
}

impl Default for ImagePaths {
    fn default() -> Self {
        ImagePaths::One(String::new())
    }
}

impl ImagePaths {
    fn into_paths(self) -> Vec<PathBuf> {
        let paths = match self {
            ImagePaths::Many(v) => v,
            ImagePaths::One(s) => vec![s],
        };
        paths
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct JobRecord {
    prompt: String,
    #[serde(default)]
    audio_path: Option<String>,
    #[serde(default)]
    img_paths: ImagePaths,
}

/// Parses `{ item: { "prompt", "audio_path"?, "img_paths"? } }`, keeping file order.
pub fn parse_jobs(json: &str) -> Result<Vec<GenerationJob>> {
    let records: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
    records
        .into_iter()
        .map(|(item_name, value)| {
            let record: JobRecord = serde_json::from_value(value)?;
            Ok(GenerationJob {
                item_name,
                text: record.prompt,
                audio: record
                    .audio_path
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
                ref_images: record.img_paths.into_paths(),
            })
        })
        .collect()
}

/// Reads a `.json` job dataset; other sources are rejected.
pub fn load_jobs(path: &Path) -> Result<Vec<GenerationJob>> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(ConfigError::UnsupportedPromptSource(path.to_path_buf()).into());
    }
    let json = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    parse_jobs(&json)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedJob {
    pub item_name: String,
    /// Seed the noise was drawn with.
    pub seed: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub finished: Vec<FinishedJob>,
}

/// Runs every job in order; the first failure aborts the run.
pub fn inference_loop(
    pipeline: &mut HumoPipeline<'_>,
    jobs: Vec<GenerationJob>,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let total = jobs.len();
    for (i, job) in jobs.into_iter().enumerate() {
        let config = pipeline.config();
        let mode = config.mode;
        let seed = job_seed(config.seed);
        let output_dir = config.output_dir.clone();
        let fps = config.fps;

        let request = InferenceRequest {
            prompt: job.text,
            negative_prompt: String::new(),
            ref_images: if mode.uses_image() {
                job.ref_images
            } else {
                Vec::new()
            },
            audio: job.audio.filter(|_| mode.uses_audio()),
            seed,
        };
        info!(item = %job.item_name, index = i + 1, total, seed, "starting job");
        let video = pipeline.inference(&request)?;

        let effective_seed = video.seed;
        let stem = output_dir.join(format!("{}_seed{}", job.item_name, effective_seed));
        let path = save_sample(&video.frames, &stem, fps)?;
        drop(video);
        info!("Finished {}, saved to {}", job.item_name, path.display());

        pipeline.models().scope().release_transient()?;
        let transitions = pipeline.models_mut().take_transitions();
        debug!(item = %job.item_name, transitions = transitions.len(), "residency changes");

        summary.finished.push(FinishedJob {
            item_name: job.item_name,
            seed: effective_seed,
            path,
        });
    }
    Ok(summary)
}
