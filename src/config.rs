//! Generation configuration.
//!
//! The on-disk JSON form ([`GenerationConfigFile`]) is deserialised with serde and validated once
//! into a [`GenerationConfig`]. The validated value is shared read-only (usually behind an `Arc`)
//! for the rest of the run.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Conditioning mode, fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Text + reference image + audio.
    Tia,
    /// Text + audio.
    Ta,
}

impl Mode {
    pub fn uses_image(self) -> bool {
        matches!(self, Mode::Tia)
    }

    pub fn uses_audio(self) -> bool {
        true
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Tia => "TIA",
            Mode::Ta => "TA",
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TIA" => Ok(Mode::Tia),
            "TA" => Ok(Mode::Ta),
            other => Err(ConfigError::UnsupportedMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout of the precomputed audio features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// Features are already `(frames, bands, dim)` at video rate.
    Wav2Vec,
    /// Raw encoder layers at 50 Hz, folded into five bands and resampled to 25 Hz.
    Whisper,
}

impl FromStr for AudioEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wav2vec" => Ok(AudioEncoding::Wav2Vec),
            "whisper" => Ok(AudioEncoding::Whisper),
            other => Err(ConfigError::UnsupportedAudioEncoding(other.to_string())),
        }
    }
}

/// Requested length of the generated clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCount {
    Fixed(usize),
    /// As many frames as the audio track provides.
    FromAudio,
}

/// Denoising schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_shift")]
    pub shift: f64,
}

fn default_steps() -> usize {
    50
}

fn default_shift() -> f64 {
    5.0
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            shift: default_shift(),
        }
    }
}

/// JSON representation of the configuration, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfigFile {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_height")]
    pub height: usize,
    /// `-1` derives the frame count from the audio length.
    #[serde(default = "default_frames")]
    pub frames: i64,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub sample_neg_prompt: String,
    #[serde(default = "default_scale_a")]
    pub scale_a: f64,
    #[serde(default = "default_scale_t")]
    pub scale_t: f64,
    #[serde(default = "default_step_change")]
    pub step_change: i64,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default = "default_audio_encoding")]
    pub audio_encoding: String,
    #[serde(default = "default_vae_stride")]
    pub vae_stride: [usize; 3],
    #[serde(default = "default_patch_size")]
    pub patch_size: [usize; 3],
    #[serde(default = "default_z_dim")]
    pub z_dim: usize,
    #[serde(default)]
    pub zero_vae_path: Option<PathBuf>,
    #[serde(default)]
    pub zero_vae_720p_path: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub positive_prompt: Option<PathBuf>,
}

fn default_mode() -> String {
    "TA".to_string()
}

fn default_width() -> usize {
    832
}

fn default_height() -> usize {
    480
}

fn default_frames() -> i64 {
    97
}

fn default_fps() -> u32 {
    25
}

fn default_scale_a() -> f64 {
    5.5
}

fn default_scale_t() -> f64 {
    5.0
}

fn default_step_change() -> i64 {
    980
}

fn default_audio_encoding() -> String {
    "whisper".to_string()
}

fn default_vae_stride() -> [usize; 3] {
    [4, 8, 8]
}

fn default_patch_size() -> [usize; 3] {
    [1, 2, 2]
}

fn default_z_dim() -> usize {
    16
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for GenerationConfigFile {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            width: default_width(),
            height: default_height(),
            frames: default_frames(),
            fps: default_fps(),
            seed: None,
            sample_neg_prompt: String::new(),
            scale_a: default_scale_a(),
            scale_t: default_scale_t(),
            step_change: default_step_change(),
            sampling: SamplingConfig::default(),
            audio_encoding: default_audio_encoding(),
            vae_stride: default_vae_stride(),
            patch_size: default_patch_size(),
            z_dim: default_z_dim(),
            zero_vae_path: None,
            zero_vae_720p_path: None,
            output_dir: default_output_dir(),
            positive_prompt: None,
        }
    }
}

impl GenerationConfigFile {
    pub fn validate(self) -> Result<GenerationConfig, ConfigError> {
        let mode = self.mode.parse::<Mode>()?;
        let audio_encoding = self.audio_encoding.parse::<AudioEncoding>()?;

        let [st, sh, sw] = self.vae_stride;
        let [pt, ph, pw] = self.patch_size;
        if st == 0 || sh == 0 || sw == 0 || pt == 0 || ph == 0 || pw == 0 {
            return Err(ConfigError::InvalidStride);
        }
        let spatial = sh * ph;
        if self.width == 0
            || self.height == 0
            || !self.width.is_multiple_of(sw * pw)
            || !self.height.is_multiple_of(spatial)
        {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
                multiple: spatial.max(sw * pw),
            });
        }

        let frames = match self.frames {
            -1 => FrameCount::FromAudio,
            n if n >= 1 => FrameCount::Fixed(n as usize),
            n => return Err(ConfigError::InvalidFrameCount(n)),
        };
        if self.sampling.steps == 0 {
            return Err(ConfigError::InvalidSteps);
        }

        Ok(GenerationConfig {
            mode,
            width: self.width,
            height: self.height,
            frames,
            fps: self.fps.max(1),
            seed: self.seed,
            sample_neg_prompt: self.sample_neg_prompt,
            scale_a: self.scale_a,
            scale_t: self.scale_t,
            step_change: self.step_change,
            sampling: self.sampling,
            audio_encoding,
            vae_stride: (st, sh, sw),
            patch_size: (pt, ph, pw),
            z_dim: self.z_dim,
            zero_vae_path: self.zero_vae_path,
            zero_vae_720p_path: self.zero_vae_720p_path,
            output_dir: self.output_dir,
            positive_prompt: self.positive_prompt,
        })
    }
}

/// Validated, immutable generation configuration.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub mode: Mode,
    pub width: usize,
    pub height: usize,
    pub frames: FrameCount,
    pub fps: u32,
    /// `None` draws a fresh seed per job.
    pub seed: Option<i64>,
    pub sample_neg_prompt: String,
    pub scale_a: f64,
    pub scale_t: f64,
    pub step_change: i64,
    pub sampling: SamplingConfig,
    pub audio_encoding: AudioEncoding,
    /// (temporal, height, width) compression of the VAE.
    pub vae_stride: (usize, usize, usize),
    /// (temporal, height, width) patch of the transformer.
    pub patch_size: (usize, usize, usize),
    pub z_dim: usize,
    pub zero_vae_path: Option<PathBuf>,
    pub zero_vae_720p_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub positive_prompt: Option<PathBuf>,
}

impl GenerationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: GenerationConfigFile = serde_json::from_str(json)?;
        file.validate()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Frame count after rounding down to the `4k + 1` grid of the temporal VAE.
    pub fn effective_frame_count(&self, frames: usize) -> usize {
        effective_frame_count(frames, self.vae_stride.0)
    }

    /// Latent grid `(h, w)` for the configured output size.
    pub fn latent_size(&self) -> (usize, usize) {
        (
            self.height / self.vae_stride.1,
            self.width / self.vae_stride.2,
        )
    }

    /// Zero-latent template for the configured height.
    pub fn zero_latent_path(&self) -> Result<&Path, ConfigError> {
        let path = match self.height {
            480 => self.zero_vae_path.as_deref(),
            720 => self.zero_vae_720p_path.as_deref(),
            height => return Err(ConfigError::UnsupportedHeight(height)),
        };
        path.ok_or(ConfigError::MissingZeroLatent(self.height))
    }
}

/// `stride * ((frames - 1) / stride) + 1`, never larger than `frames`.
pub fn effective_frame_count(frames: usize, stride: usize) -> usize {
    if frames == 0 {
        return 0;
    }
    stride * ((frames - 1) / stride) + 1
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported height {0}: only 480 and 720 have a zero-latent template")]
    UnsupportedHeight(usize),
    #[error("No zero-latent template configured for height {0}")]
    MissingZeroLatent(usize),
    #[error("Unsupported mode {0:?}: expected \"TIA\" or \"TA\"")]
    UnsupportedMode(String),
    #[error("Unsupported audio encoding {0:?}: expected \"wav2vec\" or \"whisper\"")]
    UnsupportedAudioEncoding(String),
    #[error("Unsupported prompt source {0}: only .json datasets are supported")]
    UnsupportedPromptSource(PathBuf),
    #[error("Invalid dimensions: width={width}, height={height}. Must be multiple of {multiple}")]
    InvalidDimensions {
        width: usize,
        height: usize,
        multiple: usize,
    },
    #[error("VAE stride and patch size must be non-zero")]
    InvalidStride,
    #[error("Invalid frame count: {0}. Use a positive count or -1 to follow the audio")]
    InvalidFrameCount(i64),
    #[error("Sampling steps must be at least 1")]
    InvalidSteps,
    #[error("Frame count follows the audio but the job has no audio track")]
    FramesFromAudioWithoutAudio,
    #[error("{what} has {found} latent channels, configuration expects {expected}")]
    LatentChannels {
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Zero-latent template has {available} frames, {required} required")]
    ZeroLatentTooShort { available: usize, required: usize },
    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
