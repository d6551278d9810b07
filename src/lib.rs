//! Candle-HuMo: human-centric video generation for the Candle framework.
//!
//! Generates short clips conditioned on a text prompt, optional reference images and an audio
//! track, by iteratively denoising video latents with a diffusion transformer under
//! multi-branch classifier-free guidance.

pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use config::{ConfigError, GenerationConfig, Mode};
pub use error::{PipelineError, Result};
pub use models::humo::*;
