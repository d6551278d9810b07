//! Error taxonomy for the generation pipeline.
//!
//! Nothing in the pipeline retries or recovers locally: every error is returned to the
//! caller with `?` and ends the current run.

use std::path::PathBuf;

use crate::config::ConfigError;

/// Errors raised while preparing inputs, denoising or persisting a sample.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Rejected configuration, always raised before any model call.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The accelerator ran out of memory.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error for {path}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A heavy model was requested while another one still occupies the compute device.
    #[error("cannot load {requested}: {resident} is still resident on the compute device")]
    Residency {
        requested: &'static str,
        resident: &'static str,
    },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid job dataset: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode animation: {0}")]
    Gif(#[from] gif::EncodingError),

    #[error(transparent)]
    Candle(candle_core::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        let msg = err.to_string();
        if is_out_of_memory(&msg) {
            Self::ResourceExhausted(msg)
        } else {
            Self::Candle(err)
        }
    }
}

fn is_out_of_memory(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("out of memory") || msg.contains("out_of_memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_maps_to_resource_exhausted() {
        let err: PipelineError =
            candle_core::Error::Msg("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")".into())
                .into();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));
    }

    #[test]
    fn test_other_candle_errors_pass_through() {
        let err: PipelineError = candle_core::Error::Msg("shape mismatch in cat".into()).into();
        assert!(matches!(err, PipelineError::Candle(_)));
    }
}
