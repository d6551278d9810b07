//! Audio features: sources, whisper band folding and per-latent-frame windowing.
//!
//! Audio embeddings are `(frames, bands, dim)` at video frame rate. The transformer consumes them
//! in groups of 8 frames, one group per latent frame: the first latent frame covers one video
//! frame, every following one covers four.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::offload::Offload;
use crate::config::AudioEncoding;
use crate::error::{PipelineError, Result};

/// Frames of look-behind/look-ahead around each window centre.
pub const AUDIO_SHIFT: isize = 2;
/// Frames per window.
pub const WINDOW: usize = 8;
/// Bands of a folded whisper embedding.
pub const AUDIO_BANDS: usize = 5;
pub const AUDIO_DIM: usize = 1280;

const WHISPER_RATE: f64 = 50.0;
const VIDEO_RATE: f64 = 25.0;

/// Turns an audio file into `(embedding, valid_length)`.
pub trait AudioFeatureExtractor: Offload {
    fn preprocess(&mut self, path: &Path, device: &Device) -> Result<(Tensor, usize)>;
}

/// Reads features computed ahead of time and stored next to the audio file.
///
/// `clip.wav` is looked up as `clip.safetensors` holding a tensor named `audio_emb`.
#[derive(Debug, Clone)]
pub struct PrecomputedAudioFeatures {
    encoding: AudioEncoding,
}

impl PrecomputedAudioFeatures {
    pub const TENSOR_NAME: &'static str = "audio_emb";

    pub fn new(encoding: AudioEncoding) -> Self {
        Self { encoding }
    }

    pub fn feature_path(audio: &Path) -> PathBuf {
        audio.with_extension("safetensors")
    }
}

impl Offload for PrecomputedAudioFeatures {
    fn move_to(&mut self, _device: &Device) -> candle_core::Result<()> {
        Ok(())
    }
}

impl AudioFeatureExtractor for PrecomputedAudioFeatures {
    fn preprocess(&mut self, path: &Path, device: &Device) -> Result<(Tensor, usize)> {
        let feature_path = Self::feature_path(path);
        if !feature_path.exists() {
            return Err(PipelineError::io(
                &feature_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "audio features not found"),
            ));
        }
        let mut tensors = candle_core::safetensors::load(&feature_path, device)?;
        let raw = tensors.remove(Self::TENSOR_NAME).ok_or_else(|| {
            PipelineError::shape(format!(
                "{} has no tensor named {}",
                feature_path.display(),
                Self::TENSOR_NAME
            ))
        })?;
        let emb = encode_audio_features(&raw.to_dtype(DType::F32)?, self.encoding)?;
        let len = emb.dim(0)?;
        debug!(path = %feature_path.display(), frames = len, "loaded audio features");
        Ok((emb, len))
    }
}

/// Brings raw features to `(frames, bands, dim)` at video rate.
///
/// Whisper features arrive as `(1, L, 33, D)` encoder layers at 50 Hz: layers are averaged in
/// blocks of eight, the last layer is kept as is, and each band is resampled to 25 Hz.
pub fn encode_audio_features(raw: &Tensor, encoding: AudioEncoding) -> Result<Tensor> {
    match encoding {
        AudioEncoding::Wav2Vec => match raw.rank() {
            3 => Ok(raw.clone()),
            4 => Ok(raw.squeeze(0)?),
            r => Err(PipelineError::shape(format!(
                "wav2vec features must be rank 3, got rank {r}"
            ))),
        },
        AudioEncoding::Whisper => {
            let (_, _, layers, _) = raw.dims4()?;
            if layers < 33 {
                return Err(PipelineError::shape(format!(
                    "whisper features need 33 layers, got {layers}"
                )));
            }
            let mut bands = Vec::with_capacity(AUDIO_BANDS);
            for k in 0..4 {
                bands.push(raw.narrow(2, 8 * k, 8)?.mean(2)?);
            }
            bands.push(raw.narrow(2, 32, 1)?.squeeze(2)?);
            let bands = bands
                .iter()
                .map(|b| linear_interpolation(b, WHISPER_RATE, VIDEO_RATE))
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::stack(&bands, 2)?.squeeze(0)?)
        }
    }
}

/// Resamples `(1, L, D)` features along `L` with align-corners linear interpolation.
pub fn linear_interpolation(features: &Tensor, input_fps: f64, output_fps: f64) -> Result<Tensor> {
    let len = features.dim(1)?;
    let out_len = (len as f64 * output_fps / input_fps).round() as usize;
    if len == 0 || out_len == 0 {
        return Err(PipelineError::shape(format!(
            "cannot resample {len} frames from {input_fps} to {output_fps} fps"
        )));
    }
    let scale = if out_len > 1 {
        (len - 1) as f64 / (out_len - 1) as f64
    } else {
        0.0
    };
    let mut lo = Vec::with_capacity(out_len);
    let mut hi = Vec::with_capacity(out_len);
    let mut frac = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 * scale;
        let l = (src.floor() as usize).min(len - 1);
        lo.push(l as u32);
        hi.push((l + 1).min(len - 1) as u32);
        frac.push((src - l as f64) as f32);
    }
    let device = features.device();
    let lo = Tensor::new(lo, device)?;
    let hi = Tensor::new(hi, device)?;
    let w = Tensor::from_vec(frac, (1, out_len, 1), device)?.to_dtype(features.dtype())?;
    let a = features.index_select(&lo, 1)?;
    let b = features.index_select(&hi, 1)?;
    let delta = (b - &a)?;
    Ok((a + delta.broadcast_mul(&w)?)?)
}

/// Silent track: `zeros(frames, 5, 1280)`.
pub fn silent_audio_embedding(frames: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros(
        (frames, AUDIO_BANDS, AUDIO_DIM),
        DType::F32,
        device,
    )?)
}

/// Window groups and the index the next chunk would start from.
#[derive(Debug)]
pub struct AudioWindows {
    /// `(groups, 8, bands, dim)`
    pub windows: Tensor,
    pub next_start: isize,
}

/// Source frame indices for every window, `None` for zero padding.
pub fn window_indices(frame_num: usize, frame0_idx: isize) -> (Vec<Option<isize>>, isize) {
    let groups = 1 + frame_num.saturating_sub(1) / 4;
    let mut indices = Vec::with_capacity(groups * WINDOW);

    indices.extend(std::iter::repeat_n(None, 3));
    indices.extend((frame0_idx - AUDIO_SHIFT..frame0_idx + 1 + AUDIO_SHIFT).map(Some));

    let mut end = frame0_idx + 1 + AUDIO_SHIFT;
    for i in 1..groups as isize {
        let start = frame0_idx + 1 + 4 * (i - 1) - AUDIO_SHIFT;
        end = frame0_idx + 1 + 4 * i + AUDIO_SHIFT;
        indices.extend((start..end).map(Some));
    }
    (indices, end - AUDIO_SHIFT)
}

/// Gathers `groups = 1 + (frame_num - 1) / 4` windows of 8 frames from `(L, bands, dim)`.
///
/// Indices outside `[0, L)` read an all-zero frame.
pub fn audio_emb_window(
    audio_emb: &Tensor,
    frame_num: usize,
    frame0_idx: isize,
) -> Result<AudioWindows> {
    let (len, bands, dim) = audio_emb.dims3()?;
    let (indices, next_start) = window_indices(frame_num, frame0_idx);
    let groups = indices.len() / WINDOW;

    let zero = Tensor::zeros((1, bands, dim), audio_emb.dtype(), audio_emb.device())?;
    let padded = Tensor::cat(&[audio_emb, &zero], 0)?;
    let gather: Vec<u32> = indices
        .iter()
        .map(|i| match i {
            Some(i) if *i >= 0 && (*i as usize) < len => *i as u32,
            _ => len as u32,
        })
        .collect();
    let gather = Tensor::new(gather, audio_emb.device())?;
    let windows = padded
        .index_select(&gather, 0)?
        .reshape((groups, WINDOW, bands, dim))?;
    Ok(AudioWindows {
        windows,
        next_start,
    })
}

/// Appends `ref_len` all-zero groups so the audio covers the reference latents as well.
pub fn pad_reference_region(windows: &Tensor, ref_len: usize) -> Result<Tensor> {
    if ref_len == 0 {
        return Ok(windows.clone());
    }
    let (_, w, bands, dim) = windows.dims4()?;
    let zeros = Tensor::zeros((ref_len, w, bands, dim), windows.dtype(), windows.device())?;
    Ok(Tensor::cat(&[windows, &zeros], 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_group_layout() {
        let (idx, _) = window_indices(1, 0);
        assert_eq!(
            idx,
            vec![None, None, None, Some(-2), Some(-1), Some(0), Some(1), Some(2)]
        );
    }

    #[test]
    fn test_continuation_index_single_group() {
        assert_eq!(window_indices(1, 10).1, 11);
    }

    #[test]
    fn test_second_group_layout() {
        let (idx, next) = window_indices(5, 0);
        assert_eq!(idx.len(), 16);
        let second: Vec<_> = idx[8..].iter().map(|i| i.unwrap()).collect();
        assert_eq!(second, vec![-1, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(next, 5);
    }
}
