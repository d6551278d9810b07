//! Tests for audio features
//!
//! - Window grouping and zero padding
//! - Whisper band folding and 50 -> 25 fps resampling
//! - Precomputed feature files

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_humo::audio::{
    AudioFeatureExtractor, PrecomputedAudioFeatures, audio_emb_window, encode_audio_features,
    linear_interpolation, pad_reference_region, silent_audio_embedding,
};
use candle_humo::config::AudioEncoding;
use proptest::prelude::*;

// ============================================================================
// Windowing Tests
// ============================================================================

#[test]
fn test_window_shape_for_97_frames() -> Result<()> {
    let emb = ramp_embedding(97, 2, 3)?;
    let w = audio_emb_window(&emb, 97, 0).unwrap();
    assert_eq!(w.windows.dims(), &[25, 8, 2, 3]);
    Ok(())
}

#[test]
fn test_first_window_is_zero_padded() -> Result<()> {
    let emb = ramp_embedding(20, 1, 1)?;
    let w = audio_emb_window(&emb, 9, 0).unwrap();
    let first = frame_values(&w.windows, 0)?;
    // 3 zero frames, then indices -2, -1 (zeros) and 0, 1, 2 (values 1, 2, 3)
    assert_eq!(first, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);

    let second = frame_values(&w.windows, 1)?;
    // indices -1..7
    assert_eq!(second, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    Ok(())
}

#[test]
fn test_trailing_indices_read_zero_frames() -> Result<()> {
    let emb = ramp_embedding(9, 1, 1)?;
    let w = audio_emb_window(&emb, 9, 0).unwrap();
    // last group covers indices 3..11, frames 9 and 10 do not exist
    let last = frame_values(&w.windows, 2)?;
    assert_eq!(last, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 0.0, 0.0]);
    assert_eq!(w.next_start, 9);
    Ok(())
}

#[test]
fn test_reference_padding_appends_zero_groups() -> Result<()> {
    let emb = ramp_embedding(9, 2, 2)?;
    let w = audio_emb_window(&emb, 9, 0).unwrap();
    let padded = pad_reference_region(&w.windows, 2).unwrap();
    assert_eq!(padded.dims(), &[5, 8, 2, 2]);
    let tail = padded.narrow(0, 3, 2)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert_eq!(tail, 0.0);
    Ok(())
}

#[test]
fn test_silent_embedding_shape() {
    let s = silent_audio_embedding(81, &Device::Cpu).unwrap();
    assert_eq!(s.dims(), &[81, 5, 1280]);
}

// ============================================================================
// Whisper Encoding Tests
// ============================================================================

#[test]
fn test_whisper_band_means() -> Result<()> {
    let device = Device::Cpu;
    // layer k carries the constant value k
    let layers: Vec<f32> = (0..33).map(|k| k as f32).collect();
    let raw = Tensor::new(layers.as_slice(), &device)?
        .reshape((1, 1, 33, 1))?
        .broadcast_as((1, 10, 33, 4))?
        .contiguous()?;

    let enc = encode_audio_features(&raw, AudioEncoding::Whisper).unwrap();
    assert_eq!(enc.dims(), &[5, 5, 4]);
    let bands: Vec<f32> = enc.narrow(0, 0, 1)?.narrow(2, 0, 1)?.flatten_all()?.to_vec1()?;
    assert_eq!(bands, vec![3.5, 11.5, 19.5, 27.5, 32.0]);
    Ok(())
}

#[test]
fn test_whisper_requires_33_layers() -> Result<()> {
    let raw = Tensor::zeros((1, 4, 32, 2), DType::F32, &Device::Cpu)?;
    assert!(encode_audio_features(&raw, AudioEncoding::Whisper).is_err());
    Ok(())
}

#[test]
fn test_linear_interpolation_align_corners() -> Result<()> {
    let device = Device::Cpu;
    let ramp: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let x = Tensor::new(ramp.as_slice(), &device)?.reshape((1, 10, 1))?;
    let y = linear_interpolation(&x, 50.0, 25.0).unwrap();
    assert_eq!(y.dims(), &[1, 5, 1]);
    let v = y.flatten_all()?.to_vec1::<f32>()?;
    let expected = [0.0, 2.25, 4.5, 6.75, 9.0];
    for (a, b) in v.iter().zip(expected) {
        assert!((a - b).abs() < 1e-5, "{v:?}");
    }
    Ok(())
}

#[test]
fn test_wav2vec_passes_through() -> Result<()> {
    let raw = Tensor::ones((7, 5, 3), DType::F32, &Device::Cpu)?;
    let enc = encode_audio_features(&raw, AudioEncoding::Wav2Vec).unwrap();
    assert_eq!(enc.dims(), &[7, 5, 3]);
    Ok(())
}

// ============================================================================
// Feature File Tests
// ============================================================================

#[test]
fn test_precomputed_features_next_to_audio() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("speech.wav");
    let emb = ramp_embedding(13, 5, 4)?;
    let mut tensors = HashMap::new();
    tensors.insert(PrecomputedAudioFeatures::TENSOR_NAME.to_string(), emb);
    candle_core::safetensors::save(&tensors, PrecomputedAudioFeatures::feature_path(&wav))?;

    let mut source = PrecomputedAudioFeatures::new(AudioEncoding::Wav2Vec);
    let (features, len) = source.preprocess(&wav, &Device::Cpu).unwrap();
    assert_eq!(len, 13);
    assert_eq!(features.dims(), &[13, 5, 4]);
    Ok(())
}

#[test]
fn test_missing_feature_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = PrecomputedAudioFeatures::new(AudioEncoding::Whisper);
    assert!(
        source
            .preprocess(&dir.path().join("absent.wav"), &Device::Cpu)
            .is_err()
    );
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every aligned frame count yields 1 + (F - 1) / 4 windows of exactly 8 frames.
    #[test]
    fn prop_window_count(k in 0usize..40, len in 1usize..200) {
        let frames = 4 * k + 1;
        let emb = ramp_embedding(len, 1, 2).unwrap();
        let w = audio_emb_window(&emb, frames, 0).unwrap();
        let dims = w.windows.dims().to_vec();
        prop_assert_eq!(dims, vec![1 + (frames - 1).div_ceil(4), 8, 1, 2]);
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// `(len, bands, dim)` where frame `i` holds the value `i + 1`.
fn ramp_embedding(len: usize, bands: usize, dim: usize) -> Result<Tensor> {
    let values: Vec<f32> = (0..len).map(|i| (i + 1) as f32).collect();
    Tensor::new(values.as_slice(), &Device::Cpu)?
        .reshape((len, 1, 1))?
        .broadcast_as((len, bands, dim))?
        .contiguous()
}

/// First element of every frame of window group `g`.
fn frame_values(windows: &Tensor, g: usize) -> Result<Vec<f32>> {
    windows
        .narrow(0, g, 1)?
        .narrow(2, 0, 1)?
        .narrow(3, 0, 1)?
        .flatten_all()?
        .to_vec1::<f32>()
}
