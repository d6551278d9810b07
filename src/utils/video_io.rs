//! Writing generated samples to disk.
//!
//! Clips become looping GIFs; a single frame is written as PNG.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use gif::{Encoder, Repeat};
use image::RgbImage;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// GIF quantizer speed (1 = best quality, 30 = fastest).
const GIF_SPEED: i32 = 10;

/// `(3, F, H, W)` in `[-1, 1]` to `F` packed RGB frames.
pub fn video_to_rgb_frames(video: &Tensor) -> Result<(Vec<Vec<u8>>, usize, usize)> {
    let (c, f, h, w) = video.dims4()?;
    if c != 3 {
        return Err(PipelineError::shape(format!(
            "expected 3 colour channels, got {c}"
        )));
    }
    let bytes = video
        .to_dtype(DType::F32)?
        .clamp(-1.0, 1.0)?
        .affine(127.5, 127.5)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 3, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let frame_len = h * w * 3;
    let frames = bytes.chunks_exact(frame_len).map(<[u8]>::to_vec).collect();
    Ok((frames, h, w))
}

/// Writes `video` next to `stem` and returns the path written.
pub fn save_sample(video: &Tensor, stem: &Path, fps: u32) -> Result<PathBuf> {
    let (frames, h, w) = video_to_rgb_frames(video)?;
    if let Some(dir) = stem.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    }

    match frames.as_slice() {
        [single] => {
            let path = with_suffix(stem, "png");
            let img = RgbImage::from_raw(w as u32, h as u32, single.clone())
                .ok_or_else(|| PipelineError::shape("frame buffer does not match its size"))?;
            img.save(&path).map_err(|source| PipelineError::Image {
                path: path.clone(),
                source,
            })?;
            Ok(path)
        }
        _ => {
            let path = with_suffix(stem, "gif");
            write_gif(&path, &frames, w, h, fps)?;
            Ok(path)
        }
    }
}

/// Appends an extension without touching dots already in the stem.
fn with_suffix(stem: &Path, ext: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn write_gif(path: &Path, frames: &[Vec<u8>], w: usize, h: usize, fps: u32) -> Result<()> {
    let (gw, gh) = match (u16::try_from(w), u16::try_from(h)) {
        (Ok(gw), Ok(gh)) => (gw, gh),
        _ => {
            return Err(PipelineError::shape(format!(
                "{w}x{h} exceeds the GIF size limit"
            )));
        }
    };
    let file = File::create(path).map_err(|e| PipelineError::io(path, e))?;
    let mut encoder = Encoder::new(BufWriter::new(file), gw, gh, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    let delay = (100 / fps.max(1)).max(1) as u16;
    let encoded: Vec<_> = frames
        .par_iter()
        .map(|data| {
            let mut frame = gif::Frame::from_rgb_speed(gw, gh, data, GIF_SPEED);
            frame.delay = delay;
            frame
        })
        .collect();
    for frame in &encoded {
        encoder.write_frame(frame)?;
    }
    debug!(path = %path.display(), frames = encoded.len(), "wrote gif");
    Ok(())
}
