//! Reference images and the latent-space templates built around them.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, Rgb, RgbImage, imageops::FilterType};
use tracing::debug;

use super::pipeline::VideoVae;
use crate::config::ConfigError;
use crate::error::{PipelineError, Result};

/// Placement of a resized image inside the letterboxed canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    pub resized: (u32, u32),
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Fits `src` into `target` keeping the aspect ratio; the odd padding pixel goes right/bottom.
pub fn letterbox_dims(src: (u32, u32), target: (u32, u32)) -> Letterbox {
    let (sw, sh) = src;
    let (tw, th) = target;
    let img_ratio = sw as f64 / sh as f64;
    let target_ratio = tw as f64 / th as f64;
    let (nw, nh) = if img_ratio > target_ratio {
        (tw, (tw as f64 / img_ratio) as u32)
    } else {
        ((th as f64 * img_ratio) as u32, th)
    };
    let (nw, nh) = (nw.clamp(1, tw), nh.clamp(1, th));
    let (dw, dh) = (tw - nw, th - nh);
    Letterbox {
        resized: (nw, nh),
        left: dw / 2,
        top: dh / 2,
        right: dw - dw / 2,
        bottom: dh - dh / 2,
    }
}

/// Lanczos-resizes `img` into a white `width × height` canvas.
pub fn letterbox(img: &DynamicImage, width: u32, height: u32) -> RgbImage {
    let layout = letterbox_dims((img.width(), img.height()), (width, height));
    let (nw, nh) = layout.resized;
    let resized = img.resize_exact(nw, nh, FilterType::Lanczos3).to_rgb8();
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        i64::from(layout.left),
        i64::from(layout.top),
    );
    canvas
}

/// `(3, 1, H, W)` tensor in `[-1, 1]`.
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data = img.as_raw().clone();
    let t = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .unsqueeze(1)?;
    Ok(t)
}

pub fn load_reference_image(
    path: &Path,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    let img = image::load_from_memory(&bytes).map_err(|source| PipelineError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let canvas = letterbox(&img, width as u32, height as u32);
    image_to_tensor(&canvas, device)
}

/// Placeholder reference when the job has no image: `zeros(z_dim, 1, h, w)`.
pub fn empty_reference_latent(
    z_dim: usize,
    latent_size: (usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let (h, w) = latent_size;
    Ok(Tensor::zeros((z_dim, 1, h, w), DType::F32, device)?)
}

/// Encodes every image separately and concatenates the latents along time.
pub fn encode_reference_latents(
    vae: &dyn VideoVae,
    paths: &[impl AsRef<Path>],
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut latents = Vec::with_capacity(paths.len());
    for path in paths {
        let pixels = load_reference_image(path.as_ref(), width, height, device)?;
        let mut encoded = vae.encode(&[pixels])?;
        let Some(latent) = encoded.pop() else {
            return Err(PipelineError::shape("VAE returned no latent"));
        };
        debug!(path = %path.as_ref().display(), shape = ?latent.dims(), dtype = ?latent.dtype(), "reference latent");
        // the zero latent and the mask it is concatenated with are f32
        latents.push(latent.to_dtype(DType::F32)?);
    }
    Ok(Tensor::cat(&latents, 1)?)
}

/// Latent of a blank clip, sliced to the needed length for the unconditioned frames.
#[derive(Debug, Clone)]
pub struct ZeroLatentTemplate {
    /// `(z_dim, T_max, h, w)`
    latent: Tensor,
}

impl ZeroLatentTemplate {
    pub const TENSOR_NAME: &'static str = "zero_vae";

    pub fn new(latent: Tensor) -> Result<Self> {
        let latent = match latent.rank() {
            4 => latent,
            5 => latent.squeeze(0)?,
            r => {
                return Err(PipelineError::shape(format!(
                    "zero latent must be rank 4, got rank {r}"
                )));
            }
        };
        Ok(Self {
            latent: latent.to_dtype(DType::F32)?,
        })
    }

    /// Loads the tensor named `zero_vae`, or the only tensor of the file.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "zero latent not found"),
            ));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let latent = match tensors.remove(Self::TENSOR_NAME) {
            Some(t) => t,
            None if tensors.len() == 1 => tensors
                .into_values()
                .next()
                .ok_or_else(|| PipelineError::shape("empty zero latent file"))?,
            None => {
                return Err(PipelineError::shape(format!(
                    "{} has no tensor named {}",
                    path.display(),
                    Self::TENSOR_NAME
                )));
            }
        };
        Self::new(latent)
    }

    /// All-zero template, for dry runs without an encoded blank clip.
    pub fn zeros(
        z_dim: usize,
        frames: usize,
        latent_size: (usize, usize),
        device: &Device,
    ) -> Result<Self> {
        let (h, w) = latent_size;
        Self::new(Tensor::zeros((z_dim, frames, h, w), DType::F32, device)?)
    }

    pub fn channels(&self) -> usize {
        self.latent.dims()[0]
    }

    pub fn frames(&self) -> usize {
        self.latent.dims()[1]
    }

    /// First `len` frames, on `device`.
    pub fn prefix(&self, len: usize, device: &Device) -> Result<Tensor> {
        let available = self.frames();
        if len > available {
            return Err(ConfigError::ZeroLatentTooShort {
                available,
                required: len,
            }
            .into());
        }
        Ok(self.latent.narrow(1, 0, len)?.to_device(device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_into_landscape() {
        let l = letterbox_dims((512, 512), (832, 480));
        assert_eq!(l.resized, (480, 480));
        assert_eq!((l.left, l.right), (176, 176));
        assert_eq!((l.top, l.bottom), (0, 0));
    }

    #[test]
    fn test_odd_padding_goes_right() {
        let l = letterbox_dims((100, 100), (33, 16));
        assert_eq!(l.resized, (16, 16));
        assert_eq!((l.left, l.right), (8, 9));
    }

    #[test]
    fn test_image_to_tensor_range() -> Result<()> {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        let t = image_to_tensor(&img, &Device::Cpu)?;
        assert_eq!(t.dims(), &[3, 1, 2, 2]);
        let v = t.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v[0], -1.0);
        assert!((v[1] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_zero_template_too_short() -> Result<()> {
        let tpl = ZeroLatentTemplate::zeros(16, 4, (2, 2), &Device::Cpu)?;
        assert!(tpl.prefix(4, &Device::Cpu).is_ok());
        let err = tpl.prefix(5, &Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::ZeroLatentTooShort { .. })
        ));
        Ok(())
    }
}
