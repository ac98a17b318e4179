use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::{DynamicImage, ImageFormat};
use tracing::{info, warn};

use crate::{DeviceMap, Error};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let device = match device_map {
        DeviceMap::ForceCpu => Device::Cpu,
        DeviceMap::Cuda(ordinal) => {
            if !cuda_is_available() {
                return Err(Error::DeviceUnavailable {
                    backend: "cuda",
                    reason: "it is not available, build with `--features cuda`",
                }
                .into());
            }
            Device::new_cuda(ordinal)?
        }
        DeviceMap::Metal(ordinal) => {
            if !metal_is_available() {
                return Err(Error::DeviceUnavailable {
                    backend: "metal",
                    reason: "it is not available, build with `--features metal`",
                }
                .into());
            }
            Device::new_metal(ordinal)?
        }
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)?,
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)?,
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Device::Cpu
        }
    };
    info!(device = ?device.location(), "selected device");
    Ok(device)
}

/// Converts a tensor with shape (3, height, width) and dtype u8 into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Maps decoded VAE output in `[-1, 1]`, shape (1, 3, height, width), to an image.
pub(crate) fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let img = decoded
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .clamp(-1f32, 1f32)?;
    let img = ((img + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
    tensor_to_image(&img.i(0)?)
}

/// Writes `image` to `path`, picking the codec from the extension and
/// falling back to PNG.
pub fn save_image(image: &DynamicImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    image
        .save_with_format(path, format)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "saved image");
    Ok(())
}

/// Name of the file holding sample `sample_idx` (1-based) out of `num_samples`.
pub fn output_filename(basename: &Path, sample_idx: usize, num_samples: usize) -> PathBuf {
    if num_samples <= 1 {
        return basename.to_path_buf();
    }
    let stem = basename
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = match basename.extension() {
        Some(extension) => format!("{stem}.{sample_idx}.{}", extension.to_string_lossy()),
        None => format!("{stem}.{sample_idx}.png"),
    };
    basename.with_file_name(filename)
}

pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}
