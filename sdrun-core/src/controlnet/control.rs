use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage, GrayImage};

/// Canny hysteresis thresholds used by the reference ControlNet notebooks.
pub const CANNY_LOW_THRESHOLD: f32 = 100.;
pub const CANNY_HIGH_THRESHOLD: f32 = 200.;

/// How the user-supplied image becomes the ControlNet's conditioning input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControlType {
    /// Edge map extracted with a Canny detector.
    #[default]
    Canny,
    /// The image is already a conditioning map (edges, depth, ...).
    Raw,
}

impl FromStr for ControlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "canny" => Ok(Self::Canny),
            "raw" | "none" => Ok(Self::Raw),
            other => Err(format!("unknown control type `{other}`, expected canny or raw")),
        }
    }
}

impl ControlType {
    /// The conditioning image at `width`x`height`, as the model will see it.
    pub fn conditioning_image(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> DynamicImage {
        let resized = image.resize_exact(width, height, FilterType::CatmullRom);
        match self {
            Self::Canny => DynamicImage::ImageLuma8(edge_map(&resized)).into_rgb8().into(),
            Self::Raw => resized.into_rgb8().into(),
        }
    }

    /// A `(1, 3, height, width)` f32 tensor in `[0, 1]`.
    pub fn preprocess(
        &self,
        image: &DynamicImage,
        width: usize,
        height: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let conditioning = self
            .conditioning_image(image, width as u32, height as u32)
            .into_rgb8();
        let tensor = Tensor::from_vec(conditioning.into_raw(), (height, width, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1. / 255., 0.)?
            .unsqueeze(0)?
            .to_device(device)?;
        Ok(tensor)
    }
}

pub fn edge_map(image: &DynamicImage) -> GrayImage {
    imageproc::edges::canny(&image.to_luma8(), CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD)
}
