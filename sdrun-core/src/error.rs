use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by sdrun itself. Failures inside candle, hf-hub or the
/// tokenizer are carried through `anyhow` with added context instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid device `{0}`, expected cpu, auto, gpu[:N], cuda[:N] or metal[:N]")]
    InvalidDevice(String),

    #[error("{backend} device requested but {reason}")]
    DeviceUnavailable {
        backend: &'static str,
        reason: &'static str,
    },

    #[error("image dimensions must be non-zero multiples of 8, got {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("the number of denoising steps must be at least 1")]
    InvalidSteps,

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("missing model file {}", .0.display())]
    MissingFile(PathBuf),

    #[error("this pipeline is ControlNet-guided and needs a control image")]
    MissingControlImage,

    #[error("invalid control image: {0}")]
    InvalidControlImage(String),
}
