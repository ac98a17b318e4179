#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod controlnet;
pub mod device_map;
mod error;
pub mod loader;
mod loader_factory;
pub mod optimize;
mod request;
mod source;
mod stable_diffusion;
mod util;

pub use device_map::*;
pub use error::Error;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use optimize::*;
pub use request::*;
pub use source::ModelSource;
pub use stable_diffusion::{
    ControlNetLoader, ControlNetStage, StableDiffusionLoader, StableDiffusionPipeline,
    StableDiffusionVariant, TextEncoder,
};
pub use util::*;

pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}
