use std::{future::Future, path::PathBuf};

use anyhow::Result;
use hf_hub::api::tokio::Api;
use tracing::warn;

use crate::{
    controlnet::ControlType, DeviceMap, Error, ModelLike, ModelSource, Optimization,
    StableDiffusionVariant,
};

/// Everything needed to turn checkpoints into a ready pipeline.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub model: ModelSource,
    /// Overrides variant detection.
    pub variant: Option<StableDiffusionVariant>,
    /// A `tokenizer.json` to use instead of the checkpoint's or the hub default.
    pub tokenizer: Option<PathBuf>,
    /// ControlNet checkpoint; `None` uses the variant's default when a
    /// ControlNet pipeline is requested.
    pub controlnet: Option<ModelSource>,
    pub use_controlnet: bool,
    pub control_type: ControlType,
    pub use_f16: bool,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
    /// Applied to the loaded pipeline's sub-models before it is returned.
    pub optimization: Option<Optimization>,
}

impl LoadOptions {
    pub fn new(model: ModelSource) -> Self {
        Self {
            model,
            variant: None,
            tokenizer: None,
            controlnet: None,
            use_controlnet: false,
            control_type: ControlType::default(),
            use_f16: false,
            use_flash_attn: false,
            sliced_attention_size: None,
            optimization: None,
        }
    }

    pub fn wants_controlnet(&self) -> bool {
        self.use_controlnet || self.controlnet.is_some()
    }

    /// The explicit variant, else the one recorded in a local checkpoint's
    /// UNet config, else the one named by the model id.
    pub fn resolve_variant(&self) -> Result<StableDiffusionVariant> {
        if let Some(variant) = self.variant {
            return Ok(variant);
        }
        if let Some(config) = self.model.local_file("unet/config.json") {
            match StableDiffusionVariant::from_unet_config(&config) {
                Ok(Some(variant)) => return Ok(variant),
                Ok(None) => {}
                Err(e) => warn!("could not read {}: {e:#}", config.display()),
            }
        }
        StableDiffusionVariant::from_name(&self.model.name()).ok_or_else(|| {
            Error::UnsupportedModel(format!(
                "cannot tell which Stable Diffusion variant {} is, pass one explicitly",
                self.model
            ))
            .into()
        })
    }
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        options: &LoadOptions,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
