use std::sync::Arc;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{
    optimize_pipeline, ControlNetLoader, DeviceMap, LoadOptions, Loader, ModelLike,
    StableDiffusionLoader, StableDiffusionPipeline,
};

/// Enum of supported pipeline types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    StableDiffusion,
    ControlNet,
}

impl ModelType {
    pub fn from_options(options: &LoadOptions) -> Self {
        if options.wants_controlnet() {
            ModelType::ControlNet
        } else {
            ModelType::StableDiffusion
        }
    }
}

/// Loads the pipeline described by `options` and runs the optimization sweep
/// when one is configured.
pub async fn load_pipeline(
    options: &LoadOptions,
    api: Api,
    device_map: DeviceMap,
) -> Result<StableDiffusionPipeline> {
    let model_type = ModelType::from_options(options);
    let variant = options.resolve_variant()?;
    info!(
        "Loading model: {} (detected type: {:?}/variant: {})",
        options.model, model_type, variant
    );

    let mut pipeline = match model_type {
        ModelType::StableDiffusion => {
            StableDiffusionLoader::load(options, api, device_map).await?
        }
        ModelType::ControlNet => ControlNetLoader::load(options, api, device_map).await?,
    };

    if let Some(optimization) = &options.optimization {
        let swapped = optimize_pipeline(&mut pipeline, optimization)?;
        info!(?swapped, "optimized pipeline");
    }
    Ok(pipeline)
}

/// Load a pipeline and share it behind the [`ModelLike`] interface.
pub async fn load_model(
    options: &LoadOptions,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    let pipeline = load_pipeline(options, api, device_map).await?;
    Ok(Arc::new(pipeline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelSource;

    #[test]
    fn model_type_follows_controlnet_request() {
        let mut options = LoadOptions::new(ModelSource::hub("stabilityai/stable-diffusion-2-1"));
        assert_eq!(ModelType::from_options(&options), ModelType::StableDiffusion);
        options.controlnet = Some(ModelSource::hub("thibaud/controlnet-sd21-canny-diffusers"));
        assert_eq!(ModelType::from_options(&options), ModelType::ControlNet);
    }
}
