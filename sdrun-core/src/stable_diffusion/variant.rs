use std::{fmt, path::Path, str::FromStr};

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{PredictionType, Scheduler, SchedulerConfig},
    StableDiffusionConfig,
};
use serde::Deserialize;

use crate::controlnet::ControlNetConfig;

/// Checkpoint families sharing a UNet/VAE/CLIP layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StableDiffusionVariant {
    #[default]
    V1_5,
    V2_1,
    /// The 512px, epsilon-prediction release of 2.1.
    V2_1Base,
}

impl StableDiffusionVariant {
    /// Detect the variant from a repo id or path.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name = model_name.to_lowercase();
        let is_v2 = ["2-1", "2.1", "2_1", "v2", "sd2", "diffusion-2"]
            .iter()
            .any(|tag| name.contains(tag));
        if is_v2 && name.trim_end_matches('/').ends_with("-base") {
            Some(Self::V2_1Base)
        } else if is_v2 {
            Some(Self::V2_1)
        } else if ["1-5", "1.5", "1_5", "v1", "sd1", "stable-diffusion", "controlnet"]
            .iter()
            .any(|tag| name.contains(tag))
        {
            Some(Self::V1_5)
        } else {
            None
        }
    }

    /// Detect the variant from a diffusers `unet/config.json`, which records
    /// the width of the text embeddings the UNet attends to and its latent size.
    pub fn from_unet_config(path: &Path) -> Result<Option<Self>> {
        #[derive(Deserialize)]
        struct UnetConfig {
            cross_attention_dim: usize,
            #[serde(default)]
            sample_size: Option<usize>,
        }
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: UnetConfig = serde_json::from_str(&config)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(match (config.cross_attention_dim, config.sample_size) {
            (768, _) => Some(Self::V1_5),
            (1024, Some(64)) => Some(Self::V2_1Base),
            (1024, _) => Some(Self::V2_1),
            _ => None,
        })
    }

    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "stable-diffusion-v1-5/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
            Self::V2_1Base => "stabilityai/stable-diffusion-2-1-base",
        }
    }

    /// Hub repo providing a `tokenizer.json` for the text encoder.
    pub fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 | Self::V2_1Base => "openai/clip-vit-base-patch32",
        }
    }

    /// Canny-edge ControlNet trained against this variant.
    pub fn controlnet_repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "lllyasviel/sd-controlnet-canny",
            Self::V2_1 | Self::V2_1Base => "thibaud/controlnet-sd21-canny-diffusers",
        }
    }

    pub fn default_size(&self) -> (usize, usize) {
        match self {
            Self::V1_5 | Self::V2_1Base => (512, 512),
            Self::V2_1 => (768, 768),
        }
    }

    pub fn vae_scale(&self) -> f64 {
        0.18215
    }

    /// Model layout. The 2.1 base release shares the 2.1 UNet/VAE/CLIP, only
    /// its resolution and scheduler differ.
    pub fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
            Self::V2_1Base => {
                StableDiffusionConfig::v2_1(sliced_attention_size, Some(512), Some(512))
            }
        }
    }

    /// DDIM as shipped in each release's `scheduler/scheduler_config.json`.
    pub fn scheduler_config(&self) -> DDIMSchedulerConfig {
        let prediction_type = match self {
            Self::V1_5 | Self::V2_1Base => PredictionType::Epsilon,
            Self::V2_1 => PredictionType::VPrediction,
        };
        DDIMSchedulerConfig {
            prediction_type,
            ..Default::default()
        }
    }

    pub fn scheduler(&self, n_steps: usize) -> Result<Box<dyn Scheduler>> {
        Ok(self.scheduler_config().build(n_steps)?)
    }

    pub fn controlnet_config(&self, sliced_attention_size: Option<usize>) -> ControlNetConfig {
        match self {
            Self::V1_5 => ControlNetConfig::v1_5(sliced_attention_size),
            Self::V2_1 | Self::V2_1Base => ControlNetConfig::v2_1(sliced_attention_size),
        }
    }

    pub fn unet_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "unet/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "unet/diffusion_pytorch_model.safetensors"
        }
    }

    pub fn vae_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "vae/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "vae/diffusion_pytorch_model.safetensors"
        }
    }

    pub fn clip_file(&self) -> &'static str {
        "text_encoder/model.safetensors"
    }

    pub fn controlnet_file(&self) -> &'static str {
        "diffusion_pytorch_model.safetensors"
    }
}

impl FromStr for StableDiffusionVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim_start_matches('v') {
            "1.5" | "1-5" | "1_5" => Ok(Self::V1_5),
            "2.1" | "2-1" | "2_1" => Ok(Self::V2_1),
            "2.1-base" | "2-1-base" | "2_1_base" => Ok(Self::V2_1Base),
            other => Err(format!(
                "unknown variant `{other}`, expected v1-5, v2-1 or v2-1-base"
            )),
        }
    }
}

impl fmt::Display for StableDiffusionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1_5 => write!(f, "v1-5"),
            Self::V2_1 => write!(f, "v2-1"),
            Self::V2_1Base => write!(f, "v2-1-base"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_variant_from_repo_names() {
        use StableDiffusionVariant::*;
        let cases = [
            ("stable-diffusion-v1-5/stable-diffusion-v1-5", Some(V1_5)),
            ("runwayml/stable-diffusion-v1-5", Some(V1_5)),
            ("stabilityai/stable-diffusion-2-1", Some(V2_1)),
            ("stabilityai/stable-diffusion-2-1-base", Some(V2_1Base)),
            ("./models/sd-2-1-base/", Some(V2_1Base)),
            ("./models/SD2.1-finetune", Some(V2_1)),
            ("CompVis/stable-diffusion-v1-4", Some(V1_5)),
            ("lllyasviel/sd-controlnet-canny", Some(V1_5)),
            ("black-forest-labs/FLUX.1-schnell", None),
        ];
        for (name, expected) in cases {
            assert_eq!(StableDiffusionVariant::from_name(name), expected, "{name}");
        }
    }

    #[test]
    fn detects_variant_from_unet_config() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("sdrun-variant-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("config.json");

        std::fs::write(&path, r#"{"cross_attention_dim": 1024, "sample_size": 96}"#)?;
        assert_eq!(
            StableDiffusionVariant::from_unet_config(&path)?,
            Some(StableDiffusionVariant::V2_1)
        );
        std::fs::write(&path, r#"{"cross_attention_dim": 1024, "sample_size": 64}"#)?;
        assert_eq!(
            StableDiffusionVariant::from_unet_config(&path)?,
            Some(StableDiffusionVariant::V2_1Base)
        );
        std::fs::write(&path, r#"{"cross_attention_dim": 2048}"#)?;
        assert_eq!(StableDiffusionVariant::from_unet_config(&path)?, None);

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn parses_variant_flags() {
        assert_eq!("v1-5".parse::<StableDiffusionVariant>(), Ok(StableDiffusionVariant::V1_5));
        assert_eq!("2.1".parse::<StableDiffusionVariant>(), Ok(StableDiffusionVariant::V2_1));
        assert!("xl".parse::<StableDiffusionVariant>().is_err());
        assert_eq!(
            "v2-1-base".parse::<StableDiffusionVariant>(),
            Ok(StableDiffusionVariant::V2_1Base)
        );
        for variant in [
            StableDiffusionVariant::V1_5,
            StableDiffusionVariant::V2_1,
            StableDiffusionVariant::V2_1Base,
        ] {
            assert_eq!(variant.to_string().parse::<StableDiffusionVariant>(), Ok(variant));
        }
    }

    #[test]
    fn default_sizes_match_training_resolution() {
        assert_eq!(StableDiffusionVariant::V1_5.default_size(), (512, 512));
        assert_eq!(StableDiffusionVariant::V2_1.default_size(), (768, 768));
        assert_eq!(StableDiffusionVariant::V2_1.config(None).width, 768);
        assert_eq!(StableDiffusionVariant::V2_1Base.default_size(), (512, 512));
        assert_eq!(StableDiffusionVariant::V2_1Base.config(None).width, 512);
    }

    #[test]
    fn base_release_samples_with_epsilon_prediction() -> Result<()> {
        use StableDiffusionVariant::*;
        assert!(matches!(
            V2_1.scheduler_config().prediction_type,
            PredictionType::VPrediction
        ));
        for variant in [V1_5, V2_1Base] {
            assert!(matches!(
                variant.scheduler_config().prediction_type,
                PredictionType::Epsilon
            ));
        }
        assert_eq!(V2_1Base.scheduler(10)?.timesteps().len(), 10);
        Ok(())
    }
}
