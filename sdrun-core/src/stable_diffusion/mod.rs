use std::time::Instant;

use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    self, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{info, warn};

mod sampling;
mod variant;

pub use sampling::{apply_guidance, initial_noise, pad_tokens};
pub use variant::StableDiffusionVariant;

use crate::{
    controlnet::{ControlNet, ControlType},
    decoded_to_image, select_best_device, BuildOptions, Component, DeviceMap, Error,
    GenerationRequest, HasSubmodules, LoadOptions, Loader, ModelLike, Optimize, Submodule,
};

/// Maps padded token ids `(1, seq_len)` to text embeddings `(1, seq_len, dim)`.
pub type TextEncoder = Box<dyn Module + Send + Sync>;

/// A ControlNet and the preprocessing its conditioning images go through.
pub struct ControlNetStage {
    model: Submodule<ControlNet>,
    control_type: ControlType,
}

pub struct StableDiffusionPipeline {
    variant: StableDiffusionVariant,
    device: Device,
    clip_config: stable_diffusion::clip::Config,
    tokenizer: Tokenizer,
    text_encoder: Submodule<TextEncoder>,
    unet: Submodule<UNet2DConditionModel>,
    vae: Submodule<AutoEncoderKL>,
    controlnet: Option<ControlNetStage>,
}

impl StableDiffusionPipeline {
    pub fn variant(&self) -> StableDiffusionVariant {
        self.variant
    }

    pub fn has_controlnet(&self) -> bool {
        self.controlnet.is_some()
    }

    /// The edge map (or raw map) the ControlNet would see for `request`.
    pub fn conditioning_image(&self, request: &GenerationRequest) -> Result<Option<DynamicImage>> {
        let (Some(stage), Some(control_image)) = (&self.controlnet, &request.control_image) else {
            return Ok(None);
        };
        let params = request.resolve(self.variant.default_size())?;
        let image = stage.control_type.conditioning_image(
            &control_image.load()?,
            params.width as u32,
            params.height as u32,
        );
        Ok(Some(image))
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let pad_token = self.clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = self
            .tokenizer
            .token_to_id(pad_token)
            .ok_or_else(|| E::msg(format!("tokenizer has no `{pad_token}` token")))?;
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.clip_config.max_position_embeddings;
        if tokens.len() > max_len {
            warn!(
                tokens = tokens.len(),
                max_len, "prompt is longer than the text encoder accepts, truncating"
            );
        }
        let tokens = pad_tokens(tokens, max_len, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&tokens)?)
    }
}

impl ModelLike for StableDiffusionPipeline {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let params = request.resolve(self.variant.default_size())?;
        let use_guidance = params.use_guidance();

        let control = match (&self.controlnet, &request.control_image) {
            (Some(stage), Some(control_image)) => {
                let control = stage.control_type.preprocess(
                    &control_image.load()?,
                    params.width,
                    params.height,
                    &self.device,
                )?;
                let control = if use_guidance {
                    Tensor::cat(&[&control, &control], 0)?
                } else {
                    control
                };
                Some((stage, control.to_dtype(stage.model.dtype())?))
            }
            (Some(_), None) => return Err(Error::MissingControlImage.into()),
            (None, Some(_)) => {
                warn!("ignoring the control image, this pipeline has no ControlNet");
                None
            }
            (None, None) => None,
        };

        info!(
            prompt = %params.prompt,
            width = params.width,
            height = params.height,
            steps = params.steps,
            guidance = params.guidance,
            seed = params.seed,
            "generating image"
        );

        let dtype = self.unet.dtype();
        let text_embeddings = self.encode_prompt(&params.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond_embeddings = self.encode_prompt(&params.negative_prompt)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };
        let text_embeddings = text_embeddings.to_dtype(dtype)?;

        let mut scheduler = self.variant.scheduler(params.steps)?;
        let latents = initial_noise(
            params.seed,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        // scale the initial noise by the standard deviation required by the scheduler
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            let start_time = Instant::now();
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;

            let noise_pred = match &control {
                Some((stage, control)) => {
                    let cn_dtype = stage.model.dtype();
                    let (down, mid) = stage.model.forward(
                        &latent_model_input.to_dtype(cn_dtype)?,
                        timestep as f64,
                        &text_embeddings.to_dtype(cn_dtype)?,
                        control,
                        params.conditioning_scale,
                    )?;
                    let down = down
                        .iter()
                        .map(|residual| residual.to_dtype(dtype))
                        .collect::<candle_core::Result<Vec<_>>>()?;
                    let mid = mid.to_dtype(dtype)?;
                    self.unet.forward_with_additional_residuals(
                        &latent_model_input,
                        timestep as f64,
                        &text_embeddings,
                        Some(down.as_slice()),
                        Some(&mid),
                    )?
                }
                None => self
                    .unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?,
            };

            let noise_pred = if use_guidance {
                apply_guidance(&noise_pred, params.guidance)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            info!(
                "step {}/{} done, {:.2}s",
                timestep_index + 1,
                params.steps,
                start_time.elapsed().as_secs_f32()
            );
        }

        let latents = latents.to_dtype(self.vae.dtype())?;
        let decoded = self.vae.decode(&(latents / self.variant.vae_scale())?)?;
        info!("decoded image");
        decoded_to_image(&decoded)
    }
}

impl HasSubmodules for StableDiffusionPipeline {
    fn device(&self) -> &Device {
        &self.device
    }

    fn submodule_mut(&mut self, component: Component) -> Option<&mut dyn Optimize> {
        match component {
            Component::TextEncoder => Some(&mut self.text_encoder),
            Component::Unet => Some(&mut self.unet),
            Component::Vae => Some(&mut self.vae),
            Component::ControlNet => self
                .controlnet
                .as_mut()
                .map(|stage| &mut stage.model as &mut dyn Optimize),
        }
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionPipeline;

    async fn load(options: &LoadOptions, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let variant = options.resolve_variant()?;
        let dtype = if options.use_f16 {
            DType::F16
        } else {
            DType::F32
        };
        let build_options = BuildOptions {
            dtype,
            use_flash_attn: options.use_flash_attn,
            sliced_attention_size: options.sliced_attention_size,
        };
        let sd_config = variant.config(options.sliced_attention_size);
        info!(model = %options.model, %variant, ?dtype, "loading stable diffusion");

        // --- Load tokenizer ---
        let local_tokenizer = options.model.local_file("tokenizer/tokenizer.json");
        let tokenizer_file = match (&options.tokenizer, local_tokenizer) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => path,
            (None, None) => api
                .model(variant.tokenizer_repo().to_string())
                .get("tokenizer.json")
                .await
                .context("failed to get tokenizer")?,
        };
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(E::msg)
            .context("failed to load tokenizer")?;

        // --- Load text encoder, kept in f32 unless optimized ---
        let clip_weights = options.model.resolve(&api, variant.clip_file()).await?;
        let text_encoder = {
            let device = device.clone();
            let clip_config = sd_config.clip.clone();
            Submodule::build(
                BuildOptions {
                    dtype: DType::F32,
                    ..build_options
                },
                move |o: &BuildOptions| {
                    let clip = stable_diffusion::build_clip_transformer(
                        &clip_config,
                        &clip_weights,
                        &device,
                        o.dtype,
                    )?;
                    Ok(Box::new(clip) as TextEncoder)
                },
            )
            .context("failed to load text encoder")?
        };

        // --- Load VAE ---
        let vae_weights = options
            .model
            .resolve(&api, variant.vae_file(options.use_f16))
            .await?;
        let vae = {
            let device = device.clone();
            Submodule::build(build_options, move |o: &BuildOptions| {
                Ok(variant
                    .config(o.sliced_attention_size)
                    .build_vae(&vae_weights, &device, o.dtype)?)
            })
            .context("failed to load vae")?
        };

        // --- Load UNet ---
        let unet_weights = options
            .model
            .resolve(&api, variant.unet_file(options.use_f16))
            .await?;
        let unet = {
            let device = device.clone();
            Submodule::build(build_options, move |o: &BuildOptions| {
                Ok(variant.config(o.sliced_attention_size).build_unet(
                    &unet_weights,
                    &device,
                    4,
                    o.use_flash_attn,
                    o.dtype,
                )?)
            })
            .context("failed to load unet")?
        };

        Ok(StableDiffusionPipeline {
            variant,
            device,
            clip_config: sd_config.clip,
            tokenizer,
            text_encoder,
            unet,
            vae,
            controlnet: None,
        })
    }
}

/// Loads a Stable Diffusion pipeline and attaches a ControlNet to it.
pub struct ControlNetLoader;

impl Loader for ControlNetLoader {
    type Model = StableDiffusionPipeline;

    async fn load(options: &LoadOptions, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let mut pipeline = StableDiffusionLoader::load(options, api.clone(), device_map).await?;
        let variant = pipeline.variant;
        let source = options
            .controlnet
            .clone()
            .unwrap_or_else(|| crate::ModelSource::hub(variant.controlnet_repo()));
        info!(controlnet = %source, control_type = ?options.control_type, "loading controlnet");

        let weights = source.resolve(&api, variant.controlnet_file()).await?;
        let model = {
            let device = pipeline.device.clone();
            Submodule::build(pipeline.unet.options(), move |o: &BuildOptions| {
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[&weights], o.dtype, &device)
                        .context("failed to build controlnet var builder")?
                };
                let config = variant.controlnet_config(o.sliced_attention_size);
                Ok(ControlNet::new(vb, 4, o.use_flash_attn, &config)?)
            })
            .context("failed to load controlnet")?
        };
        pipeline.controlnet = Some(ControlNetStage {
            model,
            control_type: options.control_type,
        });
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::Embedding;
    use candle_transformers::models::stable_diffusion::{
        clip,
        unet_2d::{BlockConfig, UNet2DConditionModelConfig},
        vae::AutoEncoderKLConfig,
    };
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{controlnet::ControlNetConfig, image_to_base64_png, ControlImage};

    const EMBED_DIM: usize = 16;

    const TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<|endoftext|>": 0, "a": 1, "red": 2, "square": 3},
            "unk_token": "<|endoftext|>"
        }
    }"#;

    fn blocks() -> Vec<BlockConfig> {
        vec![
            BlockConfig {
                out_channels: 32,
                use_cross_attn: Some(1),
                attention_head_dim: 4,
            },
            BlockConfig {
                out_channels: 64,
                use_cross_attn: None,
                attention_head_dim: 4,
            },
        ]
    }

    fn zeros(o: &BuildOptions, device: &Device) -> VarBuilder<'static> {
        VarBuilder::zeros(o.dtype, device)
    }

    /// A zero-weight pipeline small enough to run on CPU in a test.
    fn tiny_pipeline(with_controlnet: bool) -> Result<StableDiffusionPipeline> {
        let device = Device::Cpu;
        let options = BuildOptions::new(DType::F32);
        let mut clip_config = clip::Config::v1_5();
        clip_config.max_position_embeddings = 8;

        let text_encoder = {
            let device = device.clone();
            Submodule::build(options, move |o: &BuildOptions| {
                let table = Tensor::zeros((4, EMBED_DIM), o.dtype, &device)?;
                Ok(Box::new(Embedding::new(table, EMBED_DIM)) as TextEncoder)
            })?
        };
        let unet = {
            let device = device.clone();
            Submodule::build(options, move |o: &BuildOptions| {
                let config = UNet2DConditionModelConfig {
                    blocks: blocks(),
                    layers_per_block: 1,
                    cross_attention_dim: EMBED_DIM,
                    ..Default::default()
                };
                Ok(UNet2DConditionModel::new(zeros(o, &device), 4, 4, false, config)?)
            })?
        };
        let vae = {
            let device = device.clone();
            Submodule::build(options, move |o: &BuildOptions| {
                let config = AutoEncoderKLConfig {
                    block_out_channels: vec![32; 4],
                    layers_per_block: 1,
                    latent_channels: 4,
                    norm_num_groups: 32,
                    use_quant_conv: true,
                    use_post_quant_conv: true,
                };
                Ok(AutoEncoderKL::new(zeros(o, &device), 3, 3, config)?)
            })?
        };
        let controlnet = if with_controlnet {
            let device = device.clone();
            let model = Submodule::build(options, move |o: &BuildOptions| {
                let config = ControlNetConfig {
                    blocks: blocks(),
                    conditioning_embedding_out_channels: vec![8, 8, 16, 16],
                    cross_attention_dim: EMBED_DIM,
                    layers_per_block: 1,
                    ..ControlNetConfig::v1_5(None)
                };
                Ok(ControlNet::new(zeros(o, &device), 4, false, &config)?)
            })?;
            Some(ControlNetStage {
                model,
                control_type: ControlType::Canny,
            })
        } else {
            None
        };

        Ok(StableDiffusionPipeline {
            variant: StableDiffusionVariant::V1_5,
            device,
            clip_config,
            tokenizer: Tokenizer::from_bytes(TOKENIZER).map_err(E::msg)?,
            text_encoder,
            unet,
            vae,
            controlnet,
        })
    }

    fn request(control_image: Option<ControlImage>) -> GenerationRequest {
        GenerationRequest {
            width: Some(64),
            height: Some(48),
            steps: Some(2),
            seed: Some(7),
            control_image,
            ..GenerationRequest::new("a red square")
        }
    }

    fn control_image() -> Result<ControlImage> {
        let image = RgbImage::from_fn(64, 48, |x, _| {
            if x < 32 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        Ok(ControlImage::Base64(image_to_base64_png(
            &DynamicImage::ImageRgb8(image),
        )?))
    }

    #[test]
    fn generates_the_requested_size() -> Result<()> {
        let pipeline = tiny_pipeline(false)?;
        let image = pipeline.run(request(None))?;
        assert_eq!((image.width(), image.height()), (64, 48));
        Ok(())
    }

    #[test]
    fn plain_pipeline_ignores_control_images() -> Result<()> {
        let pipeline = tiny_pipeline(false)?;
        // never opened, so a missing file is fine
        let control = ControlImage::Path("does-not-exist.png".into());
        let image = pipeline.run(request(Some(control.clone())))?;
        assert_eq!((image.width(), image.height()), (64, 48));
        assert!(pipeline.conditioning_image(&request(Some(control)))?.is_none());
        Ok(())
    }

    #[test]
    fn controlnet_pipeline_requires_a_control_image() -> Result<()> {
        let pipeline = tiny_pipeline(true)?;
        let err = pipeline.run(request(None)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingControlImage)
        ));
        Ok(())
    }

    #[test]
    fn controlnet_pipeline_follows_the_control_image() -> Result<()> {
        let pipeline = tiny_pipeline(true)?;
        let request = request(Some(control_image()?));
        let image = pipeline.run(request.clone())?;
        assert_eq!((image.width(), image.height()), (64, 48));

        let conditioning = pipeline
            .conditioning_image(&request)?
            .expect("controlnet pipeline has a conditioning image");
        assert_eq!((conditioning.width(), conditioning.height()), (64, 48));
        Ok(())
    }
}
