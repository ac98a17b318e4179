use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use sdrun_core::{
    controlnet::ControlType, load_pipeline, output_filename, save_image, ControlImage, DeviceMap,
    GenerationRequest, LoadOptions, ModelLike, ModelSource, Optimization, OptimizationDType,
    StableDiffusionVariant,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Stable Diffusion text-to-image generation")]
struct Args {
    /// The prompt to be used for image generation.
    #[arg(
        long,
        default_value = "A very realistic photo of a rusty robot walking on a sandy beach"
    )]
    prompt: String,

    /// What the image should not contain.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Hub repo id (optionally `repo@revision`) or local diffusers directory.
    #[arg(long, default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5")]
    model: String,

    /// Model variant, detected from the model when omitted.
    #[arg(long)]
    variant: Option<StableDiffusionVariant>,

    /// tokenizer.json to use instead of the default one.
    #[arg(long, value_name = "FILE")]
    tokenizer: Option<PathBuf>,

    /// ControlNet repo id or local directory. Enables ControlNet guidance.
    #[arg(long)]
    controlnet: Option<String>,

    /// Image providing the structure to follow. Uses the variant's default
    /// ControlNet when --controlnet is not given.
    #[arg(long, value_name = "FILE")]
    control_image: Option<PathBuf>,

    /// How the control image is turned into a conditioning map (canny, raw).
    #[arg(long, default_value = "canny")]
    control_type: ControlType,

    /// Also write the conditioning map the ControlNet sees.
    #[arg(long, value_name = "FILE")]
    control_image_output: Option<PathBuf>,

    /// Strength of the ControlNet residuals.
    #[arg(long)]
    conditioning_scale: Option<f64>,

    /// Accelerator device: cpu, auto, gpu[:N], cuda[:N] or metal[:N].
    #[arg(long, env = "SDRUN_DEVICE", default_value = "auto")]
    device: DeviceMap,

    /// The width in pixels of the generated image.
    #[arg(long)]
    width: Option<usize>,

    /// The height in pixels of the generated image.
    #[arg(long)]
    height: Option<usize>,

    /// The number of denoising steps.
    #[arg(long)]
    steps: Option<usize>,

    /// Classifier-free guidance scale, disabled at 1.0 or below.
    #[arg(long)]
    guidance: Option<f64>,

    /// Random seed; sample `i` uses `seed + i`.
    #[arg(long)]
    seed: Option<u64>,

    /// The number of samples to generate.
    #[arg(long, default_value = "1")]
    num_samples: NonZeroUsize,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "sdrun_output.png")]
    output: PathBuf,

    /// Load the fp16 weight files in half precision.
    #[arg(long)]
    f16: bool,

    /// Rebuild every sub-model of the pipeline in optimized form after loading.
    #[arg(long)]
    optimize: bool,

    /// Precision used by --optimize (auto, f16, bf16, f32).
    #[arg(long, default_value = "auto")]
    optimize_dtype: OptimizationDType,

    /// Use flash attention in the UNet and ControlNet.
    #[arg(long)]
    use_flash_attn: bool,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default).
    #[arg(long)]
    sliced_attention_size: Option<usize>,
}

impl Args {
    fn load_options(&self) -> LoadOptions {
        let mut options = LoadOptions {
            variant: self.variant,
            tokenizer: self.tokenizer.clone(),
            controlnet: self.controlnet.as_deref().map(ModelSource::parse),
            use_controlnet: self.control_image.is_some(),
            control_type: self.control_type,
            use_f16: self.f16,
            use_flash_attn: self.use_flash_attn,
            sliced_attention_size: self.sliced_attention_size,
            ..LoadOptions::new(ModelSource::parse(&self.model))
        };
        if self.optimize {
            options.optimization = Some(Optimization {
                dtype: self.optimize_dtype,
                use_flash_attn: self.use_flash_attn,
                sliced_attention_size: self.sliced_attention_size,
            });
        }
        options
    }

    fn request(&self, seed: Option<u64>) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt.clone(),
            negative_prompt: Some(self.negative_prompt.clone()),
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance: self.guidance,
            seed,
            control_image: self.control_image.clone().map(ControlImage::Path),
            controlnet_conditioning_scale: self.conditioning_scale,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = args.load_options();
    let pipeline = load_pipeline(&options, Api::new()?, args.device).await?;

    let base_seed = args.seed.unwrap_or_else(rand::random);
    let num_samples = args.num_samples.get();
    for idx in 0..num_samples {
        let request = args.request(Some(base_seed.wrapping_add(idx as u64)));
        if idx == 0 {
            if let Some(path) = &args.control_image_output {
                if let Some(conditioning) = pipeline.conditioning_image(&request)? {
                    save_image(&conditioning, path)?;
                }
            }
        }
        info!("Generating sample {}/{}", idx + 1, num_samples);
        let image = pipeline.run(request)?;
        save_image(&image, output_filename(&args.output, idx + 1, num_samples))?;
    }
    Ok(())
}
