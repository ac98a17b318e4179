//! Swapping a loaded pipeline's neural sub-models for optimized rebuilds.
//!
//! candle modules own their weights in a fixed dtype, so "optimizing" one
//! means building it again from its safetensors with a lower precision and a
//! faster attention path. [`Submodule`] keeps what is needed to do that and
//! [`optimize_pipeline`] sweeps every component a pipeline exposes.

use std::{fmt, ops::Deref, str::FromStr};

use anyhow::Result;
use candle_core::{DType, Device};
use tracing::{debug, info};

/// The neural sub-models a pipeline may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    TextEncoder,
    Unet,
    Vae,
    ControlNet,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::TextEncoder,
        Component::Unet,
        Component::Vae,
        Component::ControlNet,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder",
            Self::Unet => "unet",
            Self::Vae => "vae",
            Self::ControlNet => "controlnet",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a sub-model is (re)built from its weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildOptions {
    pub dtype: DType,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
}

impl BuildOptions {
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            use_flash_attn: false,
            sliced_attention_size: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptimizationDType {
    /// bf16 on accelerators, f32 on CPU.
    #[default]
    Auto,
    F16,
    Bf16,
    F32,
}

impl OptimizationDType {
    pub fn resolve(&self, device: &Device) -> DType {
        match self {
            Self::Auto => device.bf16_default_to_f32(),
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

impl FromStr for OptimizationDType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "f16" | "fp16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "f32" | "fp32" | "float32" => Ok(Self::F32),
            other => Err(format!("unknown dtype `{other}`, expected auto, f16, bf16 or f32")),
        }
    }
}

/// Settings applied to every sub-model found by [`optimize_pipeline`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Optimization {
    pub dtype: OptimizationDType,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
}

impl Optimization {
    pub fn build_options(&self, device: &Device) -> BuildOptions {
        BuildOptions {
            dtype: self.dtype.resolve(device),
            use_flash_attn: self.use_flash_attn,
            sliced_attention_size: self.sliced_attention_size,
        }
    }
}

type Builder<M> = Box<dyn Fn(&BuildOptions) -> Result<M> + Send + Sync>;

/// A loaded module together with the recipe that produced it.
pub struct Submodule<M> {
    options: BuildOptions,
    builder: Builder<M>,
    module: M,
}

impl<M> Submodule<M> {
    pub fn build<F>(options: BuildOptions, builder: F) -> Result<Self>
    where
        F: Fn(&BuildOptions) -> Result<M> + Send + Sync + 'static,
    {
        let module = builder(&options)?;
        Ok(Self {
            options,
            builder: Box::new(builder),
            module,
        })
    }

    pub fn options(&self) -> BuildOptions {
        self.options
    }

    pub fn dtype(&self) -> DType {
        self.options.dtype
    }

    /// Replaces the module with one built from `options`. The current module
    /// is kept if the build fails.
    pub fn rebuild(&mut self, options: BuildOptions) -> Result<()> {
        self.module = (self.builder)(&options)?;
        self.options = options;
        Ok(())
    }
}

impl<M> Deref for Submodule<M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        &self.module
    }
}

impl<M> fmt::Debug for Submodule<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submodule")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub trait Optimize {
    /// Returns `false` when the module already matches `options` and was left alone.
    fn optimize(&mut self, options: BuildOptions) -> Result<bool>;
}

impl<M> Optimize for Submodule<M> {
    fn optimize(&mut self, options: BuildOptions) -> Result<bool> {
        if options == self.options {
            return Ok(false);
        }
        self.rebuild(options)?;
        Ok(true)
    }
}

/// A pipeline whose neural sub-models can be looked up by component.
pub trait HasSubmodules {
    fn device(&self) -> &Device;

    /// `None` when the pipeline has no such component.
    fn submodule_mut(&mut self, component: Component) -> Option<&mut dyn Optimize>;
}

/// Rebuilds every sub-model present on `pipeline` with `optimization`,
/// skipping components the pipeline does not have. Returns the components
/// that were swapped.
pub fn optimize_pipeline<P>(pipeline: &mut P, optimization: &Optimization) -> Result<Vec<Component>>
where
    P: HasSubmodules + ?Sized,
{
    let options = optimization.build_options(pipeline.device());
    let mut swapped = Vec::new();
    for component in Component::ALL {
        let Some(submodule) = pipeline.submodule_mut(component) else {
            debug!(%component, "no such component, skipping");
            continue;
        };
        if submodule.optimize(options)? {
            info!(%component, dtype = ?options.dtype, "optimized");
            swapped.push(component);
        } else {
            debug!(%component, "already built with these options");
        }
    }
    Ok(swapped)
}
