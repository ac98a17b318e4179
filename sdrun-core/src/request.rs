use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::Error;

pub const DEFAULT_STEPS: usize = 30;
pub const DEFAULT_GUIDANCE: f64 = 7.5;
pub const DEFAULT_CONDITIONING_SCALE: f64 = 1.0;

/// Structural cue for ControlNet pipelines, as a file or as inline bytes.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlImage {
    Path(PathBuf),
    Base64(String),
}

impl ControlImage {
    pub fn load(&self) -> Result<DynamicImage> {
        match self {
            Self::Path(path) => image::open(path)
                .with_context(|| format!("failed to open control image {}", path.display())),
            Self::Base64(encoded) => {
                let bytes = BASE64_STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::InvalidControlImage(e.to_string()))?;
                image::load_from_memory(&bytes)
                    .map_err(|e| Error::InvalidControlImage(e.to_string()).into())
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default)]
    pub guidance: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub control_image: Option<ControlImage>,
    #[serde(default)]
    pub controlnet_conditioning_scale: Option<f64>,
}

/// A request with every default filled in and checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: u64,
    pub conditioning_scale: f64,
}

impl ResolvedRequest {
    pub fn use_guidance(&self) -> bool {
        self.guidance > 1.0
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Fills in defaults, `default_size` being the variant's native
    /// `(width, height)`, and validates the result.
    pub fn resolve(&self, default_size: (usize, usize)) -> Result<ResolvedRequest, Error> {
        let width = self.width.unwrap_or(default_size.0);
        let height = self.height.unwrap_or(default_size.1);
        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        let steps = self.steps.unwrap_or(DEFAULT_STEPS);
        if steps == 0 {
            return Err(Error::InvalidSteps);
        }
        Ok(ResolvedRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
            width,
            height,
            steps,
            guidance: self.guidance.unwrap_or(DEFAULT_GUIDANCE),
            seed: self.seed.unwrap_or_else(rand::random),
            conditioning_scale: self
                .controlnet_conditioning_scale
                .unwrap_or(DEFAULT_CONDITIONING_SCALE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_defaults_from_variant_size() {
        let request = GenerationRequest {
            seed: Some(42),
            ..GenerationRequest::new("a lighthouse at dusk")
        };
        let resolved = request.resolve((512, 512)).unwrap();
        assert_eq!(resolved.width, 512);
        assert_eq!(resolved.height, 512);
        assert_eq!(resolved.steps, DEFAULT_STEPS);
        assert_eq!(resolved.guidance, DEFAULT_GUIDANCE);
        assert_eq!(resolved.seed, 42);
        assert_eq!(resolved.negative_prompt, "");
        assert!(resolved.use_guidance());
    }

    #[test]
    fn guidance_at_or_below_one_disables_cfg() {
        let request = GenerationRequest {
            guidance: Some(1.0),
            ..GenerationRequest::new("x")
        };
        assert!(!request.resolve((512, 512)).unwrap().use_guidance());
    }

    #[test]
    fn rejects_dimensions_not_divisible_by_eight() {
        for (width, height) in [(510, 512), (512, 0), (0, 0), (513, 777)] {
            let request = GenerationRequest {
                width: Some(width),
                height: Some(height),
                ..GenerationRequest::new("x")
            };
            assert!(matches!(
                request.resolve((512, 512)),
                Err(Error::InvalidDimensions { .. })
            ));
        }
    }

    #[test]
    fn rejects_zero_steps() {
        let request = GenerationRequest {
            steps: Some(0),
            ..GenerationRequest::new("x")
        };
        assert!(matches!(request.resolve((512, 512)), Err(Error::InvalidSteps)));
    }

    #[test]
    fn deserializes_minimal_and_full_bodies() {
        let minimal: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a red fox"}"#).unwrap();
        assert_eq!(minimal, GenerationRequest::new("a red fox"));

        let full: GenerationRequest = serde_json::from_str(
            r#"{
                "prompt": "a bird",
                "width": 640,
                "height": 384,
                "steps": 20,
                "guidance": 9.0,
                "seed": 7,
                "control_image": {"path": "edges.png"},
                "controlnet_conditioning_scale": 0.5
            }"#,
        )
        .unwrap();
        assert_eq!(full.control_image, Some(ControlImage::Path("edges.png".into())));
        let resolved = full.resolve((512, 512)).unwrap();
        assert_eq!((resolved.width, resolved.height), (640, 384));
        assert_eq!(resolved.conditioning_scale, 0.5);
    }

    #[test]
    fn invalid_base64_control_image_is_reported() {
        let err = ControlImage::Base64("not base64!".to_string())
            .load()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidControlImage(_))
        ));
    }
}
