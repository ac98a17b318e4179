use candle_core::{Device, Result, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Standard normal samples from a seeded generator via Box-Muller.
///
/// The noise is drawn on the host so that a seed gives the same starting
/// latents on every backend, CPU included.
pub fn initial_noise<S: Into<Shape>>(seed: u64, shape: S, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let len = shape.elem_count();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len + 1);
    while values.len() < len {
        // (0, 1] keeps ln() finite.
        let u1 = 1.0 - rng.gen::<f64>();
        let u2 = rng.gen::<f64>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        values.push((radius * theta.cos()) as f32);
        values.push((radius * theta.sin()) as f32);
    }
    values.truncate(len);
    Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)
}

/// Pads `tokens` with `pad_id` up to `max_len`. Longer sequences are cut to
/// `max_len`, keeping their final (end of text) token.
pub fn pad_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        let last = tokens[tokens.len() - 1];
        tokens.truncate(max_len.saturating_sub(1));
        tokens.push(last);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// Classifier-free guidance: `uncond + scale * (cond - uncond)` over a
/// batch laid out as `[uncond, cond]`.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = (&chunks[0], &chunks[1]);
    uncond + ((cond - uncond)? * guidance_scale)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() -> Result<()> {
        let a = initial_noise(42, (1, 4, 8, 8), &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let b = initial_noise(42, (1, 4, 8, 8), &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let c = initial_noise(43, (1, 4, 8, 8), &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn noise_is_roughly_standard_normal() -> Result<()> {
        let noise = initial_noise(7, (1, 4, 64, 64), &Device::Cpu)?;
        assert_eq!(noise.dims(), &[1, 4, 64, 64]);
        let mean = noise.mean_all()?.to_scalar::<f32>()?;
        let var = noise.sqr()?.mean_all()?.to_scalar::<f32>()? - mean * mean;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        Ok(())
    }

    #[test]
    fn odd_element_counts_are_filled() -> Result<()> {
        let noise = initial_noise(1, (3, 3), &Device::Cpu)?;
        assert_eq!(noise.dims(), &[3, 3]);
        Ok(())
    }

    #[test]
    fn pads_and_truncates_token_ids() {
        assert_eq!(pad_tokens(vec![49406, 320, 49407], 5, 0), vec![49406, 320, 49407, 0, 0]);
        assert_eq!(pad_tokens(vec![1, 2, 3, 4, 5, 6, 9], 4, 0), vec![1, 2, 3, 9]);
        assert_eq!(pad_tokens(vec![1, 2, 9], 3, 0), vec![1, 2, 9]);
    }

    #[test]
    fn guidance_extrapolates_from_uncond() -> Result<()> {
        let pred = Tensor::new(&[[1f32, 1.], [3., 5.]], &Device::Cpu)?;
        let guided = apply_guidance(&pred, 2.0)?.to_vec2::<f32>()?;
        assert_eq!(guided, vec![vec![5., 9.]]);
        Ok(())
    }
}
