//! The ControlNet conditioning network for Stable Diffusion 1.x/2.x UNets.
//!
//! A copy of the UNet's encoder half whose inputs are shifted by an embedded
//! control image and whose per-resolution outputs go through 1x1 convolutions.
//! The outputs are added to the UNet's skip connections and mid block.
//! Weight names follow the diffusers `ControlNetModel` layout.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::BlockConfig,
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};

#[derive(Debug, Clone)]
pub struct ControlNetConfig {
    pub blocks: Vec<BlockConfig>,
    pub conditioning_channels: usize,
    pub conditioning_embedding_out_channels: Vec<usize>,
    pub cross_attention_dim: usize,
    pub downsample_padding: usize,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub layers_per_block: usize,
    pub mid_block_scale_factor: f64,
    pub norm_eps: f64,
    pub norm_num_groups: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
}

fn block(
    out_channels: usize,
    use_cross_attn: Option<usize>,
    attention_head_dim: usize,
) -> BlockConfig {
    BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    }
}

impl ControlNetConfig {
    /// https://huggingface.co/lllyasviel/sd-controlnet-canny/blob/main/config.json
    pub fn v1_5(sliced_attention_size: Option<usize>) -> Self {
        Self {
            blocks: vec![
                block(320, Some(1), 8),
                block(640, Some(1), 8),
                block(1280, Some(1), 8),
                block(1280, None, 8),
            ],
            conditioning_channels: 3,
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
            cross_attention_dim: 768,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            layers_per_block: 2,
            mid_block_scale_factor: 1.,
            norm_eps: 1e-5,
            norm_num_groups: 32,
            sliced_attention_size,
            use_linear_projection: false,
        }
    }

    /// ControlNets trained against the stable-diffusion-2-1 UNet layout.
    pub fn v2_1(sliced_attention_size: Option<usize>) -> Self {
        Self {
            blocks: vec![
                block(320, Some(1), 5),
                block(640, Some(1), 10),
                block(1280, Some(1), 20),
                block(1280, None, 20),
            ],
            cross_attention_dim: 1024,
            use_linear_projection: true,
            ..Self::v1_5(sliced_attention_size)
        }
    }
}

/// Embeds the pixel-space control image down to latent resolution.
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<(Conv2d, Conv2d)>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(
        vs: VarBuilder,
        conditioning_embedding_channels: usize,
        conditioning_channels: usize,
        block_out_channels: &[usize],
    ) -> Result<Self> {
        let pad = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let strided = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let first = block_out_channels[0];
        let last = block_out_channels[block_out_channels.len() - 1];
        let conv_in = conv2d(conditioning_channels, first, 3, pad, vs.pp("conv_in"))?;
        let vs_b = vs.pp("blocks");
        let blocks = block_out_channels
            .windows(2)
            .enumerate()
            .map(|(i, channels)| {
                let (c_in, c_out) = (channels[0], channels[1]);
                let conv1 = conv2d(c_in, c_in, 3, pad, vs_b.pp((2 * i).to_string()))?;
                let conv2 = conv2d(c_in, c_out, 3, strided, vs_b.pp((2 * i + 1).to_string()))?;
                Ok((conv1, conv2))
            })
            .collect::<Result<Vec<_>>>()?;
        let conv_out = conv2d(last, conditioning_embedding_channels, 3, pad, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for (conv1, conv2) in self.blocks.iter() {
            xs = conv1.forward(&xs)?.silu()?;
            xs = conv2.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

pub struct ControlNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    down_zero_convs: Vec<Conv2d>,
    mid_block: UNetMidBlock2DCrossAttn,
    mid_zero_conv: Conv2d,
}

impl ControlNet {
    pub fn new(
        vs: VarBuilder,
        in_channels: usize,
        use_flash_attn: bool,
        config: &ControlNetConfig,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks[n_blocks - 1].out_channels;
        let bl_attention_head_dim = config.blocks[n_blocks - 1].attention_head_dim;
        let time_embed_dim = b_channels * 4;
        let pad = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(in_channels, b_channels, 3, pad, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding = ConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            b_channels,
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
        )?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = config
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let BlockConfig {
                    out_channels,
                    use_cross_attn,
                    attention_head_dim,
                } = *block;
                let sliced_attention_size = match config.sliced_attention_size {
                    Some(0) => Some(attention_head_dim / 2),
                    other => other,
                };
                let in_channels = if i > 0 {
                    config.blocks[i - 1].out_channels
                } else {
                    b_channels
                };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                let block = match use_cross_attn {
                    Some(transformer_layers_per_block) => {
                        let cfg = CrossAttnDownBlock2DConfig {
                            downblock: db_cfg,
                            attn_num_head_channels: attention_head_dim,
                            cross_attention_dim: config.cross_attention_dim,
                            sliced_attention_size,
                            use_linear_projection: config.use_linear_projection,
                            transformer_layers_per_block,
                        };
                        DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                            vs_db.pp(i.to_string()),
                            in_channels,
                            out_channels,
                            Some(time_embed_dim),
                            use_flash_attn,
                            cfg,
                        )?)
                    }
                    None => DownBlock::Basic(DownBlock2D::new(
                        vs_db.pp(i.to_string()),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    )?),
                };
                Ok(block)
            })
            .collect::<Result<Vec<_>>>()?;

        // One 1x1 conv per residual the encoder emits: conv_in, then each
        // resnet layer, then each downsampler.
        let mut residual_channels = vec![b_channels];
        for (i, block) in config.blocks.iter().enumerate() {
            residual_channels
                .extend(std::iter::repeat(block.out_channels).take(config.layers_per_block));
            if i < n_blocks - 1 {
                residual_channels.push(block.out_channels);
            }
        }
        let vs_zc = vs.pp("controlnet_down_blocks");
        let down_zero_convs = residual_channels
            .iter()
            .enumerate()
            .map(|(i, &channels)| {
                conv2d(channels, channels, 1, Default::default(), vs_zc.pp(i.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_transformer_layers_per_block = config
            .blocks
            .last()
            .and_then(|block| block.use_cross_attn)
            .unwrap_or(1);
        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: bl_attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            sliced_attention_size: match config.sliced_attention_size {
                Some(0) => Some(bl_attention_head_dim / 2),
                other => other,
            },
            transformer_layers_per_block: mid_transformer_layers_per_block,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;
        let mid_zero_conv = conv2d(
            bl_channels,
            bl_channels,
            1,
            Default::default(),
            vs.pp("controlnet_mid_block"),
        )?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            down_zero_convs,
            mid_block,
            mid_zero_conv,
        })
    }

    /// Number of down residuals returned by [`ControlNet::forward`].
    pub fn num_down_residuals(&self) -> usize {
        self.down_zero_convs.len()
    }

    /// Returns the residuals to add to the UNet's skip connections and to
    /// its mid block output, each scaled by `conditioning_scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        controlnet_cond: &Tensor,
        conditioning_scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let bsize = xs.dim(0)?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(xs)?;
        let cond = self.cond_embedding.forward(controlnet_cond)?;
        let xs = (xs + cond)?;

        let mut down_block_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (next, res_xs) = match down_block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            down_block_res_xs.extend(res_xs);
            xs = next;
        }
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down = down_block_res_xs
            .iter()
            .zip(self.down_zero_convs.iter())
            .map(|(res, conv)| conv.forward(res)? * conditioning_scale)
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.mid_zero_conv.forward(&xs)? * conditioning_scale)?;
        Ok((down, mid))
    }
}
