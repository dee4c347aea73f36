//! Conditional 2D unet taking adapter features.
//!
//! Same layout and variable names as the diffusers `UNet2DConditionModel`, so
//! the same weights load. The encoder is rebuilt here: the feature of each
//! level is added to the hidden state after the last layer of that level,
//! before it is downsampled, so it reaches the skip connection, every later
//! level and the mid block.
use diffusers::models::{
    attention::{SpatialTransformer, SpatialTransformerConfig},
    embeddings::{TimestepEmbedding, Timesteps},
    resnet::{ResnetBlock2D, ResnetBlock2DConfig},
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    unet_2d_blocks::{
        CrossAttnUpBlock2D, CrossAttnUpBlock2DConfig, UNetMidBlock2DCrossAttn,
        UNetMidBlock2DCrossAttnConfig, UpBlock2D, UpBlock2DConfig,
    },
};
use tch::{nn, Tensor};

use crate::error::Error;

/// One resolution level of the unet encoder.
pub(crate) trait DownLevel {
    /// Hidden state after each layer of the level (resnet, then attention
    /// when present).
    fn layers(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Vec<Tensor>;

    /// Halves the resolution, `None` for the last level.
    fn downsample(&self, xs: &Tensor) -> Option<Tensor>;
}

#[derive(Debug)]
pub(crate) struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<nn::Conv2D>,
}

impl DownBlock {
    fn new(
        vs: nn::Path,
        in_channels: i64,
        block: &BlockConfig,
        add_downsample: bool,
        temb_channels: i64,
        config: &UNet2DConditionModelConfig,
    ) -> Self {
        let out_channels = block.out_channels;
        let resnet_cfg = ResnetBlock2DConfig {
            out_channels: Some(out_channels),
            eps: config.norm_eps,
            groups: config.norm_num_groups,
            temb_channels: Some(temb_channels),
            ..Default::default()
        };
        let vs_resnets = &vs / "resnets";
        let resnets = (0..config.layers_per_block)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                ResnetBlock2D::new(&vs_resnets / i, in_channels, resnet_cfg)
            })
            .collect();

        let attentions = if block.use_cross_attn {
            // Automatic attention slicing when sliced_attention_size is 0.
            let sliced_attention_size = match config.sliced_attention_size {
                Some(0) => Some(block.attention_head_dim / 2),
                size => size,
            };
            let n_heads = block.attention_head_dim;
            let attn_cfg = SpatialTransformerConfig {
                depth: 1,
                num_groups: config.norm_num_groups,
                context_dim: Some(config.cross_attention_dim),
                sliced_attention_size,
                use_linear_projection: config.use_linear_projection,
            };
            let vs_attns = &vs / "attentions";
            (0..config.layers_per_block)
                .map(|i| {
                    SpatialTransformer::new(&vs_attns / i, out_channels, n_heads, out_channels / n_heads, attn_cfg)
                })
                .collect()
        } else {
            vec![]
        };

        let downsampler = add_downsample.then(|| {
            let conv_cfg = nn::ConvConfig { stride: 2, padding: config.downsample_padding, ..Default::default() };
            nn::conv2d(&vs / "downsamplers" / 0 / "conv", out_channels, out_channels, 3, conv_cfg)
        });
        Self { resnets, attentions, downsampler }
    }
}

impl DownLevel for DownBlock {
    fn layers(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Vec<Tensor> {
        let mut xs = xs.shallow_clone();
        let mut states = Vec::with_capacity(self.resnets.len());
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb));
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, Some(context));
            }
            states.push(xs.shallow_clone());
        }
        states
    }

    fn downsample(&self, xs: &Tensor) -> Option<Tensor> {
        self.downsampler.as_ref().map(|conv| xs.apply(conv))
    }
}

/// Runs the encoder from the `conv_in` output. Returns the hidden state
/// entering the mid block and the skip states, `conv_in` first. When given,
/// `features[i]` is added to the last layer output of level `i`.
pub(crate) fn down_path<L: DownLevel>(
    levels: &[L],
    xs: Tensor,
    temb: &Tensor,
    context: &Tensor,
    features: Option<&[Tensor]>,
) -> anyhow::Result<(Tensor, Vec<Tensor>)> {
    if let Some(features) = features {
        if features.len() != levels.len() {
            return Err(Error::AdapterLevels { expected: levels.len(), found: features.len() }.into());
        }
    }
    let mut skips = vec![xs.shallow_clone()];
    let mut xs = xs;
    for (i, level) in levels.iter().enumerate() {
        let mut states = level.layers(&xs, temb, context);
        if let (Some(features), Some(last)) = (features, states.last_mut()) {
            *last = &*last + &features[i];
        }
        if let Some(last) = states.last() {
            xs = last.shallow_clone();
        }
        skips.extend(states);
        if let Some(down) = level.downsample(&xs) {
            skips.push(down.shallow_clone());
            xs = down;
        }
    }
    Ok((xs, skips))
}

#[derive(Debug)]
enum UpBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

#[derive(Debug)]
pub struct AdapterUNet {
    conv_in: nn::Conv2D,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    config: UNet2DConditionModelConfig,
}

impl AdapterUNet {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, config: UNet2DConditionModelConfig) -> Self {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks[n_blocks - 1].out_channels;
        let bl_attention_head_dim = config.blocks[n_blocks - 1].attention_head_dim;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", in_channels, b_channels, 3, conv_cfg);

        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift, vs.device());
        let time_embedding = TimestepEmbedding::new(&vs / "time_embedding", b_channels, time_embed_dim);

        let vs_db = &vs / "down_blocks";
        let down_blocks = config
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let in_channels = if i > 0 { config.blocks[i - 1].out_channels } else { b_channels };
                DownBlock::new(&vs_db / i, in_channels, block, i < n_blocks - 1, time_embed_dim, &config)
            })
            .collect();

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: bl_attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            ..Default::default()
        };
        let mid_block =
            UNetMidBlock2DCrossAttn::new(&vs / "mid_block", bl_channels, Some(time_embed_dim), mid_cfg);

        let vs_ub = &vs / "up_blocks";
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let block = config.blocks[n_blocks - 1 - i];
                let sliced_attention_size = match config.sliced_attention_size {
                    Some(0) => Some(block.attention_head_dim / 2),
                    size => size,
                };
                let prev_out_channels =
                    if i > 0 { config.blocks[n_blocks - i].out_channels } else { bl_channels };
                let in_channels = {
                    let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                    config.blocks[index].out_channels
                };
                let ub_cfg = UpBlock2DConfig {
                    num_layers: config.layers_per_block + 1,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_upsample: i < n_blocks - 1,
                    ..Default::default()
                };
                if block.use_cross_attn {
                    let cfg = CrossAttnUpBlock2DConfig {
                        upblock: ub_cfg,
                        attn_num_head_channels: block.attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size,
                        use_linear_projection: config.use_linear_projection,
                    };
                    UpBlock::CrossAttn(CrossAttnUpBlock2D::new(
                        &vs_ub / i,
                        in_channels,
                        prev_out_channels,
                        block.out_channels,
                        Some(time_embed_dim),
                        cfg,
                    ))
                } else {
                    UpBlock::Basic(UpBlock2D::new(
                        &vs_ub / i,
                        in_channels,
                        prev_out_channels,
                        block.out_channels,
                        Some(time_embed_dim),
                        ub_cfg,
                    ))
                }
            })
            .collect();

        let group_cfg = nn::GroupNormConfig { eps: config.norm_eps, ..Default::default() };
        let conv_norm_out = nn::group_norm(&vs / "conv_norm_out", config.norm_num_groups, b_channels, group_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", b_channels, out_channels, 3, conv_cfg);
        Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config,
        }
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        features: Option<&[Tensor]>,
    ) -> anyhow::Result<Tensor> {
        let (bsize, _channels, height, width) = xs.size4()?;
        let n_blocks = self.config.blocks.len();
        let up_factor = 2i64.pow(n_blocks as u32 - 1);
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;
        let xs = if self.config.center_input_sample { xs * 2.0 - 1.0 } else { xs.shallow_clone() };

        let emb = (Tensor::ones([bsize], (xs.kind(), xs.device())) * timestep)
            .apply(&self.time_proj)
            .apply(&self.time_embedding);

        let xs = xs.apply(&self.conv_in);
        let (xs, mut down_block_res_xs) =
            down_path(&self.down_blocks, xs, &emb, encoder_hidden_states, features)?;

        let mut xs = self.mid_block.forward(&xs, Some(&emb), Some(encoder_hidden_states));

        let n_resnets = self.config.layers_per_block as usize + 1;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let res_xs = down_block_res_xs.split_off(down_block_res_xs.len() - n_resnets);
            let upsample_size = match down_block_res_xs.last() {
                Some(next) if i < n_blocks - 1 && forward_upsample_size => {
                    let (_, _, h, w) = next.size4()?;
                    Some((h, w))
                }
                _ => None,
            };
            xs = match up_block {
                UpBlock::Basic(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size),
                UpBlock::CrossAttn(b) => {
                    b.forward(&xs, &res_xs, Some(&emb), upsample_size, Some(encoder_hidden_states))
                }
            };
        }
        Ok(xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out))
    }
}
