use diffusers::{
    models::{unet_2d, vae},
    transformers::clip,
};
use serde::{Deserialize, Serialize};

/// The base latent diffusion model the adapter is paired with.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    SD1_5,
    SD2_1,
}

impl ModelKind {
    pub fn clip_config(&self) -> clip::Config {
        match self {
            ModelKind::SD1_5 => clip::Config::v1_5(),
            ModelKind::SD2_1 => clip::Config::v2_1(),
        }
    }

    // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/vae/config.json
    pub fn vae_config(&self) -> vae::AutoEncoderKLConfig {
        vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
        }
    }

    pub fn unet_config(&self, sliced_attention_size: Option<i64>) -> unet_2d::UNet2DConditionModelConfig {
        match self {
            // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/unet/config.json
            ModelKind::SD1_5 => unet_2d::UNet2DConditionModelConfig {
                cross_attention_dim: 768,
                sliced_attention_size,
                use_linear_projection: false,
                ..Default::default()
            },
            // https://huggingface.co/stabilityai/stable-diffusion-2-1/blob/main/unet/config.json
            ModelKind::SD2_1 => {
                let mut config = unet_2d::UNet2DConditionModelConfig {
                    cross_attention_dim: 1024,
                    sliced_attention_size,
                    use_linear_projection: true,
                    ..Default::default()
                };
                for (block, head_dim) in config.blocks.iter_mut().zip([5, 10, 20, 20]) {
                    block.attention_head_dim = head_dim;
                }
                config
            }
        }
    }

    /// Hub repository and file holding the CLIP tokenizer for this model.
    pub fn tokenizer_source(&self) -> (&'static str, &'static str) {
        match self {
            ModelKind::SD1_5 => ("openai/clip-vit-large-patch14", "tokenizer.json"),
            ModelKind::SD2_1 => ("stabilityai/stable-diffusion-2-1", "tokenizer/tokenizer.json"),
        }
    }

    /// Token used to pad prompts to the encoder length.
    pub fn pad_token(&self) -> &'static str {
        match self {
            ModelKind::SD1_5 => "<|endoftext|>",
            ModelKind::SD2_1 => "!",
        }
    }

    /// Down levels of the unet, one adapter feature map each.
    pub fn unet_levels(&self) -> usize {
        self.unet_config(None).blocks.len()
    }
}
