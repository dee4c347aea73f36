use tch::{nn::Module, Device, Kind, Tensor};
use tokenizers::Tokenizer;

use diffusers::{models::vae::AutoEncoderKL, transformers::clip::ClipTextTransformer};

use crate::model_kind::ModelKind;

pub mod builder;
pub mod types;
pub mod unet;

pub use builder::LdmBuilder;
pub use types::{Denoiser, LatentModel};
pub use unet::AdapterUNet;

/// Token positions of the CLIP text encoder.
pub const MAX_POSITION_EMBEDDINGS: usize = 77;

pub(crate) struct PromptTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl PromptTokenizer {
    pub(crate) fn new(tokenizer: Tokenizer, model_kind: ModelKind) -> anyhow::Result<Self> {
        let vocab = tokenizer.get_vocab(true);
        let lookup = |token: &str| {
            vocab
                .get(token)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("token {token:?} is not in the vocabulary"))
        };
        let eos_id = lookup("<|endoftext|>")?;
        let pad_id = lookup(model_kind.pad_token())?;
        Ok(Self { tokenizer, pad_id, eos_id })
    }

    /// Token ids of `prompt`, truncated to the encoder length keeping the
    /// end-of-text token, then padded.
    pub(crate) fn encode(&self, prompt: &str) -> anyhow::Result<Vec<i64>> {
        let mut tokens = self.tokenizer.encode(prompt, true).map_err(anyhow::Error::msg)?.get_ids().to_vec();
        if tokens.len() > MAX_POSITION_EMBEDDINGS {
            tracing::warn!(tokens = tokens.len(), "prompt is too long and gets truncated");
            tokens.truncate(MAX_POSITION_EMBEDDINGS - 1);
            tokens.push(self.eos_id);
        }
        tokens.resize(MAX_POSITION_EMBEDDINGS, self.pad_id);
        Ok(tokens.into_iter().map(|t| t as i64).collect())
    }
}

/// Stable diffusion base model: CLIP text encoder, VAE and unet sharing one
/// device.
pub struct LatentDiffusion {
    tokenizer: PromptTokenizer,
    clip_model: ClipTextTransformer,
    vae_model: AutoEncoderKL,
    unet_model: AdapterUNet,
    scale_factor: f64,
    device: Device,
}

impl LatentDiffusion {
    pub(crate) fn new(
        tokenizer: PromptTokenizer,
        clip_model: ClipTextTransformer,
        vae_model: AutoEncoderKL,
        unet_model: AdapterUNet,
        scale_factor: f64,
        device: Device,
    ) -> Self {
        Self { tokenizer, clip_model, vae_model, unet_model, scale_factor, device }
    }
}

impl Denoiser for LatentDiffusion {
    fn apply_model(
        &self,
        x: &Tensor,
        timestep: usize,
        context: &Tensor,
        features_adapter: Option<&[Tensor]>,
    ) -> anyhow::Result<Tensor> {
        self.unet_model.forward(x, timestep as f64, context, features_adapter)
    }
}

impl LatentModel for LatentDiffusion {
    fn learned_conditioning(&self, prompt: &str) -> anyhow::Result<Tensor> {
        let tokens = self.tokenizer.encode(prompt)?;
        let tokens = Tensor::from_slice(&tokens).view((1, -1)).to(self.device);
        Ok(self.clip_model.forward(&tokens))
    }

    fn encode_first_stage(&self, image: &Tensor) -> anyhow::Result<Tensor> {
        let image = image.to_device(self.device).to_kind(Kind::Float);
        Ok(self.vae_model.encode(&image).sample() * self.scale_factor)
    }

    fn decode_first_stage(&self, latents: &Tensor) -> anyhow::Result<Tensor> {
        let latents = latents.to_kind(Kind::Float) / self.scale_factor;
        Ok(self.vae_model.decode(&latents))
    }

    fn device(&self) -> Device {
        self.device
    }
}
