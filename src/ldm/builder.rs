use std::path::{Path, PathBuf};

use diffusers::{models::vae, transformers::clip};
use tch::{nn, Device};
use tokenizers::Tokenizer;

use super::{AdapterUNet, LatentDiffusion, PromptTokenizer};
use crate::{config::ModelConfig, utils::require_file};

/// Assembles a [`LatentDiffusion`] from a diffusers layout directory:
///
/// ```text
/// tokenizer/tokenizer.json                  (optional, fetched from the hub)
/// text_encoder/model.safetensors
/// vae/diffusion_pytorch_model.safetensors
/// unet/diffusion_pytorch_model.safetensors
/// ```
pub struct LdmBuilder {
    config: ModelConfig,
    device: Device,
    vae_override: Option<PathBuf>,
}

impl LdmBuilder {
    pub fn new(config: ModelConfig, device: Device) -> Self {
        Self { config, device, vae_override: None }
    }

    /// Use the VAE weights from `path` instead of the repo ones.
    pub fn with_vae<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.vae_override = path.map(|p| p.as_ref().to_path_buf());
        self
    }

    fn build_clip_model(&self, model_path: &Path) -> anyhow::Result<clip::ClipTextTransformer> {
        let mut vs = nn::VarStore::new(self.device);
        let text_model = clip::ClipTextTransformer::new(vs.root(), &self.config.model_kind.clip_config());
        vs.load(model_path)?;
        Ok(text_model)
    }

    fn build_vae_model(&self, model_path: &Path) -> anyhow::Result<vae::AutoEncoderKL> {
        let mut vs_ae = nn::VarStore::new(self.device);
        let autoencoder = vae::AutoEncoderKL::new(vs_ae.root(), 3, 3, self.config.model_kind.vae_config());
        vs_ae.load(model_path)?;
        Ok(autoencoder)
    }

    fn build_unet_model(&self, model_path: &Path) -> anyhow::Result<AdapterUNet> {
        let mut vs_unet = nn::VarStore::new(self.device);
        let unet_config = self.config.model_kind.unet_config(self.config.sliced_attention_size);
        let unet = AdapterUNet::new(vs_unet.root(), 4, 4, unet_config);
        vs_unet.load(model_path)?;
        Ok(unet)
    }

    fn build_tokenizer(&self, repo: &Path) -> anyhow::Result<PromptTokenizer> {
        let local = repo.join("tokenizer").join("tokenizer.json");
        let tokenizer_file = if local.is_file() {
            local
        } else {
            let (hub_repo, hub_file) = self.config.model_kind.tokenizer_source();
            tracing::info!(repo = hub_repo, file = hub_file, "fetching tokenizer from the hub");
            hf_hub::api::sync::Api::new()?.model(hub_repo.to_string()).get(hub_file)?
        };
        let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(anyhow::Error::msg)?;
        PromptTokenizer::new(tokenizer, self.config.model_kind)
    }

    pub fn from_repo<P: AsRef<Path>>(&self, repo: P) -> anyhow::Result<LatentDiffusion> {
        let repo = repo.as_ref();
        let clip_path = require_file(repo.join("text_encoder").join("model.safetensors"))?;
        let vae_path = match &self.vae_override {
            Some(path) => require_file(path)?,
            None => require_file(repo.join("vae").join("diffusion_pytorch_model.safetensors"))?,
        };
        let unet_path = require_file(repo.join("unet").join("diffusion_pytorch_model.safetensors"))?;

        let tokenizer = self.build_tokenizer(repo)?;
        tracing::info!(path = %clip_path.display(), "building the clip transformer");
        let clip_model = self.build_clip_model(&clip_path)?;
        tracing::info!(path = %vae_path.display(), "building the autoencoder");
        let vae_model = self.build_vae_model(&vae_path)?;
        tracing::info!(path = %unet_path.display(), "building the unet");
        let unet_model = self.build_unet_model(&unet_path)?;

        Ok(LatentDiffusion::new(
            tokenizer,
            clip_model,
            vae_model,
            unet_model,
            self.config.scale_factor,
            self.device,
        ))
    }
}
