use tch::{Device, Tensor};

/// Noise prediction network as seen by the samplers.
pub trait Denoiser {
    /// Predicts the noise in `x` at training timestep `timestep`. Adapter
    /// features, when given, are injected at each down level of the network.
    fn apply_model(
        &self,
        x: &Tensor,
        timestep: usize,
        context: &Tensor,
        features_adapter: Option<&[Tensor]>,
    ) -> anyhow::Result<Tensor>;
}

/// The base latent diffusion model: text conditioning, first stage
/// autoencoder and the denoiser.
pub trait LatentModel: Denoiser {
    /// Embeds a single prompt, `(1, tokens, dim)`.
    fn learned_conditioning(&self, prompt: &str) -> anyhow::Result<Tensor>;

    /// Encodes an image in [-1, 1] into a scaled latent sample.
    fn encode_first_stage(&self, image: &Tensor) -> anyhow::Result<Tensor>;

    /// Decodes a scaled latent back into pixel space, roughly [-1, 1].
    fn decode_first_stage(&self, latents: &Tensor) -> anyhow::Result<Tensor>;

    fn device(&self) -> Device;
}
