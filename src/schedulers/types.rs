use tch::{Device, Kind, Tensor};

use crate::ldm::Denoiser;

/// Source latent and keep-mask for masked editing. Where `mask` is 1 the
/// sampler keeps re-noised `x0`, where it is 0 the content is regenerated.
#[derive(Debug, Clone, Copy)]
pub struct EditRegion<'a> {
    pub x0: &'a Tensor,
    pub mask: &'a Tensor,
}

pub struct SampleRequest<'a> {
    pub steps: usize,
    pub conditioning: &'a Tensor,
    pub unconditional_conditioning: Option<&'a Tensor>,
    pub guidance_scale: f64,
    /// `[batch, channels, height / f, width / f]`
    pub shape: [i64; 4],
    pub features_adapter: Option<&'a [Tensor]>,
    /// Fraction of the steps, counted from the noisiest one, that see the
    /// adapter features.
    pub cond_tau: f64,
    pub edit: Option<EditRegion<'a>>,
    /// Starting noise, drawn from N(0, 1) when absent.
    pub x_t: Option<Tensor>,
}

impl<'a> SampleRequest<'a> {
    pub(crate) fn device(&self) -> Device {
        self.conditioning.device()
    }

    pub(crate) fn take_initial_latent(&mut self) -> Tensor {
        match self.x_t.take() {
            Some(x_t) => x_t,
            None => Tensor::randn(self.shape, (Kind::Float, self.device())),
        }
    }

    /// Adapter features to use at step `index` of `total_steps`, where the
    /// index counts down from `total_steps - 1`.
    pub(crate) fn features_at(&self, index: usize, total_steps: usize) -> Option<&'a [Tensor]> {
        let cutoff = ((1.0 - self.cond_tau) * total_steps as f64) as usize;
        if index < cutoff {
            None
        } else {
            self.features_adapter
        }
    }
}

pub trait Sampler {
    fn name(&self) -> &'static str;

    /// Runs the full reverse process and returns the final latent.
    fn sample(&self, model: &dyn Denoiser, request: SampleRequest<'_>) -> anyhow::Result<Tensor>;
}
