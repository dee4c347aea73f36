//! Orchestration shared by the depth and sketch-edit flows: prompt encoding,
//! adapter features, sampling and decoding.
use tch::{Device, Tensor};

use crate::{
    adapter::ConditionAdapter,
    condition::decoded_to_unit,
    ldm::LatentModel,
    schedulers::{types::SampleRequest, EditRegion, Sampler},
};

pub mod depth;
pub mod sketch_edit;

pub use depth::{DepthFlow, DepthInputs};
pub use sketch_edit::{SketchEditFlow, SketchEditInputs};

#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub steps: usize,
    pub n_samples: usize,
    pub guidance_scale: f64,
    pub cond_tau: f64,
    pub cond_weight: f64,
    pub seed: i64,
    pub latent_channels: i64,
    pub downsample_factor: i64,
    /// Pixel budget for resized conditions.
    pub max_resolution: u64,
    pub autocast: bool,
}

impl SamplingParams {
    pub fn latent_shape(&self, height: i64, width: i64) -> [i64; 4] {
        [1, self.latent_channels, height / self.downsample_factor, width / self.downsample_factor]
    }
}

pub struct PromptEmbeddings {
    pub cond: Tensor,
    /// Absent when guidance is disabled.
    pub uncond: Option<Tensor>,
}

/// Embeds the prompts. The negative prompt is only encoded when guidance is
/// active, i.e. the scale differs from 1.
pub fn encode_prompts<M: LatentModel + ?Sized>(
    model: &M,
    prompt: &str,
    neg_prompt: &str,
    guidance_scale: f64,
) -> anyhow::Result<PromptEmbeddings> {
    let cond = model.learned_conditioning(prompt)?;
    let uncond = if guidance_scale != 1.0 {
        Some(model.learned_conditioning(neg_prompt)?)
    } else {
        None
    };
    let (cond, uncond) = fix_cond_shapes(model, cond, uncond)?;
    Ok(PromptEmbeddings { cond, uncond })
}

/// Brings both embeddings to the same token length, extending the shorter
/// one with the trailing rows of the empty prompt embedding.
pub fn fix_cond_shapes<M: LatentModel + ?Sized>(
    model: &M,
    cond: Tensor,
    uncond: Option<Tensor>,
) -> anyhow::Result<(Tensor, Option<Tensor>)> {
    let Some(uncond) = uncond else { return Ok((cond, None)) };
    let (c_len, uc_len) = (cond.size()[1], uncond.size()[1]);
    if c_len == uc_len {
        return Ok((cond, Some(uncond)));
    }
    let diff = (c_len - uc_len).abs();
    let empty = model.learned_conditioning("")?;
    let n = empty.size()[1];
    let tail = empty.narrow(1, n - diff, diff).to_device(cond.device());
    if c_len < uc_len {
        Ok((Tensor::cat(&[cond, tail], 1), Some(uncond)))
    } else {
        Ok((cond, Some(Tensor::cat(&[uncond, tail], 1))))
    }
}

pub struct Pipeline<'a, M: LatentModel> {
    pub model: &'a M,
    pub adapter: &'a dyn ConditionAdapter,
    pub sampler: &'a dyn Sampler,
    pub params: &'a SamplingParams,
}

impl<'a, M: LatentModel> Pipeline<'a, M> {
    pub fn device(&self) -> Device {
        self.model.device()
    }

    fn with_autocast<T>(&self, f: impl FnOnce() -> T) -> T {
        let enabled = self.params.autocast && self.device().is_cuda();
        tch::autocast(enabled, f)
    }

    /// Adapter features of `condition`, scaled by the conditioning weight.
    pub fn adapter_features(&self, condition: &Tensor) -> anyhow::Result<Vec<Tensor>> {
        let features = self.with_autocast(|| self.adapter.features(condition))?;
        let weight = self.params.cond_weight;
        Ok(features.into_iter().map(|f| f * weight).collect())
    }

    /// Runs the sampler and returns the final latent.
    pub fn sample(
        &self,
        prompts: &PromptEmbeddings,
        features: &[Tensor],
        shape: [i64; 4],
        edit: Option<EditRegion<'_>>,
    ) -> anyhow::Result<Tensor> {
        let request = SampleRequest {
            steps: self.params.steps,
            conditioning: &prompts.cond,
            unconditional_conditioning: prompts.uncond.as_ref(),
            guidance_scale: self.params.guidance_scale,
            shape,
            features_adapter: Some(features),
            cond_tau: self.params.cond_tau,
            edit,
            x_t: None,
        };
        tracing::info!(sampler = self.sampler.name(), shape = ?shape, "sampling");
        self.with_autocast(|| self.sampler.sample(self.model, request))
    }

    /// Decodes a latent into a `(1, 3, H, W)` image in [0, 1].
    pub fn decode(&self, latent: &Tensor) -> anyhow::Result<Tensor> {
        let image = self.with_autocast(|| self.model.decode_first_stage(latent))?;
        Ok(decoded_to_unit(&image))
    }
}
