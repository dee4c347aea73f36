//! # Denoising Diffusion Implicit Models
//!
//! Deterministic DDIM sampling (eta = 0) as described in:
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use tch::Tensor;

use super::{blend_edit, guided_noise, types::SampleRequest, NoiseSchedule, Sampler};
use crate::ldm::Denoiser;

#[derive(Debug, Clone)]
pub struct DdimSampler {
    schedule: NoiseSchedule,
}

impl DdimSampler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self { schedule }
    }
}

impl Sampler for DdimSampler {
    fn name(&self) -> &'static str {
        "ddim"
    }

    fn sample(&self, model: &dyn Denoiser, mut request: SampleRequest<'_>) -> anyhow::Result<Tensor> {
        let ddim = self.schedule.ddim_schedule(request.steps)?;
        let total_steps = ddim.len();
        tracing::info!(total_steps, "running DDIM sampling");

        let mut img = request.take_initial_latent();
        for i in 0..total_steps {
            let index = total_steps - i - 1;
            let timestep = ddim.timesteps[index];
            tracing::debug!(step = i + 1, timestep, "ddim step");

            if let Some(edit) = &request.edit {
                img = blend_edit(&self.schedule, &img, edit, timestep);
            }
            let features = request.features_at(index, total_steps);
            let e_t = guided_noise(&self.schedule, model, &img, timestep, &request, features)?;
            img = ddim.step(&img, &e_t, index);
        }
        Ok(img)
    }
}
