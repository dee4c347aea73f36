//! # Pseudo Linear Multi-Step sampling
//!
//! Pseudo Numerical Methods for Diffusion Models on Manifolds, L. Liu et al, 2022.
//! https://arxiv.org/abs/2202.09778
//!
//! Runs on the DDIM timestep grid. The first step uses a second order
//! correction, later steps an Adams-Bashforth combination of up to four
//! noise estimates.
use std::collections::VecDeque;

use tch::Tensor;

use super::{blend_edit, guided_noise, types::SampleRequest, NoiseSchedule, Sampler};
use crate::ldm::Denoiser;

const MAX_HISTORY: usize = 3;

#[derive(Debug, Clone)]
pub struct PlmsSampler {
    schedule: NoiseSchedule,
}

impl PlmsSampler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self { schedule }
    }
}

/// Combines the current noise estimate with previous ones, most recent last.
fn multistep_eps(e_t: &Tensor, old_eps: &VecDeque<Tensor>) -> Tensor {
    let n = old_eps.len();
    match n {
        1 => (e_t * 3.0 - &old_eps[0]) / 2.0,
        2 => (e_t * 23.0 - &old_eps[1] * 16.0 + &old_eps[0] * 5.0) / 12.0,
        _ => {
            (e_t * 55.0 - &old_eps[n - 1] * 59.0 + &old_eps[n - 2] * 37.0 - &old_eps[n - 3] * 9.0)
                / 24.0
        }
    }
}

impl Sampler for PlmsSampler {
    fn name(&self) -> &'static str {
        "plms"
    }

    fn sample(&self, model: &dyn Denoiser, mut request: SampleRequest<'_>) -> anyhow::Result<Tensor> {
        let ddim = self.schedule.ddim_schedule(request.steps)?;
        let total_steps = ddim.len();
        tracing::info!(total_steps, "running PLMS sampling");

        let mut img = request.take_initial_latent();
        let mut old_eps: VecDeque<Tensor> = VecDeque::with_capacity(MAX_HISTORY);
        for i in 0..total_steps {
            let index = total_steps - i - 1;
            let timestep = ddim.timesteps[index];
            tracing::debug!(step = i + 1, timestep, "plms step");

            if let Some(edit) = &request.edit {
                img = blend_edit(&self.schedule, &img, edit, timestep);
            }
            let features = request.features_at(index, total_steps);
            let e_t = guided_noise(&self.schedule, model, &img, timestep, &request, features)?;

            let e_t_prime = if old_eps.is_empty() {
                // No history yet: average with the estimate one step ahead.
                let x_prev = ddim.step(&img, &e_t, index);
                let next_timestep = ddim.timesteps[index.saturating_sub(1)];
                let e_t_next = guided_noise(&self.schedule, model, &x_prev, next_timestep, &request, features)?;
                (&e_t + e_t_next) / 2.0
            } else {
                multistep_eps(&e_t, &old_eps)
            };

            img = ddim.step(&img, &e_t_prime, index);
            old_eps.push_back(e_t);
            if old_eps.len() > MAX_HISTORY {
                old_eps.pop_front();
            }
        }
        Ok(img)
    }
}
