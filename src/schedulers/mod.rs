use std::str::FromStr;

use tch::Tensor;

use self::{ddim::DdimSampler, plms::PlmsSampler, types::SampleRequest};
use crate::{error::Error, ldm::Denoiser};
use serde::{Serialize, Deserialize};

pub mod ddim;
pub mod plms;
pub mod types;

pub use types::{EditRegion, Sampler};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// What the denoiser output stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionType {
    /// The added noise.
    Epsilon,
    /// `sqrt(a) * eps - sqrt(1 - a) * x0`, e.g. the 768px SD 2.x models.
    VPrediction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub beta_schedule: BetaSchedule,
    pub beta_start: f64,
    pub beta_end: f64,
    pub train_timesteps: usize,
    pub prediction_type: PredictionType,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            beta_schedule: BetaSchedule::ScaledLinear,
            beta_start: 0.00085,
            beta_end: 0.012,
            train_timesteps: 1000,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |time_step: f64| {
        f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

fn linspace(start: f64, end: f64, n: usize) -> impl Iterator<Item = f64> {
    let step = if n > 1 { (end - start) / (n - 1) as f64 } else { 0.0 };
    (0..n).map(move |i| start + step * i as f64)
}

/// Cumulative products of `1 - beta` over the training timesteps.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
}

impl NoiseSchedule {
    pub fn new(config: &ScheduleConfig) -> Self {
        let n = config.train_timesteps;
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n).collect(),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n).map(|b| b * b).collect()
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
        };
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();
        Self { alphas_cumprod, prediction_type: config.prediction_type }
    }

    pub fn train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// Uniformly strided sampling schedule: stride `T / steps`, timesteps
    /// shifted by one. Integer division can yield a few more steps than
    /// requested, e.g. 31 for 30.
    pub fn ddim_schedule(&self, steps: usize) -> anyhow::Result<DdimSchedule> {
        let train_timesteps = self.train_timesteps();
        let max = train_timesteps / 2;
        if steps == 0 || steps > max {
            return Err(Error::InvalidSteps { steps, max, train_timesteps }.into());
        }
        let stride = train_timesteps / steps;
        let timesteps: Vec<usize> = (0..train_timesteps).step_by(stride).map(|t| t + 1).collect();
        let alphas: Vec<f64> = timesteps.iter().map(|&t| self.alpha_cumprod(t)).collect();
        let alphas_prev = std::iter::once(self.alpha_cumprod(0))
            .chain(alphas[..alphas.len() - 1].iter().copied())
            .collect();
        Ok(DdimSchedule { timesteps, alphas, alphas_prev })
    }

    /// Noise estimate at `timestep` from a raw model output for `x`.
    pub fn noise_from_output(&self, output: Tensor, x: &Tensor, timestep: usize) -> Tensor {
        match self.prediction_type {
            PredictionType::Epsilon => output,
            PredictionType::VPrediction => {
                let alpha = self.alpha_cumprod(timestep);
                output * alpha.sqrt() + x * (1.0 - alpha).sqrt()
            }
        }
    }

    /// Diffuses `x0` to timestep `t` with fresh gaussian noise.
    pub fn q_sample(&self, x0: &Tensor, timestep: usize) -> Tensor {
        let alpha = self.alpha_cumprod(timestep);
        x0 * alpha.sqrt() + x0.randn_like() * (1.0 - alpha).sqrt()
    }
}

/// Coefficients of a deterministic (eta = 0) DDIM schedule.
#[derive(Debug, Clone)]
pub struct DdimSchedule {
    pub timesteps: Vec<usize>,
    pub alphas: Vec<f64>,
    pub alphas_prev: Vec<f64>,
}

impl DdimSchedule {
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    /// Moves `x` from step `index` to the previous step given a noise estimate.
    pub fn step(&self, x: &Tensor, e_t: &Tensor, index: usize) -> Tensor {
        let a_t = self.alphas[index];
        let a_prev = self.alphas_prev[index];
        let pred_x0 = (x - e_t * (1.0 - a_t).sqrt()) / a_t.sqrt();
        let dir_xt = e_t * (1.0 - a_prev).sqrt();
        pred_x0 * a_prev.sqrt() + dir_xt
    }
}

/// Noise estimate with classifier free guidance. A single unguided pass is
/// used when there is no unconditional embedding or the scale is 1.
pub(crate) fn guided_noise(
    schedule: &NoiseSchedule,
    model: &dyn Denoiser,
    x: &Tensor,
    timestep: usize,
    request: &SampleRequest<'_>,
    features: Option<&[Tensor]>,
) -> anyhow::Result<Tensor> {
    let output = match request.unconditional_conditioning {
        Some(uc) if request.guidance_scale != 1.0 => {
            let x_in = Tensor::cat(&[x, x], 0);
            let c_in = Tensor::cat(&[uc, request.conditioning], 0);
            let model_output = model.apply_model(&x_in, timestep, &c_in, features)?;
            let model_output = model_output.chunk(2, 0);
            let (out_uncond, out_cond) = (&model_output[0], &model_output[1]);
            out_uncond + (out_cond - out_uncond) * request.guidance_scale
        }
        _ => model.apply_model(x, timestep, request.conditioning, features)?,
    };
    Ok(schedule.noise_from_output(output, x, timestep))
}

/// Replaces the kept region of `img` with `x0` diffused to `timestep`.
pub(crate) fn blend_edit(
    schedule: &NoiseSchedule,
    img: &Tensor,
    edit: &EditRegion<'_>,
    timestep: usize,
) -> Tensor {
    let img_orig = schedule.q_sample(edit.x0, timestep);
    let regenerate = edit.mask.ones_like() - edit.mask;
    img_orig * edit.mask + img * regenerate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Plms,
    Ddim,
}

impl FromStr for SamplerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plms" => Ok(SamplerKind::Plms),
            "ddim" => Ok(SamplerKind::Ddim),
            other => Err(Error::UnsupportedSampler(other.to_string())),
        }
    }
}

impl SamplerKind {
    pub fn build(&self, schedule: NoiseSchedule) -> Box<dyn Sampler> {
        match &self {
            SamplerKind::Plms => Box::new(PlmsSampler::new(schedule)),
            SamplerKind::Ddim => Box::new(DdimSampler::new(schedule)),
        }
    }
}
