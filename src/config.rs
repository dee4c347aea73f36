use std::fs;

use crate::{
    model_kind::ModelKind,
    schedulers::{NoiseSchedule, ScheduleConfig},
};
use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_scale_factor() -> f64 {
    0.18215
}

/// Describes how to construct the base model, read from the `--config` toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_kind: ModelKind,
    /// Multiplier between VAE posterior samples and diffusion latents.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub sliced_attention_size: Option<i64>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl ModelConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::read_to_string(path)
            .with_context(|| format!("error reading model config {:?}", path.to_string_lossy()))?;
        let cfg: ModelConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn noise_schedule(&self) -> NoiseSchedule {
        NoiseSchedule::new(&self.schedule)
    }
}
