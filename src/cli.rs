//! Command line arguments of the `depth` and `sketch-edit` binaries.
use std::path::PathBuf;

use clap::{Args, Parser};
use tch::Device;

use crate::{
    condition::ConditionSource,
    config::ModelConfig,
    pipeline::{DepthInputs, SamplingParams, SketchEditInputs},
    schedulers::SamplerKind,
    utils::get_device,
};

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Sampler, `plms` or `ddim`.
    #[arg(long, default_value = "plms")]
    pub sampler: String,

    /// Directory holding the base model in diffusers layout.
    #[arg(long, default_value = "models/stable-diffusion-v1-5")]
    pub ckpt: PathBuf,

    /// Replacement VAE weights.
    #[arg(long)]
    pub ckpt_vae: Option<PathBuf>,

    /// Model config describing the base model.
    #[arg(long, default_value = "configs/sd-v1-inference.toml")]
    pub config: PathBuf,

    /// Pixel budget (height * width) of resized inputs, defaults to H * W.
    #[arg(long)]
    pub max_resolution: Option<u64>,

    /// Image height, in pixel space.
    #[arg(short = 'H', long, default_value_t = 512)]
    pub height: u64,

    /// Image width, in pixel space.
    #[arg(short = 'W', long, default_value_t = 512)]
    pub width: u64,

    /// Latent channels.
    #[arg(short = 'C', long, default_value_t = 4)]
    pub latent_channels: i64,

    /// Downsampling factor of the autoencoder.
    #[arg(short = 'f', long, default_value_t = 8)]
    pub downsample_factor: i64,

    /// Number of sampling steps.
    #[arg(long, default_value_t = 50)]
    pub steps: usize,

    /// Number of images generated, one per iteration.
    #[arg(long, default_value_t = 4)]
    pub n_samples: usize,

    /// Unconditional guidance scale: eps = eps(x, empty) + scale * (eps(x, cond) - eps(x, empty)).
    #[arg(long, default_value_t = 7.5)]
    pub scale: f64,

    /// Fraction of the sampling steps, starting from the noisiest, that use
    /// the adapter features.
    #[arg(long, default_value_t = 1.0)]
    pub cond_tau: f64,

    /// Multiplier of the adapter features. Larger values follow the condition
    /// more closely at some cost in quality.
    #[arg(long, default_value_t = 1.0)]
    pub cond_weight: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: i64,

    /// Run on the cpu even when an accelerator is available.
    #[arg(long)]
    pub cpu: bool,

    /// Disable mixed precision on cuda.
    #[arg(long)]
    pub no_autocast: bool,

    /// Write a chrome trace of the run.
    #[arg(long)]
    pub tracing: bool,
}

/// Options shared by both flows once names have been validated.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub sampler: SamplerKind,
    pub params: SamplingParams,
    pub device: Device,
    pub ckpt: PathBuf,
    pub ckpt_vae: Option<PathBuf>,
    pub config: PathBuf,
}

impl RunOptions {
    pub fn model_config(&self) -> anyhow::Result<ModelConfig> {
        ModelConfig::from_file(&self.config)
    }
}

impl CommonArgs {
    pub fn resolve(&self) -> anyhow::Result<RunOptions> {
        let sampler: SamplerKind = self.sampler.parse()?;
        anyhow::ensure!(
            self.downsample_factor > 0,
            "--downsample-factor must be positive, got {}",
            self.downsample_factor
        );
        anyhow::ensure!(self.latent_channels > 0, "--latent-channels must be positive, got {}", self.latent_channels);
        let params = SamplingParams {
            steps: self.steps,
            n_samples: self.n_samples,
            guidance_scale: self.scale,
            cond_tau: self.cond_tau,
            cond_weight: self.cond_weight,
            seed: self.seed,
            latent_channels: self.latent_channels,
            downsample_factor: self.downsample_factor,
            max_resolution: self.max_resolution.unwrap_or(self.height * self.width),
            autocast: !self.no_autocast,
        };
        Ok(RunOptions {
            sampler,
            params,
            device: get_device(self.cpu),
            ckpt: self.ckpt.clone(),
            ckpt_vae: self.ckpt_vae.clone(),
            config: self.config.clone(),
        })
    }
}

/// Depth guided generation.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct DepthArgs {
    #[arg(long, default_value = "outputs/test-depth")]
    pub outdir: PathBuf,

    #[arg(long, default_value = "A car with flying wings")]
    pub prompt: String,

    #[arg(
        long,
        default_value = "longbody, lowres, bad anatomy, bad hands, missing fingers, extra digit, fewer digits, cropped, worst quality, low quality"
    )]
    pub neg_prompt: String,

    /// Depth map, or a photo with `--type-in image`.
    #[arg(long, default_value = "inputs/depth/car.png")]
    pub path_cond: PathBuf,

    /// `depth` or `image`.
    #[arg(long, default_value = "depth")]
    pub type_in: String,

    #[arg(long, default_value = "models/t2iadapter_depth_sd14v1.safetensors")]
    pub ckpt_ad: PathBuf,

    /// TorchScript MiDaS model, used with `--type-in image`.
    #[arg(long, default_value = "models/dpt_hybrid-midas.pt")]
    pub depth_model: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl DepthArgs {
    /// Validates every name before anything gets loaded.
    pub fn resolve(&self) -> anyhow::Result<(RunOptions, DepthInputs)> {
        let source: ConditionSource = self.type_in.parse()?;
        let options = self.common.resolve()?;
        let inputs = DepthInputs {
            path_cond: self.path_cond.clone(),
            source,
            prompt: self.prompt.clone(),
            neg_prompt: self.neg_prompt.clone(),
        };
        Ok((options, inputs))
    }
}

/// Sketch guided editing of a masked region.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct SketchEditArgs {
    #[arg(long, default_value = "outputs/test-sketch-edit")]
    pub outdir: PathBuf,

    #[arg(long, default_value = "A white cat")]
    pub prompt: String,

    #[arg(
        long,
        default_value = "ugly, tiling, poorly drawn hands, poorly drawn feet, poorly drawn face, out of frame, extra limbs, disfigured, deformed, body out of frame, bad anatomy, watermark, signature, cut off, low contrast, underexposed, overexposed, bad art, beginner, amateur, distorted face"
    )]
    pub neg_prompt: String,

    /// Edge sketch, white strokes on black.
    #[arg(long, default_value = "inputs/edit_cat/edge_2.png")]
    pub path_cond: PathBuf,

    /// Image to edit.
    #[arg(long, default_value = "inputs/edit_cat/im.png")]
    pub path_x0: PathBuf,

    /// White where the image gets regenerated.
    #[arg(long, default_value = "inputs/edit_cat/mask.png")]
    pub path_mask: PathBuf,

    #[arg(long, default_value = "models/t2iadapter_sketch_sd14v1.safetensors")]
    pub ckpt_ad: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl SketchEditArgs {
    pub fn resolve(&self) -> anyhow::Result<(RunOptions, SketchEditInputs)> {
        let options = self.common.resolve()?;
        let inputs = SketchEditInputs {
            path_cond: self.path_cond.clone(),
            path_x0: self.path_x0.clone(),
            path_mask: self.path_mask.clone(),
            prompt: self.prompt.clone(),
            neg_prompt: self.neg_prompt.clone(),
        };
        Ok((options, inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_depth_defaults() {
        let args = DepthArgs::try_parse_from(["depth"]).unwrap();
        let (options, inputs) = args.resolve().unwrap();
        assert_eq!(options.sampler, SamplerKind::Plms);
        assert_eq!(options.params.max_resolution, 512 * 512);
        assert_eq!(options.params.steps, 50);
        assert_eq!(options.params.n_samples, 4);
        assert_eq!(options.params.guidance_scale, 7.5);
        assert!(options.params.autocast);
        assert_eq!(inputs.source, ConditionSource::Depth);
    }

    #[test]
    fn test_short_flags_and_budget() {
        let args = SketchEditArgs::try_parse_from([
            "sketch-edit", "-H", "256", "-W", "768", "-C", "4", "-f", "8", "--sampler", "ddim",
            "--no-autocast", "--cpu",
        ])
        .unwrap();
        let (options, _) = args.resolve().unwrap();
        assert_eq!(options.sampler, SamplerKind::Ddim);
        assert_eq!(options.params.max_resolution, 256 * 768);
        assert!(!options.params.autocast);
        assert_eq!(options.device, Device::Cpu);

        let args = SketchEditArgs::try_parse_from(["sketch-edit", "--max-resolution", "1000"]).unwrap();
        assert_eq!(args.resolve().unwrap().0.params.max_resolution, 1000);
    }

    #[test]
    fn test_unknown_names_fail_at_resolution() {
        let args = DepthArgs::try_parse_from(["depth", "--sampler", "k_euler"]).unwrap();
        let err = args.resolve().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnsupportedSampler(_))));

        let args = DepthArgs::try_parse_from(["depth", "--type-in", "canny"]).unwrap();
        let err = args.resolve().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnsupportedCondition(_))));
    }

    #[test]
    fn test_non_positive_latent_geometry_is_rejected() {
        for flags in [["-f", "0"], ["-C", "0"]] {
            let args = SketchEditArgs::try_parse_from(["sketch-edit", flags[0], flags[1]]).unwrap();
            let err = args.resolve().unwrap_err();
            assert!(err.to_string().contains("must be positive"), "{err}");
        }
    }
}
