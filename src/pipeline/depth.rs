use std::path::PathBuf;

use anyhow::anyhow;
use tch::Tensor;

use super::{encode_prompts, Pipeline};
use crate::{
    condition::{image_to_tensor, load_rgb, resize_to_budget, tensor_to_image, ConditionSource},
    depth::{depth_condition, DepthEstimator},
    ldm::LatentModel,
    output::OutputWriter,
};

#[derive(Debug, Clone)]
pub struct DepthInputs {
    pub path_cond: PathBuf,
    pub source: ConditionSource,
    pub prompt: String,
    pub neg_prompt: String,
}

/// Generation guided by a depth map, given directly or estimated from a photo.
pub struct DepthFlow<'a, M: LatentModel> {
    pub pipeline: Pipeline<'a, M>,
    /// Required for [`ConditionSource::Image`].
    pub estimator: Option<&'a dyn DepthEstimator>,
}

impl<'a, M: LatentModel> DepthFlow<'a, M> {
    /// `(1, 3, H, W)` depth condition in [0, 1] on the model device.
    pub fn prepare_condition(&self, inputs: &DepthInputs) -> anyhow::Result<Tensor> {
        let image = load_rgb(&inputs.path_cond)?;
        let image = resize_to_budget(&image, self.pipeline.params.max_resolution);
        let image = image_to_tensor(&image, self.pipeline.device());
        match inputs.source {
            ConditionSource::Depth => Ok(image),
            ConditionSource::Image => {
                let estimator = self
                    .estimator
                    .ok_or_else(|| anyhow!("a depth estimator is needed for photo inputs"))?;
                depth_condition(estimator, &image)
            }
        }
    }

    pub fn run(&self, inputs: &DepthInputs, writer: &mut OutputWriter) -> anyhow::Result<()> {
        let _no_grad_guard = tch::no_grad_guard();
        let params = self.pipeline.params;
        tch::manual_seed(params.seed);
        for idx in 0..params.n_samples {
            tracing::info!(sample = idx + 1, n_samples = params.n_samples, "generating");
            let depth = self.prepare_condition(inputs)?;
            let prompts = encode_prompts(
                self.pipeline.model,
                &inputs.prompt,
                &inputs.neg_prompt,
                params.guidance_scale,
            )?;
            writer.write_condition("depth", &tensor_to_image(&depth, true)?)?;

            let (height, width) = (depth.size()[2], depth.size()[3]);
            let features = self.pipeline.adapter_features(&depth)?;
            let shape = params.latent_shape(height, width);
            let latent = self.pipeline.sample(&prompts, &features, shape, None)?;
            let image = self.pipeline.decode(&latent)?;
            writer.write_result(&tensor_to_image(&image, false)?)?;
        }
        Ok(())
    }
}
