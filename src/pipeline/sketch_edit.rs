use std::path::PathBuf;

use tch::Tensor;

use super::{encode_prompts, Pipeline};
use crate::{
    condition::{binarize_edges, image_to_tensor, load_mask, load_rgb, resize_to_budget, tensor_to_image},
    error::Error,
    ldm::LatentModel,
    output::OutputWriter,
    schedulers::EditRegion,
};

#[derive(Debug, Clone)]
pub struct SketchEditInputs {
    /// Edge sketch, white strokes on black.
    pub path_cond: PathBuf,
    /// Source image to edit.
    pub path_x0: PathBuf,
    /// White where the source gets regenerated.
    pub path_mask: PathBuf,
    pub prompt: String,
    pub neg_prompt: String,
}

/// Prepared inputs of one edit iteration.
pub struct EditConditions {
    /// `(1, 1, H, W)` binary edge map.
    pub edge: Tensor,
    /// Source latent.
    pub x0: Tensor,
    /// `(1, 1, H / f, W / f)` keep-mask.
    pub mask: Tensor,
    pub shape: [i64; 4],
}

/// Regenerates the masked region of a source image following a sketch.
pub struct SketchEditFlow<'a, M: LatentModel> {
    pub pipeline: Pipeline<'a, M>,
}

impl<'a, M: LatentModel> SketchEditFlow<'a, M> {
    pub fn prepare_conditions(&self, inputs: &SketchEditInputs) -> anyhow::Result<EditConditions> {
        let params = self.pipeline.params;
        let device = self.pipeline.device();

        let edge = resize_to_budget(&load_rgb(&inputs.path_cond)?, params.max_resolution);
        let (width, height) = edge.dimensions();
        let edge = binarize_edges(&edge, device);
        let shape = params.latent_shape(height as i64, width as i64);

        let source = resize_to_budget(&load_rgb(&inputs.path_x0)?, params.max_resolution);
        let source = image_to_tensor(&source, device) * 2. - 1.;
        let x0 = self.pipeline.model.encode_first_stage(&source)?;
        if x0.size() != shape {
            return Err(Error::LatentShapeMismatch { expected: shape.to_vec(), found: x0.size() }.into());
        }

        let mask = load_mask(&inputs.path_mask, shape[3] as u32, shape[2] as u32, device)?;
        Ok(EditConditions { edge, x0, mask, shape })
    }

    pub fn run(&self, inputs: &SketchEditInputs, writer: &mut OutputWriter) -> anyhow::Result<()> {
        let _no_grad_guard = tch::no_grad_guard();
        let params = self.pipeline.params;
        tch::manual_seed(params.seed);
        for idx in 0..params.n_samples {
            tracing::info!(sample = idx + 1, n_samples = params.n_samples, "editing");
            let conditions = self.prepare_conditions(inputs)?;
            let prompts = encode_prompts(
                self.pipeline.model,
                &inputs.prompt,
                &inputs.neg_prompt,
                params.guidance_scale,
            )?;
            writer.write_condition("edge", &tensor_to_image(&conditions.edge, true)?)?;

            let features = self.pipeline.adapter_features(&conditions.edge)?;
            let edit = EditRegion { x0: &conditions.x0, mask: &conditions.mask };
            let latent = self.pipeline.sample(&prompts, &features, conditions.shape, Some(edit))?;
            let image = self.pipeline.decode(&latent)?;
            writer.write_result(&tensor_to_image(&image, false)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::pipeline::tests::{params, plms, MockAdapter, MockModel};

    fn write(path: &Path, width: u32, height: u32, f: impl Fn(u32, u32) -> Rgb<u8>) {
        RgbImage::from_fn(width, height, f).save(path).unwrap();
    }

    fn inputs(dir: &Path, x0_size: (u32, u32)) -> SketchEditInputs {
        let inputs = SketchEditInputs {
            path_cond: dir.join("edge.png"),
            path_x0: dir.join("im.png"),
            path_mask: dir.join("mask.png"),
            prompt: "a white cat".to_string(),
            neg_prompt: "ugly".to_string(),
        };
        write(&inputs.path_cond, 128, 64, |x, _| if x % 16 == 0 { Rgb([255; 3]) } else { Rgb([0; 3]) });
        write(&inputs.path_x0, x0_size.0, x0_size.1, |x, y| Rgb([x as u8, y as u8, 30]));
        write(&inputs.path_mask, 128, 64, |x, _| if x < 64 { Rgb([255; 3]) } else { Rgb([0; 3]) });
        inputs
    }

    #[test]
    fn test_prepares_edge_latent_and_mask() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = inputs(dir.path(), (128, 64));
        let model = MockModel::default();
        let sampler = plms();
        let params = params(7.5);
        let flow = SketchEditFlow {
            pipeline: Pipeline { model: &model, adapter: &MockAdapter, sampler: sampler.as_ref(), params: &params },
        };
        let conditions = flow.prepare_conditions(&inputs).unwrap();
        assert_eq!(conditions.shape, [1, 4, 8, 16]);
        assert_eq!(conditions.edge.size(), vec![1, 1, 64, 128]);
        assert_eq!(conditions.x0.size(), vec![1, 4, 8, 16]);
        assert_eq!(conditions.mask.size(), vec![1, 1, 8, 16]);
        let kept = conditions.mask.sum(tch::Kind::Float).double_value(&[]);
        assert_eq!(kept, 64.0);
    }

    #[test]
    fn test_run_writes_edge_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = inputs(dir.path(), (128, 64));
        let model = MockModel::default();
        let sampler = plms();
        let params = params(1.0);
        let flow = SketchEditFlow {
            pipeline: Pipeline { model: &model, adapter: &MockAdapter, sampler: sampler.as_ref(), params: &params },
        };
        let out = dir.path().join("out");
        let mut writer = OutputWriter::new(&out).unwrap();
        flow.run(&inputs, &mut writer).unwrap();
        assert_eq!(writer.index(), 2);
        for name in ["00000_edge.png", "00000_result.png", "00001_edge.png", "00001_result.png"] {
            assert!(out.join(name).is_file(), "missing {name}");
        }
        // Guidance is off, the negative prompt never reaches the encoder.
        assert!(model.prompts.borrow().iter().all(|p| p == "a white cat"));

        let edge = image::open(out.join("00000_edge.png")).unwrap().to_rgb8();
        assert!(edge.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn test_source_with_other_aspect_ratio_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = inputs(dir.path(), (64, 64));
        let model = MockModel::default();
        let sampler = plms();
        let params = params(7.5);
        let flow = SketchEditFlow {
            pipeline: Pipeline { model: &model, adapter: &MockAdapter, sampler: sampler.as_ref(), params: &params },
        };
        let err = flow.prepare_conditions(&inputs).err().unwrap();
        match err.downcast_ref::<Error>() {
            Some(Error::LatentShapeMismatch { expected, found }) => {
                assert_eq!(expected, &vec![1, 4, 8, 16]);
                assert_eq!(found, &vec![1, 4, 8, 8]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
