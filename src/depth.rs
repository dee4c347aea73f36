use std::path::Path;

use tch::{CModule, Device, Tensor};

use crate::{condition::normalize_min_max, utils::require_file};

/// Monocular depth estimation for the `image` condition source.
pub trait DepthEstimator {
    /// `image` is `(1, 3, H, W)` in [-1, 1]. Returns relative depth as
    /// `(1, 1, H, W)`, larger values closer to the camera.
    fn estimate(&self, image: &Tensor) -> anyhow::Result<Tensor>;
}

/// A MiDaS network exported to TorchScript.
#[derive(Debug)]
pub struct MidasDepth {
    model: CModule,
}

impl MidasDepth {
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> anyhow::Result<Self> {
        let path = require_file(path)?;
        tracing::info!(path = %path.display(), "loading depth estimator");
        let mut model = CModule::load_on_device(&path, device)?;
        model.set_eval();
        Ok(Self { model })
    }
}

impl DepthEstimator for MidasDepth {
    fn estimate(&self, image: &Tensor) -> anyhow::Result<Tensor> {
        let depth = self.model.forward_ts(&[image])?;
        Ok(match depth.dim() {
            3 => depth.unsqueeze(1),
            _ => depth,
        })
    }
}

/// Depth condition derived from a photo: three identical channels, min-max
/// normalized to [0, 1].
pub fn depth_condition(estimator: &dyn DepthEstimator, photo: &Tensor) -> anyhow::Result<Tensor> {
    let image = photo * 2. - 1.;
    let depth = estimator.estimate(&image)?;
    let depth = depth.repeat([1, 3, 1, 1]);
    Ok(normalize_min_max(&depth))
}

#[cfg(test)]
pub(crate) mod tests {
    use tch::Kind;

    use super::*;

    /// Depth equal to the first input channel.
    pub(crate) struct ChannelDepth;

    impl DepthEstimator for ChannelDepth {
        fn estimate(&self, image: &Tensor) -> anyhow::Result<Tensor> {
            Ok(image.narrow(1, 0, 1))
        }
    }

    #[test]
    fn test_depth_condition_is_normalized_rgb() {
        let photo = Tensor::from_slice(&[0.25f32, 0.5, 0.75, 1.0])
            .view([1, 1, 2, 2])
            .repeat([1, 3, 1, 1]);
        let depth = depth_condition(&ChannelDepth, &photo).unwrap();
        assert_eq!(depth.size(), vec![1, 3, 2, 2]);
        let values = Vec::<f32>::try_from(&depth.select(1, 2).flatten(0, -1)).unwrap();
        let expected = [0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-6);
        }
        assert!(depth.min().double_value(&[]) >= 0.0);
        assert!(depth.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn test_flat_depth_does_not_divide_by_zero() {
        let photo = Tensor::full([1, 3, 4, 4], 0.3, (Kind::Float, Device::Cpu));
        let depth = depth_condition(&ChannelDepth, &photo).unwrap();
        assert_eq!(depth.isfinite().all().int64_value(&[]), 1);
    }

    #[test]
    fn test_missing_model_file() {
        assert!(MidasDepth::load("weights/missing-midas.pt", Device::Cpu).is_err());
    }
}
