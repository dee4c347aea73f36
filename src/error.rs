use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the adapter pipeline. Callers propagate them through
/// `anyhow::Result` and can downcast when they need the variant.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported sampler `{0}`, expected one of: plms, ddim")]
    UnsupportedSampler(String),

    #[error("unsupported condition type `{0}`, expected one of: depth, image")]
    UnsupportedCondition(String),

    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("cannot sample with {steps} steps, expected 1..={max} for {train_timesteps} training timesteps")]
    InvalidSteps { steps: usize, max: usize, train_timesteps: usize },

    #[error("source latent {found:?} does not match target latent {expected:?}")]
    LatentShapeMismatch { expected: Vec<i64>, found: Vec<i64> },

    #[error("adapter checkpoint {}: {reason}", .path.display())]
    AdapterCheckpoint { path: PathBuf, reason: String },

    #[error("adapter produced {found} feature maps, the unet has {expected} levels")]
    AdapterLevels { expected: usize, found: usize },
}
