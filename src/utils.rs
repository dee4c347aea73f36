use std::path::{Path, PathBuf};

use tch::Device;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::error::Error;

/// Returns the path unchanged if it points at an existing file.
pub(crate) fn require_file<P: AsRef<Path>>(path: P) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::MissingCheckpoint(path.to_path_buf()).into())
    }
}

pub fn get_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Installs the global subscriber: a fmt layer filtered by `RUST_LOG`
/// (default `info`) and, when `chrome` is set, a chrome trace writer. Keep the
/// returned guard alive until the end of `main` so the trace gets flushed.
pub fn init_tracing(chrome: bool) -> Option<FlushGuard> {
    let (chrome_layer, guard) = if chrome {
        let (layer, guard) = ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(chrome_layer)
        .init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_require_file_reports_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("unet.safetensors");
        let err = require_file(&missing).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::MissingCheckpoint(path)) => assert_eq!(path, &missing),
            other => panic!("unexpected error {other:?}"),
        }

        std::fs::write(&missing, b"").unwrap();
        assert_eq!(require_file(&missing).unwrap(), missing);
    }

    #[test]
    fn test_cpu_flag_forces_cpu() {
        assert_eq!(get_device(true), Device::Cpu);
    }
}
