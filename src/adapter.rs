//! T2I-Adapter: a small convolutional encoder turning a structure condition
//! (depth map, sketch) into one feature map per unet down level.
use std::{collections::HashMap, fs, path::Path};

use safetensors::SafeTensors;
use tch::{nn, nn::Module, Device, Tensor};

use crate::{error::Error, utils::require_file};

/// Spatial downscale applied to the condition before the first convolution.
pub const UNSHUFFLE_FACTOR: i64 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    /// Channels after pixel unshuffle, `condition channels * 64`.
    pub in_channels: i64,
    pub channels: Vec<i64>,
    pub nums_rb: usize,
    pub ksize: i64,
    /// Identity skips instead of `skep` convolutions.
    pub sk: bool,
    /// Strided convolution instead of average pooling between levels.
    pub use_conv: bool,
}

impl AdapterConfig {
    /// Channels of the condition image this adapter expects.
    pub fn condition_channels(&self) -> i64 {
        self.in_channels / (UNSHUFFLE_FACTOR * UNSHUFFLE_FACTOR)
    }

    /// Recovers the layout from the tensor shapes of a checkpoint emitting
    /// one feature map for each of `levels` levels.
    pub fn infer(shapes: &HashMap<String, Vec<usize>>, levels: usize) -> Result<Self, String> {
        let shape = |name: &str| {
            shapes.get(name).ok_or_else(|| format!("missing tensor `{name}`"))
        };
        let conv_in = shape("conv_in.weight")?;
        if conv_in.len() != 4 {
            return Err(format!("conv_in.weight has shape {conv_in:?}"));
        }
        let in_channels = conv_in[1] as i64;

        let mut block_channels = vec![];
        while let Some(block1) = shapes.get(&format!("body.{}.block1.weight", block_channels.len())) {
            block_channels.push(block1[0]);
        }
        if block_channels.is_empty() {
            return Err("no residual blocks under `body`".to_string());
        }
        let n_blocks = block_channels.len();
        if levels == 0 || n_blocks % levels != 0 {
            return Err(format!("cannot split {n_blocks} blocks into {levels} levels"));
        }
        let nums_rb = n_blocks / levels;
        let down_opt = |i: usize| shapes.contains_key(&format!("body.{i}.down_opt.op.weight"));
        for i in (1..n_blocks).filter(|i| i % nums_rb != 0) {
            if block_channels[i] != block_channels[i - 1] || down_opt(i) {
                return Err(format!("block {i} starts a new level inside a level of {nums_rb} blocks"));
            }
        }
        let channels = block_channels.iter().step_by(nums_rb).map(|&c| c as i64).collect();
        let ksize = shape("body.0.block2.weight")?.last().copied().unwrap_or(1) as i64;
        let sk = !shapes.contains_key("body.0.skep.weight");
        let use_conv = down_opt(nums_rb);
        Ok(Self { in_channels, channels, nums_rb, ksize, sk, use_conv })
    }

    pub fn from_checkpoint<P: AsRef<Path>>(path: P, levels: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let reason_err = |reason: String| Error::AdapterCheckpoint { path: path.to_path_buf(), reason };
        let buffer = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&buffer).map_err(|e| reason_err(e.to_string()))?;
        let shapes: HashMap<String, Vec<usize>> = tensors
            .tensors()
            .into_iter()
            .map(|(name, view)| (name, view.shape().to_vec()))
            .collect();
        let config = Self::infer(&shapes, levels).map_err(reason_err)?;
        Ok(config)
    }
}

#[derive(Debug)]
struct ResnetBlock {
    down_opt: Option<Downsample>,
    in_conv: Option<nn::Conv2D>,
    block1: nn::Conv2D,
    block2: nn::Conv2D,
    skep: Option<nn::Conv2D>,
}

#[derive(Debug)]
enum Downsample {
    Conv(nn::Conv2D),
    AvgPool,
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Downsample::Conv(conv) => xs.apply(conv),
            Downsample::AvgPool => xs.avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None::<i64>),
        }
    }
}

impl ResnetBlock {
    fn new(vs: nn::Path, in_c: i64, out_c: i64, down: bool, config: &AdapterConfig) -> Self {
        let ksize = config.ksize;
        let same = nn::ConvConfig { padding: ksize / 2, ..Default::default() };
        let down_opt = down.then(|| {
            if config.use_conv {
                let cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
                Downsample::Conv(nn::conv2d(&vs / "down_opt" / "op", in_c, in_c, 3, cfg))
            } else {
                Downsample::AvgPool
            }
        });
        let in_conv = (in_c != out_c || !config.sk)
            .then(|| nn::conv2d(&vs / "in_conv", in_c, out_c, ksize, same));
        let block1 = nn::conv2d(
            &vs / "block1",
            out_c,
            out_c,
            3,
            nn::ConvConfig { padding: 1, ..Default::default() },
        );
        let block2 = nn::conv2d(&vs / "block2", out_c, out_c, ksize, same);
        // Applied after `in_conv`, so it maps `out_c` channels.
        let skep = (!config.sk).then(|| nn::conv2d(&vs / "skep", out_c, out_c, ksize, same));
        Self { down_opt, in_conv, block1, block2, skep }
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let xs = match &self.down_opt {
            Some(down) => down.forward(xs),
            None => xs.shallow_clone(),
        };
        let xs = match &self.in_conv {
            Some(conv) => xs.apply(conv),
            None => xs,
        };
        let h = xs.apply(&self.block1).relu().apply(&self.block2);
        match &self.skep {
            Some(skep) => h + xs.apply(skep),
            None => h + xs,
        }
    }
}

/// Turns a condition image into per level feature maps.
pub trait ConditionAdapter {
    /// `condition` is `(1, C, H, W)` with `H` and `W` multiples of 64. Returns
    /// one map per level, each downsampled by a further factor of two.
    fn features(&self, condition: &Tensor) -> anyhow::Result<Vec<Tensor>>;
}

#[derive(Debug)]
pub struct T2IAdapter {
    conv_in: nn::Conv2D,
    body: Vec<ResnetBlock>,
    config: AdapterConfig,
}

impl T2IAdapter {
    pub fn new(vs: nn::Path, config: AdapterConfig) -> Self {
        let conv_in = nn::conv2d(
            &vs / "conv_in",
            config.in_channels,
            config.channels[0],
            3,
            nn::ConvConfig { padding: 1, ..Default::default() },
        );
        let vs_body = &vs / "body";
        let mut body = vec![];
        for (i, &out_c) in config.channels.iter().enumerate() {
            for j in 0..config.nums_rb {
                let down = i != 0 && j == 0;
                let in_c = if down { config.channels[i - 1] } else { out_c };
                body.push(ResnetBlock::new(&vs_body / body.len(), in_c, out_c, down, &config));
            }
        }
        Self { conv_in, body, config }
    }

    /// Builds the adapter from a safetensors checkpoint, inferring its layout.
    /// The checkpoint has to take conditions with `condition_channels`
    /// channels and feed a unet with `levels` down levels.
    pub fn load<P: AsRef<Path>>(
        path: P,
        condition_channels: i64,
        levels: usize,
        device: Device,
    ) -> anyhow::Result<Self> {
        let path = require_file(path)?;
        let config = AdapterConfig::from_checkpoint(&path, levels)?;
        if config.condition_channels() != condition_channels {
            let reason = format!(
                "expects {} channel conditions, got {condition_channels}",
                config.condition_channels()
            );
            return Err(Error::AdapterCheckpoint { path, reason }.into());
        }
        tracing::info!(
            path = %path.display(),
            in_channels = config.in_channels,
            channels = ?config.channels,
            "loading adapter"
        );
        let mut vs = nn::VarStore::new(device);
        let adapter = Self::new(vs.root(), config);
        vs.load(&path)?;
        Ok(adapter)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }
}

impl ConditionAdapter for T2IAdapter {
    fn features(&self, condition: &Tensor) -> anyhow::Result<Vec<Tensor>> {
        let mut xs = condition.pixel_unshuffle(UNSHUFFLE_FACTOR).apply(&self.conv_in);
        let mut features = Vec::with_capacity(self.config.channels.len());
        for level in self.body.chunks(self.config.nums_rb) {
            for block in level {
                xs = block.forward(&xs);
            }
            features.push(xs.shallow_clone());
        }
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind};

    use super::*;

    fn small_config(in_channels: i64) -> AdapterConfig {
        AdapterConfig {
            in_channels,
            channels: vec![4, 8, 16, 16],
            nums_rb: 2,
            ksize: 1,
            sk: true,
            use_conv: false,
        }
    }

    fn shapes_of(config: &AdapterConfig) -> HashMap<String, Vec<usize>> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _adapter = T2IAdapter::new(vs.root(), config.clone());
        vs.variables()
            .into_iter()
            .map(|(name, t)| (name, t.size().into_iter().map(|d| d as usize).collect()))
            .collect()
    }

    #[test]
    fn test_feature_shapes_per_level() {
        let vs = nn::VarStore::new(Device::Cpu);
        let adapter = T2IAdapter::new(vs.root(), small_config(64));
        let sketch = Tensor::zeros([1, 1, 128, 192], (Kind::Float, Device::Cpu));
        let features = tch::no_grad(|| adapter.features(&sketch)).unwrap();
        let shapes: Vec<Vec<i64>> = features.iter().map(|f| f.size()).collect();
        assert_eq!(
            shapes,
            vec![vec![1, 4, 16, 24], vec![1, 8, 8, 12], vec![1, 16, 4, 6], vec![1, 16, 2, 3]]
        );
    }

    #[test]
    fn test_variable_names_follow_checkpoint_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _adapter = T2IAdapter::new(vs.root(), small_config(192));
        let vars = vs.variables();
        assert_eq!(vars["conv_in.weight"].size(), vec![4, 192, 3, 3]);
        assert_eq!(vars["body.2.in_conv.weight"].size(), vec![8, 4, 1, 1]);
        assert!(vars.contains_key("body.7.block2.bias"));
        assert!(!vars.contains_key("body.0.in_conv.weight"));
        assert!(!vars.keys().any(|k| k.contains("skep") || k.contains("down_opt")));
    }

    #[test]
    fn test_infer_recovers_layout() {
        for config in [
            small_config(192),
            small_config(64),
            AdapterConfig { use_conv: true, sk: false, ksize: 3, ..small_config(64) },
            AdapterConfig { nums_rb: 3, ..small_config(64) },
        ] {
            assert_eq!(AdapterConfig::infer(&shapes_of(&config), 4).unwrap(), config);
        }
        assert_eq!(small_config(192).condition_channels(), 3);
        assert_eq!(small_config(64).condition_channels(), 1);
    }

    #[test]
    fn test_infer_with_equal_leading_widths() {
        // No key marks the start of level 1 here, only the level count does.
        let config = AdapterConfig { channels: vec![8, 8, 16, 16], ..small_config(64) };
        let shapes = shapes_of(&config);
        assert_eq!(AdapterConfig::infer(&shapes, 4).unwrap(), config);
        assert!(AdapterConfig::infer(&shapes, 3).is_err());
        assert_eq!(AdapterConfig::infer(&shapes, 2).unwrap().nums_rb, 4);

        // A width change inside a level means the level count is wrong.
        let shapes = shapes_of(&small_config(64));
        assert!(AdapterConfig::infer(&shapes, 2).unwrap_err().contains("block 2"));
    }

    #[test]
    fn test_infer_rejects_unexpected_layout() {
        let mut shapes = HashMap::new();
        assert!(AdapterConfig::infer(&shapes, 4).unwrap_err().contains("conv_in.weight"));
        shapes.insert("conv_in.weight".to_string(), vec![320, 64, 3, 3]);
        assert!(AdapterConfig::infer(&shapes, 4).unwrap_err().contains("no residual blocks"));
    }

    #[test]
    fn test_from_checkpoint_reads_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        let vs = nn::VarStore::new(Device::Cpu);
        let config = small_config(64);
        let _adapter = T2IAdapter::new(vs.root(), config.clone());
        vs.save(&path).unwrap();

        assert_eq!(AdapterConfig::from_checkpoint(&path, 4).unwrap(), config);
        let loaded = T2IAdapter::load(&path, 1, 4, Device::Cpu).unwrap();
        assert_eq!(loaded.config(), &config);
        let err = T2IAdapter::load(&path, 3, 4, Device::Cpu).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::AdapterCheckpoint { .. })));

        std::fs::write(&path, b"not a checkpoint").unwrap();
        let err = AdapterConfig::from_checkpoint(&path, 4).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::AdapterCheckpoint { .. })));
    }
}
