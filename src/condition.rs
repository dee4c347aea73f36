//! Preparing structure conditions: depth maps, edge sketches, edit masks and
//! the images written back to disk.
use std::{path::Path, str::FromStr};

use anyhow::anyhow;
use image::{imageops::FilterType, RgbImage};
use tch::{Device, Kind, Tensor};

use crate::error::Error;

/// Spatial granularity of every resized condition, the total downsampling of
/// the adapter and the unet.
pub const RESIZE_GRANULARITY: u32 = 64;

/// How the depth condition is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionSource {
    /// The input already is a depth map.
    Depth,
    /// The input is a photo, depth gets estimated from it.
    Image,
}

impl FromStr for ConditionSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depth" => Ok(ConditionSource::Depth),
            "image" => Ok(ConditionSource::Image),
            other => Err(Error::UnsupportedCondition(other.to_string())),
        }
    }
}

/// Target size for an image of `width x height` so that the area stays under
/// `budget` pixels. Both sides are rounded down to a multiple of
/// `granularity`, never below one granule. Taking one granule off either side
/// is tried as well and the pair closest to the input aspect ratio wins, the
/// larger one on ties.
pub fn fit_to_budget(width: u32, height: u32, budget: u64, granularity: u32) -> (u32, u32) {
    let k = (budget as f64 / (width as f64 * height as f64)).sqrt();
    let snap = |v: f64| {
        let v = v.floor() as u32;
        (v / granularity * granularity).max(granularity)
    };
    let (w0, h0) = (snap(width as f64 * k), snap(height as f64 * k));
    let ratio = width as f64 / height as f64;
    let ratio_error = |(w, h): (u32, u32)| (w as f64 / h as f64 / ratio).ln().abs();

    let mut best = (w0, h0);
    for candidate in [(w0.saturating_sub(granularity), h0), (w0, h0.saturating_sub(granularity))] {
        if candidate.0 < granularity || candidate.1 < granularity {
            continue;
        }
        if ratio_error(candidate) + 1e-9 < ratio_error(best) {
            best = candidate;
        }
    }
    best
}

pub fn load_rgb<P: AsRef<Path>>(path: P) -> anyhow::Result<RgbImage> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|source| Error::Image { path: path.to_path_buf(), source })?;
    Ok(image.to_rgb8())
}

pub fn resize_to_budget(image: &RgbImage, budget: u64) -> RgbImage {
    let (width, height) = fit_to_budget(image.width(), image.height(), budget, RESIZE_GRANULARITY);
    if (width, height) == image.dimensions() {
        return image.clone();
    }
    tracing::debug!(from = ?image.dimensions(), to = ?(width, height), "resizing condition");
    image::imageops::resize(image, width, height, FilterType::Lanczos3)
}

/// `(1, 3, H, W)` float tensor in [0, 1].
pub fn image_to_tensor(image: &RgbImage, device: Device) -> Tensor {
    let (width, height) = image.dimensions();
    Tensor::from_slice(image.as_raw())
        .view([height as i64, width as i64, 3])
        .permute([2, 0, 1])
        .to_kind(Kind::Float)
        .unsqueeze(0)
        .to_device(device)
        / 255.
}

/// Thresholds the first channel of a sketch at half intensity, giving a
/// `(1, 1, H, W)` tensor of exact zeros and ones.
pub fn binarize_edges(image: &RgbImage, device: Device) -> Tensor {
    image_to_tensor(image, device).narrow(1, 0, 1).gt(0.5).to_kind(Kind::Float)
}

/// Loads the edit mask at latent resolution. White pixels mark the region to
/// regenerate, so the returned keep-mask is 1 where the source is black.
pub fn load_mask<P: AsRef<Path>>(
    path: P,
    latent_width: u32,
    latent_height: u32,
    device: Device,
) -> anyhow::Result<Tensor> {
    let mask = load_rgb(path)?;
    let mask = image::imageops::resize(&mask, latent_width, latent_height, FilterType::Triangle);
    let mask = image_to_tensor(&mask, device).narrow(1, 0, 1);
    Ok((mask.ones_like() - mask).gt(0.5).to_kind(Kind::Float))
}

/// Rescales to [0, 1] using the tensor's own range. A flat input maps to
/// zeros.
pub fn normalize_min_max(t: &Tensor) -> Tensor {
    let min = t.min();
    let range = t.max() - &min;
    let range = range.clamp_min(f64::EPSILON);
    (t - min) / range
}

/// Converts a `(1, C, H, W)` tensor in [0, 1] to an RGB image. Single channel
/// tensors are replicated. With `round` values are rounded to the nearest
/// level, otherwise truncated.
pub fn tensor_to_image(t: &Tensor, round: bool) -> anyhow::Result<RgbImage> {
    let t = t.to_device(Device::Cpu).to_kind(Kind::Float).squeeze_dim(0);
    let t = if t.size()[0] == 1 { t.repeat([3, 1, 1]) } else { t };
    let t = t.clamp(0., 1.) * 255.;
    let t = if round { t.round() } else { t };
    let t = t.to_kind(Kind::Uint8).permute([1, 2, 0]).contiguous();
    let (height, width) = (t.size()[0] as u32, t.size()[1] as u32);
    let data = Vec::<u8>::try_from(&t.flatten(0, -1))?;
    RgbImage::from_raw(width, height, data)
        .ok_or_else(|| anyhow!("tensor does not hold a {width}x{height} rgb image"))
}

/// Maps decoded VAE output from [-1, 1] to [0, 1].
pub fn decoded_to_unit(t: &Tensor) -> Tensor {
    ((t + 1.) / 2.).clamp(0., 1.)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn test_fit_to_budget_stays_under_budget() {
        for (w, h) in [(512, 512), (1920, 1080), (300, 4000), (64, 64), (777, 333)] {
            for budget in [512 * 512u64, 640 * 384, 1024 * 1024] {
                let (nw, nh) = fit_to_budget(w, h, budget, RESIZE_GRANULARITY);
                assert!(nw as u64 * nh as u64 <= budget, "{w}x{h} -> {nw}x{nh} over {budget}");
                assert_eq!(nw % 64, 0);
                assert_eq!(nh % 64, 0);
            }
        }
    }

    #[test]
    fn test_fit_to_budget_keeps_aspect_ratio() {
        let (w, h) = (1920u32, 1080u32);
        let budget = 512 * 512;
        let (nw, nh) = fit_to_budget(w, h, budget, 1);
        assert!(nw as u64 * nh as u64 <= budget);
        let expected_h = nw as f64 * h as f64 / w as f64;
        assert!((nh as f64 - expected_h).abs() <= 1.0);

        assert_eq!(fit_to_budget(512, 512, 512 * 512, 64), (512, 512));
        assert_eq!(fit_to_budget(256, 256, 512 * 512, 64), (512, 512));
        // 4:3 floors to 576x384, one granule less in width is exact.
        assert_eq!(fit_to_budget(1000, 750, 512 * 512, 64), (512, 384));
    }

    #[test]
    fn test_fit_to_budget_ratio_at_granularity() {
        // Flooring both sides alone gives 704x320, a 2.2 ratio.
        assert_eq!(fit_to_budget(1024, 512, 512 * 512, 64), (640, 320));
        assert_eq!(fit_to_budget(512, 1024, 512 * 512, 64), (320, 640));

        for (w, h) in [(1024u32, 512u32), (1920, 1080), (777, 333), (300, 4000), (640, 480)] {
            let budget = 512 * 512u64;
            let ratio = w as f64 / h as f64;
            let error = |(a, b): (u32, u32)| (a as f64 / b as f64 / ratio).ln().abs();
            let k = (budget as f64 / (w as f64 * h as f64)).sqrt();
            let floored = ((w as f64 * k) as u32 / 64 * 64, (h as f64 * k) as u32 / 64 * 64);

            let (nw, nh) = fit_to_budget(w, h, budget, 64);
            assert!(nw as u64 * nh as u64 <= budget);
            assert!(error((nw, nh)) <= error(floored), "{w}x{h} -> {nw}x{nh}");
        }
    }

    #[test]
    fn test_condition_source_names() {
        assert_eq!("depth".parse::<ConditionSource>().unwrap(), ConditionSource::Depth);
        assert_eq!("image".parse::<ConditionSource>().unwrap(), ConditionSource::Image);
        assert!(matches!(
            "canny".parse::<ConditionSource>(),
            Err(Error::UnsupportedCondition(name)) if name == "canny"
        ));
    }

    #[test]
    fn test_binarize_edges_is_binary() {
        let image = RgbImage::from_fn(8, 4, |x, y| {
            let v = ((x * 37 + y * 91) % 256) as u8;
            Rgb([v, 255 - v, 0])
        });
        let edges = binarize_edges(&image, Device::Cpu);
        assert_eq!(edges.size(), vec![1, 1, 4, 8]);
        let values = Vec::<f32>::try_from(&edges.flatten(0, -1)).unwrap();
        assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));
        // pixel (0, 0) is black in the first channel, (x = 4, y = 0) is 148.
        assert_eq!(values[0], 0.0);
        assert_eq!(values[4], 1.0);
    }

    #[test]
    fn test_load_mask_inverts_and_downsamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let mask = RgbImage::from_fn(64, 32, |x, _| if x < 32 { Rgb([255; 3]) } else { Rgb([0; 3]) });
        mask.save(&path).unwrap();

        let keep = load_mask(&path, 8, 4, Device::Cpu).unwrap();
        assert_eq!(keep.size(), vec![1, 1, 4, 8]);
        let row = Vec::<f32>::try_from(&keep.get(0).get(0).get(0)).unwrap();
        assert_eq!(row, vec![0., 0., 0., 0., 1., 1., 1., 1.]);
    }

    #[test]
    fn test_missing_image_is_reported_with_path() {
        let err = load_rgb("does/not/exist.png").unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Image { path, .. }) => assert!(path.ends_with("exist.png")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_normalize_min_max() {
        let t = Tensor::from_slice(&[2f32, 4., 6.]);
        let n = Vec::<f32>::try_from(&normalize_min_max(&t)).unwrap();
        assert_eq!(n, vec![0.0, 0.5, 1.0]);

        let flat = Tensor::from_slice(&[3f32, 3., 3.]);
        let n = Vec::<f32>::try_from(&normalize_min_max(&flat)).unwrap();
        assert_eq!(n, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_tensor_to_image_rounding() {
        let t = Tensor::full([1, 1, 2, 2], 0.999, (Kind::Float, Device::Cpu));
        let rounded = tensor_to_image(&t, true).unwrap();
        let truncated = tensor_to_image(&t, false).unwrap();
        assert_eq!(rounded.dimensions(), (2, 2));
        assert_eq!(rounded.get_pixel(0, 0), &Rgb([255; 3]));
        assert_eq!(truncated.get_pixel(1, 1), &Rgb([254; 3]));
    }

    #[test]
    fn test_image_tensor_layout() {
        let image = RgbImage::from_fn(3, 2, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 255]));
        let t = image_to_tensor(&image, Device::Cpu);
        assert_eq!(t.size(), vec![1, 3, 2, 3]);
        let back = tensor_to_image(&t, true).unwrap();
        assert_eq!(back, image);
    }
}
