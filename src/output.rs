use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use image::RgbImage;
use regex::Regex;

use crate::error::Error;

const NUMBERED_PNG: &str = r"^(\d+)_\w+\.png$";

/// Writes numbered output images, `{index:05}_{label}.png`. Numbering
/// continues after the highest index already present in the directory and
/// advances once per written result.
#[derive(Debug)]
pub struct OutputWriter {
    dir: PathBuf,
    next_index: u64,
}

impl OutputWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("error creating output directory {:?}", dir.to_string_lossy()))?;
        let next_index = Self::first_free_index(&dir)?;
        tracing::info!(dir = %dir.display(), next_index, "writing outputs");
        Ok(Self { dir, next_index })
    }

    fn first_free_index(dir: &Path) -> anyhow::Result<u64> {
        let re = Regex::new(NUMBERED_PNG)?;
        let mut next = 0;
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let index = re.captures(name).and_then(|c| c[1].parse::<u64>().ok());
            if let Some(index) = index {
                next = next.max(index.saturating_add(1));
            }
        }
        Ok(next)
    }

    pub fn index(&self) -> u64 {
        self.next_index
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{:05}_{label}.png", self.next_index))
    }

    /// Writes the visualized condition of the current iteration.
    pub fn write_condition(&self, label: &str, image: &RgbImage) -> anyhow::Result<PathBuf> {
        let path = self.path_for(label);
        save_png(image, &path)?;
        Ok(path)
    }

    /// Writes the generated image and moves on to the next index.
    pub fn write_result(&mut self, image: &RgbImage) -> anyhow::Result<PathBuf> {
        let path = self.path_for("result");
        save_png(image, &path)?;
        tracing::info!(path = %path.display(), "saved result");
        self.next_index = self.next_index.saturating_add(1);
        Ok(path)
    }
}

fn save_png(image: &RgbImage, path: &Path) -> anyhow::Result<()> {
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|source| Error::Image { path: path.to_path_buf(), source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel() -> RgbImage {
        RgbImage::new(2, 2)
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_fresh_directory_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/out");
        let mut writer = OutputWriter::new(&out).unwrap();
        assert_eq!(writer.index(), 0);
        for _ in 0..2 {
            writer.write_condition("depth", &pixel()).unwrap();
            writer.write_result(&pixel()).unwrap();
        }
        assert_eq!(writer.index(), 2);
        assert_eq!(
            names(&out),
            vec!["00000_depth.png", "00000_result.png", "00001_depth.png", "00001_result.png"]
        );
    }

    #[test]
    fn test_resumes_after_existing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00000_edge.png", "00007_result.png", "notes.txt", "12_x.jpg", "final.png"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let mut writer = OutputWriter::new(dir.path()).unwrap();
        assert_eq!(writer.index(), 8);
        let path = writer.write_result(&pixel()).unwrap();
        assert_eq!(path, dir.path().join("00008_result.png"));
        assert_eq!(writer.index(), 9);
    }

    #[test]
    fn test_condition_does_not_advance() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path()).unwrap();
        let first = writer.write_condition("edge", &pixel()).unwrap();
        let second = writer.write_condition("edge", &pixel()).unwrap();
        assert_eq!(first, second);
        assert_eq!(writer.index(), 0);
    }

    #[test]
    fn test_counter_saturates_at_max_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(format!("{}_result.png", u64::MAX)), b"").unwrap();
        let mut writer = OutputWriter::new(dir.path()).unwrap();
        assert_eq!(writer.index(), u64::MAX);
        writer.write_result(&pixel()).unwrap();
        assert_eq!(writer.index(), u64::MAX);
    }
}
