//! Captioned image set used for fine-tuning. Images live in one directory,
//! captions in a JSON file keyed by the image file stem; only images with a
//! caption are trained on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use tracing::{info, warn};

#[derive(Debug)]
pub struct TrainingExample {
    pub image: PathBuf,
    pub caption: String,
}

#[derive(Debug)]
pub struct TrainingSet {
    pub examples: Vec<TrainingExample>,
    resolution: u32,
}

impl TrainingSet {
    pub fn load(images_dir: &Path, captions_file: &Path, resolution: u32) -> Result<Self> {
        if !images_dir.is_dir() {
            bail!(
                "training images directory {} does not exist, run the prepare command \
                 or add photos there first",
                images_dir.display()
            );
        }
        let captions_text = std::fs::read_to_string(captions_file).with_context(|| {
            format!(
                "failed to read captions from {}, run the prepare command to draft one",
                captions_file.display()
            )
        })?;
        let captions: HashMap<String, String> = serde_json::from_str(&captions_text)
            .with_context(|| format!("failed to parse {}", captions_file.display()))?;

        let mut entries: Vec<PathBuf> = std::fs::read_dir(images_dir)
            .with_context(|| format!("failed to list {}", images_dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(str::to_lowercase),
                    Some(ref ext) if matches!(ext.as_str(), "jpg" | "jpeg" | "png")
                )
            })
            .collect();
        entries.sort();

        let mut examples = Vec::new();
        for path in entries {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match captions.get(stem) {
                Some(caption) => examples.push(TrainingExample {
                    image: path,
                    caption: caption.clone(),
                }),
                None => warn!(image = %path.display(), "no caption for this image, skipping"),
            }
        }

        if examples.is_empty() {
            bail!(
                "no captioned training images found: every image in {} needs an entry \
                 in {}",
                images_dir.display(),
                captions_file.display()
            );
        }
        info!(count = examples.len(), "loaded training examples");
        Ok(Self {
            examples,
            resolution,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Decodes one example into a (1, 3, res, res) float tensor in [-1, 1].
    pub fn image_tensor(&self, idx: usize, device: &Device) -> Result<Tensor> {
        let example = &self.examples[idx];
        let image = image::ImageReader::open(&example.image)
            .with_context(|| format!("failed to open {}", example.image.display()))?
            .with_guessed_format()?
            .decode()
            .with_context(|| format!("failed to decode {}", example.image.display()))?;
        image_to_tensor(&image, self.resolution, device)
    }
}

pub fn image_to_tensor(image: &image::DynamicImage, resolution: u32, device: &Device) -> Result<Tensor> {
    let image = image
        .resize_exact(resolution, resolution, FilterType::Lanczos3)
        .to_rgb8();
    let side = resolution as usize;
    let tensor = Tensor::from_vec(image.into_raw(), (side, side, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = ((tensor / 127.5)? - 1.0)?;
    Ok(tensor.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("bouquet-dataset-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_only_captioned_images() {
        let dir = test_dir("load");
        let images = dir.join("images");
        std::fs::create_dir_all(&images).unwrap();
        image::DynamicImage::new_rgb8(16, 16)
            .save(images.join("bexy_001.jpg"))
            .unwrap();
        image::DynamicImage::new_rgb8(16, 16)
            .save(images.join("bexy_002.jpg"))
            .unwrap();
        let captions = dir.join("captions.json");
        std::fs::write(&captions, r#"{"bexy_001": "red roses in a heart box"}"#).unwrap();

        let set = TrainingSet::load(&images, &captions, 64).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.examples[0].caption, "red roses in a heart box");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_captions_file_names_the_remedy() {
        let dir = test_dir("nocaptions");
        let images = dir.join("images");
        std::fs::create_dir_all(&images).unwrap();
        let err =
            TrainingSet::load(&images, &dir.join("captions.json"), 64).unwrap_err();
        assert!(format!("{err:#}").contains("prepare"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn image_tensor_is_normalized_chw() {
        let device = Device::Cpu;
        let mut img = image::RgbImage::new(8, 8);
        for p in img.pixels_mut() {
            *p = image::Rgb([255, 0, 127]);
        }
        let tensor =
            image_to_tensor(&image::DynamicImage::ImageRgb8(img), 8, &device).unwrap();
        assert_eq!(tensor.dims(), [1, 3, 8, 8]);
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let max = values.iter().cloned().fold(f32::MIN, f32::max);
        let min = values.iter().cloned().fold(f32::MAX, f32::min);
        assert!(max <= 1.0 && max > 0.99);
        assert!(min >= -1.0 && min < -0.99);
    }
}
