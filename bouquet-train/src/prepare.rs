//! Turns a folder of raw product photos into a training set: images resized
//! to the training resolution and saved as JPEG, plus a drafted captions
//! file. Captions are guessed from filenames and meant to be hand-edited
//! before training.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::{info, warn};

const JPEG_QUALITY: u8 = 95;

#[derive(clap::Args, Debug)]
pub struct PrepareArgs {
    /// Directory of raw photos
    #[arg(long, default_value = "raw_images")]
    pub input_dir: PathBuf,

    /// Where processed images are written
    #[arg(long, default_value = "training_data/images")]
    pub output_dir: PathBuf,

    /// Where the drafted captions file is written
    #[arg(long, default_value = "training_data/captions.json")]
    pub captions_file: PathBuf,

    /// Output filename prefix
    #[arg(long, default_value = "bexy")]
    pub prefix: String,

    #[arg(long, default_value_t = 512)]
    pub resolution: u32,
}

pub struct PrepareSummary {
    pub processed: usize,
    pub skipped: usize,
}

pub fn run(args: PrepareArgs) -> Result<PrepareSummary> {
    if !args.input_dir.is_dir() {
        bail!("input directory {} does not exist", args.input_dir.display());
    }
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;
    if let Some(parent) = args.captions_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&args.input_dir)
        .with_context(|| format!("failed to list {}", args.input_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut captions: BTreeMap<String, String> = BTreeMap::new();
    let mut processed = 0;
    let mut skipped = 0;

    for path in files {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "bmp" => {}
            "heic" | "heif" => {
                warn!(
                    file = %path.display(),
                    "HEIC is not supported, convert it to JPEG first and rerun"
                );
                skipped += 1;
                continue;
            }
            _ => continue,
        }

        let image = match image::ImageReader::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))
            .and_then(|r| Ok(r.with_guessed_format()?))
            .and_then(|r| {
                r.decode()
                    .with_context(|| format!("failed to decode {}", path.display()))
            }) {
            Ok(image) => image,
            Err(e) => {
                warn!(error = format!("{e:#}"), "skipping unreadable image");
                skipped += 1;
                continue;
            }
        };

        let stem = format!("{}_{:03}", args.prefix, processed + 1);
        let output_path = args.output_dir.join(format!("{stem}.jpg"));
        let resized = image
            .resize_exact(args.resolution, args.resolution, FilterType::Lanczos3)
            .to_rgb8();
        let file = std::fs::File::create(&output_path)
            .with_context(|| format!("failed to create {}", output_path.display()))?;
        let encoder = JpegEncoder::new_with_quality(file, JPEG_QUALITY);
        resized
            .write_with_encoder(encoder)
            .with_context(|| format!("failed to encode {}", output_path.display()))?;

        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        captions.insert(stem.clone(), caption_for(&source_name));
        info!(source = %path.display(), output = %output_path.display(), "processed");
        processed += 1;
    }

    if processed == 0 {
        bail!(
            "no usable images found in {}",
            args.input_dir.display()
        );
    }

    std::fs::write(
        &args.captions_file,
        serde_json::to_string_pretty(&captions)?,
    )
    .with_context(|| format!("failed to write {}", args.captions_file.display()))?;
    info!(
        path = %args.captions_file.display(),
        "captions drafted, edit them to describe each photo before training"
    );

    Ok(PrepareSummary { processed, skipped })
}

/// Drafts a caption from hints in the source filename. The generic parts are
/// always present so even an unhinted photo trains toward the house style.
fn caption_for(filename: &str) -> String {
    let mut caption = String::from("Beautiful flower bouquet");

    if filename.contains("heart") {
        caption.push_str(" in heart-shaped box");
    } else if filename.contains("circle") || filename.contains("rounded") {
        caption.push_str(" in circle-shaped box");
    } else if filename.contains("black") {
        caption.push_str(" in elegant black box");
    } else if filename.contains("golden") {
        caption.push_str(" in golden box");
    }

    if filename.contains("glitter") || filename.contains("gliter") {
        caption.push_str(" with glitter on petals");
    }
    if filename.contains("chocolate") || filename.contains("ferrero") {
        caption.push_str(" with luxury chocolates");
    }

    if filename.contains("large") {
        caption.push_str(", large size bouquet");
    } else if filename.contains("medium") {
        caption.push_str(", medium size bouquet");
    } else if filename.contains("small") {
        caption.push_str(", small size bouquet");
    }

    caption.push_str(
        ", Bexy Flowers branding, professional product photography, white background",
    );
    caption
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("bouquet-prepare-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn prepare_args(root: &Path) -> PrepareArgs {
        PrepareArgs {
            input_dir: root.join("raw"),
            output_dir: root.join("images"),
            captions_file: root.join("captions.json"),
            prefix: "bexy".to_string(),
            resolution: 64,
        }
    }

    #[test]
    fn resizes_renames_and_drafts_captions() {
        let root = test_dir("happy");
        let args = prepare_args(&root);
        std::fs::create_dir_all(&args.input_dir).unwrap();
        image::DynamicImage::new_rgb8(300, 200)
            .save(args.input_dir.join("red roses heart glitter.png"))
            .unwrap();

        let summary = run(prepare_args(&root)).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 0);

        let reopened = image::open(root.join("images/bexy_001.jpg")).unwrap();
        assert_eq!((reopened.width(), reopened.height()), (64, 64));

        let captions: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(root.join("captions.json")).unwrap())
                .unwrap();
        let caption = &captions["bexy_001"];
        assert!(caption.contains("heart-shaped box"));
        assert!(caption.contains("glitter on petals"));
        assert!(caption.contains("Bexy Flowers"));
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn corrupt_files_are_counted_not_fatal() {
        let root = test_dir("corrupt");
        let args = prepare_args(&root);
        std::fs::create_dir_all(&args.input_dir).unwrap();
        image::DynamicImage::new_rgb8(100, 100)
            .save(args.input_dir.join("bouquet.jpg"))
            .unwrap();
        std::fs::write(args.input_dir.join("broken.jpg"), b"not an image").unwrap();
        std::fs::write(args.input_dir.join("photo.heic"), b"heic bytes").unwrap();

        let summary = run(prepare_args(&root)).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 2);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn empty_input_is_an_error() {
        let root = test_dir("empty");
        let args = prepare_args(&root);
        std::fs::create_dir_all(&args.input_dir).unwrap();
        std::fs::write(args.input_dir.join("notes.txt"), "not an image").unwrap();
        assert!(run(prepare_args(&root)).is_err());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn captions_cover_box_shapes_and_sizes() {
        let golden = caption_for("golden box large.jpg");
        assert!(golden.contains("golden box"));
        assert!(golden.contains("large size bouquet"));

        let plain = caption_for("img_1234.jpg");
        assert!(plain.starts_with("Beautiful flower bouquet,"));
    }
}
