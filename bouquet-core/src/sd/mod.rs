//! Stable Diffusion model loading and text-to-image inference.
//!
//! Weights come from the Hugging Face hub. The UNet weight map is merged
//! with the fine-tuned LoRA adapter (when one is found on disk) before the
//! model is built, so inference runs at full speed with no per-step adapter
//! overhead. Sampling uses the Euler-ancestral scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::SchedulerConfig;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::{self, clip};
use hf_hub::api::sync::{Api, ApiRepo};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::device::{select_best_device, DeviceMap};
use crate::lora::{load_adapter, AdapterPaths};
use crate::{tensor_to_image, GenerationJob, TextToImage};

mod config;
pub use config::SdVersion;

/// Latent-space scale factor of the SD 1.x/2.x VAE.
pub const VAE_SCALE: f64 = 0.18215;

/// Attention slice size used on accelerators to keep VRAM bounded at
/// 1024x1024. CPU runs unsliced.
const ATTENTION_SLICE: usize = 128;

/// Everything the server needs to load a model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_id: String,
    pub device: DeviceMap,
    pub adapter: AdapterPaths,
}

/// Locally cached paths of the checkpoint files for one model version.
pub struct SdFiles {
    pub tokenizer: PathBuf,
    pub clip_weights: PathBuf,
    pub vae_weights: PathBuf,
    pub unet_weights: PathBuf,
}

impl SdFiles {
    /// Downloads (or reuses from the hub cache) the files for `version`.
    /// With `prefer_f16` the half-precision exports are tried first and the
    /// fp32 files serve as fallback, since not every repo ships fp16.
    pub fn fetch(version: SdVersion, prefer_f16: bool) -> Result<Self> {
        let api = Api::new().context("failed to initialize the Hugging Face hub client")?;
        let repo = api.model(version.repo().to_string());
        info!(repo = version.repo(), prefer_f16, "fetching model files");

        let tokenizer = api
            .model(version.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .with_context(|| format!("failed to fetch tokenizer from {}", version.tokenizer_repo()))?;
        let clip_weights = fetch_weights(
            &repo,
            "text_encoder/model.fp16.safetensors",
            "text_encoder/model.safetensors",
            prefer_f16,
        )?;
        let vae_weights = fetch_weights(
            &repo,
            "vae/diffusion_pytorch_model.fp16.safetensors",
            "vae/diffusion_pytorch_model.safetensors",
            prefer_f16,
        )?;
        let unet_weights = fetch_weights(
            &repo,
            "unet/diffusion_pytorch_model.fp16.safetensors",
            "unet/diffusion_pytorch_model.safetensors",
            prefer_f16,
        )?;

        Ok(Self {
            tokenizer,
            clip_weights,
            vae_weights,
            unet_weights,
        })
    }
}

fn fetch_weights(repo: &ApiRepo, fp16: &str, fp32: &str, prefer_f16: bool) -> Result<PathBuf> {
    if prefer_f16 {
        match repo.get(fp16) {
            Ok(path) => return Ok(path),
            Err(e) => warn!(file = fp16, error = %e, "fp16 weights unavailable, using fp32"),
        }
    }
    repo.get(fp32)
        .with_context(|| format!("failed to fetch {fp32}"))
}

/// CLIP tokenizer + text encoder. Shared between inference and training.
pub struct TextEmbedder {
    tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    pad_id: u32,
    eos_id: u32,
    max_len: usize,
    device: Device,
}

impl TextEmbedder {
    pub fn new(
        tokenizer_path: &Path,
        clip_weights: &Path,
        clip_config: &clip::Config,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to load the CLIP tokenizer: {e}"))?;
        let pad_token = clip_config
            .pad_with
            .as_deref()
            .unwrap_or("<|endoftext|>");
        let vocab = tokenizer.get_vocab(true);
        let pad_id = *vocab
            .get(pad_token)
            .ok_or_else(|| anyhow!("pad token `{pad_token}` missing from the vocabulary"))?;
        let eos_id = *vocab
            .get("<|endoftext|>")
            .ok_or_else(|| anyhow!("end-of-text token missing from the vocabulary"))?;
        let clip = stable_diffusion::build_clip_transformer(
            clip_config,
            clip_weights,
            device,
            dtype,
        )?;
        Ok(Self {
            tokenizer,
            clip,
            pad_id,
            eos_id,
            max_len: clip_config.max_position_embeddings,
            device: device.clone(),
        })
    }

    /// Encodes one prompt into a (1, 77, dim) embedding tensor. Prompts
    /// longer than the CLIP context are truncated with the end-of-text token
    /// kept in the last slot, shorter ones padded.
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("prompt tokenization failed: {e}"))?
            .get_ids()
            .to_vec();
        if clamp_to_window(&mut tokens, self.max_len, self.eos_id, self.pad_id) {
            warn!(
                limit = self.max_len,
                "prompt exceeds the text encoder window, tail dropped"
            );
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }
}

/// Fits a token sequence to the encoder window: over-long sequences lose
/// their tail but keep the end-of-text marker, short ones are padded.
/// Returns whether anything was dropped.
fn clamp_to_window(tokens: &mut Vec<u32>, max_len: usize, eos_id: u32, pad_id: u32) -> bool {
    let truncated = tokens.len() > max_len;
    if truncated {
        tokens.truncate(max_len - 1);
        tokens.push(eos_id);
    }
    while tokens.len() < max_len {
        tokens.push(pad_id);
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 49407;
    const PAD: u32 = 0;

    #[test]
    fn over_long_sequences_keep_the_end_token() {
        let mut tokens: Vec<u32> = (1..=100).collect();
        assert!(clamp_to_window(&mut tokens, 77, EOS, PAD));
        assert_eq!(tokens.len(), 77);
        assert_eq!(tokens[76], EOS);
        assert_eq!(tokens[75], 76);
    }

    #[test]
    fn short_sequences_are_padded_not_truncated() {
        let mut tokens = vec![1, 2, 3, EOS];
        assert!(!clamp_to_window(&mut tokens, 77, EOS, PAD));
        assert_eq!(tokens.len(), 77);
        assert_eq!(&tokens[..4], &[1, 2, 3, EOS]);
        assert!(tokens[4..].iter().all(|&t| t == PAD));
    }
}

struct SdModel {
    embedder: TextEmbedder,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    device: Device,
    dtype: DType,
}

/// Loads the full pipeline for `config`, merging the fine-tuned adapter into
/// the UNet weights when one is present. Adapter problems degrade to the
/// base model; anything else is fatal.
pub fn load_model(config: &ModelConfig) -> Result<Arc<dyn TextToImage>> {
    let version = SdVersion::from_name(&config.model_id)?;
    let device = select_best_device(config.device)?;
    let dtype = if device.is_cuda() { DType::F16 } else { DType::F32 };
    let sliced_attention = if matches!(device, Device::Cpu) {
        None
    } else {
        Some(ATTENTION_SLICE)
    };
    info!(model = %config.model_id, ?dtype, "loading model");

    let files = SdFiles::fetch(version, dtype == DType::F16)?;
    let sd_config = version.sd_config(sliced_attention);

    let embedder = TextEmbedder::new(
        &files.tokenizer,
        &files.clip_weights,
        &sd_config.clip,
        &device,
        dtype,
    )?;
    let vae = sd_config.build_vae(&files.vae_weights, &device, dtype)?;

    let mut unet_weights = candle_core::safetensors::load(&files.unet_weights, &device)
        .with_context(|| format!("failed to load {}", files.unet_weights.display()))?;
    if let Some(adapter) = load_adapter(&config.adapter, &device) {
        let merged = adapter.apply(&mut unet_weights)?;
        info!(layers = merged, "merged fine-tuned adapter into the UNet");
    }
    let vb = VarBuilder::from_tensors(unet_weights, dtype, &device);
    let unet = UNet2DConditionModel::new(vb, 4, 4, false, version.unet_config(sliced_attention))?;

    Ok(Arc::new(SdModel {
        embedder,
        vae,
        unet,
        device,
        dtype,
    }))
}

impl TextToImage for SdModel {
    fn generate(&self, job: &GenerationJob) -> Result<image::DynamicImage> {
        if job.width % 8 != 0 || job.height % 8 != 0 {
            bail!(
                "width and height must be multiples of 8, got {}x{}",
                job.width,
                job.height
            );
        }
        if let Some(seed) = job.seed {
            if matches!(self.device, Device::Cpu) {
                warn!("the CPU backend cannot be seeded, output will vary");
            } else {
                self.device.set_seed(seed)?;
            }
        }

        let use_guidance = job.guidance > 1.0;
        let text_embeddings = {
            let positive = self.embedder.encode(&job.positive)?;
            if use_guidance {
                let negative = self.embedder.encode(&job.negative)?;
                Tensor::cat(&[negative, positive], 0)?
            } else {
                positive
            }
        };

        let mut scheduler = EulerAncestralDiscreteSchedulerConfig::default().build(job.steps)?;
        let latent_height = job.height / 8;
        let latent_width = job.width / 8;
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, latent_height, latent_width),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        // Euler-ancestral expects the initial noise at its own sigma scale.
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        info!(steps = timesteps.len(), guidance = job.guidance, "denoising");
        for (step, &timestep) in timesteps.iter().enumerate() {
            debug!(step = step + 1, timestep, "denoise step");
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let parts = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&parts[0], &parts[1]);
                (uncond + ((cond - uncond)? * job.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.clamp(0f32, 1.)?;
        let image = (image * 255.)?
            .to_dtype(DType::U8)?
            .to_device(&Device::Cpu)?
            .i(0)?;
        tensor_to_image(&image)
    }
}
