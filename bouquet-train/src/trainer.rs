//! LoRA fine-tuning loop. The base model stays frozen: only the low-rank
//! adapter pairs live in the `VarMap`, and the UNet is built from weights
//! composed as `base + scale * up @ down` so gradients flow to the adapters
//! alone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bouquet_core::lora::{
    default_target_patterns, match_targets, AdapterConfig, ADAPTER_CONFIG_FILE,
    ADAPTER_WEIGHTS_FILE,
};
use bouquet_core::sd::{SdFiles, SdVersion, TextEmbedder, VAE_SCALE};
use bouquet_core::{select_best_device, DeviceMap};
use candle_core::{DType, Tensor};
use candle_nn::{loss, AdamW, Init, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::dataset::TrainingSet;
use crate::schedule::NoiseSchedule;

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Base model to fine-tune
    #[arg(long, default_value = "runwayml/stable-diffusion-v1-5")]
    pub model: String,

    /// Directory of training images
    #[arg(long, default_value = "training_data/images")]
    pub images_dir: PathBuf,

    /// JSON file of captions keyed by image file stem
    #[arg(long, default_value = "training_data/captions.json")]
    pub captions_file: PathBuf,

    /// Where checkpoints and the final adapter are written
    #[arg(long, default_value = "fine_tuned_model")]
    pub output_dir: PathBuf,

    /// LoRA rank
    #[arg(long, default_value_t = 4)]
    pub rank: usize,

    /// LoRA alpha, the merge scale is alpha / rank
    #[arg(long, default_value_t = 4.0)]
    pub alpha: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    /// Optimizer steps are taken every this many examples
    #[arg(long, default_value_t = 4)]
    pub grad_accum: usize,

    /// Save a checkpoint every this many epochs
    #[arg(long, default_value_t = 10)]
    pub save_every: usize,

    #[arg(long, default_value_t = 512)]
    pub resolution: u32,

    /// Seed for example order and timestep sampling
    #[arg(long)]
    pub seed: Option<u64>,
}

pub fn run(args: TrainArgs) -> Result<()> {
    let device = select_best_device(if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    })?;
    let version = SdVersion::from_name(&args.model)?;
    let dataset = TrainingSet::load(&args.images_dir, &args.captions_file, args.resolution)?;

    // Training runs in f32 regardless of device.
    let files = SdFiles::fetch(version, false)?;
    let sd_config = version.sd_config(None);
    let embedder = TextEmbedder::new(
        &files.tokenizer,
        &files.clip_weights,
        &sd_config.clip,
        &device,
        DType::F32,
    )?;
    let vae = sd_config.build_vae(&files.vae_weights, &device, DType::F32)?;

    let loaded = candle_core::safetensors::load(&files.unet_weights, &device)
        .with_context(|| format!("failed to load {}", files.unet_weights.display()))?;
    let mut base: HashMap<String, Tensor> = HashMap::new();
    for (name, tensor) in loaded {
        base.insert(name, tensor.to_dtype(DType::F32)?);
    }

    let patterns = default_target_patterns();
    let targets = match_targets(base.keys().map(String::as_str), &patterns);
    if targets.is_empty() {
        bail!("no UNet weights match the adapter target patterns");
    }
    info!(layers = targets.len(), rank = args.rank, "injecting LoRA adapters");

    let varmap = VarMap::new();
    let scale = args.alpha / args.rank as f64;
    let mut adapters = Vec::new();
    for target in &targets {
        let layer = target.trim_end_matches(".weight");
        let (out_dim, in_dim) = base[target].dims2()?;
        let down = varmap.get(
            (args.rank, in_dim),
            &format!("{layer}.lora_down"),
            Init::Randn {
                mean: 0.0,
                stdev: 1.0 / args.rank as f64,
            },
            DType::F32,
            &device,
        )?;
        let up = varmap.get(
            (out_dim, args.rank),
            &format!("{layer}.lora_up"),
            Init::Const(0.0),
            DType::F32,
            &device,
        )?;
        adapters.push((target.clone(), down, up));
    }

    // The composed tensors keep their autograd edge to the adapter vars, the
    // plain base tensors contribute no gradients.
    let mut composed = base.clone();
    for (target, down, up) in &adapters {
        let delta = (up.matmul(down)? * scale)?;
        composed.insert(target.clone(), (&base[target] + delta)?);
    }
    let vb = VarBuilder::from_tensors(composed, DType::F32, &device);
    let unet = UNet2DConditionModel::new(vb, 4, 4, false, version.unet_config(None))?;

    let mut opt = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: args.learning_rate,
            ..Default::default()
        },
    )?;
    let schedule = NoiseSchedule::scaled_linear();
    let mut rng = StdRng::seed_from_u64(args.seed.unwrap_or_else(rand::random));

    let adapter_config = AdapterConfig {
        base_model: args.model.clone(),
        rank: args.rank,
        alpha: args.alpha,
        target_patterns: patterns,
        learning_rate: args.learning_rate,
        epochs: args.epochs,
        resolution: args.resolution,
    };

    info!(
        epochs = args.epochs,
        examples = dataset.len(),
        grad_accum = args.grad_accum,
        "starting training"
    );
    let mut indices: Vec<usize> = (0..dataset.len()).collect();
    for epoch in 0..args.epochs {
        indices.shuffle(&mut rng);
        let mut epoch_loss = 0f32;
        let mut pending: Vec<Tensor> = Vec::new();
        for &idx in &indices {
            let image = dataset.image_tensor(idx, &device)?;
            let latent = (vae.encode(&image)?.sample()? * VAE_SCALE)?.detach();
            let embedding = embedder.encode(&dataset.examples[idx].caption)?.detach();

            let timestep = rng.gen_range(0..schedule.len());
            let noise = Tensor::randn(0f32, 1f32, latent.dims(), &device)?;
            let noisy = schedule.add_noise(&latent, &noise, timestep)?;

            let prediction = unet.forward(&noisy, timestep as f64, &embedding)?;
            let step_loss = loss::mse(&prediction, &noise)?;
            epoch_loss += step_loss.to_vec0::<f32>()?;
            pending.push(step_loss);
            if pending.len() >= args.grad_accum {
                apply_gradients(&mut opt, &mut pending)?;
            }
        }
        if !pending.is_empty() {
            apply_gradients(&mut opt, &mut pending)?;
        }
        info!(
            epoch = epoch + 1,
            total = args.epochs,
            avg_loss = epoch_loss / dataset.len() as f32,
            "epoch finished"
        );

        if (epoch + 1) % args.save_every == 0 {
            let dir = args.output_dir.join(format!("checkpoint-{}", epoch + 1));
            write_checkpoint(&varmap, &adapter_config, &dir)?;
        }
    }

    let final_dir = args.output_dir.join("final");
    write_checkpoint(&varmap, &adapter_config, &final_dir)?;
    info!(path = %final_dir.display(), "training finished");
    Ok(())
}

fn apply_gradients(opt: &mut AdamW, pending: &mut Vec<Tensor>) -> Result<()> {
    let mut total = pending[0].clone();
    for step_loss in &pending[1..] {
        total = (total + step_loss)?;
    }
    let mean = (total / pending.len() as f64)?;
    opt.backward_step(&mean)?;
    pending.clear();
    Ok(())
}

fn write_checkpoint(varmap: &VarMap, config: &AdapterConfig, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    varmap.save(dir.join(ADAPTER_WEIGHTS_FILE))?;
    std::fs::write(
        dir.join(ADAPTER_CONFIG_FILE),
        serde_json::to_string_pretty(config)?,
    )?;
    info!(path = %dir.display(), "checkpoint saved");
    Ok(())
}
