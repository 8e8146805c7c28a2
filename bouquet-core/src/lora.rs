//! LoRA adapter checkpoints: the trainer writes them, the model loader merges
//! them into the UNet weights before the model is built.
//!
//! Two on-disk formats are understood:
//! - the current format: a directory holding `adapter_config.json` (training
//!   snapshot, rank/alpha) next to `adapter_model.safetensors`;
//! - the legacy format: a bare safetensors file with the same tensor naming
//!   and no config record, where alpha is assumed equal to rank.
//!
//! Tensors are stored as `<layer>.lora_down` / `<layer>.lora_up` pairs keyed
//! by the UNet layer they adapt; the merged weight is
//! `W + (alpha / rank) * (up @ down)`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const LORA_DOWN_SUFFIX: &str = ".lora_down";
const LORA_UP_SUFFIX: &str = ".lora_up";

/// UNet layers that receive low-rank deltas. Kept as data so a checkpoint can
/// carry its own pattern set; these defaults cover the self- and
/// cross-attention projections of every transformer block.
pub fn default_target_patterns() -> Vec<String> {
    [
        "attn1.to_q",
        "attn1.to_k",
        "attn1.to_v",
        "attn1.to_out.0",
        "attn2.to_q",
        "attn2.to_k",
        "attn2.to_v",
        "attn2.to_out.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Training-config record persisted next to the adapter weights.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdapterConfig {
    pub base_model: String,
    pub rank: usize,
    pub alpha: f64,
    #[serde(default = "default_target_patterns")]
    pub target_patterns: Vec<String>,
    pub learning_rate: f64,
    pub epochs: usize,
    pub resolution: u32,
}

impl AdapterConfig {
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

#[derive(Debug)]
pub struct LoraPair {
    pub down: Tensor,
    pub up: Tensor,
}

/// An adapter loaded into memory, ready to be merged into a weight map.
#[derive(Debug)]
pub struct LoraAdapter {
    layers: HashMap<String, LoraPair>,
    scale: f64,
}

impl LoraAdapter {
    /// Pairs up `*.lora_down` / `*.lora_up` tensors. Orphaned halves are
    /// dropped with a warning; a checkpoint with no complete pair is an error.
    pub fn from_tensors(tensors: HashMap<String, Tensor>, scale: f64) -> Result<Self> {
        let mut downs: HashMap<String, Tensor> = HashMap::new();
        let mut ups: HashMap<String, Tensor> = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(layer) = name.strip_suffix(LORA_DOWN_SUFFIX) {
                downs.insert(layer.to_string(), tensor);
            } else if let Some(layer) = name.strip_suffix(LORA_UP_SUFFIX) {
                ups.insert(layer.to_string(), tensor);
            } else {
                warn!(tensor = %name, "unrecognized tensor in adapter checkpoint");
            }
        }

        let mut layers = HashMap::new();
        for (layer, down) in downs {
            match ups.remove(&layer) {
                Some(up) => {
                    layers.insert(layer, LoraPair { down, up });
                }
                None => warn!(layer = %layer, "lora_down without matching lora_up"),
            }
        }
        for layer in ups.keys() {
            warn!(layer = %layer, "lora_up without matching lora_down");
        }

        if layers.is_empty() {
            bail!("adapter checkpoint contains no complete LoRA weight pair");
        }
        Ok(Self { layers, scale })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Merges the low-rank deltas into `weights` in place and returns how
    /// many layers were touched. Layers with no matching weight are skipped
    /// with a warning so a checkpoint from a different base model degrades
    /// instead of aborting.
    pub fn apply(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        let mut merged = 0;
        for (layer, pair) in &self.layers {
            let target = format!("{layer}.weight");
            let Some(base) = weights.get(&target) else {
                warn!(layer = %layer, "no UNet weight matches this adapter layer");
                continue;
            };
            let delta = (pair
                .up
                .to_dtype(DType::F32)?
                .matmul(&pair.down.to_dtype(DType::F32)?)?
                * self.scale)?;
            let updated = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(target, updated);
            merged += 1;
        }
        Ok(merged)
    }
}

/// Where the loader looks for a fine-tuned adapter.
#[derive(Debug, Clone)]
pub struct AdapterPaths {
    pub adapter_dir: PathBuf,
    pub legacy_weights: PathBuf,
}

type Strategy = fn(&AdapterPaths, &Device) -> Result<Option<LoraAdapter>>;

/// Tries each checkpoint format in order of preference. Absence and failure
/// both fall through to the next strategy; if every strategy comes up empty
/// the caller serves the base model.
pub fn load_adapter(paths: &AdapterPaths, device: &Device) -> Option<LoraAdapter> {
    let strategies: [(&str, Strategy); 2] = [
        ("adapter directory", try_adapter_dir),
        ("legacy weights file", try_legacy_file),
    ];
    for (format, strategy) in strategies {
        match strategy(paths, device) {
            Ok(Some(adapter)) => {
                info!(
                    format,
                    layers = adapter.layer_count(),
                    scale = adapter.scale(),
                    "loaded fine-tuned adapter"
                );
                return Some(adapter);
            }
            Ok(None) => debug!(format, "no checkpoint in this format"),
            Err(e) => warn!(format, error = %e, "adapter checkpoint could not be loaded"),
        }
    }
    info!("no usable fine-tuned adapter, serving the base model");
    None
}

fn try_adapter_dir(paths: &AdapterPaths, device: &Device) -> Result<Option<LoraAdapter>> {
    let config_path = paths.adapter_dir.join(ADAPTER_CONFIG_FILE);
    if !config_path.exists() {
        return Ok(None);
    }
    let config_text = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let config: AdapterConfig = serde_json::from_str(&config_text)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    let weights_path = paths.adapter_dir.join(ADAPTER_WEIGHTS_FILE);
    let tensors = candle_core::safetensors::load(&weights_path, device)
        .with_context(|| format!("failed to load {}", weights_path.display()))?;
    LoraAdapter::from_tensors(tensors, config.scale()).map(Some)
}

fn try_legacy_file(paths: &AdapterPaths, device: &Device) -> Result<Option<LoraAdapter>> {
    if !paths.legacy_weights.exists() {
        return Ok(None);
    }
    let tensors = candle_core::safetensors::load(&paths.legacy_weights, device)
        .with_context(|| format!("failed to load {}", paths.legacy_weights.display()))?;
    // Legacy checkpoints carry no config record; alpha is assumed = rank.
    LoraAdapter::from_tensors(tensors, 1.0).map(Some)
}

/// Names of the weights the given patterns select, sorted for deterministic
/// iteration. Used by the trainer to decide where to inject adapters.
pub fn match_targets<'a>(
    names: impl Iterator<Item = &'a str>,
    patterns: &[String],
) -> Vec<String> {
    let mut matched: Vec<String> = names
        .filter(|name| {
            patterns
                .iter()
                .any(|p| name.ends_with(&format!("{p}.weight")))
        })
        .map(str::to_string)
        .collect();
    matched.sort();
    matched
}
