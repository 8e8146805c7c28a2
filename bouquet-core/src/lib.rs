pub mod bouquet;
pub mod catalog;
pub mod device;
pub mod lora;
pub mod prompt;
pub mod sd;

mod util;

pub use bouquet::*;
pub use device::*;
use image::DynamicImage;
pub use sd::{load_model, ModelConfig, SdVersion};
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

fn default_steps() -> usize {
    30
}

fn default_guidance() -> f64 {
    7.5
}

fn default_side() -> usize {
    1024
}

/// Wire format of a generation request: the bouquet description plus the
/// sampling parameters. Every field falls back to a sensible default so a
/// minimal (or even empty) JSON body is accepted.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GenerationRequest {
    #[serde(flatten)]
    pub bouquet: BouquetSpec,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance: f64,
    #[serde(default = "default_side")]
    pub width: usize,
    #[serde(default = "default_side")]
    pub height: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Resolve the request into the concrete job handed to the model.
    pub fn to_job(&self) -> GenerationJob {
        let prompt = prompt::build_prompt(&self.bouquet);
        GenerationJob {
            positive: prompt.positive,
            negative: prompt.negative,
            steps: self.steps,
            guidance: self.guidance,
            width: self.width,
            height: self.height,
            seed: self.seed,
        }
    }
}

/// Fully resolved generation parameters: prompts already built, defaults
/// already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJob {
    pub positive: String,
    pub negative: String,
    pub steps: usize,
    pub guidance: f64,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

/// A loaded text-to-image model. The server holds one of these per process
/// behind a mutex; tests substitute a stub.
pub trait TextToImage: Send + Sync {
    fn generate(&self, job: &GenerationJob) -> anyhow::Result<DynamicImage>;
}
