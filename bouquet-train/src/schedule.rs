//! Forward diffusion schedule used to noise latents during training. Matches
//! the scaled-linear beta schedule the SD 1.x/2.x checkpoints were trained
//! with, so the denoiser sees the same noise levels at inference time.

use anyhow::Result;
use candle_core::Tensor;

pub const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;

pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn scaled_linear() -> Self {
        let n = TRAIN_TIMESTEPS;
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0;
        for i in 0..n {
            let beta = (BETA_START.sqrt()
                + (BETA_END.sqrt() - BETA_START.sqrt()) * i as f64 / (n - 1) as f64)
                .powi(2);
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        Self { alphas_cumprod }
    }

    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// `sqrt(a_t) * latent + sqrt(1 - a_t) * noise` for cumulative alpha
    /// `a_t` at `timestep`.
    pub fn add_noise(&self, latent: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let ac = self.alphas_cumprod[timestep];
        Ok(((latent * ac.sqrt())? + (noise * (1.0 - ac).sqrt())?)?)
    }
}
