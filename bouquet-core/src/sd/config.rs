//! Supported Stable Diffusion versions and their per-version model configs.

use anyhow::{bail, Result};
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModelConfig,
};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    /// Resolves a model id (or a short alias) to a version. SDXL is in the
    /// catalog for clients to discover but needs dual text encoders, so
    /// asking for it is an explicit error rather than a silent downgrade.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "runwayml/stable-diffusion-v1-5" | "v1-5" | "1.5" => Ok(Self::V1_5),
            "stabilityai/stable-diffusion-2-1" | "v2-1" | "2.1" => Ok(Self::V2_1),
            "stabilityai/stable-diffusion-xl-base-1.0" => bail!(
                "SDXL requires dual text encoders which this server does not implement, \
                 use stable-diffusion-v1-5 or stable-diffusion-2-1"
            ),
            other => bail!(
                "unknown model `{other}`, supported: runwayml/stable-diffusion-v1-5, \
                 stabilityai/stable-diffusion-2-1"
            ),
        }
    }

    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "runwayml/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    /// Both supported versions share the CLIP BPE vocabulary.
    pub fn tokenizer_repo(&self) -> &'static str {
        "openai/clip-vit-base-patch32"
    }

    pub fn sd_config(&self, sliced_attention: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention, None, None),
        }
    }

    /// UNet config matching the published checkpoints. Spelled out here
    /// because the UNet is built from an in-memory weight map (after the
    /// adapter merge) rather than straight from the safetensors file.
    pub fn unet_config(&self, sliced_attention: Option<usize>) -> UNet2DConditionModelConfig {
        let block = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        match self {
            Self::V1_5 => UNet2DConditionModelConfig {
                blocks: vec![
                    block(320, Some(1), 8),
                    block(640, Some(1), 8),
                    block(1280, Some(1), 8),
                    block(1280, None, 8),
                ],
                cross_attention_dim: 768,
                use_linear_projection: false,
                sliced_attention_size: sliced_attention,
                ..Default::default()
            },
            Self::V2_1 => UNet2DConditionModelConfig {
                blocks: vec![
                    block(320, Some(1), 5),
                    block(640, Some(1), 10),
                    block(1280, Some(1), 20),
                    block(1280, None, 20),
                ],
                cross_attention_dim: 1024,
                use_linear_projection: true,
                sliced_attention_size: sliced_attention,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_repo_ids_and_aliases() {
        assert_eq!(
            SdVersion::from_name("runwayml/stable-diffusion-v1-5").unwrap(),
            SdVersion::V1_5
        );
        assert_eq!(SdVersion::from_name("v2-1").unwrap(), SdVersion::V2_1);
    }

    #[test]
    fn sdxl_is_an_explicit_error() {
        let err = SdVersion::from_name("stabilityai/stable-diffusion-xl-base-1.0").unwrap_err();
        assert!(err.to_string().contains("SDXL"));
    }

    #[test]
    fn unknown_model_names_the_supported_ones() {
        let err = SdVersion::from_name("acme/mystery-model").unwrap_err();
        assert!(err.to_string().contains("stable-diffusion-v1-5"));
    }

    #[test]
    fn unet_configs_match_published_checkpoints() {
        let v1 = SdVersion::V1_5.unet_config(None);
        assert_eq!(v1.cross_attention_dim, 768);
        assert!(!v1.use_linear_projection);
        assert_eq!(v1.blocks.len(), 4);
        assert_eq!(v1.blocks[3].use_cross_attn, None);

        let v2 = SdVersion::V2_1.unet_config(Some(128));
        assert_eq!(v2.cross_attention_dim, 1024);
        assert!(v2.use_linear_projection);
        assert_eq!(v2.blocks[2].attention_head_dim, 20);
        assert_eq!(v2.sliced_attention_size, Some(128));
    }
}
