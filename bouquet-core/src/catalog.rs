//! Static catalog of base models exposed on `GET /models`.

use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

const CATALOG: &[ModelInfo] = &[
    ModelInfo {
        id: "runwayml/stable-diffusion-v1-5",
        name: "Stable Diffusion 1.5",
        description: "Fast and reliable, good for general use",
    },
    ModelInfo {
        id: "stabilityai/stable-diffusion-2-1",
        name: "Stable Diffusion 2.1",
        description: "Improved quality, slightly slower",
    },
    ModelInfo {
        id: "stabilityai/stable-diffusion-xl-base-1.0",
        name: "Stable Diffusion XL",
        description: "Best quality, requires more VRAM (not loadable by this server)",
    },
];

pub fn known_models() -> &'static [ModelInfo] {
    CATALOG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_the_default_model_first() {
        let models = known_models();
        assert_eq!(models[0].id, "runwayml/stable-diffusion-v1-5");
        assert!(models.len() >= 2);
    }
}
