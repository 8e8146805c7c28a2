//! Turns a [`BouquetSpec`] into the positive/negative prompt pair fed to the
//! diffusion model. Pure string assembly, no failure modes: anything missing
//! falls back to a default phrase.

use crate::bouquet::{Accessory, BouquetSpec, PackagingType};

const BRAND: &str = "Bexy Flowers";

/// Fallback when no flower line has a positive quantity.
const MIXED_FLOWERS: &str = "beautiful mixed flowers";

/// The training photos show flower heads only, so foliage is pushed away from
/// both ends: excluded in the negative prompt and called out in the positive.
const STYLE_SUFFIX: &str = "Just the flower heads arranged beautifully, NO leaves, NO stems, \
     NO green foliage, only flower petals and blooms. \
     Professional product photography, white background, studio lighting, \
     high quality, sharp focus, commercial photo, luxury floral arrangement";

const NEGATIVE_FOLIAGE: &str = "leaves, stems, green foliage, plant stems, leaf, leaves, stem, stalks, \
     green leaves, visible stems, visible leaves, plant leaves, foliage, \
     greenery, green parts, stem visible, leaves visible";

const NEGATIVE_ARTIFACTS: &str = "ugly, blurry, low quality, deformed, disfigured, bad anatomy, \
     poorly drawn, watermark, signature, text, dark background, \
     messy, wilted flowers, amateur photo, low resolution";

/// A built prompt pair. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub positive: String,
    pub negative: String,
}

pub fn build_prompt(spec: &BouquetSpec) -> Prompt {
    let flower_text = flower_clause(spec);
    let packaging_text = packaging_clause(spec);
    let accessory_text = accessory_clause(spec);
    let glitter_text = if spec.glitter {
        ". Sparkly glitter on the flower petals"
    } else {
        ""
    };
    let refinement = spec.refinement.trim();
    let refinement_text = if refinement.is_empty() {
        String::new()
    } else {
        format!(". {refinement}")
    };

    let positive = format!(
        "A beautiful flower bouquet with {flower_text}, {packaging_text}{accessory_text}{glitter_text}. \
         {STYLE_SUFFIX}{refinement_text}"
    );
    let negative = format!("{NEGATIVE_FOLIAGE}, {NEGATIVE_ARTIFACTS}");

    Prompt { positive, negative }
}

fn flower_clause(spec: &BouquetSpec) -> String {
    let described: Vec<String> = spec
        .flowers
        .iter()
        .filter(|f| f.quantity > 0)
        .map(|f| format!("{} {} {}", f.quantity, f.color, f.kind))
        .collect();
    if described.is_empty() {
        MIXED_FLOWERS.to_string()
    } else {
        described.join(" and ")
    }
}

fn packaging_clause(spec: &BouquetSpec) -> String {
    match spec.packaging_type {
        PackagingType::Box => format!(
            "in a {} {}-shaped luxury gift box with '{BRAND}' elegant logo printed on it",
            spec.box_color, spec.box_shape
        ),
        PackagingType::Wrap => format!(
            "wrapped in {} decorative wrapping paper with '{BRAND}' branding",
            spec.wrap_color
        ),
    }
}

fn accessory_clause(spec: &BouquetSpec) -> String {
    // Fixed rendering order, independent of the order on the wire.
    let ordered = [
        (Accessory::Crown, "a decorative crown on top"),
        (Accessory::Teddy, "a cute teddy bear"),
        (Accessory::Chocolates, "a box of luxury chocolates"),
        (Accessory::Card, "a greeting card"),
    ];
    let present: Vec<&str> = ordered
        .iter()
        .filter(|(acc, _)| spec.has_accessory(*acc))
        .map(|(_, text)| *text)
        .collect();
    if present.is_empty() {
        String::new()
    } else {
        format!(", with {}", present.join(" and "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bouquet::FlowerLine;
    use rstest::rstest;

    fn flower(kind: &str, color: &str, quantity: u32) -> FlowerLine {
        FlowerLine {
            kind: kind.to_string(),
            color: color.to_string(),
            quantity,
        }
    }

    #[test]
    fn each_flower_appears_exactly_once_joined_by_and() {
        let spec = BouquetSpec {
            flowers: vec![flower("roses", "red", 5), flower("tulips", "yellow", 3)],
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert_eq!(prompt.positive.matches("5 red roses").count(), 1);
        assert_eq!(prompt.positive.matches("3 yellow tulips").count(), 1);
        assert!(prompt.positive.contains("5 red roses and 3 yellow tulips"));
    }

    #[test]
    fn zero_quantity_flowers_are_skipped() {
        let spec = BouquetSpec {
            flowers: vec![flower("roses", "red", 5), flower("lilies", "white", 0)],
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert!(prompt.positive.contains("5 red roses"));
        assert!(!prompt.positive.contains("lilies"));
    }

    #[test]
    fn empty_flower_list_uses_fallback_phrase() {
        let prompt = build_prompt(&BouquetSpec::default());
        assert!(prompt.positive.contains("beautiful mixed flowers"));
    }

    #[test]
    fn box_packaging_mentions_color_and_shape() {
        let spec = BouquetSpec {
            packaging_type: PackagingType::Box,
            box_color: "black".to_string(),
            box_shape: "circle".to_string(),
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert!(prompt.positive.contains("black circle-shaped luxury gift box"));
    }

    #[test]
    fn wrap_packaging_mentions_wrap_color_and_never_box_fields() {
        let spec = BouquetSpec {
            packaging_type: PackagingType::Wrap,
            box_color: "obsidian".to_string(),
            box_shape: "hexagon".to_string(),
            wrap_color: "lavender".to_string(),
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert!(prompt.positive.contains("lavender decorative wrapping paper"));
        assert!(!prompt.positive.contains("obsidian"));
        assert!(!prompt.positive.contains("hexagon"));
    }

    #[rstest]
    #[case(vec![Accessory::Crown], ", with a decorative crown on top")]
    #[case(vec![Accessory::Card, Accessory::Teddy], ", with a cute teddy bear and a greeting card")]
    #[case(
        vec![Accessory::Chocolates, Accessory::Crown, Accessory::Teddy, Accessory::Card],
        ", with a decorative crown on top and a cute teddy bear and a box of luxury chocolates and a greeting card"
    )]
    fn accessories_render_in_fixed_order(
        #[case] accessories: Vec<Accessory>,
        #[case] expected: &str,
    ) {
        let spec = BouquetSpec {
            accessories,
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert!(prompt.positive.contains(expected), "missing `{expected}` in `{}`", prompt.positive);
    }

    #[test]
    fn glitter_appends_fixed_sentence() {
        let spec = BouquetSpec {
            glitter: true,
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert!(prompt.positive.contains("Sparkly glitter on the flower petals"));
    }

    #[test]
    fn refinement_is_appended_verbatim() {
        let spec = BouquetSpec {
            refinement: "  make the roses bigger ".to_string(),
            ..Default::default()
        };
        let prompt = build_prompt(&spec);
        assert!(prompt.positive.ends_with(". make the roses bigger"));
    }

    #[test]
    fn negative_prompt_is_constant_across_specs() {
        let plain = build_prompt(&BouquetSpec::default());
        let busy = build_prompt(&BouquetSpec {
            packaging_type: PackagingType::Wrap,
            flowers: vec![flower("peonies", "pink", 12)],
            accessories: vec![Accessory::Crown, Accessory::Chocolates],
            glitter: true,
            refinement: "extra sparkle".to_string(),
            ..Default::default()
        });
        assert_eq!(plain.negative, busy.negative);
        assert!(plain.negative.contains("green foliage"));
        assert!(plain.negative.contains("watermark"));
    }
}
