//! Domain types for a bouquet order as it arrives on the wire.

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackagingType {
    #[default]
    Box,
    Wrap,
}

serde_plain::derive_display_from_serialize!(PackagingType);
serde_plain::derive_fromstr_from_deserialize!(PackagingType);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Accessory {
    Crown,
    Teddy,
    Chocolates,
    Card,
}

serde_plain::derive_display_from_serialize!(Accessory);
serde_plain::derive_fromstr_from_deserialize!(Accessory);

/// One flower entry of the order: `{"type": "roses", "color": "red", "quantity": 5}`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FlowerLine {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub quantity: u32,
}

/// Structured bouquet description. Created per request, never persisted.
/// Missing fields fall back to defaults rather than erroring.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BouquetSpec {
    pub packaging_type: PackagingType,
    pub box_color: String,
    pub box_shape: String,
    pub wrap_color: String,
    pub flowers: Vec<FlowerLine>,
    pub accessories: Vec<Accessory>,
    pub glitter: bool,
    pub refinement: String,
}

impl Default for BouquetSpec {
    fn default() -> Self {
        Self {
            packaging_type: PackagingType::Box,
            box_color: "red".to_string(),
            box_shape: "heart".to_string(),
            wrap_color: "pink".to_string(),
            flowers: Vec::new(),
            accessories: Vec::new(),
            glitter: false,
            refinement: String::new(),
        }
    }
}

impl BouquetSpec {
    pub fn has_accessory(&self, accessory: Accessory) -> bool {
        self.accessories.contains(&accessory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaging_type_round_trips_as_plain_string() {
        assert_eq!(PackagingType::Wrap.to_string(), "wrap");
        assert_eq!("box".parse::<PackagingType>().unwrap(), PackagingType::Box);
    }

    #[test]
    fn flower_line_uses_type_on_the_wire() {
        let line: FlowerLine =
            serde_json::from_str(r#"{"type": "tulips", "color": "yellow", "quantity": 3}"#)
                .unwrap();
        assert_eq!(line.kind, "tulips");
        assert_eq!(line.quantity, 3);
    }

    #[test]
    fn negative_quantity_is_rejected() {
        let res = serde_json::from_str::<FlowerLine>(r#"{"type": "roses", "quantity": -1}"#);
        assert!(res.is_err());
    }
}
