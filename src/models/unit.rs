use serde::{Deserialize, Serialize};

/// Category label carried by wind generating units
pub const WIND_CATEGORY: &str = "WIND";

/// Static reference data for a balancing mechanism unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRegistryEntry {
    #[serde(rename = "elexonBmUnit", alias = "unitId")]
    pub unit_id: String,
    #[serde(rename = "fuelType", alias = "category")]
    pub category: String,
    #[serde(rename = "leadPartyName", alias = "ownerName", default)]
    pub lead_party_name: String,
}

impl UnitRegistryEntry {
    pub fn new(unit_id: &str, category: &str, lead_party_name: &str) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            category: category.to_string(),
            lead_party_name: lead_party_name.to_string(),
        }
    }

    pub fn is_wind(&self) -> bool {
        self.category.eq_ignore_ascii_case(WIND_CATEGORY)
    }
}
