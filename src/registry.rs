//! Static unit registry: unit identifier to category and owning party.
//!
//! Loaded once per process and shared by reference; there is no way to
//! mutate a `UnitRegistry` after it has been built.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::UnitRegistryEntry;

/// Immutable lookup of known units
#[derive(Debug, Clone, Default)]
pub struct UnitRegistry {
    entries: HashMap<String, UnitRegistryEntry>,
}

impl UnitRegistry {
    pub fn from_entries(entries: impl IntoIterator<Item = UnitRegistryEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.unit_id.clone(), e))
                .collect(),
        }
    }

    pub fn get(&self, unit_id: &str) -> Option<&UnitRegistryEntry> {
        self.entries.get(unit_id)
    }

    /// Whether the unit is a registered wind unit
    pub fn is_wind(&self, unit_id: &str) -> bool {
        self.get(unit_id).map(|e| e.is_wind()).unwrap_or(false)
    }

    pub fn lead_party(&self, unit_id: &str) -> Option<&str> {
        self.get(unit_id)
            .map(|e| e.lead_party_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn wind_unit_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_wind()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads the registry from its JSON source
pub struct RegistryLoader;

impl RegistryLoader {
    /// Load a JSON array of unit entries from disk
    pub fn from_path(path: &Path) -> AppResult<UnitRegistry> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Registry(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let registry = Self::from_json_str(&raw)?;
        info!(
            path = %path.display(),
            units = registry.len(),
            wind_units = registry.wind_unit_count(),
            "Unit registry loaded"
        );
        Ok(registry)
    }

    pub fn from_json_str(raw: &str) -> AppResult<UnitRegistry> {
        let entries: Vec<UnitRegistryEntry> = serde_json::from_str(raw)
            .map_err(|e| AppError::Registry(format!("Invalid registry JSON: {}", e)))?;
        Ok(UnitRegistry::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"[
        {"elexonBmUnit": "T_WHILW-1", "fuelType": "WIND", "leadPartyName": "ScottishPower"},
        {"elexonBmUnit": "T_SGRWO-1", "fuelType": "wind", "leadPartyName": "SSE"},
        {"elexonBmUnit": "T_DRAXX-1", "fuelType": "BIOMASS", "leadPartyName": "Drax"}
    ]"#;

    #[test]
    fn test_wind_membership() {
        let registry = RegistryLoader::from_json_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.wind_unit_count(), 2);
        assert!(registry.is_wind("T_WHILW-1"));
        assert!(registry.is_wind("T_SGRWO-1"));
        assert!(!registry.is_wind("T_DRAXX-1"));
        assert!(!registry.is_wind("UNKNOWN"));
        assert_eq!(registry.lead_party("T_SGRWO-1"), Some("SSE"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let registry = RegistryLoader::from_path(file.path()).unwrap();
        assert_eq!(registry.wind_unit_count(), 2);
    }

    #[test]
    fn test_invalid_json_is_registry_error() {
        let err = RegistryLoader::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, AppError::Registry(_)));
    }

    #[test]
    fn test_missing_file_is_registry_error() {
        let err = RegistryLoader::from_path(Path::new("/nonexistent/registry.json")).unwrap_err();
        assert!(matches!(err, AppError::Registry(_)));
    }
}
