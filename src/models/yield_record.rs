use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A miner model: the fixed parameter set used to turn energy into yield
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerProfile {
    pub name: String,
    /// Hashrate of one machine, TH/s
    pub hashrate_th: f64,
    /// Power draw of one machine, watts
    pub power_watts: f64,
}

impl MinerProfile {
    pub fn new(name: &str, hashrate_th: f64, power_watts: f64) -> Self {
        Self {
            name: name.to_string(),
            hashrate_th,
            power_watts,
        }
    }

    /// Throughput per unit of power, TH/s per kW
    pub fn efficiency(&self) -> f64 {
        self.hashrate_th / (self.power_watts / 1000.0)
    }

    /// The built-in models
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("S19J_PRO", 100.0, 3050.0),
            Self::new("S9", 13.5, 1323.0),
            Self::new("M20S", 68.0, 3360.0),
        ]
    }

    pub fn by_name(name: &str) -> Option<Self> {
        Self::defaults()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Yield derived for one settlement record under one miner model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct YieldRecord {
    pub settlement_date: NaiveDate,
    pub settlement_period: i32,
    pub unit_id: String,
    pub miner_model: String,
    pub yield_amount: f64,
    /// Difficulty used when this yield was computed
    pub difficulty: f64,
    pub calculated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lookup_is_case_insensitive() {
        let profile = MinerProfile::by_name("s19j_pro").unwrap();
        assert_eq!(profile.name, "S19J_PRO");
        assert!(MinerProfile::by_name("S21").is_none());
    }

    #[test]
    fn test_efficiency_ranks_models() {
        let s19 = MinerProfile::by_name("S19J_PRO").unwrap();
        let s9 = MinerProfile::by_name("S9").unwrap();
        assert!(s19.efficiency() > s9.efficiency());
    }
}
