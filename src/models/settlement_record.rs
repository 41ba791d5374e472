//! Upstream rows and the canonical settlement records built from them

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// Number of half-hour settlement periods in a day
pub const PERIODS_PER_DAY: i32 = 48;

/// The two upstream settlement stack feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Bid,
    Offer,
}

impl Feed {
    pub const ALL: [Feed; 2] = [Feed::Bid, Feed::Offer];

    /// Path segment used by the upstream API
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Bid => "bid",
            Feed::Offer => "offer",
        }
    }
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// One row of an upstream settlement stack response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRow {
    #[serde(rename = "id")]
    pub unit_id: String,
    pub volume: f64,
    pub original_price: f64,
    pub final_price: f64,
    #[serde(default, deserialize_with = "null_as_false")]
    pub so_flag: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub cadl_flag: bool,
    #[serde(default)]
    pub lead_party_name: Option<String>,
}

/// A filtered row ready to be persisted.
///
/// `payment` is fixed here, at filter time, and never recomputed downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementCandidate {
    pub settlement_date: NaiveDate,
    pub settlement_period: i32,
    pub unit_id: String,
    pub volume: f64,
    pub payment: f64,
    pub original_price: f64,
    pub final_price: f64,
    pub so_flag: bool,
    pub cadl_flag: bool,
    pub lead_party_name: Option<String>,
}

/// Canonical curtailment record, unique by (date, period, unit)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub settlement_date: NaiveDate,
    pub settlement_period: i32,
    pub unit_id: String,
    /// Signed MWh, always negative for curtailment
    pub volume: f64,
    /// Positive magnitude
    pub payment: f64,
    pub original_price: f64,
    pub final_price: f64,
    pub so_flag: bool,
    pub cadl_flag: bool,
    pub lead_party_name: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl SettlementRecord {
    /// Curtailed energy in MWh
    pub fn energy(&self) -> f64 {
        self.volume.abs()
    }
}

/// What a single period write actually persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub settlement_date: NaiveDate,
    pub settlement_period: i32,
    pub record_count: usize,
    /// Sum of absolute volume
    pub total_energy: f64,
    pub total_payment: f64,
}

impl WriteSummary {
    pub fn from_candidates(
        settlement_date: NaiveDate,
        settlement_period: i32,
        candidates: &[SettlementCandidate],
    ) -> Self {
        Self {
            settlement_date,
            settlement_period,
            record_count: candidates.len(),
            total_energy: candidates.iter().map(|c| c.volume.abs()).sum(),
            total_payment: candidates.iter().map(|c| c.payment).sum(),
        }
    }
}
