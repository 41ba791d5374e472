//! Per-record yield under each miner model

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DifficultyFallback;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{DifficultyEntry, MinerProfile, SettlementRecord, YieldRecord};
use crate::repositories::{DifficultyRepository, SettlementRepository, YieldRepository};

/// Length of one settlement period in hours
pub const PERIOD_HOURS: f64 = 0.5;
/// Blocks expected in a 30 minute period at a 10 minute target
pub const BLOCKS_PER_PERIOD: f64 = 3.0;
/// Bitcoin block subsidy after the 2024 halving
pub const DEFAULT_BLOCK_REWARD: f64 = 3.125;

const HASHES_PER_DIFFICULTY: f64 = 4_294_967_296.0;
const TARGET_BLOCK_SECS: f64 = 600.0;
const HASHES_PER_TH: f64 = 1e12;

/// Pure yield function
#[derive(Debug, Clone, Copy)]
pub struct YieldCalculator {
    block_reward: f64,
}

impl Default for YieldCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_REWARD)
    }
}

impl YieldCalculator {
    pub fn new(block_reward: f64) -> Self {
        Self { block_reward }
    }

    /// Network hashrate implied by `difficulty`, TH/s
    pub fn network_hashrate_th(difficulty: f64) -> f64 {
        difficulty * HASHES_PER_DIFFICULTY / TARGET_BLOCK_SECS / HASHES_PER_TH
    }

    /// BTC mined in one period by a fleet drawing `energy_mwh`.
    ///
    /// Increases with energy, decreases with difficulty.
    pub fn yield_for_energy(&self, energy_mwh: f64, profile: &MinerProfile, difficulty: f64) -> f64 {
        let fleet_power_kw = energy_mwh * 1000.0 / PERIOD_HOURS;
        let fleet_hashrate_th = fleet_power_kw * profile.efficiency();
        let share = fleet_hashrate_th / Self::network_hashrate_th(difficulty);
        share * self.block_reward * BLOCKS_PER_PERIOD
    }

    /// Yield of one record; fails when no usable difficulty is given
    pub fn compute_for_record(
        &self,
        record: &SettlementRecord,
        profile: &MinerProfile,
        difficulty: Option<f64>,
    ) -> PipelineResult<YieldRecord> {
        let difficulty = match difficulty {
            Some(d) if d.is_finite() && d > 0.0 => d,
            _ => {
                return Err(PipelineError::MissingParameter {
                    date: record.settlement_date,
                })
            }
        };

        Ok(YieldRecord {
            settlement_date: record.settlement_date,
            settlement_period: record.settlement_period,
            unit_id: record.unit_id.clone(),
            miner_model: profile.name.clone(),
            yield_amount: self.yield_for_energy(record.energy(), profile, difficulty),
            difficulty,
            calculated_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct YieldSummary {
    pub date: NaiveDate,
    pub records: usize,
    pub profiles: usize,
    pub written: u64,
    pub difficulty: Option<f64>,
}

/// Derives and stores yields for whole dates
pub struct YieldService {
    calculator: YieldCalculator,
    profiles: Vec<MinerProfile>,
    fallback: DifficultyFallback,
    settlement_repo: Arc<SettlementRepository>,
    yield_repo: Arc<YieldRepository>,
    difficulty_repo: Arc<DifficultyRepository>,
}

impl YieldService {
    pub fn new(
        calculator: YieldCalculator,
        profiles: Vec<MinerProfile>,
        fallback: DifficultyFallback,
        settlement_repo: Arc<SettlementRepository>,
        yield_repo: Arc<YieldRepository>,
        difficulty_repo: Arc<DifficultyRepository>,
    ) -> Self {
        Self {
            calculator,
            profiles,
            fallback,
            settlement_repo,
            yield_repo,
            difficulty_repo,
        }
    }

    pub fn profiles(&self) -> &[MinerProfile] {
        &self.profiles
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }

    /// Difficulty for `date`, honouring the configured fallback
    pub async fn difficulty_for(&self, date: NaiveDate) -> PipelineResult<Option<f64>> {
        if let Some(entry) = self.difficulty_repo.get(date).await? {
            return Ok(Some(entry.difficulty));
        }
        if self.fallback == DifficultyFallback::LastKnown {
            if let Some(entry) = self.difficulty_repo.latest_on_or_before(date).await? {
                warn!(
                    %date,
                    from = %entry.difficulty_date,
                    difficulty = entry.difficulty,
                    "Using last known difficulty"
                );
                return Ok(Some(entry.difficulty));
            }
        }
        Ok(None)
    }

    /// Record a new difficulty for `date` and restate that date's yields.
    ///
    /// Later dates that borrowed an earlier value under `LastKnown` are left
    /// for reconciliation to restate.
    pub async fn apply_difficulty(
        &self,
        date: NaiveDate,
        difficulty: f64,
    ) -> PipelineResult<(DifficultyEntry, YieldSummary)> {
        let entry = self.difficulty_repo.set(date, difficulty).await?;
        let summary = self.process_date(date).await?;
        info!(
            %date,
            difficulty = entry.difficulty,
            restated = summary.written,
            "Difficulty applied"
        );
        Ok((entry, summary))
    }

    /// Recompute every yield of `date`, overwriting what is stored
    pub async fn process_date(&self, date: NaiveDate) -> PipelineResult<YieldSummary> {
        let records = self.settlement_repo.find_by_date(date).await?;
        self.derive(date, records, |_, _| true).await
    }

    /// Compute only the (record, model) pairs that have no stored yield
    pub async fn fill_missing(&self, date: NaiveDate) -> PipelineResult<YieldSummary> {
        let records = self.settlement_repo.find_by_date(date).await?;
        let existing = self.yield_repo.keys_by_date(date).await?;
        self.derive(date, records, |record, profile| {
            !existing.contains(&(
                record.settlement_period,
                record.unit_id.clone(),
                profile.name.clone(),
            ))
        })
        .await
    }

    async fn derive<F>(
        &self,
        date: NaiveDate,
        records: Vec<SettlementRecord>,
        wanted: F,
    ) -> PipelineResult<YieldSummary>
    where
        F: Fn(&SettlementRecord, &MinerProfile) -> bool,
    {
        let pairs: Vec<(&SettlementRecord, &MinerProfile)> = records
            .iter()
            .flat_map(|r| self.profiles.iter().map(move |p| (r, p)))
            .filter(|(r, p)| wanted(*r, *p))
            .collect();

        let mut summary = YieldSummary {
            date,
            records: records.len(),
            profiles: self.profiles.len(),
            written: 0,
            difficulty: None,
        };
        if pairs.is_empty() {
            return Ok(summary);
        }

        let difficulty = self.difficulty_for(date).await?;
        summary.difficulty = difficulty;

        let yields = pairs
            .into_iter()
            .map(|(record, profile)| self.calculator.compute_for_record(record, profile, difficulty))
            .collect::<PipelineResult<Vec<_>>>()?;

        summary.written = self.yield_repo.upsert_many(&yields).await?;
        info!(
            %date,
            records = summary.records,
            profiles = summary.profiles,
            written = summary.written,
            "Yields derived"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(volume: f64) -> SettlementRecord {
        SettlementRecord {
            settlement_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            settlement_period: 18,
            unit_id: "T_WHILW-1".into(),
            volume,
            payment: volume.abs() * 40.0,
            original_price: 40.0,
            final_price: 40.0,
            so_flag: true,
            cadl_flag: false,
            lead_party_name: None,
            ingested_at: Utc::now(),
        }
    }

    const DIFFICULTY: f64 = 83_148_355_189_239.0;

    #[test]
    fn test_missing_difficulty_is_an_error() {
        let calc = YieldCalculator::default();
        let profile = MinerProfile::by_name("S19J_PRO").unwrap();
        for bad in [None, Some(0.0), Some(-1.0), Some(f64::NAN)] {
            let result = calc.compute_for_record(&record(-10.0), &profile, bad);
            assert!(matches!(result, Err(PipelineError::MissingParameter { .. })));
        }
    }

    #[test]
    fn test_yield_matches_reference_value() {
        let calc = YieldCalculator::default();
        let profile = MinerProfile::by_name("S19J_PRO").unwrap();
        let y = calc
            .compute_for_record(&record(-10.0), &profile, Some(DIFFICULTY))
            .unwrap();

        // 20 MW of S19J Pro machines against ~595 EH/s
        let expected = (20_000.0 * (100.0 / 3.05)) / (DIFFICULTY * 4_294_967_296.0 / 600.0 / 1e12)
            * 3.125
            * 3.0;
        assert!((y.yield_amount - expected).abs() < 1e-12);
        assert_eq!(y.miner_model, "S19J_PRO");
        assert_eq!(y.difficulty, DIFFICULTY);
    }

    #[test]
    fn test_yield_monotonic_in_volume_and_difficulty() {
        let calc = YieldCalculator::default();
        let profile = MinerProfile::by_name("M20S").unwrap();

        let small = calc.yield_for_energy(5.0, &profile, DIFFICULTY);
        let large = calc.yield_for_energy(50.0, &profile, DIFFICULTY);
        assert!(large > small);

        let harder = calc.yield_for_energy(5.0, &profile, DIFFICULTY * 2.0);
        assert!(harder < small);
    }

    #[test]
    fn test_more_efficient_profile_yields_more() {
        let calc = YieldCalculator::default();
        let s19 = MinerProfile::by_name("S19J_PRO").unwrap();
        let s9 = MinerProfile::by_name("S9").unwrap();
        assert!(
            calc.yield_for_energy(10.0, &s19, DIFFICULTY) > calc.yield_for_energy(10.0, &s9, DIFFICULTY)
        );
    }
}
