//! Classification of raw upstream rows into curtailment candidates

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{RawRow, SettlementCandidate};
use crate::registry::UnitRegistry;

/// Why rows were dropped, by first failing rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectCounts {
    /// Volume zero or positive
    pub not_curtailment: usize,
    /// Neither status flag set
    pub unflagged: usize,
    /// Unit unknown or not a wind unit
    pub not_wind: usize,
}

impl RejectCounts {
    pub fn total(&self) -> usize {
        self.not_curtailment + self.unflagged + self.not_wind
    }

    pub fn add(&mut self, other: &RejectCounts) {
        self.not_curtailment += other.not_curtailment;
        self.unflagged += other.unflagged;
        self.not_wind += other.not_wind;
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// One candidate per unit, ordered by unit id
    pub candidates: Vec<SettlementCandidate>,
    pub accepted_rows: usize,
    pub rejected: RejectCounts,
}

/// Stateless filter; the registry is passed in per call
pub struct RecordFilter;

impl RecordFilter {
    /// Payment for one accepted row, always a non-negative magnitude
    pub fn payment(row: &RawRow) -> f64 {
        (row.volume.abs() * row.original_price).abs()
    }

    pub fn accepts(row: &RawRow, registry: &UnitRegistry) -> bool {
        Self::reject_reason(row, registry).is_none()
    }

    fn reject_reason(row: &RawRow, registry: &UnitRegistry) -> Option<Rejection> {
        if !(row.volume < 0.0) {
            Some(Rejection::NotCurtailment)
        } else if !(row.so_flag || row.cadl_flag) {
            Some(Rejection::Unflagged)
        } else if !registry.is_wind(&row.unit_id) {
            Some(Rejection::NotWind)
        } else {
            None
        }
    }

    /// Filter the rows of one (date, period).
    ///
    /// Accepted rows for the same unit are consolidated: volumes and payments
    /// summed, flags OR-ed, the first row's prices and lead party kept.
    pub fn filter<'a>(
        rows: impl IntoIterator<Item = &'a RawRow>,
        registry: &UnitRegistry,
        date: NaiveDate,
        period: i32,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        let mut by_unit: BTreeMap<&str, SettlementCandidate> = BTreeMap::new();

        for row in rows {
            match Self::reject_reason(row, registry) {
                Some(Rejection::NotCurtailment) => outcome.rejected.not_curtailment += 1,
                Some(Rejection::Unflagged) => outcome.rejected.unflagged += 1,
                Some(Rejection::NotWind) => outcome.rejected.not_wind += 1,
                None => {
                    outcome.accepted_rows += 1;
                    let payment = Self::payment(row);
                    by_unit
                        .entry(row.unit_id.as_str())
                        .and_modify(|c| {
                            c.volume += row.volume;
                            c.payment += payment;
                            c.so_flag |= row.so_flag;
                            c.cadl_flag |= row.cadl_flag;
                            if c.lead_party_name.is_none() {
                                c.lead_party_name = row.lead_party_name.clone();
                            }
                        })
                        .or_insert_with(|| SettlementCandidate {
                            settlement_date: date,
                            settlement_period: period,
                            unit_id: row.unit_id.clone(),
                            volume: row.volume,
                            payment,
                            original_price: row.original_price,
                            final_price: row.final_price,
                            so_flag: row.so_flag,
                            cadl_flag: row.cadl_flag,
                            lead_party_name: row.lead_party_name.clone(),
                        });
                }
            }
        }

        outcome.candidates = by_unit.into_values().collect();
        outcome
    }
}

enum Rejection {
    NotCurtailment,
    Unflagged,
    NotWind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitRegistryEntry;

    fn registry() -> UnitRegistry {
        UnitRegistry::from_entries(vec![
            UnitRegistryEntry::new("T_WIND-1", "WIND", "Windco"),
            UnitRegistryEntry::new("T_WIND-2", "wind", "Windco"),
            UnitRegistryEntry::new("T_GAS-1", "CCGT", "Gasco"),
        ])
    }

    fn row(unit: &str, volume: f64, price: f64, so: bool, cadl: bool) -> RawRow {
        RawRow {
            unit_id: unit.to_string(),
            volume,
            original_price: price,
            final_price: price,
            so_flag: so,
            cadl_flag: cadl,
            lead_party_name: None,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn test_accepts_flagged_negative_wind_rows() {
        let rows = vec![
            row("T_WIND-1", -10.0, 50.0, true, false),
            row("T_WIND-2", -5.0, 40.0, false, true),
        ];
        let outcome = RecordFilter::filter(&rows, &registry(), date(), 18);

        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.rejected.total(), 0);
        assert_eq!(outcome.candidates[0].payment, 500.0);
        assert_eq!(outcome.candidates[0].settlement_period, 18);
    }

    #[test]
    fn test_rejection_reasons_are_counted() {
        let rows = vec![
            row("T_WIND-1", 10.0, 50.0, true, false),
            row("T_WIND-1", 0.0, 50.0, true, false),
            row("T_WIND-1", -10.0, 50.0, false, false),
            row("T_GAS-1", -10.0, 50.0, true, true),
            row("T_UNKNOWN", -10.0, 50.0, true, true),
        ];
        let outcome = RecordFilter::filter(&rows, &registry(), date(), 1);

        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.rejected.not_curtailment, 2);
        assert_eq!(outcome.rejected.unflagged, 1);
        assert_eq!(outcome.rejected.not_wind, 2);
    }

    #[test]
    fn test_payment_is_positive_for_negative_prices() {
        let negative = row("T_WIND-1", -8.0, -25.0, true, false);
        assert_eq!(RecordFilter::payment(&negative), 200.0);
    }

    #[test]
    fn test_rows_for_same_unit_are_consolidated() {
        let mut second = row("T_WIND-1", -4.0, 30.0, false, true);
        second.lead_party_name = Some("Windco Trading".into());
        let rows = vec![row("T_WIND-1", -6.0, 50.0, true, false), second];

        let outcome = RecordFilter::filter(&rows, &registry(), date(), 7);
        assert_eq!(outcome.accepted_rows, 2);
        assert_eq!(outcome.candidates.len(), 1);

        let merged = &outcome.candidates[0];
        assert_eq!(merged.volume, -10.0);
        assert_eq!(merged.payment, 300.0 + 120.0);
        assert!(merged.so_flag && merged.cadl_flag);
        assert_eq!(merged.original_price, 50.0);
        assert_eq!(merged.lead_party_name.as_deref(), Some("Windco Trading"));
    }
}
