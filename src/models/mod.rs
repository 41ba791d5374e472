//! Domain models for the curtailment pipeline.
//!
//! Canonical settlement records, the aggregates and yields derived from
//! them, and the reference data they are checked against.

pub mod aggregate;
pub mod difficulty;
pub mod settlement_record;
pub mod unit;
pub mod yield_record;

// Re-export all models for convenient access
pub use aggregate::{Scope, ScopeAggregate, YearMonth};
pub use difficulty::DifficultyEntry;
pub use settlement_record::{
    Feed, RawRow, SettlementCandidate, SettlementRecord, WriteSummary, PERIODS_PER_DAY,
};
pub use unit::UnitRegistryEntry;
pub use yield_record::{MinerProfile, YieldRecord};
