pub mod aggregation;
pub mod audit;
pub mod filter;
pub mod ingestion;
pub mod reconciliation;
pub mod yield_calculator;

pub use aggregation::AggregationEngine;
pub use audit::AuditTrailService;
pub use filter::{FilterOutcome, RecordFilter, RejectCounts};
pub use ingestion::{IngestionReport, IngestionService, IngestionWriter};
pub use reconciliation::{
    Gap, ReconciliationAuditor, ReconciliationReport, RepairLog, ScanReport, Verdict,
};
pub use yield_calculator::{YieldCalculator, YieldService, YieldSummary};
