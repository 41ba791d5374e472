use crate::error::{AppError, AppResult};
use crate::models::ScopeAggregate;
use crate::services::ingestion::IngestionReport;
use crate::services::reconciliation::ReconciliationReport;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: i64,
    pub run_id: Uuid,
    pub event_type: String, // "period_ingested", "aggregate_recomputed", "scope_reconciled", etc.
    pub scope: Option<String>,
    pub details: serde_json::Value,
}

/// Append-only JSON-lines trail of everything a run changed
pub struct AuditTrailService {
    run_id: Uuid,
    log_file: PathBuf,
    file_handle: Arc<Mutex<std::fs::File>>,
}

impl AuditTrailService {
    /// Create a new audit trail service
    pub fn new(log_directory: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&log_directory).map_err(|e| {
            AppError::Config(format!("Failed to create audit log directory: {}", e))
        })?;

        let date = chrono::Utc::now().format("%Y-%m-%d");
        let log_file = log_directory.join(format!("audit_{}.log", date));

        let file = OpenOptions::new().create(true).append(true).open(&log_file)?;

        let run_id = Uuid::new_v4();
        info!(%run_id, "Audit trail initialized: {:?}", log_file);

        Ok(Self {
            run_id,
            log_file,
            file_handle: Arc::new(Mutex::new(file)),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_file
    }

    /// Log an audit entry
    pub async fn log(&self, event_type: &str, scope: Option<String>, details: serde_json::Value) -> AppResult<()> {
        let entry = AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            run_id: self.run_id,
            event_type: event_type.to_string(),
            scope,
            details,
        };
        let json = serde_json::to_string(&entry)?;

        let mut file = self.file_handle.lock().await;
        writeln!(file, "{}", json)?;
        file.flush()?;

        Ok(())
    }

    /// Log every period written or failed by one ingestion
    pub async fn log_ingestion(&self, report: &IngestionReport) -> AppResult<()> {
        for summary in report.written.values() {
            self.log(
                "period_ingested",
                Some(report.date.to_string()),
                serde_json::json!({
                    "period": summary.settlement_period,
                    "records": summary.record_count,
                    "energy": summary.total_energy,
                    "payment": summary.total_payment,
                }),
            )
            .await?;
        }
        for (period, error) in &report.failed {
            self.log(
                "period_failed",
                Some(report.date.to_string()),
                serde_json::json!({ "period": period, "error": error }),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn log_aggregate(&self, aggregate: &ScopeAggregate) -> AppResult<()> {
        self.log(
            "aggregate_recomputed",
            Some(aggregate.scope.to_string()),
            serde_json::json!({
                "kind": aggregate.scope.kind(),
                "energy": aggregate.total_energy,
                "payment": aggregate.total_payment,
                "records": aggregate.record_count,
            }),
        )
        .await
    }

    /// Log the verdict of a reconciliation with before/after counts
    pub async fn log_reconciliation(&self, report: &ReconciliationReport) -> AppResult<()> {
        self.log(
            "scope_reconciled",
            Some(report.scope.to_string()),
            serde_json::json!({
                "verdict": report.verdict,
                "cycles": report.cycles,
                "records_before": report.before.record_count,
                "records_after": report.after.record_count,
                "yields_before": report.before.yield_count,
                "yields_after": report.after.yield_count,
                "gaps_remaining": report.after.gaps,
                "repairs": report.repairs,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scope;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_entries_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditTrailService::new(dir.path().join("audit")).unwrap();

        let aggregate = ScopeAggregate {
            scope: Scope::Day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
            total_energy: 12.5,
            total_payment: 500.0,
            record_count: 2,
            last_recomputed_at: chrono::Utc::now(),
        };
        audit.log_aggregate(&aggregate).await.unwrap();
        audit
            .log("difficulty_set", None, serde_json::json!({ "value": 1.0 }))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(audit.path()).unwrap();
        let entries: Vec<AuditLogEntry> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, "aggregate_recomputed");
        assert_eq!(entries[0].scope.as_deref(), Some("2024-03-01"));
        assert!(entries.iter().all(|e| e.run_id == audit.run_id()));
    }
}
