//! Curtailment Pipeline Library
//!
//! Ingests wind curtailment settlement records from the upstream market data
//! API, derives aggregates and mining yields from them, and reconciles the
//! derived data against the canonical records.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod registry;
pub mod repositories;
pub mod services;
pub mod upstream;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{AppError, AppResult, PipelineError, PipelineResult};

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use config::PipelineConfig;
use models::{Scope, ScopeAggregate};
use registry::UnitRegistry;
use repositories::*;
use services::*;
use upstream::{CancelToken, RateLimitedFetcher};

/// Everything one date's job produced
#[derive(Debug, Clone, Serialize)]
pub struct DateRun {
    pub ingestion: IngestionReport,
    pub aggregates: Vec<ScopeAggregate>,
    pub yields: Option<YieldSummary>,
    pub yield_error: Option<String>,
}

/// Explicitly constructed pipeline context.
///
/// Holds the immutable registry, the single shared rate-limited fetcher and
/// every repository and service built on the same pool.
pub struct PipelineContext {
    pub registry: Arc<UnitRegistry>,
    pub settlement_repo: Arc<SettlementRepository>,
    pub aggregate_repo: Arc<AggregateRepository>,
    pub yield_repo: Arc<YieldRepository>,
    pub difficulty_repo: Arc<DifficultyRepository>,
    pub fetcher: Arc<RateLimitedFetcher>,
    pub ingestion: Arc<IngestionService>,
    pub aggregation: Arc<AggregationEngine>,
    pub yields: Arc<YieldService>,
    pub auditor: Arc<ReconciliationAuditor>,
    pub audit_trail: Option<Arc<AuditTrailService>>,
}

impl PipelineContext {
    /// Wire up repositories and services
    pub fn new(
        pool: SqlitePool,
        registry: UnitRegistry,
        fetcher: Arc<RateLimitedFetcher>,
        config: &PipelineConfig,
    ) -> Self {
        let registry = Arc::new(registry);

        let settlement_repo = Arc::new(SettlementRepository::new(pool.clone()));
        let aggregate_repo = Arc::new(AggregateRepository::new(pool.clone()));
        let yield_repo = Arc::new(YieldRepository::new(pool.clone()));
        let difficulty_repo = Arc::new(DifficultyRepository::new(pool));

        let writer = Arc::new(IngestionWriter::new(
            settlement_repo.clone(),
            registry.clone(),
        ));
        let ingestion = Arc::new(IngestionService::new(
            fetcher.clone(),
            writer,
            registry.clone(),
            fetcher.max_concurrency(),
        ));
        let aggregation = Arc::new(AggregationEngine::new(
            settlement_repo.clone(),
            aggregate_repo.clone(),
        ));
        let yields = Arc::new(YieldService::new(
            YieldCalculator::new(config.block_reward),
            config.profiles.clone(),
            config.difficulty_fallback,
            settlement_repo.clone(),
            yield_repo.clone(),
            difficulty_repo.clone(),
        ));
        let auditor = Arc::new(
            ReconciliationAuditor::new(
                settlement_repo.clone(),
                aggregate_repo.clone(),
                yield_repo.clone(),
                ingestion.clone(),
                yields.clone(),
                aggregation.clone(),
                fetcher.clone(),
                registry.clone(),
                config.max_repair_cycles,
            )
            .with_upstream_verification(config.verify_upstream),
        );

        Self {
            registry,
            settlement_repo,
            aggregate_repo,
            yield_repo,
            difficulty_repo,
            fetcher,
            ingestion,
            aggregation,
            yields,
            auditor,
            audit_trail: None,
        }
    }

    pub fn with_audit_trail(mut self, audit_trail: AuditTrailService) -> Self {
        self.audit_trail = Some(Arc::new(audit_trail));
        self
    }

    /// Ingest a date, then derive its aggregates and yields.
    ///
    /// The daily aggregate is only recomputed once every requested period
    /// was written. A missing difficulty is reported, not raised.
    pub async fn run_date(
        &self,
        date: NaiveDate,
        periods: &[i32],
        cancel: &CancelToken,
    ) -> PipelineResult<DateRun> {
        let ingestion = self.ingestion.ingest_date(date, periods, cancel).await;
        if let Some(audit) = &self.audit_trail {
            if let Err(e) = audit.log_ingestion(&ingestion).await {
                warn!(%date, error = %e, "Failed to write audit entry");
            }
        }

        let aggregates = if ingestion.is_complete() {
            self.aggregation.recompute_cascade(&[date], &[], &[]).await?
        } else {
            warn!(
                %date,
                failed = ingestion.failed.len(),
                "Daily aggregate left untouched until every period is ingested"
            );
            Vec::new()
        };
        if let Some(audit) = &self.audit_trail {
            for aggregate in &aggregates {
                if let Err(e) = audit.log_aggregate(aggregate).await {
                    warn!(scope = %aggregate.scope, error = %e, "Failed to write audit entry");
                }
            }
        }

        let (yields, yield_error) = match self.yields.process_date(date).await {
            Ok(summary) => (Some(summary), None),
            Err(e @ PipelineError::MissingParameter { .. }) => {
                warn!(%date, error = %e, "Yields not derived");
                (None, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        info!(
            %date,
            records = ingestion.record_count(),
            failed_periods = ingestion.failed.len(),
            yields = yields.as_ref().map(|y| y.written).unwrap_or(0),
            "Date processed"
        );

        Ok(DateRun {
            ingestion,
            aggregates,
            yields,
            yield_error,
        })
    }

    /// Reconcile a scope and record the verdict in the audit trail
    pub async fn reconcile(
        &self,
        scope: Scope,
        cancel: &CancelToken,
    ) -> PipelineResult<ReconciliationReport> {
        let report = self.auditor.reconcile(scope, cancel).await?;
        if let Some(audit) = &self.audit_trail {
            if let Err(e) = audit.log_reconciliation(&report).await {
                warn!(scope = %scope, error = %e, "Failed to write audit entry");
            }
        }
        Ok(report)
    }
}
