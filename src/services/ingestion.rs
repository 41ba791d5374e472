//! Idempotent per-period ingestion

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::filter::{RecordFilter, RejectCounts};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{RawRow, SettlementCandidate, WriteSummary, PERIODS_PER_DAY};
use crate::registry::UnitRegistry;
use crate::repositories::SettlementRepository;
use crate::upstream::{CancelToken, RateLimitedFetcher};

/// Sole writer of settlement records.
///
/// Writes to the same (date, period) are serialized through a per-key lock;
/// different periods proceed concurrently.
pub struct IngestionWriter {
    settlement_repo: Arc<SettlementRepository>,
    registry: Arc<UnitRegistry>,
    locks: Mutex<HashMap<(NaiveDate, i32), Arc<Mutex<()>>>>,
}

impl IngestionWriter {
    pub fn new(settlement_repo: Arc<SettlementRepository>, registry: Arc<UnitRegistry>) -> Self {
        Self {
            settlement_repo,
            registry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, date: NaiveDate, period: i32) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry((date, period)).or_default().clone()
    }

    /// Replace all records of (date, period) with `candidates`
    pub async fn write(
        &self,
        date: NaiveDate,
        period: i32,
        mut candidates: Vec<SettlementCandidate>,
    ) -> PipelineResult<WriteSummary> {
        for candidate in candidates.iter_mut() {
            if candidate.lead_party_name.is_none() {
                candidate.lead_party_name = self
                    .registry
                    .lead_party(&candidate.unit_id)
                    .map(str::to_string);
            }
        }

        let lock = self.lock_for(date, period).await;
        let result = {
            let _guard = lock.lock().await;
            self.settlement_repo
                .replace_period(date, period, &candidates)
                .await
        };
        self.release(date, period, lock).await;

        Ok(result?)
    }

    /// Drop the key's lock once no other writer holds or awaits it
    async fn release(&self, date: NaiveDate, period: i32, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // The map and `lock` are the only references left
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&(date, period));
        }
    }

    /// Number of (date, period) keys with a live lock
    pub async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Result of ingesting one date
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub date: NaiveDate,
    pub written: BTreeMap<i32, WriteSummary>,
    pub failed: BTreeMap<i32, String>,
    pub rejected: RejectCounts,
}

impl IngestionReport {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            written: BTreeMap::new(),
            failed: BTreeMap::new(),
            rejected: RejectCounts::default(),
        }
    }

    /// Every requested period was written
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.written.values().map(|s| s.record_count).sum()
    }

    pub fn total_energy(&self) -> f64 {
        self.written.values().map(|s| s.total_energy).sum()
    }

    pub fn total_payment(&self) -> f64 {
        self.written.values().map(|s| s.total_payment).sum()
    }
}

/// Fetch, filter and write the periods of a date
pub struct IngestionService {
    fetcher: Arc<RateLimitedFetcher>,
    writer: Arc<IngestionWriter>,
    registry: Arc<UnitRegistry>,
    max_concurrency: usize,
}

impl IngestionService {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        writer: Arc<IngestionWriter>,
        registry: Arc<UnitRegistry>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            writer,
            registry,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn all_periods() -> Vec<i32> {
        (1..=PERIODS_PER_DAY).collect()
    }

    /// Ingest `periods` of `date`.
    ///
    /// A period that fails to fetch or write is recorded in the report and
    /// leaves its stored records untouched; its siblings carry on. Once the
    /// token is cancelled no further period is written.
    pub async fn ingest_date(
        &self,
        date: NaiveDate,
        periods: &[i32],
        cancel: &CancelToken,
    ) -> IngestionReport {
        info!(%date, periods = periods.len(), "Starting ingestion");
        let batch = self.fetcher.fetch_batch(date, periods, cancel).await;

        let mut report = IngestionReport::new(date);
        let mut ready: Vec<(i32, Vec<RawRow>)> = Vec::new();
        for (period, result) in batch.periods {
            match result {
                Ok(rows) => ready.push((period, rows)),
                Err(e) => {
                    error!(%date, period, error = %e, "Period fetch failed");
                    report.failed.insert(period, e.to_string());
                }
            }
        }

        let writes: Vec<(i32, RejectCounts, PipelineResult<WriteSummary>)> = stream::iter(ready)
            .map(move |(period, rows)| async move {
                let outcome = RecordFilter::filter(&rows, &self.registry, date, period);
                let result = if cancel.is_cancelled() {
                    Err(PipelineError::Cancelled)
                } else {
                    self.writer.write(date, period, outcome.candidates).await
                };
                (period, outcome.rejected, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (period, rejected, result) in writes {
            report.rejected.add(&rejected);
            match result {
                Ok(summary) => {
                    info!(
                        %date,
                        period,
                        records = summary.record_count,
                        energy = summary.total_energy,
                        payment = summary.total_payment,
                        rejected = rejected.total(),
                        "Period ingested"
                    );
                    report.written.insert(period, summary);
                }
                Err(e) => {
                    error!(%date, period, error = %e, "Period write failed");
                    report.failed.insert(period, e.to_string());
                }
            }
        }

        if report.is_complete() {
            info!(
                %date,
                periods = report.written.len(),
                records = report.record_count(),
                energy = report.total_energy(),
                "Ingestion complete"
            );
        } else {
            warn!(
                %date,
                written = report.written.len(),
                failed = report.failed.len(),
                "Ingestion finished with failed periods"
            );
        }
        report
    }
}
