//! Drift detection and repair between canonical records and derived data.
//!
//! A scope is scanned into a [`ScanReport`]. When the report lists gaps the
//! auditor runs repair cycles: re-ingest suspect periods, fill missing or
//! restate stale yields, then recompute the affected aggregates bottom up,
//! and scan again. The loop ends `Consistent`, or `Failed` once the cycle
//! budget is spent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::aggregation::AggregationEngine;
use super::filter::RecordFilter;
use super::ingestion::IngestionService;
use super::yield_calculator::YieldService;
use crate::error::{PipelineError, PipelineResult};
use crate::models::aggregate::approx_eq;
use crate::models::{Scope, ScopeAggregate, SettlementRecord, YearMonth};
use crate::registry::UnitRegistry;
use crate::repositories::{AggregateRepository, SettlementRepository, YieldRepository};
use crate::upstream::{CancelToken, RateLimitedFetcher};

/// Relative tolerance for comparing stored and recomputed sums
pub const SUM_TOLERANCE: f64 = 1e-9;

/// One reason a scope is not consistent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "gap", rename_all = "snake_case")]
pub enum Gap {
    /// No daily aggregate was ever produced for the date
    Uningested { date: NaiveDate },
    /// Upstream now reports different data for these periods
    StalePeriods { date: NaiveDate, periods: Vec<i32> },
    YieldShortfall {
        date: NaiveDate,
        expected: i64,
        actual: i64,
    },
    /// Yields are missing because the date has no difficulty
    MissingDifficulty { date: NaiveDate, missing_yields: i64 },
    /// Yields computed with a difficulty other than the one now in force
    StaleYields {
        date: NaiveDate,
        difficulty: f64,
        count: i64,
    },
    /// Yields left behind by records that no longer exist
    OrphanYields { date: NaiveDate, count: i64 },
    AggregateMissing { scope: Scope },
    AggregateMismatch {
        scope: Scope,
        stored_energy: f64,
        expected_energy: f64,
        stored_payment: f64,
        expected_payment: f64,
        stored_records: i64,
        expected_records: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Consistent,
    Drifted,
    Failed,
}

/// Counts and gaps observed by one scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scope: Scope,
    pub dates_scanned: usize,
    pub record_count: i64,
    pub period_count: usize,
    pub yield_count: i64,
    pub expected_yield_count: i64,
    pub gaps: Vec<Gap>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            dates_scanned: 0,
            record_count: 0,
            period_count: 0,
            yield_count: 0,
            expected_yield_count: 0,
            gaps: Vec::new(),
            scanned_at: Utc::now(),
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.gaps.is_empty() {
            Verdict::Consistent
        } else {
            Verdict::Drifted
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Work done across all repair cycles
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairLog {
    pub periods_reingested: usize,
    pub periods_failed: usize,
    pub yields_written: u64,
    pub yield_failures: usize,
    pub orphans_deleted: u64,
    pub aggregates_recomputed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub scope: Scope,
    pub verdict: Verdict,
    pub cycles: u32,
    pub before: ScanReport,
    pub after: ScanReport,
    pub repairs: RepairLog,
}

impl ReconciliationReport {
    /// Turn a failed verdict into [`PipelineError::ReconciliationExhausted`]
    pub fn into_result(self) -> PipelineResult<Self> {
        match self.verdict {
            Verdict::Consistent => Ok(self),
            _ => Err(PipelineError::ReconciliationExhausted {
                scope: self.scope.to_string(),
                cycles: self.cycles,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditState {
    Scanned,
    Drifted,
    Repairing,
    Consistent,
    Failed,
}

/// What one repair cycle will touch
#[derive(Debug, Default)]
struct RepairPlan {
    reingest: BTreeMap<NaiveDate, BTreeSet<i32>>,
    yield_dates: BTreeSet<NaiveDate>,
    restate_dates: BTreeSet<NaiveDate>,
    orphan_dates: BTreeSet<NaiveDate>,
    days: BTreeSet<NaiveDate>,
    months: BTreeSet<YearMonth>,
    years: BTreeSet<i32>,
}

impl RepairPlan {
    fn from_gaps(gaps: &[Gap]) -> Self {
        let mut plan = Self::default();
        for gap in gaps {
            match gap {
                Gap::Uningested { date } => {
                    plan.reingest
                        .entry(*date)
                        .or_default()
                        .extend(IngestionService::all_periods());
                }
                Gap::StalePeriods { date, periods } => {
                    plan.reingest.entry(*date).or_default().extend(periods);
                }
                Gap::YieldShortfall { date, .. } | Gap::MissingDifficulty { date, .. } => {
                    plan.yield_dates.insert(*date);
                }
                Gap::StaleYields { date, .. } => {
                    plan.restate_dates.insert(*date);
                }
                Gap::OrphanYields { date, .. } => {
                    plan.orphan_dates.insert(*date);
                }
                Gap::AggregateMissing { scope } | Gap::AggregateMismatch { scope, .. } => {
                    match scope {
                        Scope::Day(date) => {
                            plan.days.insert(*date);
                        }
                        Scope::Month(month) => {
                            plan.months.insert(*month);
                        }
                        Scope::Year(year) => {
                            plan.years.insert(*year);
                        }
                    }
                }
            }
        }
        plan
    }
}

pub struct ReconciliationAuditor {
    settlement_repo: Arc<SettlementRepository>,
    aggregate_repo: Arc<AggregateRepository>,
    yield_repo: Arc<YieldRepository>,
    ingestion: Arc<IngestionService>,
    yields: Arc<YieldService>,
    aggregation: Arc<AggregationEngine>,
    fetcher: Arc<RateLimitedFetcher>,
    registry: Arc<UnitRegistry>,
    max_repair_cycles: u32,
    verify_upstream: bool,
}

impl ReconciliationAuditor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settlement_repo: Arc<SettlementRepository>,
        aggregate_repo: Arc<AggregateRepository>,
        yield_repo: Arc<YieldRepository>,
        ingestion: Arc<IngestionService>,
        yields: Arc<YieldService>,
        aggregation: Arc<AggregationEngine>,
        fetcher: Arc<RateLimitedFetcher>,
        registry: Arc<UnitRegistry>,
        max_repair_cycles: u32,
    ) -> Self {
        Self {
            settlement_repo,
            aggregate_repo,
            yield_repo,
            ingestion,
            yields,
            aggregation,
            fetcher,
            registry,
            max_repair_cycles,
            verify_upstream: false,
        }
    }

    /// Also re-fetch every ingested period during scans and flag the ones
    /// upstream has changed since
    pub fn with_upstream_verification(mut self, enabled: bool) -> Self {
        self.verify_upstream = enabled;
        self
    }

    /// Compare canonical records against every derived artifact of the scope
    pub async fn scan(&self, scope: Scope, cancel: &CancelToken) -> PipelineResult<ScanReport> {
        let mut report = ScanReport::new(scope);
        let today = Utc::now().date_naive();
        let models = self.yields.profile_names();

        for date in scope.dates().into_iter().filter(|d| *d <= today) {
            self.scan_date(date, &models, &mut report, cancel).await?;
        }

        if !matches!(scope, Scope::Day(_)) {
            for month in scope.months() {
                let days = self
                    .aggregate_repo
                    .find_daily_between(month.first_day(), month.last_day())
                    .await?;
                self.check_parent(Scope::Month(month), &days, &mut report)
                    .await?;
            }
        }
        if let Scope::Year(year) = scope {
            let months = self.aggregate_repo.find_monthly_in_year(year).await?;
            self.check_parent(scope, &months, &mut report).await?;
        }

        info!(
            scope = %scope,
            records = report.record_count,
            periods = report.period_count,
            yields = report.yield_count,
            expected_yields = report.expected_yield_count,
            gaps = report.gaps.len(),
            verdict = ?report.verdict(),
            "Scope scanned"
        );
        Ok(report)
    }

    async fn scan_date(
        &self,
        date: NaiveDate,
        models: &[String],
        report: &mut ScanReport,
        cancel: &CancelToken,
    ) -> PipelineResult<()> {
        let records = self.settlement_repo.find_by_date(date).await?;
        let record_count = records.len() as i64;
        let periods: BTreeSet<i32> = records.iter().map(|r| r.settlement_period).collect();

        report.dates_scanned += 1;
        report.record_count += record_count;
        report.period_count += periods.len();

        match self.aggregate_repo.find(Scope::Day(date)).await? {
            None => report.gaps.push(Gap::Uningested { date }),
            Some(daily) => {
                let energy: f64 = records.iter().map(|r| r.energy()).sum();
                let payment: f64 = records.iter().map(|r| r.payment).sum();
                if !daily.totals_match(energy, payment, SUM_TOLERANCE)
                    || daily.record_count != record_count
                {
                    report.gaps.push(Gap::AggregateMismatch {
                        scope: daily.scope,
                        stored_energy: daily.total_energy,
                        expected_energy: energy,
                        stored_payment: daily.total_payment,
                        expected_payment: payment,
                        stored_records: daily.record_count,
                        expected_records: record_count,
                    });
                }

                if self.verify_upstream {
                    let stale = self.stale_periods(date, &records, cancel).await;
                    if !stale.is_empty() {
                        report.gaps.push(Gap::StalePeriods {
                            date,
                            periods: stale,
                        });
                    }
                }
            }
        }

        let expected = record_count * models.len() as i64;
        let actual = self.yield_repo.count_matched(date, models).await?;
        report.expected_yield_count += expected;
        report.yield_count += actual;

        let difficulty = if actual > 0 || expected > 0 {
            self.yields.difficulty_for(date).await?
        } else {
            None
        };
        if let Some(current) = difficulty.filter(|_| actual > 0) {
            let stale = self
                .yield_repo
                .find_by_date(date)
                .await?
                .iter()
                .filter(|y| models.contains(&y.miner_model))
                .filter(|y| !approx_eq(y.difficulty, current, SUM_TOLERANCE))
                .count() as i64;
            if stale > 0 {
                report.gaps.push(Gap::StaleYields {
                    date,
                    difficulty: current,
                    count: stale,
                });
            }
        }

        if actual < expected {
            let gap = if difficulty.is_none() {
                Gap::MissingDifficulty {
                    date,
                    missing_yields: expected - actual,
                }
            } else {
                Gap::YieldShortfall {
                    date,
                    expected,
                    actual,
                }
            };
            report.gaps.push(gap);
        }

        let orphans = self.yield_repo.count_orphans(date).await?;
        if orphans > 0 {
            report.gaps.push(Gap::OrphanYields {
                date,
                count: orphans,
            });
        }

        Ok(())
    }

    /// Check a stored month or year against the stored children it sums
    async fn check_parent(
        &self,
        scope: Scope,
        children: &[ScopeAggregate],
        report: &mut ScanReport,
    ) -> PipelineResult<()> {
        let energy: f64 = children.iter().map(|c| c.total_energy).sum();
        let payment: f64 = children.iter().map(|c| c.total_payment).sum();
        let records: i64 = children.iter().map(|c| c.record_count).sum();

        match self.aggregate_repo.find(scope).await? {
            None if children.is_empty() => {}
            None => report.gaps.push(Gap::AggregateMissing { scope }),
            Some(stored) => {
                if !stored.totals_match(energy, payment, SUM_TOLERANCE)
                    || stored.record_count != records
                {
                    report.gaps.push(Gap::AggregateMismatch {
                        scope,
                        stored_energy: stored.total_energy,
                        expected_energy: energy,
                        stored_payment: stored.total_payment,
                        expected_payment: payment,
                        stored_records: stored.record_count,
                        expected_records: records,
                    });
                }
            }
        }
        Ok(())
    }

    /// Periods whose filtered upstream data differs from what is stored.
    ///
    /// Periods that cannot be fetched are left unflagged.
    async fn stale_periods(
        &self,
        date: NaiveDate,
        records: &[SettlementRecord],
        cancel: &CancelToken,
    ) -> Vec<i32> {
        let mut stored: BTreeMap<i32, (usize, f64, f64)> = BTreeMap::new();
        for record in records {
            let entry = stored.entry(record.settlement_period).or_default();
            entry.0 += 1;
            entry.1 += record.energy();
            entry.2 += record.payment;
        }

        let batch = self
            .fetcher
            .fetch_batch(date, &IngestionService::all_periods(), cancel)
            .await;

        let mut stale = Vec::new();
        for (period, result) in &batch.periods {
            let rows = match result {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(%date, period, error = %e, "Period could not be verified");
                    continue;
                }
            };
            let outcome = RecordFilter::filter(rows, &self.registry, date, *period);
            let energy: f64 = outcome.candidates.iter().map(|c| c.volume.abs()).sum();
            let payment: f64 = outcome.candidates.iter().map(|c| c.payment).sum();
            let (count, stored_energy, stored_payment) =
                stored.get(period).copied().unwrap_or_default();

            if count != outcome.candidates.len()
                || !approx_eq(energy, stored_energy, SUM_TOLERANCE)
                || !approx_eq(payment, stored_payment, SUM_TOLERANCE)
            {
                debug!(%date, period, stored = count, upstream = outcome.candidates.len(), "Stale period");
                stale.push(*period);
            }
        }
        stale
    }

    /// Scan, repair and rescan until the scope is consistent or the repair
    /// budget runs out
    pub async fn reconcile(
        &self,
        scope: Scope,
        cancel: &CancelToken,
    ) -> PipelineResult<ReconciliationReport> {
        let before = self.scan(scope, cancel).await?;
        let mut current = before.clone();
        let mut repairs = RepairLog::default();
        let mut cycles = 0;
        let mut state = AuditState::Scanned;

        loop {
            let next = match state {
                AuditState::Scanned if current.is_consistent() => AuditState::Consistent,
                AuditState::Scanned => AuditState::Drifted,
                AuditState::Drifted if cancel.is_cancelled() => AuditState::Failed,
                AuditState::Drifted if cycles >= self.max_repair_cycles => AuditState::Failed,
                AuditState::Drifted => AuditState::Repairing,
                AuditState::Repairing => {
                    cycles += 1;
                    self.repair(&current, &mut repairs, cancel).await;
                    current = self.scan(scope, cancel).await?;
                    AuditState::Scanned
                }
                AuditState::Consistent | AuditState::Failed => break,
            };
            debug!(scope = %scope, from = ?state, to = ?next, cycles, "Reconciliation transition");
            state = next;
        }

        let verdict = if state == AuditState::Consistent {
            Verdict::Consistent
        } else {
            Verdict::Failed
        };

        if verdict == Verdict::Failed {
            warn!(
                scope = %scope,
                cycles,
                gaps = current.gaps.len(),
                "Reconciliation failed"
            );
        } else {
            info!(scope = %scope, cycles, "Scope consistent");
        }

        Ok(ReconciliationReport {
            scope,
            verdict,
            cycles,
            before,
            after: current,
            repairs,
        })
    }

    /// One repair pass. Failures are logged and left for the next scan.
    async fn repair(&self, scan: &ScanReport, log: &mut RepairLog, cancel: &CancelToken) {
        let mut plan = RepairPlan::from_gaps(&scan.gaps);
        info!(
            scope = %scan.scope,
            reingest_dates = plan.reingest.len(),
            yield_dates = plan.yield_dates.len(),
            restate_dates = plan.restate_dates.len(),
            orphan_dates = plan.orphan_dates.len(),
            "Repairing scope"
        );

        for (date, periods) in std::mem::take(&mut plan.reingest) {
            let periods: Vec<i32> = periods.into_iter().collect();
            let ingested = self.ingestion.ingest_date(date, &periods, cancel).await;
            log.periods_reingested += ingested.written.len();
            log.periods_failed += ingested.failed.len();

            if !ingested.written.is_empty() {
                plan.yield_dates.insert(date);
            }
            // A day only gets its aggregate once every period is in
            if ingested.is_complete() {
                plan.days.insert(date);
            }
        }

        for date in &plan.orphan_dates {
            match self.yield_repo.delete_orphans(*date).await {
                Ok(deleted) => log.orphans_deleted += deleted,
                Err(e) => warn!(%date, error = %e, "Orphan cleanup failed"),
            }
        }

        for date in &plan.restate_dates {
            match self.yields.process_date(*date).await {
                Ok(summary) => log.yields_written += summary.written,
                Err(e) => {
                    log.yield_failures += 1;
                    warn!(%date, error = %e, "Yield restatement failed");
                }
            }
        }

        for date in plan.yield_dates.difference(&plan.restate_dates) {
            match self.yields.fill_missing(*date).await {
                Ok(summary) => log.yields_written += summary.written,
                Err(e) => {
                    log.yield_failures += 1;
                    warn!(%date, error = %e, "Yield repair failed");
                }
            }
        }

        if plan.days.is_empty() && plan.months.is_empty() && plan.years.is_empty() {
            return;
        }
        let days: Vec<NaiveDate> = plan.days.into_iter().collect();
        let months: Vec<YearMonth> = plan.months.into_iter().collect();
        let years: Vec<i32> = plan.years.into_iter().collect();
        match self.aggregation.recompute_cascade(&days, &months, &years).await {
            Ok(recomputed) => log.aggregates_recomputed += recomputed.len(),
            Err(e) => warn!(scope = %scan.scope, error = %e, "Aggregate repair failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_plan_routes_each_gap_to_its_stage() {
        let gaps = vec![
            Gap::Uningested { date: date(1) },
            Gap::StalePeriods {
                date: date(2),
                periods: vec![4, 5],
            },
            Gap::MissingDifficulty {
                date: date(3),
                missing_yields: 6,
            },
            Gap::OrphanYields {
                date: date(4),
                count: 2,
            },
            Gap::StaleYields {
                date: date(5),
                difficulty: 2.0e14,
                count: 15,
            },
            Gap::AggregateMissing {
                scope: Scope::Month(YearMonth::of(date(1))),
            },
        ];
        let plan = RepairPlan::from_gaps(&gaps);

        assert_eq!(plan.reingest[&date(1)].len(), 48);
        assert_eq!(
            plan.reingest[&date(2)].iter().copied().collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert!(plan.yield_dates.contains(&date(3)));
        assert!(plan.orphan_dates.contains(&date(4)));
        assert!(plan.restate_dates.contains(&date(5)));
        assert!(!plan.yield_dates.contains(&date(5)));
        assert!(plan.months.contains(&YearMonth::of(date(1))));
        assert!(plan.days.is_empty());
    }

    #[test]
    fn test_verdict_follows_gaps() {
        let mut report = ScanReport::new(Scope::Day(date(1)));
        assert_eq!(report.verdict(), Verdict::Consistent);
        report.gaps.push(Gap::Uningested { date: date(1) });
        assert_eq!(report.verdict(), Verdict::Drifted);
    }

    #[test]
    fn test_failed_report_converts_to_exhausted_error() {
        let scan = ScanReport::new(Scope::Day(date(1)));
        let report = ReconciliationReport {
            scope: Scope::Day(date(1)),
            verdict: Verdict::Failed,
            cycles: 3,
            before: scan.clone(),
            after: scan,
            repairs: RepairLog::default(),
        };
        assert!(matches!(
            report.into_result(),
            Err(PipelineError::ReconciliationExhausted { cycles: 3, .. })
        ));
    }
}
