//! Day, month and year aggregate recomputation

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info};

use crate::error::PipelineResult;
use crate::models::{Scope, ScopeAggregate, YearMonth};
use crate::repositories::{AggregateRepository, SettlementRepository};

/// Recomputes stored aggregates from their sources.
///
/// Each call is a full replace. Months are summed from stored days and years
/// from stored months, so callers recompute children first; the engine never
/// cascades on its own except through [`AggregationEngine::recompute_cascade`].
pub struct AggregationEngine {
    settlement_repo: Arc<SettlementRepository>,
    aggregate_repo: Arc<AggregateRepository>,
}

impl AggregationEngine {
    pub fn new(
        settlement_repo: Arc<SettlementRepository>,
        aggregate_repo: Arc<AggregateRepository>,
    ) -> Self {
        Self {
            settlement_repo,
            aggregate_repo,
        }
    }

    /// Daily totals from the records of `date`
    pub async fn recompute_daily(&self, date: NaiveDate) -> PipelineResult<ScopeAggregate> {
        let records = self.settlement_repo.find_by_date(date).await?;
        let aggregate = ScopeAggregate {
            scope: Scope::Day(date),
            total_energy: records.iter().map(|r| r.energy()).sum(),
            total_payment: records.iter().map(|r| r.payment).sum(),
            record_count: records.len() as i64,
            last_recomputed_at: Utc::now(),
        };
        self.store(aggregate).await
    }

    /// Monthly totals from the stored daily aggregates of the month
    pub async fn recompute_monthly(&self, month: YearMonth) -> PipelineResult<ScopeAggregate> {
        let days = self
            .aggregate_repo
            .find_daily_between(month.first_day(), month.last_day())
            .await?;
        let aggregate = Self::sum_children(Scope::Month(month), &days);
        self.store(aggregate).await
    }

    /// Yearly totals from the stored monthly aggregates of the year
    pub async fn recompute_yearly(&self, year: i32) -> PipelineResult<ScopeAggregate> {
        let months = self.aggregate_repo.find_monthly_in_year(year).await?;
        let aggregate = Self::sum_children(Scope::Year(year), &months);
        self.store(aggregate).await
    }

    pub async fn recompute(&self, scope: Scope) -> PipelineResult<ScopeAggregate> {
        match scope {
            Scope::Day(date) => self.recompute_daily(date).await,
            Scope::Month(month) => self.recompute_monthly(month).await,
            Scope::Year(year) => self.recompute_yearly(year).await,
        }
    }

    /// Recompute the given days, then every month and year they touch,
    /// in that order
    pub async fn recompute_cascade(
        &self,
        dates: &[NaiveDate],
        extra_months: &[YearMonth],
        extra_years: &[i32],
    ) -> PipelineResult<Vec<ScopeAggregate>> {
        let days: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        let mut months: BTreeSet<YearMonth> = days.iter().map(|d| YearMonth::of(*d)).collect();
        months.extend(extra_months.iter().copied());
        let mut years: BTreeSet<i32> = months.iter().map(|m| m.year).collect();
        years.extend(extra_years.iter().copied());

        let mut recomputed = Vec::with_capacity(days.len() + months.len() + years.len());
        for date in days {
            recomputed.push(self.recompute_daily(date).await?);
        }
        for month in months {
            recomputed.push(self.recompute_monthly(month).await?);
        }
        for year in years {
            recomputed.push(self.recompute_yearly(year).await?);
        }

        info!(scopes = recomputed.len(), "Aggregate cascade complete");
        Ok(recomputed)
    }

    /// Children are summed in stored order so repeated runs agree bit for bit
    fn sum_children(scope: Scope, children: &[ScopeAggregate]) -> ScopeAggregate {
        ScopeAggregate {
            scope,
            total_energy: children.iter().map(|c| c.total_energy).sum(),
            total_payment: children.iter().map(|c| c.total_payment).sum(),
            record_count: children.iter().map(|c| c.record_count).sum(),
            last_recomputed_at: Utc::now(),
        }
    }

    /// Upsert unless the stored row already carries the same totals, in
    /// which case the stored row is returned as is
    async fn store(&self, aggregate: ScopeAggregate) -> PipelineResult<ScopeAggregate> {
        if let Some(existing) = self.aggregate_repo.find(aggregate.scope).await? {
            if existing.total_energy == aggregate.total_energy
                && existing.total_payment == aggregate.total_payment
                && existing.record_count == aggregate.record_count
            {
                debug!(scope = %aggregate.scope, "Aggregate unchanged");
                return Ok(existing);
            }
        }

        self.aggregate_repo.upsert(&aggregate).await?;
        debug!(
            scope = %aggregate.scope,
            kind = aggregate.scope.kind(),
            energy = aggregate.total_energy,
            payment = aggregate.total_payment,
            records = aggregate.record_count,
            "Aggregate recomputed"
        );
        Ok(aggregate)
    }
}

