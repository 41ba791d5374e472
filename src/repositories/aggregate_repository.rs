//! Repository for daily, monthly and yearly summaries

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::error::RepositoryError;
use crate::models::{Scope, ScopeAggregate, YearMonth};

type DailyRow = (NaiveDate, f64, f64, i64, DateTime<Utc>);
type MonthlyRow = (String, f64, f64, i64, DateTime<Utc>);
type YearlyRow = (i32, f64, f64, i64, DateTime<Utc>);

pub struct AggregateRepository {
    pool: SqlitePool,
}

impl AggregateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or fully overwrite the stored aggregate for its scope
    pub async fn upsert(&self, aggregate: &ScopeAggregate) -> Result<(), RepositoryError> {
        let query = match aggregate.scope {
            Scope::Day(date) => sqlx::query(
                r#"
                INSERT INTO daily_summaries
                (summary_date, total_energy, total_payment, record_count, last_recomputed_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (summary_date) DO UPDATE SET
                    total_energy = excluded.total_energy,
                    total_payment = excluded.total_payment,
                    record_count = excluded.record_count,
                    last_recomputed_at = excluded.last_recomputed_at
                "#,
            )
            .bind(date),
            Scope::Month(ym) => sqlx::query(
                r#"
                INSERT INTO monthly_summaries
                (year_month, total_energy, total_payment, record_count, last_recomputed_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (year_month) DO UPDATE SET
                    total_energy = excluded.total_energy,
                    total_payment = excluded.total_payment,
                    record_count = excluded.record_count,
                    last_recomputed_at = excluded.last_recomputed_at
                "#,
            )
            .bind(ym.to_string()),
            Scope::Year(year) => sqlx::query(
                r#"
                INSERT INTO yearly_summaries
                (year, total_energy, total_payment, record_count, last_recomputed_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (year) DO UPDATE SET
                    total_energy = excluded.total_energy,
                    total_payment = excluded.total_payment,
                    record_count = excluded.record_count,
                    last_recomputed_at = excluded.last_recomputed_at
                "#,
            )
            .bind(year),
        };

        query
            .bind(aggregate.total_energy)
            .bind(aggregate.total_payment)
            .bind(aggregate.record_count)
            .bind(aggregate.last_recomputed_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Stored aggregate for a scope, if one has been computed
    pub async fn find(&self, scope: Scope) -> Result<Option<ScopeAggregate>, RepositoryError> {
        let aggregate = match scope {
            Scope::Day(date) => sqlx::query_as::<_, DailyRow>(
                r#"
                SELECT summary_date, total_energy, total_payment, record_count, last_recomputed_at
                FROM daily_summaries WHERE summary_date = ?
                "#,
            )
            .bind(date)
            .fetch_optional(&self.pool)
            .await?
            .map(daily_from_row),
            Scope::Month(ym) => sqlx::query_as::<_, MonthlyRow>(
                r#"
                SELECT year_month, total_energy, total_payment, record_count, last_recomputed_at
                FROM monthly_summaries WHERE year_month = ?
                "#,
            )
            .bind(ym.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(monthly_from_row)
            .transpose()?,
            Scope::Year(year) => sqlx::query_as::<_, YearlyRow>(
                r#"
                SELECT year, total_energy, total_payment, record_count, last_recomputed_at
                FROM yearly_summaries WHERE year = ?
                "#,
            )
            .bind(year)
            .fetch_optional(&self.pool)
            .await?
            .map(yearly_from_row),
        };

        Ok(aggregate)
    }

    /// Daily aggregates between two dates inclusive, oldest first
    pub async fn find_daily_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScopeAggregate>, RepositoryError> {
        let rows = sqlx::query_as::<_, DailyRow>(
            r#"
            SELECT summary_date, total_energy, total_payment, record_count, last_recomputed_at
            FROM daily_summaries
            WHERE summary_date BETWEEN ? AND ?
            ORDER BY summary_date ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(daily_from_row).collect())
    }

    /// Monthly aggregates of a year, January first
    pub async fn find_monthly_in_year(&self, year: i32) -> Result<Vec<ScopeAggregate>, RepositoryError> {
        let rows = sqlx::query_as::<_, MonthlyRow>(
            r#"
            SELECT year_month, total_energy, total_payment, record_count, last_recomputed_at
            FROM monthly_summaries
            WHERE year_month LIKE ?
            ORDER BY year_month ASC
            "#,
        )
        .bind(format!("{:04}-%", year))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(monthly_from_row).collect()
    }
}

fn daily_from_row((date, total_energy, total_payment, record_count, at): DailyRow) -> ScopeAggregate {
    ScopeAggregate {
        scope: Scope::Day(date),
        total_energy,
        total_payment,
        record_count,
        last_recomputed_at: at,
    }
}

fn monthly_from_row(
    (ym, total_energy, total_payment, record_count, at): MonthlyRow,
) -> Result<ScopeAggregate, RepositoryError> {
    let ym: YearMonth = ym.parse().map_err(RepositoryError::InvalidInput)?;
    Ok(ScopeAggregate {
        scope: Scope::Month(ym),
        total_energy,
        total_payment,
        record_count,
        last_recomputed_at: at,
    })
}

fn yearly_from_row((year, total_energy, total_payment, record_count, at): YearlyRow) -> ScopeAggregate {
    ScopeAggregate {
        scope: Scope::Year(year),
        total_energy,
        total_payment,
        record_count,
        last_recomputed_at: at,
    }
}
