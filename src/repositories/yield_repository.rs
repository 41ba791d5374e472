//! Repository for derived yield records

use std::collections::HashSet;

use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::error::RepositoryError;
use crate::models::YieldRecord;

/// (period, unit, model) identity of a yield within one date
pub type YieldKey = (i32, String, String);

pub struct YieldRepository {
    pool: SqlitePool,
}

impl YieldRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite each yield by its (date, period, unit, model) key
    pub async fn upsert_many(&self, records: &[YieldRecord]) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for record in records {
            written += sqlx::query(
                r#"
                INSERT INTO yield_records
                (settlement_date, settlement_period, unit_id, miner_model,
                 yield_amount, difficulty, calculated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (settlement_date, settlement_period, unit_id, miner_model) DO UPDATE SET
                    yield_amount = excluded.yield_amount,
                    difficulty = excluded.difficulty,
                    calculated_at = excluded.calculated_at
                "#,
            )
            .bind(record.settlement_date)
            .bind(record.settlement_period)
            .bind(&record.unit_id)
            .bind(&record.miner_model)
            .bind(record.yield_amount)
            .bind(record.difficulty)
            .bind(record.calculated_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    pub async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<YieldRecord>, RepositoryError> {
        let records = sqlx::query_as::<_, YieldRecord>(
            r#"
            SELECT settlement_date, settlement_period, unit_id, miner_model,
                   yield_amount, difficulty, calculated_at
            FROM yield_records
            WHERE settlement_date = ?
            ORDER BY settlement_period ASC, unit_id ASC, miner_model ASC
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Keys of every yield stored for the date
    pub async fn keys_by_date(&self, date: NaiveDate) -> Result<HashSet<YieldKey>, RepositoryError> {
        let rows: Vec<YieldKey> = sqlx::query_as(
            r#"
            SELECT settlement_period, unit_id, miner_model
            FROM yield_records
            WHERE settlement_date = ?
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Yields of the date whose model is one of `models` and whose
    /// settlement record still exists
    pub async fn count_matched(&self, date: NaiveDate, models: &[String]) -> Result<i64, RepositoryError> {
        if models.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; models.len()].join(", ");
        let sql = format!(
            r#"
            SELECT COUNT(*) FROM yield_records y
            JOIN settlement_records s
              ON s.settlement_date = y.settlement_date
             AND s.settlement_period = y.settlement_period
             AND s.unit_id = y.unit_id
            WHERE y.settlement_date = ? AND y.miner_model IN ({})
            "#,
            placeholders
        );

        let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(date);
        for model in models {
            query = query.bind(model);
        }
        let (count,) = query.fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Yields whose settlement record no longer exists
    pub async fn count_orphans(&self, date: NaiveDate) -> Result<i64, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM yield_records y
            WHERE y.settlement_date = ?
              AND NOT EXISTS (
                SELECT 1 FROM settlement_records s
                WHERE s.settlement_date = y.settlement_date
                  AND s.settlement_period = y.settlement_period
                  AND s.unit_id = y.unit_id
              )
            "#,
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn delete_orphans(&self, date: NaiveDate) -> Result<u64, RepositoryError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM yield_records
            WHERE settlement_date = ?
              AND NOT EXISTS (
                SELECT 1 FROM settlement_records s
                WHERE s.settlement_date = yield_records.settlement_date
                  AND s.settlement_period = yield_records.settlement_period
                  AND s.unit_id = yield_records.unit_id
              )
            "#,
        )
        .bind(date)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}
