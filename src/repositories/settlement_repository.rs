//! Repository for canonical settlement records

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::error::RepositoryError;
use crate::models::{SettlementCandidate, SettlementRecord, WriteSummary};

const RECORD_COLUMNS: &str = r#"
    settlement_date, settlement_period, unit_id, volume, payment,
    original_price, final_price, so_flag, cadl_flag, lead_party_name, ingested_at
"#;

pub struct SettlementRepository {
    pool: SqlitePool,
}

impl SettlementRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace every record of one (date, period) in a single transaction.
    ///
    /// Yields belonging to the period are dropped in the same unit of work,
    /// so a yield never outlives the record it was derived from. Either the
    /// whole period is replaced or nothing changes.
    pub async fn replace_period(
        &self,
        date: NaiveDate,
        period: i32,
        candidates: &[SettlementCandidate],
    ) -> Result<WriteSummary, RepositoryError> {
        if let Some(stray) = candidates
            .iter()
            .find(|c| c.settlement_date != date || c.settlement_period != period)
        {
            return Err(RepositoryError::InvalidInput(format!(
                "Candidate {} belongs to {} period {}, not {} period {}",
                stray.unit_id, stray.settlement_date, stray.settlement_period, date, period
            )));
        }

        let ingested_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM yield_records
            WHERE settlement_date = ? AND settlement_period = ?
            "#,
        )
        .bind(date)
        .bind(period)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM settlement_records
            WHERE settlement_date = ? AND settlement_period = ?
            "#,
        )
        .bind(date)
        .bind(period)
        .execute(&mut *tx)
        .await?;

        for candidate in candidates {
            sqlx::query(
                r#"
                INSERT INTO settlement_records
                (settlement_date, settlement_period, unit_id, volume, payment,
                 original_price, final_price, so_flag, cadl_flag, lead_party_name, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(candidate.settlement_date)
            .bind(candidate.settlement_period)
            .bind(&candidate.unit_id)
            .bind(candidate.volume)
            .bind(candidate.payment)
            .bind(candidate.original_price)
            .bind(candidate.final_price)
            .bind(candidate.so_flag)
            .bind(candidate.cadl_flag)
            .bind(&candidate.lead_party_name)
            .bind(ingested_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(WriteSummary::from_candidates(date, period, candidates))
    }

    /// All records of a date, ordered by period then unit
    pub async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<SettlementRecord>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM settlement_records WHERE settlement_date = ? \
             ORDER BY settlement_period ASC, unit_id ASC",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, SettlementRecord>(&sql)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}
