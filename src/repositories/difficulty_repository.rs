//! Repository for the date-scoped difficulty parameter

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::error::RepositoryError;
use crate::models::DifficultyEntry;

pub struct DifficultyRepository {
    pool: SqlitePool,
}

impl DifficultyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the difficulty for a date, replacing any earlier value
    pub async fn set(&self, date: NaiveDate, difficulty: f64) -> Result<DifficultyEntry, RepositoryError> {
        if !(difficulty.is_finite() && difficulty > 0.0) {
            return Err(RepositoryError::InvalidInput(format!(
                "Difficulty must be positive, got {}",
                difficulty
            )));
        }

        // Whole-number REALs come back from RETURNING as INTEGER, so the
        // entry is built from the bound values instead
        let entry = DifficultyEntry {
            difficulty_date: date,
            difficulty,
            recorded_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO difficulty_history (difficulty_date, difficulty, recorded_at)
            VALUES (?, ?, ?)
            ON CONFLICT (difficulty_date) DO UPDATE SET
                difficulty = excluded.difficulty,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(entry.difficulty_date)
        .bind(entry.difficulty)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    pub async fn get(&self, date: NaiveDate) -> Result<Option<DifficultyEntry>, RepositoryError> {
        let entry = sqlx::query_as::<_, DifficultyEntry>(
            r#"
            SELECT difficulty_date, difficulty, recorded_at
            FROM difficulty_history
            WHERE difficulty_date = ?
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Most recent difficulty recorded on or before `date`
    pub async fn latest_on_or_before(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DifficultyEntry>, RepositoryError> {
        let entry = sqlx::query_as::<_, DifficultyEntry>(
            r#"
            SELECT difficulty_date, difficulty, recorded_at
            FROM difficulty_history
            WHERE difficulty_date <= ?
            ORDER BY difficulty_date DESC
            LIMIT 1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }
}
