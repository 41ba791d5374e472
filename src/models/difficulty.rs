use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Network difficulty in force for a calendar day
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DifficultyEntry {
    pub difficulty_date: NaiveDate,
    pub difficulty: f64,
    pub recorded_at: DateTime<Utc>,
}
