use chrono::NaiveDate;
use sqlx::Error as SqlxError;
use thiserror::Error;

use crate::database::DatabaseError;

/// Application-level error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Repository errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Pipeline stage errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unit registry could not be loaded
    #[error("Registry error: {0}")]
    Registry(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Failures raised by the ingestion and reconciliation stages
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Transient network, rate limit or 5xx failure; retried with backoff
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Permanent upstream failure such as a malformed response
    #[error("Upstream fatal error: {0}")]
    UpstreamFatal(String),

    /// Deadline passed or job cancelled before the call completed
    #[error("Operation cancelled")]
    Cancelled,

    /// No difficulty available for the date
    #[error("Missing difficulty parameter for {date}")]
    MissingParameter { date: NaiveDate },

    /// Storage failure; the affected write did not happen
    #[error("Persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    /// Repair cycles ran out before the scope became consistent
    #[error("Reconciliation exhausted for {scope} after {cycles} repair cycles")]
    ReconciliationExhausted { scope: String, cycles: u32 },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Upstream(_))
    }
}

/// Repository-specific error types
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database query error
    #[error("Query error: {0}")]
    Query(SqlxError),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Duplicate record
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

// SQLite extended result codes
const SQLITE_CONSTRAINT_CHECK: &str = "275";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

impl From<SqlxError> for RepositoryError {
    fn from(err: SqlxError) -> Self {
        match &err {
            SqlxError::RowNotFound => RepositoryError::NotFound("Record not found".to_string()),
            SqlxError::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                match code.as_deref() {
                    Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY) => {
                        RepositoryError::Duplicate(db_err.message().to_string())
                    }
                    Some(SQLITE_CONSTRAINT_FOREIGNKEY) | Some(SQLITE_CONSTRAINT_CHECK) => {
                        RepositoryError::ConstraintViolation(db_err.message().to_string())
                    }
                    _ => RepositoryError::Query(err),
                }
            }
            _ => RepositoryError::Query(err),
        }
    }
}

impl From<SqlxError> for PipelineError {
    fn from(err: SqlxError) -> Self {
        PipelineError::Persistence(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_upstream_errors_are_transient() {
        assert!(PipelineError::Upstream("503".into()).is_transient());
        assert!(!PipelineError::UpstreamFatal("bad schema".into()).is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(!PipelineError::MissingParameter { date }.is_transient());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: RepositoryError = SqlxError::RowNotFound.into();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[test]
    fn test_missing_parameter_message_names_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let err = PipelineError::MissingParameter { date };
        assert_eq!(err.to_string(), "Missing difficulty parameter for 2024-03-09");
    }
}
