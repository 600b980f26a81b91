//! Error types for Mergeline
//!
//! All errors in the crate are converted to `AppError`. Ingestion
//! distinguishes transient failures (worth retrying the batch later)
//! from permanent ones via [`AppError::is_transient`].

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Entity not found
    #[error("Resource not found")]
    NotFound,

    /// Malformed input: empty identity, bad URL, missing account
    #[error("Validation error: {0}")]
    Validation(String),

    /// Nested records went deeper than the ingest guard allows
    #[error("Nesting too deep: {0} levels")]
    DepthExceeded(usize),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

// SQLITE_BUSY / SQLITE_LOCKED primary result codes
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

impl AppError {
    /// Whether the failure is transient (store locked, pool exhausted, I/O hiccup).
    ///
    /// Transient errors leave the store consistent; retrying the same
    /// batch later is safe because every upsert is idempotent.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(error) => is_transient_sqlx(error),
            _ => false,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        if self.is_transient() {
            return "soft";
        }
        match self {
            AppError::NotFound => "not_found",
            _ => "hard",
        }
    }
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_error) => db_error
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            // extended result codes carry the primary code in the low byte
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}

/// Whether a database error is a UNIQUE / PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(error: &AppError) -> bool {
    matches!(
        error,
        AppError::Database(sqlx::Error::Database(db_error)) if db_error.is_unique_violation()
    )
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_a_hard_error() {
        let error = AppError::Validation("empty remote id".to_string());
        assert!(!error.is_transient());
        assert_eq!(error.kind(), "hard");
    }

    #[test]
    fn pool_timeout_is_transient() {
        let error = AppError::Database(sqlx::Error::PoolTimedOut);
        assert!(error.is_transient());
        assert_eq!(error.kind(), "soft");
    }

    #[test]
    fn not_found_has_its_own_kind() {
        assert_eq!(AppError::NotFound.kind(), "not_found");
        assert!(!is_unique_violation(&AppError::NotFound));
    }
}
