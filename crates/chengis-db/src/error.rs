//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for chengis_core::Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(msg) => chengis_core::Error::NotFound(msg),
            other => chengis_core::Error::Storage(other.to_string()),
        }
    }
}
