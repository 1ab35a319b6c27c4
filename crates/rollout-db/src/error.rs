//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for rollout_core::Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => rollout_core::Error::NotFound(what),
            other => rollout_core::Error::Storage(other.to_string()),
        }
    }
}
