//! Database error types.

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::store::StoreError;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the candidate migration directories exists.
    #[error("no migrations directory found (tried {tried})")]
    MigrationDirNotFound { tried: String },

    /// A stored row could not be decoded.
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<DbError> for DispatchError {
    fn from(err: DbError) -> Self {
        DispatchError::Backend(err.to_string())
    }
}
