//! Typed error type for the db crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The optimistic version check on a case failed.
    #[error("case {case_id} was modified concurrently (expected version {expected})")]
    VersionConflict { case_id: Uuid, expected: i64 },

    /// A status change that the record's lifecycle forbids.
    #[error("{entity} '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A locked (published) document or a non-draft version was overwritten.
    #[error("{entity} '{id}' is immutable")]
    Immutable { entity: &'static str, id: String },

    #[error("record already exists: {entity} '{id}'")]
    Duplicate { entity: &'static str, id: String },

    #[error("malformed column value: {0}")]
    Decode(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
