//! Repository functions: one function per database operation.
//!
//! Every function takes a `&PgPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types: pure SQL.

use std::str::FromStr;

use crate::DbError;

pub mod executions;
pub mod tasks;
pub mod workflows;

/// Parse a text status column into its enum.
fn parse_column<T: FromStr<Err = String>>(raw: &str) -> Result<T, DbError> {
    raw.parse().map_err(DbError::Decode)
}
