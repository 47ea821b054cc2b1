//! Step-level error type.

use db::DbError;
use thiserror::Error;

/// Errors returned by a step executor's `execute` method.
///
/// The engine records every variant except `Store` as a Failed step
/// execution and fails the case; it never retries. `Store` errors are
/// propagated unchanged because the step may or may not have committed.
#[derive(Debug, Error)]
pub enum StepError {
    /// A decision table with the `fail` no-match policy matched nothing.
    #[error("no rule matched in decision table '{table}'")]
    NoRuleMatched { table: String },

    /// An authoring defect discovered while running the step.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The step could not produce a result for this case.
    #[error("step failed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] DbError),
}

impl StepError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
