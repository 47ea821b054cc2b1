//! Engine-level error types.

use db::DbError;
use steps::expr::ExprError;
use steps::rules::RuleError;
use steps::{StepError, StepType};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine (validation, authoring and
/// execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    #[error("workflow version has no steps")]
    EmptyWorkflow,

    #[error("start step '{0}' does not exist")]
    MissingStartStep(String),

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A route points at a step that doesn't exist in the version.
    #[error("step '{step_id}' routes to unknown step '{target}'")]
    UnknownStepReference { step_id: String, target: String },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    #[error("step '{step_id}' references missing {entity} {id}")]
    MissingDocument {
        step_id: String,
        entity: &'static str,
        id: Uuid,
    },

    #[error("step '{step_id}': invalid decision table: {source}")]
    InvalidTable {
        step_id: String,
        #[source]
        source: RuleError,
    },

    #[error("step '{step_id}': invalid formula: {source}")]
    InvalidFormula {
        step_id: String,
        #[source]
        source: ExprError,
    },

    /// A step's branch map does not route a label the step can emit.
    #[error("step '{step_id}' has no branch for outcome '{label}'")]
    UncoveredOutcome { step_id: String, label: String },

    /// A `branch`-policy table sits on a step without a `no_match` route.
    #[error("step '{step_id}' must route the 'no_match' outcome")]
    MissingNoMatchBranch { step_id: String },

    // ------ Authoring errors ------

    #[error("workflow version {0} is not a draft and cannot be modified")]
    ImmutableVersion(Uuid),

    #[error("{entity} {id} is referenced by a published version and cannot be modified")]
    DefinitionLocked { entity: &'static str, id: Uuid },

    #[error("malformed {entity} {id}: {message}")]
    Malformed {
        entity: &'static str,
        id: Uuid,
        message: String,
    },

    // ------ Execution errors ------

    #[error("workflow version {0} is not published")]
    VersionNotPublished(Uuid),

    #[error("no executor registered for step type '{0}'")]
    UnsupportedStepType(StepType),

    #[error("case is positioned on unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step_id}' routes by outcome but emitted none")]
    MissingOutcome { step_id: String },

    /// The emitted label is not in the step's branch map.
    #[error("step '{step_id}' emitted unrecognized outcome '{label}'")]
    UnrecognizedBranch { step_id: String, label: String },

    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("step '{step_id}' is misconfigured: {message}")]
    Configuration { step_id: String, message: String },

    #[error("step '{step_id}': no rule matched in decision table '{table}'")]
    NoRuleMatched { step_id: String, table: String },

    #[error("more than {limit} steps ran in one advance of case {case_id}")]
    ChainLimitExceeded { case_id: Uuid, limit: usize },

    /// Stale or replayed completion event.
    #[error("step execution {step_execution_id} is not the suspended step of case {case_id}")]
    InvalidResumeTarget {
        case_id: Uuid,
        step_execution_id: Uuid,
    },

    #[error("case {0} is not suspended")]
    CaseNotSuspended(Uuid),

    #[error("human task {0} is not open")]
    TaskNotOpen(Uuid),

    /// A step error that has been recorded on the case: the case is now
    /// Failed and `source` is the cause written to its step execution.
    #[error("case {case_id} failed: {source}")]
    CaseFailed {
        case_id: Uuid,
        #[source]
        source: Box<EngineError>,
    },

    /// The case changed under us; reload and retry.
    #[error("case {case_id} was modified concurrently")]
    ConcurrencyConflict { case_id: Uuid },

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(DbError),
}

impl EngineError {
    /// Errors that leave the case exactly as it was persisted. The engine
    /// never records these on the case.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ConcurrencyConflict { .. })
    }

    /// The step error underneath a [`CaseFailed`](Self::CaseFailed).
    pub fn cause(&self) -> &EngineError {
        match self {
            Self::CaseFailed { source, .. } => source,
            other => other,
        }
    }

    pub(crate) fn from_step(step_id: &str, err: StepError) -> Self {
        let step_id = step_id.to_owned();
        match err {
            StepError::NoRuleMatched { table } => Self::NoRuleMatched { step_id, table },
            StepError::Configuration(message) => Self::Configuration { step_id, message },
            StepError::Fatal(message) => Self::StepFailed { step_id, message },
            StepError::Store(e) => e.into(),
        }
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::VersionConflict { case_id, .. } => Self::ConcurrencyConflict { case_id },
            other => Self::Database(other),
        }
    }
}
