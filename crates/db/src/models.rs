//! Records persisted by a [`Store`](crate::Store).
//!
//! These are *persistence* models; they carry no domain behaviour.
//! Workflow and rule definitions are stored as opaque JSON documents and
//! interpreted by the `steps` and `engine` crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Implements `Display` / `FromStr` for a unit-only status enum using the
/// snake_case names that are written to the `status` text columns.
macro_rules! text_status {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($text),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    )),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// workflow_definitions / workflow_versions
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow definition and of each of its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Draft,
    Published,
    Archived,
}

text_status!(PublicationStatus {
    Draft => "draft",
    Published => "published",
    Archived => "archived",
});

/// A named workflow; versions hang off it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinitionRecord {
    pub id: Uuid,
    pub name: String,
    pub status: PublicationStatus,
    pub created_at: DateTime<Utc>,
}

/// One version snapshot of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersionRecord {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub number: i32,
    pub status: PublicationStatus,
    /// Steps, start step, … as produced by the engine's `WorkflowVersion`.
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// decision_tables / formulas
// ---------------------------------------------------------------------------

/// Which kind of rule document a [`RuleDocumentRecord`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDocumentKind {
    DecisionTable,
    Formula,
}

text_status!(RuleDocumentKind {
    DecisionTable => "decision_table",
    Formula => "formula",
});

/// A decision table or formula referenced by workflow steps.
///
/// `locked` is set once a published workflow version references the
/// document; locked documents are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDocumentRecord {
    pub id: Uuid,
    pub kind: RuleDocumentKind,
    pub name: String,
    pub body: Value,
    pub locked: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// case_workflows
// ---------------------------------------------------------------------------

/// Status of a running case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

text_status!(CaseStatus {
    Running => "running",
    Suspended => "suspended",
    Completed => "completed",
    Failed => "failed",
});

impl CaseStatus {
    /// `Completed` and `Failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One running instance of a workflow version bound to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub workflow_version_id: Uuid,
    /// `None` once the workflow graph has terminated.
    pub current_step_id: Option<String>,
    pub status: CaseStatus,
    pub context: Map<String, Value>,
    /// Optimistic concurrency counter, bumped by every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// step_executions
// ---------------------------------------------------------------------------

/// Status of one step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Succeeded,
    Failed,
    Suspended,
}

text_status!(StepExecutionStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Suspended => "suspended",
});

impl StepExecutionStatus {
    /// Whether a record in `self` may be settled to `next`.
    ///
    /// Pending records settle to anything else; Suspended records only to
    /// Succeeded or Failed. Succeeded and Failed records are final.
    pub fn can_settle_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Suspended => matches!(next, Self::Succeeded | Self::Failed),
            Self::Succeeded | Self::Failed => false,
        }
    }
}

/// Append-only audit record of a single step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub step_id: String,
    /// Position in the case history, starting at 1.
    pub sequence: i64,
    pub status: StepExecutionStatus,
    /// Context snapshot the step ran against.
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The settlement written for a step execution at a commit point.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSettlement {
    pub step_execution_id: Uuid,
    pub status: StepExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// human_tasks
// ---------------------------------------------------------------------------

/// Status of a manual decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanTaskStatus {
    Open,
    Completed,
    Cancelled,
}

text_status!(HumanTaskStatus {
    Open => "open",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// A pending approval bound to a suspended step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanTaskRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_id: String,
    pub title: String,
    pub assignee: String,
    pub due_at: Option<DateTime<Utc>>,
    pub status: HumanTaskStatus,
    pub decision: Option<Value>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            CaseStatus::Running,
            CaseStatus::Suspended,
            CaseStatus::Completed,
            CaseStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<CaseStatus>(), Ok(status));
        }
        assert_eq!(
            "decision_table".parse::<RuleDocumentKind>(),
            Ok(RuleDocumentKind::DecisionTable)
        );
        assert!("paused".parse::<CaseStatus>().is_err());
    }

    #[test]
    fn settled_step_executions_are_final() {
        use StepExecutionStatus::*;
        assert!(Pending.can_settle_to(Suspended));
        assert!(Pending.can_settle_to(Failed));
        assert!(!Pending.can_settle_to(Pending));
        assert!(Suspended.can_settle_to(Succeeded));
        assert!(!Suspended.can_settle_to(Suspended));
        assert!(!Succeeded.can_settle_to(Failed));
        assert!(!Failed.can_settle_to(Succeeded));
    }
}
