//! The `StepExecutor` trait: the contract every step kind must fulfil.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Context, StepError};

/// Label emitted by a decision table rule without an explicit outcome.
pub const OUTCOME_MATCHED: &str = "matched";
/// Label emitted when no decision table rule matched.
pub const OUTCOME_NO_MATCH: &str = "no_match";
/// Label emitted by formula steps.
pub const OUTCOME_COMPUTED: &str = "computed";

/// The fixed set of step kinds the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    DecisionTable,
    Formula,
    HumanTask,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DecisionTable => "decision_table",
            Self::Formula => "formula",
            Self::HumanTask => "human_task",
        })
    }
}

/// Step-specific configuration carried by a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    DecisionTable { table_id: Uuid },
    Formula { formula_id: Uuid },
    HumanTask(HumanTaskConfig),
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::DecisionTable { .. } => StepType::DecisionTable,
            Self::Formula { .. } => StepType::Formula,
            Self::HumanTask(_) => StepType::HumanTask,
        }
    }
}

fn default_decision_variable() -> String {
    "decision".to_owned()
}

/// Configuration of a manual approval step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanTaskConfig {
    pub title: String,
    pub assignee: String,
    /// Due date offset from task creation, in days.
    #[serde(default)]
    pub due_in_days: Option<i64>,
    /// Key of the decision payload that selects the outgoing branch.
    #[serde(default = "default_decision_variable")]
    pub decision_variable: String,
}

/// Everything an executor gets to see about the step it runs.
#[derive(Debug, Clone, Copy)]
pub struct StepInvocation<'a> {
    pub case_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_id: &'a str,
    pub config: &'a StepConfig,
    pub context: &'a Context,
}

/// What a step asks the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Merge `output` into the context and move on. `outcome` selects the
    /// branch when the step routes by outcome label.
    Advance {
        output: Map<String, Value>,
        outcome: Option<String>,
    },
    /// Park the case until the human task is completed.
    Suspend { human_task_id: Uuid },
}

impl StepOutcome {
    pub fn advance(output: Map<String, Value>, outcome: impl Into<String>) -> Self {
        Self::Advance {
            output,
            outcome: Some(outcome.into()),
        }
    }
}

/// The core step trait.
///
/// Executors are registered once at startup, one per [`StepType`].
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn step_type(&self) -> StepType;

    /// Run the step against the case context.
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_config_is_tagged_by_type() {
        let config: StepConfig = serde_json::from_value(json!({
            "type": "human_task",
            "title": "Approve installment agreement",
            "assignee": "case-officer"
        }))
        .unwrap();

        let StepConfig::HumanTask(task) = &config else {
            panic!("expected a human task config");
        };
        assert_eq!(task.decision_variable, "decision");
        assert_eq!(task.due_in_days, None);
        assert_eq!(config.step_type(), StepType::HumanTask);

        let table: StepConfig = serde_json::from_value(json!({
            "type": "decision_table",
            "table_id": "00000000-0000-0000-0000-000000000001"
        }))
        .unwrap();
        assert_eq!(table.step_type(), StepType::DecisionTable);
    }
}
