//! Decision table definitions and their authoring-time validation.
//!
//! A table is validated before a workflow version referencing it is
//! published; evaluation assumes a valid table and treats anything that
//! slipped through as a configuration defect.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::evaluate::{typed, Typed};

/// Declared type of the context variable a column reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Number,
    String,
    Boolean,
    /// `YYYY-MM-DD` strings.
    Date,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Date => "date",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Context variable the column reads; dotted paths are allowed.
    pub variable: String,
    pub data_type: DataType,
    pub sort_order: i32,
}

/// A test applied to the live value of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { value: Value },
    NotEq { value: Value },
    Gt { value: Value },
    Gte { value: Value },
    Lt { value: Value },
    Lte { value: Value },
    In { values: Vec<Value> },
    NotIn { values: Vec<Value> },
    /// Inclusive on both ends.
    Between { min: Value, max: Value },
}

impl Predicate {
    pub(crate) fn operands(&self) -> Vec<&Value> {
        match self {
            Self::Eq { value }
            | Self::NotEq { value }
            | Self::Gt { value }
            | Self::Gte { value }
            | Self::Lt { value }
            | Self::Lte { value } => vec![value],
            Self::In { values } | Self::NotIn { values } => values.iter().collect(),
            Self::Between { min, max } => vec![min, max],
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(
            self,
            Self::Gt { .. } | Self::Gte { .. } | Self::Lt { .. } | Self::Lte { .. } | Self::Between { .. }
        )
    }
}

/// One condition of a rule. Columns without a condition match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub predicate: Predicate,
}

/// A context assignment applied when the rule wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub variable: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    /// Lower values are evaluated first; unique within a table.
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// Branch label emitted when this rule wins.
    #[serde(default)]
    pub outcome: Option<String>,
}

/// What a table does when no rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    /// Emit the `no_match` outcome; the step must route it explicitly.
    #[default]
    Branch,
    /// Fail the step.
    Fail,
    /// Continue with no output.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTable {
    pub id: Uuid,
    pub name: String,
    pub columns: Vec<Column>,
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub no_match: NoMatchPolicy,
}

/// Authoring defects in a decision table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("column '{0}' is declared twice")]
    DuplicateColumn(String),

    #[error("sort order {0} is used by more than one column")]
    DuplicateSortOrder(i32),

    #[error("priority {0} is used by more than one rule")]
    DuplicatePriority(i32),

    #[error("rule {priority} references unknown column '{column}'")]
    UnknownColumn { priority: i32, column: String },

    #[error("rule {priority} has more than one condition on column '{column}'")]
    RepeatedColumn { priority: i32, column: String },

    #[error("rule {priority}: operand {operand} does not fit {data_type} column '{column}'")]
    OperandType {
        priority: i32,
        column: String,
        data_type: DataType,
        operand: Value,
    },

    #[error("rule {priority}: ordering comparison on boolean column '{column}'")]
    OrderingOnBoolean { priority: i32, column: String },

    #[error("rule {priority}: empty value set on column '{column}'")]
    EmptySet { priority: i32, column: String },

    #[error("rule {priority}: range on column '{column}' has min above max")]
    InvertedRange { priority: i32, column: String },

    #[error("rule {0} has neither outputs nor an outcome")]
    EmptyRule(i32),
}

impl DecisionTable {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Rules in evaluation order (ascending priority).
    pub fn ordered_rules(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }

    /// Every outcome label this table can emit.
    pub fn outcomes(&self) -> HashSet<&str> {
        let mut labels: HashSet<&str> = self
            .rules
            .iter()
            .map(|r| r.outcome.as_deref().unwrap_or(crate::OUTCOME_MATCHED))
            .collect();
        if self.no_match != NoMatchPolicy::Fail {
            labels.insert(crate::OUTCOME_NO_MATCH);
        }
        labels
    }

    /// Check the table's structural and type invariants.
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut names = HashSet::new();
        let mut sort_orders = HashSet::new();
        for column in &self.columns {
            if !names.insert(column.name.as_str()) {
                return Err(RuleError::DuplicateColumn(column.name.clone()));
            }
            if !sort_orders.insert(column.sort_order) {
                return Err(RuleError::DuplicateSortOrder(column.sort_order));
            }
        }

        let mut priorities = HashSet::new();
        for rule in &self.rules {
            if !priorities.insert(rule.priority) {
                return Err(RuleError::DuplicatePriority(rule.priority));
            }
            if rule.outputs.is_empty() && rule.outcome.is_none() {
                return Err(RuleError::EmptyRule(rule.priority));
            }
            self.validate_conditions(rule)?;
        }
        Ok(())
    }

    fn validate_conditions(&self, rule: &Rule) -> Result<(), RuleError> {
        let mut seen = HashSet::new();
        for condition in &rule.conditions {
            let column = self
                .column(&condition.column)
                .ok_or_else(|| RuleError::UnknownColumn {
                    priority: rule.priority,
                    column: condition.column.clone(),
                })?;
            if !seen.insert(column.name.as_str()) {
                return Err(RuleError::RepeatedColumn {
                    priority: rule.priority,
                    column: column.name.clone(),
                });
            }

            let predicate = &condition.predicate;
            if column.data_type == DataType::Boolean && predicate.is_ordering() {
                return Err(RuleError::OrderingOnBoolean {
                    priority: rule.priority,
                    column: column.name.clone(),
                });
            }

            let mut operands = Vec::new();
            for operand in predicate.operands() {
                match typed(column.data_type, operand) {
                    Ok(Some(value)) => operands.push(value),
                    _ => {
                        return Err(RuleError::OperandType {
                            priority: rule.priority,
                            column: column.name.clone(),
                            data_type: column.data_type,
                            operand: operand.clone(),
                        })
                    }
                }
            }

            match predicate {
                Predicate::In { values } | Predicate::NotIn { values } if values.is_empty() => {
                    return Err(RuleError::EmptySet {
                        priority: rule.priority,
                        column: column.name.clone(),
                    });
                }
                Predicate::Between { .. } => {
                    if let [min, max] = operands.as_slice() {
                        if Typed::partial_cmp(min, max) == Some(std::cmp::Ordering::Greater) {
                            return Err(RuleError::InvertedRange {
                                priority: rule.priority,
                                column: column.name.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
