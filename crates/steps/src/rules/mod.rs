//! The rule model: prioritized decision tables and their evaluator.

mod evaluate;
mod model;

pub use evaluate::{EvalError, Evaluation, RuleMatch};
pub use model::{
    Column, Condition, DataType, DecisionTable, NoMatchPolicy, Output, Predicate, Rule, RuleError,
};
