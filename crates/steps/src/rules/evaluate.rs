//! First-hit evaluation of a decision table against a case context.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;

use super::model::{Column, DataType, DecisionTable, Predicate};
use crate::Context;

/// A context or operand value interpreted as its column's data type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Typed<'a> {
    Number(f64),
    Text(&'a str),
    Bool(bool),
    Date(NaiveDate),
}

impl PartialOrd for Typed<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            // Booleans are equality-only.
            _ => None,
        }
    }
}

/// Interpret `value` as `data_type`. `Ok(None)` means null; `Err(())`
/// means the value has the wrong shape for the type.
pub(crate) fn typed(data_type: DataType, value: &Value) -> Result<Option<Typed<'_>>, ()> {
    match (data_type, value) {
        (_, Value::Null) => Ok(None),
        (DataType::Number, Value::Number(n)) => n.as_f64().map(|f| Some(Typed::Number(f))).ok_or(()),
        (DataType::String, Value::String(s)) => Ok(Some(Typed::Text(s))),
        (DataType::Boolean, Value::Bool(b)) => Ok(Some(Typed::Bool(*b))),
        (DataType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| Some(Typed::Date(d)))
            .map_err(|_| ()),
        _ => Err(()),
    }
}

/// The winning rule of an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub priority: i32,
    pub rule: String,
    pub output: Map<String, Value>,
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Matched(RuleMatch),
    NoMatch,
}

/// Configuration defects surfaced while evaluating.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("column '{column}' expects {expected} but the context holds {found}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        found: Value,
    },

    #[error("rule {priority} references unknown column '{column}'")]
    UnknownColumn { priority: i32, column: String },

    #[error("rule {priority}: operand {operand} does not fit column '{column}'")]
    BadOperand {
        priority: i32,
        column: String,
        operand: Value,
    },
}

static NULL: Value = Value::Null;

fn operand(data_type: DataType, value: &Value) -> Result<Typed<'_>, Value> {
    match typed(data_type, value) {
        Ok(Some(t)) => Ok(t),
        _ => Err(value.clone()),
    }
}

fn compare(live: Typed<'_>, data_type: DataType, value: &Value) -> Result<Option<Ordering>, Value> {
    Ok(live.partial_cmp(&operand(data_type, value)?))
}

fn contains(live: Typed<'_>, data_type: DataType, values: &[Value]) -> Result<bool, Value> {
    let mut found = false;
    for value in values {
        found |= live == operand(data_type, value)?;
    }
    Ok(found)
}

/// Whether `predicate` holds for `live`; `Err` carries a mistyped operand.
fn holds(predicate: &Predicate, live: Typed<'_>, data_type: DataType) -> Result<bool, Value> {
    use Ordering::{Equal, Greater, Less};

    Ok(match predicate {
        Predicate::Eq { value } => live == operand(data_type, value)?,
        Predicate::NotEq { value } => live != operand(data_type, value)?,
        Predicate::Gt { value } => compare(live, data_type, value)? == Some(Greater),
        Predicate::Gte { value } => {
            matches!(compare(live, data_type, value)?, Some(Greater | Equal))
        }
        Predicate::Lt { value } => compare(live, data_type, value)? == Some(Less),
        Predicate::Lte { value } => matches!(compare(live, data_type, value)?, Some(Less | Equal)),
        Predicate::In { values } => contains(live, data_type, values)?,
        Predicate::NotIn { values } => !contains(live, data_type, values)?,
        Predicate::Between { min, max } => {
            matches!(compare(live, data_type, min)?, Some(Greater | Equal))
                && matches!(compare(live, data_type, max)?, Some(Less | Equal))
        }
    })
}

impl DecisionTable {
    /// Evaluate rules in ascending priority; the first rule whose every
    /// condition holds wins.
    ///
    /// A column's live value is type-checked the first time a condition
    /// reads it; a mistyped value fails the evaluation rather than missing.
    /// Columns no evaluated condition reads are never checked. Null or
    /// missing values never satisfy a condition.
    pub fn evaluate(&self, ctx: &Context) -> Result<Evaluation, EvalError> {
        let columns: HashMap<&str, &Column> =
            self.columns.iter().map(|c| (c.name.as_str(), c)).collect();
        let mut live: HashMap<&str, Option<Typed<'_>>> = HashMap::new();

        'rules: for rule in self.ordered_rules() {
            for condition in &rule.conditions {
                let column = *columns.get(condition.column.as_str()).ok_or_else(|| {
                    EvalError::UnknownColumn {
                        priority: rule.priority,
                        column: condition.column.clone(),
                    }
                })?;
                let value = match live.get(column.name.as_str()).copied() {
                    Some(value) => value,
                    None => {
                        let raw = ctx.get(&column.variable).unwrap_or(&NULL);
                        let value = typed(column.data_type, raw).map_err(|()| {
                            EvalError::TypeMismatch {
                                column: column.name.clone(),
                                expected: column.data_type,
                                found: raw.clone(),
                            }
                        })?;
                        live.insert(column.name.as_str(), value);
                        value
                    }
                };
                let Some(value) = value else {
                    continue 'rules;
                };
                let matched = holds(&condition.predicate, value, column.data_type).map_err(
                    |operand| EvalError::BadOperand {
                        priority: rule.priority,
                        column: column.name.clone(),
                        operand,
                    },
                )?;
                if !matched {
                    continue 'rules;
                }
            }

            let mut output = Map::new();
            for assignment in &rule.outputs {
                output.insert(assignment.variable.clone(), assignment.value.clone());
            }
            return Ok(Evaluation::Matched(RuleMatch {
                priority: rule.priority,
                rule: rule.name.clone(),
                output,
                outcome: rule
                    .outcome
                    .clone()
                    .unwrap_or_else(|| crate::OUTCOME_MATCHED.to_owned()),
            }));
        }

        Ok(Evaluation::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{Condition, NoMatchPolicy, Output, Rule, RuleError};
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => Context::new(map),
            _ => panic!("test context must be an object"),
        }
    }

    fn column(name: &str, data_type: DataType, sort_order: i32) -> Column {
        Column {
            name: name.into(),
            variable: name.into(),
            data_type,
            sort_order,
        }
    }

    fn rule(priority: i32, conditions: Vec<Condition>, tier: &str) -> Rule {
        Rule {
            name: format!("P{priority}"),
            priority,
            conditions,
            outputs: vec![Output {
                variable: "tier".into(),
                value: json!(tier),
            }],
            outcome: None,
        }
    }

    fn when(column: &str, predicate: Predicate) -> Condition {
        Condition {
            column: column.into(),
            predicate,
        }
    }

    fn income_table() -> DecisionTable {
        DecisionTable {
            id: Uuid::new_v4(),
            name: "income tiers".into(),
            columns: vec![column("income", DataType::Number, 1)],
            rules: vec![
                rule(1, vec![when("income", Predicate::Gt { value: json!(100000) })], "high"),
                rule(2, vec![when("income", Predicate::Lte { value: json!(100000) })], "low"),
            ],
            no_match: NoMatchPolicy::Branch,
        }
    }

    fn output_of(evaluation: Evaluation) -> Map<String, Value> {
        match evaluation {
            Evaluation::Matched(m) => m.output,
            Evaluation::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn income_tiers() {
        let table = income_table();
        table.validate().unwrap();

        let low = output_of(table.evaluate(&ctx(json!({ "income": 50000 }))).unwrap());
        assert_eq!(Value::Object(low), json!({ "tier": "low" }));

        let high = output_of(table.evaluate(&ctx(json!({ "income": 150000 }))).unwrap());
        assert_eq!(Value::Object(high), json!({ "tier": "high" }));

        assert_eq!(
            table.evaluate(&ctx(json!({ "income": null }))).unwrap(),
            Evaluation::NoMatch
        );
        assert_eq!(table.evaluate(&ctx(json!({}))).unwrap(), Evaluation::NoMatch);
    }

    #[test]
    fn mistyped_context_value_is_an_error_not_a_miss() {
        let table = income_table();
        let err = table
            .evaluate(&ctx(json!({ "income": "fifty thousand" })))
            .unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { ref column, .. } if column == "income"));
    }

    #[test]
    fn unread_columns_are_not_type_checked() {
        let table = DecisionTable {
            id: Uuid::new_v4(),
            name: "filing".into(),
            columns: vec![
                column("status", DataType::String, 1),
                column("balance", DataType::Number, 2),
            ],
            rules: vec![
                rule(1, vec![when("status", Predicate::Eq { value: json!("joint") })], "joint"),
                rule(2, vec![when("balance", Predicate::Gt { value: json!(0) })], "owing"),
            ],
            no_match: NoMatchPolicy::Branch,
        };
        let mistyped = json!({ "status": "joint", "balance": "unknown" });

        let joint = output_of(table.evaluate(&ctx(mistyped)).unwrap());
        assert_eq!(Value::Object(joint), json!({ "tier": "joint" }));

        let err = table
            .evaluate(&ctx(json!({ "status": "single", "balance": "unknown" })))
            .unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { ref column, .. } if column == "balance"));
    }

    #[test]
    fn omitted_columns_are_wildcards() {
        let table = DecisionTable {
            id: Uuid::new_v4(),
            name: "filing".into(),
            columns: vec![
                column("status", DataType::String, 1),
                column("balance", DataType::Number, 2),
            ],
            rules: vec![
                rule(
                    10,
                    vec![
                        when("status", Predicate::Eq { value: json!("joint") }),
                        when("balance", Predicate::Between { min: json!(0), max: json!(10000) }),
                    ],
                    "streamlined",
                ),
                rule(
                    20,
                    vec![when("status", Predicate::In { values: vec![json!("single"), json!("joint")] })],
                    "standard",
                ),
            ],
            no_match: NoMatchPolicy::Fail,
        };
        table.validate().unwrap();

        let out = output_of(table.evaluate(&ctx(json!({ "status": "joint", "balance": 10000 }))).unwrap());
        assert_eq!(out["tier"], "streamlined");

        let out = output_of(table.evaluate(&ctx(json!({ "status": "joint", "balance": 25000 }))).unwrap());
        assert_eq!(out["tier"], "standard");

        assert_eq!(
            table.evaluate(&ctx(json!({ "status": "separate", "balance": 5 }))).unwrap(),
            Evaluation::NoMatch
        );
    }

    #[test]
    fn dates_compare_chronologically() {
        let table = DecisionTable {
            id: Uuid::new_v4(),
            name: "statute".into(),
            columns: vec![column("assessed_on", DataType::Date, 1)],
            rules: vec![rule(
                1,
                vec![when("assessed_on", Predicate::Lt { value: json!("2016-04-15") })],
                "expired",
            )],
            no_match: NoMatchPolicy::Empty,
        };
        table.validate().unwrap();

        let out = output_of(table.evaluate(&ctx(json!({ "assessed_on": "2015-12-31" }))).unwrap());
        assert_eq!(out["tier"], "expired");
        assert_eq!(
            table.evaluate(&ctx(json!({ "assessed_on": "2019-01-01" }))).unwrap(),
            Evaluation::NoMatch
        );
        assert!(table.evaluate(&ctx(json!({ "assessed_on": "last year" }))).is_err());
    }

    #[test]
    fn later_outputs_overwrite_earlier_ones() {
        let mut table = income_table();
        table.rules[0].outputs.push(Output {
            variable: "tier".into(),
            value: json!("very high"),
        });
        let out = output_of(table.evaluate(&ctx(json!({ "income": 200000 }))).unwrap());
        assert_eq!(out["tier"], "very high");
    }

    #[test]
    fn validation_rejects_authoring_defects() {
        let mut table = income_table();
        table.rules[1].priority = 1;
        assert_eq!(table.validate(), Err(RuleError::DuplicatePriority(1)));

        let mut table = income_table();
        table.rules[0].conditions[0].predicate = Predicate::Gt { value: json!("lots") };
        assert!(matches!(table.validate(), Err(RuleError::OperandType { priority: 1, .. })));

        let mut table = income_table();
        table.rules[0].conditions.push(when("age", Predicate::Gt { value: json!(65) }));
        assert!(matches!(table.validate(), Err(RuleError::UnknownColumn { .. })));

        let mut table = income_table();
        table.rules[0].conditions[0].predicate =
            Predicate::Between { min: json!(10), max: json!(5) };
        assert!(matches!(table.validate(), Err(RuleError::InvertedRange { .. })));

        let mut table = income_table();
        table.columns.push(column("married", DataType::Boolean, 2));
        table.rules[0]
            .conditions
            .push(when("married", Predicate::Gte { value: json!(true) }));
        assert!(matches!(table.validate(), Err(RuleError::OrderingOnBoolean { .. })));
    }

    #[test]
    fn outcomes_include_no_match_unless_policy_fails() {
        let mut table = income_table();
        table.rules[0].outcome = Some("refer".into());
        let labels = table.outcomes();
        assert!(labels.contains("refer"));
        assert!(labels.contains(crate::OUTCOME_MATCHED));
        assert!(labels.contains(crate::OUTCOME_NO_MATCH));

        table.no_match = NoMatchPolicy::Fail;
        assert!(!table.outcomes().contains(crate::OUTCOME_NO_MATCH));
    }

    proptest! {
        // Two always-matching rules: the lower priority wins regardless of
        // declaration order.
        #[test]
        fn lower_priority_wins(a in -1000i32..1000, b in -1000i32..1000, income in 0i64..1_000_000) {
            prop_assume!(a != b);
            let gte_zero = || vec![when("income", Predicate::Gte { value: json!(0) })];
            let table = DecisionTable {
                id: Uuid::nil(),
                name: "overlap".into(),
                columns: vec![column("income", DataType::Number, 1)],
                rules: vec![rule(a, gte_zero(), "a"), rule(b, gte_zero(), "b")],
                no_match: NoMatchPolicy::Fail,
            };
            let expected = if a < b { "a" } else { "b" };
            let out = output_of(table.evaluate(&ctx(json!({ "income": income }))).unwrap());
            prop_assert_eq!(&out["tier"], &json!(expected));
        }

        // A context matching exactly one rule yields that rule's outputs no
        // matter where the non-matching rules sit.
        #[test]
        fn single_match_ignores_other_priorities(target in -50i32..50, others in proptest::collection::hash_set(-50i32..50, 0..6)) {
            let mut rules: Vec<Rule> = others
                .iter()
                .filter(|p| **p != target)
                .map(|p| rule(*p, vec![when("income", Predicate::Lt { value: json!(0) })], "miss"))
                .collect();
            rules.push(rule(target, vec![when("income", Predicate::Eq { value: json!(42) })], "hit"));
            let table = DecisionTable {
                id: Uuid::nil(),
                name: "single".into(),
                columns: vec![column("income", DataType::Number, 1)],
                rules,
                no_match: NoMatchPolicy::Fail,
            };
            prop_assert!(table.validate().is_ok());
            let out = output_of(table.evaluate(&ctx(json!({ "income": 42 }))).unwrap());
            prop_assert_eq!(Value::Object(out), json!({ "tier": "hit" }));
        }
    }
}
