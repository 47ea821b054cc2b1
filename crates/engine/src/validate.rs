//! Publish-time validation of a version against the documents it uses.

use std::collections::HashMap;

use steps::formula::Formula;
use steps::rules::{DecisionTable, NoMatchPolicy};
use steps::{StepConfig, OUTCOME_COMPUTED, OUTCOME_NO_MATCH};
use uuid::Uuid;

use crate::dag::validate_dag;
use crate::models::{Routing, WorkflowStep, WorkflowVersion};
use crate::EngineError;

/// The tables and formulas a version may reference, keyed by id.
#[derive(Debug, Default)]
pub struct Documents {
    pub tables: HashMap<Uuid, DecisionTable>,
    pub formulas: HashMap<Uuid, Formula>,
}

impl Documents {
    pub fn new(tables: Vec<DecisionTable>, formulas: Vec<Formula>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.id, t)).collect(),
            formulas: formulas.into_iter().map(|f| (f.id, f)).collect(),
        }
    }
}

/// Everything `publish` checks: the step graph, each referenced
/// document, and that every outcome a step can emit is routed.
///
/// Returns the topological step order.
pub fn validate_version(
    version: &WorkflowVersion,
    documents: &Documents,
) -> Result<Vec<String>, EngineError> {
    let order = validate_dag(version)?;
    for step in &version.steps {
        validate_step(step, documents)?;
    }
    Ok(order)
}

fn validate_step(step: &WorkflowStep, documents: &Documents) -> Result<(), EngineError> {
    match &step.config {
        StepConfig::DecisionTable { table_id } => {
            let table = documents
                .tables
                .get(table_id)
                .ok_or_else(|| EngineError::MissingDocument {
                    step_id: step.id.clone(),
                    entity: "decision table",
                    id: *table_id,
                })?;
            table.validate().map_err(|source| EngineError::InvalidTable {
                step_id: step.id.clone(),
                source,
            })?;

            let routes_no_match = matches!(
                &step.routing,
                Routing::Branch { outcomes } if outcomes.contains_key(OUTCOME_NO_MATCH)
            );
            if table.no_match == NoMatchPolicy::Branch && !routes_no_match {
                return Err(EngineError::MissingNoMatchBranch {
                    step_id: step.id.clone(),
                });
            }

            let mut labels: Vec<&str> = table.outcomes().into_iter().collect();
            labels.sort_unstable();
            check_coverage(step, &labels)
        }
        StepConfig::Formula { formula_id } => {
            let formula = documents
                .formulas
                .get(formula_id)
                .ok_or_else(|| EngineError::MissingDocument {
                    step_id: step.id.clone(),
                    entity: "formula",
                    id: *formula_id,
                })?;
            formula
                .compile()
                .map_err(|source| EngineError::InvalidFormula {
                    step_id: step.id.clone(),
                    source,
                })?;
            check_coverage(step, &[OUTCOME_COMPUTED])
        }
        // Decision labels come from people; an unexpected one fails the
        // case when it arrives.
        StepConfig::HumanTask(_) => Ok(()),
    }
}

fn check_coverage(step: &WorkflowStep, labels: &[&str]) -> Result<(), EngineError> {
    let Routing::Branch { outcomes } = &step.routing else {
        return Ok(());
    };
    match labels.iter().find(|label| !outcomes.contains_key(**label)) {
        Some(label) => Err(EngineError::UncoveredOutcome {
            step_id: step.id.clone(),
            label: (*label).to_owned(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::PublicationStatus;
    use serde_json::json;
    use steps::rules::{Column, Condition, DataType, Output, Predicate, Rule, RuleError};

    fn table(no_match: NoMatchPolicy) -> DecisionTable {
        DecisionTable {
            id: Uuid::new_v4(),
            name: "risk".into(),
            columns: vec![Column {
                name: "score".into(),
                variable: "score".into(),
                data_type: DataType::Number,
                sort_order: 1,
            }],
            rules: vec![Rule {
                name: "risky".into(),
                priority: 1,
                conditions: vec![Condition {
                    column: "score".into(),
                    predicate: Predicate::Gte { value: json!(700) },
                }],
                outputs: vec![Output {
                    variable: "risk".into(),
                    value: json!("high"),
                }],
                outcome: Some("high".into()),
            }],
            no_match,
        }
    }

    fn single_step(config: StepConfig, routing: Routing) -> WorkflowVersion {
        WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id: Uuid::new_v4(),
            number: 1,
            status: PublicationStatus::Draft,
            start_step: "only".into(),
            steps: vec![WorkflowStep {
                id: "only".into(),
                name: String::new(),
                config,
                routing,
            }],
        }
    }

    fn branch(labels: &[&str]) -> Routing {
        Routing::Branch {
            outcomes: labels.iter().map(|l| (l.to_string(), None)).collect(),
        }
    }

    #[test]
    fn branch_policy_tables_need_a_no_match_route() {
        let t = table(NoMatchPolicy::Branch);
        let config = StepConfig::DecisionTable { table_id: t.id };
        let docs = Documents::new(vec![t], vec![]);

        let v = single_step(config.clone(), Routing::Terminal);
        assert!(matches!(
            validate_version(&v, &docs),
            Err(EngineError::MissingNoMatchBranch { .. })
        ));

        let v = single_step(config.clone(), branch(&["no_match"]));
        assert!(matches!(
            validate_version(&v, &docs),
            Err(EngineError::UncoveredOutcome { label, .. }) if label == "high"
        ));

        let v = single_step(config, branch(&["high", "no_match"]));
        assert!(validate_version(&v, &docs).is_ok());
    }

    #[test]
    fn empty_and_fail_policies_may_fall_through() {
        for policy in [NoMatchPolicy::Empty, NoMatchPolicy::Fail] {
            let t = table(policy);
            let v = single_step(StepConfig::DecisionTable { table_id: t.id }, Routing::Terminal);
            assert!(validate_version(&v, &Documents::new(vec![t], vec![])).is_ok());
        }
    }

    #[test]
    fn referenced_documents_must_exist_and_be_valid() {
        let mut t = table(NoMatchPolicy::Empty);
        let v = single_step(StepConfig::DecisionTable { table_id: t.id }, Routing::Terminal);
        assert!(matches!(
            validate_version(&v, &Documents::default()),
            Err(EngineError::MissingDocument { entity: "decision table", .. })
        ));

        t.rules.push(t.rules[0].clone());
        assert!(matches!(
            validate_version(&v, &Documents::new(vec![t], vec![])),
            Err(EngineError::InvalidTable {
                source: RuleError::DuplicatePriority(1),
                ..
            })
        ));

        let formula = Formula {
            id: Uuid::new_v4(),
            name: "broken".into(),
            expression: "income *".into(),
            output: "x".into(),
            decimals: None,
        };
        let v = single_step(
            StepConfig::Formula {
                formula_id: formula.id,
            },
            branch(&["computed"]),
        );
        assert!(matches!(
            validate_version(&v, &Documents::new(vec![], vec![formula])),
            Err(EngineError::InvalidFormula { .. })
        ));
    }
}
