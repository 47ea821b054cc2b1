use std::sync::Arc;

use async_trait::async_trait;
use db::models::RuleDocumentKind;
use db::Store;
use serde_json::Map;
use tracing::{debug, instrument};

use super::DocumentCache;
use crate::rules::{DecisionTable, Evaluation, NoMatchPolicy};
use crate::{StepConfig, StepError, StepExecutor, StepInvocation, StepOutcome, StepType};

/// Runs `decision_table` steps: first-hit evaluation of the referenced table.
pub struct DecisionTableExecutor {
    tables: DocumentCache<DecisionTable>,
}

impl DecisionTableExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            tables: DocumentCache::new(store, RuleDocumentKind::DecisionTable),
        }
    }
}

#[async_trait]
impl StepExecutor for DecisionTableExecutor {
    fn step_type(&self) -> StepType {
        StepType::DecisionTable
    }

    #[instrument(skip_all, fields(case_id = %invocation.case_id, step_id = invocation.step_id))]
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let StepConfig::DecisionTable { table_id } = invocation.config else {
            return Err(StepError::Configuration(format!(
                "step '{}' is not configured as a decision table",
                invocation.step_id
            )));
        };

        let table = self
            .tables
            .get(*table_id, |body| {
                serde_json::from_value(body).map_err(|e| {
                    StepError::Configuration(format!("decision table {table_id} is malformed: {e}"))
                })
            })
            .await?;

        let evaluation = table
            .evaluate(invocation.context)
            .map_err(|e| StepError::Configuration(format!("decision table '{}': {e}", table.name)))?;

        match evaluation {
            Evaluation::Matched(hit) => {
                debug!(table = %table.name, priority = hit.priority, outcome = %hit.outcome, "rule matched");
                Ok(StepOutcome::advance(hit.output, hit.outcome))
            }
            Evaluation::NoMatch => match table.no_match {
                NoMatchPolicy::Fail => Err(StepError::NoRuleMatched {
                    table: table.name.clone(),
                }),
                NoMatchPolicy::Branch | NoMatchPolicy::Empty => {
                    debug!(table = %table.name, "no rule matched");
                    Ok(StepOutcome::advance(Map::new(), crate::OUTCOME_NO_MATCH))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Column, Condition, DataType, Output, Predicate, Rule};
    use crate::Context;
    use chrono::Utc;
    use db::models::RuleDocumentRecord;
    use db::MemoryStore;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn income_table(no_match: NoMatchPolicy) -> DecisionTable {
        let tier = |priority, predicate, tier: &str| Rule {
            name: format!("{tier} income"),
            priority,
            conditions: vec![Condition {
                column: "income".into(),
                predicate,
            }],
            outputs: vec![Output {
                variable: "tier".into(),
                value: json!(tier),
            }],
            outcome: Some(tier.to_owned()),
        };
        DecisionTable {
            id: Uuid::new_v4(),
            name: "income tier".into(),
            columns: vec![Column {
                name: "income".into(),
                variable: "income".into(),
                data_type: DataType::Number,
                sort_order: 1,
            }],
            rules: vec![
                tier(1, Predicate::Gt { value: json!(100000) }, "high"),
                tier(2, Predicate::Lte { value: json!(100000) }, "low"),
            ],
            no_match,
        }
    }

    async fn store_with(table: &DecisionTable, locked: bool) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .save_rule_document(&RuleDocumentRecord {
                id: table.id,
                kind: RuleDocumentKind::DecisionTable,
                name: table.name.clone(),
                body: serde_json::to_value(table).unwrap(),
                locked,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    async fn run(
        executor: &DecisionTableExecutor,
        table: &DecisionTable,
        context: Value,
    ) -> Result<StepOutcome, StepError> {
        let Value::Object(map) = context else {
            panic!("test context must be an object");
        };
        let context = Context::new(map);
        let config = StepConfig::DecisionTable { table_id: table.id };
        executor
            .execute(StepInvocation {
                case_id: Uuid::new_v4(),
                step_execution_id: Uuid::new_v4(),
                step_id: "assess",
                config: &config,
                context: &context,
            })
            .await
    }

    #[tokio::test]
    async fn matched_rule_advances_with_its_outputs_and_outcome() {
        let table = income_table(NoMatchPolicy::Branch);
        let executor = DecisionTableExecutor::new(store_with(&table, true).await);

        let outcome = run(&executor, &table, json!({ "income": 50000 })).await.unwrap();
        let StepOutcome::Advance { output, outcome } = outcome else {
            panic!("expected advance");
        };
        assert_eq!(output["tier"], json!("low"));
        assert_eq!(outcome.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn null_input_follows_the_no_match_policy() {
        let table = income_table(NoMatchPolicy::Branch);
        let executor = DecisionTableExecutor::new(store_with(&table, true).await);
        assert_eq!(
            run(&executor, &table, json!({ "income": null })).await.unwrap(),
            StepOutcome::advance(Map::new(), crate::OUTCOME_NO_MATCH)
        );

        let strict = income_table(NoMatchPolicy::Fail);
        let executor = DecisionTableExecutor::new(store_with(&strict, true).await);
        assert!(matches!(
            run(&executor, &strict, json!({ "income": null })).await,
            Err(StepError::NoRuleMatched { table }) if table == "income tier"
        ));
    }

    #[tokio::test]
    async fn type_mismatch_is_a_configuration_error() {
        let table = income_table(NoMatchPolicy::Branch);
        let executor = DecisionTableExecutor::new(store_with(&table, true).await);
        let err = run(&executor, &table, json!({ "income": "lots" })).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn unlocked_tables_are_reloaded() {
        let mut table = income_table(NoMatchPolicy::Branch);
        let store = store_with(&table, false).await;
        let executor = DecisionTableExecutor::new(store.clone());
        run(&executor, &table, json!({ "income": 1 })).await.unwrap();

        table.rules[1].outputs[0].value = json!("modest");
        store
            .save_rule_document(&RuleDocumentRecord {
                id: table.id,
                kind: RuleDocumentKind::DecisionTable,
                name: table.name.clone(),
                body: serde_json::to_value(&table).unwrap(),
                locked: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let StepOutcome::Advance { output, .. } =
            run(&executor, &table, json!({ "income": 1 })).await.unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(output["tier"], json!("modest"));
    }
}
