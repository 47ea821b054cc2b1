use std::sync::Arc;

use async_trait::async_trait;
use db::models::RuleDocumentKind;
use db::Store;
use tracing::debug;

use super::DocumentCache;
use crate::formula::{CompiledFormula, Formula};
use crate::{StepConfig, StepError, StepExecutor, StepInvocation, StepOutcome, StepType};

/// Runs `formula` steps. Formulas are compiled once per load and the
/// compiled form is what gets cached.
pub struct FormulaExecutor {
    formulas: DocumentCache<CompiledFormula>,
}

impl FormulaExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            formulas: DocumentCache::new(store, RuleDocumentKind::Formula),
        }
    }
}

#[async_trait]
impl StepExecutor for FormulaExecutor {
    fn step_type(&self) -> StepType {
        StepType::Formula
    }

    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let StepConfig::Formula { formula_id } = invocation.config else {
            return Err(StepError::Configuration(format!(
                "step '{}' is not configured as a formula",
                invocation.step_id
            )));
        };

        let formula = self
            .formulas
            .get(*formula_id, |body| {
                let formula: Formula = serde_json::from_value(body).map_err(|e| {
                    StepError::Configuration(format!("formula {formula_id} is malformed: {e}"))
                })?;
                formula.compile().map_err(|e| {
                    StepError::Configuration(format!("formula '{}': {e}", formula.name))
                })
            })
            .await?;

        let output = formula
            .evaluate(invocation.context)
            .map_err(|e| StepError::Fatal(format!("formula '{}': {e}", formula.name)))?;
        debug!(case_id = %invocation.case_id, formula = %formula.name, "formula computed");

        Ok(StepOutcome::advance(output, crate::OUTCOME_COMPUTED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use chrono::Utc;
    use db::models::RuleDocumentRecord;
    use db::MemoryStore;
    use serde_json::{json, Map, Value};
    use uuid::Uuid;

    async fn executor_for(formula: &Formula) -> FormulaExecutor {
        let store = Arc::new(MemoryStore::new());
        store
            .save_rule_document(&RuleDocumentRecord {
                id: formula.id,
                kind: RuleDocumentKind::Formula,
                name: formula.name.clone(),
                body: serde_json::to_value(formula).unwrap(),
                locked: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        FormulaExecutor::new(store)
    }

    async fn run(executor: &FormulaExecutor, formula_id: Uuid, vars: Value) -> Result<StepOutcome, StepError> {
        let Value::Object(map) = vars else {
            panic!("test context must be an object");
        };
        let context = Context::new(map);
        let config = StepConfig::Formula { formula_id };
        executor
            .execute(StepInvocation {
                case_id: Uuid::new_v4(),
                step_execution_id: Uuid::new_v4(),
                step_id: "payment",
                config: &config,
                context: &context,
            })
            .await
    }

    #[tokio::test]
    async fn computes_the_output_variable() {
        let formula = Formula {
            id: Uuid::new_v4(),
            name: "installment".into(),
            expression: "max(balance / months, 25)".into(),
            output: "installment".into(),
            decimals: Some(2),
        };
        let executor = executor_for(&formula).await;

        let mut expected = Map::new();
        expected.insert("installment".into(), json!(400));
        assert_eq!(
            run(&executor, formula.id, json!({ "balance": 9600, "months": 24 })).await.unwrap(),
            StepOutcome::advance(expected, crate::OUTCOME_COMPUTED)
        );
    }

    #[tokio::test]
    async fn evaluation_failures_are_fatal() {
        let formula = Formula {
            id: Uuid::new_v4(),
            name: "ratio".into(),
            expression: "debt / income".into(),
            output: "ratio".into(),
            decimals: None,
        };
        let executor = executor_for(&formula).await;

        let err = run(&executor, formula.id, json!({ "debt": 5, "income": 0 }))
            .await
            .unwrap_err();
        let StepError::Fatal(msg) = err else {
            panic!("expected a fatal error, got {err:?}");
        };
        assert!(msg.starts_with("formula 'ratio'"), "{msg}");
        let msg = msg.to_lowercase();
        assert!(msg.contains("finite") || msg.contains("division by zero"), "{msg}");

        let err = run(&executor, formula.id, json!({ "debt": 5, "income": "none" }))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal(msg) if msg.contains("'income' is not a number")));
    }
}
