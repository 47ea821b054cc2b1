//! Step executor registry: one executor per [`StepType`], fixed at startup.

use std::collections::HashMap;
use std::sync::Arc;

use db::Store;
use notify::Notifier;
use steps::clock::Clock;
use steps::executors::{DecisionTableExecutor, FormulaExecutor, HumanTaskExecutor};
use steps::{StepExecutor, StepType};

use crate::EngineError;

/// Closed lookup from step type to executor.
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    /// The registry used in production: the three built-in executors.
    pub fn standard(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::builder()
            .register(Arc::new(DecisionTableExecutor::new(store.clone())))
            .register(Arc::new(FormulaExecutor::new(store.clone())))
            .register(Arc::new(HumanTaskExecutor::new(store, notifier, clock)))
            .build()
    }

    pub fn resolve(&self, step_type: StepType) -> Result<Arc<dyn StepExecutor>, EngineError> {
        self.executors
            .get(&step_type)
            .cloned()
            .ok_or(EngineError::UnsupportedStepType(step_type))
    }

    pub fn supports(&self, step_type: StepType) -> bool {
        self.executors.contains_key(&step_type)
    }
}

#[derive(Default)]
pub struct StepRegistryBuilder {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl StepRegistryBuilder {
    /// Register `executor` under its own step type, replacing any earlier
    /// registration for that type.
    pub fn register(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.insert(executor.step_type(), executor);
        self
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            executors: self.executors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;
    use notify::NoopNotifier;
    use serde_json::json;
    use steps::clock::SystemClock;
    use steps::mock::MockStep;

    #[test]
    fn resolves_registered_types_only() {
        let registry = StepRegistry::builder()
            .register(Arc::new(MockStep::returning(StepType::Formula, json!({}))))
            .build();

        assert!(registry.resolve(StepType::Formula).is_ok());
        assert!(matches!(
            registry.resolve(StepType::HumanTask),
            Err(EngineError::UnsupportedStepType(StepType::HumanTask))
        ));
    }

    #[test]
    fn standard_registry_covers_every_step_type() {
        let registry = StepRegistry::standard(
            Arc::new(MemoryStore::new()),
            Arc::new(NoopNotifier),
            Arc::new(SystemClock),
        );
        for step_type in [StepType::DecisionTable, StepType::Formula, StepType::HumanTask] {
            assert!(registry.supports(step_type), "{step_type} missing");
        }
    }
}
