//! `MockStep`: a test double for `StepExecutor`.
//!
//! Lets engine tests script a step's behaviour without tables, formulas
//! or a task store.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{StepError, StepExecutor, StepInvocation, StepOutcome, StepType};

/// Behaviour injected into `MockStep` at construction time.
pub enum MockBehaviour {
    /// Advance with this output and optional outcome label.
    Advance {
        output: Map<String, Value>,
        outcome: Option<String>,
    },
    /// Suspend on a fresh human task id per call.
    Suspend,
    FailFatal(String),
    FailConfiguration(String),
}

/// A mock executor that records the context of every call and returns a
/// scripted result.
pub struct MockStep {
    step_type: StepType,
    pub behaviour: MockBehaviour,
    /// Case context seen by each call, in call order.
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockStep {
    pub fn new(step_type: StepType, behaviour: MockBehaviour) -> Self {
        Self {
            step_type,
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always advance with `output`, which must be a JSON object.
    pub fn returning(step_type: StepType, output: Value) -> Self {
        let output = match output {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(step_type, MockBehaviour::Advance { output, outcome: None })
    }

    /// Always advance with `output` and the given outcome label.
    pub fn branching(step_type: StepType, output: Value, outcome: impl Into<String>) -> Self {
        let mut mock = Self::returning(step_type, output);
        if let MockBehaviour::Advance { outcome: label, .. } = &mut mock.behaviour {
            *label = Some(outcome.into());
        }
        mock
    }

    pub fn suspending(step_type: StepType) -> Self {
        Self::new(step_type, MockBehaviour::Suspend)
    }

    pub fn failing_fatal(step_type: StepType, msg: impl Into<String>) -> Self {
        Self::new(step_type, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn failing_configuration(step_type: StepType, msg: impl Into<String>) -> Self {
        Self::new(step_type, MockBehaviour::FailConfiguration(msg.into()))
    }

    /// Number of times this step has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl StepExecutor for MockStep {
    fn step_type(&self) -> StepType {
        self.step_type
    }

    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        self.calls.lock().push(invocation.context.to_value());

        match &self.behaviour {
            MockBehaviour::Advance { output, outcome } => Ok(StepOutcome::Advance {
                output: output.clone(),
                outcome: outcome.clone(),
            }),
            MockBehaviour::Suspend => Ok(StepOutcome::Suspend {
                human_task_id: Uuid::new_v4(),
            }),
            MockBehaviour::FailFatal(msg) => Err(StepError::Fatal(msg.clone())),
            MockBehaviour::FailConfiguration(msg) => Err(StepError::Configuration(msg.clone())),
        }
    }
}
