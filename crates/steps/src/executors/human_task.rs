use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use db::models::{HumanTaskRecord, HumanTaskStatus};
use db::Store;
use notify::{Notification, Notifier};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::{StepConfig, StepError, StepExecutor, StepInvocation, StepOutcome, StepType};

/// Runs `human_task` steps: opens a task and parks the case.
///
/// Nothing here waits for the person. The case stays suspended until the
/// task is completed through the engine.
pub struct HumanTaskExecutor {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl HumanTaskExecutor {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }
}

#[async_trait]
impl StepExecutor for HumanTaskExecutor {
    fn step_type(&self) -> StepType {
        StepType::HumanTask
    }

    #[instrument(skip_all, fields(case_id = %invocation.case_id, step_id = invocation.step_id))]
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let StepConfig::HumanTask(config) = invocation.config else {
            return Err(StepError::Configuration(format!(
                "step '{}' is not configured as a human task",
                invocation.step_id
            )));
        };

        // Re-entry after an interrupted commit: keep the task already opened.
        if let Some(task) = self
            .store
            .open_task_for_step_execution(invocation.step_execution_id)
            .await?
        {
            return Ok(StepOutcome::Suspend {
                human_task_id: task.id,
            });
        }

        let now = self.clock.now();
        let task = HumanTaskRecord {
            id: Uuid::new_v4(),
            case_id: invocation.case_id,
            step_execution_id: invocation.step_execution_id,
            step_id: invocation.step_id.to_owned(),
            title: config.title.clone(),
            assignee: config.assignee.clone(),
            due_at: config.due_in_days.map(|days| now + Duration::days(days)),
            status: HumanTaskStatus::Open,
            decision: None,
            completed_by: None,
            completed_at: None,
            created_at: now,
        };
        self.store.insert_human_task(&task).await?;
        info!(task_id = %task.id, assignee = %task.assignee, "human task opened");

        self.notifier.notify(Notification::HumanTaskCreated {
            task_id: task.id,
            case_id: task.case_id,
            step_id: task.step_id.clone(),
            assignee: task.assignee.clone(),
            due_at: task.due_at,
        });

        Ok(StepOutcome::Suspend {
            human_task_id: task.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::{Context, HumanTaskConfig};
    use chrono::{TimeZone, Utc};
    use db::models::{CaseRecord, CaseStatus};
    use db::MemoryStore;
    use notify::ChannelNotifier;
    use serde_json::Map;

    #[tokio::test]
    async fn opens_one_task_and_suspends() {
        let store = Arc::new(MemoryStore::new());
        let (notifier, mut rx) = ChannelNotifier::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let executor = HumanTaskExecutor::new(
            store.clone(),
            Arc::new(notifier),
            Arc::new(FixedClock::new(now)),
        );

        let case_id = Uuid::new_v4();
        store
            .insert_case(&CaseRecord {
                id: case_id,
                client_id: Uuid::new_v4(),
                workflow_version_id: Uuid::new_v4(),
                current_step_id: Some("approve".into()),
                status: CaseStatus::Running,
                context: Map::new(),
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let config = StepConfig::HumanTask(HumanTaskConfig {
            title: "Approve offer in compromise".into(),
            assignee: "senior-officer".into(),
            due_in_days: Some(5),
            decision_variable: "decision".into(),
        });
        let context = Context::default();
        let invocation = StepInvocation {
            case_id,
            step_execution_id: Uuid::new_v4(),
            step_id: "approve",
            config: &config,
            context: &context,
        };

        let first = executor.execute(invocation).await.unwrap();
        let StepOutcome::Suspend { human_task_id } = first else {
            panic!("expected suspend");
        };
        // Running the same step execution again reuses the open task.
        assert_eq!(executor.execute(invocation).await.unwrap(), first);

        let open = store.open_tasks_for_case(case_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, human_task_id);
        assert_eq!(open[0].due_at, Some(now + Duration::days(5)));

        assert!(matches!(
            rx.try_recv(),
            Ok(Notification::HumanTaskCreated { task_id, .. }) if task_id == human_task_id
        ));
        assert!(rx.try_recv().is_err());
    }
}
