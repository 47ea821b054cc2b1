//! In-process [`Store`] used by tests and the CLI `run` command.
//!
//! All state sits behind one mutex, so every method (and in particular
//! [`Store::commit_step`]) is atomic with respect to every other.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    CaseRecord, HumanTaskRecord, HumanTaskStatus, PublicationStatus, RuleDocumentKind,
    RuleDocumentRecord, StepExecutionRecord, StepSettlement, WorkflowDefinitionRecord,
    WorkflowVersionRecord,
};
use crate::{DbError, Store};

#[derive(Default)]
struct Inner {
    definitions: HashMap<Uuid, WorkflowDefinitionRecord>,
    versions: HashMap<Uuid, WorkflowVersionRecord>,
    documents: HashMap<(RuleDocumentKind, Uuid), RuleDocumentRecord>,
    cases: HashMap<Uuid, CaseRecord>,
    executions: HashMap<Uuid, StepExecutionRecord>,
    /// case id → execution ids in sequence order
    history: HashMap<Uuid, Vec<Uuid>>,
    tasks: HashMap<Uuid, HumanTaskRecord>,
}

impl Inner {
    fn settle(&mut self, settlement: &StepSettlement) -> Result<(), DbError> {
        let execution = self
            .executions
            .get_mut(&settlement.step_execution_id)
            .ok_or_else(|| DbError::not_found("step execution", settlement.step_execution_id))?;

        if !execution.status.can_settle_to(settlement.status) {
            return Err(DbError::InvalidTransition {
                entity: "step execution",
                id: execution.id.to_string(),
                from: execution.status.to_string(),
                to: settlement.status.to_string(),
            });
        }

        execution.status = settlement.status;
        execution.result = settlement.result.clone();
        execution.error = settlement.error.clone();
        execution.finished_at = settlement.finished_at;
        Ok(())
    }

    fn close_task(
        &mut self,
        id: Uuid,
        next: HumanTaskStatus,
    ) -> Result<&mut HumanTaskRecord, DbError> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("human task", id))?;
        if task.status != HumanTaskStatus::Open {
            return Err(DbError::InvalidTransition {
                entity: "human task",
                id: id.to_string(),
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        task.status = next;
        Ok(task)
    }
}

/// A [`Store`] that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_workflow_definition(
        &self,
        definition: &WorkflowDefinitionRecord,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if inner.definitions.contains_key(&definition.id) {
            return Err(DbError::Duplicate {
                entity: "workflow definition",
                id: definition.id.to_string(),
            });
        }
        inner.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn load_workflow_definition(
        &self,
        id: Uuid,
    ) -> Result<WorkflowDefinitionRecord, DbError> {
        self.inner
            .lock()
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow definition", id))
    }

    async fn set_definition_status(
        &self,
        id: Uuid,
        status: PublicationStatus,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let definition = inner
            .definitions
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("workflow definition", id))?;
        definition.status = status;
        Ok(())
    }

    async fn save_workflow_version(
        &self,
        version: &WorkflowVersionRecord,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if !inner.definitions.contains_key(&version.definition_id) {
            return Err(DbError::not_found("workflow definition", version.definition_id));
        }
        if let Some(existing) = inner.versions.get(&version.id) {
            if existing.status != PublicationStatus::Draft {
                return Err(DbError::Immutable {
                    entity: "workflow version",
                    id: version.id.to_string(),
                });
            }
        }
        inner.versions.insert(version.id, version.clone());
        Ok(())
    }

    async fn load_workflow_version(&self, id: Uuid) -> Result<WorkflowVersionRecord, DbError> {
        self.inner
            .lock()
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow version", id))
    }

    async fn published_version_of(
        &self,
        definition_id: Uuid,
    ) -> Result<Option<WorkflowVersionRecord>, DbError> {
        Ok(self
            .inner
            .lock()
            .versions
            .values()
            .find(|v| v.definition_id == definition_id && v.status == PublicationStatus::Published)
            .cloned())
    }

    async fn publish_version(
        &self,
        version_id: Uuid,
        published_at: DateTime<Utc>,
        documents: &[(RuleDocumentKind, Uuid)],
    ) -> Result<Option<Uuid>, DbError> {
        let mut inner = self.inner.lock();

        let version = inner
            .versions
            .get(&version_id)
            .ok_or_else(|| DbError::not_found("workflow version", version_id))?;
        if version.status != PublicationStatus::Draft {
            return Err(DbError::InvalidTransition {
                entity: "workflow version",
                id: version_id.to_string(),
                from: version.status.to_string(),
                to: PublicationStatus::Published.to_string(),
            });
        }
        let definition_id = version.definition_id;

        for key in documents {
            if !inner.documents.contains_key(key) {
                return Err(DbError::not_found("rule document", key.1));
            }
        }

        let superseded = inner
            .versions
            .values()
            .find(|v| v.definition_id == definition_id && v.status == PublicationStatus::Published)
            .map(|v| v.id);
        if let Some(previous) = superseded.and_then(|id| inner.versions.get_mut(&id)) {
            previous.status = PublicationStatus::Archived;
        }

        if let Some(version) = inner.versions.get_mut(&version_id) {
            version.status = PublicationStatus::Published;
            version.published_at = Some(published_at);
        }
        for key in documents {
            if let Some(document) = inner.documents.get_mut(key) {
                document.locked = true;
            }
        }
        if let Some(definition) = inner.definitions.get_mut(&definition_id) {
            definition.status = PublicationStatus::Published;
        }

        Ok(superseded)
    }

    async fn archive_version(&self, version_id: Uuid) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let version = inner
            .versions
            .get_mut(&version_id)
            .ok_or_else(|| DbError::not_found("workflow version", version_id))?;
        if version.status != PublicationStatus::Published {
            return Err(DbError::InvalidTransition {
                entity: "workflow version",
                id: version_id.to_string(),
                from: version.status.to_string(),
                to: PublicationStatus::Archived.to_string(),
            });
        }
        version.status = PublicationStatus::Archived;
        Ok(())
    }

    async fn save_rule_document(&self, document: &RuleDocumentRecord) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let key = (document.kind, document.id);
        if inner.documents.get(&key).is_some_and(|d| d.locked) {
            return Err(DbError::Immutable {
                entity: "rule document",
                id: document.id.to_string(),
            });
        }
        inner.documents.insert(key, document.clone());
        Ok(())
    }

    async fn load_rule_document(
        &self,
        kind: RuleDocumentKind,
        id: Uuid,
    ) -> Result<RuleDocumentRecord, DbError> {
        self.inner
            .lock()
            .documents
            .get(&(kind, id))
            .cloned()
            .ok_or_else(|| DbError::not_found("rule document", id))
    }

    async fn insert_case(&self, case: &CaseRecord) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if inner.cases.contains_key(&case.id) {
            return Err(DbError::Duplicate {
                entity: "case",
                id: case.id.to_string(),
            });
        }
        inner.cases.insert(case.id, case.clone());
        Ok(())
    }

    async fn load_case(&self, id: Uuid) -> Result<CaseRecord, DbError> {
        self.inner
            .lock()
            .cases
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("case", id))
    }

    async fn commit_step(
        &self,
        case: &CaseRecord,
        expected_version: i64,
        settlement: Option<&StepSettlement>,
    ) -> Result<CaseRecord, DbError> {
        let mut inner = self.inner.lock();

        let stored_version = inner
            .cases
            .get(&case.id)
            .map(|c| c.version)
            .ok_or_else(|| DbError::not_found("case", case.id))?;
        if stored_version != expected_version {
            return Err(DbError::VersionConflict {
                case_id: case.id,
                expected: expected_version,
            });
        }

        if let Some(settlement) = settlement {
            inner.settle(settlement)?;
        }

        let mut written = case.clone();
        written.version = expected_version + 1;
        inner.cases.insert(written.id, written.clone());
        Ok(written)
    }

    async fn insert_step_execution(
        &self,
        execution: &StepExecutionRecord,
    ) -> Result<StepExecutionRecord, DbError> {
        let mut inner = self.inner.lock();
        if !inner.cases.contains_key(&execution.case_id) {
            return Err(DbError::not_found("case", execution.case_id));
        }
        let ids = inner.history.entry(execution.case_id).or_default();
        ids.push(execution.id);

        let mut stored = execution.clone();
        stored.sequence = i64::try_from(ids.len())
            .map_err(|_| DbError::Decode("step execution sequence overflow".into()))?;
        inner.executions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn load_step_execution(&self, id: Uuid) -> Result<StepExecutionRecord, DbError> {
        self.inner
            .lock()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("step execution", id))
    }

    async fn latest_step_execution(
        &self,
        case_id: Uuid,
    ) -> Result<Option<StepExecutionRecord>, DbError> {
        let inner = self.inner.lock();
        Ok(inner
            .history
            .get(&case_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.executions.get(id))
            .cloned())
    }

    async fn list_step_executions(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, DbError> {
        let inner = self.inner.lock();
        Ok(inner
            .history
            .get(&case_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.executions.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_human_task(&self, task: &HumanTaskRecord) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(DbError::Duplicate {
                entity: "human task",
                id: task.id.to_string(),
            });
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_human_task(&self, id: Uuid) -> Result<HumanTaskRecord, DbError> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("human task", id))
    }

    async fn open_task_for_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Option<HumanTaskRecord>, DbError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .values()
            .find(|t| {
                t.step_execution_id == step_execution_id && t.status == HumanTaskStatus::Open
            })
            .cloned())
    }

    async fn open_tasks_for_case(&self, case_id: Uuid) -> Result<Vec<HumanTaskRecord>, DbError> {
        let mut tasks: Vec<HumanTaskRecord> = self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.case_id == case_id && t.status == HumanTaskStatus::Open)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn complete_human_task(
        &self,
        id: Uuid,
        decision: &Value,
        completed_by: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<HumanTaskRecord, DbError> {
        let mut inner = self.inner.lock();
        let task = inner.close_task(id, HumanTaskStatus::Completed)?;
        task.decision = Some(decision.clone());
        task.completed_by = Some(completed_by.to_owned());
        task.completed_at = Some(completed_at);
        Ok(task.clone())
    }

    async fn cancel_human_task(
        &self,
        id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<HumanTaskRecord, DbError> {
        let mut inner = self.inner.lock();
        let task = inner.close_task(id, HumanTaskStatus::Cancelled)?;
        task.completed_at = Some(cancelled_at);
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CaseStatus, StepExecutionStatus};
    use serde_json::{json, Map};

    fn case() -> CaseRecord {
        let now = Utc::now();
        CaseRecord {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            workflow_version_id: Uuid::new_v4(),
            current_step_id: Some("assess".into()),
            status: CaseStatus::Running,
            context: Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn pending(case_id: Uuid) -> StepExecutionRecord {
        StepExecutionRecord {
            id: Uuid::new_v4(),
            case_id,
            step_id: "assess".into(),
            sequence: 0,
            status: StepExecutionStatus::Pending,
            input: json!({}),
            result: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn commit_step_bumps_version_and_rejects_stale_writers() {
        let store = MemoryStore::new();
        let case = case();
        store.insert_case(&case).await.unwrap();

        let written = store.commit_step(&case, 0, None).await.unwrap();
        assert_eq!(written.version, 1);

        let stale = store.commit_step(&case, 0, None).await;
        assert!(matches!(stale, Err(DbError::VersionConflict { expected: 0, .. })));
        assert_eq!(store.load_case(case.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn conflicting_commit_does_not_settle_the_execution() {
        let store = MemoryStore::new();
        let case = case();
        store.insert_case(&case).await.unwrap();
        let execution = store.insert_step_execution(&pending(case.id)).await.unwrap();
        store.commit_step(&case, 0, None).await.unwrap();

        let settlement = StepSettlement {
            step_execution_id: execution.id,
            status: StepExecutionStatus::Succeeded,
            result: Some(json!({ "tier": "low" })),
            error: None,
            finished_at: Some(Utc::now()),
        };
        assert!(store.commit_step(&case, 0, Some(&settlement)).await.is_err());
        let stored = store.load_step_execution(execution.id).await.unwrap();
        assert_eq!(stored.status, StepExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn step_executions_are_sequenced_per_case() {
        let store = MemoryStore::new();
        let case = case();
        store.insert_case(&case).await.unwrap();

        let first = store.insert_step_execution(&pending(case.id)).await.unwrap();
        let second = store.insert_step_execution(&pending(case.id)).await.unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));

        let latest = store.latest_step_execution(case.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(store.list_step_executions(case.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn human_task_completes_exactly_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let task = HumanTaskRecord {
            id: Uuid::new_v4(),
            case_id: Uuid::new_v4(),
            step_execution_id: Uuid::new_v4(),
            step_id: "review".into(),
            title: "Review offer".into(),
            assignee: "reviewer".into(),
            due_at: None,
            status: HumanTaskStatus::Open,
            decision: None,
            completed_by: None,
            completed_at: None,
            created_at: now,
        };
        store.insert_human_task(&task).await.unwrap();

        let done = store
            .complete_human_task(task.id, &json!({ "decision": "approve" }), "alice", now)
            .await
            .unwrap();
        assert_eq!(done.status, HumanTaskStatus::Completed);
        assert_eq!(done.completed_by.as_deref(), Some("alice"));

        let again = store
            .complete_human_task(task.id, &json!({ "decision": "reject" }), "bob", now)
            .await;
        assert!(matches!(again, Err(DbError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn locked_documents_are_immutable() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let definition = WorkflowDefinitionRecord {
            id: Uuid::new_v4(),
            name: "offer-in-compromise".into(),
            status: PublicationStatus::Draft,
            created_at: now,
        };
        store.insert_workflow_definition(&definition).await.unwrap();
        let version = WorkflowVersionRecord {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            number: 1,
            status: PublicationStatus::Draft,
            body: json!({}),
            created_at: now,
            published_at: None,
        };
        store.save_workflow_version(&version).await.unwrap();
        let table = RuleDocumentRecord {
            id: Uuid::new_v4(),
            kind: RuleDocumentKind::DecisionTable,
            name: "tiers".into(),
            body: json!({}),
            locked: false,
            created_at: now,
        };
        store.save_rule_document(&table).await.unwrap();

        let superseded = store
            .publish_version(version.id, now, &[(RuleDocumentKind::DecisionTable, table.id)])
            .await
            .unwrap();
        assert_eq!(superseded, None);

        assert!(matches!(
            store.save_rule_document(&table).await,
            Err(DbError::Immutable { .. })
        ));
        assert!(matches!(
            store.save_workflow_version(&version).await,
            Err(DbError::Immutable { .. })
        ));
    }
}
