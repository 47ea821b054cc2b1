//! [`Store`] backed by Postgres through the repository functions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    CaseRecord, HumanTaskRecord, HumanTaskStatus, PublicationStatus, RuleDocumentKind,
    RuleDocumentRecord, StepExecutionRecord, StepSettlement, WorkflowDefinitionRecord,
    WorkflowVersionRecord,
};
use crate::repository::{executions, tasks, workflows};
use crate::{DbError, DbPool, Store};

/// Durable store; clone freely, the pool is shared.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_workflow_definition(
        &self,
        definition: &WorkflowDefinitionRecord,
    ) -> Result<(), DbError> {
        workflows::insert_definition(&self.pool, definition).await
    }

    async fn load_workflow_definition(
        &self,
        id: Uuid,
    ) -> Result<WorkflowDefinitionRecord, DbError> {
        workflows::get_definition(&self.pool, id).await
    }

    async fn set_definition_status(
        &self,
        id: Uuid,
        status: PublicationStatus,
    ) -> Result<(), DbError> {
        workflows::set_definition_status(&self.pool, id, status).await
    }

    async fn save_workflow_version(
        &self,
        version: &WorkflowVersionRecord,
    ) -> Result<(), DbError> {
        workflows::save_version(&self.pool, version).await
    }

    async fn load_workflow_version(&self, id: Uuid) -> Result<WorkflowVersionRecord, DbError> {
        workflows::get_version(&self.pool, id).await
    }

    async fn published_version_of(
        &self,
        definition_id: Uuid,
    ) -> Result<Option<WorkflowVersionRecord>, DbError> {
        workflows::get_published_version(&self.pool, definition_id).await
    }

    async fn publish_version(
        &self,
        version_id: Uuid,
        published_at: DateTime<Utc>,
        documents: &[(RuleDocumentKind, Uuid)],
    ) -> Result<Option<Uuid>, DbError> {
        workflows::publish_version(&self.pool, version_id, published_at, documents).await
    }

    async fn archive_version(&self, version_id: Uuid) -> Result<(), DbError> {
        workflows::archive_version(&self.pool, version_id).await
    }

    async fn save_rule_document(&self, document: &RuleDocumentRecord) -> Result<(), DbError> {
        workflows::save_document(&self.pool, document).await
    }

    async fn load_rule_document(
        &self,
        kind: RuleDocumentKind,
        id: Uuid,
    ) -> Result<RuleDocumentRecord, DbError> {
        workflows::get_document(&self.pool, kind, id).await
    }

    async fn insert_case(&self, case: &CaseRecord) -> Result<(), DbError> {
        executions::insert_case(&self.pool, case).await
    }

    async fn load_case(&self, id: Uuid) -> Result<CaseRecord, DbError> {
        executions::get_case(&self.pool, id).await
    }

    async fn commit_step(
        &self,
        case: &CaseRecord,
        expected_version: i64,
        settlement: Option<&StepSettlement>,
    ) -> Result<CaseRecord, DbError> {
        executions::commit_step(&self.pool, case, expected_version, settlement).await
    }

    async fn insert_step_execution(
        &self,
        execution: &StepExecutionRecord,
    ) -> Result<StepExecutionRecord, DbError> {
        executions::insert_step_execution(&self.pool, execution).await
    }

    async fn load_step_execution(&self, id: Uuid) -> Result<StepExecutionRecord, DbError> {
        executions::get_step_execution(&self.pool, id).await
    }

    async fn latest_step_execution(
        &self,
        case_id: Uuid,
    ) -> Result<Option<StepExecutionRecord>, DbError> {
        executions::latest_step_execution(&self.pool, case_id).await
    }

    async fn list_step_executions(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, DbError> {
        executions::list_step_executions(&self.pool, case_id).await
    }

    async fn insert_human_task(&self, task: &HumanTaskRecord) -> Result<(), DbError> {
        tasks::insert_task(&self.pool, task).await
    }

    async fn load_human_task(&self, id: Uuid) -> Result<HumanTaskRecord, DbError> {
        tasks::get_task(&self.pool, id).await
    }

    async fn open_task_for_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Option<HumanTaskRecord>, DbError> {
        tasks::open_task_for_step_execution(&self.pool, step_execution_id).await
    }

    async fn open_tasks_for_case(&self, case_id: Uuid) -> Result<Vec<HumanTaskRecord>, DbError> {
        tasks::open_tasks_for_case(&self.pool, case_id).await
    }

    async fn complete_human_task(
        &self,
        id: Uuid,
        decision: &Value,
        completed_by: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<HumanTaskRecord, DbError> {
        tasks::close_task(
            &self.pool,
            id,
            HumanTaskStatus::Completed,
            Some(decision),
            Some(completed_by),
            completed_at,
        )
        .await
    }

    async fn cancel_human_task(
        &self,
        id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<HumanTaskRecord, DbError> {
        tasks::close_task(&self.pool, id, HumanTaskStatus::Cancelled, None, None, cancelled_at)
            .await
    }
}
