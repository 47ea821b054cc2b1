//! The persistence contract consumed by the engine and the step executors.
//!
//! Every method is a single durable operation. Implementations must make
//! [`Store::commit_step`] atomic: it is the commit point of a step run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    CaseRecord, HumanTaskRecord, PublicationStatus, RuleDocumentKind, RuleDocumentRecord,
    StepExecutionRecord, StepSettlement, WorkflowDefinitionRecord, WorkflowVersionRecord,
};
use crate::DbError;

#[async_trait]
pub trait Store: Send + Sync {
    // ------ workflow definitions & versions ------

    async fn insert_workflow_definition(
        &self,
        definition: &WorkflowDefinitionRecord,
    ) -> Result<(), DbError>;

    async fn load_workflow_definition(
        &self,
        id: Uuid,
    ) -> Result<WorkflowDefinitionRecord, DbError>;

    async fn set_definition_status(
        &self,
        id: Uuid,
        status: PublicationStatus,
    ) -> Result<(), DbError>;

    /// Insert a new version or overwrite a Draft one.
    ///
    /// Fails with [`DbError::Immutable`] when the stored version is not Draft.
    async fn save_workflow_version(&self, version: &WorkflowVersionRecord)
        -> Result<(), DbError>;

    async fn load_workflow_version(&self, id: Uuid) -> Result<WorkflowVersionRecord, DbError>;

    async fn published_version_of(
        &self,
        definition_id: Uuid,
    ) -> Result<Option<WorkflowVersionRecord>, DbError>;

    /// Publish a Draft version: archive the definition's currently published
    /// version (if any), mark this one Published and lock `documents`.
    ///
    /// Returns the id of the superseded version.
    async fn publish_version(
        &self,
        version_id: Uuid,
        published_at: DateTime<Utc>,
        documents: &[(RuleDocumentKind, Uuid)],
    ) -> Result<Option<Uuid>, DbError>;

    /// Published → Archived.
    async fn archive_version(&self, version_id: Uuid) -> Result<(), DbError>;

    // ------ decision tables & formulas ------

    /// Insert or overwrite an unlocked document.
    async fn save_rule_document(&self, document: &RuleDocumentRecord) -> Result<(), DbError>;

    async fn load_rule_document(
        &self,
        kind: RuleDocumentKind,
        id: Uuid,
    ) -> Result<RuleDocumentRecord, DbError>;

    // ------ cases ------

    async fn insert_case(&self, case: &CaseRecord) -> Result<(), DbError>;

    async fn load_case(&self, id: Uuid) -> Result<CaseRecord, DbError>;

    /// Write `case` if the stored version still equals `expected_version`,
    /// settling `settlement` in the same atomic operation.
    ///
    /// The stored (and returned) case carries `expected_version + 1`.
    async fn commit_step(
        &self,
        case: &CaseRecord,
        expected_version: i64,
        settlement: Option<&StepSettlement>,
    ) -> Result<CaseRecord, DbError>;

    // ------ step executions ------

    /// Append a step execution. The store assigns `sequence`.
    async fn insert_step_execution(
        &self,
        execution: &StepExecutionRecord,
    ) -> Result<StepExecutionRecord, DbError>;

    async fn load_step_execution(&self, id: Uuid) -> Result<StepExecutionRecord, DbError>;

    async fn latest_step_execution(
        &self,
        case_id: Uuid,
    ) -> Result<Option<StepExecutionRecord>, DbError>;

    /// All step executions of a case in `sequence` order.
    async fn list_step_executions(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, DbError>;

    // ------ human tasks ------

    async fn insert_human_task(&self, task: &HumanTaskRecord) -> Result<(), DbError>;

    async fn load_human_task(&self, id: Uuid) -> Result<HumanTaskRecord, DbError>;

    async fn open_task_for_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Option<HumanTaskRecord>, DbError>;

    async fn open_tasks_for_case(&self, case_id: Uuid) -> Result<Vec<HumanTaskRecord>, DbError>;

    /// Open → Completed, exactly once.
    async fn complete_human_task(
        &self,
        id: Uuid,
        decision: &Value,
        completed_by: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<HumanTaskRecord, DbError>;

    /// Open → Cancelled.
    async fn cancel_human_task(
        &self,
        id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<HumanTaskRecord, DbError>;
}
