//! Human task repository functions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_column;
use crate::{
    models::{HumanTaskRecord, HumanTaskStatus},
    DbError,
};

#[derive(FromRow)]
struct HumanTaskRow {
    id: Uuid,
    case_id: Uuid,
    step_execution_id: Uuid,
    step_id: String,
    title: String,
    assignee: String,
    due_at: Option<DateTime<Utc>>,
    status: String,
    decision: Option<Value>,
    completed_by: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HumanTaskRow> for HumanTaskRecord {
    type Error = DbError;

    fn try_from(row: HumanTaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            case_id: row.case_id,
            step_execution_id: row.step_execution_id,
            step_id: row.step_id,
            title: row.title,
            assignee: row.assignee,
            due_at: row.due_at,
            status: parse_column(&row.status)?,
            decision: row.decision,
            completed_by: row.completed_by,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, case_id, step_execution_id, step_id, title, assignee, due_at, \
                            status, decision, completed_by, completed_at, created_at";

/// Insert a new (open) human task.
pub async fn insert_task(pool: &PgPool, task: &HumanTaskRecord) -> Result<(), DbError> {
    sqlx::query(&format!(
        "INSERT INTO human_tasks ({TASK_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
    ))
    .bind(task.id)
    .bind(task.case_id)
    .bind(task.step_execution_id)
    .bind(&task.step_id)
    .bind(&task.title)
    .bind(&task.assignee)
    .bind(task.due_at)
    .bind(task.status.to_string())
    .bind(&task.decision)
    .bind(&task.completed_by)
    .bind(task.completed_at)
    .bind(task.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a human task by its primary key.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<HumanTaskRecord, DbError> {
    sqlx::query_as::<_, HumanTaskRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM human_tasks WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("human task", id))?
    .try_into()
}

/// The open task created for a step execution, if any.
pub async fn open_task_for_step_execution(
    pool: &PgPool,
    step_execution_id: Uuid,
) -> Result<Option<HumanTaskRecord>, DbError> {
    sqlx::query_as::<_, HumanTaskRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM human_tasks \
         WHERE step_execution_id = $1 AND status = 'open' LIMIT 1"
    ))
    .bind(step_execution_id)
    .fetch_optional(pool)
    .await?
    .map(TryInto::try_into)
    .transpose()
}

/// Every open task of a case, oldest first.
pub async fn open_tasks_for_case(
    pool: &PgPool,
    case_id: Uuid,
) -> Result<Vec<HumanTaskRecord>, DbError> {
    sqlx::query_as::<_, HumanTaskRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM human_tasks \
         WHERE case_id = $1 AND status = 'open' ORDER BY created_at"
    ))
    .bind(case_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(TryInto::try_into)
    .collect()
}

/// Close an open task as `next`, recording the decision metadata.
pub async fn close_task(
    pool: &PgPool,
    id: Uuid,
    next: HumanTaskStatus,
    decision: Option<&Value>,
    completed_by: Option<&str>,
    at: DateTime<Utc>,
) -> Result<HumanTaskRecord, DbError> {
    let row = sqlx::query_as::<_, HumanTaskRow>(&format!(
        r#"
        UPDATE human_tasks
        SET status = $1, decision = $2, completed_by = $3, completed_at = $4
        WHERE id = $5 AND status = 'open'
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(next.to_string())
    .bind(decision)
    .bind(completed_by)
    .bind(at)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None => {
            let current = get_task(pool, id).await?;
            Err(DbError::InvalidTransition {
                entity: "human task",
                id: id.to_string(),
                from: current.status.to_string(),
                to: next.to_string(),
            })
        }
    }
}
