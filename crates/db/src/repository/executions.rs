//! Case and step-execution repository functions.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_column;
use crate::{
    models::{CaseRecord, StepExecutionRecord, StepExecutionStatus, StepSettlement},
    DbError,
};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct CaseRow {
    id: Uuid,
    client_id: Uuid,
    workflow_version_id: Uuid,
    current_step_id: Option<String>,
    status: String,
    context: Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CaseRow> for CaseRecord {
    type Error = DbError;

    fn try_from(row: CaseRow) -> Result<Self, Self::Error> {
        let context = match row.context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DbError::Decode(format!(
                    "case {} context is not an object: {other}",
                    row.id
                )))
            }
        };
        Ok(Self {
            id: row.id,
            client_id: row.client_id,
            workflow_version_id: row.workflow_version_id,
            current_step_id: row.current_step_id,
            status: parse_column(&row.status)?,
            context,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct StepExecutionRow {
    id: Uuid,
    case_id: Uuid,
    step_id: String,
    sequence: i64,
    status: String,
    input: Value,
    result: Option<Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepExecutionRow> for StepExecutionRecord {
    type Error = DbError;

    fn try_from(row: StepExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            case_id: row.case_id,
            step_id: row.step_id,
            sequence: row.sequence,
            status: parse_column(&row.status)?,
            input: row.input,
            result: row.result,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

const CASE_COLUMNS: &str = "id, client_id, workflow_version_id, current_step_id, status, \
                            context, version, created_at, updated_at";

const EXECUTION_COLUMNS: &str =
    "id, case_id, step_id, sequence, status, input, result, error, started_at, finished_at";

// ---------------------------------------------------------------------------
// case_workflows
// ---------------------------------------------------------------------------

/// Insert a freshly started case.
pub async fn insert_case(pool: &PgPool, case: &CaseRecord) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO case_workflows
            (id, client_id, workflow_version_id, current_step_id, status,
             context, version, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(case.id)
    .bind(case.client_id)
    .bind(case.workflow_version_id)
    .bind(&case.current_step_id)
    .bind(case.status.to_string())
    .bind(Value::Object(case.context.clone()))
    .bind(case.version)
    .bind(case.created_at)
    .bind(case.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a case by its primary key.
pub async fn get_case(pool: &PgPool, id: Uuid) -> Result<CaseRecord, DbError> {
    sqlx::query_as::<_, CaseRow>(&format!(
        "SELECT {CASE_COLUMNS} FROM case_workflows WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("case", id))?
    .try_into()
}

/// Statuses a step execution may be settled *from* when moving to `next`.
fn settle_sources(next: StepExecutionStatus) -> Vec<String> {
    [StepExecutionStatus::Pending, StepExecutionStatus::Suspended]
        .into_iter()
        .filter(|from| from.can_settle_to(next))
        .map(|from| from.to_string())
        .collect()
}

/// Compare-and-swap the case on `expected_version` and settle the step
/// execution in the same transaction.
pub async fn commit_step(
    pool: &PgPool,
    case: &CaseRecord,
    expected_version: i64,
    settlement: Option<&StepSettlement>,
) -> Result<CaseRecord, DbError> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query_as::<_, CaseRow>(&format!(
        r#"
        UPDATE case_workflows
        SET current_step_id = $1, status = $2, context = $3,
            version = version + 1, updated_at = $4
        WHERE id = $5 AND version = $6
        RETURNING {CASE_COLUMNS}
        "#
    ))
    .bind(&case.current_step_id)
    .bind(case.status.to_string())
    .bind(Value::Object(case.context.clone()))
    .bind(case.updated_at)
    .bind(case.id)
    .bind(expected_version)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(updated) = updated else {
        tx.rollback().await?;
        // Distinguish a missing case from a stale version.
        get_case(pool, case.id).await?;
        return Err(DbError::VersionConflict {
            case_id: case.id,
            expected: expected_version,
        });
    };

    if let Some(settlement) = settlement {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = $1, result = $2, error = $3, finished_at = $4
            WHERE id = $5 AND status = ANY($6)
            "#,
        )
        .bind(settlement.status.to_string())
        .bind(&settlement.result)
        .bind(&settlement.error)
        .bind(settlement.finished_at)
        .bind(settlement.step_execution_id)
        .bind(settle_sources(settlement.status))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let current = get_step_execution(pool, settlement.step_execution_id).await?;
            return Err(DbError::InvalidTransition {
                entity: "step execution",
                id: current.id.to_string(),
                from: current.status.to_string(),
                to: settlement.status.to_string(),
            });
        }
    }

    tx.commit().await?;
    updated.try_into()
}

// ---------------------------------------------------------------------------
// step_executions
// ---------------------------------------------------------------------------

/// Append a step execution; the next free `sequence` of the case is assigned.
pub async fn insert_step_execution(
    pool: &PgPool,
    execution: &StepExecutionRecord,
) -> Result<StepExecutionRecord, DbError> {
    let row = sqlx::query_as::<_, StepExecutionRow>(&format!(
        r#"
        INSERT INTO step_executions
            (id, case_id, step_id, sequence, status, input, result, error, started_at, finished_at)
        SELECT $1, $2, $3, COALESCE(MAX(sequence), 0) + 1, $4, $5, $6, $7, $8, $9
        FROM step_executions WHERE case_id = $2
        RETURNING {EXECUTION_COLUMNS}
        "#
    ))
    .bind(execution.id)
    .bind(execution.case_id)
    .bind(&execution.step_id)
    .bind(execution.status.to_string())
    .bind(&execution.input)
    .bind(&execution.result)
    .bind(&execution.error)
    .bind(execution.started_at)
    .bind(execution.finished_at)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Fetch one step execution.
pub async fn get_step_execution(pool: &PgPool, id: Uuid) -> Result<StepExecutionRecord, DbError> {
    sqlx::query_as::<_, StepExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM step_executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("step execution", id))?
    .try_into()
}

/// The most recent step execution of a case.
pub async fn latest_step_execution(
    pool: &PgPool,
    case_id: Uuid,
) -> Result<Option<StepExecutionRecord>, DbError> {
    sqlx::query_as::<_, StepExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM step_executions \
         WHERE case_id = $1 ORDER BY sequence DESC LIMIT 1"
    ))
    .bind(case_id)
    .fetch_optional(pool)
    .await?
    .map(TryInto::try_into)
    .transpose()
}

/// Full history of a case, oldest first.
pub async fn list_step_executions(
    pool: &PgPool,
    case_id: Uuid,
) -> Result<Vec<StepExecutionRecord>, DbError> {
    sqlx::query_as::<_, StepExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM step_executions WHERE case_id = $1 ORDER BY sequence"
    ))
    .bind(case_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(TryInto::try_into)
    .collect()
}
