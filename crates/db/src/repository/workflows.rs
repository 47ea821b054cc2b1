//! Workflow definitions, versions and rule documents.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_column;
use crate::{
    models::{
        PublicationStatus, RuleDocumentKind, RuleDocumentRecord, WorkflowDefinitionRecord,
        WorkflowVersionRecord,
    },
    DbError,
};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct DefinitionRow {
    id: Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DefinitionRow> for WorkflowDefinitionRecord {
    type Error = DbError;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            status: parse_column(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct VersionRow {
    id: Uuid,
    definition_id: Uuid,
    number: i32,
    status: String,
    body: Value,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl TryFrom<VersionRow> for WorkflowVersionRecord {
    type Error = DbError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            definition_id: row.definition_id,
            number: row.number,
            status: parse_column(&row.status)?,
            body: row.body,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}

#[derive(FromRow)]
struct DocumentRow {
    id: Uuid,
    kind: String,
    name: String,
    body: Value,
    locked: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for RuleDocumentRecord {
    type Error = DbError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            kind: parse_column(&row.kind)?,
            name: row.name,
            body: row.body,
            locked: row.locked,
            created_at: row.created_at,
        })
    }
}

const VERSION_COLUMNS: &str =
    "id, definition_id, number, status, body, created_at, published_at";

// ---------------------------------------------------------------------------
// workflow_definitions
// ---------------------------------------------------------------------------

/// Insert a new workflow definition.
pub async fn insert_definition(
    pool: &PgPool,
    definition: &WorkflowDefinitionRecord,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_definitions (id, name, status, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(definition.id)
    .bind(&definition.name)
    .bind(definition.status.to_string())
    .bind(definition.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a single workflow definition by its primary key.
pub async fn get_definition(pool: &PgPool, id: Uuid) -> Result<WorkflowDefinitionRecord, DbError> {
    sqlx::query_as::<_, DefinitionRow>(
        "SELECT id, name, status, created_at FROM workflow_definitions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("workflow definition", id))?
    .try_into()
}

/// Change the lifecycle status of a definition.
pub async fn set_definition_status(
    pool: &PgPool,
    id: Uuid,
    status: PublicationStatus,
) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE workflow_definitions SET status = $1 WHERE id = $2")
        .bind(status.to_string())
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::not_found("workflow definition", id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// workflow_versions
// ---------------------------------------------------------------------------

/// Insert a version, or overwrite it while it is still a draft.
pub async fn save_version(pool: &PgPool, version: &WorkflowVersionRecord) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO workflow_versions
            (id, definition_id, number, status, body, created_at, published_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE
            SET number = EXCLUDED.number,
                status = EXCLUDED.status,
                body = EXCLUDED.body
            WHERE workflow_versions.status = 'draft'
        "#,
    )
    .bind(version.id)
    .bind(version.definition_id)
    .bind(version.number)
    .bind(version.status.to_string())
    .bind(&version.body)
    .bind(version.created_at)
    .bind(version.published_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::Immutable {
            entity: "workflow version",
            id: version.id.to_string(),
        });
    }
    Ok(())
}

/// Fetch a single version by its primary key.
pub async fn get_version(pool: &PgPool, id: Uuid) -> Result<WorkflowVersionRecord, DbError> {
    sqlx::query_as::<_, VersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("workflow version", id))?
    .try_into()
}

/// The currently published version of a definition, if any.
pub async fn get_published_version(
    pool: &PgPool,
    definition_id: Uuid,
) -> Result<Option<WorkflowVersionRecord>, DbError> {
    sqlx::query_as::<_, VersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM workflow_versions \
         WHERE definition_id = $1 AND status = 'published'"
    ))
    .bind(definition_id)
    .fetch_optional(pool)
    .await?
    .map(TryInto::try_into)
    .transpose()
}

/// Publish a draft version in one transaction: archive the previously
/// published version, publish this one and lock the referenced documents.
pub async fn publish_version(
    pool: &PgPool,
    version_id: Uuid,
    published_at: DateTime<Utc>,
    documents: &[(RuleDocumentKind, Uuid)],
) -> Result<Option<Uuid>, DbError> {
    let mut tx = pool.begin().await?;

    let row: Option<(Uuid, String)> = sqlx::query_as(
        "SELECT definition_id, status FROM workflow_versions WHERE id = $1 FOR UPDATE",
    )
    .bind(version_id)
    .fetch_optional(&mut *tx)
    .await?;
    let (definition_id, status) =
        row.ok_or_else(|| DbError::not_found("workflow version", version_id))?;
    if status != PublicationStatus::Draft.to_string() {
        return Err(DbError::InvalidTransition {
            entity: "workflow version",
            id: version_id.to_string(),
            from: status,
            to: PublicationStatus::Published.to_string(),
        });
    }

    let superseded: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE workflow_versions SET status = 'archived'
        WHERE definition_id = $1 AND status = 'published'
        RETURNING id
        "#,
    )
    .bind(definition_id)
    .fetch_optional(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE workflow_versions SET status = 'published', published_at = $1 WHERE id = $2",
    )
    .bind(published_at)
    .bind(version_id)
    .execute(&mut *tx)
    .await?;

    for (kind, id) in documents {
        let result =
            sqlx::query("UPDATE rule_documents SET locked = TRUE WHERE kind = $1 AND id = $2")
                .bind(kind.to_string())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("rule document", id));
        }
    }

    sqlx::query("UPDATE workflow_definitions SET status = 'published' WHERE id = $1")
        .bind(definition_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(superseded.map(|(id,)| id))
}

/// Published → Archived.
pub async fn archive_version(pool: &PgPool, version_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE workflow_versions SET status = 'archived' WHERE id = $1 AND status = 'published'",
    )
    .bind(version_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        let current = get_version(pool, version_id).await?;
        return Err(DbError::InvalidTransition {
            entity: "workflow version",
            id: version_id.to_string(),
            from: current.status.to_string(),
            to: PublicationStatus::Archived.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// rule_documents
// ---------------------------------------------------------------------------

/// Insert a document, or overwrite it while it is unlocked.
pub async fn save_document(pool: &PgPool, document: &RuleDocumentRecord) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO rule_documents (id, kind, name, body, locked, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (kind, id) DO UPDATE
            SET name = EXCLUDED.name,
                body = EXCLUDED.body
            WHERE rule_documents.locked = FALSE
        "#,
    )
    .bind(document.id)
    .bind(document.kind.to_string())
    .bind(&document.name)
    .bind(&document.body)
    .bind(document.locked)
    .bind(document.created_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::Immutable {
            entity: "rule document",
            id: document.id.to_string(),
        });
    }
    Ok(())
}

/// Fetch a decision table or formula.
pub async fn get_document(
    pool: &PgPool,
    kind: RuleDocumentKind,
    id: Uuid,
) -> Result<RuleDocumentRecord, DbError> {
    sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT id, kind, name, body, locked, created_at
        FROM rule_documents WHERE kind = $1 AND id = $2
        "#,
    )
    .bind(kind.to_string())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("rule document", id))?
    .try_into()
}
