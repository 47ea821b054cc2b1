//! Workflow model: definitions, versions and their steps.
//!
//! A version's steps are stored in the JSONB `body` column of
//! `workflow_versions`; the record's status column is authoritative for
//! the lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use db::models::{
    PublicationStatus, RuleDocumentKind, WorkflowDefinitionRecord, WorkflowVersionRecord,
};
use serde::{Deserialize, Serialize};
use steps::formula::Formula;
use steps::rules::DecisionTable;
use steps::StepConfig;
use uuid::Uuid;

use crate::EngineError;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "draft")]
    pub status: PublicationStatus,
}

fn draft() -> PublicationStatus {
    PublicationStatus::Draft
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: PublicationStatus::Draft,
        }
    }

    pub(crate) fn to_record(&self, created_at: DateTime<Utc>) -> WorkflowDefinitionRecord {
        WorkflowDefinitionRecord {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where a step goes once it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Routing {
    /// The workflow ends after this step.
    #[default]
    Terminal,
    Next { step: String },
    /// Outcome label → next step; a `null` target ends the workflow.
    Branch {
        outcomes: BTreeMap<String, Option<String>>,
    },
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// A single step in a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the version.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub config: StepConfig,
    #[serde(default)]
    pub routing: Routing,
}

impl WorkflowStep {
    /// Step ids this step can route to.
    pub fn successors(&self) -> Vec<&str> {
        match &self.routing {
            Routing::Terminal => Vec::new(),
            Routing::Next { step } => vec![step.as_str()],
            Routing::Branch { outcomes } => outcomes.values().flatten().map(String::as_str).collect(),
        }
    }

    /// The step to run after this one, given the emitted outcome label.
    /// `Ok(None)` ends the workflow.
    pub fn route(&self, outcome: Option<&str>) -> Result<Option<String>, EngineError> {
        match &self.routing {
            Routing::Terminal => Ok(None),
            Routing::Next { step } => Ok(Some(step.clone())),
            Routing::Branch { outcomes } => {
                let label = outcome.ok_or_else(|| EngineError::MissingOutcome {
                    step_id: self.id.clone(),
                })?;
                outcomes
                    .get(label)
                    .cloned()
                    .ok_or_else(|| EngineError::UnrecognizedBranch {
                        step_id: self.id.clone(),
                        label: label.to_owned(),
                    })
            }
        }
    }

    pub fn document(&self) -> Option<(RuleDocumentKind, Uuid)> {
        match &self.config {
            StepConfig::DecisionTable { table_id } => {
                Some((RuleDocumentKind::DecisionTable, *table_id))
            }
            StepConfig::Formula { formula_id } => Some((RuleDocumentKind::Formula, *formula_id)),
            StepConfig::HumanTask(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowVersion
// ---------------------------------------------------------------------------

/// The persisted part of a version that never changes after publish.
#[derive(Serialize, Deserialize)]
struct VersionBody {
    start_step: String,
    steps: Vec<WorkflowStep>,
}

/// One version of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub number: i32,
    #[serde(default = "draft")]
    pub status: PublicationStatus,
    pub start_step: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowVersion {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Every table and formula the version references, without repeats.
    pub fn documents(&self) -> Vec<(RuleDocumentKind, Uuid)> {
        let mut documents: Vec<_> = Vec::new();
        for document in self.steps.iter().filter_map(WorkflowStep::document) {
            if !documents.contains(&document) {
                documents.push(document);
            }
        }
        documents
    }

    pub(crate) fn to_record(
        &self,
        created_at: DateTime<Utc>,
    ) -> Result<WorkflowVersionRecord, EngineError> {
        let body = serde_json::to_value(VersionBody {
            start_step: self.start_step.clone(),
            steps: self.steps.clone(),
        })
        .map_err(|e| EngineError::Malformed {
            entity: "workflow version",
            id: self.id,
            message: e.to_string(),
        })?;
        Ok(WorkflowVersionRecord {
            id: self.id,
            definition_id: self.definition_id,
            number: self.number,
            status: self.status,
            body,
            created_at,
            published_at: None,
        })
    }

    pub(crate) fn from_record(record: WorkflowVersionRecord) -> Result<Self, EngineError> {
        let body: VersionBody =
            serde_json::from_value(record.body).map_err(|e| EngineError::Malformed {
                entity: "workflow version",
                id: record.id,
                message: e.to_string(),
            })?;
        Ok(Self {
            id: record.id,
            definition_id: record.definition_id,
            number: record.number,
            status: record.status,
            start_step: body.start_step,
            steps: body.steps,
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowBundle
// ---------------------------------------------------------------------------

/// A definition, one version of it and every document the version
/// references, installable in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBundle {
    pub definition: WorkflowDefinition,
    pub version: WorkflowVersion,
    #[serde(default)]
    pub tables: Vec<DecisionTable>,
    #[serde(default)]
    pub formulas: Vec<Formula>,
}
