//! Authoring lifecycle: drafts, documents, publish and retire.

use std::sync::Arc;

use db::models::{PublicationStatus, RuleDocumentKind, RuleDocumentRecord};
use db::{DbError, Store};
use serde::Serialize;
use steps::clock::Clock;
use steps::formula::Formula;
use steps::rules::DecisionTable;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{WorkflowBundle, WorkflowDefinition, WorkflowVersion};
use crate::validate::{validate_version, Documents};
use crate::EngineError;

/// Writes workflow definitions and the documents they reference.
pub struct Catalog {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Catalog {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        self.store
            .insert_workflow_definition(&definition.to_record(self.clock.now()))
            .await?;
        Ok(())
    }

    /// Insert or overwrite a Draft version.
    pub async fn save_draft(&self, version: &WorkflowVersion) -> Result<(), EngineError> {
        if version.status != PublicationStatus::Draft {
            return Err(EngineError::ImmutableVersion(version.id));
        }
        let record = version.to_record(self.clock.now())?;
        self.store
            .save_workflow_version(&record)
            .await
            .map_err(|e| match e {
                DbError::Immutable { .. } => EngineError::ImmutableVersion(version.id),
                other => other.into(),
            })
    }

    pub async fn save_table(&self, table: &DecisionTable) -> Result<(), EngineError> {
        self.save_document(RuleDocumentKind::DecisionTable, table.id, &table.name, table)
            .await
    }

    pub async fn save_formula(&self, formula: &Formula) -> Result<(), EngineError> {
        self.save_document(RuleDocumentKind::Formula, formula.id, &formula.name, formula)
            .await
    }

    async fn save_document<T: Serialize + Sync>(
        &self,
        kind: RuleDocumentKind,
        id: Uuid,
        name: &str,
        document: &T,
    ) -> Result<(), EngineError> {
        let entity = entity_name(kind);
        let body = serde_json::to_value(document).map_err(|e| EngineError::Malformed {
            entity,
            id,
            message: e.to_string(),
        })?;
        let record = RuleDocumentRecord {
            id,
            kind,
            name: name.to_owned(),
            body,
            locked: false,
            created_at: self.clock.now(),
        };
        self.store
            .save_rule_document(&record)
            .await
            .map_err(|e| match e {
                DbError::Immutable { .. } => EngineError::DefinitionLocked { entity, id },
                other => other.into(),
            })
    }

    /// Validate a version against the stored documents without publishing.
    pub async fn validate(&self, version_id: Uuid) -> Result<WorkflowVersion, EngineError> {
        let version =
            WorkflowVersion::from_record(self.store.load_workflow_version(version_id).await?)?;

        let mut documents = Documents::default();
        for (kind, id) in version.documents() {
            let record = match self.store.load_rule_document(kind, id).await {
                Ok(record) => record,
                // Leave it out; validation reports it against the step.
                Err(DbError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            let malformed = |e: serde_json::Error| EngineError::Malformed {
                entity: entity_name(kind),
                id,
                message: e.to_string(),
            };
            match kind {
                RuleDocumentKind::DecisionTable => {
                    let table = serde_json::from_value(record.body).map_err(malformed)?;
                    documents.tables.insert(id, table);
                }
                RuleDocumentKind::Formula => {
                    let formula = serde_json::from_value(record.body).map_err(malformed)?;
                    documents.formulas.insert(id, formula);
                }
            }
        }

        validate_version(&version, &documents)?;
        Ok(version)
    }

    /// Validate and publish a Draft version, superseding the definition's
    /// current Published version and locking every referenced document.
    ///
    /// Returns the id of the superseded version, if there was one.
    #[instrument(skip(self))]
    pub async fn publish(&self, version_id: Uuid) -> Result<Option<Uuid>, EngineError> {
        let version = self.validate(version_id).await?;
        if version.status != PublicationStatus::Draft {
            return Err(EngineError::ImmutableVersion(version_id));
        }

        let superseded = self
            .store
            .publish_version(version_id, self.clock.now(), &version.documents())
            .await?;
        info!(
            definition_id = %version.definition_id,
            number = version.number,
            superseded = ?superseded,
            "workflow version published"
        );
        Ok(superseded)
    }

    /// Published → Archived. Cases already running on it keep running.
    #[instrument(skip(self))]
    pub async fn unpublish(&self, version_id: Uuid) -> Result<(), EngineError> {
        self.store.archive_version(version_id).await?;
        info!("workflow version archived");
        Ok(())
    }

    /// Archive a definition and its published version. Nothing is deleted.
    #[instrument(skip(self))]
    pub async fn retire_definition(&self, definition_id: Uuid) -> Result<(), EngineError> {
        if let Some(published) = self.store.published_version_of(definition_id).await? {
            self.store.archive_version(published.id).await?;
        }
        self.store
            .set_definition_status(definition_id, PublicationStatus::Archived)
            .await?;
        info!("workflow definition retired");
        Ok(())
    }

    /// Store a bundle's definition, documents and (draft) version.
    #[instrument(skip_all, fields(definition = %bundle.definition.name))]
    pub async fn install(&self, bundle: &WorkflowBundle) -> Result<(), EngineError> {
        self.create_definition(&bundle.definition).await?;
        for table in &bundle.tables {
            self.save_table(table).await?;
        }
        for formula in &bundle.formulas {
            self.save_formula(formula).await?;
        }
        self.save_draft(&bundle.version).await?;
        info!(version_id = %bundle.version.id, "bundle installed");
        Ok(())
    }
}

fn entity_name(kind: RuleDocumentKind) -> &'static str {
    match kind {
        RuleDocumentKind::DecisionTable => "decision table",
        RuleDocumentKind::Formula => "formula",
    }
}

impl WorkflowBundle {
    /// Publish-time validation against the bundled documents only.
    pub fn validate(&self) -> Result<Vec<String>, EngineError> {
        let documents = Documents::new(self.tables.clone(), self.formulas.clone());
        validate_version(&self.version, &documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Routing, WorkflowStep};
    use db::MemoryStore;
    use steps::clock::SystemClock;
    use steps::StepConfig;

    fn formula() -> Formula {
        Formula {
            id: Uuid::new_v4(),
            name: "penalty".into(),
            expression: "round(balance * 0.05, 2)".into(),
            output: "penalty".into(),
            decimals: None,
        }
    }

    fn bundle(formula: &Formula) -> WorkflowBundle {
        let definition = WorkflowDefinition::new("penalty estimate");
        WorkflowBundle {
            version: WorkflowVersion {
                id: Uuid::new_v4(),
                definition_id: definition.id,
                number: 1,
                status: PublicationStatus::Draft,
                start_step: "penalty".into(),
                steps: vec![WorkflowStep {
                    id: "penalty".into(),
                    name: "Estimate penalty".into(),
                    config: StepConfig::Formula {
                        formula_id: formula.id,
                    },
                    routing: Routing::Terminal,
                }],
            },
            definition,
            tables: vec![],
            formulas: vec![formula.clone()],
        }
    }

    fn catalog() -> (Arc<MemoryStore>, Catalog) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Catalog::new(store.clone(), Arc::new(SystemClock));
        (store, catalog)
    }

    #[tokio::test]
    async fn publish_locks_documents_and_freezes_the_version() {
        let (store, catalog) = catalog();
        let f = formula();
        let b = bundle(&f);
        catalog.install(&b).await.unwrap();

        assert_eq!(catalog.publish(b.version.id).await.unwrap(), None);

        let record = store.load_workflow_version(b.version.id).await.unwrap();
        assert_eq!(record.status, PublicationStatus::Published);
        let doc = store
            .load_rule_document(RuleDocumentKind::Formula, f.id)
            .await
            .unwrap();
        assert!(doc.locked);

        assert!(matches!(
            catalog.save_formula(&f).await,
            Err(EngineError::DefinitionLocked { entity: "formula", .. })
        ));
        assert!(matches!(
            catalog.save_draft(&b.version).await,
            Err(EngineError::ImmutableVersion(id)) if id == b.version.id
        ));
    }

    #[tokio::test]
    async fn publishing_a_new_version_archives_the_previous_one() {
        let (store, catalog) = catalog();
        let f = formula();
        let b = bundle(&f);
        catalog.install(&b).await.unwrap();
        catalog.publish(b.version.id).await.unwrap();

        let mut v2 = b.version.clone();
        v2.id = Uuid::new_v4();
        v2.number = 2;
        catalog.save_draft(&v2).await.unwrap();
        assert_eq!(catalog.publish(v2.id).await.unwrap(), Some(b.version.id));

        let v1 = store.load_workflow_version(b.version.id).await.unwrap();
        assert_eq!(v1.status, PublicationStatus::Archived);
        let current = store.published_version_of(b.definition.id).await.unwrap();
        assert_eq!(current.map(|v| v.id), Some(v2.id));
    }

    #[tokio::test]
    async fn invalid_versions_are_not_published() {
        let (store, catalog) = catalog();
        let f = formula();
        let mut b = bundle(&f);
        b.formulas.clear();
        catalog.install(&b).await.unwrap();

        assert!(matches!(
            catalog.publish(b.version.id).await,
            Err(EngineError::MissingDocument { entity: "formula", .. })
        ));
        let record = store.load_workflow_version(b.version.id).await.unwrap();
        assert_eq!(record.status, PublicationStatus::Draft);
    }

    #[tokio::test]
    async fn retire_archives_definition_and_published_version() {
        let (store, catalog) = catalog();
        let f = formula();
        let b = bundle(&f);
        catalog.install(&b).await.unwrap();
        catalog.publish(b.version.id).await.unwrap();

        catalog.retire_definition(b.definition.id).await.unwrap();

        let definition = store.load_workflow_definition(b.definition.id).await.unwrap();
        assert_eq!(definition.status, PublicationStatus::Archived);
        assert!(store.published_version_of(b.definition.id).await.unwrap().is_none());
    }

    #[test]
    fn bundles_validate_offline() {
        let f = formula();
        assert_eq!(bundle(&f).validate().unwrap(), vec!["penalty"]);
    }

    #[test]
    fn demo_bundle_is_valid() {
        let demo: WorkflowBundle =
            serde_json::from_str(include_str!("../../../demos/tax_resolution.json")).unwrap();
        assert_eq!(demo.validate().unwrap(), vec!["assess", "estimate", "approve"]);
    }
}
