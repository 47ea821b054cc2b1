//! The built-in step executors, one per [`StepType`](crate::StepType).

mod decision_table;
mod formula;
mod human_task;

use std::sync::Arc;

use dashmap::DashMap;
use db::models::RuleDocumentKind;
use db::Store;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::StepError;

pub use decision_table::DecisionTableExecutor;
pub use formula::FormulaExecutor;
pub use human_task::HumanTaskExecutor;

/// Read-through cache of decoded rule documents.
///
/// Only locked documents are cached: they belong to a published version
/// and can no longer change.
pub(crate) struct DocumentCache<T> {
    store: Arc<dyn Store>,
    kind: RuleDocumentKind,
    entries: DashMap<Uuid, Arc<T>>,
}

impl<T: Send + Sync> DocumentCache<T> {
    pub(crate) fn new(store: Arc<dyn Store>, kind: RuleDocumentKind) -> Self {
        Self {
            store,
            kind,
            entries: DashMap::new(),
        }
    }

    pub(crate) async fn get<F>(&self, id: Uuid, decode: F) -> Result<Arc<T>, StepError>
    where
        F: FnOnce(Value) -> Result<T, StepError>,
    {
        let cached = self.entries.get(&id).map(|hit| Arc::clone(hit.value()));
        if let Some(document) = cached {
            return Ok(document);
        }

        let record = self.store.load_rule_document(self.kind, id).await?;
        let locked = record.locked;
        let document = Arc::new(decode(record.body)?);
        if locked {
            debug!(%id, kind = %self.kind, "caching locked document");
            self.entries.insert(id, Arc::clone(&document));
        }
        Ok(document)
    }
}
