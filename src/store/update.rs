//! Delta application with deletion inference.
//!
//! The server never signals deletions for list-tracked relations explicitly;
//! instead it re-sends the complete current id list, and ids that fell out of
//! it are removed here. All mutations funnel through one update slot so no
//! observer ever sees a partially-applied patch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::{DataStore, Id, ModelData, StoreCommit};

/// Which prior id set a reconciliation is measured against.
#[derive(Debug, Clone)]
pub enum ReconcileScope {
    /// Partial relation: ids previously reported for the owning relation.
    Relation { previous: BTreeSet<Id> },
    /// Full-list tracked collection: every id the store knows.
    FullCollection,
}

/// A freshly reported id set plus the scope to diff it against.
#[derive(Debug, Clone)]
pub struct IdReconciliation {
    pub scope: ReconcileScope,
    pub ids: BTreeSet<Id>,
}

impl IdReconciliation {
    pub fn full(ids: BTreeSet<Id>) -> Self {
        Self {
            scope: ReconcileScope::FullCollection,
            ids,
        }
    }

    pub fn relation(previous: BTreeSet<Id>, ids: BTreeSet<Id>) -> Self {
        Self {
            scope: ReconcileScope::Relation { previous },
            ids,
        }
    }
}

pub struct StoreUpdateService {
    store: Arc<dyn DataStore>,
    update_slot: Mutex<()>,
}

impl StoreUpdateService {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            update_slot: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Apply one delta patch. Removals are queued first (explicit deletions,
    /// then inferred ones), upserts after, and the whole set commits while
    /// holding the update slot, which serializes patches across streams.
    pub async fn apply(
        &self,
        patch: ModelData,
        changed_models: HashMap<String, IdReconciliation>,
        deleted_models: HashMap<String, Vec<Id>>,
    ) -> Result<()> {
        let _slot = self.update_slot.lock().await;
        let mut commit = StoreCommit::default();

        for (collection, ids) in deleted_models {
            if !self.known(&collection) || ids.is_empty() {
                continue;
            }
            commit.removals.push((collection, ids));
        }

        for (collection, reconciliation) in changed_models {
            if !self.known(&collection) {
                continue;
            }
            let gone: Vec<Id> = match &reconciliation.scope {
                ReconcileScope::Relation { previous } => previous
                    .difference(&reconciliation.ids)
                    .copied()
                    .collect(),
                ReconcileScope::FullCollection => self
                    .store
                    .known_ids(&collection)
                    .await
                    .into_iter()
                    .filter(|id| !reconciliation.ids.contains(id))
                    .collect(),
            };
            if !gone.is_empty() {
                commit.removals.push((collection, gone));
            }
        }

        for (collection, entities) in patch {
            if !self.known(&collection) {
                continue;
            }
            for (id, fields) in entities {
                if is_deletion(&fields) {
                    commit.removals.push((collection.clone(), vec![id]));
                } else {
                    commit.upserts.push((collection.clone(), id, fields));
                }
            }
        }

        if commit.is_empty() {
            return Ok(());
        }
        self.store.commit(commit).await
    }

    fn known(&self, collection: &str) -> bool {
        if self.store.is_registered(collection) {
            return true;
        }
        // Forward compatibility: newer servers may push collections this
        // client has no model for yet.
        tracing::warn!(collection, "skipping unregistered collection");
        false
    }
}

/// A patch whose id field is null or zero deletes the entity instead of
/// upserting it.
fn is_deletion(fields: &serde_json::Map<String, Value>) -> bool {
    match fields.get("id") {
        Some(Value::Null) => true,
        Some(value) => value.as_u64() == Some(0),
        None => false,
    }
}
