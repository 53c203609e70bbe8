//! Normalized object store contract and delta decoding.
//!
//! The store itself is an external collaborator; this module defines the
//! contract the update pipeline needs (known ids plus an atomic commit) and
//! a reference in-memory implementation used end-to-end in tests.

pub mod update;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

pub use update::{IdReconciliation, ReconcileScope, StoreUpdateService};

/// Entity id within a collection. Always positive on the wire.
pub type Id = u64;

/// Partial entity: field name to value.
pub type Fields = Map<String, Value>;

/// Decoded delta payload: collection -> id -> partial entity.
pub type ModelData = HashMap<String, HashMap<Id, Fields>>;

/// Decode a wire delta object (`"<collection>/<id>/<field>": value`) into
/// [`ModelData`]. Malformed keys are logged and skipped.
pub fn decode_delta(value: &Value) -> ModelData {
    let mut data = ModelData::new();
    let Some(object) = value.as_object() else {
        tracing::warn!("delta payload is not an object, ignoring");
        return data;
    };

    for (key, field_value) in object {
        let mut parts = key.splitn(3, '/');
        let collection = parts.next().unwrap_or_default();
        let id = parts.next().and_then(|raw| raw.parse::<Id>().ok());
        let field = parts.next().unwrap_or_default();

        match id {
            Some(id) if !collection.is_empty() && !field.is_empty() => {
                data.entry(collection.to_string())
                    .or_default()
                    .entry(id)
                    .or_default()
                    .insert(field.to_string(), field_value.clone());
            }
            _ => tracing::warn!(key = %key, "skipping malformed delta key"),
        }
    }
    data
}

/// Split a wire key into the (collection, field) pair naming its relation.
pub fn relation_of_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.splitn(3, '/');
    let collection = parts.next()?;
    parts.next()?.parse::<Id>().ok()?;
    let field = parts.next()?;
    if collection.is_empty() || field.is_empty() {
        return None;
    }
    Some((collection, field))
}

/// Removals and upserts applied to the store as one atomic unit. Removals
/// always apply first.
#[derive(Debug, Default)]
pub struct StoreCommit {
    pub removals: Vec<(String, Vec<Id>)>,
    pub upserts: Vec<(String, Id, Fields)>,
}

impl StoreCommit {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.upserts.is_empty()
    }
}

/// Contract the normalized object store exposes to the update pipeline.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Whether `collection` is part of the model catalog.
    fn is_registered(&self, collection: &str) -> bool;

    /// Ids currently present for `collection`.
    async fn known_ids(&self, collection: &str) -> Vec<Id>;

    /// Apply removals then upserts, visible to observers only as a whole.
    async fn commit(&self, commit: StoreCommit) -> Result<()>;
}

/// Reference [`DataStore`] holding entities in nested maps.
#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<Id, Fields>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `collection` to the model catalog.
    pub fn register(&self, collection: &str) {
        self.collections
            .write()
            .unwrap()
            .entry(collection.to_string())
            .or_default();
    }

    pub fn get(&self, collection: &str, id: Id) -> Option<Fields> {
        self.collections
            .read()
            .unwrap()
            .get(collection)
            .and_then(|entities| entities.get(&id))
            .cloned()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .unwrap()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    fn is_registered(&self, collection: &str) -> bool {
        self.collections.read().unwrap().contains_key(collection)
    }

    async fn known_ids(&self, collection: &str) -> Vec<Id> {
        self.collections
            .read()
            .unwrap()
            .get(collection)
            .map(|entities| entities.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn commit(&self, commit: StoreCommit) -> Result<()> {
        let mut collections = self.collections.write().unwrap();

        for (collection, ids) in &commit.removals {
            if let Some(entities) = collections.get_mut(collection) {
                for id in ids {
                    entities.remove(id);
                }
            }
        }

        for (collection, id, fields) in commit.upserts {
            let entity = collections
                .entry(collection)
                .or_default()
                .entry(id)
                .or_default();
            entity.insert("id".to_string(), Value::from(id));
            for (field, value) in fields {
                entity.insert(field, value);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_delta_keys() {
        let data = decode_delta(&json!({
            "topic/1/title": "Hello",
            "topic/1/text": "Body",
            "topic/2/title": "Other",
            "meeting/5/name": "Plenum",
        }));

        assert_eq!(data["topic"][&1]["title"], json!("Hello"));
        assert_eq!(data["topic"][&1]["text"], json!("Body"));
        assert_eq!(data["topic"][&2]["title"], json!("Other"));
        assert_eq!(data["meeting"][&5]["name"], json!("Plenum"));
    }

    #[test]
    fn skips_malformed_keys() {
        let data = decode_delta(&json!({
            "topic/1/title": "kept",
            "topic/not-an-id/title": "dropped",
            "no-slashes": "dropped",
            "topic/3": "dropped",
        }));

        assert_eq!(data.len(), 1);
        assert_eq!(data["topic"].len(), 1);
    }

    #[test]
    fn relation_of_key_extracts_collection_and_field() {
        assert_eq!(
            relation_of_key("committee/5/meeting_ids"),
            Some(("committee", "meeting_ids"))
        );
        assert_eq!(relation_of_key("committee/x/meeting_ids"), None);
        assert_eq!(relation_of_key("committee/5"), None);
    }

    #[tokio::test]
    async fn commit_merges_partial_entities() {
        let store = InMemoryStore::new();
        store.register("topic");

        store
            .commit(StoreCommit {
                removals: vec![],
                upserts: vec![(
                    "topic".to_string(),
                    1,
                    json!({ "title": "Hello" }).as_object().unwrap().clone(),
                )],
            })
            .await
            .unwrap();
        store
            .commit(StoreCommit {
                removals: vec![],
                upserts: vec![(
                    "topic".to_string(),
                    1,
                    json!({ "text": "Body" }).as_object().unwrap().clone(),
                )],
            })
            .await
            .unwrap();

        let entity = store.get("topic", 1).unwrap();
        assert_eq!(entity["id"], json!(1));
        assert_eq!(entity["title"], json!("Hello"));
        assert_eq!(entity["text"], json!("Body"));
    }

    #[tokio::test]
    async fn commit_applies_removals_before_upserts() {
        let store = InMemoryStore::new();
        store.register("topic");

        store
            .commit(StoreCommit {
                removals: vec![("topic".to_string(), vec![1])],
                upserts: vec![(
                    "topic".to_string(),
                    1,
                    json!({ "title": "reborn" }).as_object().unwrap().clone(),
                )],
            })
            .await
            .unwrap();

        assert_eq!(store.get("topic", 1).unwrap()["title"], json!("reborn"));
    }
}
