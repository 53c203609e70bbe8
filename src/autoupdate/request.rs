//! Declarative model requests.
//!
//! A [`ModelRequest`] names a collection, the ids to follow, and the fields
//! to fetch; relation fields pull the target models in recursively. Requests
//! are serialized as-is into the batched stream body.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::store::Id;

/// Requested fields: field name to an optional nested descriptor. A bare
/// value field maps to `None`.
pub type FieldSet = BTreeMap<String, Option<FieldDescriptor>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FieldDescriptor {
    /// Single relation to a fixed target collection.
    Relation { collection: String, fields: FieldSet },

    /// Id-list relation to a fixed target collection. With `full_list` set
    /// the server re-sends the complete current id list, which downstream
    /// turns into deletion inference for the target collection.
    RelationList {
        collection: String,
        fields: FieldSet,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        full_list: bool,
    },

    /// Relation whose target collection is resolved per value.
    GenericRelation { fields: FieldSet },

    /// Id-list relation whose target collection is resolved per value.
    GenericRelationList { fields: FieldSet },

    /// Structured field whose concrete sub-fields are discovered at runtime,
    /// e.g. per-meeting settings.
    Template {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        values: Option<Box<FieldDescriptor>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub collection: String,
    pub ids: Vec<Id>,
    pub fields: FieldSet,
}

/// A relation-list field found in a request, keyed by its
/// `(owning collection, field)` position on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRelation {
    /// Target collection the id list points into.
    pub collection: String,
    pub full_list: bool,
}

impl ModelRequest {
    /// Every id-list relation this request follows, recursively.
    ///
    /// Generic relations resolve their target per value and cannot be
    /// tracked statically; template sub-field names are runtime data, but a
    /// relation inside one still contributes its nested tracking.
    pub fn list_relations(&self) -> HashMap<(String, String), TrackedRelation> {
        let mut out = HashMap::new();
        collect_list_relations(&self.collection, &self.fields, &mut out);
        out
    }

    /// The subset of [`Self::list_relations`] the server re-sends complete,
    /// mapped `(owning collection, field) -> target collection`.
    pub fn full_list_relations(&self) -> HashMap<(String, String), String> {
        self.list_relations()
            .into_iter()
            .filter(|(_, tracked)| tracked.full_list)
            .map(|(key, tracked)| (key, tracked.collection))
            .collect()
    }
}

fn collect_list_relations(
    owner: &str,
    fields: &FieldSet,
    out: &mut HashMap<(String, String), TrackedRelation>,
) {
    for (field, descriptor) in fields {
        let Some(descriptor) = descriptor else {
            continue;
        };
        match descriptor {
            FieldDescriptor::Relation { collection, fields } => {
                collect_list_relations(collection, fields, out);
            }
            FieldDescriptor::RelationList {
                collection,
                fields,
                full_list,
            } => {
                out.insert(
                    (owner.to_string(), field.clone()),
                    TrackedRelation {
                        collection: collection.clone(),
                        full_list: *full_list,
                    },
                );
                collect_list_relations(collection, fields, out);
            }
            FieldDescriptor::GenericRelation { .. } | FieldDescriptor::GenericRelationList { .. } => {}
            FieldDescriptor::Template { values } => {
                if let Some(
                    FieldDescriptor::Relation { collection, fields }
                    | FieldDescriptor::RelationList {
                        collection, fields, ..
                    },
                ) = values.as_deref()
                {
                    collect_list_relations(collection, fields, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn committee_request() -> ModelRequest {
        ModelRequest {
            collection: "committee".to_string(),
            ids: vec![5],
            fields: FieldSet::from([
                ("name".to_string(), None),
                (
                    "meeting_ids".to_string(),
                    Some(FieldDescriptor::RelationList {
                        collection: "meeting".to_string(),
                        fields: FieldSet::from([("name".to_string(), None)]),
                        full_list: true,
                    }),
                ),
            ]),
        }
    }

    #[test]
    fn serializes_with_tagged_descriptors() {
        let value = serde_json::to_value(committee_request()).unwrap();
        assert_eq!(value["collection"], json!("committee"));
        assert_eq!(value["ids"], json!([5]));
        assert_eq!(value["fields"]["name"], json!(null));
        assert_eq!(value["fields"]["meeting_ids"]["type"], json!("relation-list"));
        assert_eq!(value["fields"]["meeting_ids"]["collection"], json!("meeting"));
        assert_eq!(value["fields"]["meeting_ids"]["full_list"], json!(true));
    }

    #[test]
    fn round_trips_through_json() {
        let request = committee_request();
        let text = serde_json::to_string(&request).unwrap();
        let back: ModelRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn full_list_relations_walks_nested_requests() {
        let request = ModelRequest {
            collection: "organization".to_string(),
            ids: vec![1],
            fields: FieldSet::from([(
                "committee_ids".to_string(),
                Some(FieldDescriptor::RelationList {
                    collection: "committee".to_string(),
                    fields: committee_request().fields,
                    full_list: false,
                }),
            )]),
        };

        let tracked = request.full_list_relations();
        assert_eq!(tracked.len(), 1);
        assert_eq!(
            tracked[&("committee".to_string(), "meeting_ids".to_string())],
            "meeting"
        );

        let all = request.list_relations();
        assert_eq!(all.len(), 2);
        let partial = &all[&("organization".to_string(), "committee_ids".to_string())];
        assert_eq!(partial.collection, "committee");
        assert!(!partial.full_list);
    }

    #[test]
    fn generic_relations_are_not_tracked() {
        let request = ModelRequest {
            collection: "projector".to_string(),
            ids: vec![1],
            fields: FieldSet::from([(
                "content_object_id".to_string(),
                Some(FieldDescriptor::GenericRelation {
                    fields: FieldSet::from([("title".to_string(), None)]),
                }),
            )]),
        };
        assert!(request.full_list_relations().is_empty());
    }
}
