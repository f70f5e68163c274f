//! C3 — the Entry Transformer.
//!
//! Converts a `ParsedEntry` into zero or one `Publication`: namespace
//! filtering, identity/changed-field extraction, channel computation,
//! and message encoding, per spec.md §4.3.

use bson::Bson;
use serde::Serialize;

use crate::oplog::{DecodeError, Operation, ParsedEntry, Publication, PublicationMessage};

/// Collections and databases internal to Mongo; excluded regardless of
/// any configured allow-list, per spec.md's open question resolution.
const EXCLUDED_DATABASES: &[&str] = &["admin", "local", "config"];

/// An allow/deny filter over databases and collections, applied in
/// addition to the hard-coded internal-namespace exclusions. `None`
/// disables that side of the filter (everything not otherwise excluded
/// passes).
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    pub allowed_databases: Option<Vec<String>>,
    pub denied_databases: Vec<String>,
}

impl NamespaceFilter {
    fn permits(&self, database: &str) -> bool {
        if let Some(allowed) = &self.allowed_databases {
            if !allowed.iter().any(|d| d == database) {
                return false;
            }
        }
        !self.denied_databases.iter().any(|d| d == database)
    }
}

/// Transform a single parsed entry. `Ok(None)` means "ignored by
/// policy," not an error; `Err` is a decode failure, counted under the
/// `error` metric status and skipped by the caller.
pub fn transform(
    entry: &ParsedEntry,
    prefix: &str,
    filter: &NamespaceFilter,
) -> Result<Option<Publication>, DecodeError> {
    if is_internal_namespace(&entry.database, &entry.collection) || !filter.permits(&entry.database)
    {
        return Ok(None);
    }

    let fields = changed_fields(entry)?;
    let channels = compute_channels(prefix, &entry.database, &entry.collection, &entry.doc_id);
    let msg = encode_message(entry, &fields)?;

    Ok(Some(Publication {
        channels,
        msg,
        oplog_timestamp: entry.timestamp,
        tx_idx: entry.tx_idx,
        doc_id: entry.doc_id.clone(),
    }))
}

fn is_internal_namespace(database: &str, collection: &str) -> bool {
    EXCLUDED_DATABASES.contains(&database) || collection.starts_with("system.")
}

/// The set of top-level field names changed by this entry, per
/// spec.md §4.3 item 3.
fn changed_fields(entry: &ParsedEntry) -> Result<Vec<String>, DecodeError> {
    match entry.operation {
        Operation::Insert => Ok(entry.data.keys().cloned().collect()),
        Operation::Remove => Ok(Vec::new()),
        Operation::Update => {
            let operators: Vec<&String> = entry.data.keys().filter(|k| k.starts_with('$')).collect();

            if operators.is_empty() {
                // Replacement-style update: every top-level field of the
                // replacement document counts as changed.
                return Ok(entry.data.keys().cloned().collect());
            }

            // Every `$`-prefixed operator ($set, $unset, $inc, $push,
            // $addToSet, $rename, ...) names the fields it touches as
            // the top-level keys of its own sub-document; collecting
            // across all of them, not just $set/$unset, is what keeps a
            // mixed update like {$set:{name:"x"}, $inc:{version:1}}
            // from silently dropping `version`.
            let mut fields = Vec::new();
            for op in operators {
                if let Some(Bson::Document(sub_doc)) = entry.data.get(op) {
                    fields.extend(sub_doc.keys().cloned());
                }
            }
            fields.sort();
            fields.dedup();
            Ok(fields)
        }
    }
}

fn compute_channels(prefix: &str, database: &str, collection: &str, doc_id: &Bson) -> Vec<String> {
    let doc_id_str = bson_id_to_channel_fragment(doc_id);
    vec![
        format!("{prefix}{database}"),
        format!("{prefix}{database}.{collection}"),
        format!("{prefix}{database}.{collection}::{doc_id_str}"),
    ]
}

fn bson_id_to_channel_fragment(doc_id: &Bson) -> String {
    match doc_id {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

fn encode_message(entry: &ParsedEntry, fields: &[String]) -> Result<Vec<u8>, DecodeError> {
    let ns = format!("{}.{}", entry.database, entry.collection);
    let id = bson_to_json(&entry.doc_id);

    let message = PublicationMessage {
        ev: entry.operation.event_code(),
        ns: &ns,
        id,
        fields,
    };

    serde_json::to_vec(&Message(message))
        .map_err(|e| DecodeError::new(format!("failed to encode publication message: {e}")))
}

/// Thin wrapper so `PublicationMessage`'s borrowed fields serialize as a
/// flat `{ev, ns, id, fields}` object without needing a lifetime dance
/// at the call site.
struct Message<'a>(PublicationMessage<'a>);

impl<'a> Serialize for Message<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Converts a BSON value to its `serde_json::Value` per Mongo's
/// conventional relaxed extended-JSON rendering: plain values for the
/// common scalar types, `{"$oid": "..."}` for `ObjectId`, and so on for
/// the less common types.
fn bson_to_json(value: &Bson) -> serde_json::Value {
    value.clone().into_relaxed_extjson()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OplogTimestamp;
    use std::collections::BTreeMap;

    fn entry(operation: Operation, data: BTreeMap<String, Bson>, doc_id: Bson) -> ParsedEntry {
        ParsedEntry {
            operation,
            timestamp: OplogTimestamp::new(100, 1),
            namespace: "app.users".to_string(),
            database: "app".to_string(),
            collection: "users".to_string(),
            doc_id,
            data,
            tx_idx: 0,
        }
    }

    #[test]
    fn insert_publishes_all_fields_on_all_three_channels() {
        let mut data = BTreeMap::new();
        data.insert("_id".to_string(), Bson::String("u1".to_string()));
        data.insert("name".to_string(), Bson::String("a".to_string()));
        let e = entry(Operation::Insert, data, Bson::String("u1".to_string()));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        assert_eq!(
            pub_.channels,
            vec!["otr:app", "otr:app.users", "otr:app.users::u1"]
        );
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        assert_eq!(body["ev"], "i");
        assert_eq!(body["ns"], "app.users");
        assert_eq!(body["id"], "u1");
        let mut fields: Vec<String> = body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        fields.sort();
        assert_eq!(fields, vec!["_id", "name"]);
    }

    #[test]
    fn set_update_publishes_only_set_fields() {
        let mut set_doc = bson::Document::new();
        set_doc.insert("name", "b");
        let mut data = BTreeMap::new();
        data.insert("$set".to_string(), Bson::Document(set_doc));
        let e = entry(Operation::Update, data, Bson::String("u1".to_string()));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        assert_eq!(body["ev"], "u");
        assert_eq!(body["fields"], serde_json::json!(["name"]));
    }

    #[test]
    fn inc_only_update_publishes_the_incremented_field() {
        let mut inc_doc = bson::Document::new();
        inc_doc.insert("count", 1);
        let mut data = BTreeMap::new();
        data.insert("$inc".to_string(), Bson::Document(inc_doc));
        let e = entry(Operation::Update, data, Bson::String("u1".to_string()));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        assert_eq!(body["ev"], "u");
        assert_eq!(body["fields"], serde_json::json!(["count"]));
    }

    #[test]
    fn mixed_operator_update_collects_fields_from_every_operator() {
        let mut set_doc = bson::Document::new();
        set_doc.insert("name", "x");
        let mut inc_doc = bson::Document::new();
        inc_doc.insert("version", 1);
        let mut data = BTreeMap::new();
        data.insert("$set".to_string(), Bson::Document(set_doc));
        data.insert("$inc".to_string(), Bson::Document(inc_doc));
        let e = entry(Operation::Update, data, Bson::String("u1".to_string()));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        let mut fields: Vec<String> = body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        fields.sort();
        assert_eq!(fields, vec!["name", "version"]);
    }

    #[test]
    fn unrecognized_operator_alone_still_publishes_instead_of_erroring() {
        let mut push_doc = bson::Document::new();
        push_doc.insert("tags", "new-tag");
        let mut data = BTreeMap::new();
        data.insert("$push".to_string(), Bson::Document(push_doc));
        let e = entry(Operation::Update, data, Bson::String("u1".to_string()));

        let result = transform(&e, "otr:", &NamespaceFilter::default());
        assert!(result.is_ok(), "a valid update operator must never be treated as a decode error");
        let body: serde_json::Value = serde_json::from_slice(&result.unwrap().unwrap().msg).unwrap();
        assert_eq!(body["fields"], serde_json::json!(["tags"]));
    }

    #[test]
    fn replacement_update_publishes_all_top_level_fields() {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), Bson::String("b".to_string()));
        data.insert("age".to_string(), Bson::Int32(30));
        let e = entry(Operation::Update, data, Bson::String("u1".to_string()));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        let mut fields: Vec<String> = body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        fields.sort();
        assert_eq!(fields, vec!["age", "name"]);
    }

    #[test]
    fn delete_publishes_no_fields() {
        let mut data = BTreeMap::new();
        data.insert("_id".to_string(), Bson::String("u1".to_string()));
        let e = entry(Operation::Remove, data, Bson::String("u1".to_string()));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        assert_eq!(body["ev"], "d");
        assert_eq!(body["fields"], serde_json::json!([]));
    }

    #[test]
    fn internal_namespaces_are_dropped() {
        let mut e = entry(Operation::Insert, BTreeMap::new(), Bson::String("x".to_string()));
        e.database = "app".to_string();
        e.collection = "system.indexes".to_string();
        assert!(transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .is_none());

        let mut e2 = entry(Operation::Insert, BTreeMap::new(), Bson::String("x".to_string()));
        e2.database = "admin".to_string();
        assert!(transform(&e2, "otr:", &NamespaceFilter::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn deny_list_drops_configured_databases() {
        let e = entry(Operation::Insert, BTreeMap::new(), Bson::String("x".to_string()));
        let filter = NamespaceFilter {
            allowed_databases: None,
            denied_databases: vec!["app".to_string()],
        };
        assert!(transform(&e, "otr:", &filter).unwrap().is_none());
    }

    #[test]
    fn allow_list_only_permits_named_databases() {
        let e = entry(Operation::Insert, BTreeMap::new(), Bson::String("x".to_string()));
        let filter = NamespaceFilter {
            allowed_databases: Some(vec!["other".to_string()]),
            denied_databases: Vec::new(),
        };
        assert!(transform(&e, "otr:", &filter).unwrap().is_none());
    }

    #[test]
    fn numeric_doc_id_renders_without_quotes_in_message_but_as_string_in_channel() {
        let mut data = BTreeMap::new();
        data.insert("_id".to_string(), Bson::Int32(42));
        let e = entry(Operation::Insert, data, Bson::Int32(42));

        let pub_ = transform(&e, "otr:", &NamespaceFilter::default())
            .unwrap()
            .unwrap();
        assert!(pub_.channels[2].ends_with("::42"));
        let body: serde_json::Value = serde_json::from_slice(&pub_.msg).unwrap();
        assert_eq!(body["id"], serde_json::json!(42));
    }
}
