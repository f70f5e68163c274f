//! The data model shared by the tailer, transformer, and publisher.
//!
//! `RawOplogEntry` mirrors the on-wire shape of a document in
//! `local.oplog.rs`; `ParsedEntry` is the driver-agnostic shape the
//! transformer consumes; `Publication` is what the publisher drains off
//! the bounded channel.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use bson::{Bson, Document};
use serde::Deserialize;

/// A 64-bit composite MongoDB oplog timestamp: `(seconds, ordinal)`,
/// totally ordered lexicographically on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct OplogTimestamp {
    #[serde(rename = "t")]
    pub seconds: u32,
    #[serde(rename = "i")]
    pub ordinal: u32,
}

impl OplogTimestamp {
    pub fn new(seconds: u32, ordinal: u32) -> Self {
        OplogTimestamp { seconds, ordinal }
    }

    /// The timestamp encoded as a BSON `Timestamp` value, as stored on
    /// the wire and as used in the `{ts: {$gt: ...}}` tailing filter.
    pub fn to_bson_timestamp(self) -> bson::Timestamp {
        bson::Timestamp {
            time: self.seconds,
            increment: self.ordinal,
        }
    }

    pub fn from_bson_timestamp(ts: bson::Timestamp) -> Self {
        OplogTimestamp {
            seconds: ts.time,
            ordinal: ts.increment,
        }
    }
}

impl Ord for OplogTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seconds, self.ordinal).cmp(&(other.seconds, other.ordinal))
    }
}

impl PartialOrd for OplogTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OplogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.ordinal)
    }
}

/// The kind of mutation an oplog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Remove,
}

impl Operation {
    /// The single-letter event code used in the publication's JSON body.
    pub fn event_code(self) -> &'static str {
        match self {
            Operation::Insert => "i",
            Operation::Update => "u",
            Operation::Remove => "d",
        }
    }

    fn from_raw_op(op: &str) -> Option<Self> {
        match op {
            "i" => Some(Operation::Insert),
            "u" => Some(Operation::Update),
            "d" => Some(Operation::Remove),
            _ => None,
        }
    }
}

/// The on-wire record as stored in `local.oplog.rs`.
///
/// `o2` is only populated for updates; `o` holds the inserted document,
/// the update modifier/replacement document, or the delete selector
/// depending on `op`. For `op == "c"` transaction entries, `o.applyOps`
/// holds the nested entries.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOplogEntry {
    pub ts: OplogTimestamp,
    pub op: String,
    pub ns: String,
    pub o: Document,
    #[serde(default)]
    pub o2: Option<Document>,
}

impl RawOplogEntry {
    /// Split `"db.coll.sub"` into `("db", "coll.sub")`. `"db"` alone
    /// splits to `("db", "")`.
    pub fn split_namespace(ns: &str) -> (&str, &str) {
        match ns.split_once('.') {
            Some((db, coll)) => (db, coll),
            None => (ns, ""),
        }
    }

    pub fn is_transaction_command(&self) -> bool {
        self.op == "c" && self.ns == "admin.$cmd" && self.o.contains_key("applyOps")
    }

    /// The nested entries of an `applyOps` transaction command, in their
    /// declared order. Each inherits the outer `ts`.
    pub fn apply_ops_children(&self) -> Vec<RawOplogEntry> {
        let Some(Bson::Array(ops)) = self.o.get("applyOps") else {
            return Vec::new();
        };
        ops.iter()
            .filter_map(|b| b.as_document())
            .filter_map(|d| bson::from_document::<RawOplogEntry>(d.clone()).ok())
            .map(|mut child| {
                child.ts = self.ts;
                child
            })
            .collect()
    }
}

/// The internal, driver-agnostic representation of a single mutation,
/// already resolved to a specific document.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub operation: Operation,
    pub timestamp: OplogTimestamp,
    pub namespace: String,
    pub database: String,
    pub collection: String,
    pub doc_id: Bson,
    pub data: BTreeMap<String, Bson>,
    pub tx_idx: u32,
}

impl ParsedEntry {
    /// Build a `ParsedEntry` from a raw entry and an already-resolved
    /// `txIdx`. Returns `None` for ops this crate has no representation
    /// for (`"c"` without `applyOps`, `"n"` noops).
    pub fn from_raw(raw: &RawOplogEntry, tx_idx: u32) -> Option<Result<ParsedEntry, DecodeError>> {
        let operation = Operation::from_raw_op(&raw.op)?;
        let (database, collection) = RawOplogEntry::split_namespace(&raw.ns);

        if database.is_empty() || collection.is_empty() {
            return Some(Err(DecodeError::new(format!(
                "malformed namespace '{}'",
                raw.ns
            ))));
        }

        let doc_id = match operation {
            Operation::Insert | Operation::Remove => raw.o.get("_id").cloned(),
            Operation::Update => raw
                .o2
                .as_ref()
                .and_then(|sel| sel.get("_id"))
                .cloned(),
        };

        let doc_id = match doc_id {
            Some(id) => id,
            None => {
                return Some(Err(DecodeError::new(
                    "entry is missing a document identity (_id)",
                )))
            }
        };

        let data: BTreeMap<String, Bson> = raw
            .o
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Ok(ParsedEntry {
            operation,
            timestamp: raw.ts,
            namespace: raw.ns.clone(),
            database: database.to_string(),
            collection: collection.to_string(),
            doc_id,
            data,
            tx_idx,
        }))
    }
}

/// A decode failure for a single oplog entry. Recoverable: the entry is
/// skipped and counted under the `error` metric status, the tailer keeps
/// running.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        DecodeError {
            reason: reason.into(),
        }
    }
}

/// What is handed from the transformer to the publisher.
#[derive(Debug, Clone)]
pub struct Publication {
    pub channels: Vec<String>,
    pub msg: Vec<u8>,
    pub oplog_timestamp: OplogTimestamp,
    pub tx_idx: u32,
    pub doc_id: Bson,
}

/// The compact JSON message published to subscribers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PublicationMessage<'a> {
    pub ev: &'a str,
    pub ns: &'a str,
    pub id: serde_json::Value,
    pub fields: &'a [String],
}
