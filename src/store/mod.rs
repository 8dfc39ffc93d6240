//! Ledger Store: the real-time transactional document database collaborator
//!
//! Controllers only ever see [`LedgerStore`]; the concrete backend is injected.
//! [`MemoryStore`] keeps everything in process and [`RestStore`] talks to a
//! PostgREST-shaped document backend.

mod memory;
mod query;
mod realtime;
mod rest;
mod subscription;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Error;

pub use memory::MemoryStore;
pub use query::*;
pub use realtime::RealtimeOptions;
pub use rest::RestStore;
pub use subscription::Subscription;
pub(crate) use subscription::ListenerHub;

/// A stored document: top-level field name to JSON value
pub type Document = Map<String, Value>;

/// Collection names of the persisted layout
pub mod collections {
    /// User accounts
    pub const USERS: &str = "users";
    /// Active offers
    pub const DONATIONS: &str = "donations";
    /// Confirmed offers
    pub const COMPLETED_DONATIONS: &str = "completed_donations";
    /// Redemption audit records
    pub const REDEEM_HISTORY: &str = "redeem_history";
    /// Support chat threads
    pub const SUPPORT_CHATS: &str = "support_chats";
    /// Balance change audit entries
    pub const POINTS_LEDGER: &str = "points_ledger";

    /// Every collection of the layout
    pub const ALL: [&str; 6] = [
        USERS,
        DONATIONS,
        COMPLETED_DONATIONS,
        REDEEM_HISTORY,
        SUPPORT_CHATS,
        POINTS_LEDGER,
    ];
}

/// Address of one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocRef {
    /// Collection name
    pub collection: String,
    /// Document id
    pub id: String,
}

impl DocRef {
    /// Create a new document reference
    pub fn new(collection: &str, id: &str) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as read from the store
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Document id
    pub id: String,
    /// Store-assigned version; changes on every write to the document
    pub version: u64,
    /// Document fields
    pub data: Document,
}

impl Record {
    /// Deserialize the document into a typed model
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }

    /// Read one top-level field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Result set of a query at one point in time
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Matching records in query order
    pub records: Vec<Record>,
}

impl Snapshot {
    /// Deserialize every record into a typed model
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        self.records.iter().map(Record::decode).collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the result set is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One write inside a commit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Create or overwrite
    Set {
        #[serde(flatten)]
        target: DocRef,
        fields: Document,
    },
    /// Merge into an existing document; the commit fails if it is absent
    Update {
        #[serde(flatten)]
        target: DocRef,
        fields: Document,
    },
    /// Remove the document
    Delete {
        #[serde(flatten)]
        target: DocRef,
    },
}

impl Mutation {
    /// The document this mutation writes
    pub fn target(&self) -> &DocRef {
        match self {
            Mutation::Set { target, .. }
            | Mutation::Update { target, .. }
            | Mutation::Delete { target } => target,
        }
    }
}

/// The records a transaction read, as seen by its committed attempt
#[derive(Debug, Clone, Default)]
pub struct TxnReads {
    records: HashMap<DocRef, Option<Record>>,
}

impl TxnReads {
    pub(crate) fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (DocRef, Option<Record>)>,
    {
        Self {
            records: entries.into_iter().collect(),
        }
    }

    /// The record at `target`, if it was read and exists
    pub fn get(&self, target: &DocRef) -> Option<&Record> {
        self.records.get(target).and_then(Option::as_ref)
    }

    /// Deserialize the record at `target`
    pub fn decode<T: DeserializeOwned>(&self, target: &DocRef) -> Result<Option<T>, Error> {
        self.get(target).map(Record::decode).transpose()
    }

    /// Every read reference with the version it had (`None` when absent)
    pub fn versions(&self) -> impl Iterator<Item = (&DocRef, Option<u64>)> {
        self.records
            .iter()
            .map(|(target, record)| (target, record.as_ref().map(|r| r.version)))
    }
}

/// Outcome of a committed transaction
#[derive(Debug, Clone)]
pub struct TxnCommit {
    /// Reads of the attempt that committed
    pub reads: TxnReads,
    /// Mutations as planned (server timestamps unresolved)
    pub mutations: Vec<Mutation>,
    /// The value every server timestamp of this commit resolved to
    pub commit_time: DateTime<Utc>,
}

/// Sentinel marking a field the store fills with its commit timestamp
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Whether a value is the server timestamp sentinel
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|o| o.len() == 1 && o.get(".sv").and_then(Value::as_str) == Some("timestamp"))
        .unwrap_or(false)
}

/// Wire format of stored timestamps
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn resolve_server_timestamps(fields: &mut Document, at: DateTime<Utc>) {
    let stamp = format_timestamp(at);
    for value in fields.values_mut() {
        if is_server_timestamp(value) {
            *value = Value::String(stamp.clone());
        }
    }
}

/// Serialize a model into a document
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::invalid(format!(
            "expected an object document, got {}",
            other
        ))),
    }
}

/// Plans the mutations of one transaction attempt from its reads
pub type TxnPlan<'a> = dyn for<'r> Fn(&'r TxnReads) -> Result<Vec<Mutation>, Error> + Send + Sync + 'a;

/// Interface of the real-time document store
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read one document
    async fn get_record(&self, target: &DocRef) -> Result<Option<Record>, Error>;

    /// Create or overwrite one document
    async fn set_record(&self, target: &DocRef, fields: Document) -> Result<(), Error>;

    /// Merge fields into an existing document; `RecordNotFound` if absent
    async fn update_record(&self, target: &DocRef, fields: Document) -> Result<(), Error>;

    /// Remove one document
    async fn delete_record(&self, target: &DocRef) -> Result<(), Error>;

    /// Run a query once
    async fn query(&self, query: &Query) -> Result<Snapshot, Error>;

    /// Open a live subscription.
    ///
    /// The first snapshot is delivered immediately, then one per change of the
    /// result set, until the subscription is cancelled or dropped.
    async fn subscribe(&self, query: Query) -> Result<Subscription, Error>;

    /// Read `reads`, plan mutations with `apply`, and commit them atomically.
    ///
    /// If any read document changed before the commit, the reads are taken
    /// again and `apply` is re-run, up to the store's attempt budget, after
    /// which the transaction fails with `Conflict`. An error from `apply`
    /// aborts the transaction without writing anything.
    async fn run_transaction(
        &self,
        reads: &[DocRef],
        apply: &TxnPlan<'_>,
    ) -> Result<TxnCommit, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn server_timestamps_resolve_only_sentinels() {
        let mut fields = Document::new();
        fields.insert("createdAt".to_string(), server_timestamp());
        fields.insert("note".to_string(), json!({ ".sv": "other" }));
        fields.insert("name".to_string(), json!("blankets"));

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        resolve_server_timestamps(&mut fields, at);

        assert_eq!(fields["createdAt"], json!("2024-03-01T12:00:00.000000Z"));
        assert_eq!(fields["note"], json!({ ".sv": "other" }));
        assert_eq!(fields["name"], json!("blankets"));
    }

    #[test]
    fn mutations_serialize_with_flattened_target() {
        let mutation = Mutation::Delete {
            target: DocRef::new(collections::DONATIONS, "offer-1"),
        };
        assert_eq!(
            serde_json::to_value(&mutation).unwrap(),
            json!({ "op": "delete", "collection": "donations", "id": "offer-1" })
        );
    }

    #[test]
    fn to_document_rejects_non_objects() {
        assert!(to_document(&json!([1, 2])).is_err());
        assert!(to_document(&json!({ "a": 1 })).is_ok());
    }
}
