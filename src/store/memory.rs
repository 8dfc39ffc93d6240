//! In-process Ledger Store with optimistic transactions

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    resolve_server_timestamps, DocRef, Document, LedgerStore, ListenerHub, Mutation, Query,
    Record, Snapshot, Subscription, TxnCommit, TxnPlan, TxnReads,
};
use crate::error::Error;

const DEFAULT_TRANSACTION_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Record>>,
    next_version: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StoreState {
    fn get(&self, target: &DocRef) -> Option<&Record> {
        self.collections
            .get(&target.collection)
            .and_then(|c| c.get(&target.id))
    }

    fn version(&self, target: &DocRef) -> Option<u64> {
        self.get(target).map(|r| r.version)
    }

    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Commit timestamps never repeat and never go backwards
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let at = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(at);
        at
    }

    /// Reject the batch if an update targets a document that will not exist
    fn validate(&self, mutations: &[Mutation]) -> Result<(), Error> {
        let mut overlay: HashMap<&DocRef, bool> = HashMap::new();
        for mutation in mutations {
            match mutation {
                Mutation::Set { target, .. } => {
                    overlay.insert(target, true);
                }
                Mutation::Delete { target } => {
                    overlay.insert(target, false);
                }
                Mutation::Update { target, .. } => {
                    let exists = overlay
                        .get(target)
                        .copied()
                        .unwrap_or_else(|| self.get(target).is_some());
                    if !exists {
                        return Err(Error::record_not_found(&target.collection, &target.id));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, mutations: &[Mutation], at: DateTime<Utc>) -> HashSet<String> {
        let mut touched = HashSet::new();
        for mutation in mutations {
            let target = mutation.target();
            touched.insert(target.collection.clone());
            match mutation {
                Mutation::Set { fields, .. } => {
                    let mut data = fields.clone();
                    resolve_server_timestamps(&mut data, at);
                    let version = self.bump_version();
                    self.collections
                        .entry(target.collection.clone())
                        .or_default()
                        .insert(
                            target.id.clone(),
                            Record {
                                id: target.id.clone(),
                                version,
                                data,
                            },
                        );
                }
                Mutation::Update { fields, .. } => {
                    let mut patch = fields.clone();
                    resolve_server_timestamps(&mut patch, at);
                    let version = self.bump_version();
                    if let Some(record) = self
                        .collections
                        .get_mut(&target.collection)
                        .and_then(|c| c.get_mut(&target.id))
                    {
                        record.data.extend(patch);
                        record.version = version;
                    }
                }
                Mutation::Delete { .. } => {
                    if let Some(collection) = self.collections.get_mut(&target.collection) {
                        collection.remove(&target.id);
                    }
                }
            }
        }
        touched
    }

    fn run_query(&self, query: &Query) -> Snapshot {
        let records: Vec<Record> = self
            .collections
            .get(&query.collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        Snapshot {
            records: query.apply(records),
        }
    }
}

/// Ledger Store kept in process memory.
///
/// Every document carries a version; a transaction commits only if the
/// versions it read are still current, otherwise it is re-planned.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    hub: Arc<ListenerHub>,
    max_attempts: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            hub: ListenerHub::new(),
            max_attempts: DEFAULT_TRANSACTION_ATTEMPTS,
        }
    }

    /// Set how many times a conflicting transaction is re-planned
    pub fn with_transaction_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Number of open subscriptions
    pub fn listener_count(&self) -> usize {
        self.hub.len()
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn commit(&self, state: &mut StoreState, mutations: &[Mutation]) -> Result<DateTime<Utc>, Error> {
        state.validate(mutations)?;
        let at = state.next_timestamp();
        let touched = state.apply(mutations, at);

        for (id, query) in self.hub.watching(&touched) {
            self.hub.deliver(id, state.run_query(&query));
        }
        Ok(at)
    }

    async fn write(&self, mutation: Mutation) -> Result<(), Error> {
        let mut state = self.state.write().await;
        self.commit(&mut state, std::slice::from_ref(&mutation))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_record(&self, target: &DocRef) -> Result<Option<Record>, Error> {
        Ok(self.state.read().await.get(target).cloned())
    }

    async fn set_record(&self, target: &DocRef, fields: Document) -> Result<(), Error> {
        self.write(Mutation::Set {
            target: target.clone(),
            fields,
        })
        .await
    }

    async fn update_record(&self, target: &DocRef, fields: Document) -> Result<(), Error> {
        self.write(Mutation::Update {
            target: target.clone(),
            fields,
        })
        .await
    }

    async fn delete_record(&self, target: &DocRef) -> Result<(), Error> {
        self.write(Mutation::Delete {
            target: target.clone(),
        })
        .await
    }

    async fn query(&self, query: &Query) -> Result<Snapshot, Error> {
        Ok(self.state.read().await.run_query(query))
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, Error> {
        // Registering under the read lock means no commit slips between the
        // initial snapshot and the first delivery.
        let state = self.state.read().await;
        let initial = state.run_query(&query);
        Ok(self.hub.register(query, initial))
    }

    async fn run_transaction(
        &self,
        reads: &[DocRef],
        apply: &TxnPlan<'_>,
    ) -> Result<TxnCommit, Error> {
        for attempt in 1..=self.max_attempts {
            let snapshot = {
                let state = self.state.read().await;
                TxnReads::new(reads.iter().map(|r| (r.clone(), state.get(r).cloned())))
            };

            let mutations = apply(&snapshot)?;

            let mut state = self.state.write().await;
            let stale = snapshot
                .versions()
                .any(|(target, version)| state.version(target) != version);
            if stale {
                drop(state);
                warn!(
                    "Transaction attempt {}/{} hit a concurrent write, retrying",
                    attempt, self.max_attempts
                );
                tokio::task::yield_now().await;
                continue;
            }

            let commit_time = self.commit(&mut state, &mutations)?;
            debug!(
                "Transaction committed {} mutation(s) on attempt {}",
                mutations.len(),
                attempt
            );
            return Ok(TxnCommit {
                reads: snapshot,
                mutations,
                commit_time,
            });
        }

        Err(Error::conflict(format!(
            "gave up after {} attempts",
            self.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{server_timestamp, SortOrder};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = MemoryStore::new();
        let target = DocRef::new("users", "u1");

        let result = store.update_record(&target, doc(json!({ "points": 1 }))).await;
        assert!(matches!(result, Err(Error::RecordNotFound { .. })));

        store
            .set_record(&target, doc(json!({ "id": "u1", "points": 10, "email": "a@b.c" })))
            .await
            .unwrap();
        store
            .update_record(&target, doc(json!({ "points": 15 })))
            .await
            .unwrap();

        let record = store.get_record(&target).await.unwrap().unwrap();
        assert_eq!(record.data["points"], json!(15));
        assert_eq!(record.data["email"], json!("a@b.c"));
    }

    #[tokio::test]
    async fn server_timestamps_are_strictly_increasing() {
        let store = MemoryStore::new();
        for i in 0..20 {
            store
                .set_record(
                    &DocRef::new("donations", &format!("o{:02}", i)),
                    doc(json!({ "seq": i, "createdAt": server_timestamp() })),
                )
                .await
                .unwrap();
        }

        let snapshot = store
            .query(&Query::new("donations").order("createdAt", SortOrder::Ascending))
            .await
            .unwrap();
        let seqs: Vec<i64> = snapshot
            .records
            .iter()
            .map(|r| r.data["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<i64>>());

        let stamps: HashSet<String> = snapshot
            .records
            .iter()
            .map(|r| r.data["createdAt"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(stamps.len(), 20);
    }

    #[tokio::test]
    async fn failed_plan_writes_nothing() {
        let store = MemoryStore::new();
        let target = DocRef::new("users", "u1");
        store
            .set_record(&target, doc(json!({ "points": 3 })))
            .await
            .unwrap();

        let result = store
            .run_transaction(&[target.clone()], &|_reads| {
                Err(Error::InsufficientBalance {
                    required: 5,
                    available: 3,
                })
            })
            .await;

        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        let record = store.get_record(&target).await.unwrap().unwrap();
        assert_eq!(record.data["points"], json!(3));
    }

    #[tokio::test]
    async fn batch_with_missing_update_target_is_all_or_nothing() {
        let store = MemoryStore::new();
        let result = store
            .run_transaction(&[], &|_reads| {
                Ok(vec![
                    Mutation::Set {
                        target: DocRef::new("donations", "o1"),
                        fields: doc(json!({ "itemName": "rice" })),
                    },
                    Mutation::Update {
                        target: DocRef::new("users", "ghost"),
                        fields: doc(json!({ "points": 5 })),
                    },
                ])
            })
            .await;

        assert!(matches!(result, Err(Error::RecordNotFound { .. })));
        assert_eq!(store.count("donations").await, 0);
    }

    #[tokio::test]
    async fn concurrent_write_forces_a_replan() {
        let store = MemoryStore::new();
        let target = DocRef::new("users", "u1");
        store
            .set_record(&target, doc(json!({ "points": 10 })))
            .await
            .unwrap();

        let attempts = AtomicUsize::new(0);
        let commit = store
            .run_transaction(&[target.clone()], &|reads| {
                let points = reads.get(&target).unwrap().data["points"].as_u64().unwrap();
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Simulate another session committing between read and write.
                    let mut state = store.state.try_write().unwrap();
                    let version = state.bump_version();
                    let record = state
                        .collections
                        .get_mut("users")
                        .and_then(|c| c.get_mut("u1"))
                        .unwrap();
                    record.data.insert("points".to_string(), json!(12));
                    record.version = version;
                }
                Ok(vec![Mutation::Update {
                    target: target.clone(),
                    fields: doc(json!({ "points": points + 5 })),
                }])
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            commit.reads.get(&target).unwrap().data["points"],
            json!(12)
        );
        let record = store.get_record(&target).await.unwrap().unwrap();
        assert_eq!(record.data["points"], json!(17));
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up() {
        let store = MemoryStore::new().with_transaction_attempts(2);
        let target = DocRef::new("users", "u1");
        store
            .set_record(&target, doc(json!({ "points": 10 })))
            .await
            .unwrap();

        let result = store
            .run_transaction(&[target.clone()], &|_reads| {
                let mut state = store.state.try_write().unwrap();
                let version = state.bump_version();
                if let Some(record) = state
                    .collections
                    .get_mut("users")
                    .and_then(|c| c.get_mut("u1"))
                {
                    record.version = version;
                }
                Ok(Vec::new())
            })
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn subscriptions_see_initial_and_changed_results() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe(Query::new("donations").eq("userId", "u1"))
            .await
            .unwrap();
        assert!(sub.recv().await.unwrap().is_empty());

        store
            .set_record(
                &DocRef::new("donations", "o1"),
                doc(json!({ "userId": "u1", "itemName": "coats" })),
            )
            .await
            .unwrap();
        store
            .set_record(
                &DocRef::new("donations", "o2"),
                doc(json!({ "userId": "u2", "itemName": "shoes" })),
            )
            .await
            .unwrap();

        let snapshot = sub.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records[0].id, "o1");
        // The u2 offer does not change u1's result set.
        assert!(sub.try_recv().is_none());

        assert_eq!(store.listener_count(), 1);
        sub.cancel();
        assert_eq!(store.listener_count(), 0);
    }
}
