//! Ledger Store backed by a PostgREST-shaped document API
//!
//! Reads go through `GET /rest/v1/{collection}`. Every write, single or
//! transactional, is a commit to `POST /rest/v1/rpc/commit_documents` carrying
//! version preconditions and mutations; the backend answers `409` when a
//! precondition no longer holds and `404` when an update target is missing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::realtime::{ChangeFeed, RealtimeOptions};
use super::{
    collections, DocRef, Document, LedgerStore, ListenerHub, Mutation, Query, Record, Snapshot,
    Subscription, TxnCommit, TxnPlan, TxnReads,
};
use crate::error::Error;
use crate::fetch::{ensure_success, Fetch, FetchBuilder};

const VERSION_COLUMN: &str = "_version";
const DEFAULT_TRANSACTION_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize)]
struct Precondition<'a> {
    collection: &'a str,
    id: &'a str,
    version: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    preconditions: Vec<Precondition<'a>>,
    mutations: &'a [Mutation],
}

#[derive(Debug, Default, Deserialize)]
struct CommitResponse {
    commit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct MissingTarget {
    collection: String,
    id: String,
}

/// Connection details and open subscriptions, shared with the change feed
struct Backend {
    url: String,
    key: String,
    client: Client,
    access_token: Arc<RwLock<Option<String>>>,
    hub: Arc<ListenerHub>,
}

impl Backend {
    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.url, collection)
    }

    fn commit_url(&self) -> String {
        format!("{}/rest/v1/rpc/commit_documents", self.url)
    }

    fn authorized<'a>(&self, fetch: FetchBuilder<'a>) -> FetchBuilder<'a> {
        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.key.clone());
        fetch.header("apikey", &self.key).bearer_auth(&token)
    }

    async fn fetch_rows(&self, query: &Query) -> Result<Vec<Record>, Error> {
        let fetch = Fetch::get(&self.client, &self.table_url(&query.collection))
            .query([("select", "*")])
            .query(query.to_params());
        let rows: Vec<Value> = self.authorized(fetch).execute().await?;

        let records = rows
            .into_iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(query.apply(records))
    }

    async fn refresh_listeners(&self, touched: &HashSet<String>) {
        for (id, query) in self.hub.watching(touched) {
            match self.fetch_rows(&query).await {
                Ok(records) => self.hub.deliver(id, Snapshot { records }),
                Err(e) => warn!(
                    "Failed to refresh subscription {} on '{}': {}",
                    id, query.collection, e
                ),
            }
        }
    }
}

/// Client for the REST document backend
///
/// Subscriptions are refreshed after every commit made through this handle.
/// Call [`RestStore::listen`] to also follow changes made by other clients.
pub struct RestStore {
    backend: Arc<Backend>,
    realtime_url: String,
    realtime_options: RealtimeOptions,
    feed: Mutex<Option<ChangeFeed>>,
    max_attempts: u32,
}

impl RestStore {
    /// Create a new RestStore
    pub fn new(url: &str, key: &str, client: Client) -> Self {
        let url = url.trim_end_matches('/').to_string();
        Self {
            realtime_url: url.clone(),
            backend: Arc::new(Backend {
                url,
                key: key.to_string(),
                client,
                access_token: Arc::new(RwLock::new(None)),
                hub: ListenerHub::new(),
            }),
            realtime_options: RealtimeOptions::default(),
            feed: Mutex::new(None),
            max_attempts: DEFAULT_TRANSACTION_ATTEMPTS,
        }
    }

    /// Set how many times a conflicting transaction is re-planned
    pub fn with_transaction_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Follow changes through a realtime endpoint other than the store URL
    pub fn with_realtime_url(mut self, url: &str) -> Self {
        self.realtime_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Heartbeat and reconnect timing of the change feed
    pub fn with_realtime_options(mut self, options: RealtimeOptions) -> Self {
        self.realtime_options = options;
        self
    }

    /// Send the signed-in user's token instead of the API key as bearer
    pub fn set_auth(&self, token: Option<String>) {
        debug!("Setting store auth token (is_some: {})", token.is_some());
        *self
            .backend
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Number of open subscriptions
    pub fn listener_count(&self) -> usize {
        self.backend.hub.len()
    }

    /// Open the realtime change feed.
    ///
    /// Every change event re-queries the subscriptions on that collection, so
    /// writes by other clients reach them too. A second call replaces the
    /// running feed. The feed stops when the store is dropped.
    pub async fn listen(&self) -> Result<(), Error> {
        let tables = collections::ALL.iter().map(|t| t.to_string()).collect();
        let (feed, mut changes) = ChangeFeed::start(
            &self.realtime_url,
            &self.backend.key,
            self.backend.access_token.clone(),
            tables,
            self.realtime_options.clone(),
        )
        .await?;

        let backend = Arc::downgrade(&self.backend);
        tokio::spawn(async move {
            while let Some(table) = changes.recv().await {
                let mut touched = HashSet::from([table]);
                while let Ok(more) = changes.try_recv() {
                    touched.insert(more);
                }
                let Some(backend) = backend.upgrade() else {
                    break;
                };
                backend.refresh_listeners(&touched).await;
            }
            debug!("Realtime dispatch stopped");
        });

        *self.feed.lock().unwrap_or_else(PoisonError::into_inner) = Some(feed);
        Ok(())
    }

    async fn commit(
        &self,
        preconditions: Vec<Precondition<'_>>,
        mutations: &[Mutation],
    ) -> Result<DateTime<Utc>, Error> {
        let body = CommitRequest {
            preconditions,
            mutations,
        };
        let fetch = Fetch::post(&self.backend.client, &self.backend.commit_url()).json(&body)?;
        let response = self.backend.authorized(fetch).execute_raw().await?;

        match response.status() {
            StatusCode::CONFLICT => {
                let message = response.text().await.unwrap_or_default();
                return Err(Error::conflict(format!("precondition failed: {}", message)));
            }
            StatusCode::NOT_FOUND => {
                let text = response.text().await.unwrap_or_default();
                let missing = serde_json::from_str::<MissingTarget>(&text).ok();
                return Err(match missing {
                    Some(m) => Error::record_not_found(&m.collection, &m.id),
                    None => match mutations.iter().find(|m| matches!(m, Mutation::Update { .. })) {
                        Some(m) => Error::record_not_found(&m.target().collection, &m.target().id),
                        None => Error::Api {
                            status: StatusCode::NOT_FOUND.as_u16(),
                            message: text,
                        },
                    },
                });
            }
            _ => {}
        }

        let response = ensure_success(response).await?;
        let text = response.text().await?;
        let parsed = if text.trim().is_empty() {
            CommitResponse::default()
        } else {
            serde_json::from_str::<CommitResponse>(&text)?
        };

        let touched: HashSet<String> = mutations
            .iter()
            .map(|m| m.target().collection.clone())
            .collect();
        self.backend.refresh_listeners(&touched).await;

        Ok(parsed.commit_time.unwrap_or_else(Utc::now))
    }

    async fn write(&self, mutation: Mutation) -> Result<(), Error> {
        self.commit(Vec::new(), std::slice::from_ref(&mutation))
            .await
            .map(|_| ())
    }
}

fn row_to_record(row: Value) -> Result<Record, Error> {
    let Value::Object(mut data) = row else {
        return Err(Error::invalid("store row is not an object"));
    };
    let version = data
        .remove(VERSION_COLUMN)
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let id = data
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid("store row has no string id"))?;
    Ok(Record { id, version, data })
}

#[async_trait]
impl LedgerStore for RestStore {
    async fn get_record(&self, target: &DocRef) -> Result<Option<Record>, Error> {
        let query = Query::new(&target.collection).eq("id", target.id.as_str());
        Ok(self.backend.fetch_rows(&query).await?.into_iter().next())
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
        Ok(Snapshot {
            records: self.backend.fetch_rows(query).await?,
        })
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, Error> {
        let initial = Snapshot {
            records: self.backend.fetch_rows(&query).await?,
        };
        Ok(self.backend.hub.register(query, initial))
    }

    async fn run_transaction(
        &self,
        reads: &[DocRef],
        apply: &TxnPlan<'_>,
    ) -> Result<TxnCommit, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut entries = Vec::with_capacity(reads.len());
            for target in reads {
                entries.push((target.clone(), self.get_record(target).await?));
            }
            let snapshot = TxnReads::new(entries);

            let mutations = apply(&snapshot)?;
            let preconditions = snapshot
                .versions()
                .map(|(target, version)| Precondition {
                    collection: &target.collection,
                    id: &target.id,
                    version,
                })
                .collect();

            let outcome = self.commit(preconditions, &mutations).await;
            match outcome {
                Ok(commit_time) => {
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
                Err(Error::Conflict(message)) if attempt < self.max_attempts => {
                    warn!(
                        "Transaction attempt {}/{} conflicted ({}), retrying",
                        attempt, self.max_attempts, message
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
