//! Live query subscriptions and the listener registry behind them

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Query, Snapshot};

struct Listener {
    query: Query,
    sender: mpsc::UnboundedSender<Snapshot>,
    last: Snapshot,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

/// Registry of open subscriptions of one store handle
pub(crate) struct ListenerHub {
    inner: Mutex<HubInner>,
}

impl ListenerHub {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener whose first snapshot is `initial`
    pub(crate) fn register(self: &Arc<Self>, query: Query, initial: Snapshot) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so the initial send cannot fail.
        let _ = sender.send(initial.clone());

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Listener {
                query: query.clone(),
                sender,
                last: initial,
            },
        );
        debug!(
            "Subscription {} opened on '{}' ({} open)",
            id,
            query.collection,
            inner.listeners.len()
        );

        Subscription {
            id,
            query,
            receiver,
            hub: Arc::downgrade(self),
        }
    }

    /// Listeners whose query reads one of the collections
    pub(crate) fn watching(&self, collections: &HashSet<String>) -> Vec<(u64, Query)> {
        self.lock()
            .listeners
            .iter()
            .filter(|(_, l)| collections.contains(&l.query.collection))
            .map(|(id, l)| (*id, l.query.clone()))
            .collect()
    }

    /// Push a snapshot if it differs from the last one the listener saw
    pub(crate) fn deliver(&self, id: u64, snapshot: Snapshot) {
        let mut inner = self.lock();
        let closed = match inner.listeners.get_mut(&id) {
            Some(listener) if listener.last != snapshot => {
                listener.last = snapshot.clone();
                listener.sender.send(snapshot).is_err()
            }
            _ => false,
        };
        if closed {
            inner.listeners.remove(&id);
            debug!("Subscription {} receiver gone, listener removed", id);
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        if self.lock().listeners.remove(&id).is_some() {
            debug!("Subscription {} cancelled", id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().listeners.len()
    }
}

/// A live query.
///
/// Yields the current result set first, then a new snapshot whenever it
/// changes. Cancelling or dropping the subscription deregisters it from the
/// store.
pub struct Subscription {
    id: u64,
    query: Query,
    receiver: mpsc::UnboundedReceiver<Snapshot>,
    hub: Weak<ListenerHub>,
}

impl Subscription {
    /// The query this subscription follows
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Wait for the next snapshot. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.receiver.recv().await
    }

    /// Take the next buffered snapshot without waiting
    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.receiver.try_recv().ok()
    }

    /// Drain buffered snapshots and return the most recent one
    pub fn latest(&mut self) -> Option<Snapshot> {
        let mut latest = None;
        while let Ok(snapshot) = self.receiver.try_recv() {
            latest = Some(snapshot);
        }
        latest
    }

    /// Stop listening
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;
    use serde_json::json;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            records: vec![Record {
                id: "u1".to_string(),
                version,
                data: json!({ "points": version }).as_object().cloned().unwrap(),
            }],
        }
    }

    #[test]
    fn delivers_only_changed_snapshots() {
        let hub = ListenerHub::new();
        let mut sub = hub.register(Query::new("users"), snapshot(1));

        hub.deliver(sub.id, snapshot(1));
        hub.deliver(sub.id, snapshot(2));

        assert_eq!(sub.try_recv(), Some(snapshot(1)));
        assert_eq!(sub.try_recv(), Some(snapshot(2)));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dropping_and_cancelling_remove_listeners() {
        let hub = ListenerHub::new();
        let first = hub.register(Query::new("users"), Snapshot::default());
        let second = hub.register(Query::new("donations"), Snapshot::default());
        assert_eq!(hub.len(), 2);

        let watched: HashSet<String> = ["donations".to_string()].into_iter().collect();
        assert_eq!(hub.watching(&watched).len(), 1);

        drop(first);
        assert_eq!(hub.len(), 1);
        second.cancel();
        assert_eq!(hub.len(), 0);
    }
}
