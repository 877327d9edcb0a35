//! Level-triggered store subscriptions
//!
//! A watch yields the currently-known state on its first `next()` and then
//! one snapshot per observed state change. Wakeups come from the store's
//! change bus; every wake triggers a fresh read, so duplicate or lagged bus
//! events can never desynchronize a watch from the graph.
//!
//! Dropping a watch detaches it; there is nothing else to tear down.

use std::collections::BTreeMap;

use tokio::sync::broadcast;

use super::graph::{paths_overlap, ChangeEvent};
use super::{SyncedStore, Value};

/// Subscription to the value at one path.
pub struct ValueWatch {
    store: SyncedStore,
    path: Vec<String>,
    rx: broadcast::Receiver<ChangeEvent>,
    primed: bool,
    last: Option<Value>,
}

impl ValueWatch {
    pub(crate) fn new(store: SyncedStore, path: Vec<String>) -> Self {
        let rx = store.subscribe_changes();
        Self {
            store,
            path,
            rx,
            primed: false,
            last: None,
        }
    }

    /// Next snapshot of the watched value; `None` means the path holds
    /// nothing. The first call resolves immediately with current state.
    /// Identical consecutive states are not re-emitted.
    pub async fn next(&mut self) -> Option<Value> {
        if !self.primed {
            self.primed = true;
            self.last = self.store.read_at(&self.path);
            return self.last.clone();
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if !paths_overlap(&event.path, &self.path) {
                        continue;
                    }
                }
                // Missed wakeups; re-read unconditionally
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                // Store gone; nothing will ever change again
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }

            let snapshot = self.store.read_at(&self.path);
            if snapshot != self.last {
                self.last = snapshot.clone();
                return snapshot;
            }
        }
    }
}

/// Subscription to the member set of one collection node.
///
/// Snapshots are the full member map. Projections rebuild from the whole
/// snapshot anyway, so per-member deltas would only complicate ordering.
pub struct ChildrenWatch {
    store: SyncedStore,
    path: Vec<String>,
    rx: broadcast::Receiver<ChangeEvent>,
    primed: bool,
    last: BTreeMap<String, Value>,
}

impl ChildrenWatch {
    pub(crate) fn new(store: SyncedStore, path: Vec<String>) -> Self {
        let rx = store.subscribe_changes();
        Self {
            store,
            path,
            rx,
            primed: false,
            last: BTreeMap::new(),
        }
    }

    /// Next member snapshot. Absent or leaf-shaped paths yield an empty map.
    pub async fn next(&mut self) -> BTreeMap<String, Value> {
        if !self.primed {
            self.primed = true;
            self.last = self.store.children_at(&self.path);
            return self.last.clone();
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if !paths_overlap(&event.path, &self.path) {
                        continue;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }

            let snapshot = self.store.children_at(&self.path);
            if snapshot != self.last {
                self.last = snapshot.clone();
                return snapshot;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_value_watch_fires_with_current_then_changes() {
        let store = SyncedStore::new();
        let node = store.get("settings").get("theme");
        node.put(Value::from("dark")).await.unwrap();

        let mut watch = node.on();
        assert_eq!(watch.next().await, Some(Value::from("dark")));

        node.put(Value::from("light")).await.unwrap();
        assert_eq!(watch.next().await, Some(Value::from("light")));
    }

    #[tokio::test]
    async fn test_value_watch_absent_path() {
        let store = SyncedStore::new();
        let node = store.get("nothing").get("here");

        let mut watch = node.on();
        assert_eq!(watch.next().await, None);

        node.put(Value::from("now")).await.unwrap();
        assert_eq!(watch.next().await, Some(Value::from("now")));
    }

    #[tokio::test]
    async fn test_value_watch_sees_field_writes_below() {
        let store = SyncedStore::new();
        let node = store.get("rec");
        let mut watch = node.on();
        watch.next().await;

        node.get("field").put(Value::from("v")).await.unwrap();
        let snapshot = watch.next().await.unwrap();
        assert_eq!(snapshot.field("field").and_then(Value::as_text), Some("v"));
    }

    #[tokio::test]
    async fn test_children_watch_grows_with_set() {
        let store = SyncedStore::new();
        let coll = store.get("items");
        let mut watch = coll.map();
        assert!(watch.next().await.is_empty());

        let id = coll
            .set(Value::record([("body", Value::from("first"))]))
            .await
            .unwrap();
        let snapshot = watch.next().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&id));
    }

    #[tokio::test]
    async fn test_unrelated_writes_do_not_wake() {
        let store = SyncedStore::new();
        let a = store.get("a");
        let mut watch = a.on();
        watch.next().await;

        store.get("b").put(Value::from("noise")).await.unwrap();
        a.put(Value::from("signal")).await.unwrap();

        // The watch coalesces to current state, never the unrelated write
        assert_eq!(watch.next().await, Some(Value::from("signal")));
    }
}
