//! At-most-once child listeners
//!
//! Projections attach per-subject listeners as facts arrive: an avatar
//! watch the first time a pub key shows up, a feed watch the first time a
//! feed id decrypts. Store watches re-fire with full snapshots, so the same
//! subject comes around again and again; attaching twice would double-emit
//! and double-write. Every child task is therefore keyed by
//! `(subject, kind)` and spawned at most once per projection.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// What a child listener watches about its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SubscriptionKind {
    /// A user's profile avatar
    Avatar,
    /// A user's profile display name
    DisplayName,
    /// The feed a counterparty keeps toward us
    IncomingFeed,
    /// Messages inside one of our own outgoing feeds
    FeedMessages,
    /// A recipient's rendezvous node rotation
    RecipientRotation,
    /// One live request under a rendezvous node
    LiveRequest,
}

/// Deduplicating spawner for child listener tasks.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<(String, SubscriptionKind), JoinHandle<()>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `listener` for `(subject, kind)` unless one is already
    /// attached. Returns whether a task was spawned.
    pub fn spawn_once<F>(&self, subject: &str, kind: SubscriptionKind, listener: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        let key = (subject.to_string(), kind);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, tokio::spawn(listener));
        true
    }

    /// Whether a listener is attached for `(subject, kind)`.
    pub fn attached(&self, subject: &str, kind: SubscriptionKind) -> bool {
        self.entries
            .lock()
            .contains_key(&(subject.to_string(), kind))
    }

    /// Abort every child task. The registry stays usable afterwards.
    pub fn teardown_all(&self) {
        for (_, task) in self.entries.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
