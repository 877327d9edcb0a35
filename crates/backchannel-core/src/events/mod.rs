//! Live projections over the synced graph
//!
//! Everything user-facing on the read path is a *projection*: a set of
//! background tasks that watch graph paths, decrypt what they can, fold the
//! facts into an accumulator and broadcast a fresh snapshot whenever it
//! changes. Callers never see raw store records.
//!
//! ## Projections
//!
//! - [`on_avatar`] / [`on_display_name`] / [`on_blacklist`]: own profile
//!   fields and the ban list
//! - [`on_current_handshake_address`] / [`on_current_handshake_node`]: the
//!   active rendezvous node and the raw requests sitting on it
//! - [`on_sent_requests`]: every sent request, resolved live from the node
//!   it was published to
//! - [`on_outgoing`] / [`on_incoming_messages`]: decrypted message feeds
//! - [`on_simpler_received_requests`] / [`on_simpler_sent_requests`]:
//!   deduplicated, display-ready request lists
//! - [`on_chats`]: both feed directions merged into conversations
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  ProjectionHandle<T>                                           │
//! │  ├── tasks: Vec<JoinHandle>                                    │
//! │  │   └── Watcher tasks folding store changes into snapshots    │
//! │  ├── registry: SubscriptionRegistry                            │
//! │  │   └── Per-subject child listeners, attached at most once    │
//! │  ├── latest: RwLock<Option<T>>                                 │
//! │  │   └── Last snapshot, primes new subscribers                 │
//! │  └── tx: broadcast::Sender<T>                                  │
//! │      └── Fans snapshots out to every ProjectionStream          │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriptions are level-triggered like the store watches underneath
//! them: a new [`ProjectionStream`] yields the current snapshot first (when
//! the projection has produced one), then every subsequent change. Identical
//! consecutive snapshots are delivered once.
//!
//! Independent watcher tasks race each other with no ordering guarantee, so
//! every projection recomputes its full snapshot from the accumulator on any
//! relevant event instead of diffing.

mod chats;
mod outgoing;
mod profile;
mod registry;
mod requests;

pub use chats::on_chats;
pub use outgoing::{on_incoming_messages, on_outgoing};
pub use profile::{
    on_avatar, on_blacklist, on_current_handshake_address, on_display_name,
};
pub use requests::{
    on_current_handshake_node, on_sent_requests, on_simpler_received_requests,
    on_simpler_sent_requests,
};

pub(crate) use registry::{SubscriptionKind, SubscriptionRegistry};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default capacity for each projection's broadcast channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Coalescing window for the sent-requests projection. Bursts of index,
/// profile and rendezvous writes inside one window produce a single
/// recomputation.
pub(crate) const SENT_REQUESTS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Anything that can stop listening.
///
/// Lets an application hold heterogeneous projection handles in one place
/// and tear them all down on logout.
pub trait Teardown: Send + Sync {
    /// Abort every background task behind this handle. Idempotent.
    fn off(&self);
}

/// A running projection.
///
/// Owns the watcher tasks and the registry of per-subject child listeners.
/// Dropping the handle (or calling [`off`]) aborts all of them; streams
/// already handed out then terminate.
///
/// [`off`]: ProjectionHandle::off
pub struct ProjectionHandle<T> {
    latest: Arc<RwLock<Option<T>>>,
    tx: broadcast::Sender<T>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    registry: Arc<SubscriptionRegistry>,
}

impl<T: Clone> ProjectionHandle<T> {
    pub(crate) fn new() -> (Self, Emitter<T>) {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let latest = Arc::new(RwLock::new(None));
        let emitter = Emitter {
            latest: Arc::clone(&latest),
            tx: tx.clone(),
        };
        let handle = Self {
            latest,
            tx,
            tasks: Mutex::new(Vec::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
        };
        (handle, emitter)
    }

    /// Subscribe to snapshots. The stream yields the latest snapshot first
    /// when one exists, then every subsequent emission.
    pub fn subscribe(&self) -> ProjectionStream<T> {
        ProjectionStream {
            latest: Arc::clone(&self.latest),
            rx: self.tx.subscribe(),
            primed: false,
            last: None,
        }
    }

    /// Last emitted snapshot, if the projection has produced one yet.
    pub fn latest(&self) -> Option<T> {
        self.latest.read().clone()
    }
}

impl<T> ProjectionHandle<T> {
    pub(crate) fn own(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stop the projection: abort the watcher tasks and every registered
    /// child listener.
    pub fn off(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.teardown_all();
    }
}

impl<T: Send + Sync> Teardown for ProjectionHandle<T> {
    fn off(&self) {
        ProjectionHandle::off(self);
    }
}

impl<T> Drop for ProjectionHandle<T> {
    fn drop(&mut self) {
        self.off();
    }
}

/// Write side of a projection, cloned into every watcher task.
///
/// Holds no reference back to the handle, so aborting the tasks drops the
/// last senders and closes subscribed streams.
pub(crate) struct Emitter<T> {
    latest: Arc<RwLock<Option<T>>>,
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            latest: Arc::clone(&self.latest),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Emitter<T> {
    /// Record and broadcast a new snapshot. A send with no live subscribers
    /// is not an error; `latest` still advances.
    pub fn emit(&self, snapshot: T) {
        *self.latest.write() = Some(snapshot.clone());
        let _ = self.tx.send(snapshot);
    }
}

/// Level-triggered subscription to one projection.
pub struct ProjectionStream<T> {
    latest: Arc<RwLock<Option<T>>>,
    rx: broadcast::Receiver<T>,
    primed: bool,
    last: Option<T>,
}

impl<T: Clone + PartialEq> ProjectionStream<T> {
    /// Next distinct snapshot.
    ///
    /// The first call yields the projection's current snapshot when one
    /// exists. A lagged receiver jumps to the latest snapshot instead of
    /// erroring. Returns `None` once the handle and its tasks are gone.
    pub async fn next(&mut self) -> Option<T> {
        if !self.primed {
            self.primed = true;
            if let Some(current) = self.latest.read().clone() {
                self.last = Some(current.clone());
                return Some(current);
            }
        }

        loop {
            let snapshot = match self.rx.recv().await {
                Ok(snapshot) => snapshot,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "projection stream lagged, jumping to latest");
                    match self.latest.read().clone() {
                        Some(current) => current,
                        None => continue,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };

            if self.last.as_ref() == Some(&snapshot) {
                continue;
            }
            self.last = Some(snapshot.clone());
            return Some(snapshot);
        }
    }
}

/// Drain a stream until a snapshot satisfies `pred`. Panics when the
/// projection ends or five seconds pass first.
#[cfg(test)]
pub(crate) async fn wait_until<T, F>(stream: &mut ProjectionStream<T>, pred: F) -> T
where
    T: Clone + PartialEq,
    F: Fn(&T) -> bool,
{
    let drained = async {
        loop {
            match stream.next().await {
                Some(snapshot) if pred(&snapshot) => return snapshot,
                Some(_) => continue,
                None => panic!("projection ended before the condition was met"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), drained)
        .await
        .expect("timed out waiting for a matching snapshot")
}
