//! Synced graph store client
//!
//! The protocol core consumes a multi-writer graph store through this
//! module: path-addressed nodes, last-write-wins leaves, unguessable
//! generated ids for collection members, level-triggered subscriptions and
//! an alias/passphrase account primitive.
//!
//! ## Architecture
//!
//! ```text
//! SyncedStore (cheap clone handle)
//!     |
//!     +-- Graph (parking_lot::RwLock)      path tree, LWW leaves
//!     +-- ChangeBus (tokio broadcast)      wakes ValueWatch/ChildrenWatch
//!     |
//!     +-- get("handshakeNodes")            shared top-level nodes
//!     +-- user(pub)                        identity roots ("~<pub>")
//!     +-- create_account / auth            sealed-identity records ("~@<alias>")
//! ```
//!
//! Consistency contract: eventually consistent, last-write-wins per leaf,
//! multiple writers on any path, and no read-after-write ordering across
//! different paths. This in-process engine is stronger than that in
//! practice; the protocol layers above must only rely on the contract.
//! Replication across processes is out of scope; multi-party tests share
//! one handle between sessions.
//!
//! Subscription teardown is ownership-based: dropping a watch detaches it.

mod accounts;
mod graph;
mod value;
mod watch;

pub use value::Value;
pub use watch::{ChildrenWatch, ValueWatch};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::identity::Identity;
use crate::keys;

use graph::{ChangeBus, ChangeEvent, Graph};

/// Byte length of generated member ids before bs58 encoding. Feed addresses
/// are capability-like: guessing one must be infeasible.
const GENERATED_ID_BYTES: usize = 20;

/// Handle to one shared graph. Clones share state; this is what "two
/// sessions on the same synced store" means in-process.
#[derive(Clone)]
pub struct SyncedStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    graph: RwLock<Graph>,
    bus: ChangeBus,
}

impl SyncedStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                graph: RwLock::new(Graph::new()),
                bus: ChangeBus::new(),
            }),
        }
    }

    /// Navigate to a shared top-level node.
    pub fn get(&self, key: &str) -> NodeRef {
        NodeRef {
            store: self.clone(),
            path: vec![key.to_string()],
        }
    }

    /// Navigate to an identity root. Anyone may read any root; writes to
    /// roots other than one's own are a protocol violation the schema layer
    /// defends against, not something the store polices.
    pub fn user(&self, pub_key: &str) -> NodeRef {
        NodeRef {
            store: self.clone(),
            path: vec![format!("~{}", pub_key)],
        }
    }

    /// Create an alias/passphrase account with a freshly generated identity.
    ///
    /// Publishes the identity's `epub` (and alias) on its user root so other
    /// parties can derive pairwise secrets from the public key alone.
    pub async fn create_account(&self, alias: &str, pass: &str) -> ApiResult<Identity> {
        let account_path = vec![format!("~@{}", alias)];
        if self.read_at(&account_path).is_some() {
            return Err(ApiError::Account(format!("alias already registered: {}", alias)));
        }

        let identity = Identity::generate();
        let sealed = accounts::seal_identity(&identity, pass)?;
        self.write_at(account_path, Value::Text(sealed));

        self.user(&identity.pub_key())
            .put(Value::record([
                (keys::EPUB, Value::Text(identity.epub())),
                (keys::ALIAS, Value::Text(alias.to_string())),
            ]))
            .await?;

        debug!(alias = %alias, pub_key = %identity.pub_key(), "account created");
        Ok(identity)
    }

    /// Open an existing account. The same failure is reported for a missing
    /// alias and a wrong passphrase.
    pub async fn auth(&self, alias: &str, pass: &str) -> ApiResult<Identity> {
        let account_path = vec![format!("~@{}", alias)];
        let record = self
            .read_at(&account_path)
            .and_then(|v| v.as_text().map(str::to_string))
            .ok_or_else(|| ApiError::Account(accounts::BAD_CREDENTIALS.to_string()))?;

        let identity = accounts::open_identity(&record, pass)?;
        debug!(alias = %alias, pub_key = %identity.pub_key(), "account opened");
        Ok(identity)
    }

    pub(crate) fn read_at(&self, path: &[String]) -> Option<Value> {
        self.inner.graph.read().read(path)
    }

    pub(crate) fn children_at(&self, path: &[String]) -> BTreeMap<String, Value> {
        self.inner.graph.read().children(path)
    }

    pub(crate) fn write_at(&self, path: Vec<String>, value: Value) {
        self.inner.graph.write().write(&path, value);
        self.inner.bus.publish(path);
    }

    pub(crate) fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.bus.subscribe()
    }
}

impl Default for SyncedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedStore").finish_non_exhaustive()
    }
}

/// Reference to one graph path. Navigation is cheap and lazy; nothing exists
/// in the graph until a write lands.
#[derive(Clone)]
pub struct NodeRef {
    store: SyncedStore,
    path: Vec<String>,
}

impl NodeRef {
    /// Navigate to a child.
    pub fn get(&self, key: &str) -> NodeRef {
        let mut path = self.path.clone();
        path.push(key.to_string());
        NodeRef {
            store: self.store.clone(),
            path,
        }
    }

    /// Last path segment: member id for set-generated nodes, field name
    /// otherwise.
    pub fn key(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Write a value here. Records merge field-by-field; leaves and `Null`
    /// replace. `put(Value::Null)` tombstones the subtree.
    pub async fn put(&self, value: Value) -> ApiResult<()> {
        self.store.write_at(self.path.clone(), value);
        Ok(())
    }

    /// Append a member under this node with a generated unguessable id and
    /// return the id.
    pub async fn set(&self, value: Value) -> ApiResult<String> {
        let id = generate_id();
        let mut path = self.path.clone();
        path.push(id.clone());
        self.store.write_at(path, value);
        Ok(id)
    }

    /// Current deep snapshot, `None` when the path holds nothing.
    pub async fn once(&self) -> Option<Value> {
        self.store.read_at(&self.path)
    }

    /// Subscribe to this path's value.
    pub fn on(&self) -> ValueWatch {
        ValueWatch::new(self.store.clone(), self.path.clone())
    }

    /// Subscribe to this node's member set.
    pub fn map(&self) -> ChildrenWatch {
        ChildrenWatch::new(self.store.clone(), self.path.clone())
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeRef({})", self.path.join("/"))
    }
}

/// Random bs58 id for set members. Doubles as the unguessable address of
/// outgoing feeds and rendezvous nodes.
fn generate_id() -> String {
    let mut bytes = [0u8; GENERATED_ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    bs58::encode(bytes).into_string()
}
