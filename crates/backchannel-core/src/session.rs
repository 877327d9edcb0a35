//! Authenticated session context
//!
//! A [`Session`] bundles the three things every protocol call needs: the
//! store handle, the caller's [`Identity`] and the [`CryptoProvider`]. It is
//! created unauthenticated, gains an identity through
//! `actions::register`/`authenticate`, and loses it on `actions::logout`.
//!
//! Clones share auth state. Long-lived projection tasks capture an
//! `Arc<Identity>` snapshot at spawn time; tearing them down after logout is
//! the owning session layer's responsibility, matching the store contract
//! that subscriptions live until their handles are dropped.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::{CryptoProvider, EcdhCrypto};
use crate::error::{ApiError, ApiResult};
use crate::identity::Identity;
use crate::store::{NodeRef, SyncedStore};

/// Shared session context for actions, events and jobs.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: SyncedStore,
    crypto: Arc<dyn CryptoProvider>,
    identity: RwLock<Option<Arc<Identity>>>,
}

impl Session {
    /// Unauthenticated session over a store, with the production crypto
    /// provider.
    pub fn new(store: SyncedStore) -> Self {
        Self::with_crypto(store, Arc::new(EcdhCrypto::new()))
    }

    /// Unauthenticated session with a caller-supplied crypto provider.
    pub fn with_crypto(store: SyncedStore, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                crypto,
                identity: RwLock::new(None),
            }),
        }
    }

    pub fn store(&self) -> &SyncedStore {
        &self.inner.store
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.inner.crypto.as_ref()
    }

    pub fn is_auth(&self) -> bool {
        self.inner.identity.read().is_some()
    }

    /// The session identity, or `NotAuth` when nobody is signed in.
    pub fn identity(&self) -> ApiResult<Arc<Identity>> {
        self.inner
            .identity
            .read()
            .clone()
            .ok_or(ApiError::NotAuth)
    }

    /// Own identity root in the graph.
    pub fn user_root(&self) -> ApiResult<NodeRef> {
        let identity = self.identity()?;
        Ok(self.inner.store.user(&identity.pub_key()))
    }

    pub(crate) fn set_identity(&self, identity: Identity) -> ApiResult<()> {
        let mut slot = self.inner.identity.write();
        if slot.is_some() {
            return Err(ApiError::AlreadyAuth);
        }
        *slot = Some(Arc::new(identity));
        Ok(())
    }

    pub(crate) fn clear_identity(&self) {
        *self.inner.identity.write() = None;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pub_key = self
            .inner
            .identity
            .read()
            .as_ref()
            .map(|id| id.pub_key());
        f.debug_struct("Session")
            .field("auth", &pub_key.is_some())
            .field("pub", &pub_key.unwrap_or_default())
            .finish_non_exhaustive()
    }
}
