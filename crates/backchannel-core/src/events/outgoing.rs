//! Feed projections
//!
//! [`on_outgoing`] fans out: a children watch over `outgoings` discovers
//! feeds and decrypts who each one is for, then a per-feed child task
//! decrypts messages as they land. [`on_incoming_messages`] is the mirror
//! for one counterparty feed. Decryption failures skip the record, never
//! the feed: one corrupt entry must not blind the projection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::crypto::PairSecret;
use crate::error::ApiResult;
use crate::identity::Identity;
use crate::keys;
use crate::schema::{Message, Outgoing, PartialOutgoing};
use crate::session::Session;
use crate::store::Value;
use crate::utils;

use super::{Emitter, ProjectionHandle, SubscriptionKind, SubscriptionRegistry};

/// Every outgoing feed the session owns, decrypted. Keyed by feed id; the
/// full map is re-emitted on each discovered feed and decrypted message.
pub fn on_outgoing(session: &Session) -> ApiResult<ProjectionHandle<HashMap<String, Outgoing>>> {
    let identity = session.identity()?;
    let my_secret = session.crypto().self_secret(&identity)?;
    let user_root = session.user_root()?;

    let (handle, emitter) = ProjectionHandle::new();
    let registry = handle.registry();
    let feeds: Arc<Mutex<HashMap<String, Outgoing>>> = Arc::default();

    let session = session.clone();
    let mut discovered = user_root.get(keys::OUTGOINGS).map();
    handle.own(tokio::spawn(async move {
        loop {
            let members = discovered.next().await;
            for (feed_id, value) in &members {
                let Some(partial) = PartialOutgoing::from_value(value) else {
                    if !value.is_null() {
                        warn!(feed = %feed_id, "outgoing feed without a with field, skipping");
                    }
                    continue;
                };
                let recipient_pub = match session.crypto().decrypt(&partial.with, &my_secret) {
                    Ok(pub_key) => pub_key,
                    Err(e) => {
                        warn!(
                            feed = %feed_id,
                            error = %e,
                            "outgoing feed recipient does not decrypt, skipping"
                        );
                        continue;
                    }
                };

                feeds
                    .lock()
                    .entry(feed_id.clone())
                    .or_default()
                    .with = recipient_pub.clone();

                spawn_feed_messages(
                    &session,
                    &identity,
                    &registry,
                    feed_id,
                    recipient_pub,
                    Arc::clone(&feeds),
                    emitter.clone(),
                );
            }
            let snapshot = feeds.lock().clone();
            emitter.emit(snapshot);
        }
    }));

    Ok(handle)
}

/// Attach the message decryptor for one feed, at most once per feed id.
fn spawn_feed_messages(
    session: &Session,
    identity: &Arc<Identity>,
    registry: &SubscriptionRegistry,
    feed_id: &str,
    recipient_pub: String,
    feeds: Arc<Mutex<HashMap<String, Outgoing>>>,
    emitter: Emitter<HashMap<String, Outgoing>>,
) {
    let session = session.clone();
    let identity = Arc::clone(identity);
    let feed = feed_id.to_string();
    registry.spawn_once(feed_id, SubscriptionKind::FeedMessages, async move {
        let Some(secret) = resolve_pair_secret(&session, &identity, &recipient_pub).await else {
            return;
        };
        let Ok(user_root) = session.user_root() else {
            return;
        };

        let mut messages = user_root
            .get(keys::OUTGOINGS)
            .get(&feed)
            .get(keys::MESSAGES)
            .map();

        loop {
            let members = messages.next().await;
            {
                let mut feeds = feeds.lock();
                let Some(entry) = feeds.get_mut(&feed) else {
                    continue;
                };
                for (msg_id, value) in &members {
                    if entry.messages.contains_key(msg_id) {
                        continue;
                    }
                    if let Some(message) = open_message(&session, &secret, msg_id, value) {
                        entry.messages.insert(msg_id.clone(), message);
                    }
                }
            }
            let snapshot = feeds.lock().clone();
            emitter.emit(snapshot);
        }
    });
}

/// Messages inside one counterparty feed, decrypted with the pairwise
/// secret. `incoming_feed_id` is what the caller's `userToIncoming` entry
/// decrypts to.
pub fn on_incoming_messages(
    session: &Session,
    counterparty_pub: &str,
    incoming_feed_id: &str,
) -> ApiResult<ProjectionHandle<HashMap<String, Message>>> {
    let identity = session.identity()?;
    let (handle, emitter) = ProjectionHandle::new();

    let session = session.clone();
    let counterparty = counterparty_pub.to_string();
    let feed_id = incoming_feed_id.to_string();
    handle.own(tokio::spawn(async move {
        let Some(secret) = resolve_pair_secret(&session, &identity, &counterparty).await else {
            return;
        };

        let mut watch = session
            .store()
            .user(&counterparty)
            .get(keys::OUTGOINGS)
            .get(&feed_id)
            .get(keys::MESSAGES)
            .map();

        let mut decrypted: HashMap<String, Message> = HashMap::new();
        loop {
            let members = watch.next().await;
            for (msg_id, value) in &members {
                if decrypted.contains_key(msg_id) {
                    continue;
                }
                if let Some(message) = open_message(&session, &secret, msg_id, value) {
                    decrypted.insert(msg_id.clone(), message);
                }
            }
            emitter.emit(decrypted.clone());
        }
    }));

    Ok(handle)
}

/// Derive the pairwise secret with `user_pub`, logging instead of failing:
/// a party without a published epub simply stays unreadable.
pub(super) async fn resolve_pair_secret(
    session: &Session,
    identity: &Identity,
    user_pub: &str,
) -> Option<PairSecret> {
    let epub = match utils::pub_to_epub(session.store(), user_pub).await {
        Ok(epub) => epub,
        Err(e) => {
            warn!(
                user = %utils::short_pub(user_pub),
                error = %e,
                "no epub published, cannot derive a pairwise secret"
            );
            return None;
        }
    };
    match session.crypto().secret(&epub, identity) {
        Ok(secret) => Some(secret),
        Err(e) => {
            warn!(
                user = %utils::short_pub(user_pub),
                error = %e,
                "pairwise secret derivation failed"
            );
            None
        }
    }
}

/// Parse and decrypt one feed member. The feed-creation sentinel passes
/// through unencrypted; anything unreadable is skipped.
fn open_message(
    session: &Session,
    secret: &PairSecret,
    msg_id: &str,
    value: &Value,
) -> Option<Message> {
    let message = match Message::from_value(value) {
        Some(message) => message,
        None => {
            if !value.is_null() {
                warn!(message = %msg_id, "malformed message record, skipping");
            }
            return None;
        }
    };

    let body = if message.is_initial() {
        message.body
    } else {
        match session.crypto().decrypt(&message.body, secret) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(message = %msg_id, error = %e, "message does not decrypt, skipping");
                return None;
            }
        }
    };

    Some(Message {
        body,
        timestamp: message.timestamp,
    })
}
