//! Conversation projection
//!
//! Merges both feed directions into display-ready conversations: own
//! outgoing feeds through a nested [`on_outgoing`], counterparty feeds as
//! `userToIncoming` entries land, profile fields per contact. A contact
//! only graduates into the chat list once their incoming feed is being
//! watched, which is what distinguishes an established contact from a feed
//! we merely created toward someone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::ApiResult;
use crate::keys;
use crate::schema::{is_chat, Chat, ChatMessage};
use crate::session::Session;
use crate::utils;

use super::outgoing::{on_incoming_messages, on_outgoing};
use super::profile::spawn_profile_listeners;
use super::{Emitter, ProjectionHandle, SubscriptionKind, SubscriptionRegistry};

#[derive(Clone)]
struct ChatCtx {
    session: Session,
    chats: Arc<Mutex<HashMap<String, Chat>>>,
    registry: Arc<SubscriptionRegistry>,
    emitter: Emitter<Vec<Chat>>,
}

/// Established conversations, one per contact, messages ascending by
/// timestamp and conversations ascending by last activity. Contacts with no
/// messages at all (not even the feed-creation sentinel) are excluded.
pub fn on_chats(session: &Session) -> ApiResult<ProjectionHandle<Vec<Chat>>> {
    let identity = session.identity()?;
    let my_secret = session.crypto().self_secret(&identity)?;
    let user_root = session.user_root()?;

    let (handle, emitter) = ProjectionHandle::new();
    let ctx = ChatCtx {
        session: session.clone(),
        chats: Arc::default(),
        registry: handle.registry(),
        emitter,
    };

    // Outgoing half: what we sent, via the nested feed projection. The
    // nested handle lives inside the task and tears down with it.
    {
        let ctx = ctx.clone();
        let nested = on_outgoing(session)?;
        let mut stream = nested.subscribe();
        handle.own(tokio::spawn(async move {
            let _nested = nested;
            ctx.emitter.emit(Vec::new());
            while let Some(feeds) = stream.next().await {
                {
                    let mut chats = ctx.chats.lock();
                    for feed in feeds.values() {
                        if feed.with.is_empty() {
                            continue;
                        }
                        let chat = chats
                            .entry(feed.with.clone())
                            .or_insert_with(|| Chat::new(&feed.with));
                        for (msg_id, message) in &feed.messages {
                            if chat.messages.iter().all(|m| m.id != *msg_id) {
                                chat.messages.push(ChatMessage {
                                    id: msg_id.clone(),
                                    body: message.body.clone(),
                                    outgoing: true,
                                    timestamp: message.timestamp,
                                });
                            }
                        }
                    }
                }
                emit_chats(&ctx);
            }
        }));
    }

    // Incoming half: one nested message projection per established contact
    {
        let ctx = ctx.clone();
        let mut established = user_root.get(keys::USER_TO_INCOMING).map();
        handle.own(tokio::spawn(async move {
            loop {
                let members = established.next().await;
                for (pub_key, value) in &members {
                    let Some(ciphertext) = value.as_text() else {
                        if !value.is_null() {
                            warn!(
                                user = %utils::short_pub(pub_key),
                                "userToIncoming entry is not text, skipping"
                            );
                        }
                        continue;
                    };
                    let feed_id = match ctx.session.crypto().decrypt(ciphertext, &my_secret) {
                        Ok(id) => id,
                        Err(e) => {
                            warn!(
                                user = %utils::short_pub(pub_key),
                                error = %e,
                                "userToIncoming entry does not decrypt, skipping"
                            );
                            continue;
                        }
                    };

                    ctx.chats
                        .lock()
                        .entry(pub_key.clone())
                        .or_insert_with(|| Chat::new(pub_key));

                    spawn_incoming(&ctx, pub_key, feed_id);
                    spawn_profile_listeners(&ctx.registry, &ctx.session, pub_key, {
                        let ctx = ctx.clone();
                        let contact = pub_key.clone();
                        move |kind, text| {
                            {
                                let mut chats = ctx.chats.lock();
                                if let Some(chat) = chats.get_mut(&contact) {
                                    match kind {
                                        SubscriptionKind::Avatar => {
                                            chat.recipient_avatar = text.to_string()
                                        }
                                        _ => chat.recipient_display_name = text.to_string(),
                                    }
                                }
                            }
                            emit_chats(&ctx);
                        }
                    });
                }
                emit_chats(&ctx);
            }
        }));
    }

    Ok(handle)
}

/// Attach the incoming-feed reader for one contact, at most once. The
/// nested projection is owned by the registry task, so tearing the task
/// down tears the projection down with it.
fn spawn_incoming(ctx: &ChatCtx, contact_pub: &str, feed_id: String) {
    let task_ctx = ctx.clone();
    let contact = contact_pub.to_string();
    ctx.registry
        .spawn_once(contact_pub, SubscriptionKind::IncomingFeed, async move {
            let nested = match on_incoming_messages(&task_ctx.session, &contact, &feed_id) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        user = %utils::short_pub(&contact),
                        error = %e,
                        "incoming feed projection failed to start"
                    );
                    return;
                }
            };
            let mut stream = nested.subscribe();
            while let Some(messages) = stream.next().await {
                {
                    let mut chats = task_ctx.chats.lock();
                    let Some(chat) = chats.get_mut(&contact) else {
                        continue;
                    };
                    for (msg_id, message) in &messages {
                        if chat.messages.iter().all(|m| m.id != *msg_id) {
                            chat.messages.push(ChatMessage {
                                id: msg_id.clone(),
                                body: message.body.clone(),
                                outgoing: false,
                                timestamp: message.timestamp,
                            });
                        }
                    }
                }
                emit_chats(&task_ctx);
            }
        });
}

/// Render and broadcast the list: established contacts with at least one
/// message, shaped and ordered for display.
fn emit_chats(ctx: &ChatCtx) {
    let mut rendered: Vec<Chat> = {
        let chats = ctx.chats.lock();
        chats
            .values()
            .filter(|chat| {
                ctx.registry
                    .attached(&chat.recipient_public_key, SubscriptionKind::IncomingFeed)
                    && is_chat(chat)
                    && !chat.messages.is_empty()
            })
            .cloned()
            .collect()
    };
    for chat in &mut rendered {
        chat.messages.sort_by_key(|m| m.timestamp);
    }
    rendered.sort_by_key(Chat::last_activity);
    ctx.emitter.emit(rendered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions;
    use crate::events::wait_until;
    use crate::store::SyncedStore;

    async fn create_test_session(store: &SyncedStore, alias: &str) -> Session {
        let session = Session::new(store.clone());
        actions::register(&session, alias, "hunter22").await.unwrap();
        session
    }

    /// Alice requests, Bob accepts. Returns the request id.
    async fn establish(alice: &Session, bob: &Session) -> String {
        let bob_pub = bob.identity().unwrap().pub_key();
        let bob_addr = actions::generate_new_handshake_node(bob).await.unwrap();
        let req_id = actions::send_handshake_request(alice, &bob_addr, &bob_pub)
            .await
            .unwrap();
        actions::accept_request(bob, &req_id).await.unwrap();
        req_id
    }

    #[tokio::test]
    async fn test_accepted_contact_becomes_a_chat() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let alice_pub = alice.identity().unwrap().pub_key();

        establish(&alice, &bob).await;

        // Bob's view: his acceptance established both sides locally
        let handle = on_chats(&bob).unwrap();
        let mut stream = handle.subscribe();

        let chats = wait_until(&mut stream, |chats| {
            chats.iter().any(|c| c.recipient_public_key == alice_pub)
        })
        .await;
        assert_eq!(chats.len(), 1);
        // The sentinel makes a fresh contact visible before any real text
        assert!(!chats[0].messages.is_empty());
    }

    #[tokio::test]
    async fn test_messages_from_both_sides_merge_sorted() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let alice_pub = alice.identity().unwrap().pub_key();

        establish(&alice, &bob).await;
        actions::send_message(&bob, &alice_pub, "hey alice").await.unwrap();
        actions::send_message(&alice, &bob.identity().unwrap().pub_key(), "hey bob")
            .await
            .unwrap();

        let handle = on_chats(&bob).unwrap();
        let mut stream = handle.subscribe();
        let chats = wait_until(&mut stream, |chats| {
            chats.first().is_some_and(|c| {
                c.messages.iter().any(|m| m.body == "hey alice" && m.outgoing)
                    && c.messages.iter().any(|m| m.body == "hey bob" && !m.outgoing)
            })
        })
        .await;

        let timestamps: Vec<i64> = chats[0].messages.iter().map(|m| m.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        assert_eq!(timestamps, sorted);
    }

    #[tokio::test]
    async fn test_contact_profile_fields_flow_into_chat() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let alice_pub = alice.identity().unwrap().pub_key();

        establish(&alice, &bob).await;
        actions::set_display_name(&alice, "Alice").await.unwrap();
        actions::set_avatar(&alice, Some("img-data")).await.unwrap();

        let handle = on_chats(&bob).unwrap();
        let mut stream = handle.subscribe();
        wait_until(&mut stream, |chats| {
            chats.iter().any(|c| {
                c.recipient_public_key == alice_pub
                    && c.recipient_display_name == "Alice"
                    && c.recipient_avatar == "img-data"
            })
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_feed_alone_is_not_a_chat() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();

        // Alice wrote toward Bob but nothing was ever accepted
        actions::create_outgoing_feed(&alice, &bob_pub).await.unwrap();
        actions::send_message(&alice, &bob_pub, "into the void").await.unwrap();

        let handle = on_chats(&alice).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(Vec::new()));

        // Give every watcher a chance to fire; the list must stay empty
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(handle.latest(), Some(Vec::new()));
    }
}
