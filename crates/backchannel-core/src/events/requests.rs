//! Handshake-request projections
//!
//! Two raw views and two display views. [`on_current_handshake_node`] and
//! [`on_sent_requests`] expose request records as they sit in the graph.
//! [`on_simpler_received_requests`] and [`on_simpler_sent_requests`] fold
//! requests, profile fields, rotation and acceptance facts into the lists a
//! client can render directly.
//!
//! All four follow node rotation: a rendezvous node is never mutated into
//! retirement, the owner just links a fresh one, so watchers re-anchor
//! whenever `currentHandshakeNode` changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::ApiResult;
use crate::identity::Identity;
use crate::keys;
use crate::schema::{HandshakeRequest, SimpleReceivedRequest, SimpleSentRequest};
use crate::session::Session;
use crate::store::{ChildrenWatch, Value};
use crate::utils;

use super::outgoing::resolve_pair_secret;
use super::profile::spawn_profile_listeners;
use super::{
    Emitter, ProjectionHandle, SubscriptionKind, SubscriptionRegistry, SENT_REQUESTS_DEBOUNCE,
};

/// What woke a rotation-following watcher.
enum NodeWake {
    Link(Option<String>),
    Members(BTreeMap<String, Value>),
}

fn address_of(value: Option<Value>) -> Option<String> {
    value.as_ref().and_then(Value::as_link).map(str::to_string)
}

/// Raw requests on the session's active rendezvous node, keyed by request
/// id. The seeded sentinel member never parses as a request and is absent
/// from snapshots. An identity without a node emits an empty map.
pub fn on_current_handshake_node(
    session: &Session,
) -> ApiResult<ProjectionHandle<HashMap<String, HandshakeRequest>>> {
    let store = session.store().clone();
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();

    handle.own(tokio::spawn(async move {
        let mut link_watch = user_root.get(keys::CURRENT_HANDSHAKE_NODE).on();
        let mut current_addr: Option<String> = None;
        let mut members_watch: Option<ChildrenWatch> = None;
        loop {
            let wake = match members_watch.as_mut() {
                None => NodeWake::Link(address_of(link_watch.next().await)),
                Some(watch) => tokio::select! {
                    link = link_watch.next() => NodeWake::Link(address_of(link)),
                    members = watch.next() => NodeWake::Members(members),
                },
            };
            match wake {
                NodeWake::Link(address) => {
                    if address == current_addr && members_watch.is_some() {
                        continue;
                    }
                    current_addr = address;
                    match &current_addr {
                        Some(addr) => {
                            debug!(node = %addr, "rendezvous node changed, re-anchoring");
                            members_watch =
                                Some(store.get(keys::HANDSHAKE_NODES).get(addr).map());
                        }
                        None => {
                            members_watch = None;
                            emitter.emit(HashMap::new());
                        }
                    }
                }
                NodeWake::Members(members) => {
                    let requests: HashMap<String, HandshakeRequest> = members
                        .iter()
                        .filter_map(|(id, value)| {
                            HandshakeRequest::from_value(value).map(|req| (id.clone(), req))
                        })
                        .collect();
                    emitter.emit(requests);
                }
            }
        }
    }));

    Ok(handle)
}

/// Every request the session ever sent, resolved live from the rendezvous
/// node each one was published to. Keyed by request id, so an acceptance
/// overwrite shows up as a changed entry.
pub fn on_sent_requests(
    session: &Session,
) -> ApiResult<ProjectionHandle<HashMap<String, HandshakeRequest>>> {
    let store = session.store().clone();
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();
    let registry = handle.registry();
    let requests: Arc<Mutex<HashMap<String, HandshakeRequest>>> = Arc::default();

    let mut entries = user_root.get(keys::SENT_REQUESTS).map();
    handle.own(tokio::spawn(async move {
        loop {
            let links = entries.next().await;
            for (req_id, value) in &links {
                let address = match value {
                    Value::Link(address) => address.clone(),
                    Value::Null => continue,
                    _ => {
                        warn!(request_id = %req_id, "sentRequests entry is not a link, skipping");
                        continue;
                    }
                };
                let store = store.clone();
                let requests = Arc::clone(&requests);
                let emitter = emitter.clone();
                let req = req_id.clone();
                registry.spawn_once(req_id, SubscriptionKind::LiveRequest, async move {
                    let mut live = store
                        .get(keys::HANDSHAKE_NODES)
                        .get(&address)
                        .get(&req)
                        .on();
                    loop {
                        let value = live.next().await;
                        match value.as_ref().and_then(HandshakeRequest::from_value) {
                            Some(request) => {
                                requests.lock().insert(req.clone(), request);
                                let snapshot = requests.lock().clone();
                                emitter.emit(snapshot);
                            }
                            None => {
                                debug!(request_id = %req, "sent request not resolvable yet")
                            }
                        }
                    }
                });
            }
            let snapshot = requests.lock().clone();
            emitter.emit(snapshot);
        }
    }));

    Ok(handle)
}

/// Keep the first occurrence per key, preserving order.
fn uniq_by<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(key(item))).collect()
}

#[derive(Default)]
struct ReceivedState {
    by_id: HashMap<String, SimpleReceivedRequest>,
    /// Requestor pubs with an established handshake
    accepted: HashSet<String>,
}

/// Newest request per requestor, oldest first, established requestors
/// dropped.
fn recompute_received(state: &ReceivedState) -> Vec<SimpleReceivedRequest> {
    let mut requests: Vec<_> = state.by_id.values().cloned().collect();
    requests.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let mut requests = uniq_by(requests, |r| r.requestor_pk.clone());
    requests.sort_by_key(|r| r.timestamp);
    requests.retain(|r| !state.accepted.contains(&r.requestor_pk));
    requests
}

#[derive(Clone)]
struct ReceivedCtx {
    session: Session,
    identity: Arc<Identity>,
    state: Arc<Mutex<ReceivedState>>,
    registry: Arc<SubscriptionRegistry>,
    emitter: Emitter<Vec<SimpleReceivedRequest>>,
}

/// Display-ready pending requests received by the session.
///
/// Requests are frozen as first seen: the acceptance overwrite later mutates
/// the record on the rendezvous node, but the projected `response` keeps the
/// original payload. Deduplicated per requestor (newest wins), established
/// requestors excluded, oldest first.
pub fn on_simpler_received_requests(
    session: &Session,
) -> ApiResult<ProjectionHandle<Vec<SimpleReceivedRequest>>> {
    let identity = session.identity()?;
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();

    let ctx = ReceivedCtx {
        session: session.clone(),
        identity,
        state: Arc::default(),
        registry: handle.registry(),
        emitter,
    };

    // Established handshakes knock their requestor out of the list
    {
        let ctx = ctx.clone();
        let mut established = user_root.get(keys::USER_TO_INCOMING).map();
        handle.own(tokio::spawn(async move {
            loop {
                let members = established.next().await;
                {
                    let mut state = ctx.state.lock();
                    for pub_key in members.keys() {
                        state.accepted.insert(pub_key.clone());
                    }
                }
                ctx.emitter.emit(recompute_received(&ctx.state.lock()));
            }
        }));
    }

    // Requests arriving on the active rendezvous node
    {
        let ctx = ctx.clone();
        let store = session.store().clone();
        let mut link_watch = user_root.get(keys::CURRENT_HANDSHAKE_NODE).on();
        handle.own(tokio::spawn(async move {
            let mut current_addr: Option<String> = None;
            let mut members_watch: Option<ChildrenWatch> = None;
            loop {
                let wake = match members_watch.as_mut() {
                    None => NodeWake::Link(address_of(link_watch.next().await)),
                    Some(watch) => tokio::select! {
                        link = link_watch.next() => NodeWake::Link(address_of(link)),
                        members = watch.next() => NodeWake::Members(members),
                    },
                };
                match wake {
                    NodeWake::Link(address) => {
                        if address == current_addr && members_watch.is_some() {
                            continue;
                        }
                        current_addr = address;
                        match &current_addr {
                            Some(addr) => {
                                members_watch =
                                    Some(store.get(keys::HANDSHAKE_NODES).get(addr).map());
                            }
                            None => {
                                members_watch = None;
                                ctx.emitter.emit(recompute_received(&ctx.state.lock()));
                            }
                        }
                    }
                    NodeWake::Members(members) => {
                        for (req_id, value) in &members {
                            ingest_received(&ctx, req_id, value).await;
                        }
                        ctx.emitter.emit(recompute_received(&ctx.state.lock()));
                    }
                }
            }
        }));
    }

    Ok(handle)
}

/// Fold one rendezvous member into the received accumulator. Insert only if
/// absent, so later overwrites of the same request id change nothing.
async fn ingest_received(ctx: &ReceivedCtx, req_id: &str, value: &Value) {
    if req_id == keys::RENDEZVOUS_SENTINEL_FIELD {
        return;
    }
    if ctx.state.lock().by_id.contains_key(req_id) {
        return;
    }
    let Some(request) = HandshakeRequest::from_value(value) else {
        if !value.is_null() {
            warn!(request_id = %req_id, "rendezvous member is not a request, skipping");
        }
        return;
    };

    let Some(secret) = resolve_pair_secret(&ctx.session, &ctx.identity, &request.from).await
    else {
        return;
    };
    let response = match ctx.session.crypto().decrypt(&request.response, &secret) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            warn!(
                request_id = %req_id,
                error = %e,
                "request response does not decrypt, skipping"
            );
            return;
        }
    };

    ctx.state.lock().by_id.insert(
        req_id.to_string(),
        SimpleReceivedRequest {
            id: req_id.to_string(),
            requestor_pk: request.from.clone(),
            requestor_avatar: String::new(),
            requestor_display_name: String::new(),
            response,
            timestamp: request.timestamp,
        },
    );

    // Live display fields for everything this requestor ever sent
    spawn_profile_listeners(&ctx.registry, &ctx.session, &request.from, {
        let ctx = ctx.clone();
        let requestor = request.from.clone();
        move |kind, text| {
            {
                let mut state = ctx.state.lock();
                for entry in state
                    .by_id
                    .values_mut()
                    .filter(|e| e.requestor_pk == requestor)
                {
                    match kind {
                        SubscriptionKind::Avatar => entry.requestor_avatar = text.to_string(),
                        _ => entry.requestor_display_name = text.to_string(),
                    }
                }
            }
            ctx.emitter.emit(recompute_received(&ctx.state.lock()));
        }
    });
}

/// One sent request while its display fields converge. Entries without a
/// timestamp are withheld from snapshots until the live record resolves.
#[derive(Debug, Clone)]
struct SentEntry {
    recipient_pub: String,
    avatar: String,
    display_name: String,
    changed_address: bool,
    timestamp: Option<i64>,
}

#[derive(Default)]
struct SentState {
    by_id: HashMap<String, SentEntry>,
    /// Recipient pubs with an established handshake
    accepted: HashSet<String>,
}

/// Newest request per recipient, oldest first, established recipients and
/// unresolved entries dropped.
fn recompute_sent(state: &SentState) -> Vec<SimpleSentRequest> {
    let mut requests: Vec<SimpleSentRequest> = state
        .by_id
        .iter()
        .filter(|(_, e)| e.timestamp.is_some() && !state.accepted.contains(&e.recipient_pub))
        .map(|(id, e)| SimpleSentRequest {
            id: id.clone(),
            recipient_public_key: e.recipient_pub.clone(),
            recipient_avatar: e.avatar.clone(),
            recipient_display_name: e.display_name.clone(),
            recipient_changed_request_address: e.changed_address,
            timestamp: e.timestamp.unwrap_or_default(),
        })
        .collect();
    requests.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let mut requests = uniq_by(requests, |r| r.recipient_public_key.clone());
    requests.sort_by_key(|r| r.timestamp);
    requests
}

#[derive(Clone)]
struct SentCtx {
    session: Session,
    state: Arc<Mutex<SentState>>,
    registry: Arc<SubscriptionRegistry>,
    dirty: Arc<Notify>,
}

/// Display-ready pending requests sent by the session.
///
/// Facts arrive from five directions (the link index, live request records,
/// recipient profiles, recipient node rotation, the established index), so
/// this projection coalesces: fact tasks mark the state dirty and a single
/// loop recomputes at most once per [`SENT_REQUESTS_DEBOUNCE`] window.
pub fn on_simpler_sent_requests(
    session: &Session,
) -> ApiResult<ProjectionHandle<Vec<SimpleSentRequest>>> {
    session.identity()?;
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();

    let ctx = SentCtx {
        session: session.clone(),
        state: Arc::default(),
        registry: handle.registry(),
        dirty: Arc::new(Notify::new()),
    };

    // The only emitting task: debounced recompute
    {
        let ctx = ctx.clone();
        handle.own(tokio::spawn(async move {
            emitter.emit(Vec::new());
            loop {
                ctx.dirty.notified().await;
                tokio::time::sleep(SENT_REQUESTS_DEBOUNCE).await;
                emitter.emit(recompute_sent(&ctx.state.lock()));
            }
        }));
    }

    // Established handshakes exclude their recipient
    {
        let ctx = ctx.clone();
        let mut established = user_root.get(keys::USER_TO_INCOMING).map();
        handle.own(tokio::spawn(async move {
            loop {
                let members = established.next().await;
                {
                    let mut state = ctx.state.lock();
                    for pub_key in members.keys() {
                        state.accepted.insert(pub_key.clone());
                    }
                }
                ctx.dirty.notify_one();
            }
        }));
    }

    // Discover sent requests from the owned link index
    {
        let ctx = ctx.clone();
        let mut entries = user_root.get(keys::SENT_REQUESTS).map();
        handle.own(tokio::spawn(async move {
            loop {
                let links = entries.next().await;
                for (req_id, value) in &links {
                    match value {
                        Value::Link(address) => ingest_sent(&ctx, req_id, address).await,
                        Value::Null => {}
                        _ => warn!(
                            request_id = %req_id,
                            "sentRequests entry is not a link, skipping"
                        ),
                    }
                }
                ctx.dirty.notify_one();
            }
        }));
    }

    Ok(handle)
}

/// Fold one sent-request link into the accumulator and attach its probes.
async fn ingest_sent(ctx: &SentCtx, req_id: &str, address: &str) {
    if ctx.state.lock().by_id.contains_key(req_id) {
        return;
    }
    let recipient_pub = match utils::req_to_recipient_pub(&ctx.session, req_id).await {
        Ok(pub_key) => pub_key,
        Err(e) => {
            warn!(
                request_id = %req_id,
                error = %e,
                "sent request with no resolvable recipient, skipping"
            );
            return;
        }
    };

    ctx.state.lock().by_id.insert(
        req_id.to_string(),
        SentEntry {
            recipient_pub: recipient_pub.clone(),
            avatar: String::new(),
            display_name: String::new(),
            changed_address: false,
            timestamp: None,
        },
    );
    ctx.dirty.notify_one();

    // Live display fields for everything sent to this recipient
    spawn_profile_listeners(&ctx.registry, &ctx.session, &recipient_pub, {
        let ctx = ctx.clone();
        let recipient = recipient_pub.clone();
        move |kind, text| {
            {
                let mut state = ctx.state.lock();
                for entry in state
                    .by_id
                    .values_mut()
                    .filter(|e| e.recipient_pub == recipient)
                {
                    match kind {
                        SubscriptionKind::Avatar => entry.avatar = text.to_string(),
                        _ => entry.display_name = text.to_string(),
                    }
                }
            }
            ctx.dirty.notify_one();
        }
    });

    spawn_rotation_probe(ctx, &recipient_pub);
    spawn_acceptance_probe(ctx, req_id, address, &recipient_pub);
}

/// Watch the recipient's rendezvous link. A request that no longer resolves
/// under their current node can never be accepted; its entry is marked
/// stale. The flag only ever goes up.
fn spawn_rotation_probe(ctx: &SentCtx, recipient_pub: &str) {
    let task_ctx = ctx.clone();
    let recipient = recipient_pub.to_string();
    ctx.registry.spawn_once(
        recipient_pub,
        SubscriptionKind::RecipientRotation,
        async move {
            let mut link_watch = task_ctx
                .session
                .store()
                .user(&recipient)
                .get(keys::CURRENT_HANDSHAKE_NODE)
                .on();
            loop {
                let current = address_of(link_watch.next().await);
                let candidates: Vec<String> = {
                    let state = task_ctx.state.lock();
                    state
                        .by_id
                        .iter()
                        .filter(|(_, e)| e.recipient_pub == recipient && !e.changed_address)
                        .map(|(id, _)| id.clone())
                        .collect()
                };

                let mut went_stale = Vec::new();
                for req_id in candidates {
                    let still_there = match &current {
                        Some(addr) => matches!(
                            task_ctx
                                .session
                                .store()
                                .get(keys::HANDSHAKE_NODES)
                                .get(addr)
                                .get(&req_id)
                                .once()
                                .await,
                            Some(Value::Record(_))
                        ),
                        None => false,
                    };
                    if !still_there {
                        went_stale.push(req_id);
                    }
                }

                if !went_stale.is_empty() {
                    {
                        let mut state = task_ctx.state.lock();
                        for req_id in &went_stale {
                            if let Some(entry) = state.by_id.get_mut(req_id) {
                                entry.changed_address = true;
                            }
                        }
                    }
                    task_ctx.dirty.notify_one();
                }
            }
        },
    );
}

/// Watch the live request where it was deposited. The first resolution
/// fills in the timestamp; every later change re-checks whether the
/// response was swapped for a granted feed.
fn spawn_acceptance_probe(ctx: &SentCtx, req_id: &str, address: &str, recipient_pub: &str) {
    let task_ctx = ctx.clone();
    let req = req_id.to_string();
    let address = address.to_string();
    let recipient = recipient_pub.to_string();
    ctx.registry
        .spawn_once(req_id, SubscriptionKind::LiveRequest, async move {
            let mut live = task_ctx
                .session
                .store()
                .get(keys::HANDSHAKE_NODES)
                .get(&address)
                .get(&req)
                .on();
            loop {
                let Some(value) = live.next().await else {
                    continue;
                };
                let Some(request) = HandshakeRequest::from_value(&value) else {
                    continue;
                };

                let filled = {
                    let mut state = task_ctx.state.lock();
                    match state.by_id.get_mut(&req) {
                        Some(entry) if entry.timestamp.is_none() => {
                            entry.timestamp = Some(request.timestamp);
                            true
                        }
                        _ => false,
                    }
                };
                if filled {
                    task_ctx.dirty.notify_one();
                }

                match utils::req_was_accepted(&task_ctx.session, &request.response, &recipient)
                    .await
                {
                    Ok(true) => {
                        task_ctx.state.lock().accepted.insert(recipient.clone());
                        task_ctx.dirty.notify_one();
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!(request_id = %req, error = %e, "acceptance probe failed this pass")
                    }
                }
            }
        });
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

    #[tokio::test]
    async fn test_current_node_projection_sees_arriving_requests() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let alice_pub = alice.identity().unwrap().pub_key();
        let bob_pub = bob.identity().unwrap().pub_key();
        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();

        let handle = on_current_handshake_node(&bob).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(HashMap::new()));

        let req_id = actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();

        let requests = wait_until(&mut stream, |reqs| reqs.contains_key(&req_id)).await;
        assert_eq!(requests[&req_id].from, alice_pub);
        assert!(!requests.contains_key(keys::RENDEZVOUS_SENTINEL_FIELD));
    }

    #[tokio::test]
    async fn test_current_node_projection_follows_rotation() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();

        let first_addr = actions::generate_new_handshake_node(&bob).await.unwrap();
        let req_on_first = actions::send_handshake_request(&alice, &first_addr, &bob_pub)
            .await
            .unwrap();

        let handle = on_current_handshake_node(&bob).unwrap();
        let mut stream = handle.subscribe();
        wait_until(&mut stream, |reqs| reqs.contains_key(&req_on_first)).await;

        // Rotation: the projection re-anchors on the fresh, empty node
        actions::generate_new_handshake_node(&bob).await.unwrap();
        wait_until(&mut stream, |reqs| reqs.is_empty()).await;
    }

    #[tokio::test]
    async fn test_sent_requests_projection_sees_acceptance_overwrite() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();

        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();
        let req_id = actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();

        let handle = on_sent_requests(&alice).unwrap();
        let mut stream = handle.subscribe();
        let before = wait_until(&mut stream, |reqs| reqs.contains_key(&req_id)).await;
        let pending_response = before[&req_id].response.clone();

        actions::accept_request(&bob, &req_id).await.unwrap();

        let after = wait_until(&mut stream, |reqs| {
            reqs.get(&req_id).is_some_and(|r| r.response != pending_response)
        })
        .await;
        assert_eq!(after[&req_id].from, alice.identity().unwrap().pub_key());
    }

    #[tokio::test]
    async fn test_simpler_received_requests_lifecycle() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let alice_pub = alice.identity().unwrap().pub_key();
        let bob_pub = bob.identity().unwrap().pub_key();

        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();

        let handle = on_simpler_received_requests(&bob).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(Vec::new()));

        let req_id = actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();

        let pending = wait_until(&mut stream, |list| list.len() == 1).await;
        assert_eq!(pending[0].id, req_id);
        assert_eq!(pending[0].requestor_pk, alice_pub);
        // The payload is decrypted for display: while pending it is the
        // requestor's own feed id
        let alice_feed = utils::recipient_to_outgoing_id(&alice, &bob_pub)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending[0].response, alice_feed);

        actions::set_display_name(&alice, "Alice").await.unwrap();
        wait_until(&mut stream, |list| {
            list.iter().any(|r| r.requestor_display_name == "Alice")
        })
        .await;

        // Accepting establishes the handshake and clears the pending list
        actions::accept_request(&bob, &req_id).await.unwrap();
        wait_until(&mut stream, |list| list.is_empty()).await;
    }

    #[tokio::test]
    async fn test_simpler_received_requests_dedupes_by_requestor() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();

        let first_addr = actions::generate_new_handshake_node(&bob).await.unwrap();
        actions::send_handshake_request(&alice, &first_addr, &bob_pub)
            .await
            .unwrap();

        // Bob rotates; Alice requests again on the fresh node
        let second_addr = actions::generate_new_handshake_node(&bob).await.unwrap();
        actions::send_handshake_request(&alice, &second_addr, &bob_pub)
            .await
            .unwrap();

        let handle = on_simpler_received_requests(&bob).unwrap();
        let mut stream = handle.subscribe();
        let list = wait_until(&mut stream, |list| list.len() == 1).await;
        assert_eq!(list[0].requestor_pk, alice.identity().unwrap().pub_key());
    }

    #[tokio::test]
    async fn test_received_requests_survive_unresolvable_requestor() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();

        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();

        let handle = on_simpler_received_requests(&bob).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(Vec::new()));

        // Anyone can write to a rendezvous node: a shape-valid record whose
        // requestor never registered, with a multi-byte pub
        store
            .get(keys::HANDSHAKE_NODES)
            .get(&bob_addr)
            .get("junk-req")
            .put(Value::record([
                ("from", Value::Text("€".repeat(10))),
                ("response", Value::Text("d".repeat(64))),
                ("timestamp", Value::Num(1)),
            ]))
            .await
            .unwrap();

        // The watcher skips it and keeps projecting later real requests
        let req_id = actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();
        let pending = wait_until(&mut stream, |list| list.iter().any(|r| r.id == req_id)).await;
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simpler_sent_requests_resolves_and_debounces() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();
        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();

        let handle = on_simpler_sent_requests(&alice).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(Vec::new()));

        let req_id = actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();

        let list = wait_until(&mut stream, |list| list.len() == 1).await;
        assert_eq!(list[0].id, req_id);
        assert_eq!(list[0].recipient_public_key, bob_pub);
        assert!(!list[0].recipient_changed_request_address);
        assert!(list[0].timestamp > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simpler_sent_requests_marks_rotated_recipient_stale() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();
        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();

        let handle = on_simpler_sent_requests(&alice).unwrap();
        let mut stream = handle.subscribe();

        actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();
        wait_until(&mut stream, |list| {
            list.len() == 1 && !list[0].recipient_changed_request_address
        })
        .await;

        actions::generate_new_handshake_node(&bob).await.unwrap();
        wait_until(&mut stream, |list| {
            list.len() == 1 && list[0].recipient_changed_request_address
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_simpler_sent_requests_drops_accepted_recipient() {
        let store = SyncedStore::new();
        let alice = create_test_session(&store, "alice").await;
        let bob = create_test_session(&store, "bob").await;
        let bob_pub = bob.identity().unwrap().pub_key();

        let bob_addr = actions::generate_new_handshake_node(&bob).await.unwrap();

        let handle = on_simpler_sent_requests(&alice).unwrap();
        let mut stream = handle.subscribe();

        let req_id = actions::send_handshake_request(&alice, &bob_addr, &bob_pub)
            .await
            .unwrap();
        wait_until(&mut stream, |list| list.len() == 1).await;

        actions::accept_request(&bob, &req_id).await.unwrap();
        wait_until(&mut stream, |list| list.is_empty()).await;
    }
}
