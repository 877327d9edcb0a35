//! Write-path operations
//!
//! Every mutation of the protocol state lives here: account lifecycle,
//! rendezvous node rotation, the handshake request flow on both sides, and
//! message/profile writes. Operations validate their arguments before
//! touching the store and order their writes so that a failure partway
//! through never publishes a request the caller's own indices do not know
//! about.
//!
//! The one deliberately destructive write in the protocol is the response
//! overwrite in [`accept_request`]. It runs last, after the acceptor's
//! incoming index is durably recorded, because the requestor's copy of the
//! feed id lives only inside that ciphertext.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::keys;
use crate::schema::{HandshakeRequest, Message};
use crate::session::Session;
use crate::store::Value;
use crate::utils;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn initial_message() -> Message {
    Message {
        body: keys::INITIAL_MSG.to_string(),
        timestamp: now_millis(),
    }
}

/// Create a new account and bind it to the session.
pub async fn register(session: &Session, alias: &str, pass: &str) -> ApiResult<()> {
    if alias.is_empty() {
        return Err(ApiError::InvalidArgument("alias must not be empty".into()));
    }
    if pass.is_empty() {
        return Err(ApiError::InvalidArgument("pass must not be empty".into()));
    }
    if session.is_auth() {
        return Err(ApiError::AlreadyAuth);
    }

    let identity = session.store().create_account(alias, pass).await?;
    let pub_key = identity.pub_key();
    session.set_identity(identity)?;

    info!(alias, pub_key = %utils::short_pub(&pub_key), "registered account");
    Ok(())
}

/// Authenticate an existing account and bind it to the session.
pub async fn authenticate(session: &Session, alias: &str, pass: &str) -> ApiResult<()> {
    if alias.is_empty() {
        return Err(ApiError::InvalidArgument("alias must not be empty".into()));
    }
    if pass.is_empty() {
        return Err(ApiError::InvalidArgument("pass must not be empty".into()));
    }
    if session.is_auth() {
        return Err(ApiError::AlreadyAuth);
    }

    let identity = session.store().auth(alias, pass).await?;
    session.set_identity(identity)?;

    debug!(alias, "authenticated");
    Ok(())
}

/// Drop the session's identity.
pub fn logout(session: &Session) -> ApiResult<()> {
    if !session.is_auth() {
        return Err(ApiError::NotAuth);
    }

    session.clear_identity();

    if session.is_auth() {
        return Err(ApiError::UnsuccessfulLogout);
    }
    Ok(())
}

/// Create a fresh rendezvous node and point the caller's
/// `currentHandshakeNode` link at it. Returns the new node's address.
///
/// The node is seeded with the sentinel member `unused: 0` so it exists as
/// a record before any request lands on it. Requests already sitting on the
/// previous node are left in place; they simply stop resolving through the
/// caller's current address, which is what makes them stale.
pub async fn generate_new_handshake_node(session: &Session) -> ApiResult<String> {
    let user_root = session.user_root()?;

    let address = session
        .store()
        .get(keys::HANDSHAKE_NODES)
        .set(Value::record(vec![(
            keys::RENDEZVOUS_SENTINEL_FIELD,
            Value::Num(0),
        )]))
        .await?;

    user_root
        .get(keys::CURRENT_HANDSHAKE_NODE)
        .put(Value::Link(address.clone()))
        .await?;

    debug!(address = %address, "rotated handshake node");
    Ok(address)
}

/// Create an outgoing feed toward a recipient, or reuse the one already
/// indexed. Returns the feed id.
///
/// A new feed starts with the unencrypted initial-message sentinel as its
/// first member and is only then indexed under `recipientToOutgoing`. If
/// seeding or indexing fails the half-created feed is nulled out
/// best-effort before the error propagates.
pub(crate) async fn create_outgoing_feed(
    session: &Session,
    recipient_pub: &str,
) -> ApiResult<String> {
    let identity = session.identity()?;
    let my_secret = session.crypto().self_secret(&identity)?;
    let user_root = session.user_root()?;

    if let Some(existing) = utils::recipient_to_outgoing_id(session, recipient_pub).await? {
        debug!(feed_id = %existing, "reusing existing outgoing feed");
        return Ok(existing);
    }

    let encrypted_recipient = session.crypto().encrypt(recipient_pub, &my_secret)?;
    let feed_id = user_root
        .get(keys::OUTGOINGS)
        .set(Value::record(vec![(
            "with",
            Value::Text(encrypted_recipient),
        )]))
        .await?;

    let seeded: ApiResult<()> = async {
        user_root
            .get(keys::OUTGOINGS)
            .get(&feed_id)
            .get(keys::MESSAGES)
            .set(initial_message().to_value())
            .await?;

        let encrypted_feed_id = session.crypto().encrypt(&feed_id, &my_secret)?;
        user_root
            .get(keys::RECIPIENT_TO_OUTGOING)
            .get(recipient_pub)
            .put(Value::Text(encrypted_feed_id))
            .await?;
        Ok(())
    }
    .await;

    if let Err(e) = seeded {
        // best effort, the original error is the one worth reporting
        let _ = user_root
            .get(keys::OUTGOINGS)
            .get(&feed_id)
            .put(Value::Null)
            .await;
        return Err(e);
    }

    debug!(feed_id = %feed_id, "created outgoing feed");
    Ok(feed_id)
}

/// Publish a handshake request onto the recipient's current rendezvous
/// node. Returns the new request id.
pub async fn send_handshake_request(
    session: &Session,
    handshake_address: &str,
    recipient_pub: &str,
) -> ApiResult<String> {
    let identity = session.identity()?;
    let user_root = session.user_root()?;

    if handshake_address.is_empty() {
        return Err(ApiError::InvalidArgument(
            "handshake_address must not be empty".into(),
        ));
    }
    if recipient_pub.is_empty() {
        return Err(ApiError::InvalidArgument(
            "recipient_pub must not be empty".into(),
        ));
    }

    let recipient_epub = utils::pub_to_epub(session.store(), recipient_pub).await?;
    let my_secret = session.crypto().self_secret(&identity)?;
    let our_secret = session.crypto().secret(&recipient_epub, &identity)?;

    if utils::successful_handshake_already_exists(session, recipient_pub).await? {
        return Err(ApiError::AlreadyHandshaked);
    }

    // a previous request still sitting on the recipient's current node
    // counts as outstanding, whatever node it was originally sent to
    match utils::recipient_pub_to_last_req_sent_id(session, recipient_pub).await {
        Ok(last_req_id) => {
            if let Some(addr) =
                utils::curr_handshake_address(session.store(), recipient_pub).await?
            {
                let still_there = session
                    .store()
                    .get(keys::HANDSHAKE_NODES)
                    .get(&addr)
                    .get(&last_req_id)
                    .once()
                    .await
                    .is_some();
                if still_there {
                    return Err(ApiError::AlreadyRequestedHandshake);
                }
            }
        }
        Err(ApiError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    match utils::curr_handshake_address(session.store(), recipient_pub).await? {
        Some(addr) if addr == handshake_address => {}
        Some(_) => {
            return Err(ApiError::StaleHandshakeAddress(
                handshake_address.to_string(),
            ))
        }
        None => {
            return Err(ApiError::NotFound(
                "recipient has no current handshake node".into(),
            ))
        }
    }

    let feed_id = create_outgoing_feed(session, recipient_pub).await?;
    let encrypted_feed_id = session.crypto().encrypt(&feed_id, &our_secret)?;

    let request = HandshakeRequest {
        from: identity.pub_key(),
        response: encrypted_feed_id,
        timestamp: now_millis(),
    };

    let request_id = session
        .store()
        .get(keys::HANDSHAKE_NODES)
        .get(handshake_address)
        .set(request.to_value())
        .await
        .map_err(|e| ApiError::CouldntSendRequest(e.to_string()))?;

    user_root
        .get(keys::USER_TO_LAST_REQUEST_SENT)
        .get(recipient_pub)
        .put(Value::Text(request_id.clone()))
        .await?;

    // requestToUser must land before the sentRequests link: linking the
    // request wakes the reconciliation job, which resolves the recipient
    // through requestToUser
    let encrypted_recipient = session.crypto().encrypt(recipient_pub, &my_secret)?;
    user_root
        .get(keys::REQUEST_TO_USER)
        .get(&request_id)
        .put(Value::Text(encrypted_recipient))
        .await?;

    user_root
        .get(keys::SENT_REQUESTS)
        .get(&request_id)
        .put(Value::Link(handshake_address.to_string()))
        .await?;

    info!(
        recipient = %utils::short_pub(recipient_pub),
        request_id = %request_id,
        "sent handshake request"
    );
    Ok(request_id)
}

/// Accept a pending request sitting on the caller's current rendezvous
/// node.
///
/// Decrypts the requestor's feed id out of `response`, records it under
/// `userToIncoming`, then overwrites `response` with the caller's own feed
/// id under the same pairwise secret. The overwrite is what tells the
/// requestor's reconciliation job the handshake went through.
pub async fn accept_request(session: &Session, request_id: &str) -> ApiResult<()> {
    let identity = session.identity()?;
    let user_root = session.user_root()?;

    let own_address = utils::curr_handshake_address(session.store(), &identity.pub_key())
        .await?
        .ok_or_else(|| {
            ApiError::TriedToAcceptAnInvalidRequest(format!(
                "{} (no current handshake node)",
                request_id
            ))
        })?;

    let request_node = session
        .store()
        .get(keys::HANDSHAKE_NODES)
        .get(&own_address)
        .get(request_id);

    let request = request_node
        .once()
        .await
        .as_ref()
        .and_then(HandshakeRequest::from_value)
        .ok_or_else(|| ApiError::TriedToAcceptAnInvalidRequest(request_id.to_string()))?;

    let requestor_epub = utils::pub_to_epub(session.store(), &request.from).await?;
    let our_secret = session.crypto().secret(&requestor_epub, &identity)?;
    let incoming_feed_id = session.crypto().decrypt(&request.response, &our_secret)?;

    let own_feed_id = create_outgoing_feed(session, &request.from).await?;

    let my_secret = session.crypto().self_secret(&identity)?;
    let encrypted_incoming = session.crypto().encrypt(&incoming_feed_id, &my_secret)?;
    user_root
        .get(keys::USER_TO_INCOMING)
        .get(&request.from)
        .put(Value::Text(encrypted_incoming))
        .await
        .map_err(|e| ApiError::CouldntAcceptRequest(e.to_string()))?;

    // the overwrite discards the requestor's original ciphertext, so it
    // only runs once the incoming index is safely recorded
    let encrypted_outgoing = session.crypto().encrypt(&own_feed_id, &our_secret)?;
    request_node
        .put(Value::record(vec![(
            "response",
            Value::Text(encrypted_outgoing),
        )]))
        .await
        .map_err(|e| ApiError::CouldntPutRequestResponse(e.to_string()))?;

    info!(
        requestor = %utils::short_pub(&request.from),
        request_id = %request_id,
        "accepted handshake request"
    );
    Ok(())
}

/// Append an encrypted message to the outgoing feed toward a recipient.
/// Returns the new message id.
pub async fn send_message(
    session: &Session,
    recipient_pub: &str,
    body: &str,
) -> ApiResult<String> {
    let identity = session.identity()?;
    let user_root = session.user_root()?;

    if recipient_pub.is_empty() {
        return Err(ApiError::InvalidArgument(
            "recipient_pub must not be empty".into(),
        ));
    }
    if body.is_empty() {
        return Err(ApiError::InvalidArgument("body must not be empty".into()));
    }

    let recipient_epub = utils::pub_to_epub(session.store(), recipient_pub).await?;

    let feed_id = utils::recipient_to_outgoing_id(session, recipient_pub)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "no outgoing feed toward {}",
                utils::short_pub(recipient_pub)
            ))
        })?;

    let our_secret = session.crypto().secret(&recipient_epub, &identity)?;
    let encrypted_body = session.crypto().encrypt(body, &our_secret)?;

    let message = Message {
        body: encrypted_body,
        timestamp: now_millis(),
    };

    let message_id = user_root
        .get(keys::OUTGOINGS)
        .get(&feed_id)
        .get(keys::MESSAGES)
        .set(message.to_value())
        .await?;

    debug!(feed_id = %feed_id, message_id = %message_id, "sent message");
    Ok(message_id)
}

/// Handshake-then-message in one call.
///
/// When a successful handshake already exists the handshake step is
/// skipped entirely and only the message is sent, so the call is safe to
/// repeat. Returns the message id.
pub async fn send_handshake_request_with_initial_message(
    session: &Session,
    handshake_address: &str,
    recipient_pub: &str,
    body: &str,
) -> ApiResult<String> {
    let already_handshaked =
        utils::successful_handshake_already_exists(session, recipient_pub).await?;

    if !already_handshaked {
        send_handshake_request(session, handshake_address, recipient_pub).await?;
    }

    send_message(session, recipient_pub, body).await
}

/// Set or clear the caller's profile avatar.
pub async fn set_avatar(session: &Session, avatar: Option<&str>) -> ApiResult<()> {
    let user_root = session.user_root()?;

    if let Some(a) = avatar {
        if a.is_empty() {
            return Err(ApiError::InvalidArgument(
                "avatar must be a non-empty string or none".into(),
            ));
        }
    }

    user_root
        .get(keys::PROFILE)
        .get(keys::AVATAR)
        .put(match avatar {
            Some(a) => Value::Text(a.to_string()),
            None => Value::Null,
        })
        .await
}

/// Set the caller's profile display name.
pub async fn set_display_name(session: &Session, display_name: &str) -> ApiResult<()> {
    let user_root = session.user_root()?;

    if display_name.is_empty() {
        return Err(ApiError::InvalidArgument(
            "display_name must not be empty".into(),
        ));
    }

    user_root
        .get(keys::PROFILE)
        .get(keys::DISPLAY_NAME)
        .put(Value::Text(display_name.to_string()))
        .await
}

/// Add a public key to the caller's blacklist. Returns the entry id.
pub async fn blacklist_pub(session: &Session, pub_key: &str) -> ApiResult<String> {
    let user_root = session.user_root()?;

    if pub_key.is_empty() {
        return Err(ApiError::InvalidArgument(
            "pub_key must not be empty".into(),
        ));
    }

    user_root
        .get(keys::BLACKLIST)
        .set(Value::Text(pub_key.to_string()))
        .await
}
