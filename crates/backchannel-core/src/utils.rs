//! Index resolvers and protocol predicates
//!
//! Small async helpers that turn one identity's private indices back into
//! plaintext facts, plus the acceptance predicate shared by the sent-request
//! projection and the reconciliation job. All of them treat store contents
//! as untrusted and fail or report absence instead of guessing.

use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::keys;
use crate::schema::{ResponseState, MIN_CIPHERTEXT_LEN, MIN_ID_LEN, MIN_PUB_LEN};
use crate::session::Session;
use crate::store::{SyncedStore, Value};

/// Truncate a pub key for logging. Cuts on a char boundary; pub keys are
/// normally bs58 but this also gets called on arbitrary text read from
/// shared nodes.
pub(crate) fn short_pub(pub_key: &str) -> &str {
    pub_key
        .char_indices()
        .nth(16)
        .map_or(pub_key, |(i, _)| &pub_key[..i])
}

/// Resolve a user's encryption public key from their identity root.
pub async fn pub_to_epub(store: &SyncedStore, pub_key: &str) -> ApiResult<String> {
    let value = store.user(pub_key).get(keys::EPUB).once().await;

    match value.as_ref().and_then(Value::as_text) {
        Some(epub) if !epub.is_empty() => Ok(epub.to_string()),
        _ => Err(ApiError::NotFound(format!(
            "no epub published for pub {}",
            short_pub(pub_key)
        ))),
    }
}

/// Resolve which recipient a sent request was addressed to, from the
/// caller's own `requestToUser` index.
pub async fn req_to_recipient_pub(session: &Session, req_id: &str) -> ApiResult<String> {
    let identity = session.identity()?;
    let my_secret = session.crypto().self_secret(&identity)?;

    let encrypted = session
        .user_root()?
        .get(keys::REQUEST_TO_USER)
        .get(req_id)
        .once()
        .await;

    let encrypted = match encrypted.as_ref().and_then(Value::as_text) {
        Some(ct) if ct.len() >= MIN_CIPHERTEXT_LEN => ct.to_string(),
        Some(_) => {
            return Err(ApiError::Store(format!(
                "requestToUser[{}] holds an implausibly short ciphertext",
                req_id
            )))
        }
        None => {
            return Err(ApiError::NotFound(format!(
                "no recipient recorded for request {}",
                req_id
            )))
        }
    };

    let recipient_pub = session.crypto().decrypt(&encrypted, &my_secret)?;
    if recipient_pub.len() < MIN_PUB_LEN {
        return Err(ApiError::Store(format!(
            "requestToUser[{}] decrypted to an implausible pub",
            req_id
        )));
    }

    Ok(recipient_pub)
}

/// Most recent request id sent to a recipient, from the caller's own
/// `USER_TO_LAST_REQUEST_SENT` index.
pub async fn recipient_pub_to_last_req_sent_id(
    session: &Session,
    recipient_pub: &str,
) -> ApiResult<String> {
    let value = session
        .user_root()?
        .get(keys::USER_TO_LAST_REQUEST_SENT)
        .get(recipient_pub)
        .once()
        .await;

    match value.as_ref().and_then(Value::as_text) {
        Some(id) if id.len() >= MIN_ID_LEN => Ok(id.to_string()),
        _ => Err(ApiError::NotFound(format!(
            "no last request recorded toward {}",
            short_pub(recipient_pub)
        ))),
    }
}

/// Whether `userToIncoming[recipientPub]` is set, which is what "handshake
/// established" means.
pub async fn successful_handshake_already_exists(
    session: &Session,
    recipient_pub: &str,
) -> ApiResult<bool> {
    let value = session
        .user_root()?
        .get(keys::USER_TO_INCOMING)
        .get(recipient_pub)
        .once()
        .await;

    match value.as_ref().and_then(Value::as_text) {
        Some(id) if id.len() >= MIN_ID_LEN => Ok(true),
        Some(_) => Err(ApiError::Store(format!(
            "userToIncoming[{}] holds an implausibly short value",
            short_pub(recipient_pub)
        ))),
        None => Ok(false),
    }
}

/// The caller's outgoing feed id toward a recipient, if one was indexed.
///
/// An index value that no longer decrypts is reported as absent (and
/// logged): the write path then creates a fresh feed instead of failing the
/// whole operation on a corrupt entry.
pub async fn recipient_to_outgoing_id(
    session: &Session,
    recipient_pub: &str,
) -> ApiResult<Option<String>> {
    let identity = session.identity()?;
    let my_secret = session.crypto().self_secret(&identity)?;

    let value = session
        .user_root()?
        .get(keys::RECIPIENT_TO_OUTGOING)
        .get(recipient_pub)
        .once()
        .await;

    let encrypted = match value.as_ref().and_then(Value::as_text) {
        Some(ct) => ct.to_string(),
        None => return Ok(None),
    };

    match session.crypto().decrypt(&encrypted, &my_secret) {
        Ok(id) if !id.is_empty() => Ok(Some(id)),
        Ok(_) => Ok(None),
        Err(e) => {
            warn!(
                recipient = %short_pub(recipient_pub),
                error = %e,
                "recipientToOutgoing entry does not decrypt, treating as absent"
            );
            Ok(None)
        }
    }
}

/// Decrypt a sent request's `response` and resolve what it means right now.
///
/// Before acceptance the ciphertext decrypts to the caller's own feed id,
/// which short-circuits to [`ResponseState::Pending`] without a remote
/// lookup. After acceptance it decrypts to a feed id that resolves under the
/// recipient's `outgoings`, which is [`ResponseState::Granted`].
pub async fn response_state(
    session: &Session,
    req_response: &str,
    recipient_pub: &str,
) -> ApiResult<ResponseState> {
    let identity = session.identity()?;

    let recipient_epub = pub_to_epub(session.store(), recipient_pub).await?;
    let our_secret = session.crypto().secret(&recipient_epub, &identity)?;
    let decrypted = session.crypto().decrypt(req_response, &our_secret)?;

    if let Some(my_feed_id) = recipient_to_outgoing_id(session, recipient_pub).await? {
        if decrypted == my_feed_id {
            return Ok(ResponseState::Pending(decrypted));
        }
    }

    let feed = session
        .store()
        .user(recipient_pub)
        .get(keys::OUTGOINGS)
        .get(&decrypted)
        .once()
        .await;

    if matches!(feed, Some(Value::Record(_))) {
        Ok(ResponseState::Granted(decrypted))
    } else {
        Ok(ResponseState::Pending(decrypted))
    }
}

/// Whether a sent request's `response` now points at a feed the recipient
/// owns.
pub async fn req_was_accepted(
    session: &Session,
    req_response: &str,
    recipient_pub: &str,
) -> ApiResult<bool> {
    Ok(matches!(
        response_state(session, req_response, recipient_pub).await?,
        ResponseState::Granted(_)
    ))
}

/// Address of a user's current rendezvous node, if they ever created one.
pub async fn curr_handshake_address(
    store: &SyncedStore,
    user_pub: &str,
) -> ApiResult<Option<String>> {
    let value = store
        .user(user_pub)
        .get(keys::CURRENT_HANDSHAKE_NODE)
        .once()
        .await;

    Ok(value.as_ref().and_then(Value::as_link).map(str::to_string))
}
