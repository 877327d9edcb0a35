//! Background reconciliation
//!
//! Accepting a request mutates the shared rendezvous record, but only the
//! recipient's side of the index pair: the requestor learns about the grant
//! whenever they next look. This job is that look, running continuously.
//! For every sent request it watches the live record, and once the response
//! resolves to a feed the recipient owns, it indexes that feed under
//! `userToIncoming` exactly once.
//!
//! Every entry is handled independently: a corrupt index value or an
//! unresolvable recipient skips that entry and never stalls the rest. The
//! established index is insert-only here, an existing entry is never
//! overwritten.

use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::events::{Emitter, ProjectionHandle, SubscriptionKind};
use crate::keys;
use crate::schema::{HandshakeRequest, ResponseState};
use crate::session::Session;
use crate::store::Value;
use crate::utils;

/// Watch every sent request for acceptance and establish the handshake on
/// the caller's side when one is granted.
///
/// Emits the counterparty pub each time a handshake is newly established.
/// The handle tears the job down like any projection.
pub fn on_accepted_requests(session: &Session) -> ApiResult<ProjectionHandle<String>> {
    session.identity()?;
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();
    let registry = handle.registry();

    let session = session.clone();
    let mut entries = user_root.get(keys::SENT_REQUESTS).map();
    handle.own(tokio::spawn(async move {
        loop {
            let links = entries.next().await;
            for (req_id, value) in &links {
                let Some(address) = value.as_link().map(str::to_string) else {
                    continue;
                };
                let session = session.clone();
                let emitter = emitter.clone();
                let req = req_id.clone();
                registry.spawn_once(req_id, SubscriptionKind::LiveRequest, async move {
                    let mut live = session
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
                        if let Err(e) = reconcile(&session, &req, &request, &emitter).await {
                            warn!(
                                request_id = %req,
                                error = %e,
                                "reconciliation skipped this pass"
                            );
                        }
                    }
                });
            }
        }
    }));

    Ok(handle)
}

/// One idempotent pass over a single live request.
async fn reconcile(
    session: &Session,
    req_id: &str,
    request: &HandshakeRequest,
    emitter: &Emitter<String>,
) -> ApiResult<()> {
    let recipient_pub = match utils::req_to_recipient_pub(session, req_id).await {
        Ok(pub_key) => pub_key,
        // The index write may not have replicated yet; a later pass retries
        Err(ApiError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    let feed_id = match utils::response_state(session, &request.response, &recipient_pub).await? {
        ResponseState::Granted(feed_id) => feed_id,
        ResponseState::Pending(_) => return Ok(()),
    };

    if utils::successful_handshake_already_exists(session, &recipient_pub).await? {
        return Ok(());
    }

    let identity = session.identity()?;
    let my_secret = session.crypto().self_secret(&identity)?;
    let encrypted = session.crypto().encrypt(&feed_id, &my_secret)?;
    session
        .user_root()?
        .get(keys::USER_TO_INCOMING)
        .get(&recipient_pub)
        .put(Value::Text(encrypted))
        .await?;

    info!(
        user = %utils::short_pub(&recipient_pub),
        "handshake established from accepted request"
    );
    emitter.emit(recipient_pub);
    Ok(())
}
