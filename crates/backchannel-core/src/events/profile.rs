//! Own-profile projections: avatar, display name, blacklist, rendezvous
//! address. All of them watch paths under the session's own identity root.

use crate::error::ApiResult;
use crate::keys;
use crate::session::Session;
use crate::store::Value;
use tracing::warn;

use super::{ProjectionHandle, SubscriptionKind, SubscriptionRegistry};

/// Own avatar. Emits `None` until one is set and after it is cleared.
pub fn on_avatar(session: &Session) -> ApiResult<ProjectionHandle<Option<String>>> {
    own_profile_field(session, keys::AVATAR)
}

/// Own display name. Emits `None` until one is set.
pub fn on_display_name(session: &Session) -> ApiResult<ProjectionHandle<Option<String>>> {
    own_profile_field(session, keys::DISPLAY_NAME)
}

fn own_profile_field(
    session: &Session,
    field: &'static str,
) -> ApiResult<ProjectionHandle<Option<String>>> {
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();

    let mut watch = user_root.get(keys::PROFILE).get(field).on();
    handle.own(tokio::spawn(async move {
        loop {
            match watch.next().await {
                Some(Value::Text(text)) => emitter.emit(Some(text)),
                Some(Value::Null) | None => emitter.emit(None),
                Some(_) => warn!(field, "profile field holds a non-text value, ignoring"),
            }
        }
    }));

    Ok(handle)
}

/// Members of the session's blacklist. Emits the full list on every change.
pub fn on_blacklist(session: &Session) -> ApiResult<ProjectionHandle<Vec<String>>> {
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();

    let mut members = user_root.get(keys::BLACKLIST).map();
    handle.own(tokio::spawn(async move {
        loop {
            let snapshot = members.next().await;
            let mut banned = Vec::with_capacity(snapshot.len());
            for (id, value) in &snapshot {
                match value {
                    Value::Text(pub_key) if !pub_key.is_empty() => banned.push(pub_key.clone()),
                    Value::Null => {}
                    _ => warn!(member = %id, "blacklist member is not a pub key, skipping"),
                }
            }
            emitter.emit(banned);
        }
    }));

    Ok(handle)
}

/// Address of the session's active rendezvous node, `None` while no node
/// was ever generated.
pub fn on_current_handshake_address(
    session: &Session,
) -> ApiResult<ProjectionHandle<Option<String>>> {
    let user_root = session.user_root()?;
    let (handle, emitter) = ProjectionHandle::new();

    let mut watch = user_root.get(keys::CURRENT_HANDSHAKE_NODE).on();
    handle.own(tokio::spawn(async move {
        loop {
            match watch.next().await {
                Some(Value::Link(address)) => emitter.emit(Some(address)),
                Some(Value::Null) | None => emitter.emit(None),
                Some(_) => warn!("currentHandshakeNode is not a link, ignoring"),
            }
        }
    }));

    Ok(handle)
}

/// Attach avatar and display-name watches for `subject` at most once,
/// feeding every text update through `apply`. Non-text values (including a
/// cleared avatar) are not propagated: display fields only ever improve on
/// their defaults.
pub(crate) fn spawn_profile_listeners<F>(
    registry: &SubscriptionRegistry,
    session: &Session,
    subject: &str,
    apply: F,
) where
    F: Fn(SubscriptionKind, &str) + Clone + Send + Sync + 'static,
{
    for kind in [SubscriptionKind::Avatar, SubscriptionKind::DisplayName] {
        let session = session.clone();
        let subject_owned = subject.to_string();
        let apply = apply.clone();
        registry.spawn_once(subject, kind, async move {
            let field = match kind {
                SubscriptionKind::Avatar => keys::AVATAR,
                _ => keys::DISPLAY_NAME,
            };
            let mut watch = session
                .store()
                .user(&subject_owned)
                .get(keys::PROFILE)
                .get(field)
                .on();
            loop {
                if let Some(Value::Text(text)) = watch.next().await {
                    apply(kind, &text);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions;
    use crate::store::SyncedStore;

    async fn create_test_session(store: &SyncedStore, alias: &str) -> Session {
        let session = Session::new(store.clone());
        actions::register(&session, alias, "hunter22").await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_avatar_projection_follows_writes() {
        let store = SyncedStore::new();
        let session = create_test_session(&store, "alice").await;

        let handle = on_avatar(&session).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(None));

        actions::set_avatar(&session, Some("data:image/png;base64,xyz"))
            .await
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(Some("data:image/png;base64,xyz".to_string()))
        );

        actions::set_avatar(&session, None).await.unwrap();
        assert_eq!(stream.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_display_name_projection() {
        let store = SyncedStore::new();
        let session = create_test_session(&store, "alice").await;

        let handle = on_display_name(&session).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(None));

        actions::set_display_name(&session, "Alice").await.unwrap();
        assert_eq!(stream.next().await, Some(Some("Alice".to_string())));
    }

    #[tokio::test]
    async fn test_blacklist_projection_collects_members() {
        let store = SyncedStore::new();
        let session = create_test_session(&store, "alice").await;

        let handle = on_blacklist(&session).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(Vec::new()));

        let banned_pub = "m".repeat(44);
        actions::blacklist_pub(&session, &banned_pub).await.unwrap();
        assert_eq!(stream.next().await, Some(vec![banned_pub.clone()]));

        let other_pub = "n".repeat(44);
        actions::blacklist_pub(&session, &other_pub).await.unwrap();
        let mut listed = stream.next().await.unwrap();
        listed.sort();
        let mut expected = vec![banned_pub, other_pub];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_handshake_address_follows_rotation() {
        let store = SyncedStore::new();
        let session = create_test_session(&store, "alice").await;

        let handle = on_current_handshake_address(&session).unwrap();
        let mut stream = handle.subscribe();
        assert_eq!(stream.next().await, Some(None));

        let first = actions::generate_new_handshake_node(&session).await.unwrap();
        assert_eq!(stream.next().await, Some(Some(first.clone())));

        let second = actions::generate_new_handshake_node(&session).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(stream.next().await, Some(Some(second)));
    }
}
