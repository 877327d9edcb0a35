//! Graph namespace for the contact protocol
//!
//! Every path name here is wire-compatible with existing peers; renaming any
//! of them is a breaking protocol change. Keys live either under an identity
//! root (`store.user(pub)`) or at the shared top level (`HANDSHAKE_NODES`).
//!
//! ## Layout under an identity root
//!
//! ```text
//! ~<pub>
//!   epub                        encryption public key (published at signup)
//!   currentHandshakeNode        link -> active rendezvous node
//!   outgoings/<feedId>          {with, messages/<msgId>}
//!   recipientToOutgoing/<pub>   enc(feedId, self-secret)
//!   userToIncoming/<pub>        enc(feedId, self-secret)
//!   sentRequests/<id>           link -> rendezvous node the request went to
//!   requestToUser/<reqId>       enc(recipientPub, self-secret)
//!   USER_TO_LAST_REQUEST_SENT/<pub>   requestId
//!   blacklist/<id>              banned pub
//!   Profile/{avatar,displayName}
//! ```

/// Shared top-level collection all rendezvous nodes are created under.
pub const HANDSHAKE_NODES: &str = "handshakeNodes";

/// Link field on an identity root pointing at the active rendezvous node.
pub const CURRENT_HANDSHAKE_NODE: &str = "currentHandshakeNode";

/// Message collection inside an outgoing feed.
pub const MESSAGES: &str = "messages";

/// Collection of outgoing feeds under an identity root.
pub const OUTGOINGS: &str = "outgoings";

/// Index: recipient pub -> own outgoing feed id (encrypted).
pub const RECIPIENT_TO_OUTGOING: &str = "recipientToOutgoing";

/// Index: counterparty pub -> incoming feed id (encrypted). Presence means
/// the handshake is mutually established.
pub const USER_TO_INCOMING: &str = "userToIncoming";

/// Per-request links back to the rendezvous node each request was published
/// to. Keyed by request id; kept as links so the recipient's acceptance
/// overwrite stays visible from here.
pub const SENT_REQUESTS: &str = "sentRequests";

/// Index: request id -> recipient pub (encrypted).
pub const REQUEST_TO_USER: &str = "requestToUser";

/// Set of blacklisted public keys.
pub const BLACKLIST: &str = "blacklist";

/// Profile record holding avatar and display name.
pub const PROFILE: &str = "Profile";

/// Avatar field inside the profile record (nullable).
pub const AVATAR: &str = "avatar";

/// Display-name field inside the profile record.
pub const DISPLAY_NAME: &str = "displayName";

/// Index: recipient pub -> most recent outstanding request id.
pub const USER_TO_LAST_REQUEST_SENT: &str = "USER_TO_LAST_REQUEST_SENT";

/// Encryption-public-key field published on the identity root.
pub const EPUB: &str = "epub";

/// Registered alias field published on the identity root.
pub const ALIAS: &str = "alias";

/// Unencrypted marker seeded as the first message of every new feed, so a
/// created-but-empty feed is distinguishable from a never-created one. Never
/// encrypted, never decrypted, filtered from user-facing projections.
pub const INITIAL_MSG: &str = "$$__SHOCKWALLET__INITIAL__MESSAGE";

/// Field name of the sentinel member seeded into every rendezvous node.
pub const RENDEZVOUS_SENTINEL_FIELD: &str = "unused";
