//! Record classification and projection types
//!
//! Anything read from the store is untrusted until it classifies: any peer
//! can write to a rendezvous node, and a tombstoned feed reads back as null.
//! The `is_*` predicates and `from_value` constructors here are the only way
//! protocol code turns a raw [`Value`] into a typed record.
//!
//! Projection types ([`Chat`], [`SimpleSentRequest`], [`SimpleReceivedRequest`])
//! are derived in-process and never parsed back from the store; they derive
//! `Serialize` with camelCase field names so the RPC adapter can frame them
//! for existing clients unchanged.

use std::collections::HashMap;

use serde::Serialize;

use crate::keys;
use crate::store::Value;

/// Shortest plausible bs58 public key accepted from untrusted records.
pub(crate) const MIN_PUB_LEN: usize = 30;

/// Shortest plausible ciphertext accepted from untrusted records.
pub(crate) const MIN_CIPHERTEXT_LEN: usize = 10;

/// Shortest plausible generated id accepted from untrusted records.
pub(crate) const MIN_ID_LEN: usize = 5;

/// A handshake request as it sits under a rendezvous node.
///
/// `response` is one opaque ciphertext for the record's whole life: the
/// requestor's feed id while pending, the recipient's feed id once granted.
/// Which one it is can only be learned by decrypting and resolving, see
/// [`ResponseState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandshakeRequest {
    pub from: String,
    pub response: String,
    pub timestamp: i64,
}

impl HandshakeRequest {
    /// Classify an untrusted value. The rendezvous sentinel (`{unused: 0}`)
    /// and anything else misshapen yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let from = value.field("from")?.as_text()?;
        let response = value.field("response")?.as_text()?;
        let timestamp = value.field("timestamp")?.as_num()?;

        if from.len() < MIN_PUB_LEN || response.len() < MIN_CIPHERTEXT_LEN || timestamp <= 0 {
            return None;
        }

        Some(Self {
            from: from.to_string(),
            response: response.to_string(),
            timestamp,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::record([
            ("from", Value::Text(self.from.clone())),
            ("response", Value::Text(self.response.clone())),
            ("timestamp", Value::Num(self.timestamp)),
        ])
    }
}

pub fn is_handshake_request(value: &Value) -> bool {
    HandshakeRequest::from_value(value).is_some()
}

/// A feed message. `body` is ciphertext, except the feed-creation sentinel
/// which travels as the bare [`keys::INITIAL_MSG`] marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub body: String,
    pub timestamp: i64,
}

impl Message {
    pub fn from_value(value: &Value) -> Option<Self> {
        let body = value.field("body")?.as_text()?;
        let timestamp = value.field("timestamp")?.as_num()?;

        if body.is_empty() || timestamp <= 0 {
            return None;
        }

        Some(Self {
            body: body.to_string(),
            timestamp,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::record([
            ("body", Value::Text(self.body.clone())),
            ("timestamp", Value::Num(self.timestamp)),
        ])
    }

    pub fn is_initial(&self) -> bool {
        self.body == keys::INITIAL_MSG
    }
}

pub fn is_message(value: &Value) -> bool {
    Message::from_value(value).is_some()
}

/// An outgoing feed as read raw from the store: `with` still encrypted,
/// messages not yet attached.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialOutgoing {
    pub with: String,
}

impl PartialOutgoing {
    pub fn from_value(value: &Value) -> Option<Self> {
        let with = value.field("with")?.as_text()?;
        if with.len() < MIN_CIPHERTEXT_LEN {
            return None;
        }
        Some(Self {
            with: with.to_string(),
        })
    }
}

pub fn is_partial_outgoing(value: &Value) -> bool {
    PartialOutgoing::from_value(value).is_some()
}

/// A fully resolved outgoing feed: counterparty pub decrypted, messages
/// decrypted (sentinel body passed through unchanged).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Outgoing {
    pub with: String,
    pub messages: HashMap<String, Message>,
}

/// What a request's `response` ciphertext turned out to mean after
/// decryption and resolution against the recipient's feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseState {
    /// Still the requestor's own feed id; nobody has accepted
    Pending(String),
    /// The recipient's feed id; the handshake was granted
    Granted(String),
}

impl ResponseState {
    pub fn feed_id(&self) -> &str {
        match self {
            ResponseState::Pending(id) | ResponseState::Granted(id) => id,
        }
    }
}

/// One rendered message inside a [`Chat`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub body: String,
    pub outgoing: bool,
    pub timestamp: i64,
}

/// Per-contact merged conversation view.
///
/// Messages are kept ascending by timestamp. The feed-creation sentinel is
/// carried like any other message (it is what makes a freshly accepted
/// contact visible before the first real message); display layers filter it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub recipient_public_key: String,
    pub recipient_avatar: String,
    pub recipient_display_name: String,
    pub messages: Vec<ChatMessage>,
}

impl Chat {
    pub(crate) fn new(recipient_public_key: &str) -> Self {
        Self {
            recipient_public_key: recipient_public_key.to_string(),
            recipient_avatar: String::new(),
            // Until a profile name arrives the pub itself is the name
            recipient_display_name: recipient_public_key.to_string(),
            messages: Vec::new(),
        }
    }

    /// Most recent message timestamp, 0 for an empty chat.
    pub fn last_activity(&self) -> i64 {
        self.messages.iter().map(|m| m.timestamp).max().unwrap_or(0)
    }
}

/// Shape check for derived chats before they are emitted.
pub fn is_chat(chat: &Chat) -> bool {
    chat.recipient_public_key.len() >= MIN_PUB_LEN
        && chat
            .messages
            .iter()
            .all(|m| m.id.len() >= MIN_ID_LEN && !m.body.is_empty() && m.timestamp > 0)
}

/// A pending request someone sent to the local session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleReceivedRequest {
    pub id: String,
    #[serde(rename = "requestorPK")]
    pub requestor_pk: String,
    pub requestor_avatar: String,
    pub requestor_display_name: String,
    /// Decrypted response payload (the requestor's feed id)
    pub response: String,
    pub timestamp: i64,
}

/// A pending request the local session sent to someone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleSentRequest {
    pub id: String,
    pub recipient_public_key: String,
    pub recipient_avatar: String,
    pub recipient_display_name: String,
    /// True once the recipient rotated their rendezvous node away from the
    /// one this request was deposited on: it can no longer be accepted
    pub recipient_changed_request_address: bool,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Value {
        Value::record([
            ("from", Value::Text("a".repeat(40))),
            ("response", Value::Text("c".repeat(48))),
            ("timestamp", Value::Num(1_700_000_000_000)),
        ])
    }

    #[test]
    fn test_handshake_request_classifies() {
        let req = HandshakeRequest::from_value(&sample_request()).unwrap();
        assert_eq!(req.from.len(), 40);
        assert!(is_handshake_request(&sample_request()));
    }

    #[test]
    fn test_sentinel_member_is_not_a_request() {
        let sentinel = Value::record([(keys::RENDEZVOUS_SENTINEL_FIELD, Value::Num(0))]);
        assert!(!is_handshake_request(&sentinel));
    }

    #[test]
    fn test_request_rejects_wrong_shapes() {
        // Missing field
        let mut missing = sample_request();
        if let Value::Record(map) = &mut missing {
            map.remove("response");
        }
        assert!(!is_handshake_request(&missing));

        // Wrong leaf type
        let bad_type = Value::record([
            ("from", Value::Num(3)),
            ("response", Value::Text("c".repeat(48))),
            ("timestamp", Value::Num(1)),
        ]);
        assert!(!is_handshake_request(&bad_type));

        // Implausibly short pub
        let short = Value::record([
            ("from", Value::Text("short".into())),
            ("response", Value::Text("c".repeat(48))),
            ("timestamp", Value::Num(1_700_000_000_000)),
        ]);
        assert!(!is_handshake_request(&short));

        assert!(!is_handshake_request(&Value::Null));
        assert!(!is_handshake_request(&Value::from("text")));
    }

    #[test]
    fn test_request_roundtrips_via_value() {
        let req = HandshakeRequest::from_value(&sample_request()).unwrap();
        assert_eq!(HandshakeRequest::from_value(&req.to_value()), Some(req));
    }

    #[test]
    fn test_message_classification() {
        let msg = Value::record([
            ("body", Value::Text("ciphertext-or-sentinel".into())),
            ("timestamp", Value::Num(42)),
        ]);
        assert!(is_message(&msg));

        let initial = Message::from_value(&Value::record([
            ("body", Value::Text(keys::INITIAL_MSG.into())),
            ("timestamp", Value::Num(42)),
        ]))
        .unwrap();
        assert!(initial.is_initial());

        let empty_body = Value::record([
            ("body", Value::Text(String::new())),
            ("timestamp", Value::Num(42)),
        ]);
        assert!(!is_message(&empty_body));

        let no_timestamp = Value::record([("body", Value::Text("x".into()))]);
        assert!(!is_message(&no_timestamp));
    }

    #[test]
    fn test_partial_outgoing_classification() {
        let feed = Value::record([("with", Value::Text("e".repeat(40)))]);
        assert!(is_partial_outgoing(&feed));

        // Feed with extra fields still classifies
        let with_messages = Value::record([
            ("with", Value::Text("e".repeat(40))),
            ("messages", Value::record([])),
        ]);
        assert!(is_partial_outgoing(&with_messages));

        // Tombstoned feed does not
        assert!(!is_partial_outgoing(&Value::Null));
    }

    #[test]
    fn test_outgoing_snapshots_compare_by_content() {
        // Projection streams drop consecutive identical snapshots, which
        // compares whole feeds including their message maps
        let mut a = Outgoing {
            with: "p".repeat(40),
            messages: HashMap::new(),
        };
        a.messages.insert(
            "m1".into(),
            Message {
                body: "hello".into(),
                timestamp: 1,
            },
        );
        let b = a.clone();
        assert_eq!(a, b);

        a.messages.get_mut("m1").unwrap().body = "edited".into();
        assert_ne!(a, b);
    }

    #[test]
    fn test_chat_validation() {
        let mut chat = Chat::new(&"p".repeat(40));
        assert!(is_chat(&chat));

        chat.messages.push(ChatMessage {
            id: "m".repeat(8),
            body: "hello".into(),
            outgoing: true,
            timestamp: 10,
        });
        assert!(is_chat(&chat));
        assert_eq!(chat.last_activity(), 10);

        chat.messages.push(ChatMessage {
            id: String::new(),
            body: "x".into(),
            outgoing: false,
            timestamp: 11,
        });
        assert!(!is_chat(&chat));

        assert!(!is_chat(&Chat::new("short")));
    }

    #[test]
    fn test_response_state_accessor() {
        assert_eq!(ResponseState::Pending("f1".into()).feed_id(), "f1");
        assert_eq!(ResponseState::Granted("f2".into()).feed_id(), "f2");
    }

    #[test]
    fn test_projection_wire_shape() {
        // The RPC adapter frames these for existing clients; field casing is
        // part of the contract.
        let sr = SimpleSentRequest {
            id: "r1".into(),
            recipient_public_key: "pk".into(),
            recipient_avatar: String::new(),
            recipient_display_name: "Bob".into(),
            recipient_changed_request_address: false,
            timestamp: 5,
        };
        let json = serde_json::to_value(&sr).unwrap();
        assert!(json.get("recipientPublicKey").is_some());
        assert!(json.get("recipientChangedRequestAddress").is_some());

        let rr = SimpleReceivedRequest {
            id: "r2".into(),
            requestor_pk: "pk".into(),
            requestor_avatar: String::new(),
            requestor_display_name: String::new(),
            response: "feed".into(),
            timestamp: 6,
        };
        let json = serde_json::to_value(&rr).unwrap();
        assert!(json.get("requestorPK").is_some());
    }
}
