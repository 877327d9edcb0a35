//! Backchannel Core Library
//!
//! Privacy-preserving contact handshakes and messaging over a multi-writer
//! synced graph.
//!
//! ## Overview
//!
//! Backchannel lets two users establish an encrypted messaging channel
//! without any central matchmaker. A user publishes a throwaway rendezvous
//! node; anyone holding its address can deposit a handshake request there.
//! Accepting a request creates a pair of single-writer message feeds, one
//! per direction, and from then on both sides read each other's feed
//! directly. An observer of the shared graph sees only ciphertext and
//! unlinkable node ids.
//!
//! ## Core Principles
//!
//! - **Write-your-own-space**: every node is written by exactly one
//!   identity; "shared" state is two single-writer feeds read crosswise
//! - **Private indices**: who you talk to is recorded only under your own
//!   space, encrypted to yourself
//! - **Live projections**: consumers subscribe to derived views (requests,
//!   chats) that re-emit as the graph syncs
//!
//! ## Quick Start
//!
//! ```ignore
//! use backchannel_core::{actions, events, Session, SyncedStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SyncedStore::new();
//!     let session = Session::new(store);
//!     actions::register(&session, "alice", "hunter22").await?;
//!
//!     // Publish a rendezvous node and hand its address out of band
//!     let address = actions::generate_new_handshake_node(&session).await?;
//!     println!("reach me at {address}");
//!
//!     // Accept whatever arrives
//!     let requests = events::on_simpler_received_requests(&session)?;
//!     let mut stream = requests.subscribe();
//!     while let Some(batch) = stream.next().await {
//!         for req in batch {
//!             actions::accept_request(&session, &req.id).await?;
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod crypto;
pub mod error;
pub mod events;
pub mod identity;
pub mod jobs;
pub mod keys;
pub mod schema;
pub mod session;
pub mod store;
pub mod utils;

// Re-exports
pub use crypto::{CryptoProvider, EcdhCrypto, PairSecret};
pub use error::{ApiError, ApiResult};
pub use events::{ProjectionHandle, ProjectionStream, Teardown};
pub use identity::Identity;
pub use jobs::on_accepted_requests;
pub use schema::{
    Chat, ChatMessage, HandshakeRequest, Message, Outgoing, PartialOutgoing, ResponseState,
    SimpleReceivedRequest, SimpleSentRequest,
};
pub use session::Session;
pub use store::{ChildrenWatch, NodeRef, SyncedStore, Value, ValueWatch};
