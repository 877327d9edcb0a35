//! Error types for Backchannel operations

use thiserror::Error;

/// Main error type for Backchannel protocol operations
#[derive(Error, Debug)]
pub enum ApiError {
    /// Operation requires an authenticated session
    #[error("Not authenticated")]
    NotAuth,

    /// A session is already authenticated
    #[error("Already authenticated")]
    AlreadyAuth,

    /// Logout left the identity in place
    #[error("Logout did not clear the session identity")]
    UnsuccessfulLogout,

    /// A handshake with this recipient is already established
    #[error("Already handshaked with this recipient")]
    AlreadyHandshaked,

    /// A previous request to this recipient is still outstanding
    #[error("A handshake request to this recipient is still outstanding")]
    AlreadyRequestedHandshake,

    /// The supplied handshake address is not the recipient's current one
    #[error("Handshake address is stale: {0}")]
    StaleHandshakeAddress(String),

    /// The request id does not resolve to a valid handshake request
    #[error("Tried to accept an invalid request: {0}")]
    TriedToAcceptAnInvalidRequest(String),

    /// Store write failed while recording the acceptance index
    #[error("Could not accept request: {0}")]
    CouldntAcceptRequest(String),

    /// Store write failed while overwriting the request response
    #[error("Could not put request response: {0}")]
    CouldntPutRequestResponse(String),

    /// Store write failed while publishing the handshake request
    #[error("Could not send request: {0}")]
    CouldntSendRequest(String),

    /// Malformed argument, rejected before any write
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Account creation/authentication failed
    #[error("Account error: {0}")]
    Account(String),

    /// Error during store operations
    #[error("Store error: {0}")]
    Store(String),

    /// A record or index entry was expected but absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl ApiError {
    /// Stable wire code for the RPC adapter, for the variants that carry one.
    ///
    /// Ambient store/crypto errors have no protocol-level code and map to
    /// `None`; the adapter is expected to fall back to the display message.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::NotAuth => Some("NOT_AUTH"),
            ApiError::AlreadyAuth => Some("ALREADY_AUTH"),
            ApiError::UnsuccessfulLogout => Some("UNSUCCESSFUL_LOGOUT"),
            ApiError::AlreadyHandshaked => Some("ALREADY_HANDSHAKED"),
            ApiError::AlreadyRequestedHandshake => Some("ALREADY_REQUESTED_HANDSHAKE"),
            ApiError::StaleHandshakeAddress(_) => Some("STALE_HANDSHAKE_ADDRESS"),
            ApiError::TriedToAcceptAnInvalidRequest(_) => {
                Some("TRIED_TO_ACCEPT_AN_INVALID_REQUEST")
            }
            ApiError::CouldntAcceptRequest(_) => Some("COULDNT_ACCEPT_REQUEST"),
            ApiError::CouldntPutRequestResponse(_) => Some("COULDNT_PUT_REQUEST_RESPONSE"),
            ApiError::CouldntSendRequest(_) => Some("COULDNT_SENT_REQUEST"),
            _ => None,
        }
    }
}

/// Result type alias using ApiError
pub type ApiResult<T> = Result<T, ApiError>;
