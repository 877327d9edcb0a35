//! Alias/passphrase accounts
//!
//! An account record is the identity's private keys sealed under a
//! passphrase-derived key, stored as an opaque text leaf at the alias path.
//! Anyone can read the record; only the passphrase opens it.
//!
//! Record layout: `base64( postcard( AccountRecord{salt, sealed} ) )` where
//! `sealed = [nonce (12 bytes)] + chacha20poly1305(identity_bytes)`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_SIZE;
use crate::error::{ApiError, ApiResult};
use crate::identity::Identity;

/// Domain separation for the passphrase KDF
const PASS_KDF_CONTEXT: &str = "backchannel-core account-seal v1";

/// Reported for every credential failure so a caller cannot tell a missing
/// alias from a wrong passphrase.
pub(crate) const BAD_CREDENTIALS: &str = "invalid alias or passphrase";

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    salt: [u8; 16],
    sealed: Vec<u8>,
}

fn derive_pass_key(pass: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut material = Vec::with_capacity(salt.len() + pass.len());
    material.extend_from_slice(salt);
    material.extend_from_slice(pass.as_bytes());
    blake3::derive_key(PASS_KDF_CONTEXT, &material)
}

/// Seal an identity's private material under a passphrase.
pub(crate) fn seal_identity(identity: &Identity, pass: &str) -> ApiResult<String> {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);

    let cipher = ChaCha20Poly1305::new(&derive_pass_key(pass, &salt).into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, identity.to_bytes().as_slice())
        .map_err(|e| ApiError::Crypto(format!("Account sealing failed: {}", e)))?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend_from_slice(&ciphertext);

    let bytes = postcard::to_allocvec(&AccountRecord { salt, sealed })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Recover an identity from a sealed account record.
pub(crate) fn open_identity(encoded: &str, pass: &str) -> ApiResult<Identity> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ApiError::Account("malformed account record".to_string()))?;
    let record: AccountRecord = postcard::from_bytes(&bytes)?;

    if record.sealed.len() < NONCE_SIZE {
        return Err(ApiError::Account("malformed account record".to_string()));
    }

    let cipher = ChaCha20Poly1305::new(&derive_pass_key(pass, &record.salt).into());
    let nonce = Nonce::from_slice(&record.sealed[..NONCE_SIZE]);

    let identity_bytes = cipher
        .decrypt(nonce, &record.sealed[NONCE_SIZE..])
        .map_err(|_| ApiError::Account(BAD_CREDENTIALS.to_string()))?;

    Identity::from_bytes(&identity_bytes)
}
