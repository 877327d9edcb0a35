//! Pairwise encryption for the contact protocol
//!
//! The protocol needs exactly three primitives: a commutative secret between
//! two identities, and encrypt/decrypt of short UTF-8 strings under such a
//! secret. [`CryptoProvider`] is that contract; [`EcdhCrypto`] implements it
//! with X25519 Diffie-Hellman, HKDF-SHA256 key derivation and
//! ChaCha20-Poly1305 AEAD.
//!
//! # Wire Format
//!
//! Ciphertexts are text so they can live in graph leaves:
//! `base64url_nopad( [nonce (12 bytes)] + [ciphertext + auth_tag] )`
//!
//! Commutativity matters: `secret(b_epub, a)` equals `secret(a_epub, b)`, so
//! both sides of a handshake decrypt the same `response` field with locally
//! available keys. The "self-secret" (an identity's secret with its own
//! `epub`) encrypts private index values only the owner can read.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{ApiError, ApiResult};
use crate::identity::{parse_epub, Identity};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"backchannel-pairwise-v1";

/// Symmetric key shared by exactly one pair of identities.
///
/// Opaque on purpose: callers derive it through a [`CryptoProvider`] and
/// hand it back for encrypt/decrypt, nothing else.
#[derive(Clone, PartialEq, Eq)]
pub struct PairSecret([u8; 32]);

impl PairSecret {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PairSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PairSecret(..)")
    }
}

/// Cryptographic contract consumed by actions, events and jobs.
///
/// `secret` must be commutative in the sense described in the module docs;
/// `encrypt`/`decrypt` must round-trip any UTF-8 string. Implementations are
/// synchronous: the cost is small against the store round-trips around them.
pub trait CryptoProvider: Send + Sync {
    /// Derive the pairwise secret between the local identity and another
    /// party's encryption public key (bs58 `epub` string).
    fn secret(&self, other_epub: &str, own: &Identity) -> ApiResult<PairSecret>;

    /// Encrypt UTF-8 plaintext into an opaque text ciphertext.
    fn encrypt(&self, plaintext: &str, secret: &PairSecret) -> ApiResult<String>;

    /// Recover the plaintext from a ciphertext produced by [`encrypt`].
    ///
    /// [`encrypt`]: CryptoProvider::encrypt
    fn decrypt(&self, ciphertext: &str, secret: &PairSecret) -> ApiResult<String>;

    /// The secret an identity shares with itself, used for private indices.
    fn self_secret(&self, own: &Identity) -> ApiResult<PairSecret> {
        self.secret(&own.epub(), own)
    }
}

/// Production [`CryptoProvider`]: X25519 + HKDF-SHA256 + ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcdhCrypto;

impl EcdhCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for EcdhCrypto {
    fn secret(&self, other_epub: &str, own: &Identity) -> ApiResult<PairSecret> {
        let other = parse_epub(other_epub)?;
        let shared = own.diffie_hellman(&other);
        Ok(PairSecret(derive_key(shared.as_bytes())))
    }

    fn encrypt(&self, plaintext: &str, secret: &PairSecret) -> ApiResult<String> {
        let cipher = ChaCha20Poly1305::new(secret.as_bytes().into());

        // Random nonce per encryption, prepended to the ciphertext
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ApiError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut data = nonce_bytes.to_vec();
        data.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(data))
    }

    fn decrypt(&self, ciphertext: &str, secret: &PairSecret) -> ApiResult<String> {
        let data = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|e| ApiError::DecryptionFailed(format!("Invalid ciphertext encoding: {}", e)))?;

        if data.len() < NONCE_SIZE {
            return Err(ApiError::DecryptionFailed(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let cipher = ChaCha20Poly1305::new(secret.as_bytes().into());
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

        let plaintext = cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|_| ApiError::DecryptionFailed("AEAD open failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ApiError::DecryptionFailed("Plaintext is not valid UTF-8".to_string()))
    }
}

/// Derive a 32-byte key from a Diffie-Hellman shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}
