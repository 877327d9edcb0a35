//! Session identity: signing keypair plus encryption keypair
//!
//! An identity is `{pub, priv, epub, epriv}`: an Ed25519 signing pair whose
//! public half is the identity's address in the graph, and an X25519 pair
//! used for pairwise secret derivation. Public halves travel as bs58 strings.

use ed25519_dalek::{SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};

use crate::error::{ApiError, ApiResult};

/// Keypairs backing one authenticated session.
///
/// Created by account registration, reloaded by authentication, dropped on
/// logout. The signing half identifies the session in the graph; the
/// encryption half never leaves this struct except as a Diffie-Hellman
/// output.
pub struct Identity {
    /// Ed25519 signing key (`priv`)
    signing: SigningKey,
    /// X25519 encryption secret (`epriv`)
    encryption: StaticSecret,
}

impl Identity {
    /// Generate a fresh identity from the system RNG
    pub fn generate() -> Self {
        // getrandom directly, avoiding rand version conflicts with dalek
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        let signing = SigningKey::from_bytes(&seed);

        let mut eseed = [0u8; 32];
        getrandom::getrandom(&mut eseed).expect("Failed to get random bytes");
        let encryption = StaticSecret::from(eseed);

        Self { signing, encryption }
    }

    /// Signing public key (`pub`) as a bs58 string
    pub fn pub_key(&self) -> String {
        bs58::encode(self.signing.verifying_key().as_bytes()).into_string()
    }

    /// Encryption public key (`epub`) as a bs58 string
    pub fn epub(&self) -> String {
        bs58::encode(X25519Public::from(&self.encryption).as_bytes()).into_string()
    }

    /// Raw verifying key, for callers that need the key itself
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Diffie-Hellman against another identity's encryption public key.
    ///
    /// X25519 makes this commutative: `a.diffie_hellman(b_epub)` and
    /// `b.diffie_hellman(a_epub)` agree, which is what lets both sides of a
    /// handshake decrypt the same `response` ciphertext.
    pub fn diffie_hellman(&self, other: &X25519Public) -> SharedSecret {
        self.encryption.diffie_hellman(other)
    }

    /// Serialize the private material to bytes
    ///
    /// Format: [ed25519_seed: 32 bytes][x25519_secret: 32 bytes]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.signing.as_bytes());
        bytes.extend_from_slice(self.encryption.as_bytes());
        bytes
    }

    /// Deserialize an identity from bytes
    pub fn from_bytes(bytes: &[u8]) -> ApiResult<Self> {
        if bytes.len() != 64 {
            return Err(ApiError::Crypto(format!(
                "Identity data must be 64 bytes, got {}",
                bytes.len()
            )));
        }

        let seed: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| ApiError::Crypto("Invalid signing seed".to_string()))?;
        let eseed: [u8; 32] = bytes[32..]
            .try_into()
            .map_err(|_| ApiError::Crypto("Invalid encryption secret".to_string()))?;

        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
            encryption: StaticSecret::from(eseed),
        })
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(self.signing.as_bytes()),
            encryption: self.encryption.clone(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("pub", &self.pub_key())
            .field("epub", &self.epub())
            .finish_non_exhaustive()
    }
}

/// Decode a bs58 `epub` string into an X25519 public key
pub fn parse_epub(epub: &str) -> ApiResult<X25519Public> {
    let bytes = bs58::decode(epub)
        .into_vec()
        .map_err(|e| ApiError::Crypto(format!("Invalid epub encoding: {}", e)))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ApiError::Crypto(format!("epub must decode to 32 bytes, got {}", bytes.len())))?;
    Ok(X25519Public::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id = Identity::generate();
        assert!(!id.pub_key().is_empty());
        assert!(!id.epub().is_empty());
        assert_ne!(id.pub_key(), id.epub());
    }

    #[test]
    fn test_generation_is_random() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.pub_key(), b.pub_key());
        assert_ne!(a.epub(), b.epub());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let id = Identity::generate();
        let recovered = Identity::from_bytes(&id.to_bytes()).expect("roundtrip");
        assert_eq!(id.pub_key(), recovered.pub_key());
        assert_eq!(id.epub(), recovered.epub());
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(Identity::from_bytes(&[0u8; 10]).is_err());
        assert!(Identity::from_bytes(&[0u8; 65]).is_err());
    }

    #[test]
    fn test_parse_epub_roundtrip() {
        let id = Identity::generate();
        let parsed = parse_epub(&id.epub()).expect("parse");
        assert_eq!(
            bs58::encode(parsed.as_bytes()).into_string(),
            id.epub()
        );
    }

    #[test]
    fn test_parse_epub_rejects_garbage() {
        assert!(parse_epub("not base58 !!!").is_err());
        assert!(parse_epub("abc").is_err());
    }

    #[test]
    fn test_diffie_hellman_commutes() {
        let a = Identity::generate();
        let b = Identity::generate();

        let ab = a.diffie_hellman(&parse_epub(&b.epub()).unwrap());
        let ba = b.diffie_hellman(&parse_epub(&a.epub()).unwrap());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let id = Identity::generate();
        let rendered = format!("{:?}", id);
        assert!(rendered.contains(&id.pub_key()));
        assert!(!rendered.contains("signing"));
    }
}
