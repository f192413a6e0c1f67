//! Key exchange protocol logic.
//!
//! Each side generates an ephemeral X25519 keypair per session, publishes
//! its public key as a JWK through the signaling relay, performs ECDH with
//! the peer's key, and derives the symmetric chunk key via HKDF-SHA256.
//! Both peers derive bit-identical keys from their respective
//! (own secret, peer public) inputs.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;
pub use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// HKDF info string for chunk key derivation.
const HKDF_INFO: &[u8] = b"peerdrop-transfer-key-v1";

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"peerdrop-hkdf-salt-v1";

/// JWK key type for octet key pairs.
const JWK_KTY: &str = "OKP";

/// JWK curve name.
const JWK_CRV: &str = "X25519";

/// Symmetric key shared by both peers after the handshake.
///
/// Zeroized on drop. Never serialized or transmitted; the only thing that
/// crosses the relay is each side's public key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref().ct_eq(other.0.as_ref()).into()
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Transmissible form of a public key: a JSON Web Key.
#[derive(Serialize, Deserialize)]
struct PublicKeyJwk {
    kty: String,
    crv: String,
    x: String,
}

/// An in-progress key exchange holding our ephemeral keypair.
///
/// The secret never leaves this struct; `derive` consumes it, so a keypair
/// cannot be reused across sessions.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    /// Generate a fresh ephemeral keypair.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Our public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Our public key in its transmissible JWK encoding.
    pub fn export_public_key(&self) -> Result<String, CryptoError> {
        export_public_key(&self.public)
    }

    /// Complete the exchange: X25519 ECDH with the peer's public key,
    /// then HKDF-SHA256 to the symmetric chunk key.
    pub fn derive(self, peer_public: &PublicKey) -> Result<SharedKey, CryptoError> {
        let shared = self.secret.diffie_hellman(peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement(
                "peer public key is a low-order point".into(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| CryptoError::KeyAgreement(e.to_string()))?;
        Ok(SharedKey(key))
    }
}

/// Serialize a public key as a JWK that round-trips through
/// [`import_public_key`].
pub fn export_public_key(public: &PublicKey) -> Result<String, CryptoError> {
    let jwk = PublicKeyJwk {
        kty: JWK_KTY.to_owned(),
        crv: JWK_CRV.to_owned(),
        x: URL_SAFE_NO_PAD.encode(public.as_bytes()),
    };
    serde_json::to_string(&jwk).map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// Parse a peer's JWK-encoded public key.
pub fn import_public_key(jwk: &str) -> Result<PublicKey, CryptoError> {
    let parsed: PublicKeyJwk =
        serde_json::from_str(jwk).map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    if parsed.kty != JWK_KTY || parsed.crv != JWK_CRV {
        return Err(CryptoError::KeyFormat(format!(
            "unsupported key type {}/{}",
            parsed.kty, parsed.crv
        )));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(parsed.x.as_bytes())
        .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::KeyFormat(format!("expected 32 key bytes, got {}", b.len()))
    })?;
    Ok(PublicKey::from(arr))
}

/// Perform a complete key exchange and return both derived keys.
///
/// Convenience for tests; in production each side creates a `KeyExchange`,
/// sends its exported public key, and calls `derive` with the peer's.
#[cfg(any(test, feature = "test-utils"))]
pub fn perform_key_exchange() -> Result<(SharedKey, SharedKey), CryptoError> {
    let a = KeyExchange::new();
    let b = KeyExchange::new();

    let a_public = *a.public_key();
    let b_public = *b.public_key();

    let a_key = a.derive(&b_public)?;
    let b_key = b.derive(&a_public)?;
    Ok((a_key, b_key))
}
