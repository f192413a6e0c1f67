//! `PeerDrop` E2E Encryption Library
//!
//! Cryptographic primitives for end-to-end encrypted file transfer between
//! two peers, with the rendezvous relay unable to see plaintext.
//!
//! ## Crypto primitives
//!
//! - **Exchange**: X25519 ephemeral ECDH per session, public keys carried
//!   as JWK through the signaling relay
//! - **Derivation**: HKDF-SHA256 over the ECDH shared secret
//! - **Encryption**: AES-256-GCM AEAD, fresh random 12-byte nonce per chunk

pub mod cipher;
pub mod error;
pub mod exchange;

pub use cipher::{ChunkCipher, EncryptedChunk, NONCE_SIZE};
#[cfg(any(test, feature = "test-utils"))]
pub use cipher::test_cipher_pair;
pub use error::CryptoError;
pub use exchange::{KeyExchange, PublicKey, SharedKey, export_public_key, import_public_key};
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::perform_key_exchange;
