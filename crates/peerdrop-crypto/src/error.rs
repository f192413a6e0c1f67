//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Malformed public key: {0}")]
    KeyFormat(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Ciphertext failed authentication (corrupted or tampered data)")]
    Authentication,

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),
}
