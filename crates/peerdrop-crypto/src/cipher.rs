//! Authenticated chunk encryption.
//!
//! AES-256-GCM with a fresh random 12-byte nonce per chunk. The nonce is
//! generated inside `encrypt` and never accepted from the caller, so a
//! nonce cannot be reused under the same key by construction.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::CryptoError;
use crate::exchange::SharedKey;

/// Nonce size for AES-256-GCM.
pub const NONCE_SIZE: usize = 12;

/// Encrypted payload with the metadata needed for decryption.
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    /// AES-256-GCM ciphertext (includes the 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 12-byte nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
}

/// Symmetric cipher for one transfer session.
///
/// Built from the derived [`SharedKey`]; both peers construct an identical
/// cipher and use it for every chunk of the session.
#[derive(Clone)]
pub struct ChunkCipher {
    cipher: Aes256Gcm,
}

impl ChunkCipher {
    /// Build the session cipher from a derived shared key.
    pub fn new(key: &SharedKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Encrypt one plaintext chunk under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedChunk, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("AEAD encryption failed".into()))?;

        Ok(EncryptedChunk {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    /// Decrypt a chunk with the nonce it was framed with, verifying the
    /// authentication tag.
    pub fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce_bytes.len(),
            });
        }
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

/// Create a matched pair of `ChunkCipher`s for testing.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_cipher_pair() -> Result<(ChunkCipher, ChunkCipher), CryptoError> {
    let (a_key, b_key) = crate::exchange::perform_key_exchange()?;
    Ok((ChunkCipher::new(&a_key), ChunkCipher::new(&b_key)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (sender, receiver) = test_cipher_pair().unwrap();
        let plaintext = b"chunk of file data";

        let sealed = sender.encrypt(plaintext).unwrap();
        let opened = receiver.decrypt(&sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn roundtrip_works_in_both_directions() {
        let (a, b) = test_cipher_pair().unwrap();

        let sealed = b.encrypt(b"reply").unwrap();
        let opened = a.decrypt(&sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(opened, b"reply");
    }

    #[test]
    fn encrypt_empty_chunk() {
        let (sender, receiver) = test_cipher_pair().unwrap();

        let sealed = sender.encrypt(b"").unwrap();
        let opened = receiver.decrypt(&sealed.ciphertext, &sealed.nonce).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn encrypt_full_chunk() {
        let (sender, receiver) = test_cipher_pair().unwrap();
        let plaintext = vec![0xABu8; 16384];

        let sealed = sender.encrypt(&plaintext).unwrap();
        // AEAD tag appended to ciphertext
        assert_eq!(sealed.ciphertext.len(), plaintext.len() + 16);

        let opened = receiver.decrypt(&sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let (sender, _) = test_cipher_pair().unwrap();

        let first = sender.encrypt(b"same plaintext").unwrap();
        let second = sender.encrypt(b"same plaintext").unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn nonces_never_collide_in_practice() {
        let (sender, _) = test_cipher_pair().unwrap();
        let mut nonces = std::collections::HashSet::new();

        for _ in 0..1000 {
            let sealed = sender.encrypt(b"x").unwrap();
            assert!(nonces.insert(sealed.nonce), "nonce collision detected");
        }
    }

    #[test]
    fn any_flipped_bit_fails_authentication() {
        let (sender, receiver) = test_cipher_pair().unwrap();
        let sealed = sender.encrypt(b"integrity protected data").unwrap();

        for index in 0..sealed.ciphertext.len() {
            let mut tampered = sealed.ciphertext.clone();
            tampered[index] ^= 0x01;
            let result = receiver.decrypt(&tampered, &sealed.nonce);
            assert!(
                matches!(result, Err(CryptoError::Authentication)),
                "flip at byte {index} was not detected"
            );
        }
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let (sender, _) = test_cipher_pair().unwrap();
        let (_, wrong_receiver) = test_cipher_pair().unwrap();

        let sealed = sender.encrypt(b"secret").unwrap();
        let result = wrong_receiver.decrypt(&sealed.ciphertext, &sealed.nonce);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn decrypt_with_wrong_nonce_fails() {
        let (sender, receiver) = test_cipher_pair().unwrap();

        let sealed = sender.encrypt(b"secret").unwrap();
        let result = receiver.decrypt(&sealed.ciphertext, &[0u8; NONCE_SIZE]);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn decrypt_rejects_invalid_nonce_length() {
        let (_, receiver) = test_cipher_pair().unwrap();
        let result = receiver.decrypt(b"ciphertext", &[0u8; 8]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: 8
            })
        ));
    }

    #[test]
    fn decrypt_rejects_empty_ciphertext() {
        let (_, receiver) = test_cipher_pair().unwrap();
        // No room for the auth tag
        let result = receiver.decrypt(&[], &[0u8; NONCE_SIZE]);
        assert!(result.is_err());
    }
}
