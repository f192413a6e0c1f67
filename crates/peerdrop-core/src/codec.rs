//! Chunk codec: file splitting, per-chunk encryption, and ordered
//! reassembly.
//!
//! The sender reads fixed-size plaintext chunks and seals each one into a
//! [`ChunkFrame`]; the receiver queues frames in arrival order and decrypts
//! them all once the manifest arrives. Any authentication failure aborts
//! the whole assembly; partial data is never returned.

use std::path::Path;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use peerdrop_crypto::ChunkCipher;
use peerdrop_proto::{CHUNK_SIZE, ChunkFrame, NONCE_LEN, TAG_LEN, TransferManifest};

use crate::error::{Result, TransferError};

/// Cipher label reported with each chunk record.
const METHOD: &str = "AES-256-GCM";

// The wire frame and the cipher must agree on the nonce length.
const _: () = assert!(NONCE_LEN == peerdrop_crypto::NONCE_SIZE);

/// Structured record of the most recent chunk processed, exposed to the
/// presentation layer as plain data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    pub method: &'static str,
    /// Zero-based chunk index.
    pub chunk_number: u64,
    /// Plaintext bytes in this chunk.
    pub original_size: usize,
    /// Ciphertext bytes including the auth tag.
    pub encrypted_size: usize,
    pub nonce_size: usize,
}

/// Reads a file as fixed-size plaintext chunks.
pub struct FileChunker {
    file: File,
    buf: Vec<u8>,
}

impl FileChunker {
    /// Open `path` and return the chunker plus the file's total size.
    pub async fn open(path: &Path) -> Result<(Self, u64)> {
        let file = File::open(path).await?;
        let total = file.metadata().await?.len();
        Ok((
            Self {
                file,
                buf: vec![0; CHUNK_SIZE],
            },
            total,
        ))
    }

    /// Next plaintext chunk, or `None` at end of file. Every chunk except
    /// possibly the last is exactly `CHUNK_SIZE` bytes.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut filled = 0;
        loop {
            let n = self.file.read(&mut self.buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == CHUNK_SIZE {
                break;
            }
        }
        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(self.buf[..filled].to_vec()))
        }
    }
}

/// Encrypt one plaintext chunk into its wire frame.
pub fn encrypt_chunk(
    cipher: &ChunkCipher,
    plaintext: &[u8],
    chunk_number: u64,
) -> Result<(ChunkFrame, ChunkReport)> {
    debug_assert!(plaintext.len() <= CHUNK_SIZE);
    let sealed = cipher.encrypt(plaintext)?;
    let report = ChunkReport {
        method: METHOD,
        chunk_number,
        original_size: plaintext.len(),
        encrypted_size: sealed.ciphertext.len(),
        nonce_size: sealed.nonce.len(),
    };
    Ok((
        ChunkFrame {
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        },
        report,
    ))
}

/// Accumulates encrypted frames in arrival order and reassembles the file
/// once the manifest arrives.
#[derive(Default)]
pub struct ChunkAssembler {
    frames: Vec<ChunkFrame>,
    encrypted_bytes: u64,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one frame; returns a report for status display.
    pub fn push(&mut self, frame: ChunkFrame) -> ChunkReport {
        self.encrypted_bytes += frame.ciphertext.len() as u64;
        let report = ChunkReport {
            method: METHOD,
            chunk_number: self.frames.len() as u64,
            original_size: frame.ciphertext.len().saturating_sub(TAG_LEN),
            encrypted_size: frame.ciphertext.len(),
            nonce_size: frame.nonce.len(),
        };
        self.frames.push(frame);
        report
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total ciphertext bytes queued so far.
    pub fn encrypted_bytes(&self) -> u64 {
        self.encrypted_bytes
    }

    /// Decrypt all queued frames in arrival order and concatenate them.
    ///
    /// The assembled length must match the manifest's declared total; a
    /// mismatch means frames were lost and the file must not be handed to
    /// the caller as if complete.
    pub fn finalize(self, cipher: &ChunkCipher, manifest: &TransferManifest) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(usize::try_from(manifest.total_size).unwrap_or(0));
        for frame in &self.frames {
            let plaintext = cipher.decrypt(&frame.ciphertext, &frame.nonce)?;
            data.extend_from_slice(&plaintext);
        }
        if data.len() as u64 != manifest.total_size {
            return Err(TransferError::Sequence {
                phase: "finalize",
                message: format!(
                    "assembled {} bytes but manifest declared {}",
                    data.len(),
                    manifest.total_size
                ),
            });
        }
        Ok(data)
    }
}
