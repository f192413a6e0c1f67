//! Error types for the transfer core.

use thiserror::Error;

use peerdrop_crypto::CryptoError;
use peerdrop_proto::FrameError;

/// Result type alias using [`TransferError`].
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors surfaced to the transfer state machine.
///
/// None of these are retried automatically; each one moves the session to
/// `Failed` and the operator must re-initiate the handshake.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Key import, agreement, or AEAD failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transport-level failure or unexpected close of the direct channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The relay connection failed or closed while still needed.
    #[error("Relay error: {0}")]
    Relay(String),

    /// A signaling or control message that could not be understood.
    #[error("Malformed signaling: {0}")]
    Signaling(String),

    /// A message arrived in a state that does not expect it.
    #[error("Protocol sequence violation during {phase}: {message}")]
    Sequence {
        phase: &'static str,
        message: String,
    },

    /// Malformed channel frame.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification exposed through session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    KeyFormat,
    KeyAgreement,
    Encryption,
    Authentication,
    Channel,
    Relay,
    Signaling,
    Sequence,
    Io,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeyFormat => "key-format",
            Self::KeyAgreement => "key-agreement",
            Self::Encryption => "encryption",
            Self::Authentication => "authentication",
            Self::Channel => "channel",
            Self::Relay => "relay",
            Self::Signaling => "signaling",
            Self::Sequence => "sequence",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransferError {
    /// Classify this error for status reporting.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(e) => match e {
                CryptoError::KeyFormat(_) => ErrorKind::KeyFormat,
                CryptoError::KeyAgreement(_) => ErrorKind::KeyAgreement,
                CryptoError::EncryptionFailed(_) | CryptoError::Serialization(_) => {
                    ErrorKind::Encryption
                }
                CryptoError::Authentication | CryptoError::InvalidNonceLength { .. } => {
                    ErrorKind::Authentication
                }
            },
            Self::Channel(_) => ErrorKind::Channel,
            Self::Relay(_) => ErrorKind::Relay,
            Self::Signaling(_) => ErrorKind::Signaling,
            Self::Sequence { .. } | Self::Frame(_) => ErrorKind::Sequence,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_errors_map_to_status_kinds() {
        let err = TransferError::from(CryptoError::KeyFormat("bad".into()));
        assert_eq!(err.kind(), ErrorKind::KeyFormat);

        let err = TransferError::from(CryptoError::Authentication);
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = TransferError::from(CryptoError::KeyAgreement("mismatch".into()));
        assert_eq!(err.kind(), ErrorKind::KeyAgreement);
    }

    #[test]
    fn sequence_errors_have_readable_display() {
        let err = TransferError::Sequence {
            phase: "ready",
            message: "chunk frame before key derivation".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Sequence);
        assert!(err.to_string().contains("ready"));
    }
}
