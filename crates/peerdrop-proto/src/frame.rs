//! Binary framing for the direct channel.
//!
//! A channel message is either binary chunk data or a UTF-8 control payload,
//! distinguished by a one-byte marker. An encrypted chunk travels as a
//! single [`ChunkFrame`]: the nonce and the ciphertext it belongs to framed
//! together, so the pairing never depends on message arrival order.

use thiserror::Error;

/// Fixed plaintext chunk size in bytes. Protocol constant, not negotiated.
pub const CHUNK_SIZE: usize = 16384;

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Largest encoded chunk frame: nonce plus a full chunk's ciphertext and tag.
pub const MAX_FRAME_LEN: usize = NONCE_LEN + CHUNK_SIZE + TAG_LEN;

/// Marker byte for UTF-8 control payloads.
const MARKER_CONTROL: u8 = 0x01;

/// Marker byte for binary chunk payloads.
const MARKER_DATA: u8 = 0x02;

/// Framing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need at least {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("frame oversized: {actual} bytes exceeds maximum {max}")]
    Oversized { actual: usize, max: usize },

    #[error("unknown frame marker {0:#04x}")]
    UnknownMarker(u8),

    #[error("control payload is not valid UTF-8")]
    ControlNotUtf8,
}

/// One encrypted chunk as it travels on the wire.
///
/// Layout: `nonce (12 bytes) || ciphertext`. The ciphertext includes the
/// authentication tag, so a valid frame is never shorter than
/// `NONCE_LEN + TAG_LEN` and never longer than [`MAX_FRAME_LEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl ChunkFrame {
    /// Serialize the frame to its wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse a frame from its wire layout, rejecting truncated and
    /// oversized input.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(FrameError::Truncated {
                needed: NONCE_LEN + TAG_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversized {
                actual: bytes.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_LEN..].to_vec(),
        })
    }
}

/// A message on the direct channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// UTF-8 control payload (the transfer manifest).
    Control(String),
    /// Binary payload (an encoded [`ChunkFrame`]).
    Data(Vec<u8>),
}

impl ChannelFrame {
    /// Serialize to `marker || payload`. The transport adds length framing.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Control(text) => {
                let mut out = Vec::with_capacity(1 + text.len());
                out.push(MARKER_CONTROL);
                out.extend_from_slice(text.as_bytes());
                out
            }
            Self::Data(bytes) => {
                let mut out = Vec::with_capacity(1 + bytes.len());
                out.push(MARKER_DATA);
                out.extend_from_slice(bytes);
                out
            }
        }
    }

    /// Parse `marker || payload`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&marker, payload) = bytes.split_first().ok_or(FrameError::Truncated {
            needed: 1,
            actual: 0,
        })?;
        match marker {
            MARKER_CONTROL => String::from_utf8(payload.to_vec())
                .map(Self::Control)
                .map_err(|_| FrameError::ControlNotUtf8),
            MARKER_DATA => Ok(Self::Data(payload.to_vec())),
            other => Err(FrameError::UnknownMarker(other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_round_trips() {
        let frame = ChunkFrame {
            nonce: [7u8; NONCE_LEN],
            ciphertext: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
        };
        let decoded = ChunkFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn chunk_frame_rejects_truncated_input() {
        let result = ChunkFrame::decode(&[0u8; NONCE_LEN + TAG_LEN - 1]);
        assert_eq!(
            result,
            Err(FrameError::Truncated {
                needed: NONCE_LEN + TAG_LEN,
                actual: NONCE_LEN + TAG_LEN - 1,
            })
        );
    }

    #[test]
    fn chunk_frame_rejects_oversized_input() {
        let result = ChunkFrame::decode(&vec![0u8; MAX_FRAME_LEN + 1]);
        assert!(matches!(result, Err(FrameError::Oversized { .. })));
    }

    #[test]
    fn chunk_frame_accepts_maximum_size() {
        let frame = ChunkFrame {
            nonce: [0u8; NONCE_LEN],
            ciphertext: vec![0u8; CHUNK_SIZE + TAG_LEN],
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), MAX_FRAME_LEN);
        assert!(ChunkFrame::decode(&encoded).is_ok());
    }

    #[test]
    fn channel_frame_markers_round_trip() {
        let control = ChannelFrame::Control("{\"done\":true}".into());
        let encoded = control.encode();
        assert_eq!(encoded[0], MARKER_CONTROL);
        assert_eq!(ChannelFrame::decode(&encoded).unwrap(), control);

        let data = ChannelFrame::Data(vec![0xAA, 0xBB]);
        let encoded = data.encode();
        assert_eq!(encoded[0], MARKER_DATA);
        assert_eq!(ChannelFrame::decode(&encoded).unwrap(), data);
    }

    #[test]
    fn channel_frame_rejects_unknown_marker() {
        assert_eq!(
            ChannelFrame::decode(&[0x7F, 1, 2]),
            Err(FrameError::UnknownMarker(0x7F))
        );
    }

    #[test]
    fn channel_frame_rejects_empty_input() {
        assert!(matches!(
            ChannelFrame::decode(&[]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn control_frame_must_be_utf8() {
        let result = ChannelFrame::decode(&[MARKER_CONTROL, 0xFF, 0xFE]);
        assert_eq!(result, Err(FrameError::ControlNotUtf8));
    }
}
