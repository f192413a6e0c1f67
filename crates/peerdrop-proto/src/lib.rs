//! `PeerDrop` Wire Types
//!
//! Everything that crosses a socket lives here:
//! - The NDJSON relay protocol (`ClientFrame`/`ServerFrame`)
//! - Signaling payloads relayed opaquely between peers
//! - The binary chunk frame carried on the direct channel
//! - The transfer manifest control message
//!
//! The relay forwards signaling payloads verbatim and never sees file
//! content; the chunk frame is the only encoding that carries ciphertext.

pub mod frame;
pub mod manifest;
pub mod signal;

pub use frame::{
    CHUNK_SIZE, ChannelFrame, ChunkFrame, FrameError, MAX_FRAME_LEN, NONCE_LEN, TAG_LEN,
};
pub use manifest::TransferManifest;
pub use signal::{ClientFrame, DescriptionKind, ServerFrame, SessionDescription, SignalPayload};
