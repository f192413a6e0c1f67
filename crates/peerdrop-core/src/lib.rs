//! `PeerDrop` Core Library
//!
//! End-to-end encrypted peer-to-peer file transfer:
//! - Session identity generation and relay registration
//! - X25519 key exchange carried over the signaling relay
//! - Direct channel establishment from relayed setup metadata
//! - Chunked AES-256-GCM transfer with ordered reassembly
//! - The transfer state machine orchestrating all of the above
//!
//! The relay never sees plaintext: only opaque signaling payloads cross it.
//! Nothing in this crate survives process restart.

pub mod channel;
pub mod codec;
pub mod error;
pub mod identity;
pub mod relay;
pub mod session;
pub mod tracing_init;

pub use codec::ChunkReport;
pub use error::{ErrorKind, Result, TransferError};
pub use identity::SessionId;
pub use session::{
    Progress, ReceivedFile, Role, SessionCommand, SessionConfig, SessionHandle, SessionStatus,
    TransferPhase,
};
