//! Relay protocol frames and signaling payloads.
//!
//! The relay protocol is NDJSON: one JSON object per line over a reliable
//! stream. Clients register a session identifier and exchange opaque
//! signaling payloads addressed by identifier; the relay stamps the sender
//! identifier on forwarded signals so peers cannot spoof each other.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Signaling payload relayed verbatim between peers.
///
/// Encoded as single-key objects on the wire: `{"publicKey": ...}`,
/// `{"sessionDescription": ...}`, `{"candidate": ...}`. The relay never
/// inspects these. Arrival order between distinct payload kinds is not
/// guaranteed; consumers must tolerate any interleaving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    /// A JWK-encoded ephemeral public key.
    PublicKey {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    /// Direct-channel offer or answer.
    Description {
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },
    /// An additional endpoint the answering side may try.
    Candidate { candidate: SocketAddr },
}

/// Direct-channel setup metadata exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    /// Address the offering side listens on; echoed back in the answer.
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Claim a session identifier as this connection's address.
    Register { id: String },
    /// Forward a signaling payload to the target session.
    Signal { target: String, signal: SignalPayload },
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Registration acknowledged.
    Registered { id: String },
    /// A signaling payload addressed to this session. `from` is stamped by
    /// the relay from the sending connection's registration.
    Signal { from: String, signal: SignalPayload },
    /// Application-level refusal, e.g. an identifier already in use.
    Error { message: String },
}
