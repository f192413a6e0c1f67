//! `PeerDrop` Rendezvous Relay
//!
//! Routes opaque signaling payloads between registered sessions over an
//! NDJSON/TCP protocol. The relay sees connection-setup metadata only;
//! file content never crosses it, and what does cross it is opaque.

pub mod registry;
pub mod server;

pub use registry::SessionRegistry;
pub use server::serve;
