//! In-memory session registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use peerdrop_proto::{ServerFrame, SignalPayload};

/// Thread-safe map of registered session identifiers to their outbound
/// frame queues.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, mpsc::Sender<ServerFrame>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identifier. Refused when already taken, so two clients
    /// cannot claim the same rendezvous address.
    pub async fn register(&self, id: &str, tx: mpsc::Sender<ServerFrame>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            warn!(id, "Identifier already registered");
            return false;
        }
        sessions.insert(id.to_owned(), tx);
        info!(id, "Session registered");
        true
    }

    /// Remove a session.
    pub async fn unregister(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            info!(id, "Session unregistered");
        }
    }

    /// Forward a signaling payload verbatim, stamping the sender
    /// identifier. Signals for unknown targets are dropped; the protocol
    /// promises no delivery guarantee.
    pub async fn forward(&self, from: &str, target: &str, signal: SignalPayload) -> bool {
        let tx = self.sessions.read().await.get(target).cloned();
        match tx {
            Some(tx) => {
                let delivered = tx
                    .send(ServerFrame::Signal {
                        from: from.to_owned(),
                        signal,
                    })
                    .await
                    .is_ok();
                debug!(from, target, delivered, "Signal forwarded");
                delivered
            }
            None => {
                debug!(from, target, "Dropping signal for unknown target");
                false
            }
        }
    }

    /// Count of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
