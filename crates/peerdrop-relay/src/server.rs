//! Relay accept loop and per-connection protocol.
//!
//! Each connection gets a line-based reader parsing [`ClientFrame`]s and a
//! writer task draining its outbound queue. The identifier registered on a
//! connection is stamped as `from` on every signal it forwards, so clients
//! cannot spoof each other. Disconnect unregisters.

use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use peerdrop_core::SessionId;
use peerdrop_proto::{ClientFrame, ServerFrame};

use crate::registry::SessionRegistry;

/// Capacity of each connection's outbound frame queue.
const OUTBOUND_QUEUE: usize = 64;

/// Accept relay connections until the listener fails.
pub async fn serve(listener: TcpListener, registry: SessionRegistry) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "Relay connection accepted");
        tokio::spawn(handle_connection(stream, registry.clone()));
    }
}

async fn handle_connection(stream: TcpStream, registry: SessionRegistry) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server frame");
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
                || write_half.flush().await.is_err()
            {
                return;
            }
        }
    });

    let mut registered: Option<String> = None;
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<ClientFrame>(&line) {
            Ok(ClientFrame::Register { id }) => {
                if registered.is_some() {
                    let _ = tx
                        .send(ServerFrame::Error {
                            message: "already registered on this connection".into(),
                        })
                        .await;
                    continue;
                }
                if SessionId::from_str(&id).is_err() {
                    let _ = tx
                        .send(ServerFrame::Error {
                            message: "invalid session identifier".into(),
                        })
                        .await;
                    continue;
                }
                if registry.register(&id, tx.clone()).await {
                    registered = Some(id.clone());
                    let _ = tx.send(ServerFrame::Registered { id }).await;
                } else {
                    let _ = tx
                        .send(ServerFrame::Error {
                            message: "identifier already registered".into(),
                        })
                        .await;
                }
            }
            Ok(ClientFrame::Signal { target, signal }) => match &registered {
                Some(from) => {
                    registry.forward(from, &target, signal).await;
                }
                None => {
                    let _ = tx
                        .send(ServerFrame::Error {
                            message: "register before signaling".into(),
                        })
                        .await;
                }
            },
            Err(e) => {
                warn!(error = %e, "Malformed client frame");
                let _ = tx
                    .send(ServerFrame::Error {
                        message: "malformed frame".into(),
                    })
                    .await;
            }
        }
    }

    if let Some(id) = &registered {
        registry.unregister(id).await;
    }
    drop(tx);
    let _ = writer.await;
    debug!("Relay connection closed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    use peerdrop_core::relay::{self, RelayEvent};
    use peerdrop_proto::SignalPayload;

    /// Start a relay on an ephemeral port and return its address.
    async fn start_relay() -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, SessionRegistry::new()));
        addr.to_string()
    }

    async fn expect_registered(events: &mut mpsc::Receiver<RelayEvent>, id: &SessionId) {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            RelayEvent::Registered(acked) => assert_eq!(&acked, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn registers_and_forwards_between_clients() {
        let addr = start_relay().await;

        let a_id = SessionId::from_str("AAAAA1").unwrap();
        let b_id = SessionId::from_str("BBBBB2").unwrap();

        let (a_handle, mut a_events) = relay::connect(&addr, &a_id).await.unwrap();
        let (_b_handle, mut b_events) = relay::connect(&addr, &b_id).await.unwrap();
        expect_registered(&mut a_events, &a_id).await;
        expect_registered(&mut b_events, &b_id).await;

        a_handle
            .signal(
                &b_id,
                SignalPayload::PublicKey {
                    public_key: "jwk".into(),
                },
            )
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(5), b_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            RelayEvent::Signal { from, payload } => {
                assert_eq!(from, a_id.as_str());
                assert_eq!(
                    payload,
                    SignalPayload::PublicKey {
                        public_key: "jwk".into()
                    }
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_identifier_is_refused() {
        let addr = start_relay().await;
        let id = SessionId::from_str("CCCCC3").unwrap();

        let (_first, mut first_events) = relay::connect(&addr, &id).await.unwrap();
        expect_registered(&mut first_events, &id).await;

        let (_second, mut second_events) = relay::connect(&addr, &id).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), second_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            RelayEvent::Refused(message) => {
                assert!(message.contains("already registered"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signal_to_unknown_target_is_dropped() {
        let addr = start_relay().await;
        let a_id = SessionId::from_str("DDDDD4").unwrap();
        let ghost = SessionId::from_str("GHOST9").unwrap();

        let (a_handle, mut a_events) = relay::connect(&addr, &a_id).await.unwrap();
        expect_registered(&mut a_events, &a_id).await;

        a_handle
            .signal(
                &ghost,
                SignalPayload::PublicKey {
                    public_key: "jwk".into(),
                },
            )
            .await
            .unwrap();

        // No error, no echo: the signal just disappears.
        let outcome = tokio::time::timeout(Duration::from_millis(300), a_events.recv()).await;
        assert!(outcome.is_err(), "expected silence, got {outcome:?}");
    }

    #[tokio::test]
    async fn disconnect_frees_the_identifier() {
        let addr = start_relay().await;
        let id = SessionId::from_str("EEEEE5").unwrap();

        let (handle, mut events) = relay::connect(&addr, &id).await.unwrap();
        expect_registered(&mut events, &id).await;
        drop(handle);
        drop(events);

        // Give the server a moment to observe the disconnect.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (_handle, mut events) = relay::connect(&addr, &id).await.unwrap();
        expect_registered(&mut events, &id).await;
    }
}
