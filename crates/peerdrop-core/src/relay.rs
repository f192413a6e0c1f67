//! Relay client: registration and signaling over NDJSON/TCP.
//!
//! The relay carries only opaque signaling payloads; file content never
//! touches it. One reader and one writer task per connection, bridged to
//! the session loop with channels, so the session is driven purely by
//! events and can be tested without a socket.

use std::net::IpAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use peerdrop_proto::{ClientFrame, ServerFrame, SignalPayload};

use crate::error::{Result, TransferError};
use crate::identity::SessionId;

/// Events from the relay connection, delivered to the session loop.
#[derive(Debug)]
pub enum RelayEvent {
    /// The relay acknowledged our registration.
    Registered(SessionId),
    /// A signaling payload addressed to us. `from` is the sender identifier
    /// stamped by the relay.
    Signal { from: String, payload: SignalPayload },
    /// The relay refused a request (e.g. identifier already taken).
    Refused(String),
    /// A frame that could not be parsed; treated as malformed signaling.
    Malformed(String),
    /// The relay connection closed (`None` means clean EOF).
    Closed(Option<String>),
}

/// Outbound handle for sending signals through the relay.
#[derive(Clone)]
pub struct RelayHandle {
    outbound: mpsc::Sender<ClientFrame>,
    local_ip: IpAddr,
}

impl RelayHandle {
    /// Build a handle from raw parts. Used by custom signaling transports
    /// and by tests that drive a session without a socket.
    pub fn from_parts(outbound: mpsc::Sender<ClientFrame>, local_ip: IpAddr) -> Self {
        Self { outbound, local_ip }
    }

    /// Queue a signaling payload for the given target session.
    pub async fn signal(&self, target: &SessionId, payload: SignalPayload) -> Result<()> {
        self.outbound
            .send(ClientFrame::Signal {
                target: target.to_string(),
                signal: payload,
            })
            .await
            .map_err(|_| TransferError::Relay("relay connection closed".into()))
    }

    /// Local IP of the relay socket. The session advertises this address
    /// in its channel offer, since it is the interface the peer network
    /// can reach us on.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }
}

/// Connect to the relay, register `id`, and spawn the I/O tasks.
///
/// Registration is acknowledged asynchronously: the caller observes
/// [`RelayEvent::Registered`] (or [`RelayEvent::Refused`]) on the returned
/// event stream.
pub async fn connect(
    addr: &str,
    id: &SessionId,
) -> Result<(RelayHandle, mpsc::Receiver<RelayEvent>)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransferError::Relay(format!("connect to {addr}: {e}")))?;
    let local_ip = stream
        .local_addr()
        .map_err(|e| TransferError::Relay(e.to_string()))?
        .ip();
    let (read_half, write_half) = stream.into_split();

    let (out_tx, out_rx) = mpsc::channel::<ClientFrame>(32);
    let (event_tx, event_rx) = mpsc::channel::<RelayEvent>(64);

    out_tx
        .send(ClientFrame::Register { id: id.to_string() })
        .await
        .map_err(|_| TransferError::Relay("relay connection closed".into()))?;
    debug!(id = %id, relay = addr, "Registering with relay");

    tokio::spawn(write_loop(write_half, out_rx));
    tokio::spawn(read_loop(read_half, event_tx));

    Ok((RelayHandle { outbound: out_tx, local_ip }, event_rx))
}

/// Drain the outbound queue onto the socket as NDJSON lines.
async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<ClientFrame>) {
    while let Some(frame) = rx.recv().await {
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode relay frame");
                continue;
            }
        };
        if half.write_all(line.as_bytes()).await.is_err()
            || half.write_all(b"\n").await.is_err()
            || half.flush().await.is_err()
        {
            warn!("Relay write failed; stopping writer");
            return;
        }
    }
}

/// Parse NDJSON lines from the relay into events until EOF or error.
async fn read_loop(half: OwnedReadHalf, events: mpsc::Sender<RelayEvent>) {
    let mut lines = BufReader::new(half).lines();
    loop {
        let event = match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<ServerFrame>(&line) {
                Ok(ServerFrame::Registered { id }) => match id.parse::<SessionId>() {
                    Ok(id) => RelayEvent::Registered(id),
                    Err(e) => RelayEvent::Malformed(e.to_string()),
                },
                Ok(ServerFrame::Signal { from, signal }) => RelayEvent::Signal {
                    from,
                    payload: signal,
                },
                Ok(ServerFrame::Error { message }) => RelayEvent::Refused(message),
                Err(e) => RelayEvent::Malformed(e.to_string()),
            },
            Ok(None) => {
                let _ = events.send(RelayEvent::Closed(None)).await;
                return;
            }
            Err(e) => {
                let _ = events.send(RelayEvent::Closed(Some(e.to_string()))).await;
                return;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}
