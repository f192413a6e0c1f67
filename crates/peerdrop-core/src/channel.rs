//! Direct channel: the ordered, message-oriented transport that carries
//! encrypted chunks between peers.
//!
//! TCP realization with `u32` length-prefixed, marker-tagged messages. The
//! offering side binds an ephemeral listener (`serve`) and advertises its
//! endpoints through the relay; the answering side dials the candidates in
//! order (`dial`). TCP preserves the ordering the chunk protocol relies on.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use peerdrop_proto::{ChannelFrame, MAX_FRAME_LEN};

use crate::error::{Result, TransferError};

/// Capacity of the outbound frame queue. Kept small so `send` exerts
/// backpressure on the chunk pump.
const SEND_QUEUE: usize = 8;

/// Per-endpoint connect timeout while dialing candidates.
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest channel message we accept: a marker byte plus a full chunk frame.
const MAX_MESSAGE_LEN: usize = MAX_FRAME_LEN + 1;

/// Lifecycle and payload events from the direct channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel is open end to end.
    Open,
    /// One ordered message from the peer.
    Message(ChannelFrame),
    /// Clean close by the peer.
    Closed,
    /// Transport failure.
    Error(String),
}

/// Outbound half of an open (or opening) channel.
///
/// `send` awaits queue capacity, so a throttled channel slows the producer
/// down instead of buffering without bound; queued frames are never
/// reordered.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<ChannelFrame>,
}

impl ChannelHandle {
    /// Queue one message for transmission, waiting for capacity.
    pub async fn send(&self, frame: ChannelFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransferError::Channel("channel closed".into()))
    }
}

/// Offerer side: bind an ephemeral listener and accept exactly one peer.
///
/// Returns the bound port so the caller can advertise endpoints. Events
/// begin with [`ChannelEvent::Open`] once the peer connects; messages
/// queued before that are transmitted after the accept.
pub async fn serve() -> Result<(u16, ChannelHandle, mpsc::Receiver<ChannelEvent>)> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
    let port = listener.local_addr()?.port();

    let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Direct channel accepted");
                run(stream, out_rx, event_tx).await;
            }
            Err(e) => {
                let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
            }
        }
    });

    Ok((port, ChannelHandle { outbound: out_tx }, event_rx))
}

/// Answerer side: try each candidate endpoint in order until one connects.
pub async fn dial(
    endpoints: &[SocketAddr],
) -> Result<(ChannelHandle, mpsc::Receiver<ChannelEvent>)> {
    for endpoint in endpoints {
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                debug!(%endpoint, "Direct channel connected");
                let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
                let (event_tx, event_rx) = mpsc::channel(64);
                tokio::spawn(run(stream, out_rx, event_tx));
                return Ok((ChannelHandle { outbound: out_tx }, event_rx));
            }
            Ok(Err(e)) => debug!(%endpoint, error = %e, "Candidate refused"),
            Err(_) => debug!(%endpoint, "Candidate timed out"),
        }
    }
    Err(TransferError::Channel(
        "no candidate endpoint was reachable".into(),
    ))
}

/// Pump one open socket: a writer task drains the outbound queue (and keeps
/// draining after the handle is dropped, so queued frames are never lost),
/// while the reader emits ordered events until EOF or error.
async fn run(
    stream: TcpStream,
    mut out_rx: mpsc::Receiver<ChannelFrame>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    if events.send(ChannelEvent::Open).await.is_err() {
        return;
    }

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let payload = frame.encode();
            #[allow(clippy::cast_possible_truncation)]
            let len = payload.len() as u32; // bounded by MAX_MESSAGE_LEN
            if write_half.write_u32(len).await.is_err()
                || write_half.write_all(&payload).await.is_err()
                || write_half.flush().await.is_err()
            {
                warn!("Channel write failed; stopping writer");
                return;
            }
        }
    });

    loop {
        let len = match read_half.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let _ = events.send(ChannelEvent::Closed).await;
                return;
            }
            Err(e) => {
                let _ = events.send(ChannelEvent::Error(e.to_string())).await;
                return;
            }
        };
        if len == 0 || len > MAX_MESSAGE_LEN {
            let _ = events
                .send(ChannelEvent::Error(format!("invalid message length {len}")))
                .await;
            return;
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = read_half.read_exact(&mut payload).await {
            let _ = events.send(ChannelEvent::Error(e.to_string())).await;
            return;
        }
        match ChannelFrame::decode(&payload) {
            Ok(frame) => {
                if events.send(ChannelEvent::Message(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(ChannelEvent::Error(e.to_string())).await;
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn connected_pair() -> (
        ChannelHandle,
        mpsc::Receiver<ChannelEvent>,
        ChannelHandle,
        mpsc::Receiver<ChannelEvent>,
    ) {
        let (port, server_handle, mut server_events) = serve().await.unwrap();
        let endpoint: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let (client_handle, mut client_events) = dial(&[endpoint]).await.unwrap();

        assert!(matches!(
            client_events.recv().await.unwrap(),
            ChannelEvent::Open
        ));
        assert!(matches!(
            server_events.recv().await.unwrap(),
            ChannelEvent::Open
        ));
        (server_handle, server_events, client_handle, client_events)
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (server, _server_events, client, mut client_events) = connected_pair().await;
        drop(client);

        for i in 0..20u8 {
            server
                .send(ChannelFrame::Data(vec![i; 16 + usize::from(i)]))
                .await
                .unwrap();
        }
        for i in 0..20u8 {
            match client_events.recv().await.unwrap() {
                ChannelEvent::Message(ChannelFrame::Data(bytes)) => {
                    assert_eq!(bytes, vec![i; 16 + usize::from(i)]);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn control_and_data_are_distinguished() {
        let (server, mut server_events, client, _client_events) = connected_pair().await;
        drop(server);

        client
            .send(ChannelFrame::Control("{\"done\":true}".into()))
            .await
            .unwrap();
        match server_events.recv().await.unwrap() {
            ChannelEvent::Message(ChannelFrame::Control(text)) => {
                assert_eq!(text, "{\"done\":true}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_drop_closes_channel() {
        let (server, _server_events, client, mut client_events) = connected_pair().await;
        drop(server);

        match client_events.recv().await.unwrap() {
            ChannelEvent::Closed => {}
            other => panic!("unexpected event: {other:?}"),
        }
        drop(client);
    }

    #[tokio::test]
    async fn dial_fails_when_no_candidate_is_reachable() {
        // A listener that is immediately dropped leaves a dead port.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(&[dead]).await;
        assert!(matches!(result, Err(TransferError::Channel(_))));
    }
}
