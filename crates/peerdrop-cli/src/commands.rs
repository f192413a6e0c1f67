//! CLI command implementations: `send` and `receive`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tokio::time::timeout;

use peerdrop_core::session::{self, ReceivedFile, SessionConfig, SessionHandle};
use peerdrop_core::{Role, SessionId, TransferPhase, relay};

use crate::display::{print_report, transfer_bar};

/// How long we wait for the relay to acknowledge registration.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the sender waits for the peer to tear the channel down after
/// completion; the close confirms every queued frame reached the peer.
const LINGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Send `file` to the receiving session `peer`.
pub async fn send(relay_addr: &str, peer: &str, file: &Path, verbose: bool) -> anyhow::Result<()> {
    let peer: SessionId = peer
        .parse()
        .map_err(|e| anyhow!("{e}"))
        .context("invalid receiver identifier")?;
    if !file.is_file() {
        bail!("not a file: {}", file.display());
    }

    let id = SessionId::generate();
    println!("Your session ID: {id}");

    let (relay_handle, relay_rx) = relay::connect(relay_addr, &id).await?;
    let config = SessionConfig {
        id,
        role: Role::Sender,
        advertise_ip: relay_handle.local_ip(),
    };
    let mut session = session::spawn(config, relay_handle, relay_rx);

    wait_registered(&mut session).await?;
    println!("Connecting to {peer}...");
    session.connect(peer).await?;
    wait_ready(&mut session).await?;
    println!("Connected. Sending {}...", file.display());

    session.send_file(file.to_path_buf()).await?;
    track_send_progress(&mut session, verbose).await?;

    // The receiver closes the channel once it has saved the file; waiting
    // for that close means nothing is still queued locally when we exit.
    let _ = timeout(LINGER_TIMEOUT, wait_channel_closed(&mut session)).await;
    println!("File sent successfully");
    Ok(())
}

/// Receive a file from the sending session `from` and write it under
/// `output`.
pub async fn receive(
    relay_addr: &str,
    from: &str,
    output: &Path,
    verbose: bool,
) -> anyhow::Result<()> {
    let peer: SessionId = from
        .parse()
        .map_err(|e| anyhow!("{e}"))
        .context("invalid sender identifier")?;

    let id = SessionId::generate();
    println!("Your session ID: {id}");
    println!("On the sending side, run: peerdrop send --peer {id} <file>");

    let (relay_handle, relay_rx) = relay::connect(relay_addr, &id).await?;
    let config = SessionConfig {
        id,
        role: Role::Receiver,
        advertise_ip: relay_handle.local_ip(),
    };
    let mut session = session::spawn(config, relay_handle, relay_rx);

    wait_registered(&mut session).await?;
    session.connect(peer).await?;

    let received = wait_received(&mut session, verbose).await?;
    let name = sanitize_file_name(&received.file_name);
    let path = output.join(&name);
    tokio::fs::write(&path, &received.data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Saved {} ({} bytes)", path.display(), received.data.len());
    Ok(())
}

/// Observe the registration hook: proceed on the ack, fail on refusal.
async fn wait_registered(session: &mut SessionHandle) -> anyhow::Result<()> {
    timeout(REGISTER_TIMEOUT, async {
        loop {
            let status = session.status.borrow().clone();
            if status.registered {
                println!("{}", status.message);
                return Ok(());
            }
            if status.phase == TransferPhase::Failed || status.registration_refused {
                bail!("{}", status.message);
            }
            if session.status.changed().await.is_err() {
                bail!("session ended before registration");
            }
        }
    })
    .await
    .context("timed out waiting for relay registration")?
}

/// Wait for the direct channel to open, printing status transitions.
async fn wait_ready(session: &mut SessionHandle) -> anyhow::Result<()> {
    let mut last_message = String::new();
    loop {
        let status = session.status.borrow().clone();
        if status.message != last_message {
            println!("{}", status.message);
            last_message = status.message.clone();
        }
        match status.phase {
            TransferPhase::Ready => return Ok(()),
            TransferPhase::Failed => return Err(failed_error(&status)),
            _ => {}
        }
        if session.status.changed().await.is_err() {
            bail!("session ended unexpectedly");
        }
    }
}

/// Drive the progress bar until the transfer reaches a terminal phase.
async fn track_send_progress(session: &mut SessionHandle, verbose: bool) -> anyhow::Result<()> {
    let total = session.status.borrow().progress.total_bytes.unwrap_or(0);
    let bar = transfer_bar(total);
    let mut last_chunk: Option<u64> = None;

    loop {
        let status = session.status.borrow().clone();
        bar.set_position(status.progress.bytes_processed);
        if verbose {
            if let Some(report) = &status.last_chunk {
                if last_chunk != Some(report.chunk_number) {
                    last_chunk = Some(report.chunk_number);
                    print_report(&bar, report);
                }
            }
        }
        match status.phase {
            TransferPhase::Completed => {
                bar.finish_with_message("done");
                return Ok(());
            }
            TransferPhase::Failed => {
                bar.abandon();
                return Err(failed_error(&status));
            }
            _ => {}
        }
        if session.status.changed().await.is_err() {
            bar.abandon();
            bail!("session ended unexpectedly");
        }
    }
}

/// Wait for a completed incoming file, printing status transitions.
async fn wait_received(
    session: &mut SessionHandle,
    verbose: bool,
) -> anyhow::Result<ReceivedFile> {
    let mut last_message = String::new();
    let mut last_chunk: Option<u64> = None;
    loop {
        tokio::select! {
            file = session.received.recv() => {
                return file.ok_or_else(|| anyhow!("session ended before a file was received"));
            }
            changed = session.status.changed() => {
                if changed.is_err() {
                    bail!("session ended unexpectedly");
                }
                let status = session.status.borrow().clone();
                if status.message != last_message {
                    println!("{}", status.message);
                    last_message = status.message.clone();
                }
                if verbose {
                    if let Some(report) = &status.last_chunk {
                        if last_chunk != Some(report.chunk_number) {
                            last_chunk = Some(report.chunk_number);
                            if let Ok(json) = serde_json::to_string(report) {
                                println!("{json}");
                            }
                        }
                    }
                }
                if status.phase == TransferPhase::Failed {
                    return Err(failed_error(&status));
                }
            }
        }
    }
}

async fn wait_channel_closed(session: &mut SessionHandle) {
    loop {
        if session.status.borrow().channel_closed {
            return;
        }
        if session.status.changed().await.is_err() {
            return;
        }
    }
}

fn failed_error(status: &peerdrop_core::SessionStatus) -> anyhow::Error {
    let kind = status.error.map_or("unknown", |kind| kind.as_str());
    anyhow!("transfer failed ({kind}): {}", status.message)
}

/// Reduce a peer-supplied file name to a safe single path component.
///
/// Separators and special characters are stripped so a malicious manifest
/// cannot escape the output directory.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if cleaned.is_empty() {
        "file".to_owned()
    } else {
        cleaned.to_owned()
    }
}
