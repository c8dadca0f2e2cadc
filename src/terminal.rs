//! Interactive terminal bridge over the orchestrator exec channel.
//!
//! Pipes a peer connection (the edge adapter hands us its frames) into a
//! `/bin/bash` exec session in the workload container. The exec protocol
//! multiplexes on a leading channel octet; kube demuxes stdin/stdout and
//! carries resizes as `{Width,Height}` JSON frames on the resize channel.
//! Sessions are independent; a concurrent registry maps workload name to
//! the live resize handle for out-of-band resizes.

use futures::SinkExt;
use futures::channel::mpsc as futures_mpsc;
use kube::api::{AttachParams, TerminalSize};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::PoolEngine;

/// A frame to or from the peer connection.
#[derive(Debug, Clone)]
pub enum PeerFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Registry of live terminal sessions, keyed by workload name.
#[derive(Clone, Default)]
pub struct TerminalSessions {
    inner: Arc<Mutex<HashMap<String, futures_mpsc::Sender<TerminalSize>>>>,
}

impl TerminalSessions {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, name: &str, sender: futures_mpsc::Sender<TerminalSize>) {
        self.inner.lock().await.insert(name.to_string(), sender);
    }

    async fn remove(&self, name: &str) {
        self.inner.lock().await.remove(name);
    }

    /// Out-of-band resize of an active session.
    pub async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        let mut sender = self
            .inner
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no terminal session for {}", name)))?;
        sender
            .send(TerminalSize {
                width: cols,
                height: rows,
            })
            .await
            .map_err(|_| Error::Unreachable(format!("terminal session for {} closed", name)))
    }
}

/// Run a terminal session until either side closes.
///
/// Two pumps share a linked cancellation: peer frames flow to the session's
/// stdin (text frames that parse as resize messages are translated into
/// resize frames instead), and session output flows back to the peer as
/// binary frames. Every inbound peer frame bumps the workload's activity.
pub async fn terminal(
    engine: &PoolEngine,
    sessions: &TerminalSessions,
    name: &str,
    mut peer_rx: mpsc::Receiver<PeerFrame>,
    peer_tx: mpsc::Sender<PeerFrame>,
    token: CancellationToken,
) -> Result<()> {
    let ap = AttachParams::default()
        .container("workload")
        .stdin(true)
        .stdout(true)
        .stderr(false)
        .tty(true);
    let mut attached = engine.pods().exec(name, vec!["/bin/bash"], &ap).await?;

    let mut stdin = attached
        .stdin()
        .ok_or_else(|| Error::Unreachable("exec channel has no stdin".to_string()))?;
    let mut stdout = attached
        .stdout()
        .ok_or_else(|| Error::Unreachable("exec channel has no stdout".to_string()))?;
    let mut resize_tx = attached.terminal_size();

    if let Some(tx) = &resize_tx {
        sessions.register(name, tx.clone()).await;
    }

    let linked = token.child_token();

    // peer -> orchestrator
    let inbound = {
        let linked = linked.clone();
        let engine = engine.clone();
        let workload = name.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = linked.cancelled() => break,
                    frame = peer_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                {
                    let engine = engine.clone();
                    let workload = workload.clone();
                    tokio::spawn(async move {
                        engine.touch_activity(&workload).await;
                    });
                }

                let write = match frame {
                    PeerFrame::Binary(bytes) => stdin.write_all(&bytes).await,
                    PeerFrame::Text(text) => {
                        if let Some(size) = parse_resize(&text) {
                            if let Some(tx) = &mut resize_tx {
                                if tx.send(size).await.is_err() {
                                    break;
                                }
                            }
                            continue;
                        }
                        stdin.write_all(text.as_bytes()).await
                    }
                };
                if let Err(e) = write {
                    debug!(workload = %workload, error = %e, "terminal stdin closed");
                    break;
                }
            }
            linked.cancel();
        })
    };

    // orchestrator -> peer
    let outbound = {
        let linked = linked.clone();
        let workload = name.to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let read = tokio::select! {
                    _ = linked.cancelled() => break,
                    read = stdout.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if peer_tx
                            .send(PeerFrame::Binary(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(workload = %workload, error = %e, "terminal stdout read failed");
                        break;
                    }
                }
            }
            linked.cancel();
        })
    };

    let _ = tokio::join!(inbound, outbound);
    sessions.remove(name).await;
    let _ = attached.join().await;
    Ok(())
}

#[derive(Deserialize)]
struct PeerMessage {
    #[serde(rename = "type")]
    kind: String,
    payload: Option<ResizePayload>,
}

#[derive(Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

/// Translate a peer text frame into a resize, when it is one.
fn parse_resize(text: &str) -> Option<TerminalSize> {
    let message: PeerMessage = serde_json::from_str(text).ok()?;
    if message.kind != "resize" {
        return None;
    }
    let payload = message.payload?;
    Some(TerminalSize {
        width: payload.cols,
        height: payload.rows,
    })
}
