//! Framed messenger: one inbound listener plus per-peer outbound dialers.
//!
//! Outbound connections are dialed lazily with a bounded timeout and kept
//! for reuse; a per-peer async mutex serializes writes so frames never
//! interleave. Send failures surface as `Unreachable` and drop the cached
//! connection — retry policy belongs to callers.
//!
//! Inbound frames are checksum-verified and handed to a bounded dispatch
//! pool; a slow handler therefore never stalls the listener. Replies to
//! cluster peers travel over the peer's own outbound channel; only direct
//! client connections are answered on the same socket, via the
//! per-connection `ReplySink`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, NodeId};
use crate::error::{ClusterError, Result};
use crate::frame::{read_frame, write_frame};
use crate::message::Envelope;

/// Outbound half of the messenger.
pub struct Messenger {
    node_id: NodeId,
    connect_timeout: Duration,
    peers: HashMap<NodeId, PeerHandle>,
}

struct PeerHandle {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl Messenger {
    pub fn new(config: &ClusterConfig) -> Self {
        let peers = config
            .peers()
            .into_iter()
            .map(|n| {
                (
                    n.id,
                    PeerHandle {
                        addr: n.addr(),
                        conn: Mutex::new(None),
                    },
                )
            })
            .collect();
        Messenger {
            node_id: config.node_id,
            connect_timeout: config.connect_timeout(),
            peers,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Send one message to a peer, dialing if necessary. Never retries.
    pub async fn send(&self, peer: NodeId, envelope: &Envelope) -> Result<()> {
        let handle = self
            .peers
            .get(&peer)
            .ok_or_else(|| ClusterError::Transport(format!("unknown peer {peer}")))?;

        let mut conn = handle.conn.lock().await;
        let stream = match conn.as_mut() {
            Some(stream) => stream,
            None => {
                let dialed =
                    tokio::time::timeout(self.connect_timeout, TcpStream::connect(&handle.addr))
                        .await
                        .map_err(|_| ClusterError::Unreachable(peer))?
                        .map_err(|e| {
                            debug!("dial {} failed: {e}", handle.addr);
                            ClusterError::Unreachable(peer)
                        })?;
                conn.insert(dialed)
            }
        };

        if let Err(e) = write_frame(stream, envelope).await {
            debug!("send to peer {peer} failed: {e}");
            *conn = None;
            return Err(ClusterError::Unreachable(peer));
        }
        Ok(())
    }

    /// Drop all cached outbound connections.
    pub async fn disconnect_all(&self) {
        for handle in self.peers.values() {
            *handle.conn.lock().await = None;
        }
    }
}

/// One verified inbound message plus the sink for same-connection replies.
pub struct Inbound {
    pub envelope: Envelope,
    pub reply: ReplySink,
}

/// Write handle for the connection a message arrived on.
#[derive(Clone)]
pub struct ReplySink {
    tx: mpsc::Sender<Envelope>,
}

impl ReplySink {
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| ClusterError::Transport("connection closed".to_string()))
    }
}

/// Accept loop: one task per connection, stopped by the shutdown flag.
pub async fn run_listener(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    );
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("accepted connection from {peer_addr}");
                    let inbound = inbound.clone();
                    tokio::spawn(connection_loop(stream, inbound));
                }
                Err(e) => {
                    warn!("accept error: {e}");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn connection_loop(stream: TcpStream, inbound: mpsc::Sender<Inbound>) {
    let (mut reader, writer) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel::<Envelope>(16);
    tokio::spawn(reply_writer(writer, reply_rx));

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(envelope)) => {
                if !envelope.verify() {
                    warn!(
                        "dropping {:?} frame from {} with bad checksum",
                        envelope.kind, envelope.sender_id
                    );
                    continue;
                }
                let msg = Inbound {
                    envelope,
                    reply: ReplySink {
                        tx: reply_tx.clone(),
                    },
                };
                if inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("connection error: {e}");
                break;
            }
        }
    }
}

async fn reply_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &envelope).await {
            debug!("reply write failed: {e}");
            break;
        }
    }
}

/// Drain the inbound queue through a bounded worker pool.
pub async fn run_dispatch<F, Fut>(mut rx: mpsc::Receiver<Inbound>, workers: usize, handler: F)
where
    F: Fn(Inbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    let pool = Arc::new(Semaphore::new(workers.max(1)));
    while let Some(msg) = rx.recv().await {
        let permit = match Arc::clone(&pool).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler(msg).await;
            drop(permit);
        });
    }
}
