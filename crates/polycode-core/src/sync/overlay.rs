//! Overlay connection manager
//!
//! Owns every live peer connection. A connection is any duplex byte stream
//! (a QUIC bi-stream in production, an in-memory pipe in tests) carrying
//! newline-delimited frames. Per connection two tasks run:
//!
//! ```text
//!   reader task ── FramedRead<LinesCodec> ──► OverlayEvent::Line ──► event loop
//!   writer task ◄── mpsc<String> ◄── broadcast / send_to
//! ```
//!
//! All inbound traffic funnels into one event channel, consumed by a single
//! task, so lines from one connection are handled in arrival order.
//! Write failures are logged per connection and drop that connection only;
//! a broadcast never fails because one peer is bad. A peer that stops reading
//! until its outbound queue is full is dropped as well.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, trace, warn};

use super::envelope::Envelope;
use crate::error::{CollabError, CollabResult};

/// Longest accepted line (1MB, large batches included)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Lines queued per connection before it counts as stalled
pub const OUTBOUND_QUEUE_LENGTH: usize = 1024;

/// Ordinal index of a connection, unique for the lifetime of the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle and traffic events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// A connection was attached
    Opened {
        /// Connection index
        conn: ConnectionId,
        /// Remote transport identity
        remote: String,
    },
    /// One line arrived
    Line {
        /// Connection it arrived on
        conn: ConnectionId,
        /// Line content without terminator
        line: String,
    },
    /// A connection is gone
    Closed {
        /// Connection index
        conn: ConnectionId,
        /// Remote transport identity
        remote: String,
    },
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection index
    pub id: ConnectionId,
    /// Remote transport identity
    pub remote: String,
    /// Time since the connection was attached
    pub connected_for: Duration,
}

struct PeerConnection {
    remote: String,
    outbound: mpsc::Sender<String>,
    opened_at: Instant,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct OverlayInner {
    local_peer_id: String,
    connections: RwLock<BTreeMap<ConnectionId, PeerConnection>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<OverlayEvent>,
}

impl OverlayInner {
    /// Remove a connection; emits `Closed` only for the caller that removed it
    fn remove(&self, conn: ConnectionId) -> bool {
        let removed = self.connections.write().remove(&conn);
        match removed {
            Some(peer) => {
                peer.reader.abort();
                let remaining = self.connections.read().len();
                info!(%conn, remote = %short(&peer.remote), remaining, "Connection closed");
                let _ = self.events.send(OverlayEvent::Closed {
                    conn,
                    remote: peer.remote,
                });
                true
            }
            None => false,
        }
    }

    /// Drop a connection whose writer is stuck, discarding queued lines
    fn drop_stalled(&self, conn: ConnectionId) {
        if let Some(peer) = self.connections.read().get(&conn) {
            warn!(%conn, remote = %short(&peer.remote), "Outbound queue full, dropping connection");
            peer.writer.abort();
        }
        self.remove(conn);
    }
}

/// Handle to the connection manager; cheap to clone
#[derive(Clone)]
pub struct Overlay {
    inner: Arc<OverlayInner>,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("local_peer_id", &self.inner.local_peer_id)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Overlay {
    /// Create a manager and the receiver all connection events go to
    pub fn new(local_peer_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let overlay = Self {
            inner: Arc::new(OverlayInner {
                local_peer_id: local_peer_id.into(),
                connections: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                events,
            }),
        };
        (overlay, rx)
    }

    /// Transport identity of this peer
    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    /// Attach a duplex stream as a new connection
    pub fn attach<R, W>(&self, remote: impl Into<String>, reader: R, writer: W) -> ConnectionId
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let remote = remote.into();
        let conn = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_LENGTH);

        // The reader waits until the entry is registered and `Opened` is out,
        // so an immediate EOF finds the entry and lines never precede `Opened`.
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let reader_task = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            let mut frames =
                FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(line) => {
                        trace!(%conn, len = line.len(), "Line received");
                        if inner.events.send(OverlayEvent::Line { conn, line }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%conn, error = %e, "Connection read error");
                        break;
                    }
                }
            }
            debug!(%conn, "Reader finished");
            inner.remove(conn);
        });

        let inner = Arc::clone(&self.inner);
        let writer_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, LinesCodec::new());
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    warn!(%conn, error = %e, "Connection write error, dropping connection");
                    inner.remove(conn);
                    return;
                }
            }
            let _ = SinkExt::<String>::close(&mut sink).await;
        });

        {
            let mut connections = self.inner.connections.write();
            connections.insert(
                conn,
                PeerConnection {
                    remote: remote.clone(),
                    outbound,
                    opened_at: Instant::now(),
                    reader: reader_task,
                    writer: writer_task,
                },
            );
        }

        let count = self.connection_count();
        info!(%conn, remote = %short(&remote), connections = count, "Connection opened");
        let _ = self.inner.events.send(OverlayEvent::Opened { conn, remote });
        let _ = start_tx.send(());
        conn
    }

    /// Write an envelope to every open connection except `exclude`.
    ///
    /// Returns the number of connections the envelope was queued for.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnectionId>) -> usize {
        match envelope.encode() {
            Ok(line) => self.broadcast_line(&line, exclude),
            Err(e) => {
                warn!(id = %envelope.message_id, error = %e, "Failed to encode envelope");
                0
            }
        }
    }

    /// Write a raw line to every open connection except `exclude`
    pub fn broadcast_line(&self, line: &str, exclude: Option<ConnectionId>) -> usize {
        let mut sent = 0;
        let mut stalled = Vec::new();
        let total = {
            let connections = self.inner.connections.read();
            for (id, peer) in connections.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                match peer.outbound.try_send(line.to_string()) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) => stalled.push(*id),
                    Err(TrySendError::Closed(_)) => {
                        warn!(conn = %id, remote = %short(&peer.remote), "Write to closed connection")
                    }
                }
            }
            connections.len()
        };
        for id in stalled {
            self.inner.drop_stalled(id);
        }
        debug!(sent, total, excluded = ?exclude, "Broadcast");
        sent
    }

    /// Write a raw line to one connection
    pub fn send_to(&self, conn: ConnectionId, line: &str) -> CollabResult<()> {
        let result = {
            let connections = self.inner.connections.read();
            let peer = connections
                .get(&conn)
                .ok_or_else(|| CollabError::PeerConnection(format!("No connection {}", conn)))?;
            peer.outbound.try_send(line.to_string())
        };
        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.inner.drop_stalled(conn);
                Err(CollabError::PeerConnection(format!("Connection {} stalled", conn)))
            }
            Err(TrySendError::Closed(_)) => {
                Err(CollabError::PeerConnection(format!("Connection {} is closed", conn)))
            }
        }
    }

    /// Write an envelope to one connection
    pub fn send_envelope(&self, conn: ConnectionId, envelope: &Envelope) -> CollabResult<()> {
        self.send_to(conn, &envelope.encode()?)
    }

    /// Close one connection
    pub fn close(&self, conn: ConnectionId) -> bool {
        self.inner.remove(conn)
    }

    /// Close every connection
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.inner.connections.read().keys().copied().collect();
        for id in ids {
            self.inner.remove(id);
        }
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Whether a connection is open
    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.inner.connections.read().contains_key(&conn)
    }

    /// Whether any open connection goes to `remote`
    pub fn is_connected_to(&self, remote: &str) -> bool {
        self.inner
            .connections
            .read()
            .values()
            .any(|peer| peer.remote == remote)
    }

    /// Snapshot of open connections, ordered by index
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        self.inner
            .connections
            .read()
            .iter()
            .map(|(id, peer)| ConnectionInfo {
                id: *id,
                remote: peer.remote.clone(),
                connected_for: now.saturating_duration_since(peer.opened_at),
            })
            .collect()
    }
}

/// Join two overlays with an in-memory pipe; returns (id on `a`, id on `b`)
pub fn connect_in_memory(a: &Overlay, b: &Overlay) -> (ConnectionId, ConnectionId) {
    let (a_side, b_side) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a_side);
    let (b_read, b_write) = tokio::io::split(b_side);
    let on_a = a.attach(b.local_peer_id().to_string(), a_read, a_write);
    let on_b = b.attach(a.local_peer_id().to_string(), b_read, b_write);
    (on_a, on_b)
}

/// First 16 characters of an identity, for logs
pub(crate) fn short(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(16)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}
