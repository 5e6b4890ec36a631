//! iroh transport for the overlay
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Endpoint (QUIC, ALPNs: gossip + /polycode/overlay/1)            │
//! │                                                                  │
//! │  iroh-gossip topic          rendezvous only: who else is here    │
//! │   └── NeighborUp(peer) ──► smaller endpoint id dials             │
//! │                                                                  │
//! │  overlay connection         one QUIC connection per peer pair,   │
//! │   └── one bi-stream ──────► Overlay::attach (newline frames)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Gossip membership tells a peer who shares the topic; the actual envelope
//! traffic (and the flooding policy) runs over the direct connections, so
//! the hop budget and duplicate suppression stay under our control.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::GossipSender;
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::overlay::{Overlay, OverlayEvent};
use crate::error::{CollabError, CollabResult};
use crate::types::TOPIC_LEN;

/// ALPN of the overlay protocol
pub const OVERLAY_ALPN: &[u8] = b"/polycode/overlay/1";

/// Gossip frames are tiny (membership only)
const GOSSIP_MAX_MESSAGE_SIZE: usize = 4096;

type Links = Arc<Mutex<HashMap<EndpointId, Connection>>>;

/// Peers with an outbound dial in flight
#[derive(Debug, Clone, Default)]
struct PendingDials(Arc<Mutex<HashSet<EndpointId>>>);

impl PendingDials {
    /// Claim `peer` for dialling unless a dial is already running or a link
    /// exists. The claim is released when the returned guard drops.
    fn try_claim(&self, peer: EndpointId, links: &Links) -> Option<DialClaim> {
        let mut pending = self.0.lock();
        if links.lock().contains_key(&peer) || !pending.insert(peer) {
            return None;
        }
        Some(DialClaim {
            pending: self.clone(),
            peer,
        })
    }

    #[cfg(test)]
    fn contains(&self, peer: &EndpointId) -> bool {
        self.0.lock().contains(peer)
    }
}

struct DialClaim {
    pending: PendingDials,
    peer: EndpointId,
}

impl Drop for DialClaim {
    fn drop(&mut self) {
        self.pending.0.lock().remove(&self.peer);
    }
}

/// Accepts overlay connections dialled by peers
#[derive(Clone)]
struct OverlayProtocolHandler {
    overlay: Overlay,
    links: Links,
}

impl std::fmt::Debug for OverlayProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayProtocolHandler")
            .field("overlay", &self.overlay)
            .finish()
    }
}

impl ProtocolHandler for OverlayProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let overlay = self.overlay.clone();
        let links = Arc::clone(&self.links);

        async move {
            let remote = conn.remote_id();
            debug!(peer = %remote, "Accepting overlay connection");

            let (send, recv) = conn.accept_bi().await.map_err(|e| {
                AcceptError::from_err(CollabError::Network(format!(
                    "Failed to accept bi stream: {}",
                    e
                )))
            })?;
            overlay.attach(remote.to_string(), recv, send);
            links.lock().insert(remote, conn.clone());

            // The connection lives as long as this future does.
            conn.closed().await;
            links.lock().remove(&remote);
            debug!(peer = %remote, "Inbound overlay connection ended");
            Ok(())
        }
    }
}

/// Endpoint, gossip rendezvous and overlay connections of one peer
pub struct NetTransport {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    static_provider: StaticProvider,
    overlay: Overlay,
    links: Links,
    topic: Mutex<Option<GossipSender>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetTransport")
            .field("endpoint_id", &self.endpoint.id())
            .field("links", &self.links.lock().len())
            .finish()
    }
}

impl NetTransport {
    /// Bind an endpoint and start accepting overlay connections.
    ///
    /// Returns the transport and the receiver of overlay events.
    pub async fn bind(
        secret_key: Option<SecretKey>,
    ) -> CollabResult<(Self, mpsc::UnboundedReceiver<OverlayEvent>)> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec(), OVERLAY_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| CollabError::Network(format!("Failed to bind endpoint: {}", e)))?;
        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(GOSSIP_MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let (overlay, events) = Overlay::new(endpoint_id.to_string());
        let links: Links = Arc::new(Mutex::new(HashMap::new()));
        let handler = OverlayProtocolHandler {
            overlay: overlay.clone(),
            links: Arc::clone(&links),
        };

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(OVERLAY_ALPN, handler)
            .spawn();
        info!("Router spawned");

        Ok((
            Self {
                endpoint,
                gossip,
                router,
                static_provider,
                overlay,
                links,
                topic: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            },
            events,
        ))
    }

    /// Connection manager fed by this transport
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// This peer's endpoint id
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Full address other peers can dial
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer's address known without DNS discovery
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        info!(peer = %addr.id, "Adding peer address to static discovery");
        self.static_provider.add_endpoint_info(addr);
    }

    /// Join the discovery topic and start dialling neighbours.
    ///
    /// With bootstrap peers this waits (up to `join_timeout`) until at least
    /// one neighbour is up; the first peer on a topic returns immediately.
    pub async fn join(
        &self,
        topic: [u8; TOPIC_LEN],
        bootstrap: Vec<EndpointId>,
        join_timeout: Duration,
    ) -> CollabResult<()> {
        let topic_id = TopicId::from_bytes(topic);
        let wait = !bootstrap.is_empty();
        info!(?topic_id, bootstrap = bootstrap.len(), "Joining discovery topic");

        let (sender, mut receiver) = self
            .gossip
            .subscribe(topic_id, bootstrap)
            .await
            .map_err(|e| CollabError::Gossip(format!("Failed to subscribe: {}", e)))?
            .split();

        if wait {
            match tokio::time::timeout(join_timeout, receiver.joined()).await {
                Ok(Ok(())) => info!(?topic_id, "Joined topic swarm"),
                Ok(Err(e)) => {
                    return Err(CollabError::Gossip(format!("Failed to join topic swarm: {}", e)))
                }
                Err(_) => warn!(?topic_id, timeout = ?join_timeout, "No neighbour yet, continuing"),
            }
        }
        *self.topic.lock() = Some(sender);

        let local = self.endpoint.id();
        let endpoint = self.endpoint.clone();
        let overlay = self.overlay.clone();
        let links = Arc::clone(&self.links);
        let pending = PendingDials::default();

        let task = tokio::spawn(async move {
            use iroh_gossip::api::Event;
            use n0_future::StreamExt;

            let initial: Vec<EndpointId> = receiver.neighbors().collect();
            for peer in initial {
                maybe_dial(&endpoint, &overlay, &links, &pending, local, peer);
            }

            loop {
                match receiver.try_next().await {
                    Ok(Some(Event::NeighborUp(peer))) => {
                        info!(?topic_id, %peer, "Neighbour up");
                        maybe_dial(&endpoint, &overlay, &links, &pending, local, peer);
                    }
                    Ok(Some(Event::NeighborDown(peer))) => {
                        debug!(?topic_id, %peer, "Neighbour down");
                    }
                    Ok(Some(Event::Received(_))) => {}
                    Ok(Some(Event::Lagged)) => warn!(?topic_id, "Lagged behind on topic"),
                    Ok(None) => {
                        debug!(?topic_id, "Topic subscription closed");
                        break;
                    }
                    Err(e) => {
                        warn!(?topic_id, error = ?e, "Error receiving from topic");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Close the QUIC connection behind an overlay connection
    pub fn disconnect(&self, remote: &str) {
        let mut links = self.links.lock();
        let id = links.keys().find(|id| id.to_string() == remote).copied();
        if let Some(conn) = id.and_then(|id| links.remove(&id)) {
            conn.close(0u32.into(), b"overlay closed");
        }
    }

    /// Leave the topic, drop every connection, close the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down transport");
        self.topic.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.overlay.close_all();
        for (_, conn) in self.links.lock().drain() {
            conn.close(0u32.into(), b"shutdown");
        }
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shut down router cleanly");
        }
        self.endpoint.close().await;
        info!("Transport shut down");
    }
}

/// Dial `peer` unless it is our turn to wait or we already have a link.
///
/// Only the side with the smaller endpoint id dials, so each pair ends up
/// with exactly one connection.
fn maybe_dial(
    endpoint: &Endpoint,
    overlay: &Overlay,
    links: &Links,
    pending: &PendingDials,
    local: EndpointId,
    peer: EndpointId,
) {
    if !should_dial(local.as_bytes(), peer.as_bytes()) {
        debug!(%peer, "Waiting for neighbour to dial");
        return;
    }
    if overlay.is_connected_to(&peer.to_string()) {
        return;
    }
    let Some(claim) = pending.try_claim(peer, links) else {
        debug!(%peer, "Dial already in flight or linked");
        return;
    };

    let endpoint = endpoint.clone();
    let overlay = overlay.clone();
    let links = Arc::clone(links);
    tokio::spawn(async move {
        if let Err(e) = dial(&endpoint, &overlay, &links, peer).await {
            warn!(%peer, error = %e, "Overlay dial failed");
        }
        drop(claim);
    });
}

async fn dial(
    endpoint: &Endpoint,
    overlay: &Overlay,
    links: &Links,
    peer: EndpointId,
) -> CollabResult<()> {
    let conn = endpoint
        .connect(peer, OVERLAY_ALPN)
        .await
        .map_err(|e| CollabError::Network(format!("Failed to connect: {}", e)))?;
    let (send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| CollabError::Network(format!("Failed to open bi stream: {}", e)))?;

    overlay.attach(peer.to_string(), recv, send);
    links.lock().insert(peer, conn.clone());

    let links = Arc::clone(links);
    tokio::spawn(async move {
        conn.closed().await;
        links.lock().remove(&peer);
        debug!(%peer, "Outbound overlay connection ended");
    });
    Ok(())
}

/// Tie-break for who opens the connection
pub fn should_dial(local: &[u8], remote: &[u8]) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_dials() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert!(should_dial(&a, &b));
        assert!(!should_dial(&b, &a));
        assert!(!should_dial(&a, &a));
    }

    #[test]
    fn test_one_dial_in_flight_per_peer() {
        let peer = SecretKey::generate(&mut rand::rng()).public();
        let other = SecretKey::generate(&mut rand::rng()).public();
        let links: Links = Arc::new(Mutex::new(HashMap::new()));
        let pending = PendingDials::default();

        let claim = pending.try_claim(peer, &links).unwrap();
        assert!(pending.try_claim(peer, &links).is_none());
        assert!(pending.try_claim(other, &links).is_some());

        drop(claim);
        assert!(!pending.contains(&peer));
        assert!(pending.try_claim(peer, &links).is_some());
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let (transport, _events) = NetTransport::bind(None).await.unwrap();
        assert_eq!(
            transport.overlay().local_peer_id(),
            transport.endpoint_id().to_string()
        );
        assert_eq!(transport.overlay().connection_count(), 0);
        transport.shutdown().await;
    }
}
