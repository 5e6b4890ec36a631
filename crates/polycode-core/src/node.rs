//! CollabNode - the main entry point for Polycode
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  CollabNode                                                       │
//! │                                                                   │
//! │  event loop (one task, one message at a time)                     │
//! │  ├── OverlayEvent::Opened  ──► hello, PeerConnected               │
//! │  ├── OverlayEvent::Line    ──► legacy reply | route ─► dispatch   │
//! │  │                                              └──► relay        │
//! │  ├── OverlayEvent::Closed  ──► forget identity, PeerDisconnected  │
//! │  ├── DocumentChange        ──► capture ─► flood crdt_update       │
//! │  ├── status timer (5s)     ──► log connection/peer counts         │
//! │  └── sweep timer (2min)    ──► purge seen-message cache           │
//! │                                                                   │
//! │  host-facing calls: capture_local_change, apply_remote_batch,     │
//! │  broadcast_save, request_resync, get_status, identify_peers, ...  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use polycode_core::{FsDocuments, NodeBuilder, NodeConfig};
//!
//! let config = NodeConfig::default();
//! let store = Arc::new(FsDocuments::new(&config.workspace));
//! let node = NodeBuilder::new(config, store).start().await?;
//! println!("{}", node.get_status());
//! ```

use std::sync::Arc;

use iroh::{EndpointId, SecretKey};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::edit::{
    DocumentChange, DocumentStore, EditBatch, EditCapture, PositionalReplay, ReplayEngine,
    ReplayOutcome,
};
use crate::error::{CollabError, CollabResult};
use crate::guard::FeedbackGuard;
use crate::peers::{PeerDirectory, PeerSummary};
use crate::resync::{ProcessRunner, ResyncCoordinator, SequenceReport, StepRunner};
use crate::sync::envelope::{Envelope, Inbound, Payload, LEGACY_TRIGGER};
use crate::sync::events::{NodeEvent, NodeStatus};
use crate::sync::net::NetTransport;
use crate::sync::overlay::{short, ConnectionId, Overlay, OverlayEvent};
use crate::sync::router::{GossipRouter, RouteDecision};
use crate::types::{discovery_topic, now_millis, topic_hex, ClientId};

/// Capacity of the node event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Routing and identity state, touched only while handling one message
#[derive(Debug)]
struct RoutingState {
    router: GossipRouter,
    peers: PeerDirectory,
}

struct NodeInner {
    config: NodeConfig,
    client_id: ClientId,
    display_name: RwLock<Option<String>>,
    guard: Arc<FeedbackGuard>,
    overlay: Overlay,
    capture: EditCapture,
    replay: Arc<dyn ReplayEngine>,
    resync: Arc<ResyncCoordinator>,
    state: Mutex<RoutingState>,
    events: broadcast::Sender<NodeEvent>,
    transport: Option<Arc<NetTransport>>,
}

/// Configures and starts a [`CollabNode`]
pub struct NodeBuilder {
    config: NodeConfig,
    store: Arc<dyn DocumentStore>,
    runner: Arc<dyn StepRunner>,
    client_id: Option<ClientId>,
    secret_key: Option<SecretKey>,
    capture_from_store: bool,
}

impl std::fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("config", &self.config)
            .field("client_id", &self.client_id)
            .field("store", &"<DocumentStore>")
            .finish()
    }
}

impl NodeBuilder {
    /// Builder with process-backed save/resync steps and a fresh client id
    pub fn new(config: NodeConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            store,
            runner: Arc::new(ProcessRunner),
            client_id: None,
            secret_key: None,
            capture_from_store: true,
        }
    }

    /// Use a specific client id
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Run save/resync steps through `runner`
    pub fn runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Transport identity for [`NodeBuilder::start`]
    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    /// Whether the node listens to the store's change feed itself.
    ///
    /// Turn this off when the host calls
    /// [`CollabNode::capture_local_change`] directly.
    pub fn capture_from_store(mut self, enabled: bool) -> Self {
        self.capture_from_store = enabled;
        self
    }

    /// Bind an iroh endpoint, join the configured topic and start.
    pub async fn start(self) -> CollabResult<CollabNode> {
        self.config.validate()?;
        let bootstrap = self
            .config
            .bootstrap
            .iter()
            .map(|s| {
                s.parse::<EndpointId>()
                    .map_err(|e| CollabError::Config(format!("Invalid bootstrap id '{}': {}", s, e)))
            })
            .collect::<CollabResult<Vec<_>>>()?;
        let topic = discovery_topic(&self.config.topic);
        let join_timeout = self.config.join_timeout();

        let (transport, overlay_events) = NetTransport::bind(self.secret_key.clone()).await?;
        let transport = Arc::new(transport);
        let overlay = transport.overlay().clone();

        let node = self.launch(overlay, overlay_events, Some(Arc::clone(&transport)));
        if let Err(e) = transport.join(topic, bootstrap, join_timeout).await {
            node.stop().await;
            return Err(e);
        }
        info!(
            topic = %node.inner.config.topic,
            topic_hex = %topic_hex(&node.inner.config.topic),
            "Node ready"
        );
        Ok(node)
    }

    /// Start on an existing overlay (no network transport)
    pub fn spawn(
        self,
        overlay: Overlay,
        overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
    ) -> CollabNode {
        self.launch(overlay, overlay_events, None)
    }

    fn launch(
        self,
        overlay: Overlay,
        overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
        transport: Option<Arc<NetTransport>>,
    ) -> CollabNode {
        let client_id = self.client_id.unwrap_or_default();
        let guard = FeedbackGuard::new(client_id.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let capture = EditCapture::new(self.store.root(), Arc::clone(&guard));
        let replay: Arc<dyn ReplayEngine> = Arc::new(PositionalReplay::new(
            Arc::clone(&self.store),
            Arc::clone(&guard),
            self.config.missing_documents,
        ));
        let resync = ResyncCoordinator::new(
            Arc::clone(&guard),
            self.runner,
            self.store.root(),
            self.config.resync_grace(),
            self.config.resync_steps.clone(),
            self.config.save_steps.clone(),
            events.clone(),
        );

        let inner = Arc::new(NodeInner {
            display_name: RwLock::new(self.config.display_name.clone()),
            state: Mutex::new(RoutingState {
                router: GossipRouter::new(client_id.clone(), self.config.seen_retention()),
                peers: PeerDirectory::new(),
            }),
            config: self.config,
            client_id,
            guard,
            overlay,
            capture,
            replay,
            resync,
            events,
            transport,
        });

        let changes = self.capture_from_store.then(|| self.store.subscribe());
        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&inner), overlay_events, changes));

        info!(
            client = %inner.client_id.short(),
            peer = %short(inner.overlay.local_peer_id()),
            workspace = %self.store.root().display(),
            "Node started"
        );
        CollabNode {
            inner,
            store: self.store,
            tasks: vec![event_loop],
        }
    }
}

/// A running collaborative-editing peer
pub struct CollabNode {
    inner: Arc<NodeInner>,
    store: Arc<dyn DocumentStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for CollabNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabNode")
            .field("client_id", &self.inner.client_id)
            .field("overlay", &self.inner.overlay)
            .field("store", &"<DocumentStore>")
            .finish()
    }
}

impl CollabNode {
    /// Application-level id of this peer
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Transport identity of this peer
    pub fn peer_id(&self) -> &str {
        self.inner.overlay.local_peer_id()
    }

    /// Connection manager
    pub fn overlay(&self) -> &Overlay {
        &self.inner.overlay
    }

    /// Documents this node edits
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Feedback guard shared by capture, replay and resync
    pub fn guard(&self) -> &Arc<FeedbackGuard> {
        &self.inner.guard
    }

    /// Network transport, when started with [`NodeBuilder::start`]
    pub fn transport(&self) -> Option<&Arc<NetTransport>> {
        self.inner.transport.as_ref()
    }

    /// Subscribe to node events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Turn a local change into a batch and flood it.
    ///
    /// Returns `None` when the guard suppresses capture.
    pub fn capture_local_change(&self, change: &DocumentChange) -> Option<EditBatch> {
        self.inner.capture_local_change(change)
    }

    /// Replay a batch received out of band
    pub fn apply_remote_batch(&self, batch: &EditBatch) -> CollabResult<ReplayOutcome> {
        self.inner.apply_remote_batch(batch)
    }

    /// Run the save steps and, if they all succeed, announce the save.
    ///
    /// Returns whether the save succeeded.
    pub async fn broadcast_save(&self, commit_message: &str) -> CollabResult<bool> {
        let report = self.inner.resync.save(commit_message).await?;
        if !report.success() {
            return Ok(false);
        }
        let sent = self.inner.originate(Payload::GithubSave {
            commit_message: commit_message.to_string(),
        });
        info!(sent, message = %commit_message, "Save announced");
        self.inner.notify(NodeEvent::info(format!(
            "Saved \"{}\" and notified {} peer(s)",
            commit_message, sent
        )));
        Ok(true)
    }

    /// Ask every peer to resync, and resync locally right away
    pub async fn request_resync(&self) -> CollabResult<SequenceReport> {
        self.inner.originate(Payload::SyncRequest {
            message: "resync requested".to_string(),
        });
        self.inner.resync.run_resync().await
    }

    /// Point-in-time status
    pub fn get_status(&self) -> NodeStatus {
        let peers = self.list_peers();
        NodeStatus {
            connected: !peers.is_empty(),
            peer_count: peers.len(),
            local_id: self.inner.client_id.clone(),
            peer_id: self.peer_id().to_string(),
            display_name: self.inner.display_name.read().clone(),
            sync_in_progress: self.inner.guard.is_sync_in_progress(),
            peers,
        }
    }

    /// Best-effort identity of every open connection
    pub fn list_peers(&self) -> Vec<PeerSummary> {
        let connections = self.inner.overlay.connections();
        self.inner.state.lock().peers.list(&connections)
    }

    /// Flood a ping so peers reveal themselves; returns connections written
    pub fn identify_peers(&self) -> usize {
        self.ping_peers("identify")
    }

    /// Flood a ping; pongs come back as latency notifications
    pub fn ping_peers(&self, message: &str) -> usize {
        self.inner.originate(Payload::Ping {
            message: message.to_string(),
        })
    }

    /// Change the display name and announce it
    pub fn set_display_name(&self, name: &str) -> usize {
        *self.inner.display_name.write() = Some(name.to_string());
        self.inner.originate(Payload::UserNameUpdate {
            user_name: name.to_string(),
        })
    }

    /// Write the legacy trigger line to every connection
    pub fn send_test_message(&self) -> usize {
        self.inner.overlay.broadcast_line(LEGACY_TRIGGER, None)
    }

    /// Stop the event loop, drop all connections and leave the topic
    pub async fn stop(self) {
        info!(client = %self.inner.client_id.short(), "Stopping node");
        for task in &self.tasks {
            task.abort();
        }
        self.inner.overlay.close_all();
        if let Some(transport) = &self.inner.transport {
            transport.shutdown().await;
        }
    }
}

impl NodeInner {
    fn notify(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Wrap, remember and flood an envelope this peer originates
    fn originate(&self, payload: Payload) -> usize {
        let envelope = Envelope::new(
            payload,
            &self.client_id,
            Some(self.overlay.local_peer_id().to_string()),
            self.config.ttl,
        );
        self.state.lock().router.mark_outgoing(&envelope, Instant::now());
        let sent = self.overlay.broadcast(&envelope, None);
        debug!(id = %envelope.message_id, kind = envelope.kind(), sent, "Originated envelope");
        sent
    }

    fn capture_local_change(&self, change: &DocumentChange) -> Option<EditBatch> {
        let batch = self.capture.capture(change)?;
        let sent = self.originate(Payload::from_batch(&batch));
        info!(
            path = %batch.document_path.display(),
            ops = batch.len(),
            sent,
            "Broadcast local edit"
        );
        Some(batch)
    }

    fn apply_remote_batch(&self, batch: &EditBatch) -> CollabResult<ReplayOutcome> {
        match self.replay.apply(batch) {
            Ok(outcome) => {
                if let ReplayOutcome::Applied { path, operations } = &outcome {
                    info!(path = %path.display(), operations, origin = %batch.origin_client_id.short(), "Applied remote batch");
                    self.notify(NodeEvent::BatchApplied {
                        path: path.clone(),
                        operations: *operations,
                        origin: batch.origin_client_id.clone(),
                    });
                    self.notify(NodeEvent::info(format!(
                        "Applied update from peer {}",
                        batch.origin_client_id.short()
                    )));
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(path = %batch.document_path.display(), error = %e, "Failed to apply remote batch");
                self.notify(NodeEvent::error(format!(
                    "Failed to apply update from peer {}: {}",
                    batch.origin_client_id.short(),
                    e
                )));
                Err(e)
            }
        }
    }

    fn handle_overlay_event(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::Opened { conn, remote } => {
                let hello = Envelope::new(
                    Payload::Hello {
                        display_name: self.display_name.read().clone(),
                    },
                    &self.client_id,
                    Some(self.overlay.local_peer_id().to_string()),
                    0,
                );
                self.state.lock().router.mark_outgoing(&hello, Instant::now());
                if let Err(e) = self.overlay.send_envelope(conn, &hello) {
                    warn!(%conn, error = %e, "Failed to send hello");
                }
                self.notify(NodeEvent::PeerConnected {
                    index: conn.0,
                    remote,
                });
            }
            OverlayEvent::Line { conn, line } => self.handle_line(conn, &line),
            OverlayEvent::Closed { conn, remote } => {
                self.state.lock().peers.forget(conn);
                if let Some(transport) = &self.transport {
                    transport.disconnect(&remote);
                }
                self.notify(NodeEvent::PeerDisconnected {
                    index: conn.0,
                    remote,
                });
            }
        }
    }

    fn handle_line(&self, conn: ConnectionId, line: &str) {
        let envelope = match Inbound::parse(line) {
            Inbound::Envelope(envelope) => envelope,
            plain => {
                if let Some(reply) = plain.legacy_reply() {
                    info!(%conn, "Legacy trigger received, replying");
                    if let Err(e) = self.overlay.send_to(conn, reply) {
                        warn!(%conn, error = %e, "Failed to send legacy reply");
                    }
                } else {
                    debug!(%conn, len = line.len(), "Ignoring plain-text line");
                }
                return;
            }
        };

        let forward = {
            let mut state = self.state.lock();
            match state.router.route(&envelope, Instant::now()) {
                RouteDecision::Duplicate => return,
                RouteDecision::Deliver { forward } => {
                    state.peers.observe(conn, &envelope);
                    forward
                }
            }
        };

        debug!(%conn, id = %envelope.message_id, kind = envelope.kind(), ttl = envelope.ttl, "Envelope received");
        self.dispatch(&envelope);

        if let Some(forward) = forward {
            let sent = self.overlay.broadcast(&forward, Some(conn));
            debug!(id = %forward.message_id, ttl = forward.ttl, sent, "Relayed envelope");
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        let from = envelope
            .client_id
            .as_ref()
            .map(|c| c.short().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        match &envelope.payload {
            Payload::CrdtUpdate { .. } => {
                if let Some(batch) = envelope.edit_batch() {
                    // Failures are reported through notifications; the batch is dropped.
                    let _ = self.apply_remote_batch(&batch);
                }
            }
            Payload::GithubSave { commit_message } => {
                info!(from = %from, message = %commit_message, "Peer saved to repository");
                self.notify(NodeEvent::SaveAnnounced {
                    by: envelope.client_id.clone(),
                    commit_message: commit_message.clone(),
                });
                self.notify(NodeEvent::info(format!(
                    "Peer {} saved \"{}\", syncing shortly",
                    from, commit_message
                )));
                self.resync.notify(envelope.client_id.clone());
            }
            Payload::SyncRequest { message } => {
                info!(from = %from, message = %message, "Resync requested");
                self.resync.notify(envelope.client_id.clone());
            }
            Payload::Ping { .. } => {
                self.originate(Payload::Pong {
                    message: "pong".to_string(),
                    original_timestamp: envelope.timestamp,
                    reply_to: envelope.client_id.clone(),
                });
            }
            Payload::Pong {
                original_timestamp,
                reply_to,
                ..
            } => {
                if reply_to.as_ref() == Some(&self.client_id) {
                    let latency = now_millis().saturating_sub(*original_timestamp);
                    info!(from = %from, latency_ms = latency, "Pong received");
                    self.notify(NodeEvent::info(format!(
                        "Pong from {}: {} ms",
                        from, latency
                    )));
                }
            }
            Payload::UserNameUpdate { user_name } => {
                info!(from = %from, name = %user_name, "Peer changed display name");
            }
            Payload::Hello { .. } => {}
        }
    }

    fn log_status(&self) {
        let connections = self.overlay.connection_count();
        let state = self.state.lock();
        info!(
            connections,
            identified = state.peers.identified_count(),
            seen = state.router.seen_count(),
            syncing = self.guard.is_sync_in_progress(),
            "Overlay status"
        );
    }

    fn sweep(&self) {
        self.state.lock().router.sweep(Instant::now());
    }
}

async fn run_event_loop(
    inner: Arc<NodeInner>,
    mut overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
    mut changes: Option<broadcast::Receiver<DocumentChange>>,
) {
    let status_every = inner.config.status_interval();
    let sweep_every = inner.config.seen_sweep_interval();
    let mut status = tokio::time::interval_at(Instant::now() + status_every, status_every);
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = overlay_events.recv() => match event {
                Some(event) => inner.handle_overlay_event(event),
                None => {
                    debug!("Overlay event channel closed");
                    break;
                }
            },
            change = next_change(&mut changes) => match change {
                Ok(change) => {
                    inner.capture_local_change(&change);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Local change listener lagged, edits were not broadcast");
                    inner.notify(NodeEvent::error(format!(
                        "{} local edit(s) were not shared with peers",
                        missed
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Document change feed closed");
                    changes = None;
                }
            },
            _ = status.tick() => inner.log_status(),
            _ = sweep.tick() => inner.sweep(),
        }
    }
}

/// Next local change, or pending forever when not listening
async fn next_change(
    changes: &mut Option<broadcast::Receiver<DocumentChange>>,
) -> Result<DocumentChange, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::{EditOperation, MemoryDocuments, Position};
    use crate::guard::EditSource;
    use crate::resync::testing::FakeRunner;
    use std::path::Path;
    use std::time::Duration;

    fn node(name: &str, store: Arc<MemoryDocuments>) -> (CollabNode, Overlay) {
        let (overlay, rx) = Overlay::new(format!("{}-peer", name));
        let node = NodeBuilder::new(NodeConfig::default(), store)
            .client_id(ClientId::from_string(name))
            .runner(Arc::new(FakeRunner::default()))
            .spawn(overlay.clone(), rx);
        (node, overlay)
    }

    async fn next_line(rx: &mut mpsc::UnboundedReceiver<OverlayEvent>) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(OverlayEvent::Line { line, .. })) => return line,
                Ok(Some(_)) => continue,
                other => panic!("no line: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_status_without_peers() {
        let (n, _) = node("solo", Arc::new(MemoryDocuments::new("/ws")));
        let status = n.get_status();
        assert!(!status.connected);
        assert_eq!(status.peer_count, 0);
        assert_eq!(status.local_id, ClientId::from_string("solo"));
        assert_eq!(status.peer_id, "solo-peer");
        assert!(!status.sync_in_progress);
        n.stop().await;
    }

    #[tokio::test]
    async fn test_hello_on_open_and_legacy_reply() {
        let (n, overlay) = node("a", Arc::new(MemoryDocuments::new("/ws")));
        let (remote, mut remote_rx) = Overlay::new("remote");
        let (_, remote_conn) = crate::sync::overlay::connect_in_memory(&overlay, &remote);

        let hello = Envelope::decode(&next_line(&mut remote_rx).await).unwrap();
        assert_eq!(hello.kind(), "hello");
        assert_eq!(hello.ttl, 0);
        assert_eq!(hello.client_id, Some(ClientId::from_string("a")));

        remote.send_to(remote_conn, LEGACY_TRIGGER).unwrap();
        assert_eq!(next_line(&mut remote_rx).await, "I LOVE YOU TOO");
        n.stop().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (n, overlay) = node("a", Arc::new(MemoryDocuments::new("/ws")));
        let (remote, mut remote_rx) = Overlay::new("remote");
        let (_, remote_conn) = crate::sync::overlay::connect_in_memory(&overlay, &remote);
        let _hello = next_line(&mut remote_rx).await;

        let ping = Envelope::new(
            Payload::Ping { message: "hi".into() },
            &ClientId::from_string("remote"),
            None,
            0,
        );
        remote.send_envelope(remote_conn, &ping).unwrap();

        let pong = Envelope::decode(&next_line(&mut remote_rx).await).unwrap();
        match pong.payload {
            Payload::Pong {
                original_timestamp,
                reply_to,
                ..
            } => {
                assert_eq!(original_timestamp, ping.timestamp);
                assert_eq!(reply_to, Some(ClientId::from_string("remote")));
            }
            other => panic!("expected pong, got {:?}", other),
        }
        n.stop().await;
    }

    #[tokio::test]
    async fn test_local_change_is_flooded() {
        let store = Arc::new(MemoryDocuments::new("/ws"));
        store.insert_document("/ws/a.txt", "");
        let (n, overlay) = node("a", Arc::clone(&store));
        let (remote, mut remote_rx) = Overlay::new("remote");
        crate::sync::overlay::connect_in_memory(&overlay, &remote);
        let _hello = next_line(&mut remote_rx).await;

        store
            .apply(
                Path::new("/ws/a.txt"),
                &EditOperation::insert(Position::new(0, 0), "hi"),
                EditSource::Local,
            )
            .unwrap();

        let env = Envelope::decode(&next_line(&mut remote_rx).await).unwrap();
        let batch = env.edit_batch().unwrap();
        assert_eq!(batch.document_path, Path::new("a.txt"));
        assert_eq!(batch.origin_client_id, ClientId::from_string("a"));
        assert_eq!(env.ttl, 3);
        n.stop().await;
    }

    #[tokio::test]
    async fn test_no_capture_while_syncing() {
        let store = Arc::new(MemoryDocuments::new("/ws"));
        let (n, _) = node("a", store);
        let change = DocumentChange {
            path: "/ws/a.txt".into(),
            changes: vec![crate::edit::ContentChange::from_operation(
                &EditOperation::insert(Position::default(), "x"),
            )],
            source: EditSource::Local,
        };
        let permit = n.guard().try_begin_sync().unwrap();
        for _ in 0..5 {
            assert!(n.capture_local_change(&change).is_none());
        }
        drop(permit);
        assert!(n.capture_local_change(&change).is_some());
        n.stop().await;
    }
}
