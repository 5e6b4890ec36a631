//! Peer overlay, envelopes and gossip routing
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  net::NetTransport   iroh endpoint + topic rendezvous           │
//! │       │ attaches bi-streams                                     │
//! │       ▼                                                         │
//! │  overlay::Overlay    live connections, broadcast(exclude)       │
//! │       │ OverlayEvent::Line                                      │
//! │       ▼                                                         │
//! │  envelope::Inbound   JSON envelope or legacy plain text         │
//! │       │                                                         │
//! │       ▼                                                         │
//! │  router::GossipRouter  dedup + ttl ──► deliver / relay          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod envelope;
pub mod events;
pub mod net;
pub mod overlay;
pub mod router;

pub use envelope::{
    generate_message_id, Envelope, Inbound, Payload, DEFAULT_TTL, LEGACY_REPLY, LEGACY_TRIGGER,
};
pub use events::{NodeEvent, NodeStatus, NoticeLevel};
pub use net::{NetTransport, OVERLAY_ALPN};
pub use overlay::{connect_in_memory, ConnectionId, ConnectionInfo, Overlay, OverlayEvent};
pub use router::{
    GossipRouter, RouteDecision, SeenMessageCache, DEFAULT_SEEN_RETENTION,
    DEFAULT_SEEN_SWEEP_INTERVAL,
};
