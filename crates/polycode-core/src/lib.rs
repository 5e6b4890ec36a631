//! Polycode Core Library
//!
//! Serverless collaborative editing over a peer overlay.
//!
//! ## Overview
//!
//! Every participant runs a peer. Peers find each other through an iroh-gossip
//! topic, open one direct connection per pair, and flood newline-delimited
//! JSON envelopes across that overlay with a hop budget and duplicate
//! suppression. Local text edits become positional edit batches; remote
//! batches are replayed into the local documents without being echoed back.
//! A "save" announcement makes every other peer pull the shared repository
//! after a short grace period.
//!
//! ## Core Principles
//!
//! - **No server**: peers relay for each other
//! - **At most once**: every envelope is handled once per peer
//! - **No echo**: replayed edits never re-enter the capture path
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use polycode_core::{FsDocuments, NodeBuilder, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let store = Arc::new(FsDocuments::new(&config.workspace));
//!     let node = NodeBuilder::new(config, store).start().await?;
//!
//!     node.set_display_name("ada");
//!     node.ping_peers("hello");
//!     println!("{}", node.get_status());
//!
//!     node.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod edit;
pub mod error;
pub mod guard;
pub mod logging;
pub mod node;
pub mod peers;
pub mod resync;
pub mod sync;
pub mod types;

// Re-exports
pub use config::NodeConfig;
pub use edit::{
    ContentChange, DocumentChange, DocumentStore, EditBatch, EditCapture, EditOperation,
    FsDocuments, MemoryDocuments, MissingDocumentPolicy, Position, PositionalReplay, Range,
    ReplayEngine, ReplayOutcome,
};
pub use error::{CollabError, CollabResult};
pub use guard::{EditSource, FeedbackGuard};
pub use node::{CollabNode, NodeBuilder};
pub use peers::{PeerDirectory, PeerSummary};
pub use resync::{
    CommandStep, ProcessRunner, ResyncCoordinator, ResyncPhase, SequenceReport, StepOutput,
    StepRunner, StepStatus,
};
pub use sync::{
    connect_in_memory, Envelope, GossipRouter, NetTransport, NodeEvent, NodeStatus, NoticeLevel,
    Overlay, OverlayEvent, Payload, RouteDecision,
};
pub use types::*;
