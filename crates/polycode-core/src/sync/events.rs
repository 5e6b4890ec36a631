//! Node events and status snapshots
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  NodeEvent: broadcast to every subscriber                       │
//! │  ├── Notification: user-visible info / error text               │
//! │  ├── PeerConnected / PeerDisconnected                           │
//! │  ├── BatchApplied: a remote batch was replayed                  │
//! │  ├── SaveAnnounced: a peer reported a save                      │
//! │  └── SyncStarted / SyncFinished                                 │
//! │                                                                 │
//! │  NodeStatus: point-in-time answer to get_status()               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::peers::PeerSummary;
use crate::types::ClientId;

/// Severity of a user notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Informational
    Info,
    /// Something failed
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoticeLevel::Info => write!(f, "info"),
            NoticeLevel::Error => write!(f, "error"),
        }
    }
}

/// Events emitted by a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Text meant for the user
    Notification {
        /// Severity
        level: NoticeLevel,
        /// Message
        message: String,
    },
    /// A connection opened
    PeerConnected {
        /// Connection index
        index: u64,
        /// Remote transport identity
        remote: String,
    },
    /// A connection closed
    PeerDisconnected {
        /// Connection index
        index: u64,
        /// Remote transport identity
        remote: String,
    },
    /// A remote batch was replayed locally
    BatchApplied {
        /// Resolved document path
        path: PathBuf,
        /// Operations applied
        operations: usize,
        /// Client that captured the batch
        origin: ClientId,
    },
    /// A peer announced a save
    SaveAnnounced {
        /// Announcing client, if known
        by: Option<ClientId>,
        /// Commit message
        commit_message: String,
    },
    /// An external resync began
    SyncStarted,
    /// An external resync ended
    SyncFinished {
        /// Whether every step succeeded
        success: bool,
    },
}

impl NodeEvent {
    /// Informational notification
    pub fn info(message: impl Into<String>) -> Self {
        NodeEvent::Notification {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    /// Error notification
    pub fn error(message: impl Into<String>) -> Self {
        NodeEvent::Notification {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// At least one connection is open
    pub connected: bool,
    /// Open connections
    pub peer_count: usize,
    /// Local client id
    pub local_id: ClientId,
    /// Local transport identity
    pub peer_id: String,
    /// Local display name, if set
    pub display_name: Option<String>,
    /// Whether an external resync is running
    pub sync_in_progress: bool,
    /// One entry per open connection
    pub peers: Vec<PeerSummary>,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} peer(s){}",
            self.display_name.as_deref().unwrap_or(self.local_id.short()),
            if self.connected { "connected" } else { "waiting" },
            self.peer_count,
            if self.sync_in_progress { ", syncing" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_helpers() {
        assert_eq!(
            NodeEvent::info("hi"),
            NodeEvent::Notification {
                level: NoticeLevel::Info,
                message: "hi".into()
            }
        );
        assert!(matches!(
            NodeEvent::error("bad"),
            NodeEvent::Notification {
                level: NoticeLevel::Error,
                ..
            }
        ));
    }

    #[test]
    fn test_status_display() {
        let status = NodeStatus {
            connected: true,
            peer_count: 2,
            local_id: ClientId::from_string("abcdefghijkl"),
            peer_id: "ff".into(),
            display_name: None,
            sync_in_progress: true,
            peers: vec![],
        };
        assert_eq!(status.to_string(), "abcdefgh (connected): 2 peer(s), syncing");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["peerCount"], 2);
        assert_eq!(json["localId"], "abcdefghijkl");
    }
}
