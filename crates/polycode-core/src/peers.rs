//! Peer identity tracking
//!
//! Associates each open overlay connection with the application-level client
//! id and display name of whoever sits on the other end. Identity arrives
//! lazily: from the `hello` sent when a connection opens, and from any later
//! traffic that carries it.
//!
//! Relayed envelopes carry the *origin's* `clientId`, which is not the
//! neighbour on that connection. For those only `forwardedBy` (the relaying
//! neighbour) is recorded.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::sync::envelope::{Envelope, Payload};
use crate::sync::overlay::{ConnectionId, ConnectionInfo};
use crate::types::ClientId;

/// Shown for peers whose identity has not arrived yet
pub const UNKNOWN_PEER: &str = "unknown";

/// Characters of the remote transport identity shown in listings
const REMOTE_PREFIX_LEN: usize = 8;

/// Last-known identity of the peer on one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Client id, once seen
    pub client_id: Option<ClientId>,
    /// Display name, once announced
    pub display_name: Option<String>,
}

/// One row of a peer listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    /// Connection index
    pub index: u64,
    /// Client id or placeholder
    pub client_id: String,
    /// Display name, falling back to client id, then placeholder
    pub display_name: String,
    /// Leading characters of the remote transport identity
    pub remote_prefix: String,
}

/// Identity map keyed by connection
#[derive(Debug, Default)]
pub struct PeerDirectory {
    identities: HashMap<ConnectionId, PeerIdentity>,
}

impl PeerDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whatever identity `envelope` reveals about the peer on `conn`.
    ///
    /// Returns `true` if the stored identity changed.
    pub fn observe(&mut self, conn: ConnectionId, envelope: &Envelope) -> bool {
        let entry = self.identities.entry(conn).or_default();
        let before = entry.clone();

        if let Some(relay) = &envelope.forwarded_by {
            entry.client_id = Some(relay.clone());
        } else {
            if let Some(client_id) = &envelope.client_id {
                entry.client_id = Some(client_id.clone());
            }
            match &envelope.payload {
                Payload::UserNameUpdate { user_name } => {
                    entry.display_name = Some(user_name.clone());
                }
                Payload::Hello {
                    display_name: Some(name),
                } => {
                    entry.display_name = Some(name.clone());
                }
                _ => {}
            }
        }

        let changed = *entry != before;
        if changed {
            debug!(
                %conn,
                client = ?entry.client_id.as_ref().map(|c| c.short().to_string()),
                name = ?entry.display_name,
                "Peer identity updated"
            );
        }
        changed
    }

    /// Drop the identity for a closed connection
    pub fn forget(&mut self, conn: ConnectionId) -> Option<PeerIdentity> {
        self.identities.remove(&conn)
    }

    /// Identity known for a connection
    pub fn identity(&self, conn: ConnectionId) -> Option<&PeerIdentity> {
        self.identities.get(&conn)
    }

    /// Number of connections with a known client id
    pub fn identified_count(&self) -> usize {
        self.identities
            .values()
            .filter(|id| id.client_id.is_some())
            .count()
    }

    /// Best-effort listing for every open connection
    pub fn list(&self, connections: &[ConnectionInfo]) -> Vec<PeerSummary> {
        connections
            .iter()
            .map(|info| {
                let identity = self.identities.get(&info.id);
                let client_id = identity
                    .and_then(|i| i.client_id.as_ref())
                    .map(|c| c.to_string());
                let display_name = identity
                    .and_then(|i| i.display_name.clone())
                    .or_else(|| client_id.clone())
                    .unwrap_or_else(|| UNKNOWN_PEER.to_string());
                PeerSummary {
                    index: info.id.0,
                    client_id: client_id.unwrap_or_else(|| UNKNOWN_PEER.to_string()),
                    display_name,
                    remote_prefix: info.remote.chars().take(REMOTE_PREFIX_LEN).collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(id: u64, remote: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId(id),
            remote: remote.to_string(),
            connected_for: Duration::ZERO,
        }
    }

    fn from(client: &str, payload: Payload) -> Envelope {
        Envelope::new(payload, &ClientId::from_string(client), None, 3)
    }

    #[test]
    fn test_placeholders_before_any_traffic() {
        let dir = PeerDirectory::new();
        let peers = dir.list(&[info(0, "0123456789abcdef")]);
        assert_eq!(
            peers,
            vec![PeerSummary {
                index: 0,
                client_id: UNKNOWN_PEER.into(),
                display_name: UNKNOWN_PEER.into(),
                remote_prefix: "01234567".into(),
            }]
        );
    }

    #[test]
    fn test_direct_envelope_sets_identity() {
        let mut dir = PeerDirectory::new();
        let conn = ConnectionId(1);
        assert!(dir.observe(conn, &from("alice", Payload::Ping { message: String::new() })));
        assert!(!dir.observe(conn, &from("alice", Payload::Ping { message: String::new() })));

        let listed = dir.list(&[info(1, "ffff")]);
        assert_eq!(listed[0].client_id, "alice");
        assert_eq!(listed[0].display_name, "alice");

        dir.observe(
            conn,
            &from(
                "alice",
                Payload::UserNameUpdate {
                    user_name: "Alice".into(),
                },
            ),
        );
        assert_eq!(dir.list(&[info(1, "ffff")])[0].display_name, "Alice");
    }

    #[test]
    fn test_hello_carries_display_name() {
        let mut dir = PeerDirectory::new();
        dir.observe(
            ConnectionId(0),
            &from(
                "bob",
                Payload::Hello {
                    display_name: Some("Bob".into()),
                },
            ),
        );
        let id = dir.identity(ConnectionId(0)).unwrap();
        assert_eq!(id.client_id, Some(ClientId::from_string("bob")));
        assert_eq!(id.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_relayed_envelope_records_neighbour() {
        let mut dir = PeerDirectory::new();
        let conn = ConnectionId(2);
        let original = from(
            "carol",
            Payload::UserNameUpdate {
                user_name: "Carol".into(),
            },
        );
        let relayed = original.forwarded(&ClientId::from_string("bob")).unwrap();
        dir.observe(conn, &relayed);

        let id = dir.identity(conn).unwrap();
        assert_eq!(id.client_id, Some(ClientId::from_string("bob")));
        assert_eq!(id.display_name, None);
    }

    #[test]
    fn test_forget_and_count() {
        let mut dir = PeerDirectory::new();
        dir.observe(ConnectionId(0), &from("a", Payload::Ping { message: String::new() }));
        dir.observe(ConnectionId(1), &from("b", Payload::Ping { message: String::new() }));
        assert_eq!(dir.identified_count(), 2);
        assert!(dir.forget(ConnectionId(0)).is_some());
        assert_eq!(dir.identified_count(), 1);
        assert!(dir.forget(ConnectionId(0)).is_none());
    }
}
